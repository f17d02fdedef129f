use mio::Token;
use thiserror::Error;

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error in metrics transport {0}")]
    Io(#[from] std::io::Error),
    #[error("connection refused by {0}")]
    ConnectionRefused(std::net::SocketAddr),
    #[error("connection reset by peer: {0}")]
    ConnectionReset(std::io::Error),
    #[error("peer closed the connection before the exchange completed")]
    PeerClosedEarly,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("socket already registered under {0:?}")]
    DuplicateRegistration(Token),
    #[error("no registration for {0:?}")]
    NotRegistered(Token),
    #[error("multiplexer cancelled")]
    Cancelled,
    #[error("collector still unreachable after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },
    #[error("couldnt serialize snapshot: {0}")]
    Serialization(String),
    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::MalformedPayload(e.to_string())
    }
}

impl TransportError {
    /// Whether this error is confined to a single connection and must not stop the loop.
    pub const fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_)
                | Self::ConnectionReset(_)
                | Self::PeerClosedEarly
                | Self::MalformedPayload(_)
        )
    }
}
