//! Inbound side: accepts agent connections and decodes their snapshots.
//!
//! One thread runs the whole collector. The listening socket and every
//! accepted connection sit in the same [`Multiplexer`]; each connection runs
//! `Reading → Acking → closed` on its own, so a stalled agent never holds
//! back the others.

mod sink;

pub use sink::{MetricSink, MetricsSink};

use crate::{
    codec::{self, HEADER_LEN},
    config::CollectorConfig,
    connection::{Connection, ReadStatus, Role},
    error::{Result, TransportError},
    logging::Logger,
    poller::{CancelHandle, Event, Interest, Multiplexer, Pollable},
};
use mio::{
    Token,
    event::Source,
    net::{TcpListener, TcpStream},
};
use std::{io, net::SocketAddr, thread, time::Duration};

const LISTENER: Token = Token(0);

/// Delay before accepting again after the listener hit a hard error.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundPhase {
    Reading,
    Acking,
}

#[derive(Debug)]
struct InboundConnection {
    conn: Connection,
    phase: InboundPhase,
}

#[derive(Debug)]
enum Slot {
    Listener(TcpListener),
    Inbound(InboundConnection),
}

impl Pollable for Slot {
    fn source(&mut self) -> &mut dyn Source {
        match self {
            Self::Listener(listener) => listener,
            Self::Inbound(inbound) => inbound.conn.source(),
        }
    }
}

enum InboundProgress {
    Pending,
    Acked,
    /// Peer closed without sending anything.
    Empty,
    Failed(String),
}

/// Builder for a TCP snapshot collector.
pub struct TcpCollector {
    address: SocketAddr,
    max_frame_len: usize,
    exchange_timeout: Option<Duration>,
    logger: Logger,
}

impl Default for TcpCollector {
    fn default() -> Self {
        Self::from_config(&CollectorConfig::default())
    }
}

impl TcpCollector {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            address: config.address,
            max_frame_len: config.max_frame_len,
            exchange_timeout: None,
            logger: Logger::global("metrics_tcp_collector::collector"),
        }
    }

    /// Sets the address to listen on; port 0 picks a free port.
    #[must_use]
    pub const fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub const fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Closes connections that have not finished their exchange in time.
    /// Unset by default: an accepted connection may wait forever.
    #[must_use]
    pub const fn exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    #[must_use]
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Binds the listening socket without starting the loop.
    ///
    /// # Errors
    /// Fails if the socket cannot be bound or registered.
    pub fn bind<S: MetricSink>(self, sink: S) -> Result<CollectorServer<S>> {
        let listener = TcpListener::bind(self.address)?;
        let local_addr = listener.local_addr()?;
        let mut mux = Multiplexer::new()?;
        mux.register(LISTENER, Slot::Listener(listener), Interest::Readable)?;
        log_info!(self.logger, "listen on {local_addr}");

        Ok(CollectorServer {
            mux,
            local_addr,
            max_frame_len: self.max_frame_len,
            exchange_timeout: self.exchange_timeout,
            sink,
            logger: self.logger,
            next_token: LISTENER.0 + 1,
            delivered: 0,
        })
    }

    /// Binds the collector and runs it on a background thread.
    /// Snapshots are handed to `sink` as they are decoded.
    ///
    /// # Example
    /// ```no_run
    /// use metrics_tcp_collector::{MetricsSink, TcpCollector};
    /// let handle = TcpCollector::default().start_collecting(MetricsSink::new()).unwrap();
    /// println!("collecting on {}", handle.local_addr());
    /// handle.stop().unwrap();
    /// ```
    ///
    /// # Errors
    /// Fails if the socket cannot be bound; errors of the running loop are
    /// logged and returned from [`CollectorHandle::join`].
    pub fn start_collecting<S>(self, sink: S) -> Result<CollectorHandle>
    where
        S: MetricSink + Send + 'static,
    {
        let mut server = self.bind(sink)?;
        let local_addr = server.local_addr();
        let cancel = server.cancel_handle();
        let thread = thread::spawn(move || {
            let result = server.run();
            if let Err(e) = &result {
                log_error!(server.logger, "Metrics collector error: {e}");
            }
            result
        });
        Ok(CollectorHandle {
            local_addr,
            cancel,
            thread,
        })
    }
}

/// Handle to a collector running on its own thread.
#[derive(Debug)]
pub struct CollectorHandle {
    local_addr: SocketAddr,
    cancel: CancelHandle,
    thread: thread::JoinHandle<Result<()>>,
}

impl CollectorHandle {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits for the collector thread to finish.
    ///
    /// # Errors
    /// The loop's own error, or an IO error if the thread panicked.
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| io::Error::other("collector thread panicked"))?
    }

    /// Cancels the loop and waits for its orderly shutdown.
    ///
    /// # Errors
    /// See [`Self::join`].
    pub fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.join()
    }
}

pub struct CollectorServer<S> {
    mux: Multiplexer<Slot>,
    local_addr: SocketAddr,
    max_frame_len: usize,
    exchange_timeout: Option<Duration>,
    sink: S,
    logger: Logger,
    next_token: usize,
    delivered: u64,
}

impl<S: MetricSink> CollectorServer<S> {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.mux.cancel_handle()
    }

    pub const fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Accepted connections still in the middle of an exchange.
    pub fn open_connections(&self) -> usize {
        self.mux.len() - usize::from(self.mux.contains(LISTENER))
    }

    /// Every socket registered with the multiplexer, listener included.
    pub fn registered_sockets(&self) -> usize {
        self.mux.len()
    }

    /// Snapshots decoded and forwarded to the sink so far.
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Runs until cancelled, then closes every socket.
    ///
    /// # Errors
    /// Fatal multiplexer errors; per-connection failures are only logged.
    pub fn run(&mut self) -> Result<()> {
        let result = loop {
            match self.poll_once(None) {
                Ok(_) => {}
                Err(TransportError::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    /// Services one round of readiness events. Returns how many were handled.
    ///
    /// # Errors
    /// [`TransportError::Cancelled`] once cancelled, or fatal errors.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let events = self.mux.wait(timeout)?;
        let count = events.len();
        for event in events {
            self.dispatch(event)?;
        }
        Ok(count)
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Io { token: LISTENER, .. } | Event::Timer { token: LISTENER } => {
                self.accept_all()?;
            }
            Event::Io { token, .. } => self.service(token),
            Event::Timer { token } => self.expire(token),
        }
        Ok(())
    }

    /// Unregisters and closes the listener and every open connection.
    pub fn shutdown(&mut self) {
        let drained = self.mux.drain();
        let open = drained
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Inbound(_)))
            .count();
        drop(drained);
        log_info!(
            self.logger,
            "collector on {} shut down, closed {open} open connections", self.local_addr
        );
    }

    fn accept_all(&mut self) -> Result<()> {
        loop {
            let Some(Slot::Listener(listener)) = self.mux.get_mut(LISTENER) else {
                return Ok(());
            };
            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(e) => {
                    // Queued peers get no new edge; poll the listener again later.
                    log_warn!(
                        self.logger,
                        "Failed to accept connection: {e}, retrying in {ACCEPT_RETRY:?}"
                    );
                    self.mux.schedule(LISTENER, ACCEPT_RETRY);
                    return Ok(());
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        log_info!(self.logger, "Accepted connection from {peer}");
        metrics::counter!("snapshot_collector_connections_total").increment(1);

        let inbound = InboundConnection {
            conn: Connection::new(stream, peer, Role::CollectorInbound),
            phase: InboundPhase::Reading,
        };
        self.mux.register(token, Slot::Inbound(inbound), Interest::Both)?;
        if let Some(timeout) = self.exchange_timeout {
            self.mux.schedule(token, timeout);
        }
        Ok(())
    }

    fn service(&mut self, token: Token) {
        let Some(Slot::Inbound(inbound)) = self.mux.get_mut(token) else {
            return;
        };
        match advance(inbound, self.max_frame_len) {
            InboundProgress::Pending => {}
            InboundProgress::Acked => self.complete(token),
            InboundProgress::Empty => {
                if let Some(Slot::Inbound(inbound)) = self.close(token) {
                    log_debug!(
                        self.logger,
                        "{} closed without sending a snapshot",
                        inbound.conn.peer()
                    );
                }
            }
            InboundProgress::Failed(reason) => {
                if let Some(Slot::Inbound(inbound)) = self.close(token) {
                    log_warn!(
                        self.logger,
                        "Closing current socket {}: {reason}",
                        inbound.conn.peer()
                    );
                }
            }
        }
    }

    fn expire(&mut self, token: Token) {
        if let Some(Slot::Inbound(inbound)) = self.close(token) {
            log_warn!(
                self.logger,
                "Closing current socket {}: exchange timed out in {:?}",
                inbound.conn.peer(),
                inbound.phase
            );
        }
    }

    fn close(&mut self, token: Token) -> Option<Slot> {
        self.mux.cancel_timer(token);
        self.mux.unregister(token)
    }

    /// Closes an acked connection, then decodes what it delivered.
    fn complete(&mut self, token: Token) {
        let Some(Slot::Inbound(mut inbound)) = self.close(token) else {
            return;
        };
        let peer = inbound.conn.peer();
        let bytes = inbound.conn.take_received();
        drop(inbound);
        log_info!(self.logger, "Acked {} bytes from {peer}, connection closed", bytes.len());

        match codec::decode_with_limit(&bytes, self.max_frame_len) {
            Ok(snapshot) => {
                log_debug!(
                    self.logger,
                    "snapshot from agent {} ({peer})", snapshot.agent_name
                );
                metrics::counter!("snapshot_collector_frames_total", "outcome" => "decoded")
                    .increment(1);
                self.delivered += 1;
                self.sink.record(&snapshot);
            }
            Err(e) => {
                metrics::counter!("snapshot_collector_frames_total", "outcome" => "malformed")
                    .increment(1);
                log_warn!(self.logger, "Dropping payload from {peer}: {e}");
            }
        }
    }
}

fn advance(inbound: &mut InboundConnection, max_frame_len: usize) -> InboundProgress {
    let conn = &mut inbound.conn;

    if inbound.phase == InboundPhase::Reading {
        let status = match conn.fill() {
            Ok(status) => status,
            Err(e) => return InboundProgress::Failed(e.to_string()),
        };
        let buffered = conn.received();
        let expected = codec::frame_len(buffered);
        if let Some(total) = expected.filter(|total| total - HEADER_LEN > max_frame_len) {
            return InboundProgress::Failed(format!(
                "frame of {} bytes exceeds limit of {max_frame_len}",
                total - HEADER_LEN
            ));
        }
        let complete = expected.is_some_and(|total| buffered.len() >= total);
        if !complete && status == ReadStatus::Open {
            return InboundProgress::Pending;
        }
        if buffered.is_empty() {
            return InboundProgress::Empty;
        }
        conn.queue(&codec::encode_ack(conn.bytes_read()));
        inbound.phase = InboundPhase::Acking;
    }

    match conn.flush() {
        Ok(true) => InboundProgress::Acked,
        Ok(false) => InboundProgress::Pending,
        Err(e) => InboundProgress::Failed(e.to_string()),
    }
}
