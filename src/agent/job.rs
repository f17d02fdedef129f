use crate::{
    codec::{self, Format},
    error::Result,
    snapshot::MetricSnapshot,
};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Connecting,
    Retrying,
    Writing,
    AwaitingAck,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The collector read the snapshot and closed the exchange.
    Delivered,
    /// The connection broke mid-exchange; the snapshot is dropped.
    Abandoned(String),
    /// The collector stayed unreachable for the whole retry budget.
    RetryBudgetExhausted,
    /// The agent shut down before the exchange finished.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: JobId,
    pub agent_name: String,
    pub bytes_sent: usize,
    /// Byte count echoed by the collector, when it sent a readable one.
    pub ack: Option<usize>,
    pub attempts: u32,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn is_delivered(&self) -> bool {
        self.outcome == JobOutcome::Delivered
    }
}

/// One snapshot on its way to the collector.
#[derive(Debug)]
pub struct OutboundJob {
    pub(crate) id: JobId,
    pub(crate) agent_name: String,
    messages: Vec<Vec<u8>>,
    next_message: usize,
    pub(crate) sent: usize,
    pub(crate) received: usize,
    pub(crate) attempts: u32,
    pub(crate) phase: JobPhase,
}

impl OutboundJob {
    /// Encodes `snapshot` into the job's message queue.
    ///
    /// # Errors
    /// Propagates encoding failures from [`codec::encode`].
    pub fn new(id: JobId, snapshot: &MetricSnapshot, format: Format) -> Result<Self> {
        Ok(Self {
            id,
            agent_name: snapshot.agent_name.clone(),
            messages: vec![codec::encode(snapshot, format)?],
            next_message: 0,
            sent: 0,
            received: 0,
            attempts: 0,
            phase: JobPhase::Connecting,
        })
    }

    pub const fn id(&self) -> JobId {
        self.id
    }

    pub const fn phase(&self) -> JobPhase {
        self.phase
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Bytes this job puts on the wire in one exchange.
    pub fn total_len(&self) -> usize {
        self.messages.iter().map(Vec::len).sum()
    }

    /// Length of the ack the collector sends back for a complete exchange.
    pub fn expected_ack_len(&self) -> usize {
        codec::ack_len(self.total_len())
    }

    pub(crate) fn next_message(&mut self) -> Option<&[u8]> {
        let message = self.messages.get(self.next_message)?;
        self.next_message += 1;
        Some(message)
    }

    /// Rewinds the exchange so a fresh connection starts from the first message.
    pub(crate) fn rewind(&mut self) {
        self.next_message = 0;
        self.sent = 0;
        self.received = 0;
    }

    pub(crate) fn into_report(mut self, ack: Option<usize>, outcome: JobOutcome) -> JobReport {
        self.phase = JobPhase::Done;
        JobReport {
            id: self.id,
            agent_name: self.agent_name,
            bytes_sent: self.sent,
            ack,
            attempts: self.attempts,
            outcome,
        }
    }
}
