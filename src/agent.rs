//! Outbound side: delivers snapshots to the collector, one TCP exchange each.
//!
//! Every [`OutboundJob`] walks `Connecting → Writing → AwaitingAck → Done`.
//! A refused connect parks the job in `Retrying` behind a multiplexer timer,
//! so any number of jobs can wait out their backoff without blocking the
//! others.

mod job;

pub use job::{JobId, JobOutcome, JobPhase, JobReport, OutboundJob};

use crate::{
    codec::{self, Format},
    config::AgentConfig,
    connection::{ConnectStatus, Connection, ReadStatus, Role},
    error::{Result, TransportError},
    logging::Logger,
    poller::{CancelHandle, Event, Interest, Multiplexer, Pollable, Readiness},
    snapshot::MetricSnapshot,
    source::MetricSource,
};
use mio::{Token, event::Source, net::TcpStream};
use std::{collections::HashMap, io, net::SocketAddr, time::Duration};

/// Timer used by [`AgentManager::pause`]; job tokens count up from zero.
const PAUSE_TOKEN: Token = Token(usize::MAX - 1);

#[derive(Debug)]
struct OutboundConnection {
    conn: Connection,
    job: OutboundJob,
}

impl Pollable for OutboundConnection {
    fn source(&mut self) -> &mut dyn Source {
        self.conn.source()
    }
}

enum Progress {
    Pending,
    ReadOnly,
    Refused(io::Error),
    Finished(JobOutcome),
}

/// Errors from `connect` that mean the collector cannot be reached right now.
fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
    )
}

pub struct AgentManager {
    collector: SocketAddr,
    format: Format,
    backoff: Duration,
    retry_budget: Option<u32>,
    logger: Logger,
    mux: Multiplexer<OutboundConnection>,
    retrying: HashMap<Token, OutboundJob>,
    finished: Vec<JobReport>,
    next_id: usize,
}

impl AgentManager {
    /// Creates a manager that delivers to `config.collector_address`.
    ///
    /// # Errors
    /// Fails if the multiplexer cannot be created.
    pub fn new(config: &AgentConfig, logger: Logger) -> Result<Self> {
        Ok(Self {
            collector: config.collector_address,
            format: config.format,
            backoff: config.retry_backoff(),
            retry_budget: config.retry_budget,
            logger,
            mux: Multiplexer::new()?,
            retrying: HashMap::new(),
            finished: Vec::new(),
            next_id: 0,
        })
    }

    #[must_use]
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn retry_budget(mut self, budget: Option<u32>) -> Self {
        self.retry_budget = budget;
        self
    }

    #[must_use]
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub const fn collector(&self) -> SocketAddr {
        self.collector
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.mux.cancel_handle()
    }

    /// Connections currently registered with the multiplexer.
    pub fn open_connections(&self) -> usize {
        self.mux.len()
    }

    /// Jobs waiting out their backoff.
    pub fn pending_retries(&self) -> usize {
        self.retrying.len()
    }

    pub fn is_idle(&self) -> bool {
        self.mux.is_empty() && self.retrying.is_empty()
    }

    /// Queues a snapshot and starts connecting.
    ///
    /// # Errors
    /// Encoding failures, or a socket that cannot be created at all.
    pub fn submit(&mut self, snapshot: &MetricSnapshot) -> Result<JobId> {
        let id = JobId(self.next_id);
        self.next_id += 1;
        let job = OutboundJob::new(id, snapshot, self.format)?;
        self.connect(Token(id.0), job)?;
        Ok(id)
    }

    /// Drives every job to completion and returns their reports.
    ///
    /// # Errors
    /// [`TransportError::Cancelled`] after an orderly shutdown, or a fatal
    /// socket error. Reports of finished jobs stay available through
    /// [`Self::take_reports`].
    pub fn run_until_idle(&mut self) -> Result<Vec<JobReport>> {
        while !self.is_idle() {
            let events = self.wait(None)?;
            for event in events {
                self.dispatch(event)?;
            }
        }
        Ok(self.take_reports())
    }

    /// Waits for `duration` while still servicing in-flight jobs.
    ///
    /// # Errors
    /// [`TransportError::Cancelled`] if cancelled during the pause.
    pub fn pause(&mut self, duration: Duration) -> Result<()> {
        self.mux.schedule(PAUSE_TOKEN, duration);
        let mut elapsed = false;
        while !elapsed {
            for event in self.wait(None)? {
                if event == (Event::Timer { token: PAUSE_TOKEN }) {
                    elapsed = true;
                } else {
                    self.dispatch(event)?;
                }
            }
        }
        Ok(())
    }

    pub fn take_reports(&mut self) -> Vec<JobReport> {
        std::mem::take(&mut self.finished)
    }

    /// Unregisters and closes every connection and drops pending retries.
    pub fn shutdown(&mut self) {
        for (_, entry) in self.mux.drain() {
            let OutboundConnection { conn, job } = entry;
            drop(conn);
            self.finished.push(job.into_report(None, JobOutcome::Cancelled));
        }
        for (_, job) in self.retrying.drain() {
            self.finished.push(job.into_report(None, JobOutcome::Cancelled));
        }
        log_info!(self.logger, "agent transport shut down");
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        match self.mux.wait(timeout) {
            Err(TransportError::Cancelled) => {
                self.shutdown();
                Err(TransportError::Cancelled)
            }
            other => other,
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Timer { token } => match self.retrying.remove(&token) {
                Some(job) => self.connect(token, job),
                None => Ok(()),
            },
            Event::Io { token, readiness } => self.service(token, readiness),
        }
    }

    fn connect(&mut self, token: Token, mut job: OutboundJob) -> Result<()> {
        job.attempts += 1;
        job.phase = JobPhase::Connecting;
        job.rewind();
        log_info!(
            self.logger,
            "starting connection {} to {} (attempt {})",
            job.id,
            self.collector,
            job.attempts
        );

        match TcpStream::connect(self.collector) {
            Ok(stream) => {
                let conn = Connection::new(stream, self.collector, Role::AgentOutbound);
                let (id, agent_name, attempts) = (job.id, job.agent_name.clone(), job.attempts);
                let entry = OutboundConnection { conn, job };
                if let Err(e) = self.mux.register(token, entry, Interest::Both) {
                    log_error!(self.logger, "job {id} could not be registered: {e}");
                    self.finished.push(JobReport {
                        id,
                        agent_name,
                        bytes_sent: 0,
                        ack: None,
                        attempts,
                        outcome: JobOutcome::Abandoned(e.to_string()),
                    });
                    return Err(e);
                }
                Ok(())
            }
            Err(e) if is_unreachable(&e) => {
                self.retry_later(token, job, &e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn retry_later(&mut self, token: Token, mut job: OutboundJob, cause: &io::Error) {
        if self.retry_budget.is_some_and(|budget| job.attempts > budget) {
            log_error!(
                self.logger,
                "{}: giving up on job {} after {} attempts: {cause}",
                TransportError::RetryBudgetExhausted {
                    attempts: job.attempts
                },
                job.id,
                job.attempts
            );
            self.finished
                .push(job.into_report(None, JobOutcome::RetryBudgetExhausted));
            return;
        }

        log_warn!(
            self.logger,
            "collector at {} is down ({cause}), retrying in {:?}",
            self.collector,
            self.backoff
        );
        job.phase = JobPhase::Retrying;
        self.mux.schedule(token, self.backoff);
        self.retrying.insert(token, job);
    }

    fn service(&mut self, token: Token, readiness: Readiness) -> Result<()> {
        let Some(entry) = self.mux.get_mut(token) else {
            return Ok(());
        };

        match advance(entry, readiness, &self.logger) {
            Progress::Pending => Ok(()),
            Progress::ReadOnly => self.mux.update(token, Interest::Readable),
            Progress::Refused(e) => {
                if let Some(OutboundConnection { conn, job }) = self.mux.unregister(token) {
                    drop(conn);
                    self.retry_later(token, job, &e);
                }
                Ok(())
            }
            Progress::Finished(outcome) => {
                if let Some(entry) = self.mux.unregister(token) {
                    self.finish(entry, outcome);
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self, entry: OutboundConnection, outcome: JobOutcome) {
        let OutboundConnection { mut conn, job } = entry;
        let received = conn.take_received();
        let peer = conn.peer();
        log_info!(self.logger, "closing connection {} to {peer}", job.id);
        drop(conn);

        let ack = match outcome {
            JobOutcome::Delivered if received.is_empty() => {
                log_warn!(self.logger, "collector closed job {} without an ack", job.id);
                None
            }
            JobOutcome::Delivered => match codec::decode_ack(&received) {
                Ok(ack) => Some(ack),
                Err(e) => {
                    log_warn!(self.logger, "job {}: {e}", job.id);
                    None
                }
            },
            JobOutcome::Abandoned(ref reason) => {
                log_warn!(self.logger, "job {} abandoned: {reason}", job.id);
                None
            }
            JobOutcome::RetryBudgetExhausted | JobOutcome::Cancelled => None,
        };
        if let Some(ack) = ack.filter(|&ack| ack != job.sent) {
            log_warn!(
                self.logger,
                "job {}: collector acked {ack} bytes, {} were sent", job.id, job.sent
            );
        }
        self.finished.push(job.into_report(ack, outcome));
    }
}

fn advance(entry: &mut OutboundConnection, readiness: Readiness, logger: &Logger) -> Progress {
    let OutboundConnection { conn, job } = entry;
    let id = job.id;
    let mut narrowed = false;

    if job.phase == JobPhase::Connecting {
        match conn.connect_status() {
            ConnectStatus::Connected => {
                log_debug!(logger, "job {} connected to {}", job.id, conn.peer());
                job.phase = JobPhase::Writing;
            }
            ConnectStatus::InProgress if readiness.error => {
                return Progress::Refused(io::ErrorKind::ConnectionRefused.into());
            }
            ConnectStatus::InProgress => return Progress::Pending,
            ConnectStatus::Refused(e) => return Progress::Refused(e),
        }
    }

    if job.phase == JobPhase::Writing {
        loop {
            if conn.pending_write() == 0 {
                match job.next_message() {
                    Some(message) => {
                        log_debug!(logger, "sending {} bytes on job {id}", message.len());
                        conn.queue(message);
                    }
                    None => break,
                }
            }
            match conn.flush() {
                Ok(true) => job.sent = conn.bytes_written(),
                Ok(false) => {
                    job.sent = conn.bytes_written();
                    return Progress::Pending;
                }
                Err(e) => return Progress::Finished(JobOutcome::Abandoned(e.to_string())),
            }
        }
        if let Err(e) = conn.shutdown_write() {
            return Progress::Finished(JobOutcome::Abandoned(e.to_string()));
        }
        job.phase = JobPhase::AwaitingAck;
        narrowed = true;
    }

    if job.phase == JobPhase::AwaitingAck {
        match conn.fill() {
            Ok(status) => {
                job.received = conn.bytes_read();
                if status == ReadStatus::Closed || job.received >= job.expected_ack_len() {
                    return Progress::Finished(JobOutcome::Delivered);
                }
            }
            Err(e) => return Progress::Finished(JobOutcome::Abandoned(e.to_string())),
        }
    }

    if narrowed {
        Progress::ReadOnly
    } else {
        Progress::Pending
    }
}

/// Samples a [`MetricSource`] and ships each snapshot through an [`AgentManager`].
pub struct MetricAgent<S> {
    name: String,
    source: S,
    interval: Duration,
    manager: AgentManager,
    logger: Logger,
}

impl<S: MetricSource> MetricAgent<S> {
    /// Builds an agent from its config.
    ///
    /// # Errors
    /// Fails if the transport cannot be created.
    pub fn new(config: &AgentConfig, source: S, logger: Logger) -> Result<Self> {
        Ok(Self {
            name: config.agent_name.clone(),
            source,
            interval: config.collection_interval(),
            manager: AgentManager::new(config, logger.with_target("agent::transport"))?,
            logger,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn manager(&self) -> &AgentManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut AgentManager {
        &mut self.manager
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.manager.cancel_handle()
    }

    /// Collects one snapshot and blocks until its exchange is finished.
    ///
    /// # Errors
    /// [`TransportError::RetryBudgetExhausted`] when the collector stayed
    /// down, [`TransportError::Cancelled`] on shutdown, or a fatal error.
    pub fn send_metrics(&mut self) -> Result<JobReport> {
        let snapshot = self.source.collect(&self.name);
        let id = self.manager.submit(&snapshot)?;
        let report = self
            .manager
            .run_until_idle()?
            .into_iter()
            .find(|report| report.id == id)
            .ok_or(TransportError::Cancelled)?;
        match report.outcome {
            JobOutcome::RetryBudgetExhausted => Err(TransportError::RetryBudgetExhausted {
                attempts: report.attempts,
            }),
            _ => Ok(report),
        }
    }

    /// Sends a snapshot every collection interval until cancelled, or until
    /// `cycles` snapshots have been attempted. Returns how many were delivered.
    ///
    /// # Errors
    /// Only fatal transport errors; cancellation ends the loop normally.
    pub fn run(&mut self, cycles: Option<usize>) -> Result<usize> {
        let mut attempted = 0;
        let mut delivered = 0;
        loop {
            match self.send_metrics() {
                Ok(report) if report.is_delivered() => delivered += 1,
                Ok(_) | Err(TransportError::RetryBudgetExhausted { .. }) => {}
                Err(TransportError::Cancelled) => break,
                Err(e) => return Err(e),
            }
            attempted += 1;
            if cycles.is_some_and(|limit| attempted >= limit) {
                break;
            }
            match self.manager.pause(self.interval) {
                Ok(()) => {}
                Err(TransportError::Cancelled) => break,
                Err(e) => return Err(e),
            }
        }
        log_info!(
            self.logger,
            "agent {} stopping after {delivered} delivered snapshots", self.name
        );
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::testing::CaptureLog;
    use log::Level;
    use std::{
        io::{Read, Write},
        net::{Shutdown, TcpListener},
        thread,
    };

    fn config_for(addr: SocketAddr) -> AgentConfig {
        AgentConfig {
            collector_address: addr,
            ..AgentConfig::new("host1")
        }
    }

    /// Accepts one connection, reads the frame to EOF and acks it.
    fn ack_once(listener: TcpListener) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut frame = Vec::new();
            stream.read_to_end(&mut frame).unwrap();
            stream.write_all(frame.len().to_string().as_bytes()).unwrap();
            stream.shutdown(Shutdown::Both).ok();
            frame
        })
    }

    #[test]
    fn test_job_delivered_and_acked() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ack_once(listener);

        let (logger, _) = CaptureLog::logger();
        let mut manager = AgentManager::new(&config_for(addr), logger).unwrap();
        let snapshot = MetricSnapshot::new("host1").with_cpu_utilization_percent(42.5);
        let id = manager.submit(&snapshot).unwrap();

        let reports = manager.run_until_idle().unwrap();
        let frame = server.join().unwrap();

        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.id, id);
        assert_eq!(report.outcome, JobOutcome::Delivered);
        assert_eq!(report.bytes_sent, frame.len());
        assert_eq!(report.ack, Some(frame.len()));
        assert_eq!(report.attempts, 1);
        assert_eq!(codec::decode(&frame).unwrap(), snapshot);
        assert_eq!(manager.open_connections(), 0);
    }

    #[test]
    fn test_retry_budget_is_reported() {
        // Bind and drop to find a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let (logger, capture) = CaptureLog::logger();
        let mut manager = AgentManager::new(&config_for(addr), logger)
            .unwrap()
            .backoff(Duration::from_millis(10))
            .retry_budget(Some(2));
        manager.submit(&MetricSnapshot::new("host1")).unwrap();

        let reports = manager.run_until_idle().unwrap();
        assert_eq!(reports[0].outcome, JobOutcome::RetryBudgetExhausted);
        assert_eq!(reports[0].attempts, 3);
        assert!(capture.contains(Level::Warn, "is down"));
        assert!(capture.contains(Level::Error, "giving up"));
        assert!(manager.is_idle());
    }

    #[test]
    fn test_ack_mismatch_is_logged_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut frame = Vec::new();
            stream.read_to_end(&mut frame).unwrap();
            stream.write_all(b"1").unwrap();
        });

        let (logger, capture) = CaptureLog::logger();
        let mut manager = AgentManager::new(&config_for(addr), logger).unwrap();
        manager.submit(&MetricSnapshot::new("host1")).unwrap();
        let reports = manager.run_until_idle().unwrap();
        server.join().unwrap();

        assert!(reports[0].is_delivered());
        assert_eq!(reports[0].ack, Some(1));
        assert!(capture.contains(Level::Warn, "acked 1 bytes"));
    }

    #[test]
    fn test_failed_registration_still_reports_job() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (logger, capture) = CaptureLog::logger();
        let mut manager = AgentManager::new(&config_for(addr), logger).unwrap();

        // Occupy the token the first job will ask for.
        let squatter = OutboundConnection {
            conn: Connection::new(
                TcpStream::connect(addr).unwrap(),
                addr,
                Role::AgentOutbound,
            ),
            job: OutboundJob::new(JobId(99), &MetricSnapshot::new("other"), Format::Json)
                .unwrap(),
        };
        manager.mux.register(Token(0), squatter, Interest::Both).unwrap();

        let err = manager.submit(&MetricSnapshot::new("host1")).unwrap_err();
        assert!(matches!(err, TransportError::DuplicateRegistration(Token(0))));

        let reports = manager.take_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].agent_name, "host1");
        assert_eq!(reports[0].attempts, 1);
        assert!(matches!(reports[0].outcome, JobOutcome::Abandoned(_)));
        assert!(capture.contains(Level::Error, "could not be registered"));
    }

    #[test]
    fn test_cancel_during_backoff_drops_pending_jobs() {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let (logger, _) = CaptureLog::logger();
        let mut manager = AgentManager::new(&config_for(addr), logger)
            .unwrap()
            .backoff(Duration::from_secs(60));
        manager.submit(&MetricSnapshot::new("host1")).unwrap();

        let handle = manager.cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        assert!(matches!(
            manager.run_until_idle(),
            Err(TransportError::Cancelled)
        ));
        canceller.join().unwrap();
        assert!(manager.is_idle());
        let reports = manager.take_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, JobOutcome::Cancelled);
    }
}
