#![warn(clippy::pedantic, clippy::nursery, clippy::cargo, clippy::perf)]

//! # `metrics_tcp_collector`
//!
//! Agents sample their host and ship a [`MetricSnapshot`] to a central
//! collector over TCP; the collector decodes each snapshot and records it
//! through the [`metrics`] facade, labelled with the agent's name.
//!
//! Both sides are single-threaded and non-blocking: a [`Multiplexer`] built on
//! `mio` drives every socket and timer, so one stalled peer never blocks the
//! rest.
//!
//! ```no_run
//! use metrics_tcp_collector::{
//!     AgentConfig, Logger, MetricAgent, MetricSnapshot, MetricsSink, StaticSource, TcpCollector,
//! };
//!
//! let collector = TcpCollector::default().start_collecting(MetricsSink::new()).unwrap();
//!
//! let source = StaticSource::new(MetricSnapshot::default().with_cpu_utilization_percent(42.5));
//! let mut agent = MetricAgent::new(&AgentConfig::new("host1"), source, Logger::global("agent")).unwrap();
//! agent.send_metrics().unwrap();
//!
//! collector.stop().unwrap();
//! ```
//!
//! See README and demos for details.

#[macro_use]
mod logging;

mod agent;
pub mod codec;
mod collector;
mod config;
mod connection;
mod error;
mod poller;
mod snapshot;
mod source;

pub use agent::{AgentManager, JobId, JobOutcome, JobPhase, JobReport, MetricAgent, OutboundJob};
pub use codec::Format;
pub use collector::{CollectorHandle, CollectorServer, MetricSink, MetricsSink, TcpCollector};
pub use config::{AgentConfig, CollectorConfig, DEFAULT_COLLECTOR_ADDRESS, DEFAULT_EXPORTER_PORT};
pub use connection::{ConnectStatus, Connection, ReadStatus, Role};
pub use error::{Result, TransportError};
pub use logging::Logger;
pub use poller::{CancelHandle, Event, Interest, Multiplexer, Pollable, Readiness};
pub use snapshot::{FIELDS, FieldSpec, MetricKind, MetricSnapshot};
pub use source::{MetricSource, StaticSource, SystemSource};
