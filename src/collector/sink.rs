use crate::snapshot::{FIELDS, MetricKind, MetricSnapshot};
use std::sync::mpsc;

/// Receives every snapshot the collector decodes.
pub trait MetricSink {
    fn record(&mut self, snapshot: &MetricSnapshot);
}

impl<S: MetricSink + ?Sized> MetricSink for Box<S> {
    fn record(&mut self, snapshot: &MetricSnapshot) {
        (**self).record(snapshot);
    }
}

impl MetricSink for Vec<MetricSnapshot> {
    fn record(&mut self, snapshot: &MetricSnapshot) {
        self.push(snapshot.clone());
    }
}

impl MetricSink for mpsc::Sender<MetricSnapshot> {
    fn record(&mut self, snapshot: &MetricSnapshot) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(snapshot.clone());
    }
}

/// Forwards snapshots to the `metrics` facade, labelled by `agent_name`.
///
/// Install an exporter (e.g. `metrics-exporter-prometheus`) to serve them.
/// Fields missing from a snapshot are not recorded, so the exporter keeps
/// the previous observation instead of reporting a zero.
#[derive(Debug, Default)]
pub struct MetricsSink {
    described: bool,
}

impl MetricsSink {
    pub const fn new() -> Self {
        Self { described: false }
    }

    fn describe(&mut self) {
        if self.described {
            return;
        }
        self.described = true;
        for field in FIELDS {
            match (field.kind, field.unit) {
                (MetricKind::Gauge, Some(unit)) => {
                    metrics::describe_gauge!(field.metric, unit, field.description);
                }
                (MetricKind::Gauge, None) => {
                    metrics::describe_gauge!(field.metric, field.description);
                }
                (MetricKind::Histogram, Some(unit)) => {
                    metrics::describe_histogram!(field.metric, unit, field.description);
                }
                (MetricKind::Histogram, None) => {
                    metrics::describe_histogram!(field.metric, field.description);
                }
            }
        }
    }
}

impl MetricSink for MetricsSink {
    fn record(&mut self, snapshot: &MetricSnapshot) {
        self.describe();
        for (field, value) in snapshot.observations() {
            let agent = snapshot.agent_name.clone();
            match field.kind {
                MetricKind::Gauge => metrics::gauge!(field.metric, "agent_name" => agent).set(value),
                MetricKind::Histogram => {
                    metrics::histogram!(field.metric, "agent_name" => agent).record(value);
                }
            }
        }
    }
}
