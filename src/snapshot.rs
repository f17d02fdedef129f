use crate::error::{Result, TransportError};
use metrics::Unit;
use serde::{Deserialize, Serialize};

/// How a snapshot field is exported by the collector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Histogram,
}

/// One reading set from a single agent.
///
/// Every sensor value is optional: a host without a battery simply leaves
/// `battery_percent` unset and the key is omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_utilization_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_frequency_average: Option<f64>,
    #[serde(
        default,
        alias = "extract_cpu_temperature",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpu_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_fan_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_usage_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_read_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_write_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_packet_sent_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_packet_rcvd_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_connections_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f64>,
}

macro_rules! setters {
    ($($setter:ident => $field:ident: $ty:ty),+ $(,)?) => {
        $(
            #[must_use]
            pub fn $setter(mut self, value: $ty) -> Self {
                self.$field = Some(value);
                self
            }
        )+
    };
}

impl MetricSnapshot {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            ..Self::default()
        }
    }

    setters! {
        with_cpu_utilization_percent => cpu_utilization_percent: f64,
        with_cpu_frequency_average => cpu_frequency_average: f64,
        with_cpu_temperature => cpu_temperature: f64,
        with_cpu_fan_speed => cpu_fan_speed: f64,
        with_memory_usage_percent => memory_usage_percent: f64,
        with_memory_usage_bytes => memory_usage_bytes: u64,
        with_swap_usage_percent => swap_usage_percent: f64,
        with_swap_usage_bytes => swap_usage_bytes: u64,
        with_disk_usage_percent => disk_usage_percent: f64,
        with_disk_read_count => disk_read_count: u64,
        with_disk_write_count => disk_write_count: u64,
        with_net_packet_sent_count => net_packet_sent_count: u64,
        with_net_packet_rcvd_count => net_packet_rcvd_count: u64,
        with_net_connections_number => net_connections_number: u64,
        with_battery_percent => battery_percent: f64,
    }

    /// Checks the invariants every snapshot on the wire must hold.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidSnapshot`] when `agent_name` is blank or
    /// a reading is NaN or infinite.
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.trim().is_empty() {
            return Err(TransportError::InvalidSnapshot(
                "agent_name must not be empty".into(),
            ));
        }
        for field in FIELDS {
            let Some(value) = (field.value)(self) else {
                continue;
            };
            if !value.is_finite() {
                return Err(TransportError::InvalidSnapshot(format!(
                    "{} is not finite: {value}",
                    field.key
                )));
            }
        }
        Ok(())
    }

    /// Iterates the fields present in this snapshot as `(field, value)` pairs.
    pub fn observations(&self) -> impl Iterator<Item = (&'static FieldSpec, f64)> + '_ {
        FIELDS
            .iter()
            .filter_map(move |field| (field.value)(self).map(|v| (field, v)))
    }
}

/// Declarative description of one optional snapshot field.
#[derive(Debug)]
pub struct FieldSpec {
    /// Key used in the encoded payload.
    pub key: &'static str,
    /// Name of the exported instrument.
    pub metric: &'static str,
    pub kind: MetricKind,
    pub unit: Option<Unit>,
    pub description: &'static str,
    pub value: fn(&MetricSnapshot) -> Option<f64>,
}

#[allow(clippy::cast_precision_loss)]
const fn count(value: Option<u64>) -> Option<f64> {
    match value {
        Some(v) => Some(v as f64),
        None => None,
    }
}

pub static FIELDS: &[FieldSpec] = &[
    FieldSpec {
        key: "cpu_utilization_percent",
        metric: "cpu_utilization_percent",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Percent),
        description: "current CPU utilization",
        value: |s| s.cpu_utilization_percent,
    },
    FieldSpec {
        key: "cpu_frequency_average",
        metric: "cpu_frequency_average",
        kind: MetricKind::Histogram,
        unit: None,
        description: "current average of CPU frequency of all cores",
        value: |s| s.cpu_frequency_average,
    },
    FieldSpec {
        key: "cpu_temperature",
        metric: "cpu_temperature",
        kind: MetricKind::Histogram,
        unit: None,
        description: "current temperature of the CPU",
        value: |s| s.cpu_temperature,
    },
    FieldSpec {
        key: "cpu_fan_speed",
        metric: "cpu_fan_speed",
        kind: MetricKind::Histogram,
        unit: None,
        description: "current CPU fan speed in RPM",
        value: |s| s.cpu_fan_speed,
    },
    FieldSpec {
        key: "memory_usage_percent",
        metric: "memory_usage_percent",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Percent),
        description: "current memory usage",
        value: |s| s.memory_usage_percent,
    },
    FieldSpec {
        key: "memory_usage_bytes",
        metric: "memory_usage_bytes",
        kind: MetricKind::Histogram,
        unit: Some(Unit::Bytes),
        description: "current used memory bytes",
        value: |s| count(s.memory_usage_bytes),
    },
    FieldSpec {
        key: "swap_usage_percent",
        metric: "swap_usage_percent",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Percent),
        description: "current swap usage",
        value: |s| s.swap_usage_percent,
    },
    FieldSpec {
        key: "swap_usage_bytes",
        metric: "swap_usage_bytes",
        kind: MetricKind::Histogram,
        unit: Some(Unit::Bytes),
        description: "current used swap bytes",
        value: |s| count(s.swap_usage_bytes),
    },
    FieldSpec {
        key: "disk_usage_percent",
        metric: "disk_usage_percent",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Percent),
        description: "current usage of the root filesystem",
        value: |s| s.disk_usage_percent,
    },
    FieldSpec {
        key: "disk_read_count",
        metric: "disk_read",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Count),
        description: "current number of disk reads",
        value: |s| count(s.disk_read_count),
    },
    FieldSpec {
        key: "disk_write_count",
        metric: "disk_write",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Count),
        description: "current number of disk writes",
        value: |s| count(s.disk_write_count),
    },
    FieldSpec {
        key: "net_packet_sent_count",
        metric: "net_packet_sent",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Count),
        description: "current number of sent packets",
        value: |s| count(s.net_packet_sent_count),
    },
    FieldSpec {
        key: "net_packet_rcvd_count",
        metric: "net_packet_rcvd",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Count),
        description: "current number of received packets",
        value: |s| count(s.net_packet_rcvd_count),
    },
    FieldSpec {
        key: "net_connections_number",
        metric: "net_connections",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Count),
        description: "current number of net connections of inet protocol",
        value: |s| count(s.net_connections_number),
    },
    FieldSpec {
        key: "battery_percent",
        metric: "battery_percent",
        kind: MetricKind::Gauge,
        unit: Some(Unit::Percent),
        description: "current percentage of battery power",
        value: |s| s.battery_percent,
    },
];
