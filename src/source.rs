//! Producers of [`MetricSnapshot`]s on the agent host.

use crate::snapshot::MetricSnapshot;
use std::path::Path;
use sysinfo::{Components, Disks, Networks, System};

/// Something that can sample the host once per collection cycle.
pub trait MetricSource {
    fn collect(&mut self, agent_name: &str) -> MetricSnapshot;
}

impl<F> MetricSource for F
where
    F: FnMut(&str) -> MetricSnapshot,
{
    fn collect(&mut self, agent_name: &str) -> MetricSnapshot {
        self(agent_name)
    }
}

/// Replays the same readings every cycle under the agent's name.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    readings: MetricSnapshot,
}

impl StaticSource {
    pub const fn new(readings: MetricSnapshot) -> Self {
        Self { readings }
    }
}

impl MetricSource for StaticSource {
    fn collect(&mut self, agent_name: &str) -> MetricSnapshot {
        MetricSnapshot {
            agent_name: agent_name.to_string(),
            ..self.readings.clone()
        }
    }
}

/// Samples CPU, memory, swap, root disk and network counters with `sysinfo`.
///
/// Readings the platform cannot provide (battery, fan speed, socket count,
/// disk operation counts) are left unset.
pub struct SystemSource {
    system: System,
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one.
        system.refresh_cpu_all();
        Self { system }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| used as f64 / total as f64 * 100.0)
}

impl MetricSource for SystemSource {
    #[allow(clippy::cast_precision_loss)]
    fn collect(&mut self, agent_name: &str) -> MetricSnapshot {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let mut snapshot = MetricSnapshot::new(agent_name);
        snapshot.cpu_utilization_percent = Some(f64::from(self.system.global_cpu_usage()));

        let cpus = self.system.cpus();
        if !cpus.is_empty() {
            let total: u64 = cpus.iter().map(sysinfo::Cpu::frequency).sum();
            snapshot.cpu_frequency_average = Some(total as f64 / cpus.len() as f64);
        }

        snapshot.cpu_temperature = Components::new_with_refreshed_list()
            .iter()
            .filter_map(sysinfo::Component::temperature)
            .filter(|t| t.is_finite())
            .map(f64::from)
            .reduce(f64::max);

        let used_memory = self.system.used_memory();
        snapshot.memory_usage_bytes = Some(used_memory);
        snapshot.memory_usage_percent = percent(used_memory, self.system.total_memory());

        let used_swap = self.system.used_swap();
        snapshot.swap_usage_bytes = Some(used_swap);
        snapshot.swap_usage_percent = percent(used_swap, self.system.total_swap());

        snapshot.disk_usage_percent = Disks::new_with_refreshed_list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .and_then(|disk| {
                let total = disk.total_space();
                percent(total.saturating_sub(disk.available_space()), total)
            });

        let networks = Networks::new_with_refreshed_list();
        let (sent, received) = networks.iter().fold((0u64, 0u64), |(tx, rx), (_, data)| {
            (
                tx + data.total_packets_transmitted(),
                rx + data.total_packets_received(),
            )
        });
        snapshot.net_packet_sent_count = Some(sent);
        snapshot.net_packet_rcvd_count = Some(received);

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_source_renames_readings() {
        let mut source = StaticSource::new(
            MetricSnapshot::new("template").with_battery_percent(77.0),
        );
        let snapshot = source.collect("host1");
        assert_eq!(snapshot.agent_name, "host1");
        assert_eq!(snapshot.battery_percent, Some(77.0));
    }

    #[test]
    fn test_closure_source() {
        let mut calls = 0;
        let mut source = |name: &str| {
            calls += 1;
            MetricSnapshot::new(name).with_net_connections_number(calls)
        };
        assert_eq!(source.collect("a").net_connections_number, Some(1));
        assert_eq!(source.collect("a").net_connections_number, Some(2));
    }

    #[test]
    fn test_system_source_produces_valid_snapshot() {
        let snapshot = SystemSource::new().collect("host1");
        snapshot.validate().unwrap();
        assert!(snapshot.memory_usage_bytes.is_some());
        assert_eq!(snapshot.battery_percent, None);
    }
}
