//! This demo runs a TcpCollector and exposes every snapshot it receives through the Prometheus exporter.
//!
//! Agents connect to `127.0.0.1:9999` (or the address in an optional TOML config passed as the first
//! argument) and the metrics are available on `0.0.0.0:8000` for scraping. Ctrl+C cancels the
//! collector, which closes every open connection before exiting.

use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_tcp_collector::{CollectorConfig, MetricsSink, TcpCollector};
use std::net::{Ipv4Addr, SocketAddr};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => CollectorConfig::load(path).expect("Failed to load collector config"),
        None => CollectorConfig::default(),
    };

    // Set up the Prometheus exporter.
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.exporter_port)))
        .install()
        .expect("Failed to install Prometheus recorder");

    let handle = match TcpCollector::from_config(&config).start_collecting(MetricsSink::new()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start metrics collector: {e}");
            return;
        }
    };

    // Handle Ctrl+C to exit gracefully.
    let cancel = handle.cancel_handle();
    ctrlc::set_handler(move || cancel.cancel()).expect("Error setting Ctrl-C handler");

    println!(
        "Collector is listening on {}. Press Ctrl+C to exit.",
        handle.local_addr()
    );

    if let Err(e) = handle.join() {
        eprintln!("Collector stopped with an error: {e}");
    }
    println!("Shutting down metrics collector.");
}
