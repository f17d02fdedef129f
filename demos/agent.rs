//! This demo samples the local host with SystemSource and ships a snapshot to the collector every
//! collection interval.
//!
//! Pass an agent name, or a TOML config path ending in `.toml`, as the first argument. Run the
//! `collector` demo first; while it is down the agent keeps retrying with a fixed backoff. Ctrl+C
//! cancels any pending exchange and exits.

use metrics_tcp_collector::{AgentConfig, Logger, MetricAgent, SystemSource};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(arg) if arg.ends_with(".toml") => {
            AgentConfig::load(arg).expect("Failed to load agent config")
        }
        Some(name) => AgentConfig::new(name),
        None => AgentConfig::new("agent-1"),
    };

    let mut agent = match MetricAgent::new(&config, SystemSource::new(), Logger::global("agent")) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("Failed to set up metrics agent: {e}");
            return;
        }
    };

    // Handle Ctrl+C to exit gracefully.
    let cancel = agent.cancel_handle();
    ctrlc::set_handler(move || cancel.cancel()).expect("Error setting Ctrl-C handler");

    println!(
        "Agent {} reports to {} every {:?}. Press Ctrl+C to exit.",
        agent.name(),
        config.collector_address,
        config.collection_interval()
    );

    match agent.run(None) {
        Ok(delivered) => println!("Delivered {delivered} snapshots."),
        Err(e) => eprintln!("Agent stopped with an error: {e}"),
    }
}
