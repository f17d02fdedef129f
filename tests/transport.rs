use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_tcp_collector::{
    AgentConfig, CollectorServer, Format, JobOutcome, Logger, MetricAgent, MetricSink,
    MetricSnapshot, MetricsSink, StaticSource, TcpCollector, codec,
};
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::Duration,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn collector() -> TcpCollector {
    TcpCollector::default()
        .address(loopback())
        .logger(Logger::global("collector"))
}

fn agent(addr: SocketAddr, name: &str, format: Format) -> MetricAgent<StaticSource> {
    let config = AgentConfig {
        collector_address: addr,
        retry_backoff_ms: 50,
        format,
        ..AgentConfig::new(name)
    };
    let readings = MetricSnapshot::default()
        .with_cpu_utilization_percent(42.5)
        .with_memory_usage_bytes(2048);
    MetricAgent::new(&config, StaticSource::new(readings), Logger::global("agent")).unwrap()
}

fn pump_until<S>(server: &mut CollectorServer<S>, done: impl Fn(&CollectorServer<S>) -> bool)
where
    S: MetricSink,
{
    for _ in 0..250 {
        if done(server) {
            return;
        }
        server.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    panic!("collector did not reach the expected state");
}

#[test]
fn test_agent_delivers_snapshot_end_to_end() {
    let (tx, rx) = mpsc::channel();
    let handle = collector().start_collecting(tx).unwrap();

    let mut agent = agent(handle.local_addr(), "host1", Format::Json);
    let report = agent.send_metrics().unwrap();

    let snapshot = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(snapshot.agent_name, "host1");
    assert_eq!(snapshot.cpu_utilization_percent, Some(42.5));
    assert_eq!(snapshot.memory_usage_bytes, Some(2048));
    assert_eq!(snapshot.battery_percent, None);
    assert!(
        rx.recv_timeout(QUIET_PERIOD).is_err(),
        "one exchange must reach the sink once"
    );

    assert_eq!(report.outcome, JobOutcome::Delivered);
    assert_eq!(report.ack, Some(report.bytes_sent));
    assert_eq!(report.attempts, 1);
    handle.stop().unwrap();
}

#[test]
fn test_delivered_snapshot_is_exported_with_agent_label() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let mut server = collector().bind(MetricsSink::new()).unwrap();
    let addr = server.local_addr();

    let sender = thread::spawn(move || agent(addr, "host1", Format::Json).send_metrics());
    metrics::with_local_recorder(&recorder, || {
        pump_until(&mut server, |s| s.delivered() == 1);
    });
    assert!(sender.join().unwrap().unwrap().is_delivered());

    let rendered = handle.render();
    for line in [
        r#"cpu_utilization_percent{agent_name="host1"} 42.5"#,
        r#"memory_usage_bytes_count{agent_name="host1"} 1"#,
        r#"snapshot_collector_frames_total{outcome="decoded"} 1"#,
    ] {
        assert!(rendered.contains(line), "missing {line} in:\n{rendered}");
    }
}

#[test]
fn test_message_pack_frames_are_accepted() {
    let (tx, rx) = mpsc::channel();
    let handle = collector().start_collecting(tx).unwrap();

    let mut agent = agent(handle.local_addr(), "packed", Format::MessagePack);
    assert!(agent.send_metrics().unwrap().is_delivered());
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().agent_name, "packed");
    handle.stop().unwrap();
}

#[test]
fn test_raw_client_receives_byte_count() {
    let (tx, rx) = mpsc::channel();
    let handle = collector().start_collecting(tx).unwrap();

    let frame = codec::encode(
        &MetricSnapshot::new("raw").with_battery_percent(80.0),
        Format::Json,
    )
    .unwrap();
    let mut client = TcpStream::connect(handle.local_addr()).unwrap();
    client.write_all(&frame).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut ack = String::new();
    client.read_to_string(&mut ack).unwrap();
    assert_eq!(ack, frame.len().to_string());
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).unwrap().battery_percent,
        Some(80.0)
    );
    handle.stop().unwrap();
}

#[test]
fn test_agent_retries_until_collector_starts() {
    let addr = TcpListener::bind(loopback()).unwrap().local_addr().unwrap();

    let sender = thread::spawn(move || agent(addr, "late", Format::Json).send_metrics());
    thread::sleep(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    let handle = collector().address(addr).start_collecting(tx).unwrap();

    let report = sender.join().unwrap().unwrap();
    assert!(report.is_delivered());
    assert!(report.attempts > 1, "expected retries, got {report:?}");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().agent_name, "late");
    handle.stop().unwrap();
}

#[test]
fn test_stalled_connection_does_not_block_others() {
    let mut server = collector().bind(Vec::new()).unwrap();
    let addr = server.local_addr();

    // Half a header, then nothing.
    let mut stalled = TcpStream::connect(addr).unwrap();
    stalled.write_all(b"J\0").unwrap();
    pump_until(&mut server, |s| s.open_connections() == 1);

    let frame = codec::encode(&MetricSnapshot::new("b"), Format::Json).unwrap();
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&frame).unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    pump_until(&mut server, |s| s.delivered() == 1);

    let mut ack = String::new();
    client.read_to_string(&mut ack).unwrap();
    assert_eq!(ack, frame.len().to_string());
    assert_eq!(server.sink()[0].agent_name, "b");
    assert_eq!(server.open_connections(), 1);
}

#[test]
fn test_cancel_mid_exchange_closes_everything() {
    let mut server = collector().bind(Vec::new()).unwrap();
    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(b"J\0\0").unwrap();
    pump_until(&mut server, |s| s.open_connections() == 1);

    server.cancel_handle().cancel();
    server.run().unwrap();
    assert_eq!(server.registered_sockets(), 0);
    assert!(server.sink().is_empty());

    client.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    let mut buf = [0u8; 8];
    match client.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
    }
}

#[test]
fn test_malformed_payload_does_not_stop_collector() {
    let (tx, rx) = mpsc::channel();
    let handle = collector().start_collecting(tx).unwrap();

    let mut garbage = TcpStream::connect(handle.local_addr()).unwrap();
    garbage.write_all(b"M\0\0\0\x03\xc1\xc1\xc1").unwrap();
    garbage.shutdown(Shutdown::Write).unwrap();
    let mut ack = String::new();
    garbage.read_to_string(&mut ack).unwrap();
    assert_eq!(ack, "8");

    let mut agent = agent(handle.local_addr(), "after", Format::Json);
    assert!(agent.send_metrics().unwrap().is_delivered());
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().agent_name, "after");
    handle.stop().unwrap();
}
