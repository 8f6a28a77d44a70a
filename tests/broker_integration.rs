// ============================================================================
// BROKER INTEGRATION TESTS - Embedded TLS broker and target resolution
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use assert_matches::assert_matches;
use sengled_tool::mqtt_client::{MqttClient, MqttClientOptions};
use sengled_tool::orchestrator::resolve_mqtt_target;
use sengled_tool::{CompatibilityCategory, EmbeddedBroker, EnvironmentError, MqttMode, SetupConfig};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const MAC: &str = "AA:BB:CC:DD:EE:FF";

fn broker_config(dir: &std::path::Path, broker_port: u16) -> SetupConfig {
    SetupConfig {
        broker_port,
        external_broker: None,
        config_dir: dir.to_path_buf(),
        probe_timeout: Duration::from_millis(200),
        ..SetupConfig::default()
    }
}

#[tokio::test]
async fn listening_port_is_reused_without_starting_a_broker() {
    let dir = tempfile::tempdir().unwrap();
    let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let config = broker_config(dir.path(), port);

    let (target, broker) = resolve_mqtt_target(&config, "192.168.1.10".parse().unwrap()).await.unwrap();

    assert_eq!(target.mode, MqttMode::Existing);
    assert_eq!(target.host, "192.168.1.10");
    assert_eq!(target.port, port);
    assert!(broker.is_none());
    assert!(!config.cert_dir().exists());
}

#[tokio::test]
async fn embedded_broker_reports_port_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut broker = EmbeddedBroker::new(dir.path().join("certs"), port, false, LOOPBACK);
    assert_matches!(broker.start().await, Err(EnvironmentError::PortInUse { .. }));
    assert!(!broker.is_running());
}

#[tokio::test]
async fn certificates_survive_across_brokers() {
    let dir = tempfile::tempdir().unwrap();
    let cert_dir = dir.path().join("certs");

    let first = EmbeddedBroker::new(&cert_dir, 0, false, LOOPBACK);
    let set = first.ensure_certificates().unwrap();
    let original = std::fs::read(&set.server_cert).unwrap();

    let second = EmbeddedBroker::new(&cert_dir, 0, false, LOOPBACK);
    second.ensure_certificates().unwrap();
    assert_eq!(std::fs::read(&set.server_cert).unwrap(), original);

    let forced = EmbeddedBroker::new(&cert_dir, 0, true, LOOPBACK);
    forced.ensure_certificates().unwrap();
    assert_ne!(std::fs::read(&set.server_cert).unwrap(), original);
}

#[tokio::test]
async fn attributes_flow_through_embedded_broker() {
    let dir = tempfile::tempdir().unwrap();
    let mut broker = EmbeddedBroker::new(dir.path().join("certs"), 0, false, LOOPBACK);
    let addr = broker.start().await.expect("broker should start");
    assert!(broker.is_running());

    let options = MqttClientOptions::tls("127.0.0.1", addr.port());
    let mut listener = MqttClient::connect(&options).await.expect("listener connects over TLS");
    let bulb = MqttClient::connect(&options).await.expect("bulb connects over TLS");

    // The subscription may land after the first publishes, so keep reporting
    let reporter = tokio::spawn(async move {
        let payload = r#"[{"type":"typeCode","value":"W31-N11"},{"type":"identifyNO","value":"ESP8266"},{"type":"supportAttributes","value":"0,1,2"}]"#;
        for _ in 0..40 {
            if bulb.publish_raw(&format!("wifielement/{}/status", MAC), payload.to_string()).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bulb.disconnect().await;
    });

    let attributes = listener.listen_for_attributes(MAC, Duration::from_secs(5)).await.unwrap();
    assert!(attributes.is_complete());
    assert_eq!(attributes.type_code(), Some("W31-N11"));
    assert_eq!(sengled_tool::classify(&attributes), CompatibilityCategory::Supported);

    listener.disconnect().await;
    reporter.abort();
    broker.stop().await;
    assert!(!broker.is_running());
}

// Threads whose name starts with the core's thread name (Linux only)
fn core_threads() -> Option<usize> {
    let tasks = std::fs::read_dir("/proc/self/task").ok()?;
    let count = tasks
        .filter_map(Result::ok)
        .filter_map(|task| std::fs::read_to_string(task.path().join("comm")).ok())
        .filter(|name| name.starts_with("mqtt-broker"))
        .count();
    Some(count)
}

#[tokio::test]
async fn restarting_brokers_share_one_core() {
    let dir = tempfile::tempdir().unwrap();
    let mut cores = Vec::new();

    for _ in 0..3 {
        let mut broker = EmbeddedBroker::new(dir.path().join("certs"), 0, false, LOOPBACK);
        let addr = broker.start().await.expect("broker should start");
        cores.push(EmbeddedBroker::core_addr().expect("core is running"));
        broker.stop().await;
        assert!(!broker.is_running());

        // The TLS port is released on stop
        std::net::TcpListener::bind(("0.0.0.0", addr.port())).expect("front port is free again");
    }

    assert!(cores.windows(2).all(|pair| pair[0] == pair[1]));
    if let Some(count) = core_threads() {
        assert_eq!(count, 1);
    }
}
