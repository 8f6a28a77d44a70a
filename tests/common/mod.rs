// ============================================================================
// TEST UTILITIES - Common helpers for integration tests
// ============================================================================

#![allow(dead_code)]

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use sengled_tool::config::{ExternalBroker, NetworkCredentials, SetupConfig};
use sengled_tool::http_server::{BrokerAdvert, SetupHttpServer};
use sengled_tool::WifiCrypto;

pub const BULB_MAC: &str = "aa:bb:cc:dd:ee:ff";

// Start a callback server on a free port and return it with its address
pub async fn spawn_test_server(firmware_dir: &Path) -> (SetupHttpServer, SocketAddr) {
    let advert = BrokerAdvert { host: "192.168.1.10".to_string(), port: 8883 };
    let mut server = SetupHttpServer::new(advert, firmware_dir.to_path_buf());
    let addr = server.start(0).await.expect("Failed to start test server");

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(10)).await;

    (server, addr)
}

// Create a test HTTP client
pub fn create_test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create HTTP client")
}

// Helper to build test URLs against loopback
pub fn test_url(addr: SocketAddr, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", addr.port(), path)
}

// A port nothing listens on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

// ============================================================================
// SIMULATED BULB
// ============================================================================

#[derive(Clone)]
pub struct BulbBehaviour {
    pub mac: Option<&'static str>,
    pub accept_credentials: bool,
    pub call_back: bool,
}

impl Default for BulbBehaviour {
    fn default() -> Self {
        Self { mac: Some(BULB_MAC), accept_credentials: true, call_back: true }
    }
}

/// A bulb in access-point mode on a loopback UDP socket.
///
/// It also answers the control protocol, so the same address doubles as the
/// bulb's LAN address after pairing.
pub struct SimulatedBulb {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<String>>>,
    pub set_params: mpsc::UnboundedReceiver<Value>,
}

impl SimulatedBulb {
    pub fn request_names(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.request_names().iter().filter(|n| n.as_str() == name).count()
    }
}

pub async fn spawn_simulated_bulb(behaviour: BulbBehaviour) -> SimulatedBulb {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind bulb socket");
    let addr = socket.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let (params_tx, set_params) = mpsc::unbounded_channel();

    let log = requests.clone();
    tokio::spawn(async move {
        let crypto = WifiCrypto::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else { break };
            let text = String::from_utf8_lossy(&buf[..len]).to_string();

            let reply = match serde_json::from_str::<Value>(&text) {
                Ok(message) => handle_plain(&message, &behaviour, &log),
                Err(_) => {
                    let Ok(request) = crypto.decode(&text) else { continue };
                    log.lock().unwrap().push("setParamsRequest".to_string());
                    let payload = request["payload"].clone();
                    let _ = params_tx.send(payload.clone());
                    if behaviour.accept_credentials && behaviour.call_back {
                        tokio::spawn(call_back(payload));
                    }
                    Some(json!({
                        "name": "setParamsResponse",
                        "payload": {"result": behaviour.accept_credentials}
                    }))
                }
            };

            if let Some(reply) = reply {
                let _ = socket.send_to(reply.to_string().as_bytes(), from).await;
            }
        }
    });

    SimulatedBulb { addr, requests, set_params }
}

fn handle_plain(message: &Value, behaviour: &BulbBehaviour, log: &Arc<Mutex<Vec<String>>>) -> Option<Value> {
    if let Some(func) = message.get("func").and_then(Value::as_str) {
        log.lock().unwrap().push(func.to_string());
        return Some(json!({"func": func, "result": {"ret": 0}}));
    }

    let name = message.get("name").and_then(Value::as_str)?.to_string();
    log.lock().unwrap().push(name.clone());
    match name.as_str() {
        "startConfigRequest" => {
            let mut payload = json!({"result": true});
            if let Some(mac) = behaviour.mac {
                payload["mac"] = json!(mac);
            }
            Some(json!({"name": "startConfigResponse", "totalStep": 1, "curStep": 1, "payload": payload}))
        }
        "getAPListRequest" => Some(json!({
            "name": "getAPListResponse",
            "payload": {"routers": [
                {"ssid": "HomeNet", "bssid": "aa:bb:cc:00:00:01", "signal": 3},
                {"ssid": "Café", "bssid": "aa:bb:cc:00:00:02", "signal": 1}
            ]}
        })),
        "endConfigRequest" => Some(json!({"name": "endConfigResponse", "payload": {}})),
        _ => None,
    }
}

// What the bulb does after joining the router: call both configured URLs
async fn call_back(payload: Value) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let client = create_test_client();
    if let Some(url) = payload["appServerDomain"].as_str() {
        let _ = client.post(url).send().await;
    }
    if let Some(url) = payload["jbalancerDomain"].as_str() {
        let _ = client.get(url).send().await;
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Fast timeouts, loopback addresses and an unreachable external broker
pub fn test_config(bulb: SocketAddr, config_dir: &Path) -> SetupConfig {
    let broker_port = closed_port();
    SetupConfig {
        bulb_ap_addr: bulb,
        control_port: bulb.port(),
        interactive: false,
        credentials: Some(NetworkCredentials {
            ssid: "HomeNet".to_string(),
            password: "secret".to_string(),
            bssid: None,
        }),
        callback_host: Some("127.0.0.1".parse().unwrap()),
        http_port: 0,
        broker_port,
        external_broker: Some(ExternalBroker { host: "127.0.0.1".to_string(), port: broker_port }),
        config_dir: config_dir.to_path_buf(),
        firmware_dir: config_dir.join("firmware"),
        first_handshake_timeout: Duration::from_secs(1),
        step_timeout: Duration::from_secs(1),
        scan_settle: Duration::from_millis(10),
        callback_timeout: Duration::from_secs(5),
        status_poll_interval: Duration::from_millis(100),
        attribute_timeout: Duration::from_secs(1),
        verify_delay: Duration::from_millis(10),
        verify_backoff: Duration::from_millis(10),
        control_timeout: Duration::from_millis(500),
        session_timeout: Duration::from_secs(20),
        probe_timeout: Duration::from_millis(200),
        ..SetupConfig::default()
    }
}
