// ============================================================================
// HANDSHAKE.RS - UDP SETUP PROTOCOL
// Request/response exchanges with the bulb while it is in access-point mode
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::constants::{ACCESS_CLOUD_PATH, BALANCER_PATH, SETUP_TIME_ZONE, SETUP_USER_ID};
use crate::crypto::WifiCrypto;
use crate::error::{SetupError, SetupResult};
use crate::net_utils::{lookup_neighbor_mac, normalize_mac};

const MAX_DATAGRAM: usize = 4096;

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Envelope shared by every setup request
#[derive(Debug, Serialize)]
struct SetupRequest<'a, P: Serialize> {
    name: &'a str,
    #[serde(rename = "totalStep")]
    total_step: u32,
    #[serde(rename = "curStep")]
    cur_step: u32,
    payload: P,
}

impl<'a, P: Serialize> SetupRequest<'a, P> {
    fn new(name: &'a str, payload: P) -> Self {
        Self { name, total_step: 1, cur_step: 1, payload }
    }
}

/// One access point as reported by the bulb's scan
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessPoint {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub bssid: String,
    #[serde(default)]
    pub signal: u8,
}

impl AccessPoint {
    /// Signal strength as a 0-3 bar count
    pub fn bars(&self) -> u8 {
        self.signal.min(3)
    }
}

/// Router credentials in the form the firmware can use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterInfo {
    pub ssid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bssid: Option<String>,
    pub password: String,
}

impl RouterInfo {
    /// The firmware cannot decode non-ASCII SSIDs; those must be sent as an
    /// empty SSID plus the uppercase BSSID.
    pub fn for_network(ssid: &str, bssid: Option<&str>, password: &str) -> SetupResult<Self> {
        if ssid.is_ascii() {
            return Ok(Self {
                ssid: ssid.to_string(),
                bssid: None,
                password: password.to_string(),
            });
        }
        match bssid.filter(|b| !b.is_empty()) {
            Some(bssid) => Ok(Self {
                ssid: String::new(),
                bssid: Some(bssid.to_uppercase()),
                password: password.to_string(),
            }),
            None => Err(SetupError::NonAsciiSsid(ssid.to_string())),
        }
    }
}

/// Body of `setParamsRequest`
#[derive(Debug, Clone, Serialize)]
pub struct SetParamsPayload {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "appServerDomain")]
    pub app_server_domain: String,
    #[serde(rename = "jbalancerDomain")]
    pub jbalancer_domain: String,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
    #[serde(rename = "routerInfo")]
    pub router_info: RouterInfo,
}

impl SetParamsPayload {
    /// Point both callback URLs at `host:port`
    pub fn new(callback_host: &str, callback_port: u16, router_info: RouterInfo) -> Self {
        Self {
            user_id: SETUP_USER_ID.to_string(),
            app_server_domain: format!("http://{}:{}{}", callback_host, callback_port, ACCESS_CLOUD_PATH),
            jbalancer_domain: format!("http://{}:{}{}", callback_host, callback_port, BALANCER_PATH),
            time_zone: SETUP_TIME_ZONE.to_string(),
            router_info,
        }
    }
}

// ============================================================================
// RESPONSE INTERPRETATION
// ============================================================================

/// `payload.result == true`
fn payload_result(response: &Value) -> bool {
    response
        .get("payload")
        .and_then(|p| p.get("result"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Decide whether the bulb accepted the credentials.
///
/// The reply may be plaintext JSON or encrypted; plaintext is tried first.
pub fn check_set_params_response(raw: &str, crypto: &WifiCrypto) -> SetupResult<()> {
    let parsed = match serde_json::from_str::<Value>(raw) {
        Ok(value) => {
            debug!("setParams response parsed as plaintext JSON");
            value
        }
        Err(_) => {
            debug!("setParams response is not JSON, attempting decryption");
            crypto.decode(raw).map_err(|e| SetupError::Rejected {
                step: "setParamsRequest",
                raw: format!("{} ({})", raw, e),
            })?
        }
    };

    if payload_result(&parsed) {
        Ok(())
    } else {
        Err(SetupError::Rejected {
            step: "setParamsRequest",
            raw: parsed.to_string(),
        })
    }
}

/// Pick the bulb MAC from a handshake response.
///
/// Order: the response itself, the operator override, the neighbour table.
pub fn resolve_mac(
    response: &Value,
    mac_override: Option<&str>,
    bulb_addr: SocketAddr,
) -> SetupResult<String> {
    let reported = response
        .get("payload")
        .and_then(|p| p.get("mac"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let candidate = match reported {
        Some(mac) => Some(mac),
        None => match mac_override {
            Some(mac) => {
                info!("MAC address not provided by bulb, using operator override");
                Some(mac.to_string())
            }
            None => lookup_neighbor_mac(bulb_addr.ip()),
        },
    };

    candidate
        .and_then(|mac| normalize_mac(&mac).ok())
        .ok_or_else(|| SetupError::MissingMac(response.to_string()))
}

// ============================================================================
// CLIENT
// ============================================================================

/// Owns the session's UDP socket and speaks the setup protocol over it
pub struct UdpHandshakeClient {
    socket: UdpSocket,
    bulb_addr: SocketAddr,
    step_timeout: Duration,
    crypto: WifiCrypto,
}

impl UdpHandshakeClient {
    /// Bind an ephemeral socket for one session
    pub async fn bind(bulb_addr: SocketAddr, step_timeout: Duration) -> std::io::Result<Self> {
        let bind_addr = if bulb_addr.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!("Setup socket bound on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            bulb_addr,
            step_timeout,
            crypto: WifiCrypto::new(),
        })
    }

    pub fn bulb_addr(&self) -> SocketAddr {
        self.bulb_addr
    }

    pub fn set_step_timeout(&mut self, step_timeout: Duration) {
        self.step_timeout = step_timeout;
    }

    async fn send_json<P: Serialize>(&self, name: &str, payload: P) -> SetupResult<()> {
        let request = SetupRequest::new(name, payload);
        let bytes = serde_json::to_vec(&request)
            .map_err(|e| SetupError::InvalidInput(format!("cannot encode {}: {}", name, e)))?;
        debug!(step = name, "-> {}", String::from_utf8_lossy(&bytes));
        self.socket.send_to(&bytes, self.bulb_addr).await?;
        Ok(())
    }

    /// Next datagram from the bulb; anything from another sender is dropped
    async fn recv_text(&self, step: &'static str, wait: Duration) -> SetupResult<String> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) if from == self.bulb_addr => {
                    let text = String::from_utf8_lossy(&buf[..len]).to_string();
                    debug!(step, "<- {} from {}", text, from);
                    return Ok(text);
                }
                Ok(Ok((len, from))) => {
                    debug!(step, "Ignoring {} bytes from unexpected sender {}", len, from);
                }
                Ok(Err(e)) => return Err(SetupError::Transport(e)),
                Err(_) => return Err(SetupError::NoResponse(step)),
            }
        }
    }

    async fn recv_json(&self, step: &'static str, wait: Duration) -> SetupResult<Value> {
        let text = self.recv_text(step, wait).await?;
        serde_json::from_str(&text).map_err(|e| SetupError::Rejected {
            step,
            raw: format!("{} ({})", text, e),
        })
    }

    /// Open a setup session; the response carries the bulb MAC
    pub async fn start_config(&self, wait: Duration) -> SetupResult<Value> {
        self.send_json("startConfigRequest", json!({"protocol": 1})).await?;
        self.recv_json("startConfigRequest", wait).await
    }

    /// Fresh handshake required right before the credentials are sent
    pub async fn confirm_start_config(&self) -> SetupResult<()> {
        let response = self.start_config(self.step_timeout).await?;
        if payload_result(&response) {
            Ok(())
        } else {
            Err(SetupError::Rejected {
                step: "startConfigRequest",
                raw: response.to_string(),
            })
        }
    }

    /// Ask the bulb to scan, then give it time to do so
    pub async fn scan_wifi(&self, settle: Duration) -> SetupResult<()> {
        self.send_json("scanWifiRequest", json!({})).await?;
        sleep(settle).await;
        Ok(())
    }

    pub async fn get_ap_list(&self) -> SetupResult<Vec<AccessPoint>> {
        self.send_json("getAPListRequest", json!({})).await?;
        let response = self.recv_json("getAPListRequest", self.step_timeout).await?;
        let routers = response
            .get("payload")
            .and_then(|p| p.get("routers"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(routers).map_err(|e| SetupError::Rejected {
            step: "getAPListRequest",
            raw: format!("{} ({})", response, e),
        })
    }

    /// Send the encrypted router credentials and callback URLs.
    ///
    /// A missing reply is tolerated, the bulb sometimes switches networks
    /// before answering. An explicit rejection is not.
    pub async fn set_params(&self, payload: &SetParamsPayload) -> SetupResult<()> {
        let request = SetupRequest::new("setParamsRequest", payload);
        let encrypted = self.crypto.encode(&request)?;
        debug!(step = "setParamsRequest", "-> {} encrypted bytes", encrypted.len());
        self.socket.send_to(encrypted.as_bytes(), self.bulb_addr).await?;

        match self.recv_text("setParamsRequest", self.step_timeout).await {
            Ok(raw) => check_set_params_response(&raw, &self.crypto),
            Err(SetupError::NoResponse(_)) => {
                warn!("No reply to setParamsRequest, assuming credentials were accepted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Close the setup session. Neither the reply nor its absence matters.
    pub async fn end_config(&self, wait: Duration) {
        if let Err(e) = self.send_json("endConfigRequest", json!({})).await {
            debug!("endConfigRequest not sent: {}", e);
            return;
        }
        let _ = self.recv_text("endConfigRequest", wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulb() -> SocketAddr {
        "192.168.8.1:9080".parse().unwrap()
    }

    #[test]
    fn ascii_ssid_is_sent_by_name() {
        let info = RouterInfo::for_network("HomeNet", Some("aa:bb:cc:dd:ee:ff"), "secret").unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, json!({"ssid": "HomeNet", "password": "secret"}));
    }

    #[test]
    fn non_ascii_ssid_uses_uppercase_bssid() {
        let info = RouterInfo::for_network("Café", Some("aa:bb:cc:dd:ee:ff"), "secret").unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, json!({"ssid": "", "bssid": "AA:BB:CC:DD:EE:FF", "password": "secret"}));
    }

    #[test]
    fn non_ascii_ssid_without_bssid_is_refused() {
        assert!(matches!(
            RouterInfo::for_network("Café", None, "secret"),
            Err(SetupError::NonAsciiSsid(_))
        ));
    }

    #[test]
    fn callback_urls_use_host_and_port() {
        let info = RouterInfo::for_network("HomeNet", None, "pw").unwrap();
        let payload = SetParamsPayload::new("192.168.1.20", 8080, info);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["appServerDomain"], "http://192.168.1.20:8080/life2/device/accessCloud.json");
        assert_eq!(json["jbalancerDomain"], "http://192.168.1.20:8080/jbalancer/new/bimqtt");
        assert_eq!(json["userID"], "618");
    }

    #[test]
    fn set_params_response_plaintext_or_encrypted() {
        let crypto = WifiCrypto::new();
        assert!(check_set_params_response(r#"{"payload":{"result":true}}"#, &crypto).is_ok());
        assert!(matches!(
            check_set_params_response(r#"{"payload":{"result":false}}"#, &crypto),
            Err(SetupError::Rejected { .. })
        ));

        let accepted = crypto.encode(&json!({"payload": {"result": true}})).unwrap();
        assert!(check_set_params_response(&accepted, &crypto).is_ok());

        let refused = crypto.encode(&json!({"payload": {"result": false}})).unwrap();
        assert!(check_set_params_response(&refused, &crypto).is_err());

        assert!(check_set_params_response("garbage", &crypto).is_err());
    }

    #[test]
    fn mac_from_response_then_override() {
        let with_mac = json!({"payload": {"mac": "aa:bb:cc:dd:ee:ff"}});
        assert_eq!(resolve_mac(&with_mac, None, bulb()).unwrap(), "AA:BB:CC:DD:EE:FF");

        let without = json!({"payload": {}});
        assert_eq!(
            resolve_mac(&without, Some("11-22-33-44-55-66"), bulb()).unwrap(),
            "11:22:33:44:55:66"
        );

        let malformed = json!({"payload": {"mac": "nope"}});
        assert!(matches!(resolve_mac(&malformed, None, bulb()), Err(SetupError::MissingMac(_))));
    }

    #[tokio::test]
    async fn replies_from_other_senders_are_ignored() {
        let bulb = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpHandshakeClient::bind(bulb.local_addr().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        let client_addr = SocketAddr::from(([127, 0, 0, 1], client.socket.local_addr().unwrap().port()));

        stranger
            .send_to(br#"{"payload":{"result":true,"mac":"11:11:11:11:11:11"}}"#, client_addr)
            .await
            .unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = bulb.recv_from(&mut buf).await.unwrap();
            bulb.send_to(br#"{"payload":{"result":true,"mac":"aa:bb:cc:dd:ee:ff"}}"#, from)
                .await
                .unwrap();
        });

        let response = client.start_config(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response["payload"]["mac"], "aa:bb:cc:dd:ee:ff");
    }

    #[tokio::test]
    async fn stranger_traffic_does_not_extend_the_wait() {
        let bulb = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpHandshakeClient::bind(bulb.local_addr().unwrap(), Duration::from_millis(200))
            .await
            .unwrap();
        let client_addr = SocketAddr::from(([127, 0, 0, 1], client.socket.local_addr().unwrap().port()));
        stranger.send_to(b"{}", client_addr).await.unwrap();

        let result = client.start_config(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(SetupError::NoResponse("startConfigRequest"))));
    }

    #[test]
    fn access_point_bars_are_capped() {
        let ap: AccessPoint = serde_json::from_value(json!({"ssid": "x", "bssid": "y", "signal": 7})).unwrap();
        assert_eq!(ap.bars(), 3);
        let sparse: AccessPoint = serde_json::from_value(json!({"ssid": "x"})).unwrap();
        assert_eq!(sparse.signal, 0);
    }
}
