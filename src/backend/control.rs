// ============================================================================
// CONTROL.RS - POST-PROVISIONING UDP CONTROL
// Single-shot {func, param} requests against the bulb's LAN address
// ============================================================================

use serde_json::{json, Map, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 4096;

/// Requests understood by the bulb's control port
#[derive(Debug, Clone, PartialEq)]
pub enum UdpCommand {
    Switch(bool),
    /// Percent, clamped to 0-100
    Brightness(u8),
    Color { r: u8, g: u8, b: u8 },
    GetBrightness,
    SearchDevices,
    /// Arbitrary JSON object sent as-is
    Raw(Map<String, Value>),
}

impl UdpCommand {
    pub fn brightness(percent: i64) -> Self {
        UdpCommand::Brightness(percent.clamp(0, 100) as u8)
    }

    pub fn color(r: i64, g: i64, b: i64) -> Self {
        let channel = |v: i64| v.clamp(0, 255) as u8;
        UdpCommand::Color { r: channel(r), g: channel(g), b: channel(b) }
    }

    /// Wire shape `{func, param}`
    pub fn to_json(&self) -> Value {
        match self {
            UdpCommand::Switch(on) => {
                json!({"func": "set_device_switch", "param": {"switch": if *on { 1 } else { 0 }}})
            }
            UdpCommand::Brightness(percent) => {
                json!({"func": "set_device_brightness", "param": {"brightness": percent}})
            }
            UdpCommand::Color { r, g, b } => {
                json!({"func": "set_device_color", "param": {"color": format!("{}:{}:{}", r, g, b)}})
            }
            UdpCommand::GetBrightness => json!({"func": "get_device_brightness", "param": {}}),
            UdpCommand::SearchDevices => json!({"func": "search_devices", "param": {}}),
            UdpCommand::Raw(map) => Value::Object(map.clone()),
        }
    }
}

/// `result.ret == 0`
pub fn is_success(response: &Value) -> bool {
    response
        .get("result")
        .and_then(|r| r.get("ret"))
        .and_then(Value::as_i64)
        == Some(0)
}

/// Thin client for the control protocol
#[derive(Debug, Clone)]
pub struct UdpControl {
    port: u16,
    wait: Duration,
}

impl UdpControl {
    pub fn new(port: u16, wait: Duration) -> Self {
        Self { port, wait }
    }

    /// Send one command and wait for one reply.
    ///
    /// `None` means no (parseable) answer, which callers treat as a benign outcome.
    pub async fn send(&self, bulb_ip: IpAddr, command: &UdpCommand) -> Option<Value> {
        let target = SocketAddr::new(bulb_ip, self.port);
        let bind = match bulb_ip {
            IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            IpAddr::V6(_) => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0),
        };

        let socket = match UdpSocket::bind(bind).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Error opening UDP socket: {}", e);
                return None;
            }
        };

        let payload = command.to_json().to_string();
        debug!("UDP -> {}: {}", target, payload);
        if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
            warn!("Error sending UDP command to {}: {}", target, e);
            return None;
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        match timeout(self.wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                let text = String::from_utf8_lossy(&buf[..len]).to_string();
                debug!("UDP <- {}: {}", target, text);
                match serde_json::from_str(&text) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!("Could not parse response as JSON: {}", text);
                        None
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("UDP receive from {} failed: {}", target, e);
                None
            }
            Err(_) => None,
        }
    }

    async fn switch_ok(&self, bulb_ip: IpAddr, on: bool) -> bool {
        let label = if on { "ON" } else { "OFF" };
        info!("Testing power {} command...", label);
        match self.send(bulb_ip, &UdpCommand::Switch(on)).await {
            Some(response) if is_success(&response) => {
                info!("Power {} command succeeded", label);
                true
            }
            Some(_) => {
                warn!("{} command failed - bulb rejected", label);
                false
            }
            None => {
                warn!("{} command failed - no response", label);
                false
            }
        }
    }

    /// Turn the bulb OFF then ON, retrying the pair up to `attempts` times
    pub async fn toggle_until_success(&self, bulb_ip: IpAddr, attempts: u32, backoff: Duration) -> bool {
        for attempt in 1..=attempts.max(1) {
            if self.switch_ok(bulb_ip, false).await {
                sleep(backoff).await;
                if self.switch_ok(bulb_ip, true).await {
                    info!("UDP control test passed");
                    return true;
                }
            }
            if attempt < attempts {
                sleep(backoff).await;
            }
        }
        false
    }
}

/// Brightness (0-255) from a status report.
///
/// An explicit percentage wins; otherwise the largest raw channel value is
/// read as a percentage. The fallback is an approximation only.
pub fn estimate_brightness(explicit_percent: Option<u8>, channels: &[u32], is_on: bool) -> u8 {
    if !is_on {
        return 0;
    }
    let percent = match explicit_percent {
        Some(p) => u32::from(p),
        None => channels.iter().copied().max().unwrap_or(0),
    };
    (percent.saturating_mul(255) / 100).min(255) as u8
}
