// ============================================================================
// CONFIG.RS - RUNTIME CONFIGURATION
// Addresses, ports, timeouts and directories for one pairing session
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{BROKER_TLS_PORT, BULB_AP_IP, BULB_PORT, DEFAULT_HTTP_PORT};

/// Router credentials supplied up front (non-interactive setup)
#[derive(Debug, Clone)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
    /// Only known when the operator picked the network from a scan
    pub bssid: Option<String>,
}

/// External MQTT broker the bulb should be sent to
#[derive(Debug, Clone)]
pub struct ExternalBroker {
    pub host: String,
    pub port: u16,
}

/// Everything a pairing session needs to know before it starts
#[derive(Debug, Clone)]
pub struct SetupConfig {
    /// Where the bulb answers while in access-point mode
    pub bulb_ap_addr: SocketAddr,
    /// UDP port of the post-provisioning control protocol
    pub control_port: u16,
    /// Scan for access points and ask the operator to pick one
    pub interactive: bool,
    pub credentials: Option<NetworkCredentials>,
    /// Used when the handshake response carries no MAC
    pub mac_override: Option<String>,
    /// Host written into the callback URLs; defaults to the LAN address
    pub callback_host: Option<IpAddr>,
    pub http_port: u16,
    pub broker_port: u16,
    pub external_broker: Option<ExternalBroker>,
    pub config_dir: PathBuf,
    pub firmware_dir: PathBuf,
    pub force_regenerate_certs: bool,

    pub first_handshake_timeout: Duration,
    pub step_timeout: Duration,
    pub scan_settle: Duration,
    pub callback_timeout: Duration,
    pub status_poll_interval: Duration,
    pub attribute_timeout: Duration,
    pub verify_delay: Duration,
    pub verify_attempts: u32,
    pub verify_backoff: Duration,
    pub control_timeout: Duration,
    pub session_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for SetupConfig {
    fn default() -> Self {
        let config_dir = default_config_dir();
        Self {
            bulb_ap_addr: SocketAddr::new(
                BULB_AP_IP.parse().unwrap_or(IpAddr::V4(Ipv4Addr::new(192, 168, 8, 1))),
                BULB_PORT,
            ),
            control_port: BULB_PORT,
            interactive: true,
            credentials: None,
            mac_override: None,
            callback_host: None,
            http_port: DEFAULT_HTTP_PORT,
            broker_port: BROKER_TLS_PORT,
            external_broker: None,
            firmware_dir: config_dir.join("firmware"),
            config_dir,
            force_regenerate_certs: false,

            first_handshake_timeout: Duration::from_secs(2),
            step_timeout: Duration::from_secs(15),
            scan_settle: Duration::from_secs(5),
            callback_timeout: Duration::from_secs(180),
            status_poll_interval: Duration::from_secs(1),
            attribute_timeout: Duration::from_secs(10),
            verify_delay: Duration::from_secs(5),
            verify_attempts: 3,
            verify_backoff: Duration::from_secs(1),
            control_timeout: Duration::from_secs(3),
            session_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl SetupConfig {
    /// Certificates live next to the bulb registry
    pub fn cert_dir(&self) -> PathBuf {
        self.config_dir.join("certs")
    }
}

/// `~/.sengled`, falling back to the working directory when there is no home
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sengled")
}
