// ============================================================================
// SESSION.RS - PAIRING SESSION MODEL
// States, the network the bulb is sent to, the MQTT target and the outcome
// ============================================================================

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::attributes::{DeviceAttributes, SupportInfo};

/// Where the provisioning state machine currently is
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SetupState {
    Idle,
    Handshaking,
    ScanningAp,
    AwaitingSelection,
    ConfiguringServices,
    PushingCredentials,
    AwaitingCallback,
    DiscoveringAttributes,
    Classifying,
    VerifyingControl,
    Done,
    Aborted(String),
}

impl SetupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SetupState::Done | SetupState::Aborted(_))
    }
}

impl fmt::Display for SetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupState::Aborted(reason) => write!(f, "Aborted({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// The router the bulb is told to join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChosenNetwork {
    pub ssid: String,
    pub bssid: Option<String>,
    pub password: String,
}

/// How the MQTT broker for this session was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttMode {
    /// Started by this session, stopped at teardown
    Embedded,
    /// Supplied by the operator
    External,
    /// Something was already listening on the broker port locally
    Existing,
}

/// Broker address handed to the bulb through the balancer endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MqttTarget {
    pub host: String,
    pub port: u16,
    pub mode: MqttMode,
}

impl MqttTarget {
    /// Address this machine should use to reach the same broker
    pub fn local_connect_host(&self) -> String {
        match self.mode {
            MqttMode::External => self.host.clone(),
            MqttMode::Embedded | MqttMode::Existing => "127.0.0.1".to_string(),
        }
    }
}

/// Result of a finished pairing session
#[derive(Debug, Clone, Serialize)]
pub struct SetupOutcome {
    pub mac: String,
    pub network_ssid: String,
    pub mqtt_target: MqttTarget,
    pub callback_host: IpAddr,
    pub callback_port: u16,
    /// Both callback endpoints were hit in time
    pub callback_confirmed: bool,
    /// Set when the callback wait timed out but the flow carried on
    pub degraded: bool,
    pub last_client_ip: Option<IpAddr>,
    pub attributes: DeviceAttributes,
    pub support: SupportInfo,
    /// `None` when no bulb address was learned and verification was skipped
    pub udp_verified: Option<bool>,
    pub history: Vec<SetupState>,
}
