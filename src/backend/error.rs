// ============================================================================
// ERROR.RS - ERROR TAXONOMY
// Transport, protocol, environment, decode and cancellation failures
// ============================================================================

use std::io;
use thiserror::Error;

/// Failures turning bytes on the wire into typed values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("invalid UTF-8 in payload")]
    Utf8,
    #[error("invalid MAC address format: {0:?}")]
    Mac(String),
}

/// Host environment problems the operator can act on
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("{service} port {port} is already in use")]
    PortInUse { service: &'static str, port: u16 },
    #[error("{service} port {port} requires elevated privileges")]
    PermissionDenied { service: &'static str, port: u16 },
    #[error("certificate generation failed: {0}")]
    Certificate(String),
    #[error("TLS configuration failed: {0}")]
    Tls(String),
    #[error("{service} failed to start on port {port}: {source}")]
    Bind {
        service: &'static str,
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl EnvironmentError {
    /// Classify a bind failure so port conflicts and privilege problems stay distinct
    pub fn from_bind(service: &'static str, port: u16, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => EnvironmentError::PortInUse { service, port },
            io::ErrorKind::PermissionDenied => EnvironmentError::PermissionDenied { service, port },
            _ => EnvironmentError::Bind { service, port, source: err },
        }
    }

    /// What the operator should do about it
    pub fn guidance(&self) -> &'static str {
        match self {
            EnvironmentError::PortInUse { service: "MQTT broker", .. } => {
                "Free port 8883 or provide --broker-ip/--broker-port for an external broker."
            }
            EnvironmentError::PortInUse { .. } => "Free the port or choose another one with --http-port.",
            EnvironmentError::PermissionDenied { .. } => {
                "Run with administrator privileges or choose an unprivileged port."
            }
            EnvironmentError::Certificate(_) => {
                "Check that the configuration directory is writable, or pass --regenerate-certs."
            }
            EnvironmentError::Tls(_) => "Regenerate the broker certificates with --regenerate-certs.",
            EnvironmentError::Bind { .. } => "Check the network configuration of this machine.",
        }
    }
}

/// Failures talking to an MQTT broker
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("could not connect to MQTT broker {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("MQTT broker {0} did not acknowledge the connection in time")]
    ConnectTimeout(String),
    #[error("MQTT request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("TLS setup for MQTT client failed: {0}")]
    Tls(String),
}

/// Session level failure of a pairing attempt
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("network error: {0}")]
    Transport(#[from] io::Error),
    #[error("no response from bulb during {0}")]
    NoResponse(&'static str),
    #[error("bulb rejected {step}: {raw}")]
    Rejected { step: &'static str, raw: String },
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("bulb did not report a usable MAC address: {0}")]
    MissingMac(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("non-ASCII SSID {0:?} needs a BSSID, run the setup interactively")]
    NonAsciiSsid(String),
    #[error("setup did not complete within {0} seconds")]
    SessionTimeout(u64),
    #[error("interrupted by user")]
    Cancelled,
}

impl SetupError {
    /// Transport failures are the only ones the outer loop retries silently
    pub fn is_retryable(&self) -> bool {
        matches!(self, SetupError::Transport(_) | SetupError::NoResponse(_))
    }
}

pub type SetupResult<T> = Result<T, SetupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_errors_are_classified() {
        let in_use = io::Error::new(io::ErrorKind::AddrInUse, "busy");
        assert!(matches!(
            EnvironmentError::from_bind("HTTP server", 8080, in_use),
            EnvironmentError::PortInUse { port: 8080, .. }
        ));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            EnvironmentError::from_bind("HTTP server", 80, denied),
            EnvironmentError::PermissionDenied { port: 80, .. }
        ));

        let other = io::Error::new(io::ErrorKind::Other, "weird");
        assert!(matches!(
            EnvironmentError::from_bind("HTTP server", 80, other),
            EnvironmentError::Bind { .. }
        ));
    }

    #[test]
    fn broker_port_conflict_points_at_external_broker() {
        let err = EnvironmentError::PortInUse { service: "MQTT broker", port: 8883 };
        assert!(err.guidance().contains("--broker-ip"));
    }

    #[test]
    fn only_transport_failures_retry() {
        assert!(SetupError::NoResponse("handshake").is_retryable());
        assert!(SetupError::Transport(io::Error::new(io::ErrorKind::TimedOut, "t")).is_retryable());
        assert!(!SetupError::Cancelled.is_retryable());
        assert!(!SetupError::Rejected { step: "setParams", raw: "{}".into() }.is_retryable());
    }
}
