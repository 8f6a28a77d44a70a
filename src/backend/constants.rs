// ============================================================================
// CONSTANTS.RS - FIXED PROTOCOL VALUES
// Addresses, ports and compatibility tables shared by every component
// ============================================================================

/// Address of the bulb while it hosts its own setup access point
pub const BULB_AP_IP: &str = "192.168.8.1";

/// UDP port used both for the setup handshake and the control protocol
pub const BULB_PORT: u16 = 9080;

/// TLS port the bulb expects its MQTT broker on
pub const BROKER_TLS_PORT: u16 = 8883;

/// Default port of the callback HTTP server
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Callback endpoint the bulb calls once it has joined the router
pub const ACCESS_CLOUD_PATH: &str = "/life2/device/accessCloud.json";

/// Callback endpoint the bulb asks for its MQTT broker address
pub const BALANCER_PATH: &str = "/jbalancer/new/bimqtt";

/// Fixed user id the vendor app sends with the router credentials
pub const SETUP_USER_ID: &str = "618";

/// Time zone string sent with the router credentials
pub const SETUP_TIME_ZONE: &str = "America/Chicago";

// ============================================================================
// COMPATIBILITY MATRIX
// ============================================================================

/// Model codes confirmed to work with the shim firmware
pub const SUPPORTED_TYPECODES: &[&str] = &["W31-N11", "W31-N15"];

/// Module markers that suggest a compatible (ESP8266 based) but untested bulb
pub const COMPATIBLE_IDENTIFY_MARKERS: &[&str] = &["ESP8266"];

/// Attributes that must be reported before classification can run
pub const REQUIRED_ATTRIBUTES: &[&str] = &["typeCode", "identifyNO", "supportAttributes"];

// ============================================================================
// MQTT TOPICS
// ============================================================================

/// Topic the bulb listens on for commands
pub fn update_topic(mac: &str) -> String {
    format!("wifielement/{}/update", mac)
}

/// Topic the bulb reports its attributes on
pub fn status_topic(mac: &str) -> String {
    format!("wifielement/{}/status", mac)
}
