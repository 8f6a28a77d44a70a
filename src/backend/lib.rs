// ============================================================================
// LIB.RS - LIBRARY EXPORTS
// Pairing, control and local cloud substitute for Sengled Wi-Fi bulbs.
// The binary and the integration tests both build on these modules.
// ============================================================================

pub mod attributes;
pub mod broker;
pub mod bulb_store;
pub mod certs;
pub mod commands;
pub mod config;
pub mod constants;
pub mod control;
pub mod crypto;
pub mod error;
pub mod firmware;
pub mod handshake;
pub mod http_server;
pub mod latch;
pub mod mqtt_client;
pub mod net_utils;
pub mod orchestrator;
pub mod session;

// Re-export key types for the binary and tests
pub use attributes::{classify, CompatibilityCategory, DeviceAttributes, SupportInfo};
pub use broker::EmbeddedBroker;
pub use config::{ExternalBroker, NetworkCredentials, SetupConfig};
pub use crypto::WifiCrypto;
pub use error::{DecodeError, EnvironmentError, MqttError, SetupError, SetupResult};
pub use http_server::{create_router, CallbackState, SetupHttpServer};
pub use orchestrator::{NetworkSelector, NoSelector, ProvisioningOrchestrator, Selection};
pub use session::{ChosenNetwork, MqttMode, MqttTarget, SetupOutcome, SetupState};
