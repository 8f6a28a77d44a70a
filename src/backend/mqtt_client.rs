// ============================================================================
// MQTT_CLIENT.RS - MQTT CLIENT FOR BULB COMMANDS AND STATUS
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use rumqttc::tokio_rustls::rustls;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, TlsConfiguration, Transport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::attributes::DeviceAttributes;
use crate::commands::{encode_entries, BulbCommand, GroupCommand};
use crate::constants::{status_topic, update_topic};
use crate::error::MqttError;
use crate::net_utils::current_epoch_ms;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct MqttClientOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub connect_timeout: Duration,
}

impl MqttClientOptions {
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: true,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Connected client; incoming publishes are queued for the caller
pub struct MqttClient {
    client: AsyncClient,
    incoming: mpsc::UnboundedReceiver<Publish>,
    event_task: JoinHandle<()>,
    broker: String,
}

impl MqttClient {
    /// Connect and wait for the broker's CONNACK
    pub async fn connect(options: &MqttClientOptions) -> Result<Self, MqttError> {
        let broker = format!("{}:{}", options.host, options.port);
        let client_id = format!("sengled_client_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let mut mqtt_options = MqttOptions::new(client_id, options.host.clone(), options.port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        if options.use_tls {
            mqtt_options.set_transport(Transport::tls_with_config(insecure_tls_config()));
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 32);
        let (connected_tx, connected_rx) = oneshot::channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let event_task = tokio::spawn(drive_event_loop(eventloop, connected_tx, incoming_tx, broker.clone()));

        match tokio::time::timeout(options.connect_timeout, connected_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("Connected to MQTT broker at {}", broker);
                Ok(Self { client, incoming, event_task, broker })
            }
            Ok(Ok(Err(reason))) => {
                event_task.abort();
                Err(MqttError::Connect { addr: broker, reason })
            }
            Ok(Err(_)) => {
                event_task.abort();
                Err(MqttError::Connect { addr: broker, reason: "event loop ended".to_string() })
            }
            Err(_) => {
                event_task.abort();
                Err(MqttError::ConnectTimeout(broker))
            }
        }
    }

    /// Publish a command to one bulb's update topic (QoS 1)
    pub async fn publish_command(&self, mac: &str, command: &BulbCommand) -> Result<(), MqttError> {
        let payload = encode_entries(&command.entries(mac, current_epoch_ms()));
        self.publish_raw(&update_topic(mac), payload).await
    }

    /// Publish a group command through the first bulb of the group
    pub async fn publish_group(&self, macs: &[String], command: &GroupCommand, gradient_time: u32) -> Result<(), MqttError> {
        let Some(first) = macs.first() else {
            return Ok(());
        };
        let payload = encode_entries(&command.entries(macs, gradient_time, current_epoch_ms()));
        self.publish_raw(&update_topic(first), payload).await
    }

    /// Publish an operator-supplied command array as-is
    pub async fn publish_custom(&self, mac: &str, entries: &serde_json::Value) -> Result<(), MqttError> {
        self.publish_raw(&update_topic(mac), entries.to_string()).await
    }

    pub async fn publish_raw(&self, topic: &str, payload: String) -> Result<(), MqttError> {
        debug!("MQTT publish {} {}", topic, payload);
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    /// Next incoming publish, or `None` if `wait` elapses or the connection dropped
    pub async fn next_message(&mut self, wait: Duration) -> Option<Publish> {
        tokio::time::timeout(wait, self.incoming.recv()).await.ok().flatten()
    }

    /// Subscribe to the bulb's status topic and collect attributes until
    /// every required one is known or `wait` elapses
    pub async fn listen_for_attributes(&mut self, mac: &str, wait: Duration) -> Result<DeviceAttributes, MqttError> {
        let topic = status_topic(mac);
        self.subscribe(&topic).await?;
        info!("Listening for attributes on {}", topic);

        let mut attributes = DeviceAttributes::new();
        let deadline = tokio::time::Instant::now() + wait;
        while !attributes.is_complete() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(publish) = self.next_message(remaining).await else {
                break;
            };
            if publish.topic == topic {
                attributes.absorb(&publish.payload);
            }
        }

        if !attributes.is_complete() {
            warn!("Timed out waiting for bulb attributes on {}", topic);
        }
        Ok(attributes)
    }

    pub async fn disconnect(self) {
        debug!("Disconnecting from MQTT broker {}", self.broker);
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), self.event_task).await;
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    connected: oneshot::Sender<Result<(), String>>,
    incoming: mpsc::UnboundedSender<Publish>,
    broker: String,
) {
    let mut connected = Some(connected);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(tx) = connected.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if incoming.send(publish).is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                match connected.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e.to_string()));
                    }
                    None => debug!("MQTT connection to {} closed: {}", broker, e),
                }
                break;
            }
        }
    }
}

/// The broker uses a self-signed certificate, so the client accepts any
fn insecure_tls_config() -> TlsConfiguration {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    TlsConfiguration::Rustls(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_closed_port_fails_fast() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = MqttClientOptions {
            host: "127.0.0.1".to_string(),
            port,
            use_tls: false,
            connect_timeout: Duration::from_secs(2),
        };
        let result = MqttClient::connect(&options).await;
        assert!(matches!(result, Err(MqttError::Connect { .. }) | Err(MqttError::ConnectTimeout(_))));
    }
}
