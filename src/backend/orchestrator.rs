// ============================================================================
// ORCHESTRATOR.RS - PROVISIONING STATE MACHINE
// Handshake, network selection, service bootstrap, credential push,
// callback verification, attribute discovery and UDP confirmation
// ============================================================================

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attributes::{support_info, CompatibilityCategory, DeviceAttributes};
use crate::broker::EmbeddedBroker;
use crate::bulb_store::BulbStore;
use crate::config::SetupConfig;
use crate::control::UdpControl;
use crate::error::{EnvironmentError, SetupError, SetupResult};
use crate::handshake::{resolve_mac, AccessPoint, RouterInfo, SetParamsPayload, UdpHandshakeClient};
use crate::http_server::{BrokerAdvert, RemoteCallbackServer, SetupHttpServer};
use crate::mqtt_client::{MqttClient, MqttClientOptions};
use crate::net_utils::{get_local_ip, probe_port};
use crate::session::{ChosenNetwork, MqttMode, MqttTarget, SetupOutcome, SetupState};

const RETRY_PAUSE: Duration = Duration::from_millis(500);
const END_CONFIG_WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// NETWORK SELECTION
// ============================================================================

/// What the operator wants after seeing a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Network(ChosenNetwork),
    Rescan,
    Cancel,
}

/// Source of the operator's network choice in interactive mode
pub trait NetworkSelector {
    fn select(&mut self, access_points: &[AccessPoint]) -> impl Future<Output = Selection>;
}

/// Used when the session must never ask
pub struct NoSelector;

impl NetworkSelector for NoSelector {
    async fn select(&mut self, _access_points: &[AccessPoint]) -> Selection {
        Selection::Cancel
    }
}

// ============================================================================
// SERVICE RESOLUTION
// ============================================================================

/// Decide which broker the bulb is sent to.
///
/// Order: something already listening on the broker port locally, then an
/// operator-supplied external broker, then a freshly started embedded one.
/// The embedded broker is returned so the caller owns its shutdown.
pub async fn resolve_mqtt_target(
    config: &SetupConfig,
    lan_ip: IpAddr,
) -> Result<(MqttTarget, Option<EmbeddedBroker>), EnvironmentError> {
    let port = config.broker_port;
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

    if port != 0 && probe_port(loopback, port, config.probe_timeout).await {
        info!("MQTT port {} is already listening, using the running broker", port);
        return Ok((existing(lan_ip, port), None));
    }

    if let Some(external) = &config.external_broker {
        info!("Using external MQTT broker: {}:{}", external.host, external.port);
        let target = MqttTarget {
            host: external.host.clone(),
            port: external.port,
            mode: MqttMode::External,
        };
        return Ok((target, None));
    }

    let mut broker = EmbeddedBroker::new(config.cert_dir(), port, config.force_regenerate_certs, lan_ip);
    match broker.start().await {
        Ok(addr) => {
            info!("MQTT broker running on {}:{} (TLS)", lan_ip, addr.port());
            let target = MqttTarget {
                host: lan_ip.to_string(),
                port: addr.port(),
                mode: MqttMode::Embedded,
            };
            Ok((target, Some(broker)))
        }
        Err(EnvironmentError::PortInUse { .. }) => {
            info!("MQTT port {} was taken meanwhile, using the running broker", port);
            Ok((existing(lan_ip, port), None))
        }
        Err(e) => Err(e),
    }
}

fn existing(lan_ip: IpAddr, port: u16) -> MqttTarget {
    MqttTarget {
        host: lan_ip.to_string(),
        port,
        mode: MqttMode::Existing,
    }
}

/// Callback server in use for the session
enum CallbackServer {
    Owned(SetupHttpServer),
    Reused(RemoteCallbackServer),
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Drives one pairing session end to end
pub struct ProvisioningOrchestrator<S: NetworkSelector> {
    config: SetupConfig,
    selector: S,
    store: BulbStore,
    state: SetupState,
    history: Vec<SetupState>,
    broker: Option<EmbeddedBroker>,
    callback: Option<CallbackServer>,
}

impl<S: NetworkSelector> ProvisioningOrchestrator<S> {
    pub fn new(config: SetupConfig, selector: S) -> Self {
        let store = BulbStore::new(&config.config_dir);
        Self {
            config,
            selector,
            store,
            state: SetupState::Idle,
            history: vec![SetupState::Idle],
            broker: None,
            callback: None,
        }
    }

    pub fn state(&self) -> &SetupState {
        &self.state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> &[SetupState] {
        &self.history
    }

    fn transition(&mut self, next: SetupState) {
        debug!("Setup state {} -> {}", self.state, next);
        self.state = next.clone();
        self.history.push(next);
    }

    pub async fn run(&mut self) -> SetupResult<SetupOutcome> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until done, aborted, or `shutdown` resolves.
    ///
    /// Services started by the session are stopped on every exit path.
    pub async fn run_until<F>(&mut self, shutdown: F) -> SetupResult<SetupOutcome>
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            result = self.run_with_retry() => result,
            _ = shutdown => {
                warn!("Interrupted by user, shutting down setup");
                Err(SetupError::Cancelled)
            }
        };

        self.teardown().await;
        match &result {
            Ok(_) => info!("Setup finished"),
            Err(e) => {
                warn!("Setup failed: {}", e);
                if let SetupError::Environment(env) = e {
                    warn!("{}", env.guidance());
                }
                self.transition(SetupState::Aborted(e.to_string()));
            }
        }
        result
    }

    /// Retry transport failures silently until the session deadline
    async fn run_with_retry(&mut self) -> SetupResult<SetupOutcome> {
        let deadline = Instant::now() + self.config.session_timeout;
        let mut attempt: u32 = 0;
        info!("Looking for bulb at {}...", self.config.bulb_ap_addr);

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = match tokio::time::timeout(remaining, self.run_once()).await {
                Ok(result) => result,
                Err(_) => Err(SetupError::SessionTimeout(self.config.session_timeout.as_secs())),
            };

            match result {
                Err(e) if e.is_retryable() && Instant::now() + RETRY_PAUSE < deadline => {
                    debug!("Attempt {} failed ({}), retrying", attempt, e);
                    self.teardown().await;
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(SetupError::SessionTimeout(self.config.session_timeout.as_secs()));
                }
                other => return other,
            }
        }
    }

    /// Reject configurations that can never succeed before touching the bulb
    fn preflight(&self) -> SetupResult<Option<ChosenNetwork>> {
        if self.config.interactive {
            return Ok(None);
        }
        let credentials = self.config.credentials.as_ref().ok_or_else(|| {
            SetupError::InvalidInput("non-interactive setup requires an SSID and a password".to_string())
        })?;
        if credentials.ssid.is_empty() || credentials.password.is_empty() {
            return Err(SetupError::InvalidInput(
                "non-interactive setup requires an SSID and a password".to_string(),
            ));
        }
        RouterInfo::for_network(&credentials.ssid, credentials.bssid.as_deref(), &credentials.password)?;
        Ok(Some(ChosenNetwork {
            ssid: credentials.ssid.clone(),
            bssid: credentials.bssid.clone(),
            password: credentials.password.clone(),
        }))
    }

    async fn run_once(&mut self) -> SetupResult<SetupOutcome> {
        let preset_network = self.preflight()?;
        let callback_host = self.config.callback_host.unwrap_or_else(get_local_ip);

        // Handshaking
        self.transition(SetupState::Handshaking);
        let mut client = UdpHandshakeClient::bind(self.config.bulb_ap_addr, self.config.step_timeout).await?;
        let response = client.start_config(self.config.first_handshake_timeout).await?;
        let mac = resolve_mac(&response, self.config.mac_override.as_deref(), client.bulb_addr())?;
        client.set_step_timeout(self.config.step_timeout);
        info!("Connected to bulb MAC: {}", mac);

        // Network selection
        let network = match preset_network {
            Some(network) => network,
            None => self.select_network(&client).await?,
        };
        let router_info = RouterInfo::for_network(&network.ssid, network.bssid.as_deref(), &network.password)?;
        info!("Using Wi-Fi network: {}", network.ssid);

        // Services must be accepting before the bulb can call back
        self.transition(SetupState::ConfiguringServices);
        let (mqtt_target, broker) = resolve_mqtt_target(&self.config, callback_host).await?;
        self.broker = broker;
        let callback_port = self.configure_callback_server(&mqtt_target).await?;

        // Credentials
        self.transition(SetupState::PushingCredentials);
        client.confirm_start_config().await?;
        let payload = SetParamsPayload::new(&callback_host.to_string(), callback_port, router_info);
        client.set_params(&payload).await?;
        info!("Wi-Fi credentials accepted by bulb");
        if let Err(e) = self.store.save(&mac, &mqtt_target.host) {
            warn!("Could not save bulb to {}: {}", self.store.path().display(), e);
        }

        // Callback
        self.transition(SetupState::AwaitingCallback);
        client.end_config(END_CONFIG_WAIT).await;
        drop(client);
        info!("Waiting for bulb to call back, the bulb will be flashing...");
        let (callback_confirmed, last_client_ip) = self.wait_for_callback().await;
        if callback_confirmed {
            info!("Bulb at {} contacted both endpoints", display_ip(last_client_ip));
        } else {
            warn!("Timeout waiting for endpoints, continuing with a degraded session");
        }

        // Attributes
        self.transition(SetupState::DiscoveringAttributes);
        let attributes = self.discover_attributes(&mac, &mqtt_target).await;

        self.transition(SetupState::Classifying);
        let support = support_info(&attributes);
        for (name, value) in attributes.iter() {
            info!("{}: {}", name, value);
        }
        log_support(&support.category, &support.model, &support.module);

        if let Some(CallbackServer::Reused(remote)) = &self.callback {
            if !remote.reset().await {
                debug!("Callback server reset was not acknowledged");
            }
        }

        // UDP confirmation
        self.transition(SetupState::VerifyingControl);
        let udp_verified = match last_client_ip {
            Some(ip) => Some(self.verify_control(ip).await),
            None => {
                warn!("Bulb address unknown, skipping UDP control test");
                None
            }
        };

        self.transition(SetupState::Done);
        Ok(SetupOutcome {
            mac,
            network_ssid: network.ssid,
            mqtt_target,
            callback_host,
            callback_port,
            callback_confirmed,
            degraded: !callback_confirmed,
            last_client_ip,
            attributes,
            support,
            udp_verified,
            history: self.history.clone(),
        })
    }

    async fn select_network(&mut self, client: &UdpHandshakeClient) -> SetupResult<ChosenNetwork> {
        loop {
            self.transition(SetupState::ScanningAp);
            info!("Getting available networks from bulb...");
            client.scan_wifi(self.config.scan_settle).await?;
            let access_points = client.get_ap_list().await?;
            if access_points.is_empty() {
                info!("(none found)");
            }

            self.transition(SetupState::AwaitingSelection);
            match self.selector.select(&access_points).await {
                Selection::Network(network) => return Ok(network),
                Selection::Rescan => continue,
                Selection::Cancel => return Err(SetupError::Cancelled),
            }
        }
    }

    /// Reuse a callback server already on the port, or start our own
    async fn configure_callback_server(&mut self, target: &MqttTarget) -> SetupResult<u16> {
        let port = self.config.http_port;
        if port != 0 && probe_port(IpAddr::V4(Ipv4Addr::LOCALHOST), port, self.config.probe_timeout).await {
            info!("HTTP port {} is already listening, using the running instance", port);
            self.callback = Some(CallbackServer::Reused(RemoteCallbackServer::new(port)));
            return Ok(port);
        }

        let advert = BrokerAdvert { host: target.host.clone(), port: target.port };
        let mut server = SetupHttpServer::new(advert, self.config.firmware_dir.clone());
        let addr = server.start(port).await?;
        self.callback = Some(CallbackServer::Owned(server));
        Ok(addr.port())
    }

    async fn wait_for_callback(&self) -> (bool, Option<IpAddr>) {
        match &self.callback {
            Some(CallbackServer::Owned(server)) => {
                let hit = server.wait_until_both_endpoints_hit(self.config.callback_timeout).await;
                (hit, server.last_client_ip().await)
            }
            Some(CallbackServer::Reused(remote)) => {
                info!("Checking running server /status until both endpoints are hit");
                match remote
                    .wait_until_both_endpoints_hit(self.config.callback_timeout, self.config.status_poll_interval)
                    .await
                {
                    Some(status) => (true, status.last_client_ip),
                    None => (false, remote.status().await.and_then(|s| s.last_client_ip)),
                }
            }
            None => (false, None),
        }
    }

    /// Connection problems downgrade to empty attributes
    async fn discover_attributes(&self, mac: &str, target: &MqttTarget) -> DeviceAttributes {
        let options = MqttClientOptions {
            host: target.local_connect_host(),
            port: target.port,
            use_tls: true,
            connect_timeout: self.config.attribute_timeout,
        };
        let mut client = match MqttClient::connect(&options).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Could not connect to MQTT broker to retrieve attributes: {}", e);
                return DeviceAttributes::new();
            }
        };

        info!("Listening for attributes from {}...", mac);
        let attributes = match client.listen_for_attributes(mac, self.config.attribute_timeout).await {
            Ok(attributes) => attributes,
            Err(e) => {
                warn!("Attribute discovery failed: {}", e);
                DeviceAttributes::new()
            }
        };
        client.disconnect().await;
        attributes
    }

    async fn verify_control(&self, ip: IpAddr) -> bool {
        tokio::time::sleep(self.config.verify_delay).await;
        let control = UdpControl::new(self.config.control_port, self.config.control_timeout);
        let ok = control
            .toggle_until_success(ip, self.config.verify_attempts, self.config.verify_backoff)
            .await;
        if !ok {
            warn!(
                "UDP control test failed. The bulb may need a power cycle, or UDP is blocked between this machine and {}",
                ip
            );
        }
        ok
    }

    /// Stop the callback server and the broker if this session started them
    async fn teardown(&mut self) {
        if let Some(CallbackServer::Owned(mut server)) = self.callback.take() {
            server.stop().await;
        }
        if let Some(mut broker) = self.broker.take() {
            broker.stop().await;
        }
    }
}

fn display_ip(ip: Option<IpAddr>) -> String {
    ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown address".to_string())
}

fn log_support(category: &CompatibilityCategory, model: &str, module: &str) {
    info!("Model: {}", model);
    info!("Module: {}", module);
    match category {
        CompatibilityCategory::Supported => info!("Supported for shim flashing."),
        CompatibilityCategory::Untested => warn!("Untested combination. Flashing may work but is not guaranteed."),
        CompatibilityCategory::NotSupported => warn!("This model/module is not supported for flashing."),
        CompatibilityCategory::Unknown => warn!("Could not determine compatibility."),
    }
}
