// ============================================================================
// BROKER.RS - EMBEDDED MQTT BROKER
// TLS listener on the bulb-facing port, proxied into an in-process
// rumqttd core that listens on loopback only. The core is started once per
// process and shared by every front-end.
// ============================================================================

use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::certs::{CertificateProvider, CertificateSet};
use crate::error::EnvironmentError;
use crate::net_utils::probe_port;

const SERVICE: &str = "MQTT broker";
const CORE_READY_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const CORE_START_ATTEMPTS: u32 = 3;

static CORE: OnceCell<SocketAddr> = OnceCell::const_new();

// ============================================================================
// CORE CONFIGURATION
// ============================================================================

/// rumqttd settings for a single anonymous MQTT 3.1.1 listener on loopback
fn core_config(core_port: u16) -> Result<rumqttd::Config, EnvironmentError> {
    let toml = format!(
        r#"
id = 0

[router]
id = 0
max_connections = 64
max_outgoing_packet_count = 200
max_segment_size = 104857600
max_segment_count = 10

[v4.1]
name = "v4-1"
listen = "127.0.0.1:{core_port}"
next_connection_delay_ms = 1

[v4.1.connections]
connection_timeout_ms = 60000
max_payload_size = 262144
max_inflight_count = 100
dynamic_filters = true
"#
    );

    config::Config::builder()
        .add_source(config::File::from_str(&toml, config::FileFormat::Toml))
        .build()
        .and_then(|c| c.try_deserialize::<rumqttd::Config>())
        .map_err(|e| EnvironmentError::Bind {
            service: SERVICE,
            port: core_port,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        })
}

/// Ask the OS for a free loopback port for the core listener
fn reserve_core_port() -> Result<u16, EnvironmentError> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| EnvironmentError::from_bind(SERVICE, 0, e))?;
    let port = listener
        .local_addr()
        .map_err(|e| EnvironmentError::from_bind(SERVICE, 0, e))?
        .port();
    Ok(port)
}

// ============================================================================
// TLS
// ============================================================================

fn load_tls_config(set: &CertificateSet) -> Result<Arc<ServerConfig>, EnvironmentError> {
    let tls_err = |what: &str, e: &dyn std::fmt::Display| EnvironmentError::Tls(format!("{}: {}", what, e));

    let cert_file = std::fs::File::open(&set.server_cert).map_err(|e| tls_err("open server certificate", &e))?;
    let mut chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| tls_err("read server certificate", &e))?;

    let ca_file = std::fs::File::open(&set.ca_cert).map_err(|e| tls_err("open CA certificate", &e))?;
    for ca in rustls_pemfile::certs(&mut BufReader::new(ca_file)) {
        chain.push(ca.map_err(|e| tls_err("read CA certificate", &e))?);
    }

    let key_file = std::fs::File::open(&set.server_key).map_err(|e| tls_err("open server key", &e))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| tls_err("read server key", &e))?
        .ok_or_else(|| EnvironmentError::Tls("no private key in server.key".to_string()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", &e))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| tls_err("server certificate", &e))?;

    Ok(Arc::new(config))
}

// ============================================================================
// BROKER
// ============================================================================

struct RunningBroker {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// MQTT broker the bulb can reach over TLS
pub struct EmbeddedBroker {
    certs: CertificateProvider,
    port: u16,
    force_regenerate: bool,
    lan_ip: IpAddr,
    running: Option<RunningBroker>,
}

impl EmbeddedBroker {
    pub fn new(cert_dir: impl Into<PathBuf>, port: u16, force_regenerate: bool, lan_ip: IpAddr) -> Self {
        Self {
            certs: CertificateProvider::new(cert_dir),
            port,
            force_regenerate,
            lan_ip,
            running: None,
        }
    }

    /// Generate certificates if any are missing (or regeneration was forced)
    pub fn ensure_certificates(&self) -> Result<CertificateSet, EnvironmentError> {
        self.certs.ensure(self.force_regenerate, self.lan_ip)
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.accept_task.is_finished())
    }

    /// Address of the TLS listener while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Bind the TLS port, bring up the core and start accepting bulbs.
    ///
    /// A port that is already taken yields `PortInUse`; callers that want to
    /// reuse an existing broker should probe the port first.
    pub async fn start(&mut self) -> Result<SocketAddr, EnvironmentError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let certs = self.ensure_certificates()?;
        let acceptor = TlsAcceptor::from(load_tls_config(&certs)?);

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(|e| EnvironmentError::from_bind(SERVICE, self.port, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EnvironmentError::from_bind(SERVICE, self.port, e))?;

        let core_addr = shared_core().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, acceptor, core_addr, shutdown_rx));

        info!("MQTT broker listening on {} (TLS)", local_addr);
        self.running = Some(RunningBroker { local_addr, shutdown, accept_task });
        Ok(local_addr)
    }

    /// Address of the shared core, once any broker in this process started it
    pub fn core_addr() -> Option<SocketAddr> {
        CORE.get().copied()
    }

    /// Close the TLS listener and its sessions; waits a bounded time.
    /// The shared core stays up for the next session.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        let mut task = running.accept_task;
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(_) => info!("MQTT broker on {} stopped", running.local_addr),
            Err(_) => {
                warn!("MQTT broker did not stop within {:?}, aborting listener", STOP_TIMEOUT);
                task.abort();
            }
        }
    }
}

// ============================================================================
// SHARED CORE
// ============================================================================

async fn shared_core() -> Result<SocketAddr, EnvironmentError> {
    CORE.get_or_try_init(start_core).await.copied()
}

/// Run the rumqttd core on its own thread. The reserved port can be taken by
/// another process before rumqttd binds it, so a core that never comes up is
/// retried on a fresh port.
async fn start_core() -> Result<SocketAddr, EnvironmentError> {
    let mut core_port = 0;
    for attempt in 1..=CORE_START_ATTEMPTS {
        core_port = reserve_core_port()?;
        let core_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), core_port);
        let core = core_config(core_port)?;
        std::thread::Builder::new()
            .name("mqtt-broker-core".to_string())
            .spawn(move || {
                let mut broker = rumqttd::Broker::new(core);
                if let Err(e) = broker.start() {
                    error!("MQTT broker core stopped: {}", e);
                }
            })
            .map_err(|e| EnvironmentError::Bind { service: SERVICE, port: core_port, source: e })?;

        if wait_for_core(core_addr).await {
            debug!("MQTT broker core listening on {}", core_addr);
            return Ok(core_addr);
        }
        warn!("MQTT broker core did not come up on {} (attempt {})", core_addr, attempt);
    }

    Err(EnvironmentError::Bind {
        service: SERVICE,
        port: core_port,
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "broker core did not come up"),
    })
}

async fn wait_for_core(core_addr: SocketAddr) -> bool {
    let deadline = tokio::time::Instant::now() + CORE_READY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if probe_port(core_addr.ip(), core_addr.port(), Duration::from_millis(200)).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    core_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("MQTT connection from {}", peer);
                    let acceptor = acceptor.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(proxy_connection(stream, peer, acceptor, core_addr, shutdown));
                }
                Err(e) => {
                    warn!("Error accepting MQTT connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// Terminate TLS and shuttle bytes to the core until either side closes
async fn proxy_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    core_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!("TLS handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let mut core = match TcpStream::connect(core_addr).await {
        Ok(core) => core,
        Err(e) => {
            error!("Cannot reach broker core at {}: {}", core_addr, e);
            return;
        }
    };

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut tls, &mut core) => match result {
            Ok((up, down)) => debug!("MQTT session {} closed ({} bytes up, {} down)", peer, up, down),
            Err(e) => debug!("MQTT session {} ended: {}", peer, e),
        },
        _ = shutdown.changed() => debug!("Closing MQTT session {}", peer),
    }
}
