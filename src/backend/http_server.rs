// ============================================================================
// HTTP_SERVER.RS - SETUP CALLBACK SERVER
// Stands in for the vendor cloud endpoints the bulb calls after joining the
// router, and serves firmware images for upgrades
// ============================================================================

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, Router},
    Json,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::constants::{ACCESS_CLOUD_PATH, BALANCER_PATH};
use crate::error::EnvironmentError;
use crate::latch::Latch;

const SERVICE: &str = "HTTP server";
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// SHARED STATE
// ============================================================================

/// Where the balancer endpoint sends the bulb
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAdvert {
    pub host: String,
    pub port: u16,
}

/// State shared between the handlers and the orchestrator
#[derive(Clone)]
pub struct CallbackState {
    pub access_cloud_hit: Latch,
    pub balancer_hit: Latch,
    pub firmware_served: Latch,
    last_client_ip: Arc<RwLock<Option<IpAddr>>>,
    last_firmware: Arc<RwLock<Option<String>>>,
    broker: Arc<BrokerAdvert>,
    firmware_dir: Arc<PathBuf>,
}

impl CallbackState {
    pub fn new(broker: BrokerAdvert, firmware_dir: PathBuf) -> Self {
        Self {
            access_cloud_hit: Latch::new(),
            balancer_hit: Latch::new(),
            firmware_served: Latch::new(),
            last_client_ip: Arc::new(RwLock::new(None)),
            last_firmware: Arc::new(RwLock::new(None)),
            broker: Arc::new(broker),
            firmware_dir: Arc::new(firmware_dir),
        }
    }

    pub async fn last_client_ip(&self) -> Option<IpAddr> {
        *self.last_client_ip.read().await
    }

    pub async fn last_firmware(&self) -> Option<String> {
        self.last_firmware.read().await.clone()
    }

    pub fn hit_both_endpoints(&self) -> bool {
        self.access_cloud_hit.is_set() && self.balancer_hit.is_set()
    }

    /// Clear hit tracking so the next bulb starts from scratch
    pub async fn reset(&self) {
        self.access_cloud_hit.reset();
        self.balancer_hit.reset();
        self.firmware_served.reset();
        *self.last_client_ip.write().await = None;
        *self.last_firmware.write().await = None;
    }

    async fn record_caller(&self, ip: IpAddr) {
        *self.last_client_ip.write().await = Some(ip);
    }
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackStatus {
    pub last_client_ip: Option<IpAddr>,
    pub hit_both_points: bool,
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the callback router around `state`
pub fn create_router(state: CallbackState) -> Router {
    Router::new()
        .route(ACCESS_CLOUD_PATH, get(access_cloud_handler).post(access_cloud_handler))
        .route(BALANCER_PATH, get(balancer_handler).post(balancer_handler))
        .route("/status", get(status_handler))
        .route("/reset", get(reset_handler).post(reset_handler))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn access_cloud_handler(
    State(state): State<CallbackState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<Value> {
    info!("Bulb {} reached {}", addr.ip(), ACCESS_CLOUD_PATH);
    state.record_caller(addr.ip()).await;
    state.access_cloud_hit.set();
    Json(json!({
        "messageCode": "200",
        "info": "OK",
        "description": "正常",
        "success": true,
    }))
}

async fn balancer_handler(
    State(state): State<CallbackState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<Value> {
    info!("Bulb {} reached {}", addr.ip(), BALANCER_PATH);
    state.record_caller(addr.ip()).await;
    state.balancer_hit.set();
    let broker = &state.broker;
    // the bulb firmware reads the misspelled key
    Json(json!({
        "protocal": "mqtt",
        "protocol": "mqtt",
        "host": broker.host,
        "port": broker.port,
    }))
}

async fn status_handler(State(state): State<CallbackState>) -> Json<CallbackStatus> {
    Json(CallbackStatus {
        last_client_ip: state.last_client_ip().await,
        hit_both_points: state.hit_both_endpoints(),
    })
}

async fn reset_handler(State(state): State<CallbackState>) -> Json<Value> {
    state.reset().await;
    debug!("Callback state reset");
    Json(json!({"success": true}))
}

/// Everything else: firmware images or 404
async fn fallback_handler(State(state): State<CallbackState>, method: Method, uri: Uri) -> Response {
    let raw_path = uri.path();
    if method != Method::GET || !raw_path.ends_with(".bin") {
        debug!("No route for {} {}", method, raw_path);
        return StatusCode::NOT_FOUND.into_response();
    }

    let name = match firmware_name(raw_path) {
        Ok(name) => name,
        Err(reason) => {
            warn!("Refused firmware download {}: {}", raw_path, reason);
            return (StatusCode::BAD_REQUEST, reason).into_response();
        }
    };

    let file = state.firmware_dir.join(&name);
    if !file.is_file() {
        warn!("Firmware file not found: {}", name);
        return (StatusCode::NOT_FOUND, "Firmware file not found").into_response();
    }

    match tokio::fs::read(&file).await {
        Ok(data) => {
            info!("Served firmware: {} ({} bytes)", name, data.len());
            let len = data.len();
            *state.last_firmware.write().await = Some(name.clone());
            state.firmware_served.set();
            (
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", name)),
                    (header::CONTENT_LENGTH, len.to_string()),
                ],
                Body::from(data),
            )
                .into_response()
        }
        Err(e) => {
            warn!("Error sending firmware {}: {}", name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Error sending firmware file").into_response()
        }
    }
}

/// A bare file name from the request path, or why it was refused.
///
/// Decoding happens before the checks so encoded separators and dot
/// segments are caught too.
pub fn firmware_name(raw_path: &str) -> Result<String, &'static str> {
    let decoded = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| "Invalid firmware path")?;
    let name = decoded.strip_prefix('/').unwrap_or(&decoded);

    if name.contains('/') || name.contains('\\') {
        return Err("Invalid firmware path");
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return Err("Invalid firmware filename");
    }
    Ok(name.to_string())
}

// ============================================================================
// SERVER LIFECYCLE
// ============================================================================

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The callback server owned by one pairing session
pub struct SetupHttpServer {
    state: CallbackState,
    running: Option<RunningServer>,
}

impl SetupHttpServer {
    pub fn new(broker: BrokerAdvert, firmware_dir: PathBuf) -> Self {
        Self {
            state: CallbackState::new(broker, firmware_dir),
            running: None,
        }
    }

    pub fn state(&self) -> &CallbackState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Bind `0.0.0.0:port` and serve in the background
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, EnvironmentError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| EnvironmentError::from_bind(SERVICE, port, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EnvironmentError::from_bind(SERVICE, port, e))?;

        let app = create_router(self.state.clone());
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });
            if let Err(e) = serve.await {
                warn!("HTTP server error: {}", e);
            }
        });

        info!("HTTP server running on {}", local_addr);
        self.running = Some(RunningServer { local_addr, shutdown, task });
        Ok(local_addr)
    }

    /// Graceful stop with a bounded wait
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        let mut task = running.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("HTTP server did not stop within {:?}, aborting", STOP_TIMEOUT);
            task.abort();
        } else {
            info!("HTTP server on {} stopped", running.local_addr);
        }
    }

    /// True once both callback endpoints were hit, in any order
    pub async fn wait_until_both_endpoints_hit(&self, wait: Duration) -> bool {
        Latch::wait_all(&[&self.state.access_cloud_hit, &self.state.balancer_hit], wait).await
    }

    pub async fn wait_for_firmware_download(&self, wait: Duration) -> bool {
        self.state.firmware_served.wait(wait).await
    }

    pub async fn last_client_ip(&self) -> Option<IpAddr> {
        self.state.last_client_ip().await
    }
}

// ============================================================================
// REMOTE SERVER (REUSE MODE)
// ============================================================================

/// Client for a callback server started by another process
#[derive(Debug, Clone)]
pub struct RemoteCallbackServer {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteCallbackServer {
    pub fn new(port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            client,
        }
    }

    pub async fn status(&self) -> Option<CallbackStatus> {
        let response = self.client.get(format!("{}/status", self.base_url)).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<CallbackStatus>().await.ok()
    }

    pub async fn reset(&self) -> bool {
        match self.client.post(format!("{}/reset", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Reset of callback server failed: {}", e);
                false
            }
        }
    }

    /// Poll `/status` until both endpoints were hit or `wait` elapses
    pub async fn wait_until_both_endpoints_hit(&self, wait: Duration, interval: Duration) -> Option<CallbackStatus> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(status) = self.status().await {
                if status.hit_both_points {
                    return Some(status);
                }
            }
            if tokio::time::Instant::now() + interval > deadline {
                return None;
            }
            tokio::time::sleep(interval).await;
        }
    }
}
