// ============================================================================
// HTTP SERVER INTEGRATION TESTS - Callback endpoints and firmware serving
// ============================================================================

mod common;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower::ServiceExt;

use sengled_tool::http_server::{BrokerAdvert, CallbackStatus, SetupHttpServer};
use sengled_tool::{create_router, CallbackState, EnvironmentError};

use common::{create_test_client, spawn_test_server, test_url};

const ACCESS_CLOUD: &str = "/life2/device/accessCloud.json";
const BALANCER: &str = "/jbalancer/new/bimqtt";

// Send a request line exactly as written, bypassing client-side URL normalisation
async fn raw_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

// ============================================================================
// CALLBACK ENDPOINTS
// ============================================================================

#[tokio::test]
async fn access_cloud_answers_get_and_post() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;
    let client = create_test_client();

    for request in [client.get(test_url(addr, ACCESS_CLOUD)), client.post(test_url(addr, ACCESS_CLOUD))] {
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["messageCode"], "200");
        assert_eq!(body["info"], "OK");
        assert_eq!(body["success"], true);
    }

    assert!(server.state().access_cloud_hit.is_set());
    assert!(!server.state().balancer_hit.is_set());
    server.stop().await;
}

#[tokio::test]
async fn balancer_advertises_broker() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;

    let body: Value = create_test_client()
        .get(test_url(addr, BALANCER))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["protocal"], "mqtt");
    assert_eq!(body["protocol"], "mqtt");
    assert_eq!(body["host"], "192.168.1.10");
    assert_eq!(body["port"], 8883);
    server.stop().await;
}

#[tokio::test]
async fn both_endpoints_in_any_order_complete_the_wait() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;
    let client = create_test_client();

    // Repeated balancer hits are harmless
    client.post(test_url(addr, BALANCER)).send().await.unwrap();
    client.post(test_url(addr, BALANCER)).send().await.unwrap();
    assert!(!server.wait_until_both_endpoints_hit(Duration::from_millis(100)).await);

    client.get(test_url(addr, ACCESS_CLOUD)).send().await.unwrap();
    assert!(server.wait_until_both_endpoints_hit(Duration::from_secs(1)).await);
    assert_eq!(server.last_client_ip().await, Some("127.0.0.1".parse().unwrap()));
    server.stop().await;
}

#[tokio::test]
async fn wait_returns_promptly_when_hit_arrives_later() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let client = create_test_client();
        client.get(test_url(addr, ACCESS_CLOUD)).send().await.unwrap();
        client.get(test_url(addr, BALANCER)).send().await.unwrap();
    });

    let started = std::time::Instant::now();
    assert!(server.wait_until_both_endpoints_hit(Duration::from_secs(10)).await);
    assert!(started.elapsed() < Duration::from_secs(5));
    server.stop().await;
}

#[tokio::test]
async fn caller_address_comes_from_connection() {
    let state = CallbackState::new(
        BrokerAdvert { host: "10.0.0.2".to_string(), port: 8883 },
        PathBuf::from("."),
    );
    let app = create_router(state.clone());

    let mut request = Request::builder().uri(ACCESS_CLOUD).body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 50], 40000))));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.last_client_ip().await, Some("10.0.0.50".parse().unwrap()));
}

#[tokio::test]
async fn status_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;
    let client = create_test_client();

    let status: CallbackStatus = client.get(test_url(addr, "/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status, CallbackStatus { last_client_ip: None, hit_both_points: false });

    client.get(test_url(addr, ACCESS_CLOUD)).send().await.unwrap();
    client.get(test_url(addr, BALANCER)).send().await.unwrap();
    let status: CallbackStatus = client.get(test_url(addr, "/status")).send().await.unwrap().json().await.unwrap();
    assert!(status.hit_both_points);
    assert_eq!(status.last_client_ip, Some("127.0.0.1".parse().unwrap()));

    let response = client.post(test_url(addr, "/reset")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let status: CallbackStatus = client.get(test_url(addr, "/status")).send().await.unwrap().json().await.unwrap();
    assert!(!status.hit_both_points);
    assert_eq!(status.last_client_ip, None);
    server.stop().await;
}

// ============================================================================
// FIRMWARE
// ============================================================================

#[tokio::test]
async fn serves_firmware_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let image: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    std::fs::write(dir.path().join("shim.bin"), &image).unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;

    let response = create_test_client().get(test_url(addr, "/shim.bin")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/octet-stream");
    assert_eq!(response.headers()["content-length"], "4096");
    assert!(response.headers()["content-disposition"].to_str().unwrap().contains("shim.bin"));
    assert_eq!(response.bytes().await.unwrap().as_ref(), image.as_slice());

    assert!(server.wait_for_firmware_download(Duration::from_millis(100)).await);
    assert_eq!(server.state().last_firmware().await.as_deref(), Some("shim.bin"));
    server.stop().await;
}

#[tokio::test]
async fn missing_firmware_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;

    let response = create_test_client().get(test_url(addr, "/missing.bin")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    assert!(!server.state().firmware_served.is_set());
    server.stop().await;
}

#[tokio::test]
async fn traversal_attempts_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;

    let plain = raw_get(addr, "/../../etc/passwd.bin").await;
    assert!(plain.starts_with("HTTP/1.1 400"), "{}", plain);

    let encoded = raw_get(addr, "/%2e%2e%2f%2e%2e%2fetc%2fpasswd.bin").await;
    assert!(encoded.starts_with("HTTP/1.1 400"), "{}", encoded);

    assert!(!server.state().firmware_served.is_set());
    server.stop().await;
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, addr) = spawn_test_server(dir.path()).await;
    let client = create_test_client();

    assert_eq!(client.get(test_url(addr, "/index.html")).send().await.unwrap().status(), 404);
    assert_eq!(client.post(test_url(addr, "/shim.bin")).send().await.unwrap().status(), 404);
    server.stop().await;
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn second_server_on_same_port_reports_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (mut first, addr) = spawn_test_server(dir.path()).await;

    let advert = BrokerAdvert { host: "192.168.1.10".to_string(), port: 8883 };
    let mut second = SetupHttpServer::new(advert, dir.path().to_path_buf());
    let result = second.start(addr.port()).await;
    assert_matches!(result, Err(EnvironmentError::PortInUse { .. }));
    assert!(!second.is_running());

    first.stop().await;
    assert!(!first.is_running());
    assert!(create_test_client().get(test_url(addr, "/status")).send().await.is_err());
}
