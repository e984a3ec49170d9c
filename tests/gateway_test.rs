//! End-to-end scenarios from the relay's design notes, driven over real
//! sockets against a gateway spawned in-process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use cdp_relay_gateway::config::GatewayConfig;
use cdp_relay_gateway::error::{GatewayError, Result as GatewayResult};
use cdp_relay_gateway::pool::{Launcher, ManagedProcess};
use cdp_relay_gateway::server::Gateway;

struct NullLauncher;

#[async_trait]
impl Launcher for NullLauncher {
    async fn launch(&self, _user_key: &str, _root: &Path) -> GatewayResult<Box<dyn ManagedProcess>> {
        Err(GatewayError::LaunchFailed("no real chrome available in tests".to_string()))
    }
}

async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
}

async fn spawn_gateway(config: GatewayConfig) -> Arc<Gateway> {
    let gateway = Gateway::new(Arc::new(config), Box::new(NullLauncher));
    let running = Arc::clone(&gateway);
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    // Give the listener a moment to bind before the test dials it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    gateway
}

fn base_config(port: u16) -> GatewayConfig {
    GatewayConfig {
        port,
        max_instances: 10,
        instance_timeout: Duration::from_secs(3600),
        inactive_check_interval: Duration::from_secs(3600),
        message_timeout: Duration::from_millis(300),
        token: None,
        cdp_logging: false,
        browser_data_root: std::env::temp_dir(),
    }
}

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(port: u16, path: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}{path}")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    recv_timeout(ws, Duration::from_secs(2)).await
}

async fn recv_timeout(ws: &mut Ws, dur: Duration) -> Value {
    let msg = timeout(dur, ws.next()).await.expect("timed out waiting for frame").unwrap().unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

async fn register_device(port: u16, device_id: &str, name: &str, version: &str, user_agent: &str) -> Ws {
    let mut ext = connect(port, "/extension").await;
    send(
        &mut ext,
        json!({
            "type": "device:register",
            "data": {
                "deviceId": device_id,
                "deviceInfo": { "name": name, "version": version, "userAgent": user_agent }
            }
        }),
    )
    .await;
    ext
}

async fn attach_target(ext: &mut Ws, target_id: &str, session_id: &str) {
    send(
        ext,
        json!({
            "type": "device:target",
            "data": {
                "targetId": target_id,
                "sessionId": session_id,
                "targetInfo": { "targetId": target_id, "type": "page", "url": "about:blank" }
            }
        }),
    )
    .await;
}

#[tokio::test]
async fn register_then_use_synthesizes_browser_get_version() {
    let port = free_port().await;
    spawn_gateway(base_config(port)).await;

    let _ext = register_device(port, "dev-A", "Chromium", "120", "Mozilla/5.0").await;
    let mut client = connect(port, "/cdp?deviceId=dev-A").await;

    send(&mut client, json!({"id": 1, "method": "Browser.getVersion"})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["product"], "Chromium/120");
    assert_eq!(reply["result"]["userAgent"], "Mozilla/5.0");
}

#[tokio::test]
async fn forwarded_call_rewrites_id_and_session() {
    let port = free_port().await;
    spawn_gateway(base_config(port)).await;

    let mut ext = register_device(port, "dev-B", "Chromium", "120", "UA").await;
    attach_target(&mut ext, "T1", "S1").await;

    let mut client = connect(port, "/cdp?deviceId=dev-B").await;
    send(
        &mut client,
        json!({"id": 7, "method": "Page.navigate", "params": {"url": "https://example.com"}}),
    )
    .await;

    let seen = recv(&mut ext).await;
    assert_eq!(seen["method"], "Page.navigate");
    assert_eq!(seen["sessionId"], "S1");
    let internal_id = seen["id"].as_u64().unwrap();
    assert_ne!(internal_id, 7);

    send(&mut ext, json!({"id": internal_id, "result": {"frameId": "F1"}})).await;

    let reply = recv(&mut client).await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"]["frameId"], "F1");
}

#[tokio::test]
async fn reconnect_closes_previous_extension_without_dropping_device() {
    let port = free_port().await;
    spawn_gateway(base_config(port)).await;

    let mut first = register_device(port, "dev-C", "Chromium", "120", "UA").await;
    let _second = register_device(port, "dev-C", "Chromium", "121", "UA2").await;

    let closed = timeout(Duration::from_secs(2), first.next()).await.unwrap();
    match closed {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(&*frame.reason, "New connection established");
        }
        Some(Ok(Message::Close(None))) => {}
        other => panic!("expected a close frame, got {other:?}"),
    }

    let mut client = connect(port, "/cdp?deviceId=dev-C").await;
    send(&mut client, json!({"id": 1, "method": "Browser.getVersion"})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["result"]["product"], "Chromium/121");
}

#[tokio::test]
async fn legacy_launch_rejects_missing_starting_url_before_handshake() {
    let port = free_port().await;
    spawn_gateway(base_config(port)).await;

    let err = connect_async(format!("ws://127.0.0.1:{port}/launch")).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn cdp_without_device_id_rejected_with_400() {
    let port = free_port().await;
    spawn_gateway(base_config(port)).await;

    let err = connect_async(format!("ws://127.0.0.1:{port}/cdp")).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn target_reload_drains_pending_and_emits_synthetic_events() {
    let port = free_port().await;
    spawn_gateway(base_config(port)).await;

    let mut ext = register_device(port, "dev-D", "Chromium", "120", "UA").await;
    attach_target(&mut ext, "T1", "S1").await;

    let mut client = connect(port, "/cdp?deviceId=dev-D").await;
    send(&mut client, json!({"id": 9, "method": "Page.reload"})).await;
    let _seen = recv(&mut ext).await;

    attach_target(&mut ext, "T2", "S2").await;

    let detached = recv(&mut client).await;
    assert_eq!(detached["id"], 9);
    assert_eq!(detached["error"]["code"], -32004);

    let changed = recv(&mut client).await;
    assert_eq!(changed["method"], "Target.targetInfoChanged");
    assert_eq!(changed["params"]["targetInfo"]["targetId"], "T2");
}

#[tokio::test]
async fn pending_request_times_out_and_late_response_is_dropped() {
    let port = free_port().await;
    spawn_gateway(base_config(port)).await;

    let mut ext = register_device(port, "dev-E", "Chromium", "120", "UA").await;
    attach_target(&mut ext, "T1", "S1").await;

    let mut client = connect(port, "/cdp?deviceId=dev-E").await;
    send(&mut client, json!({"id": 3, "method": "Page.navigate", "params": {"url": "https://x"}})).await;
    let seen = recv(&mut ext).await;
    let internal_id = seen["id"].as_u64().unwrap();

    let timeout_reply = recv_timeout(&mut client, Duration::from_secs(2)).await;
    assert_eq!(timeout_reply["id"], 3);
    assert_eq!(timeout_reply["error"]["code"], -32002);

    // Late response from the extension must not resurrect the client's
    // already-timed-out request.
    send(&mut ext, json!({"id": internal_id, "result": {"frameId": "late"}})).await;
    let late = timeout(Duration::from_millis(200), client.next()).await;
    assert!(late.is_err(), "client should not receive anything else");
}
