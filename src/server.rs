//! Top-level accept loop (component E/F): binds the listening socket, runs
//! the Upgrade Dispatcher against each incoming handshake, and wires the
//! accepted transport into the registry/relay/pool according to the
//! resolved route.
//!
//! Each accepted connection is driven by its own `tokio::spawn`ed task, so a
//! panic or protocol error in one connection cannot take the accept loop
//! down with it (§7).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::config::GatewayConfig;
use crate::dispatcher::{Dispatcher, Route};
use crate::error::{GatewayError, Result};
use crate::pool::{ChromePool, Launcher, PoolConfig};
use crate::registry::{AttachedTarget, DeviceMeta, Registry};
use crate::relay::Relay;
use crate::transport;

const EXTENSION_REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Arc<Registry>,
    pool: Arc<ChromePool>,
    relay: Arc<Relay>,
    dispatcher: Dispatcher,
    next_connection_id: AtomicU64,
}

impl Gateway {
    pub fn new(config: Arc<GatewayConfig>, launcher: Box<dyn Launcher>) -> Arc<Gateway> {
        let registry = Registry::new();
        let pool_config = PoolConfig {
            max_instances: config.max_instances,
            instance_timeout: config.instance_timeout,
            inactive_check_interval: config.inactive_check_interval,
            browser_data_root: config.browser_data_root.clone(),
        };
        let pool = ChromePool::new(launcher, pool_config);
        let relay = Relay::new(Arc::clone(&registry), config.message_timeout);
        let dispatcher = Dispatcher::new(config.token.clone());
        Arc::new(Gateway {
            config,
            registry,
            pool,
            relay,
            dispatcher,
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        tracing::info!(port = self.config.port, "gateway listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream).await {
                    tracing::debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Closes every live device and legacy instance and returns once done,
    /// or after the 10 s hard-exit budget elapses (§5).
    pub async fn shutdown(&self) {
        let teardown = async {
            tokio::join!(self.registry.shutdown(), self.pool.shutdown());
        };
        if tokio::time::timeout(Duration::from_secs(10), teardown).await.is_err() {
            tracing::warn!("shutdown exceeded 10s budget, exiting anyway");
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let dispatcher = &self.dispatcher;
        let pool = &self.pool;
        let mut route_result: Option<Result<Route>> = None;

        let callback = |req: &Request, response: Response| {
            let target = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            match dispatcher.route(target) {
                Ok(Route::LegacyLaunch { starting_url, launch }) => {
                    let has_capacity = match &launch.user {
                        Some(user_key) => pool.try_has_capacity(user_key),
                        None => pool.try_has_capacity_for_new(),
                    };
                    if !has_capacity {
                        let e = GatewayError::AtCapacity;
                        let status = e.http_status();
                        let body = format!("{{\"error\":\"{e}\"}}");
                        route_result = Some(Err(e));
                        return Err(Response::builder()
                            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
                            .body(Some(body))
                            .expect("static response always builds"));
                    }
                    route_result = Some(Ok(Route::LegacyLaunch { starting_url, launch }));
                    Ok(response)
                }
                Ok(route) => {
                    route_result = Some(Ok(route));
                    Ok(response)
                }
                Err(e) => {
                    let status = e.http_status();
                    let body = format!("{{\"error\":\"{e}\"}}");
                    route_result = Some(Err(e));
                    let rejection = Response::builder()
                        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
                        .body(Some(body))
                        .expect("static response always builds");
                    Err(rejection)
                }
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(_) => return Ok(()),
        };

        match route_result {
            Some(Ok(Route::Extension)) => self.handle_extension(ws).await,
            Some(Ok(Route::Cdp { device_id })) => self.handle_cdp_client(ws, device_id).await,
            Some(Ok(Route::LegacyLaunch { starting_url, launch })) => {
                self.handle_legacy(ws, starting_url, launch).await
            }
            Some(Err(e)) => Err(e),
            None => Err(GatewayError::Other("handshake callback never ran".to_string())),
        }
    }

    async fn handle_extension(self: Arc<Self>, ws: tokio_tungstenite::WebSocketStream<TcpStream>) -> Result<()> {
        let (transport, mut inbound) = transport::spawn(ws);

        let first = tokio::time::timeout(EXTENSION_REGISTER_TIMEOUT, inbound.recv()).await;
        let Ok(Some(text)) = first else {
            transport.close("registration timeout");
            return Ok(());
        };

        let device_id = match parse_register(&text) {
            Some((device_id, meta)) => {
                self.relay.register_extension(device_id.clone(), meta, transport.clone()).await;
                device_id
            }
            None => {
                transport.close("expected device:register");
                return Ok(());
            }
        };

        while let Some(text) = inbound.recv().await {
            // lastSeen is updated on any inbound frame, not just explicit
            // heartbeats (§3 Device) — a device that's only ever relaying
            // CDP traffic must not be reaped for "silence".
            self.registry.heartbeat(&device_id).await;

            if let Some(control) = parse_control(&text) {
                match control {
                    Control::Heartbeat => {
                        transport.send_text(r#"{"type":"device:heartbeat:ack"}"#.to_string());
                    }
                    Control::Target(target) => {
                        self.relay.extension_target_changed(&device_id, target).await;
                    }
                    Control::Register(_, _) => {}
                }
                continue;
            }
            self.relay.extension_frame(&device_id, text).await;
        }

        self.relay.extension_disconnected(&device_id, transport.clone()).await;
        let _ = self.registry.unregister(&device_id, &transport).await;
        Ok(())
    }

    async fn handle_cdp_client(
        self: Arc<Self>,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        device_id: String,
    ) -> Result<()> {
        let (transport, mut inbound) = transport::spawn(ws);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        self.relay.attach_client(&device_id, connection_id, transport).await;

        while let Some(text) = inbound.recv().await {
            self.relay.client_frame(&device_id, connection_id, text).await;
        }

        self.relay.client_closed(&device_id, connection_id).await;
        Ok(())
    }

    async fn handle_legacy(
        self: Arc<Self>,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        _starting_url: String,
        launch: crate::dispatcher::LaunchOptions,
    ) -> Result<()> {
        // A keyed launch reuses a persistent, idle-evicted instance; an
        // anonymous launch gets its own ephemeral instance that's never
        // reused and is torn down as soon as this connection ends (§4.2).
        let (ephemeral_key, port) = match &launch.user {
            Some(user_key) => (None, self.pool.acquire(user_key).await?),
            None => {
                let (key, port) = self.pool.acquire_ephemeral().await?;
                (Some(key), port)
            }
        };

        let (mut client_sink, mut client_stream) = ws.split();
        let upstream_url = format!("ws://127.0.0.1:{port}/devtools/browser");
        let (upstream, _) = tokio_tungstenite::connect_async(upstream_url).await?;
        let (mut upstream_sink, mut upstream_stream) = upstream.split();

        let client_to_upstream = async {
            while let Some(Ok(msg)) = client_stream.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
                if upstream_sink.send(msg).await.is_err() {
                    break;
                }
            }
        };
        let upstream_to_client = async {
            while let Some(Ok(msg)) = upstream_stream.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
                if client_sink.send(msg).await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = client_to_upstream => {}
            _ = upstream_to_client => {}
        }
        match &ephemeral_key {
            Some(key) => self.pool.kill(key).await,
            None => self.pool.touch(launch.user.as_deref().expect("keyed launch always has a user")).await,
        }
        Ok(())
    }
}

enum Control {
    Register(String, DeviceMeta),
    Heartbeat,
    Target(AttachedTarget),
}

fn parse_control(text: &str) -> Option<Control> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    match kind {
        "device:register" => {
            let (device_id, meta) = parse_register(text)?;
            Some(Control::Register(device_id, meta))
        }
        "device:heartbeat" => Some(Control::Heartbeat),
        "device:target" => {
            let data = value.get("data")?;
            let target_id = data.get("targetId")?.as_str()?.to_string();
            let session_id = data.get("sessionId")?.as_str()?.to_string();
            let target_info = data.get("targetInfo").cloned().unwrap_or(serde_json::json!({}));
            Some(Control::Target(AttachedTarget { target_id, session_id, target_info }))
        }
        _ => None,
    }
}

fn parse_register(text: &str) -> Option<(String, DeviceMeta)> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "device:register" {
        return None;
    }
    let data = value.get("data")?;
    let device_id = data.get("deviceId")?.as_str()?.to_string();
    let device_info = data.get("deviceInfo");
    let meta = DeviceMeta {
        name: device_info.and_then(|d| d.get("name")).and_then(|v| v.as_str()).unwrap_or("Chrome").to_string(),
        version: device_info.and_then(|d| d.get("version")).and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
        user_agent: device_info.and_then(|d| d.get("userAgent")).and_then(|v| v.as_str()).unwrap_or("").to_string(),
    };
    Some((device_id, meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_frame() {
        let text = r#"{"type":"device:register","data":{"deviceId":"dev-A","deviceInfo":{"name":"Chromium","version":"120","userAgent":"UA/1"}}}"#;
        let (device_id, meta) = parse_register(text).unwrap();
        assert_eq!(device_id, "dev-A");
        assert_eq!(meta.name, "Chromium");
        assert_eq!(meta.version, "120");
    }

    #[test]
    fn parses_heartbeat_control() {
        let text = r#"{"type":"device:heartbeat"}"#;
        assert!(matches!(parse_control(text), Some(Control::Heartbeat)));
    }

    #[test]
    fn non_control_frame_returns_none() {
        let text = r#"{"id":1,"method":"Browser.getVersion"}"#;
        assert!(parse_control(text).is_none());
    }
}
