//! CDP Relay Bridge (§4.3) — the paired client↔extension router.
//!
//! One [`DeviceActor`] task owns all CDP-semantic state for a single
//! device: its attached clients, its pending-request table, and its
//! current target. Every mutation happens inside that one task's message
//! loop, so the ordering guarantees in §5 (per-transport arrival order,
//! drain-before-synthesize on target switch) fall out of the actor simply
//! processing its inbox one message at a time — no lock is needed for this
//! state at all.
//!
//! [`Relay`] is the handle callers hold: it looks up (or lazily spawns) the
//! actor for a `deviceId` and forwards events into its inbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::registry::{AttachedTarget, DeviceMeta, Registry};
use crate::relay::client::{ClientConnection, State};
use crate::relay::frame::{codes, response_err, response_ok, CdpError, Frame, RawFrame};
use crate::transport::Transport;

enum Event {
    ExtensionRegistered(DeviceMeta, Transport),
    ExtensionFrame(String),
    ExtensionTargetChanged(AttachedTarget),
    ExtensionDisconnected(Transport),
    ClientAttached { connection_id: u64, transport: Transport },
    ClientFrame { connection_id: u64, text: String },
    ClientClosed { connection_id: u64 },
    RequestTimeout(u64),
}

struct PendingEntry {
    client_id: u64,
    original_id: u64,
    /// What to echo back to the client: `None` if the client's own request
    /// carried no `sessionId`, so a sessionless request gets a sessionless
    /// reply (§4.3.3 strip/restore symmetry).
    echo_session_id: Option<String>,
    /// The session this request was actually forwarded under, used to
    /// match pending entries against the target that's being replaced.
    forwarded_session_id: Option<String>,
}

struct DeviceActor {
    device_id: String,
    registry: Arc<Registry>,
    message_timeout: Duration,
    self_tx: mpsc::UnboundedSender<Event>,
    /// Identity of the extension transport currently registered for this
    /// device, so a disconnect event from a transport a reconnect has
    /// already superseded can be told apart from the live one (§4.1).
    extension_witness: Option<Transport>,
    meta: Option<DeviceMeta>,
    target: Option<AttachedTarget>,
    clients: HashMap<u64, ClientConnection>,
    client_transports: HashMap<u64, Transport>,
    pending: HashMap<u64, PendingEntry>,
    next_id: u64,
}

impl DeviceActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = inbox.recv().await {
            match event {
                Event::ExtensionRegistered(meta, transport) => {
                    self.meta = Some(meta);
                    self.extension_witness = Some(transport);
                }
                Event::ExtensionFrame(text) => self.handle_extension_frame(text).await,
                Event::ExtensionTargetChanged(target) => self.handle_target_changed(target).await,
                Event::ExtensionDisconnected(witness) => self.handle_extension_disconnected(witness),
                Event::ClientAttached { connection_id, transport } => {
                    self.client_transports.insert(connection_id, transport);
                    let mut client = ClientConnection::new(connection_id, self.device_id.clone());
                    if let Some(target) = &self.target {
                        client.bind(target.session_id.clone());
                    }
                    self.clients.insert(connection_id, client);
                }
                Event::ClientFrame { connection_id, text } => {
                    self.handle_client_frame(connection_id, text).await
                }
                Event::ClientClosed { connection_id } => {
                    self.clients.remove(&connection_id);
                    self.client_transports.remove(&connection_id);
                    self.pending.retain(|_, p| p.client_id != connection_id);
                }
                Event::RequestTimeout(id) => self.handle_timeout(id),
            }
        }
    }

    async fn handle_client_frame(&mut self, connection_id: u64, text: String) {
        let frame = match Frame::parse(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(device_id = %self.device_id, error = %e, "malformed client frame, dropping");
                return;
            }
        };
        match frame {
            Frame::Request { id, method, params, session_id } => {
                self.handle_client_request(connection_id, id, method, params, session_id).await
            }
            Frame::Response { .. } | Frame::Event { .. } => {
                tracing::debug!(device_id = %self.device_id, "client sent a non-request frame, ignoring");
            }
        }
    }

    async fn handle_client_request(
        &mut self,
        connection_id: u64,
        id: u64,
        method: String,
        params: Option<Value>,
        session_id: Option<String>,
    ) {
        if let Some(reply) = self.synthesize(connection_id, id, &method, &params, session_id.clone()) {
            self.send_to_client(connection_id, reply);
            return;
        }

        let state = match self.clients.get(&connection_id) {
            Some(c) => c.state,
            None => return,
        };

        match state {
            State::Closed => {}
            State::AwaitingTarget => {
                let payload = response_err(id, CdpError::new(codes::NO_TARGET, "no target"), session_id);
                self.send_to_client(connection_id, payload);
            }
            State::Bound => self.forward_to_extension(connection_id, id, method, params, session_id).await,
        }
    }

    fn synthesize(
        &mut self,
        connection_id: u64,
        id: u64,
        method: &str,
        params: &Option<Value>,
        session_id: Option<String>,
    ) -> Option<Value> {
        match method {
            "Browser.getVersion" => {
                let meta = self.meta.clone().unwrap_or_default();
                let product = if meta.name.is_empty() {
                    "Chrome/120.0.0.0".to_string()
                } else {
                    format!("{}/{}", meta.name, meta.version)
                };
                let result = serde_json::json!({
                    "protocolVersion": "1.3",
                    "product": product,
                    "revision": "@unknown",
                    "userAgent": meta.user_agent,
                    "jsVersion": "0",
                });
                Some(response_ok(id, result, session_id))
            }
            "Target.setAutoAttach" => {
                let armed = params
                    .as_ref()
                    .and_then(|p| p.get("autoAttach"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if let Some(client) = self.clients.get_mut(&connection_id) {
                    client.auto_attach_requested = armed;
                }
                Some(response_ok(id, serde_json::json!({}), session_id))
            }
            "Target.getTargets" => {
                let targets: Vec<Value> = self.target.iter().map(|t| t.target_info.clone()).collect();
                Some(response_ok(id, serde_json::json!({ "targetInfos": targets }), session_id))
            }
            "Target.getTargetInfo" => match &self.target {
                Some(target) => Some(response_ok(
                    id,
                    serde_json::json!({ "targetInfo": target.target_info }),
                    session_id,
                )),
                None => Some(response_err(id, CdpError::new(codes::NO_TARGET, "no target"), session_id)),
            },
            "Target.attachToTarget" => match self.target.clone() {
                Some(target) => {
                    if let Some(client) = self.clients.get_mut(&connection_id) {
                        client.bind(target.session_id.clone());
                    }
                    Some(response_ok(id, serde_json::json!({ "sessionId": target.session_id }), session_id))
                }
                None => Some(response_err(id, CdpError::new(codes::NO_TARGET, "no target"), session_id)),
            },
            _ => None,
        }
    }

    async fn forward_to_extension(
        &mut self,
        connection_id: u64,
        original_id: u64,
        method: String,
        params: Option<Value>,
        session_id: Option<String>,
    ) {
        let echo_session = session_id.clone();
        let current_session = self.target.as_ref().map(|t| t.session_id.clone());
        let resolved_session = match session_id {
            None => current_session,
            Some(sid) if Some(sid.clone()) == current_session => Some(sid),
            Some(_) => {
                let payload =
                    response_err(original_id, CdpError::new(codes::UNKNOWN_SESSION, "unknown session"), None);
                self.send_to_client(connection_id, payload);
                return;
            }
        };

        let Some(transport) = self.registry.get_transport(&self.device_id).await else {
            let payload = response_err(
                original_id,
                CdpError::new(codes::DEVICE_DISCONNECTED, "device disconnected"),
                echo_session,
            );
            self.send_to_client(connection_id, payload);
            return;
        };

        let internal_id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            internal_id,
            PendingEntry {
                client_id: connection_id,
                original_id,
                echo_session_id: echo_session,
                forwarded_session_id: resolved_session.clone(),
            },
        );
        if let Some(client) = self.clients.get_mut(&connection_id) {
            client.outstanding.insert(internal_id);
        }

        let outgoing = RawFrame {
            id: Some(internal_id),
            method: Some(method),
            params,
            result: None,
            error: None,
            session_id: resolved_session,
        };
        transport.send_json(&serde_json::to_value(outgoing).expect("RawFrame always serializes"));

        let tx = self.self_tx.clone();
        let timeout = self.message_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Event::RequestTimeout(internal_id));
        });
    }

    fn handle_timeout(&mut self, internal_id: u64) {
        if let Some(entry) = self.pending.remove(&internal_id) {
            if let Some(client) = self.clients.get_mut(&entry.client_id) {
                client.outstanding.remove(&internal_id);
            }
            let payload = response_err(
                entry.original_id,
                CdpError::new(codes::TIMEOUT, "timeout"),
                entry.echo_session_id,
            );
            self.send_to_client(entry.client_id, payload);
        }
    }

    async fn handle_extension_frame(&mut self, text: String) {
        let frame = match Frame::parse(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(device_id = %self.device_id, error = %e, "malformed extension frame, dropping");
                return;
            }
        };
        match frame {
            Frame::Response { id, result, error, session_id: _ } => {
                let Some(entry) = self.pending.remove(&id) else {
                    tracing::debug!(device_id = %self.device_id, id, "dropping late or unknown response");
                    return;
                };
                if let Some(client) = self.clients.get_mut(&entry.client_id) {
                    client.outstanding.remove(&id);
                }
                let raw = RawFrame {
                    id: Some(entry.original_id),
                    method: None,
                    params: None,
                    result,
                    error,
                    session_id: entry.echo_session_id,
                };
                self.send_to_client(entry.client_id, serde_json::to_value(raw).expect("RawFrame always serializes"));
            }
            Frame::Event { method, params, session_id } => {
                let raw = RawFrame {
                    id: None,
                    method: Some(method),
                    params,
                    result: None,
                    error: None,
                    session_id,
                };
                self.broadcast(serde_json::to_value(raw).expect("RawFrame always serializes"));
            }
            Frame::Request { .. } => {
                tracing::debug!(device_id = %self.device_id, "extension sent a request frame, ignoring");
            }
        }
    }

    async fn handle_target_changed(&mut self, new_target: AttachedTarget) {
        let old_session = self.target.as_ref().map(|t| t.session_id.clone());

        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.forwarded_session_id == old_session)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(entry) = self.pending.remove(&id) {
                if let Some(client) = self.clients.get_mut(&entry.client_id) {
                    client.outstanding.remove(&id);
                }
                let payload = response_err(
                    entry.original_id,
                    CdpError::new(codes::TARGET_DETACHED, "target detached"),
                    entry.echo_session_id,
                );
                self.send_to_client(entry.client_id, payload);
            }
        }

        self.target = Some(new_target.clone());
        self.registry.set_target(&self.device_id, Some(new_target.clone())).await;

        let client_ids: Vec<u64> = self.clients.keys().copied().collect();
        for id in &client_ids {
            if let Some(client) = self.clients.get_mut(id) {
                if client.state != State::Closed {
                    client.bind(new_target.session_id.clone());
                }
            }
        }

        let changed = RawFrame {
            id: None,
            method: Some("Target.targetInfoChanged".to_string()),
            params: Some(serde_json::json!({ "targetInfo": new_target.target_info })),
            result: None,
            error: None,
            session_id: None,
        };
        self.broadcast(serde_json::to_value(changed).expect("RawFrame always serializes"));

        for id in client_ids {
            let armed = self.clients.get(&id).map(|c| c.auto_attach_requested).unwrap_or(false);
            if armed {
                let attached = RawFrame {
                    id: None,
                    method: Some("Target.attachedToTarget".to_string()),
                    params: Some(serde_json::json!({
                        "sessionId": new_target.session_id,
                        "targetInfo": new_target.target_info,
                        "waitingForDebugger": false,
                    })),
                    result: None,
                    error: None,
                    session_id: None,
                };
                self.send_to_client(id, serde_json::to_value(attached).expect("RawFrame always serializes"));
            }
        }
    }

    /// Tears down every client bound to this device because its extension
    /// transport closed. `witness` must still identify the transport the
    /// actor currently considers live — a reconnect race (E1's reader
    /// observing E1's own close after E2 has already superseded it) sends
    /// a disconnect for a transport that's no longer current, which must
    /// be ignored rather than tearing down E2's live session (§4.1).
    fn handle_extension_disconnected(&mut self, witness: Transport) {
        match &self.extension_witness {
            Some(current) if current.is_same(&witness) => {}
            _ => {
                tracing::debug!(
                    device_id = %self.device_id,
                    "ignoring disconnect from a superseded extension transport"
                );
                return;
            }
        }

        for (_, entry) in self.pending.drain() {
            let payload = response_err(
                entry.original_id,
                CdpError::new(codes::DEVICE_DISCONNECTED, "device disconnected"),
                entry.echo_session_id,
            );
            if let Some(transport) = self.client_transports.get(&entry.client_id) {
                transport.send_json(&payload);
            }
        }
        for client in self.clients.values_mut() {
            client.close();
        }
        for (_, transport) in self.client_transports.drain() {
            transport.close("device disconnected");
        }
        self.target = None;
        self.meta = None;
        self.extension_witness = None;
    }

    fn send_to_client(&self, connection_id: u64, payload: Value) {
        if let Some(transport) = self.client_transports.get(&connection_id) {
            transport.send_json(&payload);
        }
    }

    fn broadcast(&self, payload: Value) {
        for transport in self.client_transports.values() {
            transport.send_json(&payload);
        }
    }
}

/// Handle shared by every connection task; looks up (or lazily spawns) the
/// per-device actor and forwards events into its inbox.
pub struct Relay {
    registry: Arc<Registry>,
    devices: Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>,
    message_timeout: Duration,
}

impl Relay {
    pub fn new(registry: Arc<Registry>, message_timeout: Duration) -> Arc<Relay> {
        Arc::new(Relay {
            registry,
            devices: Mutex::new(HashMap::new()),
            message_timeout,
        })
    }

    async fn inbox(&self, device_id: &str) -> mpsc::UnboundedSender<Event> {
        let mut devices = self.devices.lock().await;
        if let Some(tx) = devices.get(device_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DeviceActor {
            device_id: device_id.to_string(),
            registry: Arc::clone(&self.registry),
            message_timeout: self.message_timeout,
            self_tx: tx.clone(),
            extension_witness: None,
            meta: None,
            target: None,
            clients: HashMap::new(),
            client_transports: HashMap::new(),
            pending: HashMap::new(),
            next_id: 1,
        };
        tokio::spawn(actor.run(rx));
        devices.insert(device_id.to_string(), tx.clone());
        tx
    }

    pub async fn register_extension(&self, device_id: String, meta: DeviceMeta, transport: Transport) {
        self.registry.register(device_id.clone(), meta.clone(), transport.clone()).await;
        let inbox = self.inbox(&device_id).await;
        let _ = inbox.send(Event::ExtensionRegistered(meta, transport));
    }

    pub async fn extension_frame(&self, device_id: &str, text: String) {
        let inbox = self.inbox(device_id).await;
        let _ = inbox.send(Event::ExtensionFrame(text));
    }

    pub async fn extension_target_changed(&self, device_id: &str, target: AttachedTarget) {
        let inbox = self.inbox(device_id).await;
        let _ = inbox.send(Event::ExtensionTargetChanged(target));
    }

    pub async fn extension_disconnected(&self, device_id: &str, transport: Transport) {
        let inbox = self.inbox(device_id).await;
        let _ = inbox.send(Event::ExtensionDisconnected(transport));
    }

    pub async fn attach_client(&self, device_id: &str, connection_id: u64, transport: Transport) {
        let inbox = self.inbox(device_id).await;
        let _ = inbox.send(Event::ClientAttached { connection_id, transport });
    }

    pub async fn client_frame(&self, device_id: &str, connection_id: u64, text: String) {
        let inbox = self.inbox(device_id).await;
        let _ = inbox.send(Event::ClientFrame { connection_id, text });
    }

    pub async fn client_closed(&self, device_id: &str, connection_id: u64) {
        let inbox = self.inbox(device_id).await;
        let _ = inbox.send(Event::ClientClosed { connection_id });
    }
}
