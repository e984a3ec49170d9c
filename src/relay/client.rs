//! Per-client CDP connection state (§3 ClientConnection, §4.3.2).

use std::collections::HashSet;

/// Lifecycle of one CDP-client transport bound to a device.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    AwaitingTarget,
    Bound,
    Closed,
}

/// Bookkeeping the bridge keeps per bound client: which `sessionId` it last
/// saw from us, and which outstanding request ids it's still waiting on so
/// a target switch can tell which pending entries belong to it.
pub struct ClientConnection {
    pub connection_id: u64,
    pub device_id: String,
    pub state: State,
    pub last_session_id: Option<String>,
    pub outstanding: HashSet<u64>,
    pub auto_attach_requested: bool,
}

impl ClientConnection {
    pub fn new(connection_id: u64, device_id: String) -> Self {
        ClientConnection {
            connection_id,
            device_id,
            state: State::AwaitingTarget,
            last_session_id: None,
            outstanding: HashSet::new(),
            auto_attach_requested: false,
        }
    }

    pub fn bind(&mut self, session_id: String) {
        self.last_session_id = Some(session_id);
        self.state = State::Bound;
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
        self.outstanding.clear();
    }
}
