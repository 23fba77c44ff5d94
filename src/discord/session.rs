use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};

/// Where a gateway connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// IDENTIFY has been sent.
    Identified,
    /// HELLO has been processed and the heartbeat is running.
    Connected,
}

/// State shared by the receive loop and the heartbeat of one connection.
///
/// A new `Session` is built for every call to
/// [`GatewayClient::connect`](super::gateway::GatewayClient::connect).
#[derive(Debug)]
pub struct Session {
    state: watch::Sender<ConnectionState>,
    last_sequence: Mutex<Option<u64>>,
    heartbeat_interval: OnceLock<Duration>,
    close: Notify,
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: watch::Sender::new(ConnectionState::Disconnected),
            last_sequence: Mutex::new(None),
            heartbeat_interval: OnceLock::new(),
            close: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// True from the moment IDENTIFY is sent until the connection closes.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Identified | ConnectionState::Connected
        )
    }

    pub async fn last_sequence(&self) -> Option<u64> {
        *self.last_sequence.lock().await
    }

    /// Records a sequence number seen on a dispatch frame. Never moves backwards.
    pub async fn observe_sequence(&self, sequence: u64) {
        let mut last = self.last_sequence.lock().await;
        *last = Some(last.map_or(sequence, |current| current.max(sequence)));
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval.get().copied()
    }

    /// Stores the interval negotiated by HELLO. Returns `false` if one was
    /// already stored, in which case the original is kept.
    pub fn set_heartbeat_interval(&self, interval: Duration) -> bool {
        self.heartbeat_interval.set(interval).is_ok()
    }

    /// Asks the receive loop to close the connection.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    pub(crate) async fn close_requested(&self) {
        self.close.notified().await;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
