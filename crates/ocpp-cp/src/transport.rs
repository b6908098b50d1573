//! # Transport Contract
//!
//! What the message queue needs from whatever carries frames to the central
//! system. Opening, securing and reconnecting the socket live elsewhere.

use ocpp_types::{Call, OcppError, OcppResult};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is being established
    Connecting,
    /// Connection is established and ready
    Connected,
    /// Connection is closed
    Closed,
}

/// Outbound side of the connection to the central system
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Hand a call to the wire. Best effort: a lost frame surfaces later as a timeout.
    async fn send(&self, call: &Call) -> OcppResult<()>;

    /// Get connection state
    fn state(&self) -> ConnectionState;

    /// Whether the queue may drain
    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// In-process transport that forwards every sent call into a channel.
///
/// Used to wire the engine to an external frame writer task, and by tests to
/// observe exactly what reached the wire.
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Call>,
    connected: AtomicBool,
    fail_sends: AtomicBool,
}

impl ChannelTransport {
    /// Create a connected transport and the receiving end of its wire
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Call>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            sender,
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        };
        (transport, receiver)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every subsequent send fail as if the socket broke mid-write
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, call: &Call) -> OcppResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(OcppError::Transport {
                message: "send failed".to_string(),
            });
        }
        debug!("Sending {} ({})", call.kind, call.unique_id);
        self.sender.send(call.clone()).map_err(|_| OcppError::Transport {
            message: "wire receiver dropped".to_string(),
        })
    }

    fn state(&self) -> ConnectionState {
        if self.sender.is_closed() {
            ConnectionState::Closed
        } else if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        }
    }
}
