//! UDP socket helpers and per-socket traffic counters.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;
use tokio::net::UdpSocket;
use topicbridge_types::BridgeError;

/// Maximum datagram length handled in either direction.
pub const DATAGRAM_CAPACITY: usize = 4096;

/// Snapshot of one socket's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SocketStatus {
    pub connected: bool,
    pub messages: u32,
    pub errors: u32,
}

/// Lock-free counters shared between a pipeline task and the status surface.
#[derive(Debug, Default)]
pub struct SocketStats {
    connected: AtomicBool,
    messages: AtomicU32,
    errors: AtomicU32,
}

impl SocketStats {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the message and error counts; the connected flag is left alone.
    pub fn reset(&self) {
        self.messages.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SocketStatus {
        SocketStatus {
            connected: self.is_connected(),
            messages: self.messages.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Bind a UDP socket on `addr`.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] when the bind fails.
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket, BridgeError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|e| BridgeError::Transport(format!("bind error on {addr}: {e}")))
}

/// Send one datagram to `dest`.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] when the send fails or is truncated.
pub async fn send_datagram(
    socket: &UdpSocket,
    datagram: &[u8],
    dest: SocketAddr,
) -> Result<(), BridgeError> {
    let sent = socket
        .send_to(datagram, dest)
        .await
        .map_err(|e| BridgeError::Transport(format!("send to {dest} failed: {e}")))?;
    if sent != datagram.len() {
        return Err(BridgeError::Transport(format!(
            "short send to {dest}: {sent} of {} bytes",
            datagram.len()
        )));
    }
    Ok(())
}
