//! A single framed connection.

use super::ConnectionId;
use crate::error::TransportError;
use bytes::Bytes;
use mesh_core::codec::encode_package;
use mesh_core::{MailBox, Package};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a connection. There is no way back from `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// How a connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Accepted on the instance-to-instance port
    Peer,
    /// Accepted on a gate's client port
    Client,
    /// Dialed by this instance
    Outbound,
}

/// Represents one live TCP connection.
///
/// Writes are queued to a dedicated writer task, so [`Connection::send`]
/// never blocks. Closing cancels the connection's token, which stops the
/// read pump mid-read.
#[derive(Debug)]
pub struct Connection {
    /// Process-unique connection id
    pub id: ConnectionId,

    /// The remote network address
    pub remote_addr: SocketAddr,

    /// Who opened the connection
    pub kind: ConnectionKind,

    /// When this connection was established
    pub connected_at: SystemTime,

    open: AtomicBool,
    peer: Mutex<Option<MailBox>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        kind: ConnectionKind,
        outbound: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_addr,
            kind,
            connected_at: SystemTime::now(),
            open: AtomicBool::new(true),
            peer: Mutex::new(None),
            outbound,
            cancel,
        }
    }

    /// Queues `package` for sending.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectionClosed`] once the connection is down
    /// - [`TransportError::Codec`] if the package cannot be serialized
    pub fn send(&self, package: &Package) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        let frame = encode_package(package)?;
        self.outbound
            .send(Bytes::from(frame))
            .map_err(|_| TransportError::ConnectionClosed(self.id))
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.open.load(Ordering::Acquire) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Marks the connection down and aborts its read and write pumps.
    pub fn close(&self) {
        self.mark_disconnected();
        self.cancel.cancel();
    }

    pub(crate) fn mark_disconnected(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mailbox the remote side announced in its handshake, if any.
    pub fn peer(&self) -> Option<MailBox> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_peer(&self, mailbox: MailBox) {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(mailbox);
    }
}
