//! # TCP Transport
//!
//! Length-delimited frames, one JSON [`Package`] per frame. Every accepted or
//! dialed socket becomes a [`Connection`] with its own read pump and writer
//! task; everything the read pumps see is funnelled into one
//! [`TransportEvent`] channel so the owning instance processes control
//! traffic on a single task.

pub mod connection;
pub mod manager;

pub use connection::{Connection, ConnectionKind, ConnectionStatus};
pub use manager::ConnectionManager;

use crate::error::TransportError;
use futures::{SinkExt, StreamExt};
use mesh_core::codec::decode_package;
use mesh_core::Package;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Type alias for connection identifiers.
///
/// Ids are unique for the lifetime of one [`Transport`].
pub type ConnectionId = usize;

/// What the read pumps report to the owning instance.
#[derive(Debug)]
pub enum TransportEvent {
    Connected { conn: ConnectionId, kind: ConnectionKind },
    Package { conn: ConnectionId, package: Package },
    Disconnected { conn: ConnectionId },
}

/// Sockets, framing and connection bookkeeping for one instance.
#[derive(Debug)]
pub struct Transport {
    connections: Arc<ConnectionManager>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
}

impl Transport {
    /// Creates a transport and the receiver its events arrive on.
    ///
    /// Cancelling `shutdown` stops every listener and connection.
    pub fn new(shutdown: CancellationToken) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connections: Arc::new(ConnectionManager::new()),
            events,
            shutdown,
        });
        (transport, receiver)
    }

    /// Binds `addr` and accepts connections of `kind` until shutdown.
    ///
    /// # Returns
    ///
    /// The bound local address, useful when `addr` asks for port 0.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the address cannot be bound.
    pub async fn listen(self: &Arc<Self>, addr: &str, kind: ConnectionKind) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("✅ Listening for {:?} connections on {}", kind, local);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = transport.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!("🔗 Accepted {:?} connection from {}", kind, remote);
                            transport.spawn_connection(stream, remote, kind);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            break;
                        }
                    }
                }
            }
            debug!("🛑 Listener on {} stopped", local);
        });

        Ok(local)
    }

    /// Dials `addr`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the connection cannot be established.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<Arc<Connection>, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(self.spawn_connection(stream, remote, ConnectionKind::Outbound))
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr, kind: ConnectionKind) -> Arc<Connection> {
        let id = self.connections.next_id();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());
        let (outbound, mut queued) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();

        let conn = Arc::new(Connection::new(id, remote, kind, outbound, cancel.clone()));
        self.connections.add(conn.clone());
        let _ = self.events.send(TransportEvent::Connected { conn: id, kind });

        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => {
                        // Flush what was queued before the close.
                        while let Ok(frame) = queued.try_recv() {
                            if writer.send(frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                    frame = queued.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = writer.send(frame).await {
                                warn!("📤 Write to connection {} failed: {}", id, e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let transport = Arc::clone(self);
        let pump_conn = conn.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = reader.next() => match frame {
                        Some(Ok(bytes)) => match decode_package(&bytes) {
                            Ok(package) => {
                                let _ = transport.events.send(TransportEvent::Package { conn: id, package });
                            }
                            Err(e) => error!("❌ Undecodable frame on connection {}: {}", id, e),
                        },
                        Some(Err(e)) => {
                            warn!("📥 Read from connection {} failed: {}", id, e);
                            break;
                        }
                        None => break,
                    }
                }
            }

            pump_conn.mark_disconnected();
            pump_conn.cancel_token().cancel();
            transport.connections.remove(id);
            debug!("🔌 Connection {} from {} closed", id, pump_conn.remote_addr);
            let _ = transport.events.send(TransportEvent::Disconnected { conn: id });
        });

        conn
    }

    /// Sends `package` on connection `conn`.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownConnection`] or [`TransportError::ConnectionClosed`]
    /// when the connection is gone.
    pub fn send(&self, conn: ConnectionId, package: &Package) -> Result<(), TransportError> {
        self.connections.send(conn, package)
    }

    pub fn connection(&self, conn: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(conn)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Closes one connection; its `Disconnected` event follows.
    pub fn close(&self, conn: ConnectionId) {
        if let Some(connection) = self.connections.get(conn) {
            connection.close();
        }
    }

    /// Stops listeners and closes every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::protocol::Heartbeat;
    use mesh_core::MailBox;
    use tokio::time::{timeout, Duration};

    async fn next_package(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> (ConnectionId, Package) {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
            if let TransportEvent::Package { conn, package } = event {
                return (conn, package);
            }
        }
    }

    #[tokio::test]
    async fn test_packages_cross_a_loopback_connection() {
        let (server, mut server_events) = Transport::new(CancellationToken::new());
        let (client, mut client_events) = Transport::new(CancellationToken::new());

        let addr = server.listen("127.0.0.1:0", ConnectionKind::Peer).await.unwrap();
        let conn = client.connect(&addr.to_string()).await.unwrap();
        assert_eq!(conn.kind, ConnectionKind::Outbound);

        let ping = Package::Ping(Heartbeat {
            sender: MailBox::new("a", "127.0.0.1", 1, 1),
        });
        conn.send(&ping).unwrap();

        let (accepted, received) = next_package(&mut server_events).await;
        assert_eq!(received, ping);

        let pong = Package::Pong(Heartbeat {
            sender: MailBox::new("b", "127.0.0.1", 2, 1),
        });
        server.send(accepted, &pong).unwrap();
        let (_, received) = next_package(&mut client_events).await;
        assert_eq!(received, pong);

        client.close(conn.id);
        loop {
            let event = timeout(Duration::from_secs(5), server_events.recv()).await.unwrap().unwrap();
            if let TransportEvent::Disconnected { conn } = event {
                assert_eq!(conn, accepted);
                break;
            }
        }
        assert!(server.connection(accepted).is_none());
        assert!(matches!(
            server.send(accepted, &pong),
            Err(TransportError::UnknownConnection(_))
        ));
    }
}
