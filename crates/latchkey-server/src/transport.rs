//! TCP transport for the lock server
//!
//! Every connection starts with HELLO and is answered with WELCOME. After the
//! handshake a reader loop feeds client messages into the
//! [`ServerLockManager`] while a writer task drains the session's outbound
//! channel, so lock transitions never wait on a socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use latchkey_api::{ClientMessage, MessageReader, MessageWriter, ServerMessage};
use latchkey_common::{NodeId, SessionId};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::lock::ServerLockManager;
use crate::startup::ShutdownSignal;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// A bound lock server, ready to accept client nodes.
pub struct LockServer {
    listener: TcpListener,
    manager: Arc<ServerLockManager>,
}

impl LockServer {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self {
            listener,
            manager: ServerLockManager::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn manager(&self) -> &Arc<ServerLockManager> {
        &self.manager
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let mut stop = shutdown.subscribe();
        let mut prune = tokio::time::interval(
            self.manager.policy().window.max(MIN_PRUNE_INTERVAL),
        );
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(addr = %self.local_addr()?, "Lock server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(stream, peer, self.manager.clone()));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = prune.tick() => {
                    self.manager.prune_request_windows();
                }
                _ = stop.recv() => {
                    info!("Lock server stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

async fn handshake(reader: &mut MessageReader<OwnedReadHalf>) -> Result<NodeId> {
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.recv::<ClientMessage>())
        .await
        .map_err(|_| ServerError::Handshake("timed out waiting for HELLO".to_string()))??;
    match hello {
        Some(ClientMessage::Hello { node }) => Ok(node),
        Some(other) => Err(ServerError::Handshake(format!(
            "expected HELLO, got {}",
            other.kind()
        ))),
        None => Err(ServerError::Handshake(
            "connection closed before HELLO".to_string(),
        )),
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, manager: Arc<ServerLockManager>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, "Failed to set TCP_NODELAY: {}", e);
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(read_half);

    let node = match handshake(&mut reader).await {
        Ok(node) => node,
        Err(e) => {
            warn!(%peer, "Rejected connection: {}", e);
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let session = manager.connect_node(node, tx);
    let writer = tokio::spawn(write_loop(MessageWriter::new(write_half), rx, node, session));
    debug!(%peer, %node, %session, "Session established");

    loop {
        match reader.recv::<ClientMessage>().await {
            Ok(Some(message)) => manager.handle(node, session, message),
            Ok(None) => {
                info!(%node, %session, "Node closed the connection");
                break;
            }
            Err(e) => {
                error!(%node, %session, "Failed to read from node: {}", e);
                break;
            }
        }
    }

    manager.disconnect_node(node, session);
    writer.abort();
}

async fn write_loop(
    mut writer: MessageWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    node: NodeId,
    session: SessionId,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.send(&message).await {
            error!(%node, %session, "Failed to send {}: {}", message.kind(), e);
            return;
        }
    }
    // The session was replaced or dropped
    let _ = writer.shutdown().await;
}
