//! Remote lock manager
//!
//! Network proxy between a node's [`ClientLockManager`] and the lock server:
//! - a writer loop draining the manager's outbound channel onto the socket
//! - a dedicated receive task that feeds server messages into the manager
//! - reconnect with exponential backoff, followed by a full resync

pub mod connection;

use std::sync::{Arc, Weak};
use std::time::Duration;

use latchkey_api::{ClientMessage, MessageReader, ServerMessage};
use latchkey_common::NodeId;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use connection::Connection;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::manager::ClientLockManager;

/// A node's connection to the lock server, owning the background tasks
/// that keep its [`ClientLockManager`] in sync.
pub struct RemoteLockManager {
    manager: Arc<ClientLockManager>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteLockManager {
    /// Connect to the configured server and start the background tasks.
    pub async fn start(config: ClientConfig) -> Result<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(ClientLockManager::from_config(&config, outbound_tx));
        let node = manager.node_id();

        let connection =
            Connection::connect(&config.server_addr, node, config.connect_timeout()).await?;
        info!(
            %node,
            session = %connection.session(),
            server_addr = %config.server_addr,
            "Connected to lock server"
        );
        manager.resync();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gc_task = config.gc_interval().map(|interval| {
            tokio::spawn(run_lock_gc(
                Arc::downgrade(&manager),
                interval,
                shutdown_rx.clone(),
            ))
        });
        let supervisor = tokio::spawn(supervise(
            manager.clone(),
            config,
            connection,
            outbound_rx,
            shutdown_rx,
        ));

        Ok(Self {
            manager,
            shutdown_tx,
            supervisor: Mutex::new(Some(supervisor)),
            gc_task: Mutex::new(gc_task),
        })
    }

    pub fn lock_manager(&self) -> &Arc<ClientLockManager> {
        &self.manager
    }

    pub fn node_id(&self) -> NodeId {
        self.manager.node_id()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Surrender idle leases, deliver the remaining messages and close the
    /// connection.
    pub async fn shutdown(&self) {
        self.manager.shutdown();
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!("Connection supervisor ended abnormally: {}", e);
            }
        }
        info!(node = %self.manager.node_id(), "Remote lock manager shut down");
    }
}

impl Drop for RemoteLockManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Own the connection for its lifetime, reconnecting whenever it drops.
async fn supervise(
    manager: Arc<ClientLockManager>,
    config: ClientConfig,
    mut connection: Connection,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let session = connection.session();
        let (reader, mut writer) = connection.into_split();
        let mut receive = tokio::spawn(receive_loop(manager.clone(), reader));

        let closing = loop {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = writer.send(&message).await {
                            error!(%session, "Failed to send {}: {}", message.kind(), e);
                            break false;
                        }
                    }
                    None => break true,
                },
                _ = &mut receive => {
                    warn!(%session, "Connection to lock server lost");
                    break false;
                }
                _ = shutdown.changed() => break true,
            }
        };

        if closing {
            while let Ok(message) = outbound.try_recv() {
                if writer.send(&message).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
            receive.abort();
            debug!(%session, "Connection closed");
            return;
        }

        receive.abort();
        manager.pause();
        connection = match reconnect(&manager, &config, &mut shutdown).await {
            Some(connection) => connection,
            None => return,
        };
        // Anything queued for the old session is superseded by the resync
        while outbound.try_recv().is_ok() {}
        manager.resync();
    }
}

async fn receive_loop(manager: Arc<ClientLockManager>, mut reader: MessageReader<OwnedReadHalf>) {
    loop {
        match reader.recv::<ServerMessage>().await {
            Ok(Some(message)) => manager.handle_server_message(message),
            Ok(None) => {
                info!("Lock server closed the connection");
                return;
            }
            Err(e) => {
                error!("Failed to read from lock server: {}", e);
                return;
            }
        }
    }
}

async fn reconnect(
    manager: &ClientLockManager,
    config: &ClientConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Connection> {
    let node = manager.node_id();
    let mut attempt: u32 = 0;
    loop {
        let delay = config.backoff(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return None,
        }
        if manager.is_shutdown() {
            return None;
        }

        match Connection::connect(&config.server_addr, node, config.connect_timeout()).await {
            Ok(connection) => {
                info!(
                    %node,
                    attempt,
                    session = %connection.session(),
                    "Reconnected to lock server"
                );
                return Some(connection);
            }
            Err(e) => {
                warn!(%node, attempt, "Reconnect failed: {}", e);
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

async fn run_lock_gc(
    manager: Weak<ClientLockManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let removed = manager.run_lock_gc();
                if removed > 0 {
                    debug!(removed, "Lock GC collected idle entries");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
