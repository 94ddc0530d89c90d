//! Test harness that runs a lock server and several client nodes in one
//! process, talking over loopback TCP.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use latchkey_client::{ClientConfig, ClientLockManager, RemoteLockManager};
use latchkey_common::NodeId;
use latchkey_server::startup::ShutdownSignal;
use latchkey_server::{LockServer, ServerConfig, ServerLockManager};

/// Server config used by [`TestCluster::start`]: quick recall reclaim and no
/// reconnect grace.
pub fn test_server_config() -> ServerConfig {
    ServerConfig::default()
        .with_bind_address("127.0.0.1")
        .with_port(0)
        .with_recall_timeout(Duration::from_secs(2))
        .with_reconnect_window(Duration::ZERO)
}

/// Route client and server logs to the test writer. Safe to call from every
/// test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub struct TestCluster {
    addr: SocketAddr,
    server: Arc<ServerLockManager>,
    shutdown: ShutdownSignal,
    nodes: Vec<RemoteLockManager>,
}

impl TestCluster {
    pub async fn start(nodes: usize) -> anyhow::Result<Self> {
        Self::start_with(test_server_config(), nodes).await
    }

    pub async fn start_with(config: ServerConfig, nodes: usize) -> anyhow::Result<Self> {
        init_test_logging();

        let server = LockServer::bind(&config.with_bind_address("127.0.0.1").with_port(0)).await?;
        let addr = server.local_addr()?;
        let manager = server.manager().clone();
        let shutdown = ShutdownSignal::new();
        tokio::spawn(server.run(shutdown.clone()));

        let mut cluster = Self {
            addr,
            server: manager,
            shutdown,
            nodes: Vec::with_capacity(nodes),
        };
        for _ in 0..nodes {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    /// Connect one more node. Node ids start at 1 and follow join order.
    pub async fn add_node(&mut self) -> anyhow::Result<usize> {
        let index = self.nodes.len();
        let config = ClientConfig::new(self.addr.to_string())
            .with_node_id(NodeId::new(index as u64 + 1))
            .with_request_timeout(Duration::from_secs(5));
        self.nodes.push(RemoteLockManager::start(config).await?);
        Ok(index)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn server(&self) -> &Arc<ServerLockManager> {
        &self.server
    }

    /// The lock manager of node `index`.
    pub fn node(&self, index: usize) -> &Arc<ClientLockManager> {
        self.nodes[index].lock_manager()
    }

    pub fn remote(&self, index: usize) -> &RemoteLockManager {
        &self.nodes[index]
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
        self.shutdown.shutdown();
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it
/// held.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run `future` with a timeout so a lost wakeup fails the test instead of
/// hanging it.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("operation did not finish within {:?}", timeout),
    }
}
