//! Remote lock manager tests against a scripted server

use std::time::Duration;

use latchkey_api::{ClientMessage, MessageReader, MessageWriter, ServerMessage};
use latchkey_client::{ClientConfig, ClientLockState, LockId, LockLevel, NodeId, RemoteLockManager};
use latchkey_common::SessionId;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

struct ScriptedPeer {
    reader: MessageReader<OwnedReadHalf>,
    writer: MessageWriter<OwnedWriteHalf>,
}

impl ScriptedPeer {
    async fn accept(listener: &TcpListener, session: u64) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut peer = Self {
            reader: MessageReader::new(read_half),
            writer: MessageWriter::new(write_half),
        };
        let hello = peer.recv().await;
        assert!(matches!(hello, Some(ClientMessage::Hello { .. })));
        peer.send(ServerMessage::Welcome {
            session: SessionId(session),
        })
        .await;
        peer
    }

    async fn recv(&mut self) -> Option<ClientMessage> {
        tokio::time::timeout(Duration::from_secs(5), self.reader.recv::<ClientMessage>())
            .await
            .expect("timed out waiting for client message")
            .unwrap()
    }

    async fn send(&mut self, message: ServerMessage) {
        self.writer.send(&message).await.unwrap();
    }
}

fn config(listener: &TcpListener, node: u64) -> ClientConfig {
    ClientConfig::new(listener.local_addr().unwrap().to_string())
        .with_node_id(NodeId::new(node))
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_gc_interval(Duration::ZERO)
}

// ============== Reconnect Tests ==============

#[tokio::test]
async fn test_reconnect_reannounces_held_locks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (client, mut peer) = tokio::join!(
        RemoteLockManager::start(config(&listener, 5)),
        ScriptedPeer::accept(&listener, 1)
    );
    let client = client.unwrap();
    let manager = client.lock_manager().clone();
    let lock_id = LockId::named("accounts");
    let thread = manager.new_thread_id();

    let task = {
        let manager = manager.clone();
        let lock_id = lock_id.clone();
        tokio::spawn(async move { manager.lock(&lock_id, thread, LockLevel::Write).await })
    };
    let request = peer.recv().await.unwrap();
    assert!(matches!(request, ClientMessage::LockRequest { .. }));
    peer.send(ServerMessage::LockAward {
        lock_id: lock_id.clone(),
        thread,
        level: LockLevel::Write,
        greedy: false,
        epoch: 1,
    })
    .await;
    task.await.unwrap().unwrap();

    drop(peer);
    let mut peer = ScriptedPeer::accept(&listener, 2).await;
    assert_eq!(
        peer.recv().await,
        Some(ClientMessage::LockRequest {
            lock_id: lock_id.clone(),
            thread,
            level: LockLevel::Write,
            try_timeout_millis: None,
        })
    );
    assert!(manager.is_locked_by_thread(&lock_id, thread, LockLevel::Write));

    client.shutdown().await;
}

#[tokio::test]
async fn test_waiter_woken_spuriously_on_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (client, mut peer) = tokio::join!(
        RemoteLockManager::start(config(&listener, 6)),
        ScriptedPeer::accept(&listener, 1)
    );
    let client = client.unwrap();
    let manager = client.lock_manager().clone();
    let lock_id = LockId::Long(17);
    let thread = manager.new_thread_id();

    let task = {
        let manager = manager.clone();
        let lock_id = lock_id.clone();
        tokio::spawn(async move {
            manager.lock(&lock_id, thread, LockLevel::Write).await?;
            manager.wait(&lock_id, thread, None).await
        })
    };
    peer.recv().await.unwrap();
    peer.send(ServerMessage::LockAward {
        lock_id: lock_id.clone(),
        thread,
        level: LockLevel::Write,
        greedy: true,
        epoch: 3,
    })
    .await;
    assert!(matches!(
        peer.recv().await,
        Some(ClientMessage::Wait { .. })
    ));

    drop(peer);
    let mut peer = ScriptedPeer::accept(&listener, 2).await;
    let request = peer.recv().await.unwrap();
    assert!(matches!(
        request,
        ClientMessage::LockRequest {
            level: LockLevel::Write,
            ..
        }
    ));
    peer.send(ServerMessage::LockAward {
        lock_id: lock_id.clone(),
        thread,
        level: LockLevel::Write,
        greedy: false,
        epoch: 4,
    })
    .await;
    task.await.unwrap().unwrap();
    assert_eq!(manager.lock_state(&lock_id), ClientLockState::Held);

    client.shutdown().await;
}

// ============== Shutdown Tests ==============

#[tokio::test]
async fn test_shutdown_surrenders_idle_leases() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (client, mut peer) = tokio::join!(
        RemoteLockManager::start(config(&listener, 7)),
        ScriptedPeer::accept(&listener, 1)
    );
    let client = client.unwrap();
    let manager = client.lock_manager().clone();
    let lock_id = LockId::named("cache");
    let thread = manager.new_thread_id();

    let task = {
        let manager = manager.clone();
        let lock_id = lock_id.clone();
        tokio::spawn(async move { manager.lock(&lock_id, thread, LockLevel::Read).await })
    };
    peer.recv().await.unwrap();
    peer.send(ServerMessage::LockAward {
        lock_id: lock_id.clone(),
        thread,
        level: LockLevel::Read,
        greedy: true,
        epoch: 9,
    })
    .await;
    task.await.unwrap().unwrap();
    manager.unlock(&lock_id, thread, LockLevel::Read).unwrap();
    assert_eq!(manager.lock_state(&lock_id), ClientLockState::Greedy);

    client.shutdown().await;
    match peer.recv().await {
        Some(ClientMessage::Unlock { entries }) => {
            assert_eq!(entries.len(), 1);
            assert!(entries[0].thread.is_node());
            assert_eq!(entries[0].epoch, 9);
        }
        other => panic!("expected lease surrender, got {:?}", other),
    }
    assert_eq!(peer.recv().await, None);
}
