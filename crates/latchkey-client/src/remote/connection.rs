//! TCP connection lifecycle
//!
//! Establishes a single connection to the lock server and performs the
//! HELLO / WELCOME handshake.

use std::time::Duration;

use latchkey_api::{ClientMessage, MessageReader, MessageWriter, ServerMessage};
use latchkey_common::{NodeId, SessionId};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::error::{ClientError, Result};

/// An established, handshaken connection to the lock server.
pub struct Connection {
    reader: MessageReader<OwnedReadHalf>,
    writer: MessageWriter<OwnedWriteHalf>,
    session: SessionId,
}

impl Connection {
    /// Connect to `server_addr` and introduce this node.
    pub async fn connect(server_addr: &str, node: NodeId, timeout: Duration) -> Result<Self> {
        debug!(server_addr, %node, "Connecting to lock server");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(server_addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);

        writer.send(&ClientMessage::Hello { node }).await?;
        let reply = tokio::time::timeout(timeout, reader.recv::<ServerMessage>())
            .await
            .map_err(|_| ClientError::Timeout)??;

        let session = match reply {
            Some(ServerMessage::Welcome { session }) => session,
            Some(other) => {
                return Err(ClientError::Handshake(format!(
                    "expected WELCOME, got {}",
                    other.kind()
                )));
            }
            None => {
                return Err(ClientError::Handshake(
                    "connection closed during handshake".to_string(),
                ));
            }
        };
        debug!(%node, %session, "Handshake complete");

        Ok(Self {
            reader,
            writer,
            session,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn into_split(self) -> (MessageReader<OwnedReadHalf>, MessageWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}
