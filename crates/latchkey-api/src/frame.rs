//! Length-prefixed framing over async byte streams
//!
//! Each frame is a big-endian `u32` payload length followed by one encoded
//! message.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::WireMessage;
use crate::error::{CodecError, Result};

/// Largest payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads framed messages from an async reader.
pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next message. Returns `Ok(None)` when the peer closed the
    /// stream cleanly at a frame boundary.
    pub async fn recv<M: WireMessage>(&mut self) -> Result<Option<M>> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        M::from_bytes(Bytes::from(payload)).map(Some)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes framed messages to an async writer.
pub struct MessageWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(256),
        }
    }

    pub async fn send<M: WireMessage>(&mut self, message: &M) -> Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; 4]);
        message.encode(&mut self.buf);

        let len = self.buf.len() - 4;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        self.buf[..4].copy_from_slice(&(len as u32).to_be_bytes());

        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientMessage, ServerMessage};
    use latchkey_common::{LockId, LockLevel, NodeId, SessionId, ThreadId};

    #[tokio::test]
    async fn test_messages_cross_a_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        let hello = ClientMessage::Hello {
            node: NodeId::new(42),
        };
        let request = ClientMessage::LockRequest {
            lock_id: LockId::named("orders"),
            thread: ThreadId::new(1),
            level: LockLevel::Read,
            try_timeout_millis: Some(250),
        };
        writer.send(&hello).await.unwrap();
        writer.send(&request).await.unwrap();
        drop(writer);

        assert_eq!(reader.recv::<ClientMessage>().await.unwrap(), Some(hello));
        assert_eq!(reader.recv::<ClientMessage>().await.unwrap(), Some(request));
        assert_eq!(reader.recv::<ClientMessage>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(server);

        client
            .write_u32((MAX_FRAME_LEN + 1) as u32)
            .await
            .unwrap();
        let err = reader.recv::<ServerMessage>().await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(server);

        client.write_u32(9).await.unwrap();
        client.write_u8(0x81).await.unwrap();
        drop(client);

        let err = reader.recv::<ServerMessage>().await.unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    #[tokio::test]
    async fn test_welcome_frame_layout() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut writer = MessageWriter::new(client);
        writer
            .send(&ServerMessage::Welcome {
                session: SessionId(7),
            })
            .await
            .unwrap();

        let len = server.read_u32().await.unwrap();
        assert_eq!(len, 9);
        assert_eq!(server.read_u8().await.unwrap(), 0x81);
        assert_eq!(server.read_u64().await.unwrap(), 7);
    }
}
