//! Binary encoding of protocol messages
//!
//! Layout: a one-byte message tag followed by the message fields. Integers
//! are big-endian; strings are a `u32` length followed by UTF-8 bytes; lock
//! ids are a one-byte type tag followed by the variant payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use latchkey_common::{LockId, LockLevel, NodeId, RejectReason, SessionId, ThreadId};

use crate::error::{CodecError, Result};
use crate::message::{ClientMessage, HolderInfo, ServerMessage, UnlockEntry};

const TAG_HELLO: u8 = 0x01;
const TAG_LOCK_REQUEST: u8 = 0x02;
const TAG_UNLOCK: u8 = 0x03;
const TAG_WAIT: u8 = 0x04;
const TAG_NOTIFY: u8 = 0x05;
const TAG_QUERY: u8 = 0x06;
const TAG_INTERRUPT: u8 = 0x07;

const TAG_WELCOME: u8 = 0x81;
const TAG_LOCK_AWARD: u8 = 0x82;
const TAG_LOCK_REJECT: u8 = 0x83;
const TAG_LOCK_RECALL: u8 = 0x84;
const TAG_NOTIFIED: u8 = 0x85;
const TAG_QUERY_RESPONSE: u8 = 0x86;

// Caps preallocation when a length prefix is corrupt.
const MAX_PREALLOC: usize = 1024;

/// A message that can be written to and read from the wire.
pub trait WireMessage: Sized {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut Bytes) -> Result<Self>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a complete frame, rejecting trailing garbage.
    fn from_bytes(mut bytes: Bytes) -> Result<Self> {
        let message = Self::decode(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(CodecError::TrailingBytes(bytes.remaining()));
        }
        Ok(message)
    }
}

impl WireMessage for ClientMessage {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ClientMessage::Hello { node } => {
                buf.put_u8(TAG_HELLO);
                buf.put_u64(node.as_u64());
            }
            ClientMessage::LockRequest {
                lock_id,
                thread,
                level,
                try_timeout_millis,
            } => {
                buf.put_u8(TAG_LOCK_REQUEST);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
                buf.put_u8(level.ordinal());
                match try_timeout_millis {
                    Some(millis) => {
                        buf.put_u8(1);
                        buf.put_u64(*millis);
                    }
                    None => buf.put_u8(0),
                }
            }
            ClientMessage::Unlock { entries } => {
                buf.put_u8(TAG_UNLOCK);
                buf.put_u32(entries.len() as u32);
                for entry in entries {
                    put_lock_id(buf, &entry.lock_id);
                    buf.put_u64(entry.thread.as_u64());
                    buf.put_u8(entry.level.ordinal());
                    buf.put_u64(entry.epoch);
                }
            }
            ClientMessage::Wait {
                lock_id,
                thread,
                timeout_millis,
            } => {
                buf.put_u8(TAG_WAIT);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
                buf.put_u64(*timeout_millis);
            }
            ClientMessage::Notify {
                lock_id,
                thread,
                all,
            } => {
                buf.put_u8(TAG_NOTIFY);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
                buf.put_u8(u8::from(*all));
            }
            ClientMessage::Query { lock_id, thread } => {
                buf.put_u8(TAG_QUERY);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
            }
            ClientMessage::Interrupt { lock_id, thread } => {
                buf.put_u8(TAG_INTERRUPT);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let tag = get_u8(buf)?;
        let message = match tag {
            TAG_HELLO => ClientMessage::Hello {
                node: NodeId::new(get_u64(buf)?),
            },
            TAG_LOCK_REQUEST => {
                let lock_id = get_lock_id(buf)?;
                let thread = ThreadId::new(get_u64(buf)?);
                let level = get_level(buf)?;
                let try_timeout_millis = if get_bool(buf)? {
                    Some(get_u64(buf)?)
                } else {
                    None
                };
                ClientMessage::LockRequest {
                    lock_id,
                    thread,
                    level,
                    try_timeout_millis,
                }
            }
            TAG_UNLOCK => {
                let count = get_u32(buf)? as usize;
                let mut entries = Vec::with_capacity(count.min(MAX_PREALLOC));
                for _ in 0..count {
                    entries.push(UnlockEntry {
                        lock_id: get_lock_id(buf)?,
                        thread: ThreadId::new(get_u64(buf)?),
                        level: get_level(buf)?,
                        epoch: get_u64(buf)?,
                    });
                }
                ClientMessage::Unlock { entries }
            }
            TAG_WAIT => ClientMessage::Wait {
                lock_id: get_lock_id(buf)?,
                thread: ThreadId::new(get_u64(buf)?),
                timeout_millis: get_u64(buf)?,
            },
            TAG_NOTIFY => ClientMessage::Notify {
                lock_id: get_lock_id(buf)?,
                thread: ThreadId::new(get_u64(buf)?),
                all: get_bool(buf)?,
            },
            TAG_QUERY => ClientMessage::Query {
                lock_id: get_lock_id(buf)?,
                thread: ThreadId::new(get_u64(buf)?),
            },
            TAG_INTERRUPT => ClientMessage::Interrupt {
                lock_id: get_lock_id(buf)?,
                thread: ThreadId::new(get_u64(buf)?),
            },
            other => return Err(CodecError::UnknownMessageTag(other)),
        };
        Ok(message)
    }
}

impl WireMessage for ServerMessage {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ServerMessage::Welcome { session } => {
                buf.put_u8(TAG_WELCOME);
                buf.put_u64(session.0);
            }
            ServerMessage::LockAward {
                lock_id,
                thread,
                level,
                greedy,
                epoch,
            } => {
                buf.put_u8(TAG_LOCK_AWARD);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
                buf.put_u8(level.ordinal());
                buf.put_u8(u8::from(*greedy));
                buf.put_u64(*epoch);
            }
            ServerMessage::LockReject {
                lock_id,
                thread,
                reason,
            } => {
                buf.put_u8(TAG_LOCK_REJECT);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
                put_reason(buf, *reason);
            }
            ServerMessage::LockRecall { lock_id, epoch } => {
                buf.put_u8(TAG_LOCK_RECALL);
                put_lock_id(buf, lock_id);
                buf.put_u64(*epoch);
            }
            ServerMessage::Notified {
                lock_id,
                thread,
                reacquire_pending,
            } => {
                buf.put_u8(TAG_NOTIFIED);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
                buf.put_u8(u8::from(*reacquire_pending));
            }
            ServerMessage::QueryResponse {
                lock_id,
                thread,
                holders,
                pending,
                waiters,
            } => {
                buf.put_u8(TAG_QUERY_RESPONSE);
                put_lock_id(buf, lock_id);
                buf.put_u64(thread.as_u64());
                buf.put_u32(holders.len() as u32);
                for holder in holders {
                    buf.put_u64(holder.node.as_u64());
                    buf.put_u64(holder.thread.as_u64());
                    buf.put_u8(holder.level.ordinal());
                }
                buf.put_u32(*pending);
                buf.put_u32(*waiters);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let tag = get_u8(buf)?;
        let message = match tag {
            TAG_WELCOME => ServerMessage::Welcome {
                session: SessionId(get_u64(buf)?),
            },
            TAG_LOCK_AWARD => ServerMessage::LockAward {
                lock_id: get_lock_id(buf)?,
                thread: ThreadId::new(get_u64(buf)?),
                level: get_level(buf)?,
                greedy: get_bool(buf)?,
                epoch: get_u64(buf)?,
            },
            TAG_LOCK_REJECT => ServerMessage::LockReject {
                lock_id: get_lock_id(buf)?,
                thread: ThreadId::new(get_u64(buf)?),
                reason: get_reason(buf)?,
            },
            TAG_LOCK_RECALL => ServerMessage::LockRecall {
                lock_id: get_lock_id(buf)?,
                epoch: get_u64(buf)?,
            },
            TAG_NOTIFIED => ServerMessage::Notified {
                lock_id: get_lock_id(buf)?,
                thread: ThreadId::new(get_u64(buf)?),
                reacquire_pending: get_bool(buf)?,
            },
            TAG_QUERY_RESPONSE => {
                let lock_id = get_lock_id(buf)?;
                let thread = ThreadId::new(get_u64(buf)?);
                let count = get_u32(buf)? as usize;
                let mut holders = Vec::with_capacity(count.min(MAX_PREALLOC));
                for _ in 0..count {
                    holders.push(HolderInfo {
                        node: NodeId::new(get_u64(buf)?),
                        thread: ThreadId::new(get_u64(buf)?),
                        level: get_level(buf)?,
                    });
                }
                ServerMessage::QueryResponse {
                    lock_id,
                    thread,
                    holders,
                    pending: get_u32(buf)?,
                    waiters: get_u32(buf)?,
                }
            }
            other => return Err(CodecError::UnknownMessageTag(other)),
        };
        Ok(message)
    }
}

fn need(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

fn put_lock_id(buf: &mut BytesMut, lock_id: &LockId) {
    buf.put_u8(lock_id.type_tag());
    match lock_id {
        LockId::Named(name) => put_string(buf, name),
        LockId::Long(value) => buf.put_i64(*value),
        LockId::Literal(value) => put_string(buf, value),
        LockId::Object(id) => buf.put_u64(*id),
    }
}

fn get_lock_id(buf: &mut Bytes) -> Result<LockId> {
    let tag = get_u8(buf)?;
    match tag {
        LockId::TAG_NAMED => Ok(LockId::Named(get_string(buf)?)),
        LockId::TAG_LONG => Ok(LockId::Long(get_i64(buf)?)),
        LockId::TAG_LITERAL => Ok(LockId::Literal(get_string(buf)?)),
        LockId::TAG_OBJECT => Ok(LockId::Object(get_u64(buf)?)),
        other => Err(CodecError::UnknownLockIdTag(other)),
    }
}

fn get_level(buf: &mut Bytes) -> Result<LockLevel> {
    let ordinal = get_u8(buf)?;
    LockLevel::from_ordinal(ordinal).ok_or(CodecError::UnknownLevel(ordinal))
}

fn put_reason(buf: &mut BytesMut, reason: RejectReason) {
    buf.put_u8(reason.code());
    if let RejectReason::StaleEpoch(epoch) = reason {
        buf.put_u64(epoch);
    }
}

fn get_reason(buf: &mut Bytes) -> Result<RejectReason> {
    match get_u8(buf)? {
        1 => Ok(RejectReason::Unavailable),
        2 => Ok(RejectReason::TimedOut),
        3 => Ok(RejectReason::StaleEpoch(get_u64(buf)?)),
        4 => Ok(RejectReason::IllegalMonitorState),
        other => Err(CodecError::UnknownRejectReason(other)),
    }
}
