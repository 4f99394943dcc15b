//! Wire framing for the tunnel link: the seven command frames and the
//! obfuscation applied to their variable-length fields.
//!
//! All functions here are pure and stateless — packing takes a `Frame` and
//! returns `Bytes`, parsing takes a byte slice and returns a `Frame` plus the
//! number of bytes consumed. Neither side touches a socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Maximum length of the `Link` client string and the `Connect` hostport
/// string (exclusive upper bound — both are one-byte-length-prefixed).
pub const MAX_STRING_LEN: usize = 127;

/// Maximum `Data` payload length (exclusive upper bound — payload length is
/// carried as a 16-bit big-endian field but the protocol never uses the top
/// half of that range).
pub const MAX_DATA_LEN: usize = 32767;

const TAG_LINK: u8 = 0;
const TAG_KEEPALIVE: u8 = 1;
const TAG_CONNECT: u8 = 2;
const TAG_CONNECT_ACK: u8 = 3;
const TAG_DISCONNECT: u8 = 4;
const TAG_DATA: u8 = 5;
const TAG_DATA_ACK: u8 = 6;

/// One of the seven frames carried over the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Link { client: String },
    Keepalive,
    Connect { conn_id: u8, hostport: String },
    ConnectAck { conn_id: u8, ok: bool },
    Disconnect { conn_id: u8 },
    Data { conn_id: u8, seq: u8, payload: Bytes },
    DataAck { conn_id: u8, seq: u8, datalen: u16 },
}

impl Frame {
    /// The stream this frame is addressed to, if any. `Link` and
    /// `Keepalive` are link-level and have no `conn_id`.
    pub fn conn_id(&self) -> Option<u8> {
        match self {
            Frame::Link { .. } | Frame::Keepalive => None,
            Frame::Connect { conn_id, .. }
            | Frame::ConnectAck { conn_id, .. }
            | Frame::Disconnect { conn_id }
            | Frame::Data { conn_id, .. }
            | Frame::DataAck { conn_id, .. } => Some(*conn_id),
        }
    }
}

/// Errors from [`Frame::parse`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not yet hold a complete frame. Not fatal: the caller
    /// should read more bytes and retry.
    #[error("incomplete frame")]
    Incomplete,

    /// The buffer holds a frame whose declared shape can never be valid
    /// (unknown tag, oversized length). Fatal to the link.
    #[error("invalid frame: {reason}")]
    Invalid { reason: &'static str },
}

/// XOR-0xAA is applied to the `Link` client string, the `Connect` hostport
/// string, and the `Data` payload. It is a framing convenience against
/// incidental middlebox inspection, not encryption, and is self-inverse.
fn obfuscate(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b ^= 0xAA;
    }
}

fn pack_string(buf: &mut BytesMut, s: &str) {
    let mut bytes = s.as_bytes().to_vec();
    obfuscate(&mut bytes);
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(&bytes);
}

impl Frame {
    /// Pack this frame for the wire. Returns an empty `Bytes` if any field
    /// violates its stated bound (`conn_id`/`seq` are `u8` and always in
    /// range; `hostport`/`client` over [`MAX_STRING_LEN`] bytes or `payload`
    /// over [`MAX_DATA_LEN`] bytes trip this) — the caller observes a
    /// zero-length frame and drops it rather than sending garbage.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Link { client } => {
                if client.len() > MAX_STRING_LEN {
                    return Bytes::new();
                }
                buf.put_u8(TAG_LINK);
                pack_string(&mut buf, client);
            }
            Frame::Keepalive => {
                buf.put_u8(TAG_KEEPALIVE);
            }
            Frame::Connect { conn_id, hostport } => {
                if hostport.len() > MAX_STRING_LEN {
                    return Bytes::new();
                }
                buf.put_u8(TAG_CONNECT);
                buf.put_u8(*conn_id);
                pack_string(&mut buf, hostport);
            }
            Frame::ConnectAck { conn_id, ok } => {
                buf.put_u8(TAG_CONNECT_ACK);
                buf.put_u8(*conn_id);
                buf.put_u8(if *ok { 1 } else { 0 });
            }
            Frame::Disconnect { conn_id } => {
                buf.put_u8(TAG_DISCONNECT);
                buf.put_u8(*conn_id);
            }
            Frame::Data {
                conn_id,
                seq,
                payload,
            } => {
                if payload.len() > MAX_DATA_LEN {
                    return Bytes::new();
                }
                buf.put_u8(TAG_DATA);
                buf.put_u8(*conn_id);
                buf.put_u8(*seq);
                buf.put_u16(payload.len() as u16);
                let mut data = payload.to_vec();
                obfuscate(&mut data);
                buf.put_slice(&data);
            }
            Frame::DataAck {
                conn_id,
                seq,
                datalen,
            } => {
                buf.put_u8(TAG_DATA_ACK);
                buf.put_u8(*conn_id);
                buf.put_u8(*seq);
                buf.put_u16(*datalen);
            }
        }
        buf.freeze()
    }

    /// Parse one frame from the front of `buf`. On success returns the
    /// frame and the number of bytes consumed; the caller advances its
    /// cursor by exactly that many bytes. `Err(Incomplete)` means "read
    /// more and retry unchanged"; `Err(Invalid)` is fatal to the link.
    pub fn parse(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
        if buf.is_empty() {
            return Err(FrameError::Incomplete);
        }
        let mut cursor = Cursor::new(buf);
        let tag = cursor.get_u8();
        match tag {
            TAG_LINK => {
                let (client, body_len) = parse_string_body(&mut cursor, buf)?;
                Ok((Frame::Link { client }, 1 + body_len))
            }
            TAG_KEEPALIVE => Ok((Frame::Keepalive, 1)),
            TAG_CONNECT => {
                if cursor.remaining() < 1 {
                    return Err(FrameError::Incomplete);
                }
                let conn_id = cursor.get_u8();
                let (hostport, body_len) = parse_string_body(&mut cursor, buf)?;
                Ok((Frame::Connect { conn_id, hostport }, 1 + 1 + body_len))
            }
            TAG_CONNECT_ACK => {
                if cursor.remaining() < 2 {
                    return Err(FrameError::Incomplete);
                }
                let conn_id = cursor.get_u8();
                let ok_byte = cursor.get_u8();
                let ok = match ok_byte {
                    0 => false,
                    1 => true,
                    _ => {
                        return Err(FrameError::Invalid {
                            reason: "ConnectAck.ok not 0/1",
                        });
                    }
                };
                Ok((Frame::ConnectAck { conn_id, ok }, 3))
            }
            TAG_DISCONNECT => {
                if cursor.remaining() < 1 {
                    return Err(FrameError::Incomplete);
                }
                let conn_id = cursor.get_u8();
                Ok((Frame::Disconnect { conn_id }, 2))
            }
            TAG_DATA => {
                if cursor.remaining() < 4 {
                    return Err(FrameError::Incomplete);
                }
                let conn_id = cursor.get_u8();
                let seq = cursor.get_u8();
                let len = cursor.get_u16() as usize;
                if len > MAX_DATA_LEN {
                    return Err(FrameError::Invalid {
                        reason: "Data length >= 32768",
                    });
                }
                if cursor.remaining() < len {
                    return Err(FrameError::Incomplete);
                }
                let start = cursor.position() as usize;
                let mut payload = buf[start..start + len].to_vec();
                obfuscate(&mut payload);
                Ok((
                    Frame::Data {
                        conn_id,
                        seq,
                        payload: Bytes::from(payload),
                    },
                    5 + len,
                ))
            }
            TAG_DATA_ACK => {
                if cursor.remaining() < 4 {
                    return Err(FrameError::Incomplete);
                }
                let conn_id = cursor.get_u8();
                let seq = cursor.get_u8();
                let datalen = cursor.get_u16();
                Ok((
                    Frame::DataAck {
                        conn_id,
                        seq,
                        datalen,
                    },
                    5,
                ))
            }
            _ => Err(FrameError::Invalid {
                reason: "unknown frame tag",
            }),
        }
    }
}

/// Parses `[clen:u8][bytes XOR 0xAA]` starting at the cursor's current
/// position, returning the decoded string and the number of bytes that
/// length-prefixed body occupies (not counting the tag byte).
fn parse_string_body(
    cursor: &mut Cursor<&[u8]>,
    buf: &[u8],
) -> Result<(String, usize), FrameError> {
    if cursor.remaining() < 1 {
        return Err(FrameError::Incomplete);
    }
    let len = cursor.get_u8() as usize;
    if cursor.remaining() < len {
        return Err(FrameError::Incomplete);
    }
    let start = cursor.position() as usize;
    let mut bytes = buf[start..start + len].to_vec();
    obfuscate(&mut bytes);
    let s = String::from_utf8(bytes).map_err(|_| FrameError::Invalid {
        reason: "string field is not valid UTF-8",
    })?;
    Ok((s, 1 + len))
}
