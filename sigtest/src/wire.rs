//! Frames exchanged between a session host and its clients.
//!
//! Session setup (find, advertise, join) and signal relay share one codec so
//! the TCP and UDP links only ever move opaque byte buffers.  No I/O happens
//! here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.  Every frame starts with a
//! one-byte type followed by type-specific fields:
//!
//! ```text
//!  type  frame           fields
//!  ----  --------------  ---------------------------------------------
//!  0x01  Find            prefix:str
//!  0x02  Advertise       name:str  prefix:str
//!  0x03  Join            name:str
//!  0x04  JoinReply       session:u32  unique_name:str  host:str  members:list
//!  0x05  Rejected        reason:str
//!  0x06  MemberAdded     session:u32  name:str
//!  0x07  MemberRemoved   session:u32  name:str
//!  0x08  SessionLost     session:u32
//!  0x09  Leave           -
//!  0x0a  Signal          session:u32  sender:str  ttl:u32  flags:u8  body:bytes
//!
//!  str   = u16 length + UTF-8 bytes
//!  list  = u16 count + count * str
//!  bytes = u32 length + raw bytes
//! ```

use crate::signal::{ByteReader, DecodeError};
use crate::transport::SessionId;

const T_FIND: u8 = 0x01;
const T_ADVERTISE: u8 = 0x02;
const T_JOIN: u8 = 0x03;
const T_JOIN_REPLY: u8 = 0x04;
const T_REJECTED: u8 = 0x05;
const T_MEMBER_ADDED: u8 = 0x06;
const T_MEMBER_REMOVED: u8 = 0x07;
const T_SESSION_LOST: u8 = 0x08;
const T_LEAVE: u8 = 0x09;
const T_SIGNAL: u8 = 0x0a;

/// Bytes a signal frame adds around its body, excluding the sender name.
pub const SIGNAL_OVERHEAD: usize = 1 + 4 + 2 + 4 + 1 + 4;

/// One host/client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client: is anyone advertising a name starting with `prefix`?
    Find { prefix: String },
    /// Host: answer to a matching [`Frame::Find`].
    Advertise { name: String, prefix: String },
    /// Client: join the session advertised as `name`.
    Join { name: String },
    /// Host: join accepted.  `members` lists everyone already in the
    /// session, host first.
    JoinReply {
        session: SessionId,
        unique_name: String,
        host: String,
        members: Vec<String>,
    },
    /// Host: join refused.
    Rejected { reason: String },
    MemberAdded { session: SessionId, name: String },
    MemberRemoved { session: SessionId, name: String },
    /// Host: the session is gone.
    SessionLost { session: SessionId },
    /// Client: leaving the session.
    Leave,
    /// A test signal body from `sender`.
    Signal {
        session: SessionId,
        sender: String,
        ttl_secs: u32,
        flags: u8,
        body: Vec<u8>,
    },
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    // Names are short; anything past the u16 range is cut off on a char
    // boundary so the peer still sees valid UTF-8.
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &s.as_bytes()[..end];
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn get_str(r: &mut ByteReader<'_>) -> Result<String, DecodeError> {
    let len = r.u16()? as usize;
    let raw = r.take(len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidName)
}

impl Frame {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Find { .. } => "Find",
            Frame::Advertise { .. } => "Advertise",
            Frame::Join { .. } => "Join",
            Frame::JoinReply { .. } => "JoinReply",
            Frame::Rejected { .. } => "Rejected",
            Frame::MemberAdded { .. } => "MemberAdded",
            Frame::MemberRemoved { .. } => "MemberRemoved",
            Frame::SessionLost { .. } => "SessionLost",
            Frame::Leave => "Leave",
            Frame::Signal { .. } => "Signal",
        }
    }

    /// Serialise into a newly allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Frame::Find { prefix } => {
                buf.push(T_FIND);
                put_str(&mut buf, prefix);
            }
            Frame::Advertise { name, prefix } => {
                buf.push(T_ADVERTISE);
                put_str(&mut buf, name);
                put_str(&mut buf, prefix);
            }
            Frame::Join { name } => {
                buf.push(T_JOIN);
                put_str(&mut buf, name);
            }
            Frame::JoinReply {
                session,
                unique_name,
                host,
                members,
            } => {
                buf.push(T_JOIN_REPLY);
                buf.extend_from_slice(&session.to_be_bytes());
                put_str(&mut buf, unique_name);
                put_str(&mut buf, host);
                let count = members.len().min(u16::MAX as usize);
                buf.extend_from_slice(&(count as u16).to_be_bytes());
                for m in &members[..count] {
                    put_str(&mut buf, m);
                }
            }
            Frame::Rejected { reason } => {
                buf.push(T_REJECTED);
                put_str(&mut buf, reason);
            }
            Frame::MemberAdded { session, name } => {
                buf.push(T_MEMBER_ADDED);
                buf.extend_from_slice(&session.to_be_bytes());
                put_str(&mut buf, name);
            }
            Frame::MemberRemoved { session, name } => {
                buf.push(T_MEMBER_REMOVED);
                buf.extend_from_slice(&session.to_be_bytes());
                put_str(&mut buf, name);
            }
            Frame::SessionLost { session } => {
                buf.push(T_SESSION_LOST);
                buf.extend_from_slice(&session.to_be_bytes());
            }
            Frame::Leave => buf.push(T_LEAVE),
            Frame::Signal {
                session,
                sender,
                ttl_secs,
                flags,
                body,
            } => {
                buf.reserve(SIGNAL_OVERHEAD + sender.len() + body.len());
                buf.push(T_SIGNAL);
                buf.extend_from_slice(&session.to_be_bytes());
                put_str(&mut buf, sender);
                buf.extend_from_slice(&ttl_secs.to_be_bytes());
                buf.push(*flags);
                buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
                buf.extend_from_slice(body);
            }
        }
        buf
    }

    /// Parse one complete frame.  Trailing bytes are an error.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(buf);
        let frame = match r.u8()? {
            T_FIND => Frame::Find {
                prefix: get_str(&mut r)?,
            },
            T_ADVERTISE => Frame::Advertise {
                name: get_str(&mut r)?,
                prefix: get_str(&mut r)?,
            },
            T_JOIN => Frame::Join {
                name: get_str(&mut r)?,
            },
            T_JOIN_REPLY => {
                let session = r.u32()?;
                let unique_name = get_str(&mut r)?;
                let host = get_str(&mut r)?;
                let count = r.u16()?;
                let members = (0..count)
                    .map(|_| get_str(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                Frame::JoinReply {
                    session,
                    unique_name,
                    host,
                    members,
                }
            }
            T_REJECTED => Frame::Rejected {
                reason: get_str(&mut r)?,
            },
            T_MEMBER_ADDED => Frame::MemberAdded {
                session: r.u32()?,
                name: get_str(&mut r)?,
            },
            T_MEMBER_REMOVED => Frame::MemberRemoved {
                session: r.u32()?,
                name: get_str(&mut r)?,
            },
            T_SESSION_LOST => Frame::SessionLost { session: r.u32()? },
            T_LEAVE => Frame::Leave,
            T_SIGNAL => {
                let session = r.u32()?;
                let sender = get_str(&mut r)?;
                let ttl_secs = r.u32()?;
                let flags = r.u8()?;
                let len = r.u32()? as usize;
                let body = r.take(len)?.to_vec();
                Frame::Signal {
                    session,
                    sender,
                    ttl_secs,
                    flags,
                    body,
                }
            }
            other => return Err(DecodeError::UnknownFrame(other)),
        };
        r.finish()?;
        Ok(frame)
    }
}
