//! Message header and op codes.
//!
//! Every MongoDB wire message starts with a fixed 16-byte little-endian
//! header:
//!
//! ```text
//! +---------------+-----------+------------+---------+
//! | messageLength | requestID | responseTo | opCode  |
//! |    4 bytes    |  4 bytes  |  4 bytes   | 4 bytes |
//! +---------------+-----------+------------+---------+
//! ```

use crate::error::ProtocolError;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 16;

/// Wire protocol op codes.
///
/// The proxy must accept any op code; unknown ones are streamed opaquely and
/// carried as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Other(i32),
}

impl OpCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            other => OpCode::Other(other),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Other(other) => *other,
        }
    }

    /// Returns whether the server sends a reply for this op.
    pub fn has_response(&self) -> bool {
        matches!(self, OpCode::Query | OpCode::GetMore)
    }

    /// Returns whether this op mutates data and may be followed by a
    /// `getLastError` on the same socket.
    pub fn is_mutation(&self) -> bool {
        matches!(self, OpCode::Insert | OpCode::Update | OpCode::Delete)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Reply => write!(f, "REPLY"),
            OpCode::Update => write!(f, "UPDATE"),
            OpCode::Insert => write!(f, "INSERT"),
            OpCode::Query => write!(f, "QUERY"),
            OpCode::GetMore => write!(f, "GET_MORE"),
            OpCode::Delete => write!(f, "DELETE"),
            OpCode::KillCursors => write!(f, "KILL_CURSORS"),
            OpCode::Other(code) => write!(f, "OP({})", code),
        }
    }
}

/// A parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total message length, header included.
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MsgHeader {
    /// Reads exactly one header from the stream.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HEADER_LEN];
        r.read_exact(&mut buf).await?;
        let header = Self::from_wire(&buf);
        if header.message_length < HEADER_LEN as i32 {
            return Err(ProtocolError::InvalidMessageLength(header.message_length));
        }
        Ok(header)
    }

    /// Writes the header to the stream.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&self.to_wire()).await?;
        Ok(())
    }

    pub fn from_wire(buf: &[u8; HEADER_LEN]) -> Self {
        let int_at = |off: usize| i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        Self {
            message_length: int_at(0),
            request_id: int_at(4),
            response_to: int_at(8),
            op_code: OpCode::from_i32(int_at(12)),
        }
    }

    pub fn to_wire(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_code.as_i32().to_le_bytes());
        buf
    }

    /// Number of payload bytes following the header.
    pub fn body_len(&self) -> u64 {
        (self.message_length as u64).saturating_sub(HEADER_LEN as u64)
    }
}

impl fmt::Display for MsgHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} len={} id={} to={}",
            self.op_code, self.message_length, self.request_id, self.response_to
        )
    }
}
