//! Single-document command round-trip.
//!
//! Commands on the classic wire protocol are an `OP_QUERY` against
//! `<db>.$cmd` with `numberToReturn = -1`, answered by an `OP_REPLY`
//! carrying exactly one document. Login and topology probes are built on
//! this.

use crate::codec::read_document;
use crate::error::ProtocolError;
use crate::header::{MsgHeader, OpCode, HEADER_LEN};
use bson::Document;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the `OP_REPLY` body prefix: response flags, cursor id,
/// starting-from and number-returned.
pub const REPLY_PREFIX_LEN: usize = 20;

/// The fixed 20-byte prefix of an `OP_REPLY` body.
pub type ReplyPrefix = [u8; REPLY_PREFIX_LEN];

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a process-wide monotonically increasing request id.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Extracts `numberReturned` from a reply prefix.
pub fn number_returned(prefix: &ReplyPrefix) -> i32 {
    i32::from_le_bytes(prefix[16..20].try_into().unwrap())
}

/// Writes a command query for `<db>.$cmd` to the stream.
pub async fn write_command<W>(
    w: &mut W,
    db: &str,
    command: &Document,
    request_id: i32,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let doc_bytes = bson::to_vec(command)?;

    let mut body = BytesMut::with_capacity(64 + doc_bytes.len());
    body.put_i32_le(0); // flags
    body.put_slice(db.as_bytes());
    body.put_slice(b".$cmd\0");
    body.put_i32_le(0); // numberToSkip
    body.put_i32_le(-1); // numberToReturn
    body.put_slice(&doc_bytes);

    let header = MsgHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    };
    w.write_all(&header.to_wire()).await?;
    w.write_all(&body).await?;
    Ok(())
}

/// Reads an `OP_REPLY` that must carry exactly one document.
///
/// Returns the header, the 20-byte reply prefix and the raw document bytes.
pub async fn read_single_reply<R>(
    r: &mut R,
) -> Result<(MsgHeader, ReplyPrefix, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let header = MsgHeader::read_from(r).await?;
    if header.op_code != OpCode::Reply {
        return Err(ProtocolError::UnexpectedOp {
            expected: OpCode::Reply,
            got: header.op_code,
        });
    }

    let mut prefix: ReplyPrefix = [0u8; REPLY_PREFIX_LEN];
    r.read_exact(&mut prefix).await?;

    let docs = number_returned(&prefix);
    if docs != 1 {
        return Err(ProtocolError::MultipleDocs(docs));
    }

    let doc = read_document(r).await?;
    Ok((header, prefix, doc))
}

/// Runs one command against `<db>.$cmd` and decodes the single reply
/// document.
pub async fn run_command<S, T>(stream: &mut S, db: &str, command: &Document) -> Result<T, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    write_command(stream, db, command, next_request_id()).await?;
    let (_, _, doc) = read_single_reply(stream).await?;
    Ok(bson::from_slice(&doc)?)
}

/// Returns whether a command reply document reports success.
pub fn command_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(bson::Bson::Double(v)) => *v == 1.0,
        Some(bson::Bson::Int32(v)) => *v == 1,
        Some(bson::Bson::Int64(v)) => *v == 1,
        Some(bson::Bson::Boolean(v)) => *v,
        _ => false,
    }
}
