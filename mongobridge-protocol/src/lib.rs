//! # mongobridge-protocol
//!
//! MongoDB wire protocol primitives for mongobridge.
//!
//! This crate provides:
//! - Message header encoding/decoding and op-code classification
//! - Byte-level readers for C-strings and BSON documents
//! - Opaque message forwarding (`copy_message`)
//! - Lazy `OP_QUERY` parsing with sticky-error semantics
//! - A single-document command round-trip used for login and topology probes
//! - Response document types for `isMaster` and `replSetGetStatus`

pub mod codec;
pub mod command;
pub mod error;
pub mod header;
pub mod message;
pub mod query;

pub use codec::{copy_message, read_cstring, read_document};
pub use error::ProtocolError;
pub use header::{MsgHeader, OpCode, HEADER_LEN};
pub use message::{IsMasterReply, ReplSetStatusReply, ReplicaState, StatusMember};
pub use query::ParsedQuery;

/// Maximum BSON document size accepted on the wire (16 MiB).
pub const MAX_DOCUMENT_SIZE: i32 = 16 * 1024 * 1024;

/// Maximum accepted full collection name length, including the NUL
/// terminator. MongoDB namespaces are far shorter than this.
pub const MAX_CSTRING_LEN: usize = 4096;
