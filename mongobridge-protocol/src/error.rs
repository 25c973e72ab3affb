//! Protocol error types.

use crate::header::OpCode;
use thiserror::Error;

/// Errors produced while reading or writing wire protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message length: {0}")]
    InvalidMessageLength(i32),

    #[error("invalid document: length {0}")]
    InvalidDocument(i32),

    #[error("document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: i32, max: i32 },

    #[error("collection name exceeds {0} bytes")]
    CStringTooLong(usize),

    #[error("expected op {expected}, got {got}")]
    UnexpectedOp { expected: OpCode, got: OpCode },

    #[error("can only handle 1 result document, got {0}")]
    MultipleDocs(i32),

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("query parse failed: {0}")]
    Query(ParseFault),

    #[error("command {command} failed: {message}")]
    CommandFailed { command: String, message: String },
}

/// The sticky failure recorded by a [`crate::query::ParsedQuery`].
///
/// Once any field of a lazily parsed query fails to materialize, the same
/// fault is returned for every subsequent access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFault {
    /// The client stream ended or failed before the field was complete.
    Truncated,
    /// The embedded BSON document had an invalid length prefix.
    BadDocument,
    /// The query document bytes did not decode as BSON.
    BadBson,
}

impl std::fmt::Display for ParseFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseFault::Truncated => write!(f, "truncated message"),
            ParseFault::BadDocument => write!(f, "invalid document"),
            ParseFault::BadBson => write!(f, "undecodable query document"),
        }
    }
}

impl From<ParseFault> for ProtocolError {
    fn from(fault: ParseFault) -> Self {
        ProtocolError::Query(fault)
    }
}

impl ProtocolError {
    /// Collapses this error into the fault kind recorded by a lazy parse.
    pub(crate) fn as_fault(&self) -> ParseFault {
        match self {
            ProtocolError::InvalidDocument(_) | ProtocolError::DocumentTooLarge { .. } => {
                ParseFault::BadDocument
            }
            ProtocolError::BsonDecode(_) => ParseFault::BadBson,
            ProtocolError::Query(fault) => *fault,
            _ => ParseFault::Truncated,
        }
    }
}
