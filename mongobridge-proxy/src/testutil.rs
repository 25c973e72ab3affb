//! Shared helpers for the crate's tests.

use crate::rewrite::ProxyMapper;
use bson::Document;
use mongobridge_protocol::command::REPLY_PREFIX_LEN;
use mongobridge_protocol::{MsgHeader, OpCode, HEADER_LEN};
use std::collections::HashMap;
use std::sync::Arc;

/// A proxy mapper backed by a fixed table.
pub struct FakeMapper(pub HashMap<String, String>);

impl FakeMapper {
    pub fn of(pairs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self(
            pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        ))
    }
}

impl ProxyMapper for FakeMapper {
    fn proxy(&self, real: &str) -> Option<String> {
        self.0.get(real).cloned()
    }
}

/// Encodes a complete single-document `OP_REPLY` message.
pub fn encode_single_reply(doc: &Document) -> Vec<u8> {
    let doc_bytes = bson::to_vec(doc).unwrap();
    let mut prefix = [0u8; REPLY_PREFIX_LEN];
    prefix[16..20].copy_from_slice(&1i32.to_le_bytes());
    let header = MsgHeader {
        message_length: (HEADER_LEN + REPLY_PREFIX_LEN + doc_bytes.len()) as i32,
        request_id: 7,
        response_to: 3,
        op_code: OpCode::Reply,
    };
    let mut out = header.to_wire().to_vec();
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&doc_bytes);
    out
}

/// Encodes a complete `OP_QUERY` message, returning header and body bytes.
pub fn encode_query(collection: &str, body: &Document, request_id: i32) -> (MsgHeader, Vec<u8>) {
    let doc_bytes = bson::to_vec(body).unwrap();
    let mut wire = Vec::new();
    wire.extend_from_slice(&[0, 0, 0, 0]);
    wire.extend_from_slice(collection.as_bytes());
    wire.push(0);
    wire.extend_from_slice(&0i32.to_le_bytes());
    wire.extend_from_slice(&(-1i32).to_le_bytes());
    wire.extend_from_slice(&doc_bytes);
    let header = MsgHeader {
        message_length: (HEADER_LEN + wire.len()) as i32,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    };
    (header, wire)
}
