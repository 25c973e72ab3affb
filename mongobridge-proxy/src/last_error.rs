//! The per-connection `getLastError` cache.
//!
//! Holds an `OP_REPLY` captured from the backend (or fabricated locally) so
//! repeated `getLastError` calls within a pinning window are answered
//! without another server round-trip.

use crate::error::ProxyError;
use bson::doc;
use bytes::{BufMut, BytesMut};
use mongobridge_protocol::{MsgHeader, OpCode, HEADER_LEN};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Reply prefix for a fabricated error: response flags = QueryFailure,
/// cursor id 0, starting from 0, one document.
const ERROR_REPLY_PREFIX: [u8; 20] = [
    2, 0, 0, 0, // responseFlags
    0, 0, 0, 0, 0, 0, 0, 0, // cursorID
    0, 0, 0, 0, // startingFrom
    1, 0, 0, 0, // numberReturned
];

/// Cached `getLastError` reply for one client connection.
#[derive(Debug, Default)]
pub struct LastError {
    header: Option<MsgHeader>,
    body: BytesMut,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a reply is cached.
    pub fn exists(&self) -> bool {
        self.header.is_some()
    }

    /// Clears the cached reply.
    pub fn reset(&mut self) {
        self.header = None;
        self.body.clear();
    }

    /// Stores a reply captured from the backend.
    pub fn cache(&mut self, header: MsgHeader, body: Vec<u8>) {
        self.body.clear();
        self.body.put_slice(&body);
        self.header = Some(header);
    }

    /// Fabricates an error reply with body `{$err: msg, code: code}`.
    pub fn new_error(&mut self, msg: &str, code: i32) -> Result<(), ProxyError> {
        let error_doc = doc! { "$err": msg, "code": code };
        let doc_bytes = bson::to_vec(&error_doc).map_err(mongobridge_protocol::ProtocolError::from)?;

        self.body.clear();
        self.body.put_slice(&ERROR_REPLY_PREFIX);
        self.body.put_slice(&doc_bytes);
        self.header = Some(MsgHeader {
            message_length: (HEADER_LEN + self.body.len()) as i32,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Reply,
        });
        Ok(())
    }

    /// Writes the cached reply to the client, correlated to `request_id`.
    pub async fn write_reply_to<W>(
        &mut self,
        client: &mut W,
        request_id: i32,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut header = self.header.ok_or_else(|| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no cached getLastError reply",
            ))
        })?;
        header.response_to = request_id;
        self.header = Some(header);

        client.write_all(&header.to_wire()).await?;
        client.write_all(&self.body).await?;
        Ok(())
    }

    /// Raw reply body (prefix plus document), for inspection in tests.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
