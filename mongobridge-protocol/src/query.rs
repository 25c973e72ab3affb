//! Lazy `OP_QUERY` parsing.
//!
//! The proxy only needs to look inside a query when it targets a `$cmd`
//! collection (or when interception is forced), so the body is pulled off
//! the client socket on demand and memoized. A parse failure is sticky:
//! once any field fails to materialize, every later access reports the same
//! fault, and no further bytes are consumed.

use crate::codec::{read_cstring, read_document};
use crate::error::{ParseFault, ProtocolError};
use crate::header::{MsgHeader, HEADER_LEN};
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The wire parts of an `OP_QUERY` body, in order.
#[derive(Debug, Clone)]
pub struct QueryParts {
    pub flags: [u8; 4],
    /// Full collection name, NUL terminator included.
    pub full_collection_name: Vec<u8>,
    /// `numberToSkip` and `numberToReturn`, kept as raw bytes.
    pub skip_limit: [u8; 8],
    /// Raw BSON bytes of the query document.
    pub query_doc: Vec<u8>,
}

impl QueryParts {
    /// Number of body bytes these parts cover.
    pub fn wire_len(&self) -> usize {
        4 + self.full_collection_name.len() + 8 + self.query_doc.len()
    }

    /// Writes the parts (without the header) to `w`.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&self.flags).await?;
        w.write_all(&self.full_collection_name).await?;
        w.write_all(&self.skip_limit).await?;
        w.write_all(&self.query_doc).await?;
        Ok(())
    }
}

/// An `OP_QUERY` message being proxied, with lazily materialized fields.
#[derive(Debug)]
pub struct ParsedQuery {
    header: MsgHeader,
    parts: Option<QueryParts>,
    doc: Option<Document>,
    failed: Option<ParseFault>,
}

impl ParsedQuery {
    pub fn new(header: MsgHeader) -> Self {
        Self {
            header,
            parts: None,
            doc: None,
            failed: None,
        }
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    /// Bytes consumed from the client for this message so far: the header,
    /// plus the body parts if they have been materialized.
    pub fn consumed(&self) -> u64 {
        let body = self.parts.as_ref().map(QueryParts::wire_len).unwrap_or(0);
        (HEADER_LEN + body) as u64
    }

    /// Payload bytes still unread on the client socket.
    pub fn pending(&self) -> u64 {
        (self.header.message_length as u64).saturating_sub(self.consumed())
    }

    /// Returns the wire parts, reading them from `client` on first access.
    pub async fn parts<R>(&mut self, client: &mut R) -> Result<&QueryParts, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(fault) = self.failed {
            return Err(fault.into());
        }
        if self.parts.is_none() {
            match self.load_parts(client).await {
                Ok(parts) => self.parts = Some(parts),
                Err(e) => {
                    tracing::debug!("failed to read query parts: {}", e);
                    let fault = e.as_fault();
                    self.failed = Some(fault);
                    return Err(e);
                }
            }
        }
        Ok(self.parts.as_ref().unwrap())
    }

    /// Returns the full collection name, loading parts if necessary.
    pub async fn collection<R>(&mut self, client: &mut R) -> Result<&[u8], ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        Ok(&self.parts(client).await?.full_collection_name)
    }

    /// Returns the decoded query document, loading and decoding on first
    /// access.
    pub async fn document<R>(&mut self, client: &mut R) -> Result<&Document, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(fault) = self.failed {
            return Err(fault.into());
        }
        if self.doc.is_none() {
            self.parts(client).await?;
            let raw = &self.parts.as_ref().unwrap().query_doc;
            match bson::from_slice::<Document>(raw) {
                Ok(doc) => self.doc = Some(doc),
                Err(e) => {
                    tracing::debug!("failed to decode query document: {}", e);
                    self.failed = Some(ParseFault::BadBson);
                    return Err(ProtocolError::BsonDecode(e));
                }
            }
        }
        Ok(self.doc.as_ref().unwrap())
    }

    async fn load_parts<R>(&self, client: &mut R) -> Result<QueryParts, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut flags = [0u8; 4];
        client.read_exact(&mut flags).await?;
        let full_collection_name = read_cstring(client).await?;
        let mut skip_limit = [0u8; 8];
        client.read_exact(&mut skip_limit).await?;
        let query_doc = read_document(client).await?;
        Ok(QueryParts {
            flags,
            full_collection_name,
            skip_limit,
            query_doc,
        })
    }
}

/// Case-insensitive check for a top-level key in a query document.
pub fn has_key(doc: &Document, key: &str) -> bool {
    doc.keys().any(|k| k.eq_ignore_ascii_case(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::OpCode;
    use bson::doc;

    fn query_message(collection: &[u8], body: &Document) -> (MsgHeader, Vec<u8>) {
        let doc_bytes = bson::to_vec(body).unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0, 0, 0, 0]); // flags
        wire.extend_from_slice(collection);
        wire.push(0);
        wire.extend_from_slice(&0i32.to_le_bytes()); // skip
        wire.extend_from_slice(&(-1i32).to_le_bytes()); // limit
        wire.extend_from_slice(&doc_bytes);
        let header = MsgHeader {
            message_length: (HEADER_LEN + wire.len()) as i32,
            request_id: 11,
            response_to: 0,
            op_code: OpCode::Query,
        };
        (header, wire)
    }

    #[tokio::test]
    async fn test_lazy_parts_and_document() {
        let (header, wire) = query_message(b"db.$cmd", &doc! { "getLastError": 1 });
        let mut msg = ParsedQuery::new(header);
        assert_eq!(msg.consumed(), HEADER_LEN as u64);

        let mut client = &wire[..];
        let coll = msg.collection(&mut client).await.unwrap().to_vec();
        assert_eq!(coll, b"db.$cmd\0");

        let doc = msg.document(&mut client).await.unwrap();
        assert!(has_key(doc, "getlasterror"));

        // Everything was consumed and memoized.
        assert_eq!(msg.consumed(), header.message_length as u64);
        assert_eq!(msg.pending(), 0);

        // A second access must not read from the (now empty) client.
        let mut empty: &[u8] = &[];
        assert!(msg.parts(&mut empty).await.is_ok());
        assert!(msg.document(&mut empty).await.is_ok());
    }

    #[tokio::test]
    async fn test_sticky_error() {
        let header = MsgHeader {
            message_length: 64,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Query,
        };
        let mut msg = ParsedQuery::new(header);

        // Truncated body: flags only.
        let mut client: &[u8] = &[0, 0, 0, 0];
        let err = msg.parts(&mut client).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));

        // Subsequent accesses report the same fault without reading.
        let mut more: &[u8] = b"plenty of bytes that must not be touched";
        let err = msg.parts(&mut more).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Query(ParseFault::Truncated)
        ));
        let err = msg.document(&mut more).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Query(ParseFault::Truncated)
        ));
        assert_eq!(more.len(), 40);
    }

    #[tokio::test]
    async fn test_bad_bson_poisons() {
        // Valid framing, but the document bytes are not a decodable BSON
        // element list.
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0, 0, 0, 0]);
        wire.extend_from_slice(b"db.c\0");
        wire.extend_from_slice(&[0u8; 8]);
        wire.extend_from_slice(&[6, 0, 0, 0, 0xFF, 0]); // element type 0xFF
        let header = MsgHeader {
            message_length: (HEADER_LEN + wire.len()) as i32,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Query,
        };
        let mut msg = ParsedQuery::new(header);
        let mut client = &wire[..];
        assert!(msg.document(&mut client).await.is_err());

        let mut empty: &[u8] = &[];
        let err = msg.document(&mut empty).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Query(ParseFault::BadBson)));
    }

    #[tokio::test]
    async fn test_parts_write_roundtrip() {
        let (header, wire) = query_message(b"test.users", &doc! { "name": "x" });
        let mut msg = ParsedQuery::new(header);
        let mut client = &wire[..];
        let parts = msg.parts(&mut client).await.unwrap();

        let mut out = Vec::new();
        parts.write_to(&mut out).await.unwrap();
        assert_eq!(out, wire);
        assert_eq!(parts.wire_len(), wire.len());
    }

    #[test]
    fn test_has_key_case_insensitive() {
        let doc = doc! { "isMaster": 1, "forShell": 1 };
        assert!(has_key(&doc, "ismaster"));
        assert!(has_key(&doc, "ISMASTER"));
        assert!(has_key(&doc, "forshell"));
        assert!(!has_key(&doc, "replSetGetStatus"));
    }
}
