//! The query processor.
//!
//! Every `OP_QUERY` passes through here. Most are forwarded untouched; the
//! topology commands are routed to a rewriter, and in readonly mode
//! mutating commands are rejected before any byte reaches the backend.

use crate::error::ProxyError;
use crate::extension::ExtensionStack;
use crate::last_error::LastError;
use crate::metrics::Metrics;
use crate::rewrite::{
    GetLastErrorRewriter, IsMasterRewriter, ProxyMapper, ReplSetStatusRewriter,
};
use mongobridge_protocol::codec::{copy_exact, copy_message};
use mongobridge_protocol::query::has_key;
use mongobridge_protocol::ParsedQuery;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

const CMD_SUFFIX: &[u8] = b".$cmd\0";
const ADMIN_CMD: &[u8] = b"admin.$cmd\0";

const READONLY_ERROR: &str = "Readonly database";
const READONLY_CODE: i32 = 66;

enum Selected {
    IsMaster,
    ReplSetStatus,
}

/// Classifies queries and routes them straight through or via a rewriter.
pub struct QueryProcessor {
    is_master: IsMasterRewriter,
    repl_set_status: ReplSetStatusRewriter,
    get_last_error: GetLastErrorRewriter,
    read_only: bool,
    proxy_all: bool,
    extensions: Arc<ExtensionStack>,
    metrics: Option<Arc<Metrics>>,
}

impl QueryProcessor {
    pub fn new(
        mapper: Arc<dyn ProxyMapper>,
        read_only: bool,
        proxy_all: bool,
        extensions: Arc<ExtensionStack>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            is_master: IsMasterRewriter {
                mapper: mapper.clone(),
            },
            repl_set_status: ReplSetStatusRewriter { mapper },
            get_last_error: GetLastErrorRewriter,
            read_only,
            proxy_all,
            extensions,
            metrics,
        }
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Proxies one `OP_QUERY` and its response.
    pub async fn process<C, S>(
        &self,
        msg: &mut ParsedQuery,
        client: &mut C,
        server: &mut S,
        last_error: &mut LastError,
    ) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Whether the server would reset its per-connection last-error for
        // this command. Mirrors lastError.disableForCommand on the server:
        // a forShell-tagged command keeps the cache alive.
        let mut reset_last_error = true;
        let mut rewriter = None;

        let collection = msg.collection(client).await?.to_vec();
        let is_cmd = collection.ends_with(CMD_SUFFIX);

        if self.proxy_all || self.read_only || is_cmd {
            let (is_gle, is_master, is_status, for_shell, is_write) = {
                let doc = msg.document(client).await?;
                self.extensions.on_query(&collection, doc);
                (
                    has_key(doc, "getLastError"),
                    has_key(doc, "isMaster"),
                    has_key(doc, "replSetGetStatus"),
                    has_key(doc, "forShell"),
                    has_key(doc, "insert") || has_key(doc, "delete") || has_key(doc, "update"),
                )
            };

            if self.read_only && is_write {
                if let Some(m) = &self.metrics {
                    m.readonly_rejections_total.inc();
                }
                last_error.new_error(READONLY_ERROR, READONLY_CODE)?;
                let result = self
                    .get_last_error
                    .rewrite(msg, client, server, last_error)
                    .await;
                last_error.reset();
                return result;
            }

            if is_gle {
                return self
                    .get_last_error
                    .rewrite(msg, client, server, last_error)
                    .await;
            }

            if is_master {
                rewriter = Some(Selected::IsMaster);
            }
            if collection == ADMIN_CMD && is_status {
                rewriter = Some(Selected::ReplSetStatus);
            }

            if rewriter.is_some() {
                reset_last_error = for_shell;
            }
        }

        if reset_last_error && last_error.exists() {
            tracing::debug!("reset getLastError cache");
            last_error.reset();
        }

        // Forward the request: the materialized parts, then whatever of the
        // message is still sitting on the client socket.
        let header = *msg.header();
        {
            let parts = msg.parts(client).await?;
            header.write_to(server).await?;
            parts.write_to(server).await?;
        }
        copy_exact(server, client, msg.pending()).await?;

        match rewriter {
            Some(Selected::IsMaster) => self.is_master.rewrite(client, server).await,
            Some(Selected::ReplSetStatus) => self.repl_set_status.rewrite(client, server).await,
            None => copy_message(client, server).await.map_err(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionStack;
    use crate::testutil::{encode_query as query_wire, encode_single_reply, FakeMapper};
    use bson::{doc, Bson, Document};
    use mongobridge_protocol::command::REPLY_PREFIX_LEN;
    use mongobridge_protocol::{MsgHeader, OpCode, HEADER_LEN};
    use tokio::io::AsyncWriteExt;

    fn processor(read_only: bool, proxy_all: bool) -> QueryProcessor {
        QueryProcessor::new(
            FakeMapper::of(&[("a", "1"), ("b", "2")]),
            read_only,
            proxy_all,
            Arc::new(ExtensionStack::new(Vec::new())),
            None,
        )
    }

    #[tokio::test]
    async fn test_plain_query_forwarded_with_reply() {
        let p = processor(false, false);
        let (header, body) = query_wire("app.users", &doc! { "name": "x" }, 21);

        let (mut client, mut client_remote) = tokio::io::duplex(4096);
        let (mut server, mut server_remote) = tokio::io::duplex(4096);

        // Queue the request body on the client socket and a reply on the
        // backend socket.
        client_remote.write_all(&body).await.unwrap();
        let reply = encode_single_reply(&doc! { "ok": 1.0 });
        server_remote.write_all(&reply).await.unwrap();

        let mut msg = ParsedQuery::new(header);
        let mut last_error = LastError::new();
        p.process(&mut msg, &mut client, &mut server, &mut last_error)
            .await
            .unwrap();

        // The backend received the full query unchanged.
        let mut seen = vec![0u8; header.message_length as usize];
        tokio::io::AsyncReadExt::read_exact(&mut server_remote, &mut seen)
            .await
            .unwrap();
        assert_eq!(&seen[0..HEADER_LEN], &header.to_wire());
        assert_eq!(&seen[HEADER_LEN..], &body[..]);

        // The client received the raw reply.
        let mut got = vec![0u8; reply.len()];
        tokio::io::AsyncReadExt::read_exact(&mut client_remote, &mut got)
            .await
            .unwrap();
        assert_eq!(got, reply);
    }

    #[tokio::test]
    async fn test_readonly_rejects_write_command_without_backend_bytes() {
        let p = processor(true, false);
        let (header, body) = query_wire(
            "app.$cmd",
            &doc! { "insert": "users", "documents": [{ "x": 1 }] },
            33,
        );

        let (mut client, mut client_remote) = tokio::io::duplex(4096);
        let (mut server, mut server_remote) = tokio::io::duplex(4096);
        client_remote.write_all(&body).await.unwrap();

        let mut msg = ParsedQuery::new(header);
        let mut last_error = LastError::new();
        p.process(&mut msg, &mut client, &mut server, &mut last_error)
            .await
            .unwrap();

        // Client got a synthesized error reply correlated to its request.
        let reply_header = MsgHeader::read_from(&mut client_remote).await.unwrap();
        assert_eq!(reply_header.op_code, OpCode::Reply);
        assert_eq!(reply_header.response_to, 33);
        let mut rest = vec![0u8; reply_header.body_len() as usize];
        tokio::io::AsyncReadExt::read_exact(&mut client_remote, &mut rest)
            .await
            .unwrap();
        let doc: Document = bson::from_slice(&rest[REPLY_PREFIX_LEN..]).unwrap();
        assert_eq!(doc.get_str("$err").unwrap(), "Readonly database");
        assert_eq!(doc.get_i32("code").unwrap(), 66);

        // Nothing reached the backend.
        drop(server);
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server_remote, &mut buf)
            .await
            .unwrap();
        assert!(buf.is_empty());

        // The synthesized error does not linger.
        assert!(!last_error.exists());
    }

    #[tokio::test]
    async fn test_is_master_selected_and_rewritten() {
        let p = processor(false, false);
        let (header, body) = query_wire("admin.$cmd", &doc! { "isMaster": 1 }, 5);

        let (mut client, mut client_remote) = tokio::io::duplex(4096);
        let (mut server, mut server_remote) = tokio::io::duplex(4096);
        client_remote.write_all(&body).await.unwrap();
        let reply = encode_single_reply(&doc! { "hosts": ["a", "b"], "primary": "a" });
        server_remote.write_all(&reply).await.unwrap();

        let mut msg = ParsedQuery::new(header);
        let mut last_error = LastError::new();
        p.process(&mut msg, &mut client, &mut server, &mut last_error)
            .await
            .unwrap();

        let reply_header = MsgHeader::read_from(&mut client_remote).await.unwrap();
        let mut rest = vec![0u8; reply_header.body_len() as usize];
        tokio::io::AsyncReadExt::read_exact(&mut client_remote, &mut rest)
            .await
            .unwrap();
        let doc: Document = bson::from_slice(&rest[REPLY_PREFIX_LEN..]).unwrap();
        let hosts: Vec<&str> = doc
            .get_array("hosts")
            .unwrap()
            .iter()
            .map(|b| b.as_str().unwrap())
            .collect();
        assert_eq!(hosts, vec!["1", "2"]);
        assert_eq!(doc.get_str("primary").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_get_last_error_caches_and_replays() {
        let p = processor(false, false);
        let mut last_error = LastError::new();

        // First getLastError: proxied for real and cached.
        let (header, body) = query_wire("app.$cmd", &doc! { "getLastError": 1 }, 40);
        let (mut client, mut client_remote) = tokio::io::duplex(4096);
        let (mut server, mut server_remote) = tokio::io::duplex(4096);
        client_remote.write_all(&body).await.unwrap();
        let reply = encode_single_reply(&doc! { "ok": 1.0, "err": Bson::Null });
        server_remote.write_all(&reply).await.unwrap();

        let mut msg = ParsedQuery::new(header);
        p.process(&mut msg, &mut client, &mut server, &mut last_error)
            .await
            .unwrap();
        assert!(last_error.exists());

        let first = MsgHeader::read_from(&mut client_remote).await.unwrap();
        assert_eq!(first.response_to, 40);
        let mut rest = vec![0u8; first.body_len() as usize];
        tokio::io::AsyncReadExt::read_exact(&mut client_remote, &mut rest)
            .await
            .unwrap();

        // Second getLastError: nothing new written to the backend, cached
        // reply replayed with the new request id.
        let (header2, body2) = query_wire("app.$cmd", &doc! { "getLastError": 1 }, 41);
        client_remote.write_all(&body2).await.unwrap();
        let mut msg2 = ParsedQuery::new(header2);
        p.process(&mut msg2, &mut client, &mut server, &mut last_error)
            .await
            .unwrap();

        let second = MsgHeader::read_from(&mut client_remote).await.unwrap();
        assert_eq!(second.response_to, 41);

        drop(server);
        let mut backend_bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server_remote, &mut backend_bytes)
            .await
            .unwrap();
        // Only the first query reached the backend.
        assert_eq!(backend_bytes.len(), header.message_length as usize);
    }

    #[tokio::test]
    async fn test_proxy_all_forces_parsing() {
        // With proxy_all set, an isMaster off a $cmd collection is still
        // intercepted and rewritten.
        let p = processor(false, true);
        let (header, body) = query_wire("app.users", &doc! { "isMaster": 1 }, 8);

        let (mut client, mut client_remote) = tokio::io::duplex(4096);
        let (mut server, mut server_remote) = tokio::io::duplex(4096);
        client_remote.write_all(&body).await.unwrap();
        let reply = encode_single_reply(&doc! { "hosts": ["a"] });
        server_remote.write_all(&reply).await.unwrap();

        let mut msg = ParsedQuery::new(header);
        let mut last_error = LastError::new();
        p.process(&mut msg, &mut client, &mut server, &mut last_error)
            .await
            .unwrap();

        let reply_header = MsgHeader::read_from(&mut client_remote).await.unwrap();
        let mut rest = vec![0u8; reply_header.body_len() as usize];
        tokio::io::AsyncReadExt::read_exact(&mut client_remote, &mut rest)
            .await
            .unwrap();
        let doc: Document = bson::from_slice(&rest[REPLY_PREFIX_LEN..]).unwrap();
        assert_eq!(doc.get_array("hosts").unwrap()[0].as_str().unwrap(), "1");
    }

    #[tokio::test]
    async fn test_non_cmd_collection_not_parsed_unless_forced() {
        // On a regular collection the document is never inspected, so an
        // isMaster-looking filter must pass through untouched.
        let p = processor(false, false);
        let (header, body) = query_wire("app.users", &doc! { "isMaster": 1 }, 8);

        let (mut client, mut client_remote) = tokio::io::duplex(4096);
        let (mut server, mut server_remote) = tokio::io::duplex(4096);
        client_remote.write_all(&body).await.unwrap();
        let reply = encode_single_reply(&doc! { "ok": 1.0 });
        server_remote.write_all(&reply).await.unwrap();

        let mut msg = ParsedQuery::new(header);
        let mut last_error = LastError::new();
        p.process(&mut msg, &mut client, &mut server, &mut last_error)
            .await
            .unwrap();

        let mut got = vec![0u8; reply.len()];
        tokio::io::AsyncReadExt::read_exact(&mut client_remote, &mut got)
            .await
            .unwrap();
        assert_eq!(got, reply);
    }
}
