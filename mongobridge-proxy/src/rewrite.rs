//! Response rewriters for topology commands.
//!
//! Clients must only ever see proxy addresses, so replies to `isMaster` and
//! `replSetGetStatus` are decoded, their member addresses mapped through
//! the proxy mapper, and re-encoded with an adjusted message length.
//! `getLastError` is handled separately: its reply is cached so it can be
//! replayed while a backend connection is pinned.

use crate::error::ProxyError;
use crate::last_error::LastError;
use bson::Bson;
use mongobridge_protocol::codec::{copy_exact, discard_exact};
use mongobridge_protocol::command::{read_single_reply, ReplyPrefix};
use mongobridge_protocol::{IsMasterReply, MsgHeader, ParsedQuery, ReplSetStatusReply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// MongoDB's `Unauthorized` error code.
const AUTH_ERROR_CODE: i64 = 13;

/// Maps real member addresses to the proxy addresses that front them.
pub trait ProxyMapper: Send + Sync {
    /// Returns the proxy address for a real member address, or `None` when
    /// the member is not proxied.
    fn proxy(&self, real: &str) -> Option<String>;
}

/// Reads a one-document reply and decodes it, returning the pieces needed
/// to write a rewritten version back.
async fn read_one<R, T>(server: &mut R) -> Result<(MsgHeader, ReplyPrefix, i32, T), ProxyError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let (header, prefix, doc) = read_single_reply(server).await?;
    let value = bson::from_slice(&doc).map_err(mongobridge_protocol::ProtocolError::from)?;
    Ok((header, prefix, doc.len() as i32, value))
}

/// Re-encodes a rewritten reply document and sends it to the client with a
/// corrected message length.
async fn write_one<W, T>(
    client: &mut W,
    mut header: MsgHeader,
    prefix: ReplyPrefix,
    old_doc_len: i32,
    value: &T,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let doc = bson::to_vec(value).map_err(mongobridge_protocol::ProtocolError::from)?;
    header.message_length = header.message_length - old_doc_len + doc.len() as i32;
    client.write_all(&header.to_wire()).await?;
    client.write_all(&prefix).await?;
    client.write_all(&doc).await?;
    Ok(())
}

/// Rewrites `isMaster` replies.
pub struct IsMasterRewriter {
    pub mapper: Arc<dyn ProxyMapper>,
}

impl IsMasterRewriter {
    pub async fn rewrite<W, R>(&self, client: &mut W, server: &mut R) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let (header, prefix, doc_len, mut reply) = read_one::<_, IsMasterReply>(server).await?;

        // Arbiters hold no data; clients must not try to reach them.
        reply.arbiters = Vec::new();

        // Unmapped hosts are dropped silently.
        reply.hosts = reply
            .hosts
            .iter()
            .filter_map(|h| self.mapper.proxy(h))
            .collect();

        let passives = match reply.extra.get("passives") {
            Some(Bson::Array(passives)) => Some(passives.clone()),
            _ => None,
        };
        if let Some(passives) = passives {
            let mapped: Vec<Bson> = passives
                .iter()
                .filter_map(|p| match p {
                    Bson::String(addr) => self.mapper.proxy(addr).map(Bson::String),
                    _ => None,
                })
                .collect();
            reply.extra.insert("passives", Bson::Array(mapped));
        }

        // A client that cannot find its primary is broken, so an unmapped
        // primary (or me) is fatal.
        if let Some(primary) = reply.primary.take() {
            reply.primary = Some(
                self.mapper
                    .proxy(&primary)
                    .ok_or(ProxyError::NotInReplicaSet(primary))?,
            );
        }
        if let Some(me) = reply.me.take() {
            reply.me = Some(
                self.mapper
                    .proxy(&me)
                    .ok_or(ProxyError::NotInReplicaSet(me))?,
            );
        }

        write_one(client, header, prefix, doc_len, &reply).await
    }
}

/// Rewrites `replSetGetStatus` replies.
pub struct ReplSetStatusRewriter {
    pub mapper: Arc<dyn ProxyMapper>,
}

impl ReplSetStatusRewriter {
    pub async fn rewrite<W, R>(&self, client: &mut W, server: &mut R) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let (header, prefix, doc_len, mut reply) =
            read_one::<_, ReplSetStatusReply>(server).await?;

        if reply.error_code() == Some(AUTH_ERROR_CODE) {
            return Err(ProxyError::AuthFailed(format!(
                "replSetGetStatus unauthorized: {:?}",
                reply.extra
            )));
        }

        reply.members = reply
            .members
            .into_iter()
            .filter_map(|mut member| {
                let proxied = self.mapper.proxy(&member.name)?;
                member.name = proxied;
                Some(member)
            })
            .collect();

        write_one(client, header, prefix, doc_len, &reply).await
    }
}

/// Serves `getLastError`: proxies and caches a real reply, or replays the
/// cached one while keeping the client socket framed.
pub struct GetLastErrorRewriter;

impl GetLastErrorRewriter {
    pub async fn rewrite<C, S>(
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
        let header = *msg.header();

        if !last_error.exists() {
            // Run the real query and capture the reply.
            {
                let parts = msg.parts(client).await?;
                header.write_to(server).await?;
                parts.write_to(server).await?;
            }
            copy_exact(server, client, msg.pending()).await?;

            let reply_header = MsgHeader::read_from(server).await?;
            let mut body = vec![0u8; reply_header.body_len() as usize];
            server.read_exact(&mut body).await?;
            last_error.cache(reply_header, body);
            tracing::debug!("caching new getLastError response");
        } else {
            // Drain the rest of the request so the socket stays framed,
            // then replay the cached reply.
            discard_exact(client, msg.pending()).await?;
            tracing::debug!("using cached getLastError response");
        }

        last_error.write_reply_to(client, header.request_id).await
    }
}
