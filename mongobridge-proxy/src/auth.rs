//! Backend authentication.
//!
//! Two mechanisms are supported, matching what the classic wire protocol
//! offers: the nonce/MD5 challenge-response (`MONGODB-CR`, historically also
//! spelled `MONGO-CR`) and X.509 client certificates (`MONGODB-X509`).
//! Anything else is rejected at configuration time.

use crate::error::ProxyError;
use bson::{doc, Document};
use mongobridge_protocol::command::{command_ok, run_command};
use tokio::io::{AsyncRead, AsyncWrite};

pub const MECHANISM_CR: &str = "MONGODB-CR";
pub const MECHANISM_CR_LEGACY: &str = "MONGO-CR";
pub const MECHANISM_X509: &str = "MONGODB-X509";

/// Credentials used to log in to backend servers.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub username: String,
    /// Optional with X.509.
    pub password: String,
    /// Empty means MONGODB-CR.
    pub mechanism: String,
    /// Database used to establish credentials. Defaults to `admin`, or
    /// `$external` for X.509.
    pub source: String,
}

impl Credential {
    /// Returns whether credentials are configured at all.
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty()
    }

    /// The database authentication runs against.
    pub fn auth_source(&self) -> &str {
        if self.mechanism == MECHANISM_X509 {
            "$external"
        } else if self.source.is_empty() {
            "admin"
        } else {
            &self.source
        }
    }

    /// Validates that the mechanism is one we can speak.
    pub fn validate_mechanism(&self) -> Result<(), ProxyError> {
        match self.mechanism.as_str() {
            "" | MECHANISM_CR | MECHANISM_CR_LEGACY | MECHANISM_X509 => Ok(()),
            other => Err(ProxyError::UnknownMechanism(other.to_string())),
        }
    }
}

/// Logs in on a freshly dialed backend connection.
pub async fn login<S>(stream: &mut S, cred: &Credential) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match cred.mechanism.as_str() {
        "" | MECHANISM_CR | MECHANISM_CR_LEGACY => login_classic(stream, cred).await,
        MECHANISM_X509 => login_x509(stream, cred).await,
        other => Err(ProxyError::UnknownMechanism(other.to_string())),
    }
}

/// Classic nonce handshake: `getnonce`, then `authenticate` with
/// `md5(nonce + user + md5(user:mongo:password))`.
async fn login_classic<S>(stream: &mut S, cred: &Credential) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let source = cred.auth_source();

    let nonce_reply: Document = run_command(stream, source, &doc! { "getnonce": 1 }).await?;
    if !command_ok(&nonce_reply) {
        return Err(ProxyError::AuthFailed(reply_error(&nonce_reply)));
    }
    let nonce = nonce_reply
        .get_str("nonce")
        .map_err(|_| ProxyError::AuthFailed("getnonce returned no nonce".into()))?;

    tracing::debug!(source, "requesting nonce login");
    let key = mongodb_cr_key(nonce, &cred.username, &cred.password);
    let auth_reply: Document = run_command(
        stream,
        source,
        &doc! {
            "authenticate": 1,
            "user": &cred.username,
            "nonce": nonce,
            "key": key,
        },
    )
    .await?;

    if !command_ok(&auth_reply) {
        return Err(ProxyError::AuthFailed(reply_error(&auth_reply)));
    }
    Ok(())
}

/// X.509 login against `$external`. The username is the certificate
/// subject.
async fn login_x509<S>(stream: &mut S, cred: &Credential) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!("logging in with MONGODB-X509");
    let auth_reply: Document = run_command(
        stream,
        "$external",
        &doc! {
            "authenticate": 1,
            "mechanism": MECHANISM_X509,
            "user": &cred.username,
        },
    )
    .await?;

    if !command_ok(&auth_reply) {
        return Err(ProxyError::AuthFailed(reply_error(&auth_reply)));
    }
    Ok(())
}

/// Derives the MONGODB-CR proof for a nonce.
pub fn mongodb_cr_key(nonce: &str, username: &str, password: &str) -> String {
    let password_digest = md5::compute(format!("{}:mongo:{}", username, password));
    let key_digest = md5::compute(format!(
        "{}{}{}",
        nonce,
        username,
        hex::encode(password_digest.0)
    ));
    hex::encode(key_digest.0)
}

fn reply_error(doc: &Document) -> String {
    doc.get_str("errmsg")
        .unwrap_or("server rejected authentication")
        .to_string()
}
