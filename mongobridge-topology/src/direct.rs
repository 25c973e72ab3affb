//! Direct single-server client.
//!
//! Topology probes and health checks need to talk to exactly one server,
//! fail fast, and run a couple of admin commands. This client does only
//! that.

use crate::error::TopologyError;
use bson::Document;
use mongobridge_protocol::command::{command_ok, run_command};
use mongobridge_proxy::auth::login;
use mongobridge_proxy::{BackendStream, BackendTls, Credential};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::net::TcpStream;

/// A fail-fast connection to a single server.
pub struct DirectClient {
    stream: BackendStream,
    op_timeout: Duration,
}

impl DirectClient {
    /// Dials `addr` directly, upgrades to TLS and logs in as configured.
    /// Every step is bounded by `timeout`.
    pub async fn connect(
        addr: &str,
        tls: Option<&BackendTls>,
        cred: Option<&Credential>,
        timeout: Duration,
    ) -> Result<Self, TopologyError> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TopologyError::Unreachable(addr.to_string()))?
            .map_err(|_| TopologyError::Unreachable(addr.to_string()))?;
        tcp.set_nodelay(true).ok();

        let mut stream = match tls {
            Some(tls) => tokio::time::timeout(timeout, tls.connect(addr, tcp))
                .await
                .map_err(|_| TopologyError::Unreachable(addr.to_string()))??,
            None => BackendStream::Plain { stream: tcp },
        };

        if let Some(cred) = cred.filter(|c| c.is_configured()) {
            tokio::time::timeout(timeout, login(&mut stream, cred))
                .await
                .map_err(|_| TopologyError::Timeout)??;
        }

        Ok(Self {
            stream,
            op_timeout: timeout,
        })
    }

    /// Runs one command against `<db>.$cmd` under the client's timeout.
    pub async fn run_command<T>(&mut self, db: &str, command: &Document) -> Result<T, TopologyError>
    where
        T: DeserializeOwned,
    {
        tokio::time::timeout(self.op_timeout, run_command(&mut self.stream, db, command))
            .await
            .map_err(|_| TopologyError::Timeout)?
            .map_err(TopologyError::from)
    }

    /// Runs a command and requires `ok: 1` in the reply, returning the raw
    /// document.
    pub async fn run_command_ok(
        &mut self,
        db: &str,
        name: &str,
        command: &Document,
    ) -> Result<Document, TopologyError> {
        let reply: Document = self.run_command(db, command).await?;
        if !command_ok(&reply) {
            let message = reply
                .get_str("errmsg")
                .unwrap_or("command returned ok: 0")
                .to_string();
            return Err(TopologyError::CommandFailed(name.to_string(), message));
        }
        Ok(reply)
    }
}
