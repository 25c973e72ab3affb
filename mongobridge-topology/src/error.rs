//! Topology error types.

use thiserror::Error;

/// Errors raised by topology discovery and management.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] mongobridge_protocol::ProtocolError),

    #[error("proxy error: {0}")]
    Proxy(#[from] mongobridge_proxy::ProxyError),

    #[error("no reachable server at {0}")]
    Unreachable(String),

    #[error("could not connect to any provided addresses: {0}")]
    NoUsableSeeds(String),

    #[error("conflicting replica set state:\n{0}\nVS\n{1}")]
    Conflict(String, String),

    #[error("no healthy primaries or secondaries: {0}")]
    NoHealthyMembers(String),

    #[error("mongo {0} is not in the replica set")]
    NotInReplicaSet(String),

    #[error("could not find a free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("removed replica still present")]
    RemovedReplica,

    #[error("single node replica set in bad state: {0}")]
    SingleNodeBadState(String),

    #[error("node is busy starting up: {0}")]
    NodeStarting(String),

    #[error("no members found")]
    NoMembers,

    #[error("proxy {0} already used in replica set")]
    DuplicateProxy(String),

    #[error("mongo {0} already exists in replica set")]
    DuplicateMongo(String),

    #[error("command {0} failed: {1}")]
    CommandFailed(String, String),

    #[error("timed out")]
    Timeout,
}
