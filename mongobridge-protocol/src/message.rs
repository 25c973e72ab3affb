//! Command response document types.
//!
//! These are the `isMaster` and `replSetGetStatus` reply shapes the proxy
//! inspects and rewrites. Unknown fields are preserved verbatim through the
//! flattened `extra` document so a rewrite never strips information the
//! client may rely on.

use bson::Document;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric replica member state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaState(pub i32);

impl ReplicaState {
    pub const STARTUP: ReplicaState = ReplicaState(0);
    pub const PRIMARY: ReplicaState = ReplicaState(1);
    pub const SECONDARY: ReplicaState = ReplicaState(2);
    pub const RECOVERING: ReplicaState = ReplicaState(3);
    pub const STARTUP2: ReplicaState = ReplicaState(5);
    pub const UNKNOWN: ReplicaState = ReplicaState(6);
    pub const ARBITER: ReplicaState = ReplicaState(7);
    pub const DOWN: ReplicaState = ReplicaState(8);
    pub const ROLLBACK: ReplicaState = ReplicaState(9);
    pub const REMOVED: ReplicaState = ReplicaState(10);

    /// Returns whether members in this state are retained in a topology
    /// snapshot.
    pub fn is_tracked(&self) -> bool {
        matches!(
            *self,
            ReplicaState::PRIMARY
                | ReplicaState::SECONDARY
                | ReplicaState::ARBITER
                | ReplicaState::DOWN
        )
    }

    /// Returns whether a member in this state can serve client traffic.
    pub fn is_serving(&self) -> bool {
        matches!(*self, ReplicaState::PRIMARY | ReplicaState::SECONDARY)
    }

    /// Returns whether a member in this state is still initializing.
    pub fn is_starting(&self) -> bool {
        matches!(
            *self,
            ReplicaState::STARTUP | ReplicaState::STARTUP2 | ReplicaState::UNKNOWN
        )
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            ReplicaState::STARTUP => "STARTUP",
            ReplicaState::PRIMARY => "PRIMARY",
            ReplicaState::SECONDARY => "SECONDARY",
            ReplicaState::RECOVERING => "RECOVERING",
            ReplicaState::STARTUP2 => "STARTUP2",
            ReplicaState::UNKNOWN => "UNKNOWN",
            ReplicaState::ARBITER => "ARBITER",
            ReplicaState::DOWN => "DOWN",
            ReplicaState::ROLLBACK => "ROLLBACK",
            ReplicaState::REMOVED => "REMOVED",
            ReplicaState(other) => return write!(f, "STATE({})", other),
        };
        f.write_str(name)
    }
}

/// Reply document for the `isMaster` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsMasterReply {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arbiters: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,

    /// All other reply fields, carried through unchanged.
    #[serde(flatten)]
    pub extra: Document,
}

/// One member entry in a `replSetGetStatus` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMember {
    pub name: String,

    #[serde(rename = "state")]
    pub state: ReplicaState,

    #[serde(
        rename = "stateStr",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_str: Option<String>,

    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub is_self: Option<bool>,

    #[serde(flatten)]
    pub extra: Document,
}

/// Reply document for the `replSetGetStatus` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplSetStatusReply {
    #[serde(rename = "set", default, skip_serializing_if = "Option::is_none")]
    pub set_name: Option<String>,

    #[serde(default)]
    pub members: Vec<StatusMember>,

    #[serde(flatten)]
    pub extra: Document,
}

impl ReplSetStatusReply {
    /// Top-level numeric `code` field, if present in any integer width.
    pub fn error_code(&self) -> Option<i64> {
        match self.extra.get("code") {
            Some(bson::Bson::Int32(code)) => Some(*code as i64),
            Some(bson::Bson::Int64(code)) => Some(*code),
            Some(bson::Bson::Double(code)) => Some(*code as i64),
            _ => None,
        }
    }
}
