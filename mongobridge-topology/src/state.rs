//! Replica-set state snapshots.
//!
//! A snapshot is the pair of `replSetGetStatus` and `isMaster` answers
//! from a single member, filtered down to the states the proxy tracks.
//! Seeds must agree with each other: a disagreement is a conflict, not a
//! vote.

use crate::direct::DirectClient;
use crate::error::TopologyError;
use bson::doc;
use mongobridge_proxy::{BackendTls, Credential};
use mongobridge_protocol::{IsMasterReply, ReplSetStatusReply, ReplicaState};
use std::time::Duration;

/// Socket and sync timeout for topology probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot of the replica-set configuration at some point in time.
#[derive(Debug, Clone)]
pub struct ReplicaSetState {
    pub status: ReplSetStatusReply,
    pub is_master: IsMasterReply,
}

impl ReplicaSetState {
    /// Probes a single member directly and validates what it reports.
    pub async fn probe(
        addr: &str,
        cred: Option<&Credential>,
        tls: Option<&BackendTls>,
    ) -> Result<Self, TopologyError> {
        let mut client = DirectClient::connect(addr, tls, cred, PROBE_TIMEOUT).await?;

        let status_doc = client
            .run_command_ok("admin", "replSetGetStatus", &doc! { "replSetGetStatus": 1 })
            .await?;
        let status: ReplSetStatusReply = bson::from_document(status_doc)
            .map_err(mongobridge_protocol::ProtocolError::from)?;

        // Self checks look at the raw report; the single-member check runs
        // after filtering, since dropping untracked members may collapse
        // the set to one node.
        validate_self(&status)?;
        let status = filter_members(status);
        validate(&status)?;

        let is_master: IsMasterReply = client
            .run_command("admin", &doc! { "isMaster": 1 })
            .await?;

        Ok(Self { status, is_master })
    }

    /// Addresses of members able to serve client traffic.
    pub fn addrs(&self) -> Vec<String> {
        self.status
            .members
            .iter()
            .filter(|m| m.state.is_serving())
            .map(|m| m.name.clone())
            .collect()
    }

    /// Returns whether both snapshots describe the same topology.
    pub fn equal(&self, other: &ReplicaSetState) -> bool {
        self.same_status(other) && self.same_is_master(other)
    }

    /// Fails with a rich conflict error when the snapshots disagree.
    pub fn assert_equal(&self, other: &ReplicaSetState) -> Result<(), TopologyError> {
        if self.equal(other) {
            return Ok(());
        }
        Err(TopologyError::Conflict(
            format!("{:#?}", self),
            format!("{:#?}", other),
        ))
    }

    /// Same member-name sets in `replSetGetStatus`.
    fn same_status(&self, other: &ReplicaSetState) -> bool {
        let mut ours: Vec<&str> = self.status.members.iter().map(|m| m.name.as_str()).collect();
        let mut theirs: Vec<&str> = other
            .status
            .members
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }

    /// Same host lists in `isMaster`, plus the primary when both sides
    /// report one (a member may not know the primary yet).
    fn same_is_master(&self, other: &ReplicaSetState) -> bool {
        let mut ours: Vec<&str> = self.is_master.hosts.iter().map(String::as_str).collect();
        let mut theirs: Vec<&str> = other.is_master.hosts.iter().map(String::as_str).collect();
        if ours.len() != theirs.len() {
            return false;
        }
        ours.sort_unstable();
        theirs.sort_unstable();

        if let (Some(a), Some(b)) = (
            self.is_master.primary.as_deref(),
            other.is_master.primary.as_deref(),
        ) {
            ours.push(a);
            theirs.push(b);
        }
        ours == theirs
    }
}

/// Rejects snapshots from a member that reports itself removed or still
/// starting up. Runs on the raw member list, before filtering.
pub(crate) fn validate_self(status: &ReplSetStatusReply) -> Result<(), TopologyError> {
    if status.members.len() == 1 && status.members[0].state == ReplicaState::REMOVED {
        return Err(TopologyError::RemovedReplica);
    }

    for member in &status.members {
        if member.is_self == Some(true) {
            if member.state == ReplicaState::REMOVED {
                return Err(TopologyError::RemovedReplica);
            }
            if member.state.is_starting() {
                return Err(TopologyError::NodeStarting(member.name.clone()));
            }
        }
    }
    Ok(())
}

/// Rejects a snapshot whose tracked members collapse to a single node
/// unable to serve clients. Runs on the filtered member list.
pub(crate) fn validate(status: &ReplSetStatusReply) -> Result<(), TopologyError> {
    if status.members.len() == 1 {
        let only = &status.members[0];
        if !only.state.is_serving() {
            return Err(TopologyError::SingleNodeBadState(format!(
                "{} is {}",
                only.name, only.state
            )));
        }
    }
    Ok(())
}

/// Keeps only members in states the proxy tracks.
pub(crate) fn filter_members(mut status: ReplSetStatusReply) -> ReplSetStatusReply {
    status.members.retain(|m| m.state.is_tracked());
    status
}

/// Builds a snapshot from seed addresses.
///
/// Unreachable seeds are skipped; reachable ones must all agree, and when
/// a set name is configured, members of other sets are skipped too.
pub async fn from_addrs(
    addrs: &[String],
    set_name: &str,
    cred: Option<&Credential>,
    tls: Option<&BackendTls>,
) -> Result<ReplicaSetState, TopologyError> {
    let mut reference: Option<ReplicaSetState> = None;

    for addr in addrs {
        let state = match ReplicaSetState::probe(addr, cred, tls).await {
            Ok(state) => state,
            Err(TopologyError::Unreachable(_)) => continue,
            Err(e) => {
                tracing::warn!(addr = %addr, "ignoring failure against seed: {}", e);
                continue;
            }
        };

        if !set_name.is_empty() {
            match state.status.set_name.as_deref() {
                Some(name) if name == set_name => {}
                Some(name) => {
                    tracing::warn!(
                        addr = %addr,
                        "ignoring node in replica set {:?}, expected {:?}",
                        name,
                        set_name
                    );
                    continue;
                }
                None => {
                    tracing::warn!(
                        addr = %addr,
                        "ignoring standalone node not in expected replica set {:?}",
                        set_name
                    );
                    continue;
                }
            }
        }

        match &reference {
            None => reference = Some(state),
            Some(first) => first.assert_equal(&state)?,
        }
    }

    reference.ok_or_else(|| TopologyError::NoUsableSeeds(addrs.join(",")))
}
