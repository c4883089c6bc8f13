//! The error taxonomy used across the consensus core.

use thiserror::Error;

use crate::NodeId;

/// Errors that can prevent a `Config` from being built.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("election timeout range is invalid: min={min} max={max}")]
    InvalidTimeoutRange { min: u64, max: u64 },

    #[error("heartbeat interval upper bound {heartbeat_max} must be below the election timeout floor {election_min}")]
    HeartbeatNotFasterThanElection { heartbeat_max: u64, election_min: u64 },

    #[error("max_payload_entries must be greater than zero")]
    ZeroMaxPayloadEntries,

    #[error("node {id} is not a member of its own cluster roster")]
    SelfNotInCluster { id: NodeId },
}

/// Fatal errors surfaced from the consensus core's main loop.
///
/// Protocol-level issues (stale terms, log mismatches, unknown message
/// types) are always recovered locally via the reply/retry flow described
/// in the RPC handlers and never become a `RaftError`. Only a durability
/// failure reaching the top of the event loop is represented here, plus the
/// handful of conditions under which the core can no longer honor a public
/// API call.
#[derive(Clone, Debug, Error)]
pub enum RaftError {
    #[error("the node's persistent store failed and the node cannot safely continue: {0}")]
    PersistIoFailure(String),

    #[error("the node is shutting down")]
    ShuttingDown,
}

pub type RaftResult<T> = Result<T, RaftError>;

/// Errors returned from `Raft::client_write`.
#[derive(Clone, Debug, Error)]
pub enum ClientWriteError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("this node is not the leader; last known leader is {leader_id:?}")]
    NotLeader { leader_id: Option<NodeId> },
}

/// Errors returned from `Raft::client_read`.
#[derive(Clone, Debug, Error)]
pub enum ClientReadError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("this node is not the leader; last known leader is {leader_id:?}")]
    NotLeader { leader_id: Option<NodeId> },
}
