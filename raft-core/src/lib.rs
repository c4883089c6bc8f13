//! A small, single-threaded-per-node Raft consensus engine.
//!
//! Each node runs its consensus state machine on one logical executor: one
//! `tokio` task drains a single inbound-message channel and the node's own
//! timers via `tokio::select!`. There is no locking around the persisted
//! term/vote record or the log, because nothing else ever touches them.
//!
//! The engine is generic over the application's command type (`AppData`),
//! its response type (`AppDataResponse`), the state machine that applies
//! committed commands (`StateMachine`), and the transport used to reach
//! peers (`RaftNetwork`). A concrete in-memory state machine and a simulated
//! in-process network live in the sibling `memkv` crate.

use std::fmt::Debug;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft;
pub mod storage;

pub use config::Config;
pub use config::ConfigBuilder;
pub use error::RaftError;
pub use error::RaftResult;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use storage::LogStore;
pub use storage::PersistentCell;
pub use storage::StateMachine;

/// The identifier of a cluster node. Addresses are resolved by the network
/// layer; the consensus core only ever deals in these small integers.
pub type NodeId = u64;

/// A command accepted from a client and replicated through the log.
///
/// Blanket-implemented for any type that can travel over the wire and be
/// stored, matching the bound the engine actually needs at each use site.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The result of applying an `AppData` command to a `StateMachine`.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A one-line rendering of a protocol message, used only for trace logging.
///
/// Implemented for the request/response types in [`raft`] so that
/// `#[tracing::instrument]` call sites can log a summary without requiring
/// `AppData: Display`.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// A log position: the pairing of an index with the term in which the entry
/// at that index was created. Comparing two `LogId`s by term-then-index is
/// the canonical "which log is more up to date" test used during elections.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.term, self.index)
    }
}
