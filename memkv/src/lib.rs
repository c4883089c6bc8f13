//! A minimal in-memory key/value state machine and a simulated in-process
//! network, used by the integration tests and the demo binary. Neither is
//! part of the consensus engine itself — `raft-core` only depends on the
//! `StateMachine` and `RaftNetwork` traits these types implement.

pub mod network;

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use raft_core::StateMachine;
use serde::Deserialize;
use serde::Serialize;

pub use network::MemRouter;
pub use network::NodeNetwork;

/// A command accepted by `KvStateMachine`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

/// The response to a command applied to `KvStateMachine`, or to a read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KvResponse {
    /// The value a `Set`/`Delete` replaced, if any.
    Written { previous: Option<String> },
    /// A full snapshot of the map, returned from client reads.
    Snapshot(BTreeMap<String, String>),
}

/// A deterministic, in-memory key/value store.
#[derive(Default)]
pub struct KvStateMachine {
    map: Mutex<BTreeMap<String, String>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateMachine<KvCommand, KvResponse> for KvStateMachine {
    async fn apply(&self, _index: u64, data: &KvCommand) -> KvResponse {
        let mut map = self.map.lock().unwrap();
        let previous = match data {
            KvCommand::Set { key, value } => map.insert(key.clone(), value.clone()),
            KvCommand::Delete { key } => map.remove(key),
        };
        KvResponse::Written { previous }
    }

    async fn read(&self) -> KvResponse {
        KvResponse::Snapshot(self.map.lock().unwrap().clone())
    }

    async fn snapshot(&self) -> Vec<u8> {
        let map = self.map.lock().unwrap();
        serde_json::to_vec(&*map).expect("in-memory map always serializes")
    }

    async fn restore(&self, snapshot: &[u8]) {
        let restored: BTreeMap<String, String> = if snapshot.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(snapshot).expect("snapshot produced by this state machine")
        };
        *self.map.lock().unwrap() = restored;
    }
}
