//! Client-facing helpers shared across roles: the non-leader redirect
//! error, and the leader's bookkeeping of clients waiting on a commit.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::error::ClientWriteError;
use crate::raft::ClientWriteResponse;
use crate::AppDataResponse;
use crate::NodeId;

/// The error every non-leader role replies with to a `ClientWrite` message.
pub(crate) fn not_leader_write_error(current_leader: Option<NodeId>) -> ClientWriteError {
    ClientWriteError::NotLeader { leader_id: current_leader }
}

type WriteTx<R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError>>;

/// Clients awaiting the commit of the log entry they submitted, keyed by
/// that entry's index.
pub(crate) struct WaitingClients<R: AppDataResponse> {
    by_index: BTreeMap<u64, Vec<WriteTx<R>>>,
}

impl<R: AppDataResponse> WaitingClients<R> {
    pub(crate) fn new() -> Self {
        Self { by_index: BTreeMap::new() }
    }

    pub(crate) fn wait_for(&mut self, index: u64, tx: WriteTx<R>) {
        self.by_index.entry(index).or_insert_with(Vec::new).push(tx);
    }

    /// Notify every client whose entry is among `applied` — the entries a
    /// `LogStore::commit` call has just applied, each already satisfying
    /// `index <= commit_index` by construction — with the state machine's
    /// response for that entry, then drop the bucket.
    ///
    /// Each answered index's bucket is removed individually as it is
    /// drained, never in bulk from a single index captured after a loop, so
    /// a later round can't re-answer or mis-clear an index untouched this
    /// time.
    pub(crate) fn ack_committed(&mut self, applied: &[(u64, R)]) {
        for (index, data) in applied {
            if let Some(txs) = self.by_index.remove(index) {
                for tx in txs {
                    let _ = tx.send(Ok(ClientWriteResponse {
                        index: *index,
                        data: data.clone(),
                    }));
                }
            }
        }
    }

    /// Drop every waiting client without an answer — used when this node
    /// steps down from leader so the client can retry against whoever
    /// becomes leader next, per the redirect flow.
    pub(crate) fn clear(&mut self) {
        self.by_index.clear();
    }
}
