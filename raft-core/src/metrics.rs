//! A `watch`-channel snapshot of a node's consensus state, published on
//! every state change so that callers (and the test harness) can await
//! convergence instead of polling the node's internals directly.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::State;
use crate::NodeId;

/// A point-in-time snapshot of one node's externally visible Raft state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub current_leader: Option<NodeId>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            current_leader: None,
        }
    }
}

/// A handle for awaiting a condition on a node's metrics stream.
///
/// ```ignore
/// raft.wait(Some(Duration::from_millis(500))).log_index(3).await?;
/// raft.wait(None).state(State::Leader).await?;
/// ```
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting on metrics condition")]
    Timeout(Duration),

    #[error("the metrics channel was closed")]
    Closed,
}

impl Wait {
    async fn poll_until(
        &mut self,
        mut matches: impl FnMut(&RaftMetrics) -> bool,
    ) -> Result<RaftMetrics, WaitError> {
        let fut = async {
            loop {
                let snapshot = self.rx.borrow().clone();
                if matches(&snapshot) {
                    return Ok(snapshot);
                }
                if self.rx.changed().await.is_err() {
                    return Err(WaitError::Closed);
                }
            }
        };
        timeout(self.timeout, fut).await.map_err(|_| WaitError::Timeout(self.timeout))?
    }

    pub async fn state(&mut self, want: State) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.state == want).await
    }

    pub async fn current_leader(&mut self, want: NodeId) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.current_leader == Some(want)).await
    }

    pub async fn log_index(&mut self, want: u64) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.last_log_index >= want).await
    }

    pub async fn commit_index(&mut self, want: u64) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.commit_index >= want).await
    }

    pub async fn current_term(&mut self, want: u64) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.current_term >= want).await
    }
}
