//! Public Raft interface and wire message types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::SnapshotDescriptor;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::StateMachine;

struct RaftInner<D: AppData, R: AppDataResponse> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// A running Raft node.
///
/// Cloning this handle is cheap (it's an `Arc` around a channel to the
/// node's single event-loop task) and is the normal way to hand the same
/// node out to multiple callers — a transport layer dispatching inbound
/// peer RPCs and an application dispatching client requests, for instance.
///
/// Every method here enqueues a message onto the node's single inbound
/// channel and awaits a reply; the node's event loop is the only thing
/// that ever mutates its persisted state or its log.
pub struct Raft<D: AppData, R: AppDataResponse> {
    inner: Arc<RaftInner<D, R>>,
}

impl<D: AppData, R: AppDataResponse> Raft<D, R> {
    /// Spawn a new Raft node and return a handle to it.
    #[tracing::instrument(level = "trace", skip(config, network, log))]
    pub fn spawn<N, SM>(config: Arc<Config>, network: Arc<N>, log: crate::LogStore<D, R, SM>) -> Self
    where
        N: RaftNetwork<D>,
        SM: StateMachine<D, R>,
    {
        let id = config.id;
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(config, network, log, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this node (§5.3 of the Raft paper;
    /// also used as the heartbeat).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a RequestVote RPC to this node (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a client write (§5.1). Returns the state machine's response
    /// once the entry is committed and applied, or a redirect error if this
    /// node is not the leader.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientWrite { rpc, tx }, span))
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?
    }

    /// Read the state machine's current value. Any node can answer this; a
    /// non-leader answers directly rather than redirecting, since reads do
    /// not need to go through the leader in this engine.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<R, ClientReadError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientRead { tx }, span))
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?
    }

    /// Ask this node for a structured diagnostic report of its role,
    /// persisted fields, volatile fields, and log metadata.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn diagnostic(&self) -> Result<DiagnosticReport, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Diagnostic { tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle for awaiting a condition on this node's metrics.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut this node down and await the termination of its event loop.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse> Clone for Raft<D, R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<VoteResponse>,
    },
    ClientWrite {
        rpc: ClientWriteRequest<D>,
        tx: oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError>>,
    },
    ClientRead {
        tx: oneshot::Sender<Result<R, ClientReadError>>,
    },
    Diagnostic {
        tx: oneshot::Sender<DiagnosticReport>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A Raft log entry: a term and an opaque application command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub data: D,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}", self.log_id)
    }
}

impl<D: AppData> MessageSummary for [Entry<D>] {
    fn summary(&self) -> String {
        self.iter().map(|e| e.log_id.to_string()).collect::<Vec<_>>().join(",")
    }
}

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as
/// a heartbeat when `entries` is empty. Carries an inline state-machine
/// snapshot when the target's `next_index` has fallen at or below the
/// leader's compaction horizon, in lieu of a separate chunked
/// install-snapshot RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    pub leader_commit: u64,
    pub snapshot: Option<SnapshotDescriptor>,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} prev=({}, {}) leader_commit={} n={} snapshot={}",
            self.term,
            self.leader_id,
            self.prev_log_index,
            self.prev_log_term,
            self.leader_commit,
            self.entries.len(),
            self.snapshot.is_some()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// The index this follower will expect to receive next. Always
    /// `log.index() + 1` at the time of reply, whether or not this request
    /// succeeded; the leader adopts this value directly for its own
    /// bookkeeping of that peer.
    pub next_index: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A client command to be appended to the log and, once committed, applied
/// to the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    #[serde(bound = "D: AppData")]
    pub data: D,
}

impl<D: AppData> ClientWriteRequest<D> {
    pub fn new(data: D) -> Self {
        Self { data }
    }
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        format!("{:?}", self.data)
    }
}

/// The response to a successful `ClientWriteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub index: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

/// A structured status report answering a client `diagnostic` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub id: NodeId,
    pub state: crate::core::State,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub current_leader: Option<NodeId>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub compacted_index: u64,
}
