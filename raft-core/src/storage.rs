//! Durable and in-memory storage used by a Raft node: the persisted
//! term/vote record, the replicated log plus its snapshot descriptor, and
//! the pluggable state machine that applies committed entries.

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;

/// The durable `{current_term, voted_for}` record every node keeps.
///
/// `set` always flushes to disk before returning, so a crash immediately
/// after a successful `set` never rolls the value back; this is the one
/// synchronous wait the cooperative event loop tolerates mid-handler.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

pub struct PersistentCell {
    path: PathBuf,
    state: HardState,
}

impl PersistentCell {
    /// Load the cell from `path`, or initialize a fresh `{0, None}` record
    /// if the file does not yet exist.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, state })
    }

    pub fn current_term(&self) -> u64 {
        self.state.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.state.voted_for
    }

    /// Persist `state`, fsyncing before returning.
    pub async fn set(&mut self, state: HardState) -> anyhow::Result<()> {
        self.state = state;
        self.flush().await
    }

    pub async fn set_voted_for(&mut self, voted_for: Option<NodeId>) -> anyhow::Result<()> {
        self.state.voted_for = voted_for;
        self.flush().await
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&self.state)?;
        let mut file = fs::File::create(&self.path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// The state-machine snapshot embedded directly in an `append_entries` RPC
/// once a follower's `next_index` falls at or below the leader's
/// compaction horizon. Unlike a chunked snapshot-streaming RPC, this is a
/// single inline blob: the engine does not decide when to compact, and
/// when it does, the resulting image is assumed small enough to ship in
/// one message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    /// Last log index included in the snapshot.
    pub index: u64,
    /// The term of the entry at `index`.
    pub term: u64,
    /// Opaque state-machine image.
    pub data: Vec<u8>,
    /// Number of log entries this snapshot replaces.
    pub count: u64,
}

impl SnapshotDescriptor {
    pub fn none() -> Self {
        Self {
            index: 0,
            term: 0,
            data: Vec::new(),
            count: 0,
        }
    }
}

/// The deterministic applier of committed log entries.
///
/// This is the one pluggable collaborator of the consensus core: the wire
/// protocol and replication logic never depend on what a command *means*,
/// only on the fact that applying the same entries in the same order
/// yields the same result everywhere.
#[async_trait]
pub trait StateMachine<D: AppData, R: AppDataResponse>: Send + Sync + 'static {
    /// Apply a committed entry, returning the response handed back to the
    /// client that submitted it (if still waiting).
    async fn apply(&self, index: u64, data: &D) -> R;

    /// Return a value representing the machine's current state, used to
    /// answer client `get` requests.
    async fn read(&self) -> R;

    /// Export the machine's state as an opaque blob suitable for embedding
    /// in a `SnapshotDescriptor`.
    async fn snapshot(&self) -> Vec<u8>;

    /// Replace the machine's state with a previously exported snapshot.
    async fn restore(&self, snapshot: &[u8]);
}

/// The replicated log: entries plus the snapshot descriptor that bounds
/// them, and the commit index.
///
/// Entries are stored for indices `(compacted.index, last_index]`. All
/// mutating operations are immediately persisted; the file layout used to
/// do so is local to this type and is not part of the peer wire protocol.
pub struct LogStore<D: AppData, R: AppDataResponse, SM: StateMachine<D, R>> {
    dir: PathBuf,
    entries: Vec<Entry<D>>,
    compacted: SnapshotDescriptor,
    commit_index: u64,
    state_machine: SM,
    _marker: std::marker::PhantomData<R>,
}

#[derive(Serialize, Deserialize)]
struct LogFile<D: AppData> {
    compacted: SnapshotDescriptor,
    commit_index: u64,
    #[serde(bound = "D: AppData")]
    entries: Vec<Entry<D>>,
}

impl<D: AppData, R: AppDataResponse, SM: StateMachine<D, R>> LogStore<D, R, SM> {
    /// Open (or initialize) the log stored under `dir`, applying any
    /// already-committed entries to `state_machine` to catch it up after a
    /// restart.
    pub async fn open(dir: impl Into<PathBuf>, state_machine: SM) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let path = Self::log_path(&dir);
        let file: LogFile<D> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LogFile {
                compacted: SnapshotDescriptor::none(),
                commit_index: 0,
                entries: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };

        if !file.compacted.data.is_empty() {
            state_machine.restore(&file.compacted.data).await;
        }
        let base = file.compacted.index;
        for (offset, entry) in file.entries.iter().enumerate() {
            let index = base + offset as u64 + 1;
            if index <= file.commit_index {
                state_machine.apply(index, &entry.data).await;
            }
        }

        Ok(Self {
            dir,
            entries: file.entries,
            compacted: file.compacted,
            commit_index: file.commit_index,
            state_machine,
            _marker: std::marker::PhantomData,
        })
    }

    fn log_path(dir: &Path) -> PathBuf {
        dir.join("log.json")
    }

    pub fn state_machine(&self) -> &SM {
        &self.state_machine
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn compacted(&self) -> &SnapshotDescriptor {
        &self.compacted
    }

    /// The index of the last entry this node holds (snapshot or log).
    pub fn index(&self) -> u64 {
        self.compacted.index + self.entries.len() as u64
    }

    /// The term of the entry at `index`, or of the current last entry when
    /// `index` is omitted. Index `0` and indices at or below the snapshot
    /// horizon both resolve via `compacted.term`, which defaults to `0`
    /// for a pristine node — making a fresh leader's first `prev_log_index
    /// = 0` probe always match.
    pub fn term(&self, index: u64) -> u64 {
        if index == 0 {
            return if self.compacted.index == 0 { 0 } else { self.compacted.term };
        }
        if index <= self.compacted.index {
            return self.compacted.term;
        }
        let offset = (index - self.compacted.index - 1) as usize;
        self.entries.get(offset).map(|e| e.log_id.term).unwrap_or(0)
    }

    /// Entries in the half-open range `[lo, hi)`, clamped to what is
    /// actually held in memory.
    pub fn slice(&self, lo: u64, hi: u64) -> Vec<Entry<D>> {
        if lo >= hi {
            return Vec::new();
        }
        let start = lo.saturating_sub(self.compacted.index + 1) as usize;
        let end = (hi.saturating_sub(self.compacted.index + 1)) as usize;
        let end = end.min(self.entries.len());
        if start >= self.entries.len() || start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }

    /// Append a single new entry authored by this node (a leader appending
    /// a freshly received client command) at `index() + 1`, returning that
    /// index.
    pub async fn propose(&mut self, term: u64, data: D) -> anyhow::Result<u64> {
        let index = self.index() + 1;
        self.entries.push(Entry {
            log_id: crate::LogId::new(term, index),
            data,
        });
        self.flush().await?;
        Ok(index)
    }

    /// Truncate any entries conflicting with `entries` (same position,
    /// different term) and append everything past the current log tail.
    /// Entries already present and matching are left untouched, so replaying
    /// the same `append_entries` RPC twice is a no-op.
    pub async fn append_entries(&mut self, entries: Vec<Entry<D>>, prev_index: u64) -> anyhow::Result<()> {
        let mut next = prev_index;
        let mut to_append = Vec::new();
        for entry in entries {
            next += 1;
            if next <= self.compacted.index {
                continue;
            }
            let existing_term = self.term(next);
            if existing_term != 0 && next <= self.index() {
                if existing_term == entry.log_id.term {
                    continue;
                }
                let offset = (next - self.compacted.index - 1) as usize;
                self.entries.truncate(offset);
            }
            if next > self.index() {
                to_append.push(entry);
            }
        }
        self.entries.extend(to_append);
        self.flush().await
    }

    /// Advance the commit index monotonically to `min(max(commit_index,
    /// new_commit), index())`, applying newly committed entries to the
    /// state machine in order. Returns each newly applied index paired
    /// with the state machine's response, so a leader can answer the
    /// clients waiting on those entries.
    pub async fn commit(&mut self, new_commit: u64) -> anyhow::Result<Vec<(u64, R)>> {
        let target = new_commit.max(self.commit_index).min(self.index());
        let mut applied = Vec::new();
        for index in (self.commit_index + 1)..=target {
            if index <= self.compacted.index {
                continue;
            }
            let offset = (index - self.compacted.index - 1) as usize;
            let data = self.entries[offset].data.clone();
            let response = self.state_machine.apply(index, &data).await;
            applied.push((index, response));
        }
        self.commit_index = target;
        self.flush().await?;
        Ok(applied)
    }

    /// Replace the log with a new snapshot descriptor, discarding any
    /// in-memory entries it subsumes, and advance `commit_index` to the
    /// snapshot's index if the node had not committed that far already.
    pub async fn install_snapshot(&mut self, compacted: SnapshotDescriptor) -> anyhow::Result<()> {
        self.state_machine.restore(&compacted.data).await;
        if compacted.index > self.compacted.index {
            let retain_from = compacted.index.saturating_sub(self.compacted.index) as usize;
            if retain_from < self.entries.len() {
                self.entries = self.entries.split_off(retain_from);
            } else {
                self.entries.clear();
            }
        } else {
            self.entries.clear();
        }
        self.commit_index = self.commit_index.max(compacted.index);
        self.compacted = compacted;
        self.flush().await
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let file = LogFile {
            compacted: self.compacted.clone(),
            commit_index: self.commit_index,
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec(&file)?;
        let mut f = fs::File::create(Self::log_path(&self.dir)).await?;
        f.write_all(&bytes).await?;
        f.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullStateMachine;

    #[async_trait]
    impl StateMachine<String, ()> for NullStateMachine {
        async fn apply(&self, _index: u64, _data: &String) {}
        async fn read(&self) {}
        async fn snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        async fn restore(&self, _snapshot: &[u8]) {}
    }

    fn entry(term: u64, index: u64, data: &str) -> Entry<String> {
        Entry {
            log_id: crate::LogId::new(term, index),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn append_and_term_and_slice() {
        let dir = tempdir();
        let mut log = LogStore::open(&dir, NullStateMachine).await.unwrap();
        assert_eq!(log.index(), 0);
        assert_eq!(log.term(0), 0);

        log.append_entries(vec![entry(1, 1, "a"), entry(1, 2, "b")], 0).await.unwrap();
        assert_eq!(log.index(), 2);
        assert_eq!(log.term(2), 1);
        assert_eq!(log.slice(1, 3).len(), 2);
    }

    #[tokio::test]
    async fn conflicting_entries_are_truncated() {
        let dir = tempdir();
        let mut log = LogStore::open(&dir, NullStateMachine).await.unwrap();
        log.append_entries(vec![entry(1, 1, "a"), entry(1, 2, "b")], 0).await.unwrap();
        // A new leader's term-2 entry at index 2 conflicts with the old one.
        log.append_entries(vec![entry(2, 2, "c")], 1).await.unwrap();
        assert_eq!(log.index(), 2);
        assert_eq!(log.term(2), 2);
    }

    #[tokio::test]
    async fn duplicate_append_is_idempotent() {
        let dir = tempdir();
        let mut log = LogStore::open(&dir, NullStateMachine).await.unwrap();
        let entries = vec![entry(1, 1, "a"), entry(1, 2, "b")];
        log.append_entries(entries.clone(), 0).await.unwrap();
        log.append_entries(entries, 0).await.unwrap();
        assert_eq!(log.index(), 2);
        assert_eq!(log.slice(1, 3).len(), 2);
    }

    #[tokio::test]
    async fn commit_is_monotone_and_clamped() {
        let dir = tempdir();
        let mut log = LogStore::open(&dir, NullStateMachine).await.unwrap();
        log.append_entries(vec![entry(1, 1, "a")], 0).await.unwrap();
        log.commit(5).await.unwrap();
        assert_eq!(log.commit_index(), 1);
        log.commit(0).await.unwrap();
        assert_eq!(log.commit_index(), 1);
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("raft-core-logstore-test-{}", uuid_like()));
        p
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }
}
