//! The replicated log storage interface and data types.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::store::Transaction;
use crate::AgentId;
use crate::Index;
use crate::LogId;
use crate::MessageSummary;
use crate::Term;

/// An entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: LogId,
    /// The command carried by this entry. Its optional `client_id` is the
    /// idempotency key under which `inquire` finds the entry again.
    pub payload: Transaction,
}

impl MessageSummary for LogEntry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[LogEntry] {
    fn summary(&self) -> String {
        self.iter().map(|e| e.summary()).collect::<Vec<_>>().join(",")
    }
}

/// A frozen image of the committed store at a specific point of the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The id of the last log entry covered by this snapshot.
    pub last_log_id: LogId,
    /// The serialized tree of the committed store at that entry.
    pub image: Value,
}

/// A record holding the persistent-per-term state of a node.
///
/// Persisted atomically before any outgoing vote and before any message of
/// a higher term is accepted.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The highest term this node has observed.
    pub current_term: Term,
    /// The candidate this node voted for in `current_term`, if any.
    pub voted_for: Option<AgentId>,
}

/// The membership last persisted through `persist_active_agents`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedMembership {
    /// The active set at the time of persistence.
    pub active: Vec<AgentId>,
    /// The full pool at the time of persistence.
    pub pool: BTreeMap<AgentId, String>,
}

/// Everything an agent needs from its log store when booting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the log, `(0, 0)` for a pristine store.
    pub last_log_id: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The persisted membership, if the agency was formed before.
    pub membership: Option<PersistedMembership>,
}

impl InitialState {
    /// The initial state of a pristine node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            hard_state: HardState::default(),
            membership: None,
        }
    }
}

/// The storage contract of the agency: an append-only durable log with
/// snapshot load/store, range reads and compaction.
///
/// Any error returned from these methods is treated as an opaque storage
/// failure. During boot such a failure is fatal; at runtime it fails the
/// affected request or replication round only, and the storage engine is
/// expected to have kept the log consistent.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Fetch the persisted state needed at boot.
    async fn initial_state(&self) -> Result<InitialState>;

    /// Persist the hard state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Append leader-side entries, assigning contiguous indices under the
    /// given term. Returns the assigned indices, in input order.
    async fn append(&self, payloads: &[Transaction], term: Term) -> Result<Vec<Index>>;

    /// Apply an append package on the follower side.
    ///
    /// An optional snapshot comes first and replaces everything before its
    /// index. Entries conflicting with already stored ones (same index,
    /// different term) cause the local tail to be truncated before the new
    /// entries are stored; entries that would leave a gap are discarded.
    /// Returns the index of the last entry in the local log afterwards.
    async fn log_follower(&self, snapshot: Option<&Snapshot>, entries: &[LogEntry]) -> Result<Index>;

    /// Read entries with indices in `[from, to]`. Entries removed by
    /// compaction are silently absent from the result.
    async fn get(&self, from: Index, to: Index) -> Result<Vec<LogEntry>>;

    /// Like `get`, but returning the payloads only.
    async fn slices(&self, from: Index, to: Index) -> Result<Vec<Transaction>>;

    /// The index of the last entry in the log, `0` when empty.
    async fn last_index(&self) -> Result<Index>;

    /// The id of the last entry in the log.
    async fn last_log(&self) -> Result<LogId>;

    /// The commit index at which the next compaction becomes worthwhile.
    async fn next_compaction_after(&self) -> Result<Index>;

    /// Load the last compacted snapshot, if one exists.
    async fn load_last_compacted_snapshot(&self) -> Result<Option<Snapshot>>;

    /// Compact the log up to (and including) `upto`: persist a snapshot of
    /// the state at `upto` and remove all entries strictly before it. The
    /// entry at `upto` itself is retained, so the log never loses its
    /// anchor for catch-up. Returns `false` when there is nothing to do.
    async fn compact(&self, upto: Index) -> Result<bool>;

    /// Persist the current membership so it survives restarts.
    async fn persist_active_agents(&self, active: &[AgentId], pool: &BTreeMap<AgentId, String>) -> Result<()>;

    /// Look up log entries by client idempotency key; one (possibly empty)
    /// group of matches per queried key, in query order.
    async fn inquire(&self, client_ids: &[String]) -> Result<Vec<Vec<LogEntry>>>;
}
