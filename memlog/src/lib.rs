//! An in-memory implementation of the `agency::LogStore` trait.
//!
//! `MemLog` keeps the replicated log, the hard state, the last compacted
//! snapshot and the persisted membership in plain maps behind async locks.
//! Nothing survives a process restart; it exists for the test suite and for
//! embedders that do not need durability.

use std::collections::BTreeMap;

use agency::storage::HardState;
use agency::storage::InitialState;
use agency::storage::LogEntry;
use agency::storage::LogStore;
use agency::storage::PersistedMembership;
use agency::storage::Snapshot;
use agency::store::Store;
use agency::store::Transaction;
use agency::AgentId;
use agency::Index;
use agency::LogId;
use agency::Term;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// How many entries beyond the last snapshot make the next compaction
/// worthwhile, unless overridden via `with_compaction_step`.
const DEFAULT_COMPACTION_STEP: u64 = 1000;

/// An in-memory log store.
///
/// Lock ordering, where multiple guards are held: `log` before `snapshot`
/// before `hs` before `membership`.
pub struct MemLog {
    /// The id of the agency node this store belongs to, for logging.
    id: AgentId,
    /// The replicated log.
    log: RwLock<BTreeMap<Index, LogEntry>>,
    /// The last compacted snapshot.
    snapshot: RwLock<Option<Snapshot>>,
    /// The node's hard state.
    hs: RwLock<Option<HardState>>,
    /// The persisted membership.
    membership: RwLock<Option<PersistedMembership>>,
    /// Entries beyond the last snapshot before the next compaction is due.
    compaction_step: u64,
}

impl MemLog {
    /// Create a new in-memory log store for the given node.
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            snapshot: RwLock::new(None),
            hs: RwLock::new(None),
            membership: RwLock::new(None),
            compaction_step: DEFAULT_COMPACTION_STEP,
        }
    }

    /// Override the compaction cadence.
    pub fn with_compaction_step(mut self, step: u64) -> Self {
        self.compaction_step = step.max(1);
        self
    }

    /// The index covered by the current snapshot, `0` when there is none.
    async fn snapshot_base(&self) -> Index {
        self.snapshot.read().await.as_ref().map(|s| s.last_log_id.index).unwrap_or(0)
    }
}

#[async_trait]
impl LogStore for MemLog {
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.id))]
    async fn initial_state(&self) -> Result<InitialState> {
        let log = self.log.read().await;
        let snapshot = self.snapshot.read().await;
        let hs = self.hs.read().await;
        let membership = self.membership.read().await;

        let last_log_id = log
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or_else(|| snapshot.as_ref().map(|s| s.last_log_id))
            .unwrap_or_else(LogId::default);

        match &*hs {
            Some(hs) => Ok(InitialState {
                last_log_id,
                hard_state: hs.clone(),
                membership: membership.clone(),
            }),
            None => Ok(InitialState::new_initial()),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs), fields(id=self.id))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, payloads), fields(id=self.id, n=payloads.len()))]
    async fn append(&self, payloads: &[Transaction], term: Term) -> Result<Vec<Index>> {
        let mut log = self.log.write().await;
        let base = self.snapshot_base().await;
        let mut last = log.keys().next_back().copied().unwrap_or(base);
        let mut indices = Vec::with_capacity(payloads.len());
        for payload in payloads {
            last += 1;
            log.insert(last, LogEntry {
                log_id: LogId::new(term, last),
                payload: payload.clone(),
            });
            indices.push(last);
        }
        Ok(indices)
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot, entries), fields(id=self.id, n=entries.len()))]
    async fn log_follower(&self, snapshot: Option<&Snapshot>, entries: &[LogEntry]) -> Result<Index> {
        let mut log = self.log.write().await;
        let mut current_snapshot = self.snapshot.write().await;

        if let Some(snap) = snapshot {
            // Everything at or before the snapshot boundary is superseded.
            let tail = log.split_off(&(snap.last_log_id.index + 1));
            *log = tail;
            *current_snapshot = Some(snap.clone());
        }
        let base = current_snapshot.as_ref().map(|s| s.last_log_id.index).unwrap_or(0);

        for entry in entries {
            let index = entry.log_id.index;
            if index <= base {
                continue;
            }
            match log.get(&index) {
                // Log matching: an entry with the same index and term is
                // the same entry; nothing to do.
                Some(existing) if existing.log_id.term == entry.log_id.term => {}
                // A conflicting entry invalidates it and everything after.
                Some(_) => {
                    let _tail = log.split_off(&index);
                    log.insert(index, entry.clone());
                }
                None => {
                    let last = log.keys().next_back().copied().unwrap_or(base);
                    if index == last + 1 {
                        log.insert(index, entry.clone());
                    } else {
                        // A gap; everything from here on cannot be stored.
                        tracing::debug!(id = self.id, index, last, "gap in follower append, discarding tail");
                        break;
                    }
                }
            }
        }

        Ok(log.keys().next_back().copied().unwrap_or(base))
    }

    async fn get(&self, from: Index, to: Index) -> Result<Vec<LogEntry>> {
        let log = self.log.read().await;
        Ok(log.range(from.max(1)..=to).map(|(_, e)| e.clone()).collect())
    }

    async fn slices(&self, from: Index, to: Index) -> Result<Vec<Transaction>> {
        let log = self.log.read().await;
        Ok(log.range(from.max(1)..=to).map(|(_, e)| e.payload.clone()).collect())
    }

    async fn last_index(&self) -> Result<Index> {
        let log = self.log.read().await;
        match log.keys().next_back() {
            Some(last) => Ok(*last),
            None => Ok(self.snapshot_base().await),
        }
    }

    async fn last_log(&self) -> Result<LogId> {
        let log = self.log.read().await;
        match log.values().next_back() {
            Some(entry) => Ok(entry.log_id),
            None => Ok(self
                .snapshot
                .read()
                .await
                .as_ref()
                .map(|s| s.last_log_id)
                .unwrap_or_else(LogId::default)),
        }
    }

    async fn next_compaction_after(&self) -> Result<Index> {
        Ok(self.snapshot_base().await + self.compaction_step)
    }

    async fn load_last_compacted_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id=self.id))]
    async fn compact(&self, upto: Index) -> Result<bool> {
        let mut log = self.log.write().await;
        let mut snapshot = self.snapshot.write().await;

        let base = snapshot.as_ref().map(|s| s.last_log_id.index).unwrap_or(0);
        if upto <= base {
            return Ok(false);
        }
        let term = match log.get(&upto) {
            Some(entry) => entry.log_id.term,
            // The compaction point must be a logged entry.
            None => return Ok(false),
        };

        // The new snapshot is the old one plus the replayed span.
        let mut store = Store::new();
        if let Some(snap) = &*snapshot {
            store.restore(snap.image.clone());
        }
        let payloads: Vec<Transaction> = log.range(base + 1..=upto).map(|(_, e)| e.payload.clone()).collect();
        store.apply_log_entries(&payloads, upto, term, false);

        *snapshot = Some(Snapshot {
            last_log_id: LogId::new(term, upto),
            image: store.image(),
        });
        // The entry at the compaction point stays as the catch-up anchor.
        let tail = log.split_off(&upto);
        *log = tail;

        tracing::debug!(id = self.id, upto, "compacted log");
        Ok(true)
    }

    async fn persist_active_agents(&self, active: &[AgentId], pool: &BTreeMap<AgentId, String>) -> Result<()> {
        *self.membership.write().await = Some(PersistedMembership {
            active: active.to_vec(),
            pool: pool.clone(),
        });
        Ok(())
    }

    async fn inquire(&self, client_ids: &[String]) -> Result<Vec<Vec<LogEntry>>> {
        let log = self.log.read().await;
        Ok(client_ids
            .iter()
            .map(|id| {
                log.values()
                    .filter(|e| e.payload.client_id.as_deref() == Some(id.as_str()))
                    .cloned()
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(key: &str) -> Transaction {
        Transaction::set(format!("/{}", key), json!(1))
    }

    fn entry(term: Term, index: Index, key: &str) -> LogEntry {
        LogEntry {
            log_id: LogId::new(term, index),
            payload: payload(key),
        }
    }

    #[tokio::test]
    async fn append_assigns_contiguous_indices() {
        let store = MemLog::new(1);
        let indices = store.append(&[payload("a"), payload("b")], 1).await.unwrap();
        assert_eq!(indices, vec![1, 2]);
        let indices = store.append(&[payload("c")], 2).await.unwrap();
        assert_eq!(indices, vec![3]);
        assert_eq!(store.last_log().await.unwrap(), LogId::new(2, 3));
    }

    #[tokio::test]
    async fn log_follower_overwrites_conflicting_tail() {
        let store = MemLog::new(1);
        store.append(&[payload("a"), payload("b"), payload("c")], 1).await.unwrap();

        // A new leader replaces entries 2.. with its own term.
        let last = store
            .log_follower(None, &[entry(2, 2, "x"), entry(2, 3, "y"), entry(2, 4, "z")])
            .await
            .unwrap();
        assert_eq!(last, 4);
        let entries = store.get(1, 10).await.unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].log_id, LogId::new(1, 1));
        assert_eq!(entries[1].log_id, LogId::new(2, 2));
    }

    #[tokio::test]
    async fn log_follower_reports_gaps() {
        let store = MemLog::new(1);
        store.append(&[payload("a")], 1).await.unwrap();
        // Entry 3 cannot be stored without entry 2.
        let last = store.log_follower(None, &[entry(1, 3, "c")]).await.unwrap();
        assert_eq!(last, 1);
    }

    #[tokio::test]
    async fn compaction_keeps_anchor_entry_and_builds_snapshot() {
        let store = MemLog::new(1);
        for i in 0..10 {
            store.append(&[payload(&format!("k{}", i))], 1).await.unwrap();
        }
        assert!(store.compact(7).await.unwrap());

        let snap = store.load_last_compacted_snapshot().await.unwrap().unwrap();
        assert_eq!(snap.last_log_id, LogId::new(1, 7));
        assert_eq!(snap.image["k0"], json!(1));
        assert_eq!(snap.image["k6"], json!(1));
        assert_eq!(snap.image.get("k7"), None);

        // Entries before the compaction point are gone, the anchor stays.
        let entries = store.get(1, 10).await.unwrap();
        assert_eq!(entries.first().map(|e| e.log_id.index), Some(7));
        assert_eq!(entries.len(), 4);

        // Compacting backwards is a no-op.
        assert!(!store.compact(5).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_install_resets_the_log() {
        let store = MemLog::new(1);
        store.append(&[payload("old")], 1).await.unwrap();

        let snap = Snapshot {
            last_log_id: LogId::new(2, 50),
            image: json!({"x": 1}),
        };
        let last = store
            .log_follower(Some(&snap), &[entry(2, 51, "a"), entry(2, 52, "b")])
            .await
            .unwrap();
        assert_eq!(last, 52);
        assert_eq!(store.get(1, 100).await.unwrap().len(), 2);
        assert_eq!(store.snapshot_base().await, 50);
        // Appends continue after the tail.
        assert_eq!(store.append(&[payload("c")], 2).await.unwrap(), vec![53]);
    }

    #[tokio::test]
    async fn inquire_finds_entries_by_client_id() {
        let store = MemLog::new(1);
        store.append(&[payload("a").with_client_id("trx-1"), payload("b")], 1).await.unwrap();

        let groups = store.inquire(&["trx-1".to_string(), "nope".to_string()]).await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[0][0].log_id.index, 1);
        assert!(groups[1].is_empty());
    }

    #[tokio::test]
    async fn hard_state_and_membership_round_trip() {
        let store = MemLog::new(1);
        let hs = HardState {
            current_term: 3,
            voted_for: Some(2),
        };
        store.save_hard_state(&hs).await.unwrap();
        let pool = maplit::btreemap! {1 => "tcp://a".to_string()};
        store.persist_active_agents(&[1], &pool).await.unwrap();

        let initial = store.initial_state().await.unwrap();
        assert_eq!(initial.hard_state, hs);
        assert_eq!(initial.membership.unwrap().active, vec![1]);
    }
}
