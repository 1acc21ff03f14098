use std::collections::HashMap;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use serde_json::json;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::agent::Inform;
use crate::agent::InquireTx;
use crate::agent::InquiryResult;
use crate::agent::ReadResult;
use crate::agent::ReadTx;
use crate::agent::TransactItem;
use crate::agent::TransactResponse;
use crate::agent::TransactResult;
use crate::agent::TransactTx;
use crate::agent::TransientTx;
use crate::agent::WriteResponse;
use crate::agent::WriteTx;
use crate::core::LeaderState;
use crate::core::State;
use crate::error::AgencyError;
use crate::error::AgencyResult;
use crate::error::ClientError;
use crate::store::Transaction;
use crate::Index;
use crate::LogId;
use crate::LogStore;
use crate::PeerTransport;

impl<'a, T: PeerTransport, L: LogStore> LeaderState<'a, T, L> {
    /// Handle a client write request.
    ///
    /// Transactions are serialized against the spearhead in chunks of
    /// `max_append_size`; every applied transaction is appended to the log
    /// under the current term, and the local append is reported in so that
    /// a single-host agency commits on the spot.
    #[tracing::instrument(level = "debug", skip(self, transactions, tx), fields(n=transactions.len()))]
    pub(super) async fn handle_write(&mut self, transactions: Vec<Transaction>, tx: WriteTx) -> AgencyResult<()> {
        // Resolve idempotency keys first: transactions already in flight or
        // already logged must not produce a second log entry.
        let known = match self.known_client_indices(&transactions).await {
            Ok(known) => known,
            Err(err) => {
                let _ = tx.send(Err(ClientError::Agency(AgencyError::Storage(err))));
                return Ok(());
            }
        };

        self.core.add_trxs_ongoing(&transactions);

        let multihost = self.core.cluster.size() > 1;
        let mut applied = Vec::with_capacity(transactions.len());
        let mut indices = Vec::with_capacity(transactions.len());

        for chunk in transactions.chunks(self.core.config.max_append_size) {
            // Still leading?
            if multihost && self.challenge_leadership() {
                self.core.remove_trxs_ongoing(&transactions);
                self.core.set_target_state(State::Candidate);
                let _ = tx.send(Err(ClientError::NotLeader { leader: None }));
                return Ok(());
            }

            let mut fresh = Vec::with_capacity(chunk.len());
            let mut outcome = Vec::with_capacity(chunk.len());
            for trx in chunk {
                if let Some(existing) = trx.client_id.as_ref().and_then(|id| known.get(id)) {
                    // A duplicate submission; report the original index.
                    outcome.push(ChunkOutcome::Duplicate(*existing));
                    continue;
                }
                if self.core.spearhead.apply_transaction(trx).successful {
                    fresh.push(trx.clone());
                    outcome.push(ChunkOutcome::Applied);
                } else {
                    outcome.push(ChunkOutcome::Rejected);
                }
            }

            let assigned = self
                .core
                .storage
                .append(&fresh, self.core.current_term)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            if let Some(last) = assigned.last() {
                self.core.last_log_id = LogId::new(self.core.current_term, *last);
            }

            let mut assigned = assigned.into_iter();
            for out in outcome {
                match out {
                    ChunkOutcome::Applied => {
                        applied.push(true);
                        indices.push(assigned.next().unwrap_or(0));
                    }
                    ChunkOutcome::Duplicate(index) => {
                        applied.push(true);
                        indices.push(index);
                    }
                    ChunkOutcome::Rejected => {
                        applied.push(false);
                        indices.push(0);
                    }
                }
            }
        }

        self.core.remove_trxs_ongoing(&transactions);

        // Report the local append so commit can advance; the maximum is the
        // relevant high-water mark.
        let max_index = indices.iter().copied().max().unwrap_or(0);
        let to_log = indices.iter().filter(|i| **i > 0).count();
        if max_index > self.core.commit_index {
            self.report_in(self.core.id, max_index, to_log).await?;
        }
        self.core.report_metrics();

        let _ = tx.send(Ok(WriteResponse { applied, indices }));

        // New entries are out; run the replication pass right away.
        self.next_append = Instant::now();
        Ok(())
    }

    /// Handle a client read request against the committed store.
    #[tracing::instrument(level = "debug", skip(self, queries, tx), fields(n=queries.len()))]
    pub(super) async fn handle_read(&mut self, queries: Vec<Vec<String>>, tx: ReadTx) -> AgencyResult<()> {
        if self.core.cluster.size() > 1 && self.challenge_leadership() {
            self.core.set_target_state(State::Candidate);
            let _ = tx.send(Err(ClientError::NotLeader { leader: None }));
            return Ok(());
        }
        let results = queries
            .iter()
            .map(|paths| {
                let (success, result) = self.core.read_db.read(paths);
                ReadResult { success, result }
            })
            .collect();
        let _ = tx.send(Ok(results));
        Ok(())
    }

    /// Handle a mixed read/write batch.
    ///
    /// Reads run against the spearhead so they observe earlier writes of
    /// the same batch; writes are applied and logged one by one, keeping
    /// index assignment aligned with application order.
    #[tracing::instrument(level = "debug", skip(self, items, tx), fields(n=items.len()))]
    pub(super) async fn handle_transact(&mut self, items: Vec<TransactItem>, tx: TransactTx) -> AgencyResult<()> {
        if self.core.cluster.size() > 1 && self.challenge_leadership() {
            self.core.set_target_state(State::Candidate);
            let _ = tx.send(Err(ClientError::NotLeader { leader: None }));
            return Ok(());
        }

        let writes: Vec<Transaction> = items
            .iter()
            .filter_map(|item| match item {
                TransactItem::Write(trx) => Some(trx.clone()),
                TransactItem::Read(_) => None,
            })
            .collect();
        self.core.add_trxs_ongoing(&writes);

        let mut results = Vec::with_capacity(items.len());
        let mut max_index: Index = 0;
        let mut to_log = 0;
        for item in items {
            match item {
                TransactItem::Write(trx) => {
                    let check = self.core.spearhead.apply_transaction(&trx);
                    if check.successful {
                        let assigned = self
                            .core
                            .storage
                            .append(&[trx], self.core.current_term)
                            .await
                            .map_err(|err| self.core.map_fatal_storage_error(err))?;
                        let index = assigned.first().copied().unwrap_or(0);
                        self.core.last_log_id = LogId::new(self.core.current_term, index);
                        max_index = max_index.max(index);
                        to_log += 1;
                        results.push(TransactResult::Written(index));
                    } else {
                        results.push(TransactResult::Rejected(check.failed_keys));
                    }
                }
                TransactItem::Read(paths) => {
                    let (_, result) = self.core.spearhead.read(&paths);
                    results.push(TransactResult::Read(result));
                }
            }
        }

        self.core.remove_trxs_ongoing(&writes);

        if max_index > self.core.commit_index {
            self.report_in(self.core.id, max_index, to_log).await?;
        }
        self.core.report_metrics();

        let _ = tx.send(Ok(TransactResponse { results, max_index }));
        self.next_append = Instant::now();
        Ok(())
    }

    /// Handle a batch against the transient store. Nothing is replicated
    /// or logged.
    #[tracing::instrument(level = "debug", skip(self, items, tx), fields(n=items.len()))]
    pub(super) fn handle_transient(&mut self, items: Vec<TransactItem>, tx: TransientTx) {
        let results = items
            .into_iter()
            .map(|item| match item {
                TransactItem::Write(trx) => {
                    let check = self.core.transient.apply_transaction(&trx);
                    if check.successful {
                        TransactResult::Written(0)
                    } else {
                        TransactResult::Rejected(check.failed_keys)
                    }
                }
                TransactItem::Read(paths) => {
                    let (_, result) = self.core.transient.read(&paths);
                    TransactResult::Read(result)
                }
            })
            .collect();
        let _ = tx.send(Ok(results));
    }

    /// Handle an idempotency-key inquiry.
    #[tracing::instrument(level = "debug", skip(self, client_ids, tx), fields(n=client_ids.len()))]
    pub(super) async fn handle_inquire(&mut self, client_ids: Vec<String>, tx: InquireTx) -> AgencyResult<()> {
        let groups = match self.core.storage.inquire(&client_ids).await {
            Ok(groups) => groups,
            Err(err) => {
                let _ = tx.send(Err(ClientError::Agency(AgencyError::Storage(err))));
                return Ok(());
            }
        };
        let results = client_ids
            .iter()
            .zip(groups)
            .map(|(id, group)| {
                // A key still in flight has no definitive index yet.
                if self.core.is_trx_ongoing(id) {
                    InquiryResult::Ongoing
                } else if group.is_empty() {
                    InquiryResult::Unknown
                } else {
                    InquiryResult::Logged(group.into_iter().map(|e| e.log_id).collect())
                }
            })
            .collect();
        let _ = tx.send(Ok(results));
        Ok(())
    }

    /// Look up which of the given transactions' idempotency keys are
    /// already in flight or in the log, mapping each to its index.
    async fn known_client_indices(&self, transactions: &[Transaction]) -> anyhow::Result<HashMap<String, Index>> {
        let ids: Vec<String> = transactions.iter().filter_map(|t| t.client_id.clone()).collect();
        let mut known = HashMap::new();
        if ids.is_empty() {
            return Ok(known);
        }
        for (id, group) in ids.iter().zip(self.core.storage.inquire(&ids).await?) {
            if let Some(entry) = group.first() {
                known.insert(id.clone(), entry.log_id.index);
            } else if self.core.is_trx_ongoing(id) {
                known.insert(id.clone(), 0);
            }
        }
        Ok(known)
    }

    /// Rebuild the key/value stores from the last compacted snapshot plus
    /// the committed log tail.
    #[tracing::instrument(level = "debug", skip(self), fields(id=self.core.id))]
    pub(super) async fn rebuild_stores(&mut self) -> AgencyResult<()> {
        self.core.read_db.clear();
        self.core.spearhead.clear();

        let snapshot = self
            .core
            .storage
            .load_last_compacted_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        let mut base: Index = 0;
        if let Some(snapshot) = snapshot {
            base = snapshot.last_log_id.index;
            self.core.read_db.restore(snapshot.image);
        }

        // Replay what was already known committed on top of the snapshot.
        // The commit index is only ever raised here.
        let commit_index = self.core.commit_index.max(base);
        if commit_index > base {
            let payloads = self
                .core
                .storage
                .slices(base + 1, commit_index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            self.core.read_db.apply_log_entries(&payloads, commit_index, self.core.current_term, false);
        }
        self.core.commit_index = commit_index;
        self.core.spearhead.assign_from(&self.core.read_db);
        self.core.report_metrics();

        tracing::info!(
            id = self.core.id,
            from = base,
            to = commit_index,
            "rebuilt key-value stores"
        );
        Ok(())
    }

    /// Replicate the agency configuration under the reserved `/.agency`
    /// path via a normal write.
    ///
    /// In case leadership was just lost, no harm arises: the failed write
    /// keeps a bogus configuration from spreading.
    #[tracing::instrument(level = "debug", skip(self), fields(id=self.core.id))]
    pub(super) async fn persist_configuration(&mut self) -> AgencyResult<()> {
        let trx = Transaction::set("/.agency", json!({
            "term": self.core.current_term,
            "id": self.core.id,
            "active": self.core.cluster.active.clone(),
            "pool": self.core.cluster.pool.clone(),
            "size": self.core.cluster.size(),
            "timeoutMult": self.core.timeout_mult,
        }));

        if !self.core.spearhead.apply_transaction(&trx).successful {
            // Unconditional set; cannot fail a precondition.
            return Err(AgencyError::MalformedRequest("configuration write rejected".into()));
        }
        let assigned = self
            .core
            .storage
            .append(&[trx], self.core.current_term)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        if let Some(index) = assigned.first() {
            self.core.last_log_id = LogId::new(self.core.current_term, *index);
            self.report_in(self.core.id, *index, 1).await?;
        }
        self.core.report_metrics();
        self.next_append = Instant::now();
        Ok(())
    }

    /// Push the current configuration to every pool member.
    #[tracing::instrument(level = "debug", skip(self), fields(id=self.core.id))]
    pub(super) fn notify_pool(&mut self) {
        let inform = Inform {
            term: self.core.current_term,
            id: self.core.id,
            active: self.core.cluster.active.clone(),
            pool: self.core.cluster.pool.clone(),
            min_ping: self.core.config.min_ping,
            max_ping: self.core.config.max_ping,
            timeout_mult: self.core.timeout_mult,
        };
        let mut pending = FuturesUnordered::new();
        for peer in self.core.cluster.pool.keys().copied() {
            if peer == self.core.id {
                continue;
            }
            let transport = self.core.transport.clone();
            let rpc = inform.clone();
            pending.push(async move { (peer, timeout(Duration::from_secs(1), transport.send_inform(peer, rpc)).await) });
        }
        let _ = tokio::spawn(
            async move {
                while let Some((peer, res)) = pending.next().await {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => tracing::debug!({error=%err, peer}, "error informing pool member"),
                        Err(_) => tracing::debug!(peer, "timeout informing pool member"),
                    }
                }
            }
            .instrument(tracing::debug_span!("spawn")),
        );
    }
}

/// The per-transaction outcome within one write chunk.
enum ChunkOutcome {
    /// Applied to the spearhead; takes the next assigned index.
    Applied,
    /// A resubmission of an already known idempotency key.
    Duplicate(Index),
    /// Preconditions failed; not applied, not logged.
    Rejected,
}
