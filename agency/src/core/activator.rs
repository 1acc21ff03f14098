use std::time::Duration;

use tokio::time::timeout;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::agent::AppendEntriesRequest;
use crate::core::Activation;
use crate::core::FollowerTracker;
use crate::core::LeaderState;
use crate::core::ReplicaEvent;
use crate::error::AgencyResult;
use crate::AgentId;
use crate::Index;
use crate::LogId;
use crate::LogStore;
use crate::PeerTransport;

impl<'a, T: PeerTransport, L: LogStore> LeaderState<'a, T, L> {
    /// Scan the active set for members that have gone silent and, if the
    /// pool holds a spare, start promoting one.
    ///
    /// Runs only on the leader, at most one promotion at a time.
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.core.id))]
    pub(super) async fn detect_active_agent_failures(&mut self) -> AgencyResult<()> {
        if let Some(activation) = &self.activation {
            tracing::trace!(
                failed = activation.failed,
                replacement = activation.replacement,
                "activation already in progress"
            );
            return Ok(());
        }
        if self.core.cluster.pool.len() <= self.core.cluster.size() {
            return Ok(());
        }

        let grace = self.core.config.agent_failure_grace;
        for id in self.core.cluster.active.clone() {
            if id == self.core.id {
                continue;
            }
            let silent = self
                .trackers
                .get(&id)
                .map(|t| t.last_acked.elapsed().as_secs_f64() > grace)
                .unwrap_or(false);
            if silent {
                if let Some(replacement) = self.core.cluster.next_agent_in_line() {
                    tracing::info!(
                        failed = id,
                        replacement,
                        "active agent has failed, promoting pool member",
                    );
                    self.start_activation(id, replacement).await;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Ship the replacement everything it needs to catch up (the last
    /// compacted snapshot plus the log tail) as one append package. The
    /// swap happens when the acknowledgement comes back.
    async fn start_activation(&mut self, failed: AgentId, replacement: AgentId) {
        let snapshot = match self.core.storage.load_last_compacted_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!({error=%err}, "could not load snapshot for activation, retrying later");
                return;
            }
        };
        let from = snapshot.as_ref().map(|s| s.last_log_id.index).unwrap_or(0);
        let prev_log = snapshot.as_ref().map(|s| s.last_log_id).unwrap_or_else(LogId::default);
        let last_index = match self.core.storage.last_index().await {
            Ok(last_index) => last_index,
            Err(err) => {
                tracing::warn!({error=%err}, "could not read log bounds for activation, retrying later");
                return;
            }
        };
        let entries = match self.core.storage.get(from + 1, last_index).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!({error=%err}, "could not load log tail for activation, retrying later");
                return;
            }
        };

        let term = self.core.current_term;
        let rpc = AppendEntriesRequest {
            term,
            leader_id: self.core.id,
            prev_log_index: prev_log.index,
            prev_log_term: prev_log.term,
            leader_commit: self.core.commit_index,
            sender_time_stamp: 0,
            snapshot,
            entries,
        };

        self.activation = Some(Activation { failed, replacement });

        // Catch-up may move a lot of data; budget accordingly.
        let deadline = Duration::from_secs_f64(
            (self.core.config.min_ping * self.core.timeout_mult as f64 * 10.0).max(10.0),
        );
        let transport = self.core.transport.clone();
        let replica_tx = self.replica_tx.clone();
        let _ = tokio::spawn(
            async move {
                let ok = match timeout(deadline, transport.send_append_entries(replacement, rpc)).await {
                    Ok(Ok(res)) => res.ok && res.term == term,
                    Ok(Err(err)) => {
                        tracing::warn!({error=%err, replacement}, "error activating replacement");
                        false
                    }
                    Err(_) => {
                        tracing::warn!(replacement, "timeout activating replacement");
                        false
                    }
                };
                let event = ReplicaEvent::Activated {
                    failed,
                    replacement,
                    confirmed: last_index,
                    ok,
                };
                let _ = replica_tx.send((event, tracing::debug_span!("CH")));
            }
            .instrument(tracing::debug_span!("spawn")),
        );
    }

    /// Finish (or abandon) a promotion once the catch-up acknowledgement
    /// arrives.
    pub(super) async fn handle_activation_result(
        &mut self,
        failed: AgentId,
        replacement: AgentId,
        confirmed: Index,
        ok: bool,
    ) -> AgencyResult<()> {
        self.activation = None;
        if !ok {
            tracing::debug!(failed, replacement, "activation failed, will retry on next detection pass");
            return Ok(());
        }

        if !self.core.cluster.swap_active_member(failed, replacement) {
            tracing::warn!(failed, replacement, "activation raced a configuration change, dropping");
            return Ok(());
        }
        tracing::info!(failed, replacement, "replacement promoted to active agency membership");

        self.trackers.remove(&failed);
        let mut tracker = FollowerTracker::new(Instant::now());
        tracker.confirmed = confirmed;
        self.trackers.insert(replacement, tracker);

        if let Err(err) = self
            .core
            .storage
            .persist_active_agents(&self.core.cluster.active, &self.core.cluster.pool)
            .await
        {
            tracing::warn!({error=%err}, "failed to persist active agents");
        }

        // The new membership is itself replicated, so the change survives
        // leadership handover.
        self.persist_configuration().await?;
        self.notify_pool();
        self.core.report_metrics();
        Ok(())
    }
}
