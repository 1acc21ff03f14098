use std::cmp::min;

use crate::agent::AppendEntriesRequest;
use crate::agent::AppendEntriesResponse;
use crate::core::AgentCore;
use crate::core::State;
use crate::error::AgencyResult;
use crate::LogStore;
use crate::MessageSummary;
use crate::PeerTransport;

impl<T: PeerTransport, L: LogStore> AgentCore<T, L> {
    /// Handle an append-entries package from the agency leader.
    ///
    /// Carries replicated entries, possibly headed by a snapshot when this
    /// node has fallen behind compaction, and doubles as the leader's
    /// heartbeat when empty.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AgencyResult<AppendEntriesResponse> {
        // A package from a stale term is not honored.
        if req.term < self.current_term {
            tracing::debug!({req.term, self.current_term}, "not accepting append entries from stale leader");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                ok: false,
            });
        }

        // The leader is alive; push out the election deadline.
        if let Some(last) = self.last_heartbeat {
            let gap = last.elapsed().as_secs_f64();
            if gap > self.config.min_ping * self.timeout_mult as f64 {
                tracing::debug!(gap, leader = req.leader_id, "long silence between leader contacts");
            }
        }
        self.update_next_election_timeout(true);

        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(req.leader_id) {
            self.current_leader = Some(req.leader_id);
            report_metrics = true;
        }
        if !self.target_state.is_follower() && self.target_state != State::Shutdown {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        // Consistency check at the package boundary: our log (or snapshot)
        // must hold the entry the package claims to follow.
        if !self.matches_prev(&req).await? {
            tracing::debug!(
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                "log mismatch at package boundary, asking the leader to back up",
            );
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                ok: false,
            });
        }

        let mut ok = true;
        // With nothing to append, the local last log index bounds the
        // commit advance below.
        let mut last_index = self.last_log_id.index;

        if req.snapshot.is_some() || !req.entries.is_empty() {
            let wanted = req.entries.last().map(|e| e.log_id.index);
            match self.storage.log_follower(req.snapshot.as_ref(), &req.entries).await {
                Ok(last) => {
                    last_index = last;
                    if let Some(wanted) = wanted {
                        // Not everything was logged (a gap was detected);
                        // report it so the leader backs up and retries.
                        if last < wanted {
                            ok = false;
                        }
                    }
                    self.last_log_id = self.storage.last_log().await.map_err(|err| self.map_fatal_storage_error(err))?;
                    report_metrics = true;
                }
                Err(err) => {
                    tracing::error!(error=%err, "exception during log append");
                    ok = false;
                    last_index = self.last_log_id.index;
                }
            }

            // An installed snapshot resets the committed view wholesale.
            if let Some(snapshot) = req.snapshot {
                if ok && snapshot.last_log_id.index > self.commit_index {
                    self.read_db.restore(snapshot.image);
                    self.commit_index = snapshot.last_log_id.index;
                    self.snapshot_index = snapshot.last_log_id.index;
                    report_metrics = true;
                }
            }
        }

        let leader_commit = min(req.leader_commit, last_index);
        if leader_commit > self.commit_index {
            self.apply_committed(leader_commit, false).await?;
            report_metrics = false; // apply_committed already reported
        }

        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            ok,
        })
    }

    /// Whether our log contains the entry the package claims to precede it.
    async fn matches_prev(&mut self, req: &AppendEntriesRequest) -> AgencyResult<bool> {
        // A package headed by a snapshot sets its own baseline.
        if req.snapshot.is_some() {
            return Ok(true);
        }
        if req.prev_log_index == 0 {
            return Ok(true);
        }
        let prev = self
            .storage
            .get(req.prev_log_index, req.prev_log_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = prev.first() {
            return Ok(entry.log_id.term == req.prev_log_term);
        }
        // The entry may have been compacted away; the snapshot boundary
        // then vouches for it.
        let snapshot = self
            .storage
            .load_last_compacted_snapshot()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(snapshot
            .map(|s| s.last_log_id.index >= req.prev_log_index)
            .unwrap_or(false))
    }
}
