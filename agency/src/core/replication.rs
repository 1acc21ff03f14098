use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio::time::timeout;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::agent::AppendEntriesRequest;
use crate::core::LeaderState;
use crate::core::ReplicaEvent;
use crate::core::State;
use crate::error::AgencyResult;
use crate::storage::LogEntry;
use crate::storage::Snapshot;
use crate::AgentId;
use crate::Index;
use crate::LogId;
use crate::LogStore;
use crate::PeerTransport;

/// The maximum number of log entries loaded per replication window.
const WINDOW: u64 = 100;

impl<'a, T: PeerTransport, L: LogStore> LeaderState<'a, T, L> {
    /// Run one replication pass: send an append package (or heartbeat) to
    /// every active follower that is due one.
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.core.id))]
    pub(super) async fn send_append_entries(&mut self) -> AgencyResult<()> {
        // The loop interval stays clear of the timeout multiplier so the
        // pass keeps running often enough under stress.
        let interval = ((4000.0 * self.core.config.min_ping) as u64).max(5_000);
        self.next_append = Instant::now() + Duration::from_micros(interval);

        let dt = Duration::from_millis(self.core.config.append_entry_budget_ms());
        let followers: Vec<AgentId> =
            self.core.cluster.active.iter().copied().filter(|id| *id != self.core.id).collect();

        for follower in followers {
            if !self.core.target_state.is_leader() {
                return Ok(());
            }
            let term = self.core.current_term;
            let tracker = match self.trackers.get(&follower) {
                Some(tracker) => *tracker,
                None => continue,
            };
            let last_confirmed = tracker.confirmed;

            let mut window = match self.core.storage.get(last_confirmed, last_confirmed + WINDOW - 1).await {
                Ok(window) => window,
                Err(err) => {
                    tracing::error!({error=%err, follower}, "error loading replication window");
                    continue;
                }
            };

            // When compaction has outrun the follower, the window no longer
            // reaches back to its confirmed index (it may even be empty);
            // ship the last compacted snapshot as the package head and
            // reload the window from its boundary.
            let behind_compaction = match window.first() {
                None => true,
                Some(first) => {
                    let lowest = first.log_id.index;
                    lowest > last_confirmed + 1 || (lowest > last_confirmed && last_confirmed > 0)
                }
            };
            let mut snapshot: Option<Snapshot> = None;
            let mut prev_log = LogId::default();
            if behind_compaction {
                match self.core.storage.load_last_compacted_snapshot().await {
                    Ok(Some(snap)) => {
                        window = match self
                            .core
                            .storage
                            .get(snap.last_log_id.index, snap.last_log_id.index + WINDOW - 1)
                            .await
                        {
                            Ok(window) => window,
                            Err(err) => {
                                tracing::error!({error=%err, follower}, "error loading replication window");
                                continue;
                            }
                        };
                        prev_log = snap.last_log_id;
                        snapshot = Some(snap);
                    }
                    Ok(None) => {
                        // Without a snapshot the window can only come up
                        // short on an agency that has never logged anything.
                        tracing::debug!(follower, last_confirmed, "nothing to replicate yet");
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!({error=%err, follower}, "could not load last compacted snapshot, skipping");
                        continue;
                    }
                }
            } else if last_confirmed > 0 {
                if let Some(first) = window.first() {
                    // The window starts at the confirmed entry; it anchors
                    // the consistency check on the follower.
                    prev_log = first.log_id;
                }
            }
            // Compaction always retains one entry, so an empty window here
            // means an empty log.
            if window.is_empty() {
                tracing::debug!(follower, last_confirmed, "empty replication window");
                continue;
            }

            let highest = window[window.len() - 1].log_id.index;

            // Suppress redundant heartbeats, deliberately without the
            // timeout multiplier: even on a stretched agency, followers
            // hear from us every quarter min ping.
            if let Some(last_sent) = tracker.last_sent {
                if highest == tracker.last_highest
                    && last_sent.elapsed().as_secs_f64() < 0.25 * self.core.config.min_ping
                {
                    continue;
                }
                if last_sent.elapsed().as_secs_f64() > self.core.config.min_ping {
                    tracing::warn!(
                        follower,
                        elapsed = last_sent.elapsed().as_secs_f64(),
                        "last contact to follower was more than min ping ago",
                    );
                }
            }

            // Pace slow followers: before their earliest package time, the
            // package degenerates to a bare heartbeat.
            let from = snapshot.as_ref().map(|s| s.last_log_id.index).unwrap_or(last_confirmed);
            let entries: Vec<LogEntry> = if tracker.earliest_package <= Instant::now() {
                window.iter().filter(|e| e.log_id.index > from).cloned().collect()
            } else {
                snapshot = None;
                Vec::new()
            };
            let to_log = entries.len();

            // Really leading?
            if self.challenge_leadership() {
                tracing::info!(id = self.core.id, "leadership challenged, reverting to candidate");
                self.core.set_target_state(State::Candidate);
                return Ok(());
            }

            if to_log > 0 {
                tracing::debug!(
                    follower,
                    to_log,
                    highest,
                    snapshot = snapshot.is_some(),
                    "appending entries to follower",
                );
            }

            let rpc = AppendEntriesRequest {
                term,
                leader_id: self.core.id,
                prev_log_index: prev_log.index,
                prev_log_term: prev_log.term,
                leader_commit: self.core.commit_index,
                sender_time_stamp: unix_millis(),
                snapshot,
                entries,
            };

            // Dispatch outside of the core: the response is funnelled back
            // as a replica event. Large packages get a budget per entry so
            // a slow follower is not declared dead while still writing.
            let deadline = Duration::from_secs_f64(
                (to_log as f64 * dt.as_secs_f64())
                    .max(self.core.config.min_ping * self.core.timeout_mult as f64),
            );
            let transport = self.core.transport.clone();
            let replica_tx = self.replica_tx.clone();
            let ack_index = if to_log > 0 { highest } else { 0 };
            let _ = tokio::spawn(
                async move {
                    let event = match timeout(deadline, transport.send_append_entries(follower, rpc)).await {
                        Ok(Ok(res)) => {
                            if res.term > term {
                                Some(ReplicaEvent::HigherTerm { term: res.term })
                            } else if res.ok {
                                Some(ReplicaEvent::ReportIn {
                                    peer: follower,
                                    index: ack_index,
                                    to_log,
                                })
                            } else {
                                Some(ReplicaEvent::Behind { peer: follower })
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::debug!({error=%err, follower}, "error sending append entries");
                            None
                        }
                        Err(_) => {
                            // Expired responses are ignored; the follower
                            // will simply be retried next pass.
                            tracing::debug!(follower, "append entries deadline expired");
                            None
                        }
                    };
                    if let Some(event) = event {
                        let _ = replica_tx.send((event, tracing::debug_span!("CH")));
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );

            let now = Instant::now();
            if let Some(tracker) = self.trackers.get_mut(&follower) {
                tracker.last_sent = Some(now);
                tracker.last_highest = highest;
                if to_log > 0 {
                    // Hold off the next package until this one had a fair
                    // chance to be written out on the follower.
                    tracker.earliest_package = now + dt * to_log as u32;
                }
            }
        }
        Ok(())
    }

    /// Absorb a confirmation: `peer` has durably appended the log up to
    /// `index`.
    ///
    /// Invoked for followers when their acknowledgements arrive, and for
    /// this node itself right after local appends. Advances the commit
    /// index once a strict majority of the active set has confirmed an
    /// index, applying the newly committed entries to the read DB.
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.core.id))]
    pub(super) async fn report_in(&mut self, peer: AgentId, index: Index, to_log: usize) -> AgencyResult<()> {
        let now = Instant::now();
        if let Some(tracker) = self.trackers.get_mut(&peer) {
            if peer != self.core.id {
                let since = now.duration_since(tracker.last_acked).as_secs_f64();
                if since > self.core.config.min_ping * self.core.timeout_mult as f64 {
                    tracing::warn!(
                        peer,
                        since,
                        "last confirmation from peer was received more than min ping ago",
                    );
                }
            }
            tracker.last_acked = now;

            if index > tracker.confirmed {
                tracker.confirmed = index;
                if to_log > 0 {
                    // A package callback resets the pacing delay.
                    tracker.earliest_package = now;
                }
            }
        }

        if index > self.core.commit_index {
            let n = self
                .core
                .cluster
                .active
                .iter()
                .filter(|q| self.trackers.get(q).map(|t| t.confirmed >= index).unwrap_or(false))
                .count();

            if n > self.core.cluster.size() / 2 {
                // Only entries of the current term are committed by
                // counting; earlier terms ride along transitively.
                let entry_term = match self.core.storage.get(index, index).await {
                    Ok(entries) => entries.first().map(|e| e.log_id.term),
                    Err(err) => {
                        tracing::error!({error=%err}, "error reading entry term for commit");
                        None
                    }
                };
                if entry_term == Some(self.core.current_term) {
                    tracing::debug!(
                        from = self.core.commit_index + 1,
                        to = index,
                        "critical mass, committing to read db",
                    );
                    self.core.apply_committed(index, true).await?;
                }
            }
        }

        // Wake any `wait_for` callers.
        self.core.report_metrics();
        Ok(())
    }

    /// Whether this node should voluntarily step down: fewer than a
    /// majority of the active set (itself included) have acknowledged
    /// recently.
    pub(super) fn challenge_leadership(&self) -> bool {
        let window = 0.9 * self.core.config.min_ping * self.core.timeout_mult as f64;
        let good = self
            .core
            .cluster
            .active
            .iter()
            .filter(|peer| **peer != self.core.id)
            .filter(|peer| {
                self.trackers
                    .get(peer)
                    .map(|t| t.last_acked.elapsed().as_secs_f64() < window)
                    .unwrap_or(false)
            })
            .count();
        good + 1 <= self.core.cluster.size() / 2
    }
}

/// Milliseconds since the epoch, for wire latency diagnostics.
fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
