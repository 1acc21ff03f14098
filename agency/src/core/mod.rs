//! The core logic of an agency node.

mod activator;
mod append_entries;
mod client;
mod compactor;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::agent::AgentMsg;
use crate::agent::Inform;
use crate::config::ClusterConfig;
use crate::config::Config;
use crate::core::compactor::spawn_compactor;
use crate::core::compactor::CompactionUpdate;
use crate::error::AgencyError;
use crate::error::AgencyResult;
use crate::error::ClientError;
use crate::metrics::AgencyMetrics;
use crate::storage::HardState;
use crate::store::Store;
use crate::store::Transaction;
use crate::AgentId;
use crate::Index;
use crate::LogId;
use crate::LogStore;
use crate::PeerTransport;
use crate::Term;

/// The core type implementing the consensus protocol of the agency.
pub(crate) struct AgentCore<T: PeerTransport, L: LogStore> {
    /// This node's id.
    id: AgentId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster descriptor: pool, active set, agency size.
    cluster: ClusterConfig,
    /// The `PeerTransport` implementation.
    transport: Arc<T>,
    /// The `LogStore` implementation.
    storage: Arc<L>,

    /// The target state of the node.
    target_state: State,

    /// The current term. Never decreases; persisted before any vote is cast
    /// and before any message of a higher term is accepted.
    current_term: Term,
    /// The candidate this node voted for in `current_term`.
    voted_for: Option<AgentId>,
    /// The leader as far as this node knows.
    current_leader: Option<AgentId>,
    /// The id of the last entry appended to the local log.
    last_log_id: LogId,
    /// The highest log index known to be committed.
    ///
    /// On boot this starts at the index of the last compacted snapshot (the
    /// snapshot only ever covers committed state) and is raised from there.
    commit_index: Index,

    /// The pre-commit view: the committed tree plus every accepted but not
    /// yet committed write. Only meaningful while leading.
    spearhead: Store,
    /// The post-commit view served to readers.
    read_db: Store,
    /// Non-replicated scratch state; dropped on leadership change.
    transient: Store,

    /// Idempotency keys of writes currently in flight.
    ongoing_trxs: HashSet<String>,

    /// The live election timeout multiplier. Starts from the config and may
    /// be adjusted cluster-wide through vote requests.
    timeout_mult: i64,

    /// The last time a heartbeat was received from a leader.
    last_heartbeat: Option<Instant>,
    /// The deadline of the running election timeout.
    next_election_timeout: Option<Instant>,

    /// The index covered by the last compacted snapshot.
    snapshot_index: Index,
    /// The commit index at which the compactor is next woken.
    next_compaction_after: Index,

    tx_compaction: mpsc::Sender<Index>,
    rx_compaction: mpsc::Receiver<CompactionUpdate>,

    rx_api: mpsc::UnboundedReceiver<(AgentMsg, Span)>,
    tx_metrics: watch::Sender<AgencyMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<T: PeerTransport, L: LogStore> AgentCore<T, L> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: AgentId,
        config: Arc<Config>,
        cluster: ClusterConfig,
        transport: Arc<T>,
        storage: Arc<L>,
        rx_api: mpsc::UnboundedReceiver<(AgentMsg, Span)>,
        tx_metrics: watch::Sender<AgencyMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<AgencyResult<()>> {
        let (tx_wake, rx_wake) = mpsc::channel(1);
        let (tx_update, rx_update) = mpsc::channel(1);
        // The compactor exits when the wake channel is dropped with the core.
        let _compactor = spawn_compactor(storage.clone(), config.compaction_keep_size, rx_wake, tx_update);
        let timeout_mult = config.timeout_mult;
        let this = Self {
            id,
            config,
            cluster,
            transport,
            storage,
            target_state: State::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            last_log_id: LogId::default(),
            commit_index: 0,
            spearhead: Store::new(),
            read_db: Store::new(),
            transient: Store::new(),
            ongoing_trxs: HashSet::new(),
            timeout_mult,
            last_heartbeat: None,
            next_election_timeout: None,
            snapshot_index: 0,
            next_compaction_after: 0,
            tx_compaction: tx_wake,
            rx_compaction: rx_update,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the agency node.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> AgencyResult<()> {
        tracing::debug!("agency node is initializing");

        let state = self.storage.initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;

        // The membership the agency last agreed on wins over the boot-time
        // declaration.
        if let Some(membership) = state.membership {
            self.cluster.merge_persisted(membership.active, membership.pool);
        }
        if self.cluster.fill_active_from_pool() {
            self.storage
                .persist_active_agents(&self.cluster.active, &self.cluster.pool)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
        }
        if let Err(err) = self.cluster.validate() {
            tracing::error!(error=%err, "invalid cluster descriptor, shutting down");
            self.set_target_state(State::Shutdown);
            return Err(AgencyError::MalformedRequest(err.to_string()));
        }

        // Catch the committed view up with the last compacted snapshot; the
        // commit index only ever rises from there.
        if let Some(snapshot) =
            self.storage.load_last_compacted_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?
        {
            self.commit_index = snapshot.last_log_id.index;
            self.snapshot_index = snapshot.last_log_id.index;
            self.read_db.restore(snapshot.image);
            self.spearhead.assign_from(&self.read_db);
        }
        self.next_compaction_after =
            self.storage.next_compaction_after().await.map_err(|err| self.map_fatal_storage_error(err))?;

        self.report_metrics();
        tracing::debug!(id = self.id, "target_state: {:?}", self.target_state);

        // The node assumes one of the agency roles based on cluster events.
        // Each role controller returns when a state change is required (or
        // on an unrecoverable error).
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Publish a metrics payload describing the current state of the node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(AgencyMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            snapshot_index: self.snapshot_index,
            current_leader: self.current_leader,
            active: self.cluster.active.clone(),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Persist the node's hard state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> AgencyResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the node's target state.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        self.target_state = target_state;
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout(self.timeout_mult));
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a new election timeout.
    ///
    /// If `heartbeat == true`, also update the value of `last_heartbeat`.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout(self.timeout_mult));
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the current term, resetting `voted_for` for the new term.
    fn update_current_term(&mut self, new_term: Term, voted_for: Option<AgentId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Adopt a new election timeout multiplier for the next term,
    /// cluster-wide adjustment carried on vote requests.
    fn adjust_timeout_mult(&mut self, timeout_mult: i64) {
        if timeout_mult >= 1 {
            self.timeout_mult = timeout_mult;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage error.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> AgencyError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        AgencyError::Storage(err)
    }

    /// Apply newly committed entries `(commit_index, new_commit]` to the
    /// read DB and raise the commit index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn apply_committed(&mut self, new_commit: Index, notify: bool) -> AgencyResult<()> {
        if new_commit <= self.commit_index {
            return Ok(());
        }
        let payloads = self
            .storage
            .slices(self.commit_index + 1, new_commit)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.read_db.apply_log_entries(&payloads, new_commit, self.current_term, notify);
        self.commit_index = new_commit;
        self.wake_compactor();
        self.report_metrics();
        Ok(())
    }

    /// Wake the compactor if the commit index has crossed the threshold.
    fn wake_compactor(&mut self) {
        if self.commit_index >= self.next_compaction_after {
            // A full wake channel means the compactor is already busy.
            let _ = self.tx_compaction.try_send(self.commit_index);
        }
    }

    /// Absorb the result of a finished compaction.
    fn handle_compaction_update(&mut self, update: CompactionUpdate) {
        tracing::debug!(snapshot_index = update.snapshot_index, "compaction finished");
        self.snapshot_index = update.snapshot_index;
        self.next_compaction_after = update.next_compaction_after;
        self.report_metrics();
    }

    /// Handle a new authoritative configuration pushed by the leader.
    #[tracing::instrument(level = "debug", skip(self, req), fields(term=req.term, from=req.id))]
    pub(super) async fn handle_inform(&mut self, req: Inform) -> AgencyResult<()> {
        if req.active.is_empty() {
            return Err(AgencyError::MalformedRequest("inform carries an empty active set".into()));
        }
        if req.term < self.current_term {
            return Err(AgencyError::MalformedRequest(format!(
                "inform with stale term {} < {}",
                req.term, self.current_term
            )));
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            if self.target_state != State::Shutdown {
                self.set_target_state(State::Follower);
            }
        }
        self.current_leader = Some(req.id);
        self.cluster.merge_persisted(req.active, req.pool);
        self.adjust_timeout_mult(req.timeout_mult);
        self.storage
            .persist_active_agents(&self.cluster.active, &self.cluster.pool)
            .await
            .map_err(AgencyError::Storage)?;
        self.report_metrics();
        Ok(())
    }

    /// Remember the idempotency keys of transactions entering the write
    /// path.
    fn add_trxs_ongoing(&mut self, trxs: &[Transaction]) {
        for trx in trxs {
            if let Some(id) = &trx.client_id {
                self.ongoing_trxs.insert(id.clone());
            }
        }
    }

    /// Forget the idempotency keys of transactions leaving the write path.
    fn remove_trxs_ongoing(&mut self, trxs: &[Transaction]) {
        for trx in trxs {
            if let Some(id) = &trx.client_id {
                self.ongoing_trxs.remove(id);
            }
        }
    }

    fn is_trx_ongoing(&self, client_id: &str) -> bool {
        self.ongoing_trxs.contains(client_id)
    }

    /// Answer a client call which only the leader serves.
    fn forward_client_request<R>(&self, tx: oneshot::Sender<Result<R, ClientError>>) {
        let _ = tx.send(Err(ClientError::NotLeader {
            leader: self.current_leader,
        }));
    }

    /// Dispatch an API message in a non-leader state.
    async fn handle_common_msg(&mut self, msg: AgentMsg) -> AgencyResult<()> {
        match msg {
            AgentMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries(rpc).await);
            }
            AgentMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc).await);
            }
            AgentMsg::Inform { rpc, tx } => {
                let _ = tx.send(self.handle_inform(rpc).await);
            }
            AgentMsg::Write { tx, .. } => self.forward_client_request(tx),
            AgentMsg::Read { tx, .. } => self.forward_client_request(tx),
            AgentMsg::Transact { tx, .. } => self.forward_client_request(tx),
            AgentMsg::Transient { tx, .. } => self.forward_client_request(tx),
            AgentMsg::Inquire { tx, .. } => self.forward_client_request(tx),
            AgentMsg::ReadDbImage { tx } => {
                let _ = tx.send((self.commit_index, self.read_db.image()));
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible roles of an agency node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating entries from the leader. Pool members
    /// outside the active set stay in this role without ever campaigning.
    Follower,
    /// The node is campaigning to become the agency leader.
    Candidate,
    /// The node is the agency leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-follower replication bookkeeping, maintained by the leader only.
#[derive(Clone, Copy, Debug)]
pub(self) struct FollowerTracker {
    /// The highest log index the follower has acknowledged.
    pub confirmed: Index,
    /// When the last acknowledgement (entries or heartbeat) arrived.
    pub last_acked: Instant,
    /// When the last package was sent, if one was.
    pub last_sent: Option<Instant>,
    /// The highest window index at the time of the last send.
    pub last_highest: Index,
    /// The earliest permissible time for the next non-empty package, pacing
    /// slow followers.
    pub earliest_package: Instant,
}

impl FollowerTracker {
    fn new(now: Instant) -> Self {
        Self {
            confirmed: 0,
            last_acked: now,
            last_sent: None,
            last_highest: 0,
            earliest_package: now,
        }
    }
}

/// An event coming back from a dispatched replication or activation task.
#[derive(Debug)]
pub(self) enum ReplicaEvent {
    /// A follower acknowledged entries up to `index` (`0` for a bare
    /// heartbeat acknowledgement).
    ReportIn {
        peer: AgentId,
        index: Index,
        to_log: usize,
    },
    /// A follower rejected the package; retry from an earlier index.
    Behind { peer: AgentId },
    /// A peer responded with a higher term.
    HigherTerm { term: Term },
    /// A hot-spare activation attempt finished.
    Activated {
        failed: AgentId,
        replacement: AgentId,
        confirmed: Index,
        ok: bool,
    },
}

/// A running hot-spare promotion.
pub(self) struct Activation {
    pub failed: AgentId,
    pub replacement: AgentId,
}

/// Volatile state specific to the agency leader.
pub(self) struct LeaderState<'a, T: PeerTransport, L: LogStore> {
    pub(super) core: &'a mut AgentCore<T, L>,
    /// Replication bookkeeping per active member, this node included: its
    /// own entry is refreshed when local appends are reported in.
    pub(super) trackers: BTreeMap<AgentId, FollowerTracker>,
    /// Whether the node has won the election but not yet finished
    /// rebuilding its stores; clients are held while this is set.
    pub(super) preparing: bool,
    /// Client messages deferred while preparing.
    pub(super) deferred: Vec<AgentMsg>,
    /// The sending half handed to dispatched replication tasks.
    pub(super) replica_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    /// The stream of events coming back from dispatched tasks.
    pub(super) replica_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    /// When the next replication pass is due.
    pub(super) next_append: Instant,
    /// When the last failure-detection pass ran.
    pub(super) last_failure_detection: Instant,
    /// The singleton replacement task, if one is running.
    pub(super) activation: Option<Activation>,
    /// When this node took over leadership.
    #[allow(dead_code)]
    pub(super) leader_since: Instant,
}

impl<'a, T: PeerTransport, L: LogStore> LeaderState<'a, T, L> {
    pub(self) fn new(core: &'a mut AgentCore<T, L>) -> Self {
        let (replica_tx, replica_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        Self {
            core,
            trackers: BTreeMap::new(),
            preparing: true,
            deferred: Vec::new(),
            replica_tx,
            replica_rx,
            next_append: now,
            last_failure_detection: now,
            activation: None,
            leader_since: now,
        }
    }

    /// Transition to the agency leader role.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> AgencyResult<()> {
        // Setup state as leader.
        let now = Instant::now();
        for id in self.core.cluster.active.clone() {
            self.trackers.insert(id, FollowerTracker::new(now));
        }
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.current_leader = Some(self.core.id);
        self.core.transient.clear();
        self.core.report_metrics();

        // Rebuild the key/value stores from the last snapshot plus the
        // committed log tail. While preparing, heartbeats already flow so
        // followers stay quiet, but client requests are held back.
        self.rebuild_stores().await?;

        // Replicate the agency configuration as the first entry of this
        // term; committing it transitively commits the inherited tail.
        self.persist_configuration().await?;
        self.notify_pool();

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);
                for msg in self.deferred.drain(..) {
                    reject_deferred(&*self.core, msg);
                }
                return Ok(());
            }

            // Preparation ends once everything inherited is committed; from
            // here the spearhead serializes new writes.
            if self.core.commit_index == self.core.last_log_id.index && self.preparing {
                self.core.spearhead.assign_from(&self.core.read_db);
                self.preparing = false;
                tracing::debug!(id = self.core.id, "leader finished preparing, serving");
                let deferred: Vec<AgentMsg> = self.deferred.drain(..).collect();
                for msg in deferred {
                    self.handle_msg(msg).await?;
                }
            }

            tokio::select! {
                _ = sleep_until(self.next_append) => {
                    self.send_append_entries().await?;
                    if self.last_failure_detection.elapsed() > Duration::from_secs(10) {
                        self.detect_active_agent_failures().await?;
                        self.last_failure_detection = Instant::now();
                    }
                }
                Some((event, span)) = self.replica_rx.recv() => {
                    let _ent = span.enter();
                    self.handle_replica_event(event).await?;
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.handle_msg(msg).await?;
                }
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.handle_compaction_update(update);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Dispatch an API message in the leader role.
    async fn handle_msg(&mut self, msg: AgentMsg) -> AgencyResult<()> {
        match msg {
            AgentMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_entries(rpc).await);
            }
            AgentMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc).await);
            }
            AgentMsg::Inform { rpc, tx } => {
                let _ = tx.send(self.core.handle_inform(rpc).await);
            }
            AgentMsg::ReadDbImage { tx } => {
                let _ = tx.send((self.core.commit_index, self.core.read_db.image()));
            }
            // Client traffic is held back until preparation has finished.
            // Configuration writes pass through, a failed one is harmless.
            AgentMsg::Write {
                transactions,
                discard_startup,
                tx,
            } => {
                if self.preparing && !discard_startup {
                    self.deferred.push(AgentMsg::Write {
                        transactions,
                        discard_startup,
                        tx,
                    });
                } else {
                    self.handle_write(transactions, tx).await?;
                }
            }
            msg @ AgentMsg::Read { .. }
            | msg @ AgentMsg::Transact { .. }
            | msg @ AgentMsg::Transient { .. }
            | msg @ AgentMsg::Inquire { .. } => {
                if self.preparing {
                    self.deferred.push(msg);
                    return Ok(());
                }
                match msg {
                    AgentMsg::Read { queries, tx } => self.handle_read(queries, tx).await?,
                    AgentMsg::Transact { items, tx } => self.handle_transact(items, tx).await?,
                    AgentMsg::Transient { items, tx } => self.handle_transient(items, tx),
                    AgentMsg::Inquire { client_ids, tx } => self.handle_inquire(client_ids, tx).await?,
                    _ => unreachable!("matched client messages above"),
                }
            }
        }
        Ok(())
    }

    /// Absorb an event from a dispatched replication or activation task.
    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> AgencyResult<()> {
        match event {
            ReplicaEvent::ReportIn { peer, index, to_log } => {
                self.report_in(peer, index, to_log).await?;
            }
            ReplicaEvent::Behind { peer } => {
                // The follower could not use the package; slide the window
                // back so the next one starts earlier.
                if let Some(tracker) = self.trackers.get_mut(&peer) {
                    tracker.last_acked = Instant::now();
                    tracker.confirmed = tracker.confirmed.saturating_sub(1);
                    tracker.last_highest = 0;
                }
            }
            ReplicaEvent::HigherTerm { term } => {
                if term > self.core.current_term {
                    tracing::info!(term, "greater term observed, reverting to follower");
                    self.core.update_current_term(term, None);
                    self.core.save_hard_state().await?;
                    self.core.current_leader = None;
                    self.core.set_target_state(State::Follower);
                    self.core.report_metrics();
                }
            }
            ReplicaEvent::Activated {
                failed,
                replacement,
                confirmed,
                ok,
            } => {
                self.handle_activation_result(failed, replacement, confirmed, ok).await?;
            }
        }
        Ok(())
    }
}

/// Answer a deferred client message after leadership was lost mid-prepare.
fn reject_deferred<T: PeerTransport, L: LogStore>(core: &AgentCore<T, L>, msg: AgentMsg) {
    match msg {
        AgentMsg::Write { tx, .. } => core.forward_client_request(tx),
        AgentMsg::Read { tx, .. } => core.forward_client_request(tx),
        AgentMsg::Transact { tx, .. } => core.forward_client_request(tx),
        AgentMsg::Transient { tx, .. } => core.forward_client_request(tx),
        AgentMsg::Inquire { tx, .. } => core.forward_client_request(tx),
        _ => {}
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a node in candidate state.
pub(self) struct CandidateState<'a, T: PeerTransport, L: LogStore> {
    core: &'a mut AgentCore<T, L>,
    /// The number of votes granted so far, this node's own included.
    pub(super) votes_granted: usize,
    /// The number of votes needed to win the election.
    pub(super) votes_needed: usize,
}

impl<'a, T: PeerTransport, L: LogStore> CandidateState<'a, T, L> {
    pub(self) fn new(core: &'a mut AgentCore<T, L>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> AgencyResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup new term.
            self.votes_granted = 1; // We vote for ourselves.
            self.votes_needed = crate::quorum::majority_of(self.core.cluster.size());
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.current_leader = None;
            self.core.save_hard_state().await?;
            self.core.report_metrics();
            tracing::debug!(id = self.core.id, term = self.core.current_term, "campaigning");

            if self.votes_granted >= self.votes_needed {
                // A single-host agency elects itself.
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            // Send vote requests to all active peers in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this term.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // The election timed out; break to the outer loop, which
                    // starts a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        self.core.handle_common_msg(msg).await?;
                    }
                    Some(update) = self.core.rx_compaction.recv() => {
                        self.core.handle_compaction_update(update);
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a node in follower state.
pub(self) struct FollowerState<'a, T: PeerTransport, L: LogStore> {
    core: &'a mut AgentCore<T, L>,
}

impl<'a, T: PeerTransport, L: LogStore> FollowerState<'a, T, L> {
    pub(self) fn new(core: &'a mut AgentCore<T, L>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> AgencyResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // The deadline is pushed out as heartbeats are received.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => {
                    if self.core.cluster.is_active(self.core.id) {
                        self.core.set_target_state(State::Candidate);
                    } else {
                        // Pool members outside the active set never campaign.
                        self.core.update_next_election_timeout(false);
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    self.core.handle_common_msg(msg).await?;
                }
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.handle_compaction_update(update);
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
