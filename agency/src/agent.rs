//! The public agency interface and data types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::Span;

use crate::config::ClusterConfig;
use crate::config::Config;
use crate::core::AgentCore;
use crate::core::State;
use crate::error::AgencyError;
use crate::error::AgencyResult;
use crate::error::ClientError;
use crate::metrics::AgencyMetrics;
use crate::metrics::Wait;
use crate::storage::LogEntry;
use crate::storage::Snapshot;
use crate::store::Transaction;
use crate::AgentId;
use crate::Index;
use crate::LogId;
use crate::LogStore;
use crate::MessageSummary;
use crate::PeerTransport;
use crate::Term;

struct AgentInner<T: PeerTransport, L: LogStore> {
    tx_api: mpsc::UnboundedSender<(AgentMsg, Span)>,
    rx_metrics: watch::Receiver<AgencyMetrics>,
    core_handle: Mutex<Option<JoinHandle<AgencyResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_t: std::marker::PhantomData<T>,
    marker_l: std::marker::PhantomData<L>,
}

/// The handle to a running agency node.
///
/// Constructing an `Agent` spawns the consensus core as a background task;
/// this type is the interface to it. It is cheap to clone and should be
/// cloned liberally across request handlers.
///
/// ### shutting down
/// If any interface returns `AgencyError::ShuttingDown`, the node is going
/// down (possibly for data safety reasons after a storage error) and
/// `shutdown` should be called to await its termination.
pub struct Agent<T: PeerTransport, L: LogStore> {
    inner: Arc<AgentInner<T, L>>,
}

impl<T: PeerTransport, L: LogStore> Agent<T, L> {
    /// Create and spawn a new agency node.
    ///
    /// ### `id`
    /// The id under which this node appears in the pool. Must be stable
    /// across restarts.
    ///
    /// ### `config`
    /// Runtime tuning; see `Config`.
    ///
    /// ### `cluster`
    /// The declared pool and agency size. On nodes which were part of a
    /// formed agency before, the persisted membership from the log store
    /// takes precedence over this declaration.
    #[tracing::instrument(level="trace", skip(config, cluster, transport, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: AgentId, config: Arc<Config>, cluster: ClusterConfig, transport: Arc<T>, storage: Arc<L>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(AgencyMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = AgentCore::spawn(id, config, cluster, transport, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = AgentInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_t: std::marker::PhantomData,
            marker_l: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an append-entries package to this node.
    ///
    /// Sent by the leader to replicate log entries and as heartbeats.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, AgencyError> {
        let (tx, rx) = oneshot::channel();
        self.call(AgentMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a vote request to this node.
    ///
    /// Sent by candidates gathering votes for a new term.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn request_vote(&self, rpc: VoteRequest) -> Result<VoteResponse, AgencyError> {
        let (tx, rx) = oneshot::channel();
        self.call(AgentMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit a new authoritative configuration to this node.
    ///
    /// Sent by the leader to pool members after leadership changes and
    /// after membership changes.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(term=rpc.term, from=rpc.id))]
    pub async fn inform(&self, rpc: Inform) -> Result<(), AgencyError> {
        let (tx, rx) = oneshot::channel();
        self.call(AgentMsg::Inform { rpc, tx }, rx).await
    }

    /// Submit transactions to be replicated and applied.
    ///
    /// Rejected with a redirect if this node is not the leader. On success,
    /// every transaction has been applied to the spearhead and appended to
    /// the replicated log; commit is awaited separately through `wait_for`.
    /// Transactions whose preconditions failed are reported with `false` in
    /// `applied` and index `0`, and are not logged.
    ///
    /// `discard_startup` skips the wait for leadership preparation; it is
    /// reserved for configuration writes issued while preparing, where a
    /// failed write is harmless.
    #[tracing::instrument(level = "debug", skip(self, transactions))]
    pub async fn write(&self, transactions: Vec<Transaction>, discard_startup: bool) -> Result<WriteResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_client(
            AgentMsg::Write {
                transactions,
                discard_startup,
                tx,
            },
            rx,
        )
        .await
    }

    /// Evaluate read projections against the committed store.
    #[tracing::instrument(level = "debug", skip(self, queries))]
    pub async fn read(&self, queries: Vec<Vec<String>>) -> Result<Vec<ReadResult>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_client(AgentMsg::Read { queries, tx }, rx).await
    }

    /// Submit a mixed batch of reads and writes.
    ///
    /// Reads are evaluated against the spearhead, so they observe the
    /// effects of every earlier write in the same batch; writes are applied
    /// and logged individually.
    #[tracing::instrument(level = "debug", skip(self, items))]
    pub async fn transact(&self, items: Vec<TransactItem>) -> Result<TransactResponse, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_client(AgentMsg::Transact { items, tx }, rx).await
    }

    /// Submit a mixed batch against the transient store.
    ///
    /// Transient state is neither replicated nor persisted; it lives on the
    /// leader and is dropped on leadership change.
    #[tracing::instrument(level = "debug", skip(self, items))]
    pub async fn transient(&self, items: Vec<TransactItem>) -> Result<Vec<TransactResult>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_client(AgentMsg::Transient { items, tx }, rx).await
    }

    /// Resolve client idempotency keys against the log.
    ///
    /// After a timed-out `write`, this tells the client whether its
    /// transactions made it into the log (and at which indices), are still
    /// in flight, or were never accepted, without risking a double commit.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn inquire(&self, client_ids: Vec<String>) -> Result<Vec<InquiryResult>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_client(AgentMsg::Inquire { client_ids, tx }, rx).await
    }

    /// The commit index and a full image of the committed store.
    ///
    /// Served on any node, leader or not; primarily a debugging aid.
    pub async fn read_db(&self) -> Result<(Index, Value), AgencyError> {
        let (tx, rx) = oneshot::channel();
        let span = tracing::debug_span!("CH");
        self.inner
            .tx_api
            .send((AgentMsg::ReadDbImage { tx }, span))
            .map_err(|_| AgencyError::ShuttingDown)?;
        rx.await.map_err(|_| AgencyError::ShuttingDown)
    }

    /// Wait for the commit index to reach `index`.
    ///
    /// Returns `Committed` once it has, `TimedOut` if the node is still
    /// leading when the timeout strikes, and `Unknown` when leadership was
    /// lost or the node is shutting down; in the latter cases the client
    /// should resolve the outcome via `inquire`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn wait_for(&self, index: Index, timeout: Duration) -> WaitForStatus {
        let mut rx = self.inner.rx_metrics.clone();
        {
            let m = rx.borrow();
            // A single-host agency commits synchronously with the write.
            if m.active.len() == 1 {
                return WaitForStatus::Committed;
            }
            if m.commit_index >= index {
                return WaitForStatus::Committed;
            }
        }
        let deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return WaitForStatus::Unknown;
                    }
                    let m = rx.borrow();
                    if m.commit_index >= index {
                        return WaitForStatus::Committed;
                    }
                    if m.state == State::Shutdown {
                        return WaitForStatus::Unknown;
                    }
                }
                _ = sleep_until(deadline) => {
                    let m = rx.borrow();
                    if m.commit_index >= index {
                        return WaitForStatus::Committed;
                    }
                    return if m.state == State::Leader {
                        WaitForStatus::TimedOut
                    } else {
                        WaitForStatus::Unknown
                    };
                }
            }
        }
    }

    /// The leader as far as this node knows.
    pub async fn current_leader(&self) -> Option<AgentId> {
        self.metrics().borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<AgencyMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut this node down.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }

    async fn call<R>(&self, msg: AgentMsg, rx: oneshot::Receiver<AgencyResult<R>>) -> AgencyResult<R> {
        let span = tracing::debug_span!("CH");
        self.inner.tx_api.send((msg, span)).map_err(|_| AgencyError::ShuttingDown)?;
        rx.await.map_err(|_| AgencyError::ShuttingDown).and_then(|res| res)
    }

    async fn call_client<R>(&self, msg: AgentMsg, rx: oneshot::Receiver<Result<R, ClientError>>) -> Result<R, ClientError> {
        let span = tracing::debug_span!("CH");
        self.inner
            .tx_api
            .send((msg, span))
            .map_err(|_| ClientError::Agency(AgencyError::ShuttingDown))?;
        rx.await.map_err(|_| ClientError::Agency(AgencyError::ShuttingDown)).and_then(|res| res)
    }
}

impl<T: PeerTransport, L: LogStore> Clone for Agent<T, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type AppendEntriesTx = oneshot::Sender<AgencyResult<AppendEntriesResponse>>;
pub(crate) type VoteTx = oneshot::Sender<AgencyResult<VoteResponse>>;
pub(crate) type InformTx = oneshot::Sender<AgencyResult<()>>;
pub(crate) type WriteTx = oneshot::Sender<Result<WriteResponse, ClientError>>;
pub(crate) type ReadTx = oneshot::Sender<Result<Vec<ReadResult>, ClientError>>;
pub(crate) type TransactTx = oneshot::Sender<Result<TransactResponse, ClientError>>;
pub(crate) type TransientTx = oneshot::Sender<Result<Vec<TransactResult>, ClientError>>;
pub(crate) type InquireTx = oneshot::Sender<Result<Vec<InquiryResult>, ClientError>>;

/// A message coming from the agent API.
pub(crate) enum AgentMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: AppendEntriesTx,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: VoteTx,
    },
    Inform {
        rpc: Inform,
        tx: InformTx,
    },
    Write {
        transactions: Vec<Transaction>,
        discard_startup: bool,
        tx: WriteTx,
    },
    Read {
        queries: Vec<Vec<String>>,
        tx: ReadTx,
    },
    Transact {
        items: Vec<TransactItem>,
        tx: TransactTx,
    },
    Transient {
        items: Vec<TransactItem>,
        tx: TransientTx,
    },
    Inquire {
        client_ids: Vec<String>,
        tx: InquireTx,
    },
    ReadDbImage {
        tx: oneshot::Sender<(Index, Value)>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the agency leader to replicate log entries, and as a
/// heartbeat.
///
/// On the wire this is an array body: an optional leading snapshot element
/// followed by one element per log entry; `entries` may be empty for bare
/// heartbeats.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: Term,
    /// The leader's id. Useful in redirecting clients.
    pub leader_id: AgentId,
    /// The log entry immediately preceding the new entries; the snapshot
    /// boundary when a snapshot is included.
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    /// The leader's commit index.
    pub leader_commit: Index,
    /// Milliseconds since the epoch at the sender, for wire latency
    /// diagnostics.
    pub sender_time_stamp: u64,
    /// A snapshot to install before the entries, sent when the follower
    /// has fallen behind compaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// The new log entries to store, all with indices above
    /// `prev_log_index`.
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log={}-{}, leader_commit={}, snapshot={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.snapshot.as_ref().map(|s| s.last_log_id.to_string()).unwrap_or_else(|| "none".into()),
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: Term,
    /// Whether all entries were accepted into the log. `false` asks the
    /// leader to retry from an earlier index.
    pub ok: bool,
}

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: Term,
    /// The candidate's id.
    pub candidate_id: AgentId,
    /// The index of the candidate's last log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
    /// The election timeout multiplier the candidate operates under, or
    /// `-1` to leave the voter's setting alone. A differing value adjusts
    /// the voter's timing for the next term, so the whole agency stretches
    /// its timeouts in lock step under load.
    pub timeout_mult: i64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    pub fn new(term: Term, candidate_id: AgentId, last_log: LogId, timeout_mult: i64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index: last_log.index,
            last_log_term: last_log.term,
            timeout_mult,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node.
    pub term: Term,
    /// Whether the candidate received the vote.
    pub vote_granted: bool,
}

/// A new authoritative configuration, pushed by the leader to every pool
/// member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inform {
    /// The term of the sending leader.
    pub term: Term,
    /// The id of the sending leader.
    pub id: AgentId,
    /// The active set.
    pub active: Vec<AgentId>,
    /// The full pool.
    pub pool: std::collections::BTreeMap<AgentId, String>,
    /// Ping bounds, in seconds.
    pub min_ping: f64,
    pub max_ping: f64,
    /// The cluster-wide election timeout multiplier.
    pub timeout_mult: i64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The response to a successful `write`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// One flag per submitted transaction: whether its preconditions held
    /// and it was applied to the spearhead.
    pub applied: Vec<bool>,
    /// One log index per submitted transaction; `0` for transactions that
    /// were not applied.
    pub indices: Vec<Index>,
}

impl WriteResponse {
    /// The highest index assigned by this write, `0` if none was.
    pub fn max_index(&self) -> Index {
        self.indices.iter().copied().max().unwrap_or(0)
    }
}

/// The result of one read projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    /// One flag per requested path.
    pub success: Vec<bool>,
    /// The projected sub-trees, at their original positions.
    pub result: Value,
}

/// One element of a `transact` batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransactItem {
    /// A transaction to apply and log.
    Write(Transaction),
    /// A projection of the given paths.
    Read(Vec<String>),
}

/// The per-item outcome of a `transact` batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransactResult {
    /// The write was applied and logged at the given index.
    Written(Index),
    /// The write was rejected; carries the paths whose preconditions
    /// failed.
    Rejected(Vec<String>),
    /// The evaluated read projection.
    Read(Value),
}

/// The response to a `transact` batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactResponse {
    /// Per-item outcomes, in submission order.
    pub results: Vec<TransactResult>,
    /// The highest log index assigned by this batch, `0` if none was.
    pub max_index: Index,
}

/// The per-key outcome of an `inquire` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InquiryResult {
    /// The key belongs to a write still in flight; retry the inquiry.
    Ongoing,
    /// The key was found in the log at the given positions.
    Logged(Vec<LogId>),
    /// The key is not in the log and not in flight.
    Unknown,
}

/// The outcome of `Agent::wait_for`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitForStatus {
    /// The commit index reached the awaited index.
    Committed,
    /// The timeout struck while this node was still leading; the entry may
    /// yet commit.
    TimedOut,
    /// Leadership was lost or the node is shutting down; resolve via
    /// `inquire`.
    Unknown,
}
