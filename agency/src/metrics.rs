//! Observability of agency nodes.
//!
//! Each node publishes a stream of `AgencyMetrics` on a `watch` channel.
//! The stream powers `Agent::wait_for` on the client path and the `Wait`
//! helper used pervasively by the test suite to await cluster conditions
//! instead of sleeping.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::core::State;
use crate::AgentId;
use crate::Index;
use crate::Term;

/// A set of metrics describing the current state of an agency node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyMetrics {
    /// The id of the node.
    pub id: AgentId,
    /// The role the node is currently in.
    pub state: State,
    /// The current term of the node.
    pub current_term: Term,
    /// The index of the last entry in the node's log.
    pub last_log_index: Index,
    /// The highest index known to be committed.
    pub commit_index: Index,
    /// The index covered by the last compacted snapshot.
    pub snapshot_index: Index,
    /// The leader as far as this node knows.
    pub current_leader: Option<AgentId>,
    /// The active set this node operates under.
    pub active: Vec<AgentId>,
}

impl AgencyMetrics {
    pub(crate) fn new_initial(id: AgentId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            snapshot_index: 0,
            current_leader: None,
            active: Vec::new(),
        }
    }
}

/// An error coming from the `Wait` helper.
#[derive(Debug, Error, PartialEq)]
pub enum WaitError {
    #[error("timeout after {0:?} when waiting for {1}")]
    Timeout(Duration, String),
    #[error("the agency is shutting down")]
    ShuttingDown,
}

/// A handle for awaiting metrics conditions with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<AgencyMetrics>,
}

impl Wait {
    /// Wait until `func` holds for the metrics, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<AgencyMetrics, WaitError>
    where T: Fn(&AgencyMetrics) -> bool + Send {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("done waiting for {}, latest: {:?}", msg, latest);
                return Ok(latest);
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
                _ = sleep_until(deadline) => {
                    let latest = rx.borrow().clone();
                    tracing::debug!("timeout waiting for {}, latest: {:?}", msg, latest);
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
            }
        }
    }

    /// Wait for the log to reach at least `want_log`.
    pub async fn log(&self, want_log: Index, msg: &str) -> Result<AgencyMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log,
            &format!("{} .last_log_index >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for the commit index to reach at least `want`.
    pub async fn commit(&self, want: Index, msg: &str) -> Result<AgencyMetrics, WaitError> {
        self.metrics(|m| m.commit_index >= want, &format!("{} .commit_index >= {}", msg, want)).await
    }

    /// Wait for the node to assume the given role.
    pub async fn state(&self, want: State, msg: &str) -> Result<AgencyMetrics, WaitError> {
        self.metrics(|m| m.state == want, &format!("{} .state == {:?}", msg, want)).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, leader: AgentId, msg: &str) -> Result<AgencyMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            &format!("{} .current_leader == {}", msg, leader),
        )
        .await
    }

    /// Wait for the last compacted snapshot to cover at least `want`.
    pub async fn snapshot(&self, want: Index, msg: &str) -> Result<AgencyMetrics, WaitError> {
        self.metrics(|m| m.snapshot_index >= want, &format!("{} .snapshot_index >= {}", msg, want)).await
    }
}
