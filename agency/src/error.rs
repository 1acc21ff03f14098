//! Error types exposed by this crate.

use thiserror::Error;

use crate::AgentId;

/// A result type where the error variant is always an `AgencyError`.
pub type AgencyResult<T> = std::result::Result<T, AgencyError>;

/// Errors involving the core agency machinery.
#[derive(Debug, Error)]
pub enum AgencyError {
    /// The agency is shutting down; no further requests are accepted.
    #[error("the agency is shutting down")]
    ShuttingDown,
    /// The request could not be interpreted; no state was changed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// An error coming from the log storage layer.
    #[error("{0}")]
    Storage(anyhow::Error),
    /// An error coming from the peer transport layer.
    #[error("{0}")]
    Transport(anyhow::Error),
}

/// Errors for client-facing calls: `read`, `write`, `transact`, `transient`
/// and `inquire`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// This node is not the leader.
    ///
    /// Carries the id of the leader as far as this node knows; `None` when
    /// no leader is known, in which case the client should back off and
    /// retry against any member.
    #[error("this node is not the agency leader")]
    NotLeader { leader: Option<AgentId> },
    /// An error from the underlying agency machinery.
    #[error(transparent)]
    Agency(#[from] AgencyError),
}

impl ClientError {
    /// The leader to redirect to, if this is a redirect and one is known.
    pub fn forward_to(&self) -> Option<AgentId> {
        match self {
            ClientError::NotLeader { leader } => *leader,
            _ => None,
        }
    }
}
