//! A Raft-based consensus agency replicating a hierarchical key/value store.
//!
//! A fixed-size cluster of peers (the agency) replicates a log of
//! transactions against a tree of `/`-separated paths. Clients submit reads,
//! writes and transactions to the current leader; the leader serializes them
//! against its pre-commit view (the spearhead), appends them to the
//! replicated log, and applies them to the committed view (the read DB) once
//! a majority of the active members have acknowledged them.
//!
//! Storage and transport are pluggable: implement [`LogStore`] for the
//! replicated log and [`PeerTransport`] for the wire. The `memlog` crate
//! provides an in-memory `LogStore` suitable for testing and for embedders
//! which do not need durability.

pub mod agent;
pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
mod quorum;
pub mod storage;
pub mod store;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::agent::Agent;
pub use crate::agent::AppendEntriesRequest;
pub use crate::agent::AppendEntriesResponse;
pub use crate::agent::Inform;
pub use crate::agent::VoteRequest;
pub use crate::agent::VoteResponse;
pub use crate::agent::WaitForStatus;
pub use crate::config::ClusterConfig;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::ConfigError;
pub use crate::core::State;
pub use crate::error::AgencyError;
pub use crate::error::ClientError;
pub use crate::metrics::AgencyMetrics;
pub use crate::network::PeerTransport;
pub use crate::storage::LogEntry;
pub use crate::storage::LogStore;
pub use crate::storage::Snapshot;
pub use crate::store::Store;
pub use crate::store::Transaction;

/// The identity of a member of the agency.
///
/// Ids are assigned by the operator when the pool is declared and must be
/// stable across restarts of a node.
pub type AgentId = u64;

/// An election epoch. Strictly non-decreasing on any single node.
pub type Term = u64;

/// A position in the replicated log. `0` denotes "before anything"; the
/// first real entry carries index `1`.
pub type Index = u64;

/// The term and index of a log entry, as a comparable pair.
///
/// The derived ordering is the "at least as up-to-date" relation of the
/// election restriction: terms compare first, indices break ties.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: Term,
    pub index: Index,
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: Term, index: Index) -> Self {
        Self { term, index }
    }
}

/// A trait for types which present a condensed summary for logging.
///
/// `Debug` output of whole append packages is far too noisy for the hot
/// paths; implementors render the handful of fields worth tracing.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
