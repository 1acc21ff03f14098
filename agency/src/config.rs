//! Agency runtime configuration and the mutable cluster descriptor.

use std::collections::BTreeMap;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::AgentId;

/// Default minimum ping interval, in seconds.
pub const DEFAULT_MIN_PING: f64 = 0.5;
/// Default maximum ping interval, in seconds.
pub const DEFAULT_MAX_PING: f64 = 2.5;
/// Default election timeout multiplier.
pub const DEFAULT_TIMEOUT_MULT: i64 = 1;
/// Default maximum number of transactions per append package.
pub const DEFAULT_MAX_APPEND_SIZE: usize = 250;
/// Default number of log entries to retain behind the commit index when
/// compacting.
pub const DEFAULT_COMPACTION_KEEP_SIZE: u64 = 500;
/// Default silence, in seconds, after which an active member is considered
/// failed and a pool spare is promoted in its place.
pub const DEFAULT_AGENT_FAILURE_GRACE: f64 = 180.0;

/// Errors raised by `ConfigBuilder::validate`.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `max_ping` must be strictly greater than `min_ping`, and both must be
    /// positive.
    #[error("invalid ping times: min_ping={min_ping} max_ping={max_ping}")]
    InvalidPingTimes { min_ping: f64, max_ping: f64 },
    /// The timeout multiplier must be at least 1.
    #[error("timeout_mult must be >= 1")]
    InvalidTimeoutMult,
    /// At least one transaction must fit into an append package.
    #[error("max_append_size must be > 0")]
    MaxAppendSizeTooSmall,
    /// Compaction must always keep recent log history, so followers can be
    /// caught up without a snapshot transfer in the common case.
    #[error("compaction_keep_size must be > 0")]
    CompactionKeepSizeTooSmall,
}

/// The runtime configuration of an agency node.
///
/// Use `Config::build` to construct one; `ConfigBuilder::validate` enforces
/// the inter-field constraints. All time-based fields are in seconds.
#[derive(Debug)]
pub struct Config {
    /// The name of the agency, used for logging only.
    pub cluster_name: String,
    /// The shortest interval between contacts to any follower.
    pub min_ping: f64,
    /// The longest tolerated silence from the leader before an election.
    pub max_ping: f64,
    /// A cluster-wide multiplier stretching election timeouts on loaded
    /// systems. Carried on vote requests so the whole agency adjusts in
    /// lock step; see `Agent::request_vote`.
    pub timeout_mult: i64,
    /// Whether the log store should sync appends to durable storage before
    /// acknowledging them. Also stretches the per-entry dispatch budget of
    /// the replication loop.
    pub wait_for_sync: bool,
    /// The maximum number of transactions bundled into one append package.
    pub max_append_size: usize,
    /// How many log entries to keep behind the commit index on compaction.
    pub compaction_keep_size: u64,
    /// Seconds of silence after which an active member counts as failed
    /// and a pool spare is promoted in its place.
    pub agent_failure_grace: f64,
    /// Whether the embedding system runs its supervision layer on top of
    /// this agency. The flag is replicated with the configuration but not
    /// interpreted here.
    pub supervision: bool,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            min_ping: None,
            max_ping: None,
            timeout_mult: None,
            wait_for_sync: None,
            max_append_size: None,
            compaction_keep_size: None,
            agent_failure_grace: None,
            supervision: None,
        }
    }

    /// Generate a new random election timeout, in milliseconds.
    ///
    /// The value is drawn uniformly from `[min_ping, max_ping]`, stretched
    /// by the given multiplier. The multiplier is passed in rather than read
    /// from `self` because it may have been adjusted cluster-wide since this
    /// config was built.
    pub fn new_rand_election_timeout(&self, timeout_mult: i64) -> u64 {
        let low = (self.min_ping * 1000.0) as u64 * timeout_mult as u64;
        let high = (self.max_ping * 1000.0) as u64 * timeout_mult as u64;
        thread_rng().gen_range(low..=high)
    }

    /// The per-entry dispatch budget of the replication loop, in
    /// milliseconds.
    pub fn append_entry_budget_ms(&self) -> u64 {
        if self.wait_for_sync {
            40
        } else {
            2
        }
    }
}

/// A configuration builder.
#[derive(Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    /// The desired value for `Config.min_ping`.
    pub min_ping: Option<f64>,
    /// The desired value for `Config.max_ping`.
    pub max_ping: Option<f64>,
    /// The desired value for `Config.timeout_mult`.
    pub timeout_mult: Option<i64>,
    /// The desired value for `Config.wait_for_sync`.
    pub wait_for_sync: Option<bool>,
    /// The desired value for `Config.max_append_size`.
    pub max_append_size: Option<usize>,
    /// The desired value for `Config.compaction_keep_size`.
    pub compaction_keep_size: Option<u64>,
    /// The desired value for `Config.agent_failure_grace`.
    pub agent_failure_grace: Option<f64>,
    /// The desired value for `Config.supervision`.
    pub supervision: Option<bool>,
}

impl ConfigBuilder {
    /// Set the desired ping times.
    pub fn ping_times(mut self, min_ping: f64, max_ping: f64) -> Self {
        self.min_ping = Some(min_ping);
        self.max_ping = Some(max_ping);
        self
    }

    /// Set the desired election timeout multiplier.
    pub fn timeout_mult(mut self, mult: i64) -> Self {
        self.timeout_mult = Some(mult);
        self
    }

    /// Set the desired value for `Config.wait_for_sync`.
    pub fn wait_for_sync(mut self, val: bool) -> Self {
        self.wait_for_sync = Some(val);
        self
    }

    /// Set the desired value for `Config.max_append_size`.
    pub fn max_append_size(mut self, val: usize) -> Self {
        self.max_append_size = Some(val);
        self
    }

    /// Set the desired value for `Config.compaction_keep_size`.
    pub fn compaction_keep_size(mut self, val: u64) -> Self {
        self.compaction_keep_size = Some(val);
        self
    }

    /// Set the desired value for `Config.agent_failure_grace`.
    pub fn agent_failure_grace(mut self, val: f64) -> Self {
        self.agent_failure_grace = Some(val);
        self
    }

    /// Set the desired value for `Config.supervision`.
    pub fn supervision(mut self, val: bool) -> Self {
        self.supervision = Some(val);
        self
    }

    /// Validate the state of this builder, returning a config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let min_ping = self.min_ping.unwrap_or(DEFAULT_MIN_PING);
        let max_ping = self.max_ping.unwrap_or(DEFAULT_MAX_PING);
        if min_ping <= 0.0 || max_ping <= min_ping {
            return Err(ConfigError::InvalidPingTimes { min_ping, max_ping });
        }
        let timeout_mult = self.timeout_mult.unwrap_or(DEFAULT_TIMEOUT_MULT);
        if timeout_mult < 1 {
            return Err(ConfigError::InvalidTimeoutMult);
        }
        let max_append_size = self.max_append_size.unwrap_or(DEFAULT_MAX_APPEND_SIZE);
        if max_append_size == 0 {
            return Err(ConfigError::MaxAppendSizeTooSmall);
        }
        let compaction_keep_size = self.compaction_keep_size.unwrap_or(DEFAULT_COMPACTION_KEEP_SIZE);
        if compaction_keep_size == 0 {
            return Err(ConfigError::CompactionKeepSizeTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            min_ping,
            max_ping,
            timeout_mult,
            wait_for_sync: self.wait_for_sync.unwrap_or(true),
            max_append_size,
            compaction_keep_size,
            agent_failure_grace: self.agent_failure_grace.unwrap_or(DEFAULT_AGENT_FAILURE_GRACE),
            supervision: self.supervision.unwrap_or(false),
        })
    }
}

/// The mutable cluster descriptor: every known peer and the subset which is
/// currently participating in consensus.
///
/// The pool is declared by the operator and may be larger than the agency
/// size; the surplus members are hot spares which the leader promotes when
/// an active peer goes silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The number of peers participating in consensus.
    pub agency_size: usize,
    /// All known peers and their endpoints, hot spares included.
    pub pool: BTreeMap<AgentId, String>,
    /// The ordered subset of the pool currently participating.
    pub active: Vec<AgentId>,
}

/// Errors raised when validating or merging a cluster descriptor.
#[derive(Debug, Error, PartialEq)]
pub enum ClusterConfigError {
    #[error("agency size must be > 0")]
    EmptyAgency,
    #[error("the pool holds {pool} members, fewer than the agency size {size}")]
    PoolTooSmall { pool: usize, size: usize },
    #[error("active member {0} is not in the pool")]
    ActiveNotPooled(AgentId),
    #[error("active list holds {active} members, expected {size}")]
    ActiveSizeMismatch { active: usize, size: usize },
}

impl ClusterConfig {
    /// Create a descriptor with a declared pool and a not yet determined
    /// active set. The active set is filled on first boot from the pool and
    /// persisted; see `fill_active_from_pool`.
    pub fn new(agency_size: usize, pool: BTreeMap<AgentId, String>) -> Self {
        Self {
            agency_size,
            pool,
            active: Vec::new(),
        }
    }

    /// The size of the agency.
    pub fn size(&self) -> usize {
        self.agency_size
    }

    /// Check that the descriptor is internally consistent: the active set
    /// has exactly `agency_size` members and every one of them is pooled.
    pub fn validate(&self) -> Result<(), ClusterConfigError> {
        if self.agency_size == 0 {
            return Err(ClusterConfigError::EmptyAgency);
        }
        if self.pool.len() < self.agency_size {
            return Err(ClusterConfigError::PoolTooSmall {
                pool: self.pool.len(),
                size: self.agency_size,
            });
        }
        if !self.active.is_empty() {
            if self.active.len() != self.agency_size {
                return Err(ClusterConfigError::ActiveSizeMismatch {
                    active: self.active.len(),
                    size: self.agency_size,
                });
            }
            for id in self.active.iter() {
                if !self.pool.contains_key(id) {
                    return Err(ClusterConfigError::ActiveNotPooled(*id));
                }
            }
        }
        Ok(())
    }

    /// Whether the given id currently participates in consensus.
    pub fn is_active(&self, id: AgentId) -> bool {
        self.active.contains(&id)
    }

    /// The endpoint of a pool member.
    pub fn endpoint_of(&self, id: AgentId) -> Option<&str> {
        self.pool.get(&id).map(|s| s.as_str())
    }

    /// Fill an empty active set with the first `agency_size` pool members.
    ///
    /// A no-op when the active set was already determined, either on a
    /// previous boot or through a persisted configuration.
    pub fn fill_active_from_pool(&mut self) -> bool {
        if !self.active.is_empty() {
            return false;
        }
        self.active = self.pool.keys().take(self.agency_size).copied().collect();
        true
    }

    /// The next pool member in line for promotion: the first one, in pool
    /// order, which is not currently active.
    pub fn next_agent_in_line(&self) -> Option<AgentId> {
        self.pool.keys().find(|id| !self.active.contains(id)).copied()
    }

    /// Replace a failed active member with its promoted replacement,
    /// preserving the position in the active ordering.
    pub fn swap_active_member(&mut self, failed: AgentId, replacement: AgentId) -> bool {
        match self.active.iter_mut().find(|id| **id == failed) {
            Some(slot) if self.pool.contains_key(&replacement) => {
                *slot = replacement;
                true
            }
            _ => false,
        }
    }

    /// Merge a persisted descriptor into this one.
    ///
    /// Persisted `pool` and `active` win over the boot-time declaration:
    /// whatever membership the agency last agreed on is authoritative.
    /// Unknown pool members from the boot-time declaration are retained, so
    /// freshly declared spares survive the merge.
    pub fn merge_persisted(&mut self, active: Vec<AgentId>, pool: BTreeMap<AgentId, String>) {
        for (id, endpoint) in pool {
            self.pool.insert(id, endpoint);
        }
        if !active.is_empty() {
            self.active = active;
        }
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.min_ping, DEFAULT_MIN_PING);
        assert_eq!(config.max_ping, DEFAULT_MAX_PING);
        assert_eq!(config.timeout_mult, DEFAULT_TIMEOUT_MULT);
        assert!(config.wait_for_sync);
        assert_eq!(config.max_append_size, DEFAULT_MAX_APPEND_SIZE);
        assert_eq!(config.compaction_keep_size, DEFAULT_COMPACTION_KEEP_SIZE);
        assert!(!config.supervision);
    }

    #[test]
    fn config_rejects_invalid_ping_times() {
        let res = Config::build("test".into()).ping_times(1.0, 0.5).validate();
        assert!(matches!(res, Err(ConfigError::InvalidPingTimes { .. })));
    }

    #[test]
    fn config_rejects_zero_compaction_keep_size() {
        let res = Config::build("test".into()).compaction_keep_size(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::CompactionKeepSizeTooSmall);
    }

    #[test]
    fn election_timeout_within_bounds() {
        let config = Config::build("test".into()).ping_times(0.1, 0.3).validate().unwrap();
        for _ in 0..1000 {
            let t = config.new_rand_election_timeout(2);
            assert!((200..=600).contains(&t), "timeout {} out of bounds", t);
        }
    }

    #[test]
    fn cluster_fill_and_promotion_order() {
        let mut cluster = ClusterConfig::new(3, btreemap! {
            1 => "tcp://a".to_string(),
            2 => "tcp://b".to_string(),
            3 => "tcp://c".to_string(),
            4 => "tcp://d".to_string(),
        });
        assert!(cluster.fill_active_from_pool());
        assert_eq!(cluster.active, vec![1, 2, 3]);
        cluster.validate().unwrap();

        assert_eq!(cluster.next_agent_in_line(), Some(4));
        assert!(cluster.swap_active_member(2, 4));
        assert_eq!(cluster.active, vec![1, 4, 3]);
        assert_eq!(cluster.next_agent_in_line(), Some(2));
    }

    #[test]
    fn cluster_merge_prefers_persisted_membership() {
        let mut cluster = ClusterConfig::new(2, btreemap! {
            1 => "tcp://a".to_string(),
            2 => "tcp://b".to_string(),
            3 => "tcp://c".to_string(),
        });
        cluster.fill_active_from_pool();
        cluster.merge_persisted(vec![1, 3], btreemap! {2 => "tcp://b2".to_string()});
        assert_eq!(cluster.active, vec![1, 3]);
        assert_eq!(cluster.endpoint_of(2), Some("tcp://b2"));
        // A spare declared only on the command line survives the merge.
        assert!(cluster.pool.contains_key(&1));
    }

    #[test]
    fn cluster_validation_catches_unpooled_active() {
        let mut cluster = ClusterConfig::new(1, btreemap! {1 => "tcp://a".to_string()});
        cluster.active = vec![9];
        assert_eq!(cluster.validate().unwrap_err(), ClusterConfigError::ActiveNotPooled(9));
    }
}
