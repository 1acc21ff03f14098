//! Fixtures for testing the agency.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agency::agent::ReadResult;
use agency::agent::WriteResponse;
use agency::async_trait::async_trait;
use agency::error::ClientError;
use agency::metrics::Wait;
use agency::store::Transaction;
use agency::Agent;
use agency::AgencyMetrics;
use agency::AgentId;
use agency::AppendEntriesRequest;
use agency::AppendEntriesResponse;
use agency::ClusterConfig;
use agency::Config;
use agency::Index;
use agency::Inform;
use agency::PeerTransport;
use agency::State;
use agency::VoteRequest;
use agency::VoteResponse;
use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use memlog::MemLog;
use serde_json::Value;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing_subscriber::prelude::*;

/// A concrete agency node type used during testing.
pub type MemAgency = Agent<AgencyRouter, MemLog>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config tuned for fast tests: short pings, small append packages.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .ping_times(0.2, 0.8)
            .wait_for_sync(false)
            .validate()
            .expect("failed to build agency config"),
    )
}

/// A cluster descriptor with `pool_size` declared peers (ids `0..pool_size`)
/// of which `size` become active.
pub fn cluster_config(size: usize, pool_size: usize) -> ClusterConfig {
    let pool: BTreeMap<AgentId, String> =
        (0..pool_size as AgentId).map(|id| (id, format!("mem://{}", id))).collect();
    ClusterConfig::new(size, pool)
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the
/// `PeerTransport` trait.
pub struct AgencyRouter {
    /// The runtime config all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<AgentId, (MemAgency, Arc<MemLog>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<AgentId>>,
}

impl AgencyRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new agency node bearing the given id.
    pub async fn new_agency_node(self: &Arc<Self>, id: AgentId, cluster: ClusterConfig) {
        let memlog = Arc::new(MemLog::new(id));
        self.new_agency_node_with_log(id, cluster, memlog).await
    }

    /// Create and register a new agency node with the given log store.
    pub async fn new_agency_node_with_log(self: &Arc<Self>, id: AgentId, cluster: ClusterConfig, log: Arc<MemLog>) {
        let node = Agent::new(id, self.config.clone(), cluster, self.clone(), log.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, log));
    }

    /// Bring up a whole cluster and wait for it to elect a serving leader.
    pub async fn new_cluster(self: &Arc<Self>, size: usize, pool_size: usize) -> Result<AgentId> {
        let cluster = cluster_config(size, pool_size);
        for id in 0..pool_size as AgentId {
            self.new_agency_node(id, cluster.clone()).await;
        }
        self.wait_for_serving_leader(Duration::from_secs(30)).await
    }

    /// Get a handle to the node with the given id.
    pub async fn agent(&self, id: AgentId) -> MemAgency {
        let rt = self.routing_table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).0.clone()
    }

    /// Get a handle to the log store backing the given node.
    pub async fn log_store(&self, id: AgentId) -> Arc<MemLog> {
        let rt = self.routing_table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).1.clone()
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: AgentId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: AgentId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<AgencyMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.0.metrics().borrow().clone()).collect()
    }

    /// The id of the current (non-isolated) leader, if one is known.
    pub async fn leader(&self) -> Option<AgentId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.state == State::Leader && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    /// Wait until a non-isolated node leads and has finished preparing
    /// (everything inherited is committed, so clients are served).
    pub async fn wait_for_serving_leader(&self, timeout: Duration) -> Result<AgentId> {
        let deadline = Instant::now() + timeout;
        loop {
            let isolated = self.isolated_nodes.read().await.clone();
            for m in self.latest_metrics().await {
                if m.state == State::Leader
                    && !isolated.contains(&m.id)
                    && m.commit_index >= 1
                    && m.commit_index == m.last_log_index
                {
                    return Ok(m.id);
                }
            }
            if Instant::now() > deadline {
                return Err(anyhow!("no serving leader within {:?}", timeout));
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Get a `Wait` handle for the given node.
    pub async fn wait(&self, node_id: &AgentId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.0.wait(timeout))
    }

    /// Wait for the given nodes to commit up to `want` (inclusive).
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_commit(&self, node_ids: &[AgentId], want: Index, timeout: Option<Duration>, msg: &str) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.commit(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to assume the wanted state.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(&self, node_ids: &[AgentId], want: State, timeout: Option<Duration>, msg: &str) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.state(want, msg).await?;
        }
        Ok(())
    }

    /// Write a single value, optionally under an idempotency key.
    pub async fn set_value(
        &self,
        target: AgentId,
        path: &str,
        value: Value,
        client_id: Option<&str>,
    ) -> Result<WriteResponse, ClientError> {
        let mut trx = Transaction::set(path, value);
        if let Some(id) = client_id {
            trx = trx.with_client_id(id);
        }
        self.agent(target).await.write(vec![trx], false).await
    }

    /// Read a single path from the committed store of the target.
    pub async fn read_value(&self, target: AgentId, path: &str) -> Result<Option<Value>, ClientError> {
        let results: Vec<ReadResult> = self.agent(target).await.read(vec![vec![path.to_string()]]).await?;
        Ok(results.first().and_then(|r| value_at(&r.result, path)))
    }

    /// Assert that the non-isolated part of the cluster has exactly one
    /// leader and that every member agrees on it and on the term.
    pub async fn assert_stable_cluster(&self) {
        let isolated = self.isolated_nodes.read().await;
        let nodes: Vec<AgencyMetrics> = self
            .latest_metrics()
            .await
            .into_iter()
            .filter(|m| !isolated.contains(&m.id))
            .collect();
        let leaders: Vec<&AgencyMetrics> = nodes.iter().filter(|m| m.state == State::Leader).collect();
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
        let leader = leaders[0];
        for node in nodes.iter().filter(|m| m.active.contains(&m.id)) {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} sees leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, leader.current_term,
                "node {} is in term {}, leader is in {}",
                node.id, node.current_term, leader.current_term
            );
        }
    }
}

/// Walk a projected tree down the given `/`-separated path.
pub fn value_at(tree: &Value, path: &str) -> Option<Value> {
    let mut node = tree;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        node = node.as_object()?.get(part)?;
    }
    Some(node.clone())
}

#[async_trait]
impl PeerTransport for AgencyRouter {
    /// Send an append-entries package to the target node.
    async fn send_append_entries(&self, target: AgentId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).context("target node not found in routing table")?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        let node = addr.0.clone();
        drop(isolated);
        drop(rt);
        Ok(node.append_entries(rpc).await?)
    }

    /// Send a vote request to the target node.
    async fn send_request_vote(&self, target: AgentId, rpc: VoteRequest) -> Result<VoteResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).context("target node not found in routing table")?;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node is isolated"));
        }
        let node = addr.0.clone();
        drop(isolated);
        drop(rt);
        Ok(node.request_vote(rpc).await?)
    }

    /// Push a configuration to the target node.
    async fn send_inform(&self, target: AgentId, rpc: Inform) -> Result<()> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).context("target node not found in routing table")?;
        if isolated.contains(&target) || isolated.contains(&rpc.id) {
            return Err(anyhow!("target node is isolated"));
        }
        let node = addr.0.clone();
        drop(isolated);
        drop(rt);
        Ok(node.inform(rpc).await?)
    }
}
