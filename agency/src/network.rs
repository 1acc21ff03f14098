//! The peer transport interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::agent::AppendEntriesRequest;
use crate::agent::AppendEntriesResponse;
use crate::agent::Inform;
use crate::agent::VoteRequest;
use crate::agent::VoteResponse;
use crate::AgentId;

/// The capability set the agency needs from the wire.
///
/// The production implementation speaks HTTP between agents; the test suite
/// uses an in-memory router which can isolate nodes and delay frames. Every
/// call carries its own deadline at the call site, so implementations should
/// not retry internally.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Send an append-entries package (or bare heartbeat) to the target.
    async fn send_append_entries(&self, target: AgentId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send a vote request to the target.
    async fn send_request_vote(&self, target: AgentId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Push a new authoritative configuration to the target.
    async fn send_inform(&self, target: AgentId, rpc: Inform) -> Result<()>;
}
