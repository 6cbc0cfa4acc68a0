//! # local transport
//!
//! why: exercise whole clusters in one process, including partitions and crashes
//! relations: dispatches straight into NodeHandle rpc handlers
//! what: LocalNetwork registry with isolate/heal/remove, per-node LocalTransport

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use raft_core::{AppendEntriesArgs, AppendEntriesReply, NodeId, RequestVoteArgs, RequestVoteReply};

use super::{Transport, TransportError};
use crate::node::NodeHandle;

#[derive(Default)]
struct Registry {
    nodes: HashMap<NodeId, NodeHandle>,
    isolated: HashSet<NodeId>,
}

/// In-process network shared by every node of a test cluster
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a node reachable under its id
    pub fn register(&self, handle: NodeHandle) {
        self.registry.write().nodes.insert(handle.id(), handle);
    }

    /// Take a node off the network entirely, as if its process died
    pub fn remove(&self, id: NodeId) -> Option<NodeHandle> {
        self.registry.write().nodes.remove(&id)
    }

    /// Drop all traffic to and from `id`
    pub fn isolate(&self, id: NodeId) {
        self.registry.write().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.registry.write().isolated.remove(&id);
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.registry.read().isolated.contains(&id)
    }

    /// Transport used by node `from` to reach its peers
    pub fn transport(&self, from: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from,
            network: self.clone(),
        })
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<NodeHandle, TransportError> {
        let registry = self.registry.read();
        if registry.isolated.contains(&from) || registry.isolated.contains(&to) {
            return Err(TransportError::Unreachable(to));
        }
        registry
            .nodes
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))
    }
}

pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        let target = self.network.route(self.from, peer)?;
        // let other tasks interleave as they would on a real wire
        tokio::task::yield_now().await;
        let reply = target
            .handle_request_vote(args)
            .map_err(|err| TransportError::Remote(err.to_string()))?;
        // a partition raised while the request was in flight eats the reply
        self.network.route(peer, self.from)?;
        Ok(reply)
    }

    async fn send_append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        let target = self.network.route(self.from, peer)?;
        tokio::task::yield_now().await;
        let reply = target
            .handle_append_entries(args)
            .map_err(|err| TransportError::Remote(err.to_string()))?;
        self.network.route(peer, self.from)?;
        Ok(reply)
    }
}
