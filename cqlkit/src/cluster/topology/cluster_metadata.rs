use itertools::Itertools;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::topology::{Node, NodeMap};
use crate::cluster::ConnectionManager;
use crate::transport::CqlTransport;

/// Immutable snapshot of the nodes this driver instance knows about. A new snapshot is built
/// for every change and swapped in atomically, so readers always see a consistent view.
#[derive(Debug, Clone)]
pub struct ClusterMetadata<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static> {
    nodes: NodeMap<T, CM>,
}

impl<T: CqlTransport, CM: ConnectionManager<T>> ClusterMetadata<T, CM> {
    pub fn new(nodes: NodeMap<T, CM>) -> Self {
        ClusterMetadata { nodes }
    }

    /// Creates a new metadata with a node replaced/added. Nodes without a host id cannot be
    /// part of the snapshot and are ignored.
    #[must_use]
    pub fn clone_with_node(&self, node: Arc<Node<T, CM>>) -> Self {
        let mut nodes = self.nodes.clone();
        if let Some(host_id) = node.host_id() {
            nodes.insert(host_id, node);
        }

        ClusterMetadata { nodes }
    }

    /// Creates a new metadata with a node removed.
    #[must_use]
    pub fn clone_without_node(&self, broadcast_rpc_address: SocketAddr) -> Self {
        let nodes = self
            .nodes
            .iter()
            .filter(|(_, node)| node.broadcast_rpc_address() != broadcast_rpc_address)
            .map(|(host_id, node)| (*host_id, node.clone()))
            .collect();

        ClusterMetadata { nodes }
    }

    /// Returns all known nodes.
    #[inline]
    pub fn nodes(&self) -> &NodeMap<T, CM> {
        &self.nodes
    }

    /// Checks if any nodes are known.
    #[inline]
    pub fn has_nodes(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Finds a node by its address.
    pub fn find_node_by_rpc_address(
        &self,
        broadcast_rpc_address: SocketAddr,
    ) -> Option<Arc<Node<T, CM>>> {
        self.nodes
            .values()
            .find(|node| node.broadcast_rpc_address() == broadcast_rpc_address)
            .cloned()
    }

    /// Returns nodes which are not ignored by the load balancer.
    pub fn unignored_nodes(&self) -> Vec<Arc<Node<T, CM>>> {
        self.nodes
            .values()
            .filter(|node| !node.is_ignored())
            .cloned()
            .collect()
    }

    /// Returns the names of all known datacenters, sorted.
    pub fn datacenters(&self) -> Vec<&str> {
        self.nodes
            .values()
            .map(|node| node.datacenter())
            .unique()
            .sorted_unstable()
            .collect()
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> Default for ClusterMetadata<T, CM> {
    fn default() -> Self {
        ClusterMetadata {
            nodes: Default::default(),
        }
    }
}
