//! Load balancing strategies decide which nodes receive requests, in what order, and how far
//! each node is from the driver (which in turn determines the size of its connection pool).
mod dc_aware;
mod initializing_wrapper;
mod random;
mod request;
mod round_robin;

pub(crate) use self::initializing_wrapper::InitializingWrapperLoadBalancingStrategy;
pub use self::dc_aware::DcAwareRoundRobinLoadBalancingStrategy;
pub use self::random::RandomLoadBalancingStrategy;
pub use self::request::Request;
pub use self::round_robin::RoundRobinLoadBalancingStrategy;

use std::sync::Arc;

use crate::cluster::topology::{Node, NodeDistance};
use crate::cluster::{ClusterMetadata, ConnectionManager, NodeInfo};
use crate::transport::CqlTransport;

/// Ordered nodes to try for a request. Nodes which are down or ignored at the time they would be
/// yielded are skipped, so a plan computed before a node failed never routes to it.
#[derive(Debug)]
pub struct QueryPlan<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static> {
    nodes: Vec<Arc<Node<T, CM>>>,
    position: usize,
}

impl<T: CqlTransport, CM: ConnectionManager<T>> QueryPlan<T, CM> {
    pub fn new(nodes: Vec<Arc<Node<T, CM>>>) -> Self {
        QueryPlan { nodes, position: 0 }
    }

    /// All nodes of the plan not yielded yet, regardless of their state.
    #[inline]
    pub fn remaining_nodes(&self) -> &[Arc<Node<T, CM>>] {
        &self.nodes[self.position..]
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> Default for QueryPlan<T, CM> {
    fn default() -> Self {
        QueryPlan::new(vec![])
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> Clone for QueryPlan<T, CM> {
    fn clone(&self) -> Self {
        QueryPlan {
            nodes: self.nodes.clone(),
            position: self.position,
        }
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> Iterator for QueryPlan<T, CM> {
    type Item = Arc<Node<T, CM>>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.nodes.get(self.position) {
            self.position += 1;

            if node.is_available() {
                return Some(node.clone());
            }
        }

        None
    }
}

/// Load balancing strategy, usually used for managing target node connections.
pub trait LoadBalancingStrategy<T: CqlTransport, CM: ConnectionManager<T>> {
    /// Returns query plan for given request.  If no request is given, return a generic plan for
    /// establishing connection(s) to node(s).
    fn query_plan(
        &self,
        request: Option<Request>,
        cluster: &ClusterMetadata<T, CM>,
    ) -> QueryPlan<T, CM>;

    /// Classifies a discovered node. Ignored nodes never receive requests and have no
    /// connections.
    fn distance(&self, _node: &NodeInfo) -> NodeDistance {
        NodeDistance::Local
    }
}
