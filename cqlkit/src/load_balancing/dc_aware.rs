use derivative::Derivative;
use itertools::Itertools;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::topology::{Node, NodeDistance};
use crate::cluster::{ClusterMetadata, ConnectionManager, NodeInfo};
use crate::load_balancing::{LoadBalancingStrategy, QueryPlan, Request};
use crate::transport::CqlTransport;

/// Datacenter-aware round-robin load balancing. Nodes in the local datacenter are tried first,
/// in round-robin order, followed by at most `used_hosts_per_remote_dc` nodes from each remote
/// datacenter. Requests with a datacenter-local consistency (`LocalOne`, `LocalQuorum`,
/// `LocalSerial`) never leave the local datacenter.
///
/// Remote nodes are ignored entirely when `used_hosts_per_remote_dc` is 0.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DcAwareRoundRobinLoadBalancingStrategy<T: CqlTransport, CM: ConnectionManager<T>> {
    local_dc: String,
    used_hosts_per_remote_dc: usize,
    prev_idx: AtomicUsize,
    #[derivative(Debug = "ignore")]
    _transport: PhantomData<T>,
    #[derivative(Debug = "ignore")]
    _connection_manager: PhantomData<CM>,
}

impl<T: CqlTransport, CM: ConnectionManager<T>> DcAwareRoundRobinLoadBalancingStrategy<T, CM> {
    pub fn new(local_dc: String, used_hosts_per_remote_dc: usize) -> Self {
        DcAwareRoundRobinLoadBalancingStrategy {
            local_dc,
            used_hosts_per_remote_dc,
            prev_idx: Default::default(),
            _transport: Default::default(),
            _connection_manager: Default::default(),
        }
    }

    fn rotated(mut nodes: Vec<Arc<Node<T, CM>>>, index: usize) -> Vec<Arc<Node<T, CM>>> {
        if !nodes.is_empty() {
            nodes.sort_unstable_by_key(|node| node.broadcast_rpc_address());
            let len = nodes.len();
            nodes.rotate_left(index % len);
        }

        nodes
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> LoadBalancingStrategy<T, CM>
    for DcAwareRoundRobinLoadBalancingStrategy<T, CM>
{
    fn query_plan(
        &self,
        request: Option<Request>,
        cluster: &ClusterMetadata<T, CM>,
    ) -> QueryPlan<T, CM> {
        let index = self.prev_idx.fetch_add(1, Ordering::Relaxed);

        let (local_nodes, remote_nodes): (Vec<_>, Vec<_>) = cluster
            .unignored_nodes()
            .into_iter()
            .partition(|node| node.datacenter() == self.local_dc);

        let mut nodes = Self::rotated(local_nodes, index);

        let dc_local = request
            .and_then(|request| request.consistency)
            .map(|consistency| consistency.is_dc_local())
            .unwrap_or(false);

        if !dc_local && self.used_hosts_per_remote_dc > 0 {
            let remote_by_dc = remote_nodes
                .into_iter()
                .into_group_map_by(|node| node.datacenter().to_string());

            for (_, dc_nodes) in remote_by_dc.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
                nodes.extend(
                    Self::rotated(dc_nodes, index)
                        .into_iter()
                        .take(self.used_hosts_per_remote_dc),
                );
            }
        }

        QueryPlan::new(nodes)
    }

    fn distance(&self, node: &NodeInfo) -> NodeDistance {
        if node.datacenter == self.local_dc {
            NodeDistance::Local
        } else if self.used_hosts_per_remote_dc > 0 {
            NodeDistance::Remote
        } else {
            NodeDistance::Ignored
        }
    }
}
