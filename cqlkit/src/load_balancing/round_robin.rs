use derivative::Derivative;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cluster::{ClusterMetadata, ConnectionManager};
use crate::load_balancing::{LoadBalancingStrategy, QueryPlan, Request};
use crate::transport::CqlTransport;

/// Round-robin load balancing: every plan starts at the next node, treating all nodes as local.
#[derive(Default, Derivative)]
#[derivative(Debug)]
pub struct RoundRobinLoadBalancingStrategy<T: CqlTransport, CM: ConnectionManager<T>> {
    prev_idx: AtomicUsize,
    #[derivative(Debug = "ignore")]
    _transport: PhantomData<T>,
    #[derivative(Debug = "ignore")]
    _connection_manager: PhantomData<CM>,
}

impl<T: CqlTransport, CM: ConnectionManager<T>> RoundRobinLoadBalancingStrategy<T, CM> {
    pub fn new() -> Self {
        RoundRobinLoadBalancingStrategy {
            prev_idx: Default::default(),
            _transport: Default::default(),
            _connection_manager: Default::default(),
        }
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> LoadBalancingStrategy<T, CM>
    for RoundRobinLoadBalancingStrategy<T, CM>
{
    fn query_plan(
        &self,
        _request: Option<Request>,
        cluster: &ClusterMetadata<T, CM>,
    ) -> QueryPlan<T, CM> {
        let mut nodes = cluster.unignored_nodes();
        if nodes.is_empty() {
            return QueryPlan::default();
        }

        nodes.sort_unstable_by_key(|node| node.broadcast_rpc_address());

        let cur_idx = self.prev_idx.fetch_add(1, Ordering::Relaxed);
        let len = nodes.len();
        nodes.rotate_left(cur_idx % len);

        QueryPlan::new(nodes)
    }
}
