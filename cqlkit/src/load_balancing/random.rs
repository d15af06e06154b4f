use rand::prelude::*;
use rand::rng;

use crate::cluster::{ClusterMetadata, ConnectionManager};
use crate::load_balancing::{LoadBalancingStrategy, QueryPlan, Request};
use crate::transport::CqlTransport;

/// Tries all non-ignored nodes in a fresh random order for every request.
#[derive(Default, Debug, Clone, Copy)]
pub struct RandomLoadBalancingStrategy;

impl RandomLoadBalancingStrategy {
    pub fn new() -> Self {
        RandomLoadBalancingStrategy
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> LoadBalancingStrategy<T, CM>
    for RandomLoadBalancingStrategy
{
    fn query_plan(
        &self,
        _request: Option<Request>,
        cluster: &ClusterMetadata<T, CM>,
    ) -> QueryPlan<T, CM> {
        let mut nodes = cluster.unignored_nodes();
        nodes.shuffle(&mut rng());

        QueryPlan::new(nodes)
    }
}
