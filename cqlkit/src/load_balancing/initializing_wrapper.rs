use std::sync::Arc;

use crate::cluster::topology::{Node, NodeDistance};
use crate::cluster::{ClusterMetadata, ConnectionManager, NodeInfo};
use crate::load_balancing::{LoadBalancingStrategy, QueryPlan, Request};
use crate::transport::CqlTransport;

// Wrapper strategy which returns contact points until cluster metadata gets populated.
pub struct InitializingWrapperLoadBalancingStrategy<
    T: CqlTransport + 'static,
    CM: ConnectionManager<T> + 'static,
    LB: LoadBalancingStrategy<T, CM>,
> {
    inner: LB,
    contact_points: Vec<Arc<Node<T, CM>>>,
}

impl<T: CqlTransport, CM: ConnectionManager<T>, LB: LoadBalancingStrategy<T, CM>>
    LoadBalancingStrategy<T, CM> for InitializingWrapperLoadBalancingStrategy<T, CM, LB>
{
    fn query_plan(
        &self,
        request: Option<Request>,
        cluster: &ClusterMetadata<T, CM>,
    ) -> QueryPlan<T, CM> {
        if cluster.has_nodes() {
            self.inner.query_plan(request, cluster)
        } else {
            QueryPlan::new(self.contact_points.clone())
        }
    }

    #[inline]
    fn distance(&self, node: &NodeInfo) -> NodeDistance {
        self.inner.distance(node)
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>, LB: LoadBalancingStrategy<T, CM>>
    InitializingWrapperLoadBalancingStrategy<T, CM, LB>
{
    pub fn new(inner: LB, contact_points: Vec<Arc<Node<T, CM>>>) -> Self {
        InitializingWrapperLoadBalancingStrategy {
            inner,
            contact_points,
        }
    }
}
