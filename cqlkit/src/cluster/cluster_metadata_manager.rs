use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use itertools::Itertools;
use tokio::sync::Mutex;
use tracing::*;

use crate::cluster::connection_pool::ConnectionPoolFactory;
use crate::cluster::topology::{Node, NodeMap, NodeState};
use crate::cluster::{ClusterMetadata, ConnectionManager, NodeInfo};
use crate::error::{Error, Result};
use crate::frame::message_error::AdditionalErrorInfo;
use crate::frame::message_request::RequestBody;
use crate::load_balancing::LoadBalancingStrategy;
use crate::query::QueryParams;
use crate::transport::CqlTransport;
use crate::types::Row;

const LOCAL_QUERY: &str = "SELECT * FROM system.local WHERE key='local'";
const PEERS_QUERY: &str = "SELECT * FROM system.peers";
const PEERS_V2_QUERY: &str = "SELECT * FROM system.peers_v2";

/// Owns the current cluster metadata snapshot. Only the control connection writes new
/// snapshots; everybody else reads them.
pub struct ClusterMetadataManager<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static> {
    metadata: ArcSwap<ClusterMetadata<T, CM>>,
    connection_pool_factory: Arc<ConnectionPoolFactory<T, CM>>,
    write_lock: Mutex<()>,
}

impl<T: CqlTransport, CM: ConnectionManager<T>> ClusterMetadataManager<T, CM> {
    pub(crate) fn new(connection_pool_factory: Arc<ConnectionPoolFactory<T, CM>>) -> Self {
        ClusterMetadataManager {
            metadata: ArcSwap::from_pointee(ClusterMetadata::default()),
            connection_pool_factory,
            write_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn metadata(&self) -> Arc<ClusterMetadata<T, CM>> {
        self.metadata.load_full()
    }

    #[inline]
    pub(crate) fn connection_pool_factory(&self) -> &Arc<ConnectionPoolFactory<T, CM>> {
        &self.connection_pool_factory
    }

    /// Refreshes stored metadata from system tables. Nodes with unchanged identity are kept, so
    /// their pools survive, and distances of all nodes are recomputed. Note: it is expected to
    /// be called by the control connection.
    pub async fn refresh_metadata<LB: LoadBalancingStrategy<T, CM> + ?Sized>(
        &self,
        control_transport: &T,
        load_balancing: &LB,
    ) -> Result<()> {
        let node_infos = Self::build_node_infos(control_transport).await?;

        let _guard = self.write_lock.lock().await;
        let old_metadata = self.metadata.load_full();

        let mut nodes = NodeMap::default();
        let mut kept_nodes = Vec::with_capacity(node_infos.len());

        for node_info in node_infos {
            let host_id = node_info.host_id;
            let distance = load_balancing.distance(&node_info);

            let node = match old_metadata
                .nodes()
                .get(&host_id)
                .filter(|node| node.matches_node_info(&node_info))
            {
                Some(node) => {
                    node.update_schema_version(node_info.schema_version);
                    kept_nodes.push((node.clone(), distance));
                    node.clone()
                }
                None => {
                    debug!(broadcast_rpc_address = %node_info.broadcast_rpc_address, %host_id, %distance, "Discovered node.");

                    Arc::new(Node::with_node_info(
                        self.connection_pool_factory.clone(),
                        node_info,
                        distance,
                        NodeState::Unknown,
                    ))
                }
            };

            nodes.insert(host_id, node);
        }

        let removed_nodes = old_metadata
            .nodes()
            .iter()
            .filter(|(host_id, node)| {
                nodes
                    .get(*host_id)
                    .map(|new_node| !Arc::ptr_eq(*node, new_node))
                    .unwrap_or(true)
            })
            .map(|(_, node)| node.clone())
            .collect_vec();

        self.metadata.store(Arc::new(ClusterMetadata::new(nodes)));

        for (node, distance) in kept_nodes {
            node.update_distance(distance).await;
        }

        for node in removed_nodes {
            debug!(broadcast_rpc_address = %node.broadcast_rpc_address(), "Node no longer in cluster.");
            node.close_pool().await;
        }

        Ok(())
    }

    /// Removes a node which left the cluster, closing its connections.
    pub async fn remove_node(&self, broadcast_rpc_address: SocketAddr) {
        let _guard = self.write_lock.lock().await;
        let old_metadata = self.metadata.load_full();

        if let Some(node) = old_metadata.find_node_by_rpc_address(broadcast_rpc_address) {
            self.metadata
                .store(Arc::new(old_metadata.clone_without_node(broadcast_rpc_address)));
            node.close_pool().await;
        }
    }

    async fn build_node_infos(control_transport: &T) -> Result<Vec<NodeInfo>> {
        let control_addr = control_transport.address();
        let local = send_query(LOCAL_QUERY, control_transport)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| format!("Node {control_addr} failed to return info about itself!"))?;

        // Don't rely on system.local.rpc_address for the control node, since it might report
        // the normal RPC address instead of the broadcast one. We already know the endpoint
        // anyway since we've just used it to query.
        let mut node_infos = vec![build_node_info(&local, control_addr)?];

        for row in query_peers(control_transport).await? {
            if !is_peer_row_valid(&row) {
                warn!(%control_addr, "Ignoring invalid peer row.");
                continue;
            }

            if let Some(broadcast_rpc_address) = broadcast_rpc_address_from_row(&row, control_addr)
            {
                node_infos.push(build_node_info(&row, broadcast_rpc_address)?);
            }
        }

        Ok(node_infos)
    }
}

pub(crate) async fn send_query<T: CqlTransport>(query: &str, transport: &T) -> Result<Vec<Row>> {
    let query_params = QueryParams {
        is_idempotent: true,
        ..Default::default()
    };

    let response = transport
        .write_request(&RequestBody::new_query(query, query_params))
        .await?;

    let opcode = response.opcode();
    response
        .into_rows()
        .ok_or(Error::UnexpectedResponse(opcode))
}

async fn query_peers<T: CqlTransport>(transport: &T) -> Result<Vec<Row>> {
    match send_query(PEERS_V2_QUERY, transport).await {
        Ok(result) => Ok(result),
        // peers_v2 does not exist
        Err(Error::Server { body, .. })
            if body.additional_info == AdditionalErrorInfo::Invalid =>
        {
            send_query(PEERS_QUERY, transport).await
        }
        Err(error) => Err(error),
    }
}

fn build_node_info(row: &Row, broadcast_rpc_address: SocketAddr) -> Result<NodeInfo> {
    Ok(NodeInfo::new(
        row.get_r_by_name("host_id")?,
        broadcast_rpc_address,
        row.get_by_name("data_center")?.unwrap_or_default(),
        row.get_by_name("rack")?.unwrap_or_default(),
        row.get_by_name("schema_version")?,
    ))
}

fn broadcast_rpc_address_from_row(row: &Row, control_addr: SocketAddr) -> Option<SocketAddr> {
    // system.peers_v2 uses native_address
    let rpc_address = match row.get_by_name::<IpAddr>("rpc_address") {
        Ok(None) => row.get_by_name("native_address"),
        result => result,
    };

    let rpc_address = match rpc_address {
        Ok(Some(rpc_address)) => rpc_address,
        Ok(None) => return None,
        Err(error) => {
            // this could only happen if system tables are corrupted, but handle gracefully
            warn!(%error, "Error getting rpc address.");
            return None;
        }
    };

    let rpc_port = row
        .get_by_name::<i32>("rpc_port")
        .ok()
        .flatten()
        .or_else(|| row.get_by_name::<i32>("native_port").ok().flatten())
        .and_then(|port| u16::try_from(port).ok())
        .unwrap_or_else(|| control_addr.port());

    let rpc_address = SocketAddr::new(rpc_address, rpc_port);

    // if the peer is actually the control node, ignore that peer as it is likely a
    // misconfiguration problem
    if rpc_address == control_addr {
        warn!(
            node = %rpc_address,
            control = %control_addr,
            "Control node has itself as a peer, thus will be ignored. This is likely due to a \
            misconfiguration; please verify your rpc_address configuration on all nodes in your \
            cluster."
        );

        None
    } else {
        Some(rpc_address)
    }
}

fn is_peer_row_valid(row: &Row) -> bool {
    let has_peers_rpc_address = !row.is_empty_by_name("rpc_address");
    let has_peers_v_2_rpc_address =
        !row.is_empty_by_name("native_address") && !row.is_empty_by_name("native_port");

    (has_peers_rpc_address || has_peers_v_2_rpc_address) && !row.is_empty_by_name("host_id")
}
