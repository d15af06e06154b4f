use derive_more::Constructor;
use std::net::SocketAddr;
use uuid::Uuid;

/// Information about a node, as read from `system.local` or `system.peers`.
#[derive(Debug, Clone, PartialEq, Eq, Constructor)]
pub struct NodeInfo {
    pub host_id: Uuid,
    pub broadcast_rpc_address: SocketAddr,
    pub datacenter: String,
    pub rack: String,
    pub schema_version: Option<Uuid>,
}
