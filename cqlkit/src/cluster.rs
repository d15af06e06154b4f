use std::net::SocketAddr;
use std::sync::Arc;

pub use topology::cluster_metadata::ClusterMetadata;

pub use crate::cluster::config_tcp::{NodeTcpConfig, NodeTcpConfigBuilder};
pub use crate::cluster::connection_manager::{startup, ConnectionManager};
pub use crate::cluster::connection_pool::{ConnectionPoolConfig, PoolSize};
pub use crate::cluster::control_connection::ControlConnectionState;
pub use crate::cluster::keyspace_holder::KeyspaceHolder;
pub use crate::cluster::node_address::NodeAddress;
pub use crate::cluster::node_info::NodeInfo;
pub use crate::cluster::tcp_connection_manager::TcpConnectionManager;

pub(crate) use crate::cluster::cluster_metadata_manager::ClusterMetadataManager;

use crate::error::Result;
use crate::frame::Version;
use crate::future::BoxFuture;
use crate::transport::CqlTransport;

mod cluster_metadata_manager;
mod config_tcp;
pub(crate) mod connection_manager;
pub(crate) mod connection_pool;
pub(crate) mod control_connection;
mod keyspace_holder;
mod node_address;
mod node_info;
pub(crate) mod schema_agreement;
pub(crate) mod send_envelope;
pub mod session;
mod tcp_connection_manager;
pub mod topology;

/// Generic connection configuration trait that can be used to create user-supplied
/// connection objects that can be used with the session builders.
pub trait GenericClusterConfig<T: CqlTransport, CM: ConnectionManager<T>>: Send + Sync {
    /// Creates the connection manager. Every connection it creates should switch to the
    /// keyspace stored in given holder.
    fn create_manager(&self, keyspace_holder: Arc<KeyspaceHolder>) -> BoxFuture<'_, Result<CM>>;

    /// Initial nodes used to discover the rest of the cluster.
    fn contact_points(&self) -> &[SocketAddr];

    /// Highest protocol version to try when connecting.
    fn version(&self) -> Version;

    /// Returns desired event channel capacity. Take a look at ['Session'] builders for more info.
    fn event_channel_capacity(&self) -> usize;
}
