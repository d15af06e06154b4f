use arc_swap::ArcSwapOption;
use atomic::Atomic;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::Sender;
use tracing::*;
use uuid::Uuid;

use crate::cluster::connection_pool::{ConnectionPool, ConnectionPoolFactory};
use crate::cluster::topology::{NodeDistance, NodeState};
use crate::cluster::{ConnectionManager, NodeInfo};
use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::frame::Version;
use crate::transport::CqlTransport;

/// Connection counters of a node's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodePoolState {
    pub open_connections: usize,
    pub in_flight: usize,
    pub failures: usize,
}

/// Metadata about a node in the cluster, along with its connection pool.
pub struct Node<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static> {
    connection_pool_factory: Arc<ConnectionPoolFactory<T, CM>>,
    connection_pool: OnceLock<Arc<ConnectionPool<T, CM>>>,
    broadcast_rpc_address: SocketAddr,
    distance: Atomic<NodeDistance>,
    state: Atomic<NodeState>,
    host_id: Option<Uuid>,
    rack: String,
    datacenter: String,
    schema_version: ArcSwapOption<Uuid>,
}

impl<T: CqlTransport, CM: ConnectionManager<T>> Debug for Node<T, CM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("broadcast_rpc_address", &self.broadcast_rpc_address)
            .field("distance", &self.distance())
            .field("state", &self.state())
            .field("host_id", &self.host_id)
            .field("rack", &self.rack)
            .field("datacenter", &self.datacenter)
            .finish()
    }
}

impl<T: CqlTransport, CM: ConnectionManager<T>> Node<T, CM> {
    /// Creates a node known only by its address. Contact points are local until the load
    /// balancer says otherwise.
    pub(crate) fn new_contact_point(
        connection_pool_factory: Arc<ConnectionPoolFactory<T, CM>>,
        broadcast_rpc_address: SocketAddr,
    ) -> Self {
        Self {
            connection_pool_factory,
            connection_pool: OnceLock::new(),
            broadcast_rpc_address,
            distance: Atomic::new(NodeDistance::Local),
            state: Atomic::new(NodeState::Unknown),
            host_id: None,
            rack: Default::default(),
            datacenter: Default::default(),
            schema_version: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn with_node_info(
        connection_pool_factory: Arc<ConnectionPoolFactory<T, CM>>,
        node_info: NodeInfo,
        distance: NodeDistance,
        state: NodeState,
    ) -> Self {
        Self {
            connection_pool_factory,
            connection_pool: OnceLock::new(),
            broadcast_rpc_address: node_info.broadcast_rpc_address,
            distance: Atomic::new(distance),
            state: Atomic::new(state),
            host_id: Some(node_info.host_id),
            rack: node_info.rack,
            datacenter: node_info.datacenter,
            schema_version: ArcSwapOption::new(node_info.schema_version.map(Arc::new)),
        }
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state.load(Ordering::Relaxed)
    }

    /// Node distance in relation to the driver.
    #[inline]
    pub fn distance(&self) -> NodeDistance {
        self.distance.load(Ordering::Relaxed)
    }

    /// The host ID that is assigned to this node by the cluster. This value can be used to
    /// uniquely identify a node even when the underlying IP address changes. Contact points
    /// don't have one until discovered by the control connection.
    #[inline]
    pub fn host_id(&self) -> Option<Uuid> {
        self.host_id
    }

    /// The address clients are expected to connect to.
    #[inline]
    pub fn broadcast_rpc_address(&self) -> SocketAddr {
        self.broadcast_rpc_address
    }

    /// Returns the dc the node is in.
    #[inline]
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// Returns the rack the node is in.
    #[inline]
    pub fn rack(&self) -> &str {
        &self.rack
    }

    /// Schema version reported during the last metadata refresh.
    #[inline]
    pub fn schema_version(&self) -> Option<Uuid> {
        self.schema_version.load().as_deref().copied()
    }

    /// Should the node be skipped when routing requests.
    #[inline]
    pub fn is_ignored(&self) -> bool {
        self.distance() == NodeDistance::Ignored
    }

    /// Can the node receive requests: not ignored and not known to be down.
    #[inline]
    pub fn is_available(&self) -> bool {
        !self.is_ignored() && self.state().is_available()
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.distance() == NodeDistance::Local
    }

    /// Borrows the least busy connection to the node. Fails with
    /// [`Error::NoConnectionsAvailable`] without touching the network if the node is down or
    /// ignored.
    pub async fn persistent_connection(self: &Arc<Self>) -> Result<Arc<T>> {
        if !self.is_available() {
            return Err(Error::NoConnectionsAvailable(self.broadcast_rpc_address));
        }

        self.pool().borrow_connection().await
    }

    /// Creates a new connection to the node, outside of the pool, with optional event and error
    /// handlers.
    pub async fn new_connection(
        &self,
        event_handler: Option<Sender<ServerEvent>>,
        error_handler: Option<Sender<Error>>,
        version: Version,
    ) -> Result<T> {
        debug!(broadcast_rpc_address = %self.broadcast_rpc_address, %version, "Establishing new connection to node...");
        self.connection_pool_factory
            .new_connection(
                event_handler,
                error_handler,
                self.broadcast_rpc_address,
                version,
            )
            .await
    }

    /// Snapshot of pool counters. Never waits for pool maintenance.
    pub fn pool_state(&self) -> NodePoolState {
        self.connection_pool
            .get()
            .map(|pool| pool.state())
            .unwrap_or_default()
    }

    pub(crate) fn pool(self: &Arc<Self>) -> &Arc<ConnectionPool<T, CM>> {
        self.connection_pool.get_or_init(|| {
            debug!(broadcast_rpc_address = %self.broadcast_rpc_address, "Creating connection pool");

            self.connection_pool_factory.create(
                self.distance(),
                self.broadcast_rpc_address,
                Arc::downgrade(self),
            )
        })
    }

    /// Applies a new distance, resizing the pool if it exists.
    pub(crate) async fn update_distance(&self, distance: NodeDistance) {
        let previous = self.distance.swap(distance, Ordering::Relaxed);
        if previous == distance {
            return;
        }

        debug!(broadcast_rpc_address = %self.broadcast_rpc_address, %previous, %distance, "Node distance changed.");

        if let Some(pool) = self.connection_pool.get() {
            if let Err(error) = pool.ensure_size(distance).await {
                warn!(%error, broadcast_rpc_address = %self.broadcast_rpc_address, "Error resizing connection pool.");
            }
        }
    }

    pub(crate) fn update_schema_version(&self, schema_version: Option<Uuid>) {
        self.schema_version.store(schema_version.map(Arc::new));
    }

    /// Marks the node down and closes all its connections. The pool keeps reconnecting with the
    /// configured reconnection policy, so the node comes back even if no `UP` event follows.
    pub(crate) async fn on_host_down(self: &Arc<Self>) {
        if self.state() != NodeState::ForcedDown {
            self.mark_down();
        }

        if self.is_ignored() {
            return;
        }

        self.pool()
            .close_and_reconnect(Error::ConnectionClosed(self.broadcast_rpc_address))
            .await;
    }

    /// Marks the node up and reopens its core connections.
    pub(crate) fn on_host_up(&self) {
        self.mark_up();

        if let Some(pool) = self.connection_pool.get() {
            pool.reset_reconnection();
            pool.spawn_fill();
        }
    }

    /// Closes all connections for good, e.g. when the node leaves the cluster.
    pub(crate) async fn close_pool(&self) {
        if let Some(pool) = self.connection_pool.get() {
            pool.shut_down().await;
        }
    }

    pub(crate) fn force_down(&self) {
        self.state.store(NodeState::ForcedDown, Ordering::Relaxed);
    }

    pub(crate) fn mark_down(&self) {
        self.state.store(NodeState::Down, Ordering::Relaxed);
    }

    pub(crate) fn mark_up(&self) {
        self.state.store(NodeState::Up, Ordering::Relaxed);
    }

    /// A successful connection proves an unknown node is up.
    pub(crate) fn mark_up_if_unknown(&self) {
        let _ = self.state.compare_exchange(
            NodeState::Unknown,
            NodeState::Up,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Does the refreshed information describe this node, so the node (and its pool) can be
    /// kept as is.
    pub(crate) fn matches_node_info(&self, node_info: &NodeInfo) -> bool {
        self.host_id == Some(node_info.host_id)
            && self.broadcast_rpc_address == node_info.broadcast_rpc_address
            && self.datacenter == node_info.datacenter
            && self.rack == node_info.rack
    }
}
