use arc_swap::ArcSwap;
use atomic::Atomic;
use bytemuck::NoUninit;
use derive_more::Display;
use futures::future::join_all;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::*;

use crate::cluster::keyspace_holder::use_keyspace_statement;
use crate::cluster::topology::{Node, NodeDistance, NodePoolState, NodeState};
use crate::cluster::ConnectionManager;
use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::frame::message_request::RequestBody;
use crate::frame::Version;
use crate::retry::{ReconnectionPolicy, ReconnectionSchedule};
use crate::transport::CqlTransport;

const DEFAULT_LOCAL_CORE_SIZE: usize = 1;
const DEFAULT_LOCAL_MAX_SIZE: usize = 2;
const DEFAULT_REMOTE_CORE_SIZE: usize = 1;
const DEFAULT_REMOTE_MAX_SIZE: usize = 1;
const DEFAULT_NEW_CONNECTION_THRESHOLD: usize = 512;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, PartialEq, Eq, Display, NoUninit)]
#[repr(u8)]
enum ReconnectionState {
    NotRunning,
    InProgress,
    Disabled,
}

async fn new_connection<T: CqlTransport, CM: ConnectionManager<T>>(
    connection_manager: &CM,
    event_handler: Option<mpsc::Sender<ServerEvent>>,
    error_handler: Option<mpsc::Sender<Error>>,
    broadcast_rpc_address: SocketAddr,
    version: Version,
    timeout: Option<Duration>,
) -> Result<T> {
    let connection = connection_manager.connection(
        event_handler,
        error_handler,
        broadcast_rpc_address,
        version,
    );

    if let Some(timeout) = timeout {
        tokio::time::timeout(timeout, connection)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "Timeout waiting for connection to: {broadcast_rpc_address}"
                ))
            })
            .and_then(|result| result)
    } else {
        connection.await
    }
}

/// Number of connections kept open to a node at a given distance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSize {
    /// Connections opened eagerly and re-opened when lost.
    pub core: usize,
    /// Upper bound for connections opened on demand under load.
    pub max: usize,
}

impl PoolSize {
    pub fn new(core: usize, max: usize) -> Self {
        PoolSize {
            core,
            max: max.max(core),
        }
    }
}

/// Configuration for node connection pools. Pool size depends on node distance: ignored nodes
/// never have connections, local and remote ones keep between `core` and `max` of them. A new
/// connection is opened when every open one has at least `new_connection_threshold` requests in
/// flight.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionPoolConfig {
    local_size: PoolSize,
    remote_size: PoolSize,
    new_connection_threshold: usize,
    connect_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        ConnectionPoolConfig {
            local_size: PoolSize::new(DEFAULT_LOCAL_CORE_SIZE, DEFAULT_LOCAL_MAX_SIZE),
            remote_size: PoolSize::new(DEFAULT_REMOTE_CORE_SIZE, DEFAULT_REMOTE_MAX_SIZE),
            new_connection_threshold: DEFAULT_NEW_CONNECTION_THRESHOLD,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

impl ConnectionPoolConfig {
    #[must_use]
    pub fn with_local_size(mut self, core: usize, max: usize) -> Self {
        self.local_size = PoolSize::new(core, max);
        self
    }

    #[must_use]
    pub fn with_remote_size(mut self, core: usize, max: usize) -> Self {
        self.remote_size = PoolSize::new(core, max);
        self
    }

    #[must_use]
    pub fn with_new_connection_threshold(mut self, new_connection_threshold: usize) -> Self {
        self.new_connection_threshold = new_connection_threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the interval of `OPTIONS` heartbeats sent on idle connections. `None` disables
    /// heartbeats.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Option<Duration>) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Pool size for a node at given distance.
    pub fn size(&self, distance: NodeDistance) -> PoolSize {
        match distance {
            NodeDistance::Local => self.local_size,
            NodeDistance::Remote => self.remote_size,
            NodeDistance::Ignored => PoolSize::new(0, 0),
        }
    }

    #[inline]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }
}

pub(crate) struct ConnectionPoolFactory<
    T: CqlTransport + 'static,
    CM: ConnectionManager<T> + 'static,
> {
    config: ConnectionPoolConfig,
    version: Arc<Atomic<Version>>,
    connection_manager: Arc<CM>,
    keyspace_receiver: Receiver<Option<String>>,
    reconnection_policy: Arc<dyn ReconnectionPolicy + Send + Sync>,
    _transport: PhantomData<T>,
}

impl<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static> ConnectionPoolFactory<T, CM> {
    pub(crate) fn new(
        config: ConnectionPoolConfig,
        version: Arc<Atomic<Version>>,
        connection_manager: Arc<CM>,
        keyspace_receiver: Receiver<Option<String>>,
        reconnection_policy: Arc<dyn ReconnectionPolicy + Send + Sync>,
    ) -> Self {
        ConnectionPoolFactory {
            config,
            version,
            connection_manager,
            keyspace_receiver,
            reconnection_policy,
            _transport: Default::default(),
        }
    }

    /// Protocol version negotiated by the control connection.
    #[inline]
    pub(crate) fn version(&self) -> Version {
        self.version.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_version(&self, version: Version) {
        self.version.store(version, Ordering::Relaxed);
    }

    /// Opens a standalone connection, not managed by any pool.
    pub(crate) async fn new_connection(
        &self,
        event_handler: Option<mpsc::Sender<ServerEvent>>,
        error_handler: Option<mpsc::Sender<Error>>,
        broadcast_rpc_address: SocketAddr,
        version: Version,
    ) -> Result<T> {
        new_connection(
            self.connection_manager.as_ref(),
            event_handler,
            error_handler,
            broadcast_rpc_address,
            version,
            self.config.connect_timeout,
        )
        .await
    }

    /// Creates an empty pool. Connections are opened by background tasks and on first use.
    pub(crate) fn create(
        &self,
        node_distance: NodeDistance,
        broadcast_rpc_address: SocketAddr,
        node: Weak<Node<T, CM>>,
    ) -> Arc<ConnectionPool<T, CM>> {
        let size = self.config.size(node_distance);
        let (error_sender, error_receiver) = mpsc::channel(size.max.max(1));

        let pool = Arc::new(ConnectionPool {
            connection_manager: Arc::downgrade(&self.connection_manager),
            node: node.clone(),
            broadcast_rpc_address,
            config: self.config,
            version: self.version.clone(),
            connections: ArcSwap::from_pointee(vec![]),
            resize_lock: Mutex::new(()),
            core_size: AtomicUsize::new(size.core),
            max_size: AtomicUsize::new(size.max),
            failures: AtomicUsize::new(0),
            growing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnection_state: Atomic::new(ReconnectionState::NotRunning),
            error_sender,
        });

        Self::monitor_connections(
            error_receiver,
            Arc::downgrade(&pool),
            node,
            self.reconnection_policy.clone(),
        );

        Self::watch_keyspace(self.keyspace_receiver.clone(), Arc::downgrade(&pool));

        if let Some(heartbeat_interval) = self.config.heartbeat_interval {
            Self::send_heartbeats(heartbeat_interval, Arc::downgrade(&pool));
        }

        pool.spawn_fill();
        pool
    }

    fn watch_keyspace(
        mut keyspace_receiver: Receiver<Option<String>>,
        pool: Weak<ConnectionPool<T, CM>>,
    ) {
        tokio::spawn(async move {
            while let Ok(()) = keyspace_receiver.changed().await {
                let keyspace = keyspace_receiver.borrow_and_update().clone();
                let Some(pool) = pool.upgrade() else {
                    break;
                };

                if let Some(keyspace) = keyspace {
                    let broadcast_rpc_address = pool.broadcast_rpc_address;
                    let use_request = RequestBody::new_query(
                        use_keyspace_statement(&keyspace),
                        Default::default(),
                    );

                    let connections = pool.connections.load_full();
                    join_all(
                        connections
                            .iter()
                            .filter(|connection| !connection.is_broken())
                            .map(|connection| {
                                let use_request = &use_request;
                                async move {
                                    if let Err(error) = connection.write_request(use_request).await {
                                        error!(%error, %broadcast_rpc_address, "Error setting keyspace for connection!");
                                    }
                                }
                            }),
                    )
                    .await;
                }
            }
        });
    }

    fn send_heartbeats(heartbeat_interval: Duration, pool: Weak<ConnectionPool<T, CM>>) {
        tokio::spawn(async move {
            loop {
                sleep(heartbeat_interval).await;

                let Some(pool) = pool.upgrade() else {
                    break;
                };

                pool.heartbeat(heartbeat_interval).await;
            }
        });
    }

    fn monitor_connections(
        mut receiver: mpsc::Receiver<Error>,
        pool: Weak<ConnectionPool<T, CM>>,
        node: Weak<Node<T, CM>>,
        reconnection_policy: Arc<dyn ReconnectionPolicy + Send + Sync>,
    ) {
        tokio::spawn(async move {
            while let Some(error) = receiver.recv().await {
                let Some(current_pool) = pool.upgrade() else {
                    break;
                };

                if current_pool.is_closed() {
                    break;
                }

                // when one connection goes down, all of them will most likely go down, so we need
                // to protect against many reconnection attempts
                if current_pool
                    .reconnection_state
                    .compare_exchange(
                        ReconnectionState::NotRunning,
                        ReconnectionState::InProgress,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    continue;
                }

                drop(current_pool);

                if let Some(node) = node.upgrade() {
                    let broadcast_rpc_address = node.broadcast_rpc_address();

                    if node.state() == NodeState::ForcedDown {
                        debug!(
                            %broadcast_rpc_address,
                            "Not starting reconnection for a forced down node."
                        );

                        if let Some(pool) = pool.upgrade() {
                            pool.reconnection_state
                                .store(ReconnectionState::Disabled, Ordering::Relaxed);
                        }

                        continue;
                    }

                    warn!(
                        %error,
                        %broadcast_rpc_address,
                        "Connection down. Starting reconnection."
                    );

                    node.mark_down();

                    let reconnection_schedule = reconnection_policy.new_node_schedule();
                    let pool = pool.clone();
                    let node = Arc::downgrade(&node);

                    tokio::spawn(async move {
                        let new_state =
                            Self::run_reconnection_loop(reconnection_schedule, pool.clone()).await;

                        if let Some(pool) = pool.upgrade() {
                            pool.reconnection_state.store(new_state, Ordering::Relaxed);
                        }

                        debug!(%broadcast_rpc_address, %new_state, "Reconnection loop stopped.");

                        if let Some(node) = node.upgrade() {
                            if new_state == ReconnectionState::Disabled {
                                warn!(
                                    %broadcast_rpc_address,
                                    "Forcing node down, since no connection can be established."
                                );
                                node.force_down();
                            } else {
                                debug!(%broadcast_rpc_address, "All connections reestablished.");
                                node.mark_up();
                            }
                        }
                    });
                } else {
                    warn!("Node not found when trying to reconnect!");
                    break;
                };
            }

            debug!("Pool monitoring stopped.");
        });
    }

    async fn run_reconnection_loop(
        mut reconnection_schedule: Box<dyn ReconnectionSchedule + Send + Sync>,
        pool: Weak<ConnectionPool<T, CM>>,
    ) -> ReconnectionState {
        while let Some(delay) = reconnection_schedule.next_delay() {
            sleep(delay).await;

            let pool = match pool.upgrade() {
                None => return ReconnectionState::Disabled, // the pool might be gone
                Some(pool) => pool,
            };

            if pool.is_closed() {
                return ReconnectionState::Disabled;
            }

            match pool.reconnect_broken().await {
                Ok(()) => return ReconnectionState::NotRunning,
                Err(Error::InvalidProtocol(_)) => return ReconnectionState::Disabled,
                Err(error) => {
                    debug!(
                        %error,
                        broadcast_rpc_address = %pool.broadcast_rpc_address,
                        failures = pool.failures.load(Ordering::Relaxed),
                        "Reconnection attempt failed."
                    );
                }
            }
        }

        // the policy doesn't want to reconnect to this node
        ReconnectionState::Disabled
    }
}

/// Connections to a single node.
pub(crate) struct ConnectionPool<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static> {
    connection_manager: Weak<CM>,
    node: Weak<Node<T, CM>>,
    broadcast_rpc_address: SocketAddr,
    config: ConnectionPoolConfig,
    version: Arc<Atomic<Version>>,
    connections: ArcSwap<Vec<Arc<T>>>,
    resize_lock: Mutex<()>,
    core_size: AtomicUsize,
    max_size: AtomicUsize,
    failures: AtomicUsize,
    growing: AtomicBool,
    closed: AtomicBool,
    reconnection_state: Atomic<ReconnectionState>,
    error_sender: mpsc::Sender<Error>,
}

impl<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static> ConnectionPool<T, CM> {
    /// Returns the least busy usable connection, opening one if none is open.
    pub(crate) async fn borrow_connection(self: &Arc<Self>) -> Result<Arc<T>> {
        let connections = self.connections.load();
        let mut open_connections = 0;
        let mut least_busy: Option<(&Arc<T>, usize)> = None;

        for connection in connections.iter().filter(|connection| !connection.is_broken()) {
            open_connections += 1;

            let in_flight = connection.in_flight();
            if least_busy.map_or(true, |(_, min_in_flight)| in_flight < min_in_flight) {
                least_busy = Some((connection, in_flight));
            }
        }

        match least_busy {
            Some((connection, in_flight)) => {
                if open_connections < self.core_size.load(Ordering::Relaxed)
                    || (in_flight >= self.config.new_connection_threshold
                        && open_connections < self.max_size.load(Ordering::Relaxed))
                {
                    self.spawn_fill();
                }

                Ok(connection.clone())
            }
            None => {
                drop(connections);
                self.open_on_demand().await
            }
        }
    }

    async fn open_on_demand(&self) -> Result<Arc<T>> {
        if self.max_size.load(Ordering::Relaxed) == 0 {
            return Err(Error::NoConnectionsAvailable(self.broadcast_rpc_address));
        }

        let _guard = self.resize_lock.lock().await;

        // somebody else might have opened one in the meantime
        let mut connections = self.usable_connections();
        if let Some(connection) = connections
            .iter()
            .min_by_key(|connection| connection.in_flight())
        {
            return Ok(connection.clone());
        }

        match self.open_connection().await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                connections.push(connection.clone());
                self.connections.store(Arc::new(connections));

                Ok(connection)
            }
            Err(error) => {
                warn!(%error, broadcast_rpc_address = %self.broadcast_rpc_address, "Cannot open connection to node.");

                self.report_error(error);
                Err(Error::NoConnectionsAvailable(self.broadcast_rpc_address))
            }
        }
    }

    async fn open_connection(&self) -> Result<T> {
        if self.is_closed() {
            return Err(Error::NoConnectionsAvailable(self.broadcast_rpc_address));
        }

        let connection_manager = self.connection_manager.upgrade().ok_or_else(|| {
            Error::General("Connection manager dropped - session is closing".into())
        })?;

        let result = new_connection(
            connection_manager.as_ref(),
            None,
            Some(self.error_sender.clone()),
            self.broadcast_rpc_address,
            self.version.load(Ordering::Relaxed),
            self.config.connect_timeout,
        )
        .await;

        match &result {
            Ok(_) => {
                self.failures.store(0, Ordering::Relaxed);
                if let Some(node) = self.node.upgrade() {
                    node.mark_up_if_unknown();
                }
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    fn usable_connections(&self) -> Vec<Arc<T>> {
        self.connections
            .load()
            .iter()
            .filter(|connection| !connection.is_broken())
            .cloned()
            .collect()
    }

    /// Opens missing core connections, or one more connection when all are busy, in the
    /// background. At most one such task runs at a time.
    pub(crate) fn spawn_fill(self: &Arc<Self>) {
        if self.is_closed() || self.growing.swap(true, Ordering::AcqRel) {
            return;
        }

        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(pool) = pool.upgrade() else {
                return;
            };

            if let Err(error) = pool.fill().await {
                debug!(%error, broadcast_rpc_address = %pool.broadcast_rpc_address, "Error filling connection pool.");
                pool.report_error(error);
            }

            pool.growing.store(false, Ordering::Release);
        });
    }

    async fn fill(&self) -> Result<()> {
        let _guard = self.resize_lock.lock().await;

        let mut connections = self.usable_connections();
        let core_size = self.core_size.load(Ordering::Relaxed);
        let max_size = self.max_size.load(Ordering::Relaxed);

        let saturated = !connections.is_empty()
            && connections
                .iter()
                .all(|connection| connection.in_flight() >= self.config.new_connection_threshold);

        let target = if connections.len() < core_size {
            core_size
        } else if saturated && connections.len() < max_size {
            connections.len() + 1
        } else {
            connections.len()
        };

        let result = self.open_connections(&mut connections, target).await;
        self.connections.store(Arc::new(connections));
        result
    }

    async fn open_connections(&self, connections: &mut Vec<Arc<T>>, target: usize) -> Result<()> {
        while connections.len() < target && !self.is_closed() {
            connections.push(Arc::new(self.open_connection().await?));
        }

        Ok(())
    }

    /// Replaces broken connections and opens missing core ones.
    pub(crate) async fn reconnect_broken(&self) -> Result<()> {
        let _guard = self.resize_lock.lock().await;

        let mut connections = self.usable_connections();
        let core_size = self.core_size.load(Ordering::Relaxed);

        let result = self.open_connections(&mut connections, core_size).await;
        self.connections.store(Arc::new(connections));
        result
    }

    /// Adjusts pool size to a new node distance, closing superfluous connections.
    pub(crate) async fn ensure_size(&self, distance: NodeDistance) -> Result<()> {
        let size = self.config.size(distance);
        self.core_size.store(size.core, Ordering::Relaxed);
        self.max_size.store(size.max, Ordering::Relaxed);

        let _guard = self.resize_lock.lock().await;

        let mut connections = self.usable_connections();
        if connections.len() > size.max {
            debug!(broadcast_rpc_address = %self.broadcast_rpc_address, from = connections.len(), to = size.max, "Trimming connection pool.");

            connections.sort_unstable_by_key(|connection| connection.in_flight());
            for connection in connections.drain(size.max..) {
                connection.close();
            }
        }

        let result = self.open_connections(&mut connections, size.core).await;
        self.connections.store(Arc::new(connections));
        result
    }

    /// Closes all connections for good. Fills and reconnections still running open nothing
    /// afterwards.
    pub(crate) async fn shut_down(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_all().await;
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Passes a connection error to the reconnection loop, unless the pool is closed.
    fn report_error(&self, error: Error) {
        if !self.is_closed() {
            let _ = self.error_sender.try_send(error);
        }
    }

    /// Closes all connections. Requests in flight on them fail with a connection error.
    async fn close_all(&self) {
        let _guard = self.resize_lock.lock().await;

        let connections = self.connections.swap(Arc::new(vec![]));
        for connection in connections.iter() {
            connection.close();
        }
    }

    /// Closes all connections and hands the pool over to the reconnection loop, which reopens
    /// them once the node accepts connections again.
    pub(crate) async fn close_and_reconnect(&self, reason: Error) {
        self.close_all().await;

        if self.error_sender.try_send(reason).is_err() {
            debug!(broadcast_rpc_address = %self.broadcast_rpc_address, "Reconnection already pending.");
        }
    }

    /// Allows the pool to start reconnecting again after it gave up.
    pub(crate) fn reset_reconnection(&self) {
        let _ = self.reconnection_state.compare_exchange(
            ReconnectionState::Disabled,
            ReconnectionState::NotRunning,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    async fn heartbeat(&self, timeout: Duration) {
        let connections = self.usable_connections();
        let heartbeats = connections.iter().map(|connection| async move {
            let result = tokio::time::timeout(timeout, connection.write_request(&RequestBody::Options))
                .await
                .map_err(|_| Error::Timeout(format!("Heartbeat to {} timed out", connection.address())))
                .and_then(|result| result);

            if let Err(error) = result {
                warn!(%error, broadcast_rpc_address = %self.broadcast_rpc_address, "Heartbeat failed - closing connection.");

                connection.close();
                self.report_error(error);
            }
        });

        join_all(heartbeats).await;
    }

    pub(crate) fn state(&self) -> NodePoolState {
        let connections = self.connections.load();
        let open = connections.iter().filter(|connection| !connection.is_broken());

        NodePoolState {
            open_connections: open.clone().count(),
            in_flight: open.map(|connection| connection.in_flight()).sum(),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
