use arc_swap::ArcSwapOption;
use atomic::Atomic;
use bytemuck::NoUninit;
use derive_more::Display;
use futures::future::Shared;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::sleep;
use tracing::*;

use crate::cluster::topology::Node;
use crate::cluster::{ClusterMetadataManager, ConnectionManager};
use crate::error::{Error, Result};
use crate::events::{ServerEvent, ALL_EVENTS};
use crate::frame::events::{StatusChange, StatusChangeType, TopologyChange, TopologyChangeType};
use crate::frame::message_request::RequestBody;
use crate::frame::message_response::ResponseBody;
use crate::future::BoxFuture;
use crate::load_balancing::LoadBalancingStrategy;
use crate::retry::ReconnectionPolicy;
use crate::transport::CqlTransport;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of the control connection.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, NoUninit)]
#[repr(u8)]
pub enum ControlConnectionState {
    /// Not connected: never initialized, all nodes failed or the session was closed.
    Disconnected,
    /// Initial connection is being established.
    Connecting,
    Connected,
    /// Connection broke and a new one is being established.
    Reconnecting,
}

type ReconnectFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Dedicated connection listening for cluster events and keeping cluster metadata up to date.
/// There is exactly one per session.
pub(crate) struct ControlConnection<
    T: CqlTransport + 'static,
    CM: ConnectionManager<T> + 'static,
    LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
> {
    load_balancing: Arc<LB>,
    reconnection_policy: Arc<dyn ReconnectionPolicy + Send + Sync>,
    cluster_metadata_manager: Arc<ClusterMetadataManager<T, CM>>,
    event_sender: broadcast::Sender<ServerEvent>,
    transport: ArcSwapOption<T>,
    state: Atomic<ControlConnectionState>,
    closed: AtomicBool,
    pending_reconnect: Mutex<Option<ReconnectFuture>>,
    event_frame_sender: Sender<ServerEvent>,
    error_sender: Sender<Error>,
}

impl<
        T: CqlTransport + 'static,
        CM: ConnectionManager<T> + 'static,
        LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
    > ControlConnection<T, CM, LB>
{
    /// Creates a disconnected control connection along with tasks processing its events and
    /// errors. Call [`init`](Self::init) to connect.
    pub(crate) fn new(
        load_balancing: Arc<LB>,
        reconnection_policy: Arc<dyn ReconnectionPolicy + Send + Sync>,
        cluster_metadata_manager: Arc<ClusterMetadataManager<T, CM>>,
        event_sender: broadcast::Sender<ServerEvent>,
    ) -> Arc<Self> {
        let (event_frame_sender, event_frame_receiver) = channel(EVENT_CHANNEL_CAPACITY);
        let (error_sender, error_receiver) = channel(1);

        let control_connection = Arc::new(ControlConnection {
            load_balancing,
            reconnection_policy,
            cluster_metadata_manager,
            event_sender,
            transport: ArcSwapOption::empty(),
            state: Atomic::new(ControlConnectionState::Disconnected),
            closed: AtomicBool::new(false),
            pending_reconnect: Mutex::new(None),
            event_frame_sender,
            error_sender,
        });

        Self::process_events(event_frame_receiver, Arc::downgrade(&control_connection));
        Self::monitor_errors(error_receiver, Arc::downgrade(&control_connection));

        control_connection
    }

    #[inline]
    pub(crate) fn state(&self) -> ControlConnectionState {
        self.state.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn transport(&self) -> Option<Arc<T>> {
        self.transport.load_full()
    }

    #[inline]
    pub(crate) fn cluster_metadata_manager(&self) -> &Arc<ClusterMetadataManager<T, CM>> {
        &self.cluster_metadata_manager
    }

    /// Connects to the first reachable node, negotiating protocol version, subscribes to
    /// events and populates cluster metadata.
    pub(crate) async fn init(&self) -> Result<()> {
        self.state
            .store(ControlConnectionState::Connecting, Ordering::Relaxed);

        let result = self.connect().await;
        self.store_outcome(&result);
        result
    }

    /// Reconnects to the cluster. Concurrent callers share a single attempt and observe the
    /// same outcome.
    pub(crate) fn reconnect(self: &Arc<Self>) -> ReconnectFuture {
        let mut pending_reconnect = self.pending_reconnect();
        if let Some(reconnect) = pending_reconnect.as_ref() {
            return reconnect.clone();
        }

        let control_connection = self.clone();
        let reconnect = async move {
            control_connection
                .state
                .store(ControlConnectionState::Reconnecting, Ordering::Relaxed);

            let result = control_connection.connect().await;
            control_connection.store_outcome(&result);
            control_connection.pending_reconnect().take();

            result
        }
        .boxed()
        .shared();

        *pending_reconnect = Some(reconnect.clone());
        reconnect
    }

    /// Disconnects for good. Background reconnection stops.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.state
            .store(ControlConnectionState::Disconnected, Ordering::Relaxed);

        if let Some(transport) = self.transport.swap(None) {
            transport.close();
        }
    }

    /// Re-reads cluster topology through the current connection.
    pub(crate) async fn refresh_metadata(&self) -> Result<()> {
        let transport = self
            .transport()
            .ok_or_else(|| Error::General("Control connection is not established".into()))?;

        self.cluster_metadata_manager
            .refresh_metadata(transport.as_ref(), self.load_balancing.as_ref())
            .await
    }

    fn pending_reconnect(&self) -> MutexGuard<'_, Option<ReconnectFuture>> {
        self.pending_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn store_outcome(&self, result: &Result<()>) {
        let state = if result.is_ok() && !self.closed.load(Ordering::Relaxed) {
            ControlConnectionState::Connected
        } else {
            ControlConnectionState::Disconnected
        };

        self.state.store(state, Ordering::Relaxed);
    }

    async fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::SessionClosed);
        }

        let metadata = self.cluster_metadata_manager.metadata();
        let mut nodes: Vec<_> = self
            .load_balancing
            .query_plan(None, metadata.as_ref())
            .collect();

        if nodes.is_empty() {
            // all known nodes might be marked down, but one of them may be back already
            nodes = metadata.unignored_nodes();
        }

        let mut errors = HashMap::new();

        for node in nodes {
            let broadcast_rpc_address = node.broadcast_rpc_address();

            let transport = match self.connect_to_node(&node).await {
                Ok(transport) => transport,
                Err(error) => {
                    debug!(%broadcast_rpc_address, %error, "Cannot establish control connection.");
                    errors.insert(broadcast_rpc_address, error);
                    continue;
                }
            };

            if let Err(error) = self.register_and_refresh(&transport).await {
                error!(%broadcast_rpc_address, %error, "Error initializing control connection.");
                transport.close();
                errors.insert(broadcast_rpc_address, error);
                continue;
            }

            debug!(%broadcast_rpc_address, "Established new control connection.");

            if let Some(previous) = self.transport.swap(Some(Arc::new(transport))) {
                previous.close();
            }

            if self.closed.load(Ordering::Relaxed) {
                // closed while connecting
                self.close();
                return Err(Error::SessionClosed);
            }

            return Ok(());
        }

        if errors.is_empty() {
            warn!("No nodes found for control connection!");
        }

        Err(Error::NoHostAvailable { errors })
    }

    async fn connect_to_node(&self, node: &Node<T, CM>) -> Result<T> {
        let connection_pool_factory = self.cluster_metadata_manager.connection_pool_factory();
        let mut version = connection_pool_factory.version();

        loop {
            let result = node
                .new_connection(
                    Some(self.event_frame_sender.clone()),
                    Some(self.error_sender.clone()),
                    version,
                )
                .await;

            match result {
                Ok(transport) => {
                    if version != connection_pool_factory.version() {
                        info!(%version, "Negotiated protocol version.");
                        connection_pool_factory.set_version(version);
                    }

                    return Ok(transport);
                }
                Err(Error::UnsupportedProtocolVersion { addr, version: rejected }) => {
                    match rejected.downgrade() {
                        Some(lower) => {
                            debug!(%addr, %rejected, %lower, "Downgrading protocol version.");
                            version = lower;
                        }
                        None => return Err(Error::InvalidProtocol(addr)),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn register_and_refresh(&self, transport: &T) -> Result<()> {
        let response = transport
            .write_request(&RequestBody::new_register(ALL_EVENTS.to_vec()))
            .await?;

        if !matches!(response, ResponseBody::Ready) {
            return Err(Error::UnexpectedResponse(response.opcode()));
        }

        self.cluster_metadata_manager
            .refresh_metadata(transport, self.load_balancing.as_ref())
            .await
    }

    fn spawn_reconnection(self: &Arc<Self>) {
        let control_connection = Arc::downgrade(self);
        let mut schedule = self.reconnection_policy.new_node_schedule();

        tokio::spawn(async move {
            loop {
                let Some(control_connection) = control_connection.upgrade() else {
                    return;
                };

                if control_connection.closed.load(Ordering::Relaxed) {
                    return;
                }

                match control_connection.reconnect().await {
                    Ok(_) => {
                        info!("Control connection re-established.");
                        return;
                    }
                    Err(error) => {
                        error!(%error, "Error reconnecting control connection.");
                    }
                }

                drop(control_connection);

                // as long as the session is alive, try establishing control connection
                let delay = schedule.next_delay().unwrap_or(DEFAULT_RECONNECT_DELAY);
                sleep(delay).await;
            }
        });
    }

    async fn handle_event(&self, event: &ServerEvent) {
        let metadata = self.cluster_metadata_manager.metadata();

        match event {
            ServerEvent::TopologyChange(TopologyChange {
                change_type: TopologyChangeType::NewNode,
                addr,
            }) => {
                debug!(%addr, "New node event.");
                self.refresh_metadata_logged().await;
            }
            ServerEvent::TopologyChange(TopologyChange {
                change_type: TopologyChangeType::RemovedNode,
                addr,
            }) => {
                debug!(%addr, "Removed node event.");
                self.cluster_metadata_manager.remove_node(*addr).await;
            }
            ServerEvent::StatusChange(StatusChange {
                change_type: StatusChangeType::Up,
                addr,
            }) => match metadata.find_node_by_rpc_address(*addr) {
                Some(node) => {
                    debug!(%addr, "Node up event.");
                    node.on_host_up();
                }
                None => self.refresh_metadata_logged().await,
            },
            ServerEvent::StatusChange(StatusChange {
                change_type: StatusChangeType::Down,
                addr,
            }) => {
                if let Some(node) = metadata.find_node_by_rpc_address(*addr) {
                    debug!(%addr, "Node down event.");
                    node.on_host_down().await;
                }
            }
            ServerEvent::SchemaChange(_) => {}
        }
    }

    async fn refresh_metadata_logged(&self) {
        if let Err(error) = self.refresh_metadata().await {
            error!(%error, "Error refreshing cluster metadata.");
        }
    }

    fn process_events(
        mut event_frame_receiver: Receiver<ServerEvent>,
        control_connection: Weak<Self>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = event_frame_receiver.recv().await {
                let Some(control_connection) = control_connection.upgrade() else {
                    break;
                };

                control_connection.handle_event(&event).await;

                // no receivers is fine
                let _ = control_connection.event_sender.send(event);
            }
        });
    }

    fn monitor_errors(mut error_receiver: Receiver<Error>, control_connection: Weak<Self>) {
        tokio::spawn(async move {
            while let Some(error) = error_receiver.recv().await {
                let Some(control_connection) = control_connection.upgrade() else {
                    break;
                };

                if control_connection.closed.load(Ordering::Relaxed) {
                    break;
                }

                // errors of replaced connections are stale
                let current_broken = control_connection
                    .transport()
                    .map(|transport| transport.is_broken())
                    .unwrap_or(true);

                if !current_broken {
                    continue;
                }

                if control_connection
                    .state
                    .compare_exchange(
                        ControlConnectionState::Connected,
                        ControlConnectionState::Reconnecting,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    error!(%error, "Error in control connection! Trying to reconnect.");
                    control_connection.spawn_reconnection();
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use atomic::Atomic;
    use futures::future::join_all;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::watch;
    use uuid::Uuid;

    use super::*;
    use crate::cluster::connection_pool::{ConnectionPoolConfig, ConnectionPoolFactory};
    use crate::frame::message_error::{AdditionalErrorInfo, ErrorBody};
    use crate::frame::message_result::BodyResResultRows;
    use crate::frame::Version;
    use crate::load_balancing::tests::node_addr;
    use crate::load_balancing::{
        InitializingWrapperLoadBalancingStrategy, RoundRobinLoadBalancingStrategy,
    };
    use crate::retry::NeverReconnectionPolicy;
    use crate::transport::MockCqlTransport;
    use crate::types::Value;

    /// Answers control connection requests as a single node cluster with given host id would.
    pub(crate) fn control_transport(addr: SocketAddr, host_id: Uuid) -> MockCqlTransport {
        let mut transport = MockCqlTransport::new();
        transport.expect_address().return_const(addr);
        transport.expect_is_broken().return_const(false);
        transport.expect_close().return_const(());
        transport.expect_write_request().returning(move |request| {
            let response = match request {
                RequestBody::Register(_) => Ok(ResponseBody::Ready),
                RequestBody::Query(query) if query.query.contains("system.local") => {
                    Ok(ResponseBody::rows(BodyResResultRows::new(
                        vec!["host_id".into(), "data_center".into(), "rack".into()],
                        vec![vec![Value::Uuid(host_id), "dc1".into(), "rack1".into()]],
                    )))
                }
                RequestBody::Query(query) if query.query.contains("peers_v2") => {
                    Err(Error::Server {
                        body: ErrorBody::new("unconfigured table", AdditionalErrorInfo::Invalid),
                        addr,
                    })
                }
                _ => Ok(ResponseBody::rows(BodyResResultRows::new(
                    vec!["rpc_address".into(), "host_id".into()],
                    vec![],
                ))),
            };

            async move { response }.boxed()
        });

        transport
    }

    struct TestConnectionManager {
        attempts: AtomicUsize,
        max_version: Version,
        host_id: Uuid,
    }

    impl TestConnectionManager {
        fn new(max_version: Version) -> Self {
            TestConnectionManager {
                attempts: AtomicUsize::new(0),
                max_version,
                host_id: Uuid::new_v4(),
            }
        }
    }

    impl ConnectionManager<MockCqlTransport> for TestConnectionManager {
        fn connection(
            &self,
            _event_handler: Option<Sender<ServerEvent>>,
            _error_handler: Option<Sender<Error>>,
            addr: SocketAddr,
            version: Version,
        ) -> BoxFuture<'_, Result<MockCqlTransport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            async move {
                sleep(Duration::from_millis(20)).await;

                if addr != node_addr(1) {
                    return Err(Error::ConnectionClosed(addr));
                }

                if version > self.max_version {
                    return Err(Error::UnsupportedProtocolVersion { addr, version });
                }

                Ok(control_transport(addr, self.host_id))
            }
            .boxed()
        }
    }

    type TestLoadBalancing = InitializingWrapperLoadBalancingStrategy<
        MockCqlTransport,
        TestConnectionManager,
        RoundRobinLoadBalancingStrategy<MockCqlTransport, TestConnectionManager>,
    >;

    fn control_connection(
        connection_manager: Arc<TestConnectionManager>,
        contact_points: &[SocketAddr],
    ) -> Arc<ControlConnection<MockCqlTransport, TestConnectionManager, TestLoadBalancing>> {
        let (_, keyspace_receiver) = watch::channel(None);
        let factory = Arc::new(ConnectionPoolFactory::new(
            ConnectionPoolConfig::default(),
            Arc::new(Atomic::new(Version::V5)),
            connection_manager,
            keyspace_receiver,
            Arc::new(NeverReconnectionPolicy),
        ));

        let contact_points = contact_points
            .iter()
            .map(|addr| Arc::new(Node::new_contact_point(factory.clone(), *addr)))
            .collect();

        let (event_sender, _) = broadcast::channel(8);

        ControlConnection::new(
            Arc::new(InitializingWrapperLoadBalancingStrategy::new(
                RoundRobinLoadBalancingStrategy::new(),
                contact_points,
            )),
            Arc::new(NeverReconnectionPolicy),
            Arc::new(ClusterMetadataManager::new(factory)),
            event_sender,
        )
    }

    #[tokio::test]
    async fn should_connect_and_populate_metadata() {
        let connection_manager = Arc::new(TestConnectionManager::new(Version::V5));
        let control_connection = control_connection(connection_manager.clone(), &[node_addr(1)]);

        assert_eq!(control_connection.state(), ControlConnectionState::Disconnected);
        control_connection.init().await.unwrap();

        assert_eq!(control_connection.state(), ControlConnectionState::Connected);
        assert_eq!(
            control_connection
                .cluster_metadata_manager()
                .metadata()
                .nodes()
                .len(),
            1
        );
        assert_eq!(connection_manager.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_downgrade_protocol_version() {
        let connection_manager = Arc::new(TestConnectionManager::new(Version::V3));
        let control_connection = control_connection(connection_manager.clone(), &[node_addr(1)]);

        control_connection.init().await.unwrap();

        assert_eq!(
            control_connection
                .cluster_metadata_manager()
                .connection_pool_factory()
                .version(),
            Version::V3
        );
        assert_eq!(connection_manager.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_fail_with_all_host_errors() {
        let connection_manager = Arc::new(TestConnectionManager::new(Version::V5));
        let control_connection =
            control_connection(connection_manager, &[node_addr(2), node_addr(3)]);

        match control_connection.init().await {
            Err(Error::NoHostAvailable { errors }) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(
                    errors.get(&node_addr(2)),
                    Some(Error::ConnectionClosed(_))
                ));
            }
            result => panic!("Unexpected result: {result:?}"),
        }

        assert_eq!(control_connection.state(), ControlConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn should_collapse_concurrent_reconnects() {
        let connection_manager = Arc::new(TestConnectionManager::new(Version::V5));
        let control_connection = control_connection(connection_manager.clone(), &[node_addr(1)]);

        let results = join_all((0..10).map(|_| control_connection.reconnect())).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(connection_manager.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(control_connection.state(), ControlConnectionState::Connected);
    }

    #[tokio::test]
    async fn should_share_failed_reconnect() {
        let connection_manager = Arc::new(TestConnectionManager::new(Version::V5));
        let control_connection =
            control_connection(connection_manager.clone(), &[node_addr(2), node_addr(3)]);

        let reconnects: Vec<_> = (0..10)
            .map(|_| {
                let control_connection = control_connection.clone();
                tokio::spawn(async move { control_connection.reconnect().await })
            })
            .collect();

        let mut messages = Vec::new();
        for reconnect in reconnects {
            match reconnect.await.unwrap() {
                Err(error @ Error::NoHostAvailable { .. }) => messages.push(error.to_string()),
                result => panic!("Unexpected result: {result:?}"),
            }
        }

        messages.dedup();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains(&node_addr(2).to_string()));
        assert!(messages[0].contains(&node_addr(3).to_string()));

        // one attempt per host, shared by all callers
        assert_eq!(connection_manager.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(control_connection.state(), ControlConnectionState::Disconnected);

        // a failed attempt is not reused
        assert!(control_connection.reconnect().await.is_err());
        assert_eq!(connection_manager.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn should_not_reconnect_after_close() {
        let connection_manager = Arc::new(TestConnectionManager::new(Version::V5));
        let control_connection = control_connection(connection_manager.clone(), &[node_addr(1)]);

        control_connection.init().await.unwrap();
        control_connection.close();

        assert!(control_connection.transport().is_none());
        assert!(matches!(
            control_connection.reconnect().await,
            Err(Error::SessionClosed)
        ));
        assert_eq!(connection_manager.attempts.load(Ordering::SeqCst), 1);
    }
}
