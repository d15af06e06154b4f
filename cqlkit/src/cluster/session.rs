use atomic::Atomic;
use derivative::Derivative;
use futures::FutureExt;
use fxhash::FxHashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::*;
use uuid::Uuid;

use crate::cluster::connection_pool::ConnectionPoolFactory;
use crate::cluster::control_connection::ControlConnection;
use crate::cluster::keyspace_holder::use_keyspace_statement;
use crate::cluster::schema_agreement::{
    check_schema_agreement, wait_for_schema_agreement, DEFAULT_MAX_SCHEMA_AGREEMENT_WAIT,
    DEFAULT_SCHEMA_AGREEMENT_INTERVAL,
};
use crate::cluster::send_envelope::{
    send_statement, send_to_first_available, CoordinatedResponse, ExecutionPolicies,
};
use crate::cluster::topology::{Node, NodeDistance, NodeState};
use crate::cluster::{
    ClusterMetadata, ClusterMetadataManager, ConnectionManager, ConnectionPoolConfig,
    ControlConnectionState, GenericClusterConfig, KeyspaceHolder, NodeTcpConfig,
    TcpConnectionManager,
};
use crate::error::{Error, Result};
use crate::events::{EventStream, ServerEvent};
use crate::frame::message_request::RequestBody;
use crate::frame::message_response::ResponseBody;
use crate::frame::Version;
use crate::future::BoxFuture;
use crate::load_balancing::{
    InitializingWrapperLoadBalancingStrategy, LoadBalancingStrategy, Request,
};
use crate::query::{PreparedQuery, QueryValues};
use crate::retry::{
    DefaultRetryPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy, RetryPolicy,
};
use crate::speculative_execution::SpeculativeExecutionPolicy;
use crate::statement::{Statement, StatementParams, StatementParamsBuilder};
use crate::transport::{CqlTransport, TransportTcp};
use crate::types::Row;

/// Result of a successfully executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub body: ResponseBody,
    /// Node which coordinated the request.
    pub coordinator: SocketAddr,
    /// For responses to schema altering statements: whether all nodes agreed on the schema
    /// version before the wait for agreement timed out. Always `true` otherwise.
    pub is_schema_in_agreement: bool,
}

impl QueryResult {
    /// Returns result rows, if the response contains any.
    #[inline]
    pub fn into_rows(self) -> Option<Vec<Row>> {
        self.body.into_rows()
    }
}

/// Point-in-time state of a single node, as seen by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostState {
    pub broadcast_rpc_address: SocketAddr,
    pub host_id: Option<Uuid>,
    pub datacenter: String,
    pub state: NodeState,
    pub distance: NodeDistance,
    pub open_connections: usize,
    pub in_flight: usize,
    /// Consecutive failed connection attempts.
    pub failures: usize,
}

type SessionLoadBalancing<T, CM, LB> = InitializingWrapperLoadBalancingStrategy<T, CM, LB>;

/// Counts running requests and cancels them once the session is closed.
struct RequestTracker {
    closed: AtomicBool,
    in_flight: watch::Sender<usize>,
    cancelled: watch::Sender<bool>,
}

struct TrackedRequest<'a> {
    in_flight: &'a watch::Sender<usize>,
}

impl Drop for TrackedRequest<'_> {
    fn drop(&mut self) {
        self.in_flight.send_modify(|in_flight| *in_flight -= 1);
    }
}

async fn wait_until<V>(receiver: &mut watch::Receiver<V>, condition: impl Fn(&V) -> bool) {
    loop {
        let reached = condition(&receiver.borrow_and_update());
        if reached {
            return;
        }

        if receiver.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

impl RequestTracker {
    fn new() -> Self {
        RequestTracker {
            closed: AtomicBool::new(false),
            in_flight: watch::Sender::new(0),
            cancelled: watch::Sender::new(false),
        }
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    async fn track<R>(&self, request: impl Future<Output = Result<R>>) -> Result<R> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        self.in_flight.send_modify(|in_flight| *in_flight += 1);
        let _tracked = TrackedRequest {
            in_flight: &self.in_flight,
        };

        let mut cancelled = self.cancelled.subscribe();

        tokio::select! {
            result = request => result,
            _ = wait_until(&mut cancelled, |cancelled| *cancelled) => Err(Error::SessionClosed),
        }
    }

    /// Stops accepting new requests, waits up to `grace_period` for running ones and cancels
    /// the rest.
    async fn close(&self, grace_period: Duration) {
        self.closed.store(true, Ordering::Relaxed);

        let mut in_flight = self.in_flight.subscribe();
        if timeout(
            grace_period,
            wait_until(&mut in_flight, |in_flight| *in_flight == 0),
        )
        .await
        .is_err()
        {
            warn!(in_flight = *self.in_flight.borrow(), "Cancelling requests still running.");
        }

        self.cancelled.send_replace(true);
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct SessionContext<
    T: CqlTransport + 'static,
    CM: ConnectionManager<T> + 'static,
    LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
> {
    #[derivative(Debug = "ignore")]
    load_balancing: Arc<SessionLoadBalancing<T, CM, LB>>,
    #[derivative(Debug = "ignore")]
    control_connection: Arc<ControlConnection<T, CM, SessionLoadBalancing<T, CM, LB>>>,
    #[derivative(Debug = "ignore")]
    cluster_metadata_manager: Arc<ClusterMetadataManager<T, CM>>,
    keyspace_holder: Arc<KeyspaceHolder>,
    keyspace_sender: watch::Sender<Option<String>>,
    #[derivative(Debug = "ignore")]
    retry_policy: Arc<dyn RetryPolicy + Send + Sync>,
    #[derivative(Debug = "ignore")]
    speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy + Send + Sync>>,
    request_timeout: Option<Duration>,
    schema_agreement_interval: Duration,
    max_schema_agreement_wait: Duration,
    #[derivative(Debug = "ignore")]
    event_sender: broadcast::Sender<ServerEvent>,
    prepared_cache: Mutex<FxHashMap<String, Arc<PreparedQuery>>>,
    #[derivative(Debug = "ignore")]
    request_tracker: RequestTracker,
}

impl<
        T: CqlTransport + 'static,
        CM: ConnectionManager<T> + 'static,
        LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
    > SessionContext<T, CM, LB>
{
    fn prepared_cache(&self) -> MutexGuard<'_, FxHashMap<String, Arc<PreparedQuery>>> {
        self.prepared_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn execution_policies<'a>(&'a self, params: &'a StatementParams) -> ExecutionPolicies<'a> {
        ExecutionPolicies {
            retry_policy: params
                .retry_policy
                .as_deref()
                .unwrap_or(self.retry_policy.as_ref()),
            speculative_execution_policy: params
                .speculative_execution_policy
                .as_deref()
                .or(self.speculative_execution_policy.as_deref()),
            request_timeout: params.request_timeout.or(self.request_timeout),
        }
    }

    async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        self.request_tracker
            .track(async {
                let query_plan = self.load_balancing.query_plan(
                    Some(Request::new(
                        statement.keyspace(),
                        Some(statement.consistency()),
                    )),
                    self.cluster_metadata_manager.metadata().as_ref(),
                );

                let response = send_statement(
                    query_plan,
                    statement,
                    self.execution_policies(statement.params()),
                )
                .await?;

                Ok(self.into_query_result(response).await)
            })
            .await
    }

    async fn into_query_result(&self, response: CoordinatedResponse) -> QueryResult {
        let is_schema_in_agreement = if response.body.as_schema_change().is_some() {
            debug!(coordinator = %response.coordinator, "Schema changed, waiting for agreement.");

            wait_for_schema_agreement(
                || self.control_connection.transport(),
                self.schema_agreement_interval,
                self.max_schema_agreement_wait,
            )
            .await
        } else {
            true
        };

        QueryResult {
            body: response.body,
            coordinator: response.coordinator,
            is_schema_in_agreement,
        }
    }

    async fn prepare(&self, query: String) -> Result<Arc<PreparedQuery>> {
        let cached = self.prepared_cache().get(&query).cloned();
        if let Some(prepared) = cached {
            return Ok(prepared);
        }

        let keyspace = self
            .keyspace_holder
            .current_keyspace()
            .map(|keyspace| keyspace.to_string());

        let response = self
            .request_tracker
            .track(async {
                let query_plan = self.load_balancing.query_plan(
                    Some(Request::new(keyspace.as_deref(), None)),
                    self.cluster_metadata_manager.metadata().as_ref(),
                );

                send_to_first_available(
                    query_plan,
                    &RequestBody::new_prepare(query.clone(), keyspace.clone()),
                    self.request_timeout,
                )
                .await
            })
            .await?;

        let opcode = response.body.opcode();
        let id = response
            .body
            .into_prepared()
            .ok_or(Error::UnexpectedResponse(opcode))?
            .id;

        debug!(%query, coordinator = %response.coordinator, "Prepared statement.");

        let prepared = Arc::new(PreparedQuery {
            id,
            query: query.clone(),
            keyspace,
        });

        Ok(self
            .prepared_cache()
            .entry(query)
            .or_insert(prepared)
            .clone())
    }
}

/// CQL session: executes statements on the cluster, routing them through the configured load
/// balancing strategy. Cloning a session is cheap, clones share connections.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct Session<
    T: CqlTransport + 'static,
    CM: ConnectionManager<T> + 'static,
    LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
> {
    context: Arc<SessionContext<T, CM, LB>>,
}

impl<
        T: CqlTransport + 'static,
        CM: ConnectionManager<T> + 'static,
        LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
    > Session<T, CM, LB>
{
    /// Executes a query with default parameters.
    pub async fn query<Q: ToString>(&self, query: Q) -> Result<QueryResult> {
        self.query_with_params(query, StatementParams::default())
            .await
    }

    /// Executes a query with given values and default parameters.
    pub async fn query_with_values<Q: ToString, V: Into<QueryValues>>(
        &self,
        query: Q,
        values: V,
    ) -> Result<QueryResult> {
        self.query_with_params(
            query,
            StatementParamsBuilder::new()
                .with_values(values.into())
                .build(),
        )
        .await
    }

    /// Executes a query with given parameters.
    pub async fn query_with_params<Q: ToString>(
        &self,
        query: Q,
        params: StatementParams,
    ) -> Result<QueryResult> {
        self.execute(&Statement::query(query.to_string(), params))
            .await
    }

    /// Prepares a query on the first node able to answer. Prepared statements are cached by
    /// their text, so preparing the same query again is free.
    pub async fn prepare<Q: ToString>(&self, query: Q) -> Result<Arc<PreparedQuery>> {
        self.context.prepare(query.to_string()).await
    }

    /// Executes a prepared statement with default parameters.
    pub async fn exec(&self, prepared: &Arc<PreparedQuery>) -> Result<QueryResult> {
        self.exec_with_params(prepared, StatementParams::default())
            .await
    }

    /// Executes a prepared statement with given parameters.
    pub async fn exec_with_params(
        &self,
        prepared: &Arc<PreparedQuery>,
        params: StatementParams,
    ) -> Result<QueryResult> {
        self.execute(&Statement::prepared(prepared.clone(), params))
            .await
    }

    /// Executes a statement, waiting for the result.
    pub async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        self.context.execute(statement).await
    }

    /// Starts executing a statement in a background task and returns a handle to its result.
    /// The statement runs to completion even if the returned future is dropped.
    pub fn execute_detached(&self, statement: Statement) -> BoxFuture<'static, Result<QueryResult>> {
        let context = self.context.clone();
        let handle = tokio::spawn(async move { context.execute(&statement).await });

        async move {
            handle
                .await
                .map_err(|error| Error::General(format!("Detached execution failed: {error}")))?
        }
        .boxed()
    }

    /// Switches all connections to given keyspace.
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<()> {
        self.query(use_keyspace_statement(keyspace)).await?;

        self.context
            .keyspace_holder
            .update_current_keyspace(keyspace.to_string());
        self.context
            .keyspace_sender
            .send_replace(Some(keyspace.to_string()));

        Ok(())
    }

    /// Keyspace set with [`use_keyspace`](Self::use_keyspace) or the session builder.
    pub fn current_keyspace(&self) -> Option<Arc<String>> {
        self.context.keyspace_holder.current_keyspace()
    }

    /// Checks once if all nodes agree on schema version.
    pub async fn check_schema_agreement(&self) -> Result<bool> {
        let transport = self
            .context
            .control_connection
            .transport()
            .ok_or_else(|| Error::General("Control connection is not established".into()))?;

        check_schema_agreement(transport.as_ref()).await
    }

    /// Waits until all nodes agree on schema version, up to the configured maximum wait.
    /// Returns `false` if agreement was not reached in time.
    pub async fn wait_for_schema_agreement(&self) -> bool {
        wait_for_schema_agreement(
            || self.context.control_connection.transport(),
            self.context.schema_agreement_interval,
            self.context.max_schema_agreement_wait,
        )
        .await
    }

    /// Returns current cluster metadata.
    #[inline]
    pub fn cluster_metadata(&self) -> Arc<ClusterMetadata<T, CM>> {
        self.context.cluster_metadata_manager.metadata()
    }

    /// Snapshot of all known nodes and their pools.
    pub fn state(&self) -> Vec<HostState> {
        let mut hosts: Vec<_> = self
            .cluster_metadata()
            .nodes()
            .values()
            .map(|node| host_state(node))
            .collect();

        hosts.sort_unstable_by_key(|host| host.broadcast_rpc_address);
        hosts
    }

    #[inline]
    pub fn control_connection_state(&self) -> ControlConnectionState {
        self.context.control_connection.state()
    }

    /// Protocol version negotiated with the cluster.
    #[inline]
    pub fn protocol_version(&self) -> Version {
        self.context
            .cluster_metadata_manager
            .connection_pool_factory()
            .version()
    }

    /// Subscribes to server events received by the control connection.
    pub fn listen(&self) -> EventStream {
        EventStream::new(self.context.event_sender.subscribe())
    }

    /// Closes the session. New requests fail with [`Error::SessionClosed`], running ones get
    /// up to `grace_period` to finish before being cancelled. Afterwards all connections are
    /// closed. Pass [`Duration::ZERO`] to cancel everything right away.
    pub async fn close(&self, grace_period: Duration) {
        debug!(?grace_period, "Closing session.");

        self.context.request_tracker.close(grace_period).await;
        self.context.control_connection.close();

        for node in self.cluster_metadata().nodes().values() {
            node.close_pool().await;
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.context.request_tracker.is_closed()
    }
}

fn host_state<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static>(
    node: &Node<T, CM>,
) -> HostState {
    let pool_state = node.pool_state();

    HostState {
        broadcast_rpc_address: node.broadcast_rpc_address(),
        host_id: node.host_id(),
        datacenter: node.datacenter().to_string(),
        state: node.state(),
        distance: node.distance(),
        open_connections: pool_state.open_connections,
        in_flight: pool_state.in_flight,
        failures: pool_state.failures,
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct SessionConfig {
    #[derivative(Debug = "ignore")]
    retry_policy: Arc<dyn RetryPolicy + Send + Sync>,
    #[derivative(Debug = "ignore")]
    reconnection_policy: Arc<dyn ReconnectionPolicy + Send + Sync>,
    #[derivative(Debug = "ignore")]
    speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy + Send + Sync>>,
    connection_pool_config: ConnectionPoolConfig,
    request_timeout: Option<Duration>,
    schema_agreement_interval: Duration,
    max_schema_agreement_wait: Duration,
    keyspace: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            retry_policy: Arc::new(DefaultRetryPolicy),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            speculative_execution_policy: None,
            connection_pool_config: Default::default(),
            request_timeout: None,
            schema_agreement_interval: DEFAULT_SCHEMA_AGREEMENT_INTERVAL,
            max_schema_agreement_wait: DEFAULT_MAX_SCHEMA_AGREEMENT_WAIT,
            keyspace: None,
        }
    }
}

/// Builder for sessions using any transport, connection manager and cluster configuration.
#[derive(Derivative)]
#[derivative(Debug(bound = "LB: std::fmt::Debug, C: std::fmt::Debug"))]
pub struct GenericSessionBuilder<
    T: CqlTransport + 'static,
    CM: ConnectionManager<T> + 'static,
    LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
    C: GenericClusterConfig<T, CM>,
> {
    load_balancing: LB,
    cluster_config: C,
    config: SessionConfig,
    #[derivative(Debug = "ignore")]
    _transport: PhantomData<(T, CM)>,
}

/// Builder for sessions using plain TCP connections.
pub type TcpSessionBuilder<LB> =
    GenericSessionBuilder<TransportTcp, TcpConnectionManager, LB, NodeTcpConfig>;

/// Session using plain TCP connections.
pub type TcpSession<LB> = Session<TransportTcp, TcpConnectionManager, LB>;

impl<
        T: CqlTransport + 'static,
        CM: ConnectionManager<T> + 'static,
        LB: LoadBalancingStrategy<T, CM> + Send + Sync + 'static,
        C: GenericClusterConfig<T, CM>,
    > GenericSessionBuilder<T, CM, LB, C>
{
    pub fn new(load_balancing: LB, cluster_config: C) -> Self {
        GenericSessionBuilder {
            load_balancing,
            cluster_config,
            config: Default::default(),
            _transport: Default::default(),
        }
    }

    /// Sets the default retry policy. Statements can override it.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy + Send + Sync>) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    /// Sets the policy driving reconnection of the control connection and connection pools.
    #[must_use]
    pub fn with_reconnection_policy(
        mut self,
        reconnection_policy: Arc<dyn ReconnectionPolicy + Send + Sync>,
    ) -> Self {
        self.config.reconnection_policy = reconnection_policy;
        self
    }

    /// Sets the default speculative execution policy. Only idempotent statements are executed
    /// speculatively.
    #[must_use]
    pub fn with_speculative_execution_policy(
        mut self,
        speculative_execution_policy: Arc<dyn SpeculativeExecutionPolicy + Send + Sync>,
    ) -> Self {
        self.config.speculative_execution_policy = Some(speculative_execution_policy);
        self
    }

    #[must_use]
    pub fn with_connection_pool_config(mut self, connection_pool_config: ConnectionPoolConfig) -> Self {
        self.config.connection_pool_config = connection_pool_config;
        self
    }

    /// Sets the default timeout of a single attempt of a request.
    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Option<Duration>) -> Self {
        self.config.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn with_schema_agreement_interval(mut self, schema_agreement_interval: Duration) -> Self {
        self.config.schema_agreement_interval = schema_agreement_interval;
        self
    }

    /// Sets how long to wait for schema agreement after a schema change.
    #[must_use]
    pub fn with_max_schema_agreement_wait(mut self, max_schema_agreement_wait: Duration) -> Self {
        self.config.max_schema_agreement_wait = max_schema_agreement_wait;
        self
    }

    /// Sets the keyspace every connection starts in.
    #[must_use]
    pub fn with_keyspace(mut self, keyspace: String) -> Self {
        self.config.keyspace = Some(keyspace);
        self
    }

    /// Connects to the cluster: establishes the control connection, negotiating the protocol
    /// version, and discovers nodes. Connection pools are filled in the background.
    pub async fn build(self) -> Result<Session<T, CM, LB>> {
        let config = self.config;

        let keyspace_holder = Arc::new(KeyspaceHolder::default());
        if let Some(keyspace) = &config.keyspace {
            keyspace_holder.update_current_keyspace(keyspace.clone());
        }

        let connection_manager = Arc::new(
            self.cluster_config
                .create_manager(keyspace_holder.clone())
                .await?,
        );

        let (keyspace_sender, keyspace_receiver) = watch::channel(config.keyspace.clone());

        let connection_pool_factory = Arc::new(ConnectionPoolFactory::new(
            config.connection_pool_config,
            Arc::new(Atomic::new(self.cluster_config.version())),
            connection_manager,
            keyspace_receiver,
            config.reconnection_policy.clone(),
        ));

        let contact_points = self
            .cluster_config
            .contact_points()
            .iter()
            .map(|addr| {
                Arc::new(Node::new_contact_point(
                    connection_pool_factory.clone(),
                    *addr,
                ))
            })
            .collect();

        let load_balancing = Arc::new(InitializingWrapperLoadBalancingStrategy::new(
            self.load_balancing,
            contact_points,
        ));

        let cluster_metadata_manager =
            Arc::new(ClusterMetadataManager::new(connection_pool_factory));

        let (event_sender, _) = broadcast::channel(self.cluster_config.event_channel_capacity());

        let control_connection = ControlConnection::new(
            load_balancing.clone(),
            config.reconnection_policy.clone(),
            cluster_metadata_manager.clone(),
            event_sender.clone(),
        );

        control_connection.init().await?;

        info!(
            version = %cluster_metadata_manager.connection_pool_factory().version(),
            nodes = cluster_metadata_manager.metadata().nodes().len(),
            "Session connected."
        );

        Ok(Session {
            context: Arc::new(SessionContext {
                load_balancing,
                control_connection,
                cluster_metadata_manager,
                keyspace_holder,
                keyspace_sender,
                retry_policy: config.retry_policy,
                speculative_execution_policy: config.speculative_execution_policy,
                request_timeout: config.request_timeout,
                schema_agreement_interval: config.schema_agreement_interval,
                max_schema_agreement_wait: config.max_schema_agreement_wait,
                event_sender,
                prepared_cache: Default::default(),
                request_tracker: RequestTracker::new(),
            }),
        })
    }
}
