//! In-process simulated cluster. Nodes answer system table queries the way a real cluster does,
//! keep inserted rows in memory and can be primed with canned responses, paused or stopped.
#![allow(dead_code)]

use futures::FutureExt;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use uuid::Uuid;

use cqlkit::cluster::session::{GenericSessionBuilder, Session};
use cqlkit::cluster::{ConnectionManager, GenericClusterConfig, KeyspaceHolder};
use cqlkit::error::{Error, Result};
use cqlkit::events::ServerEvent;
use cqlkit::frame::events::{SchemaChange, SchemaChangeOptions, SchemaChangeTarget, SchemaChangeType};
use cqlkit::frame::message_error::{AdditionalErrorInfo, ErrorBody, UnpreparedError};
use cqlkit::frame::message_request::RequestBody;
use cqlkit::frame::message_response::{BodyResSupported, ResponseBody};
use cqlkit::frame::message_result::{
    BodyResResultPrepared, BodyResResultRows, BodyResResultSetKeyspace, ResResultBody,
};
use cqlkit::frame::Version;
use cqlkit::future::BoxFuture;
use cqlkit::load_balancing::LoadBalancingStrategy;
use cqlkit::query::QueryValues;
use cqlkit::transport::CqlTransport;
use cqlkit::types::Value;

pub const DATACENTER: &str = "dc1";

pub type SimulatedSessionBuilder<LB> = GenericSessionBuilder<
    SimulatedTransport,
    SimulatedConnectionManager,
    LB,
    SimulatedClusterConfig,
>;

pub type SimulatedSession<LB> = Session<SimulatedTransport, SimulatedConnectionManager, LB>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canned response returned for queries containing a given fragment.
#[derive(Debug, Clone)]
pub enum PrimedResponse {
    Rows(BodyResResultRows),
    Error(AdditionalErrorInfo),
}

#[derive(Debug)]
struct Prime {
    fragment: String,
    response: PrimedResponse,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug)]
pub struct SimulatedNode {
    pub addr: SocketAddr,
    pub host_id: Uuid,
    max_version: Version,
    stopped: AtomicBool,
    paused: watch::Sender<bool>,
    schema_version: Mutex<Uuid>,
    primes: Mutex<Vec<Prime>>,
    log: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

impl SimulatedNode {
    /// Stops answering requests until resumed. Connections stay open.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Breaks all connections and refuses new ones.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn set_schema_version(&self, schema_version: Uuid) {
        *lock(&self.schema_version) = schema_version;
    }

    /// Answers queries containing `fragment` with `response`, `times` times or forever.
    pub fn prime(&self, fragment: &str, response: PrimedResponse, times: Option<usize>) {
        lock(&self.primes).push(Prime {
            fragment: fragment.to_string(),
            response,
            remaining: times,
        });
    }

    /// User queries received by this node, in order. System table queries are not recorded.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    pub fn count_queries(&self, fragment: &str) -> usize {
        lock(&self.log)
            .iter()
            .filter(|query| query.contains(fragment))
            .count()
    }

    /// Number of connections ever opened to this node.
    pub fn opened_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn schema_version(&self) -> Uuid {
        *lock(&self.schema_version)
    }

    async fn wait_while_paused(&self) {
        let mut paused = self.paused.subscribe();
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused || paused.changed().await.is_err() {
                return;
            }
        }
    }

    fn primed_response(&self, query: &str) -> Option<PrimedResponse> {
        let mut primes = lock(&self.primes);
        let prime = primes
            .iter_mut()
            .find(|prime| query.contains(&prime.fragment) && prime.remaining != Some(0))?;

        if let Some(remaining) = &mut prime.remaining {
            *remaining -= 1;
        }

        Some(prime.response.clone())
    }
}

#[derive(Debug)]
struct ClusterState {
    nodes: Vec<Arc<SimulatedNode>>,
    tables: Mutex<HashMap<String, Table>>,
    prepared: Mutex<HashMap<Vec<u8>, String>>,
    listeners: Mutex<Vec<Sender<ServerEvent>>>,
}

impl ClusterState {
    fn find_node(&self, addr: SocketAddr) -> Option<&Arc<SimulatedNode>> {
        self.nodes.iter().find(|node| node.addr == addr)
    }

    fn respond(
        &self,
        node: &SimulatedNode,
        request: &RequestBody,
        event_handler: Option<&Sender<ServerEvent>>,
    ) -> Result<ResponseBody> {
        match request {
            RequestBody::Options => Ok(ResponseBody::Supported(BodyResSupported::default())),
            RequestBody::Startup(_) => Ok(ResponseBody::Ready),
            RequestBody::Register(_) => {
                if let Some(event_handler) = event_handler {
                    lock(&self.listeners).push(event_handler.clone());
                }

                Ok(ResponseBody::Ready)
            }
            RequestBody::Query(query) => {
                self.query(node, &query.query, query.query_params.values.as_ref())
            }
            RequestBody::Prepare(prepare) => {
                let id = prepare.query.as_bytes().to_vec();
                lock(&self.prepared).insert(id.clone(), prepare.query.clone());

                Ok(ResponseBody::Result(ResResultBody::Prepared(
                    BodyResResultPrepared { id },
                )))
            }
            RequestBody::Execute(execute) => {
                let query = lock(&self.prepared).get(&execute.id).cloned();
                match query {
                    Some(query) => {
                        self.query(node, &query, execute.query_params.values.as_ref())
                    }
                    None => Err(server_error(
                        node,
                        AdditionalErrorInfo::Unprepared(UnpreparedError {
                            id: execute.id.clone(),
                        }),
                    )),
                }
            }
            _ => Err(server_error(node, AdditionalErrorInfo::Protocol)),
        }
    }

    /// Logs user queries as soon as they reach the node, even if it's paused.
    fn record(&self, node: &SimulatedNode, request: &RequestBody) {
        let query = match request {
            RequestBody::Query(query) => Some(query.query.clone()),
            RequestBody::Execute(execute) => lock(&self.prepared).get(&execute.id).cloned(),
            _ => None,
        };

        if let Some(query) = query.filter(|query| !query.contains("system.")) {
            lock(&node.log).push(query);
        }
    }

    fn query(
        &self,
        node: &SimulatedNode,
        query: &str,
        values: Option<&QueryValues>,
    ) -> Result<ResponseBody> {
        if query.contains("system.") {
            return self.query_system_table(node, query);
        }

        if let Some(response) = node.primed_response(query) {
            return match response {
                PrimedResponse::Rows(rows) => Ok(ResponseBody::rows(rows)),
                PrimedResponse::Error(info) => Err(server_error(node, info)),
            };
        }

        let first_word = query
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();

        match first_word.as_str() {
            "USE" => Ok(ResponseBody::Result(ResResultBody::SetKeyspace(
                BodyResResultSetKeyspace {
                    body: query[3..].trim().trim_matches('"').to_string(),
                },
            ))),
            "CREATE" | "ALTER" | "DROP" => Ok(ResponseBody::Result(ResResultBody::SchemaChange(
                schema_change(&first_word, query),
            ))),
            "INSERT" => {
                self.insert(query, values);
                Ok(ResponseBody::void())
            }
            "SELECT" => self.select(node, query),
            _ => Ok(ResponseBody::void()),
        }
    }

    fn query_system_table(&self, node: &SimulatedNode, query: &str) -> Result<ResponseBody> {
        if query.contains("system.local") {
            return Ok(ResponseBody::rows(BodyResResultRows::new(
                columns(&["key", "host_id", "data_center", "rack", "schema_version"]),
                vec![vec![
                    "local".into(),
                    Value::Uuid(node.host_id),
                    DATACENTER.into(),
                    "rack1".into(),
                    Value::Uuid(node.schema_version()),
                ]],
            )));
        }

        if query.contains("system.peers_v2") {
            return Err(server_error(node, AdditionalErrorInfo::Invalid));
        }

        if query.contains("system.peers") {
            let rows = self
                .nodes
                .iter()
                .filter(|peer| peer.addr != node.addr)
                .map(|peer| {
                    vec![
                        Value::Inet(peer.addr.ip()),
                        Value::Inet(peer.addr.ip()),
                        Value::Uuid(peer.host_id),
                        DATACENTER.into(),
                        "rack1".into(),
                        Value::Uuid(peer.schema_version()),
                    ]
                })
                .collect();

            return Ok(ResponseBody::rows(BodyResResultRows::new(
                columns(&[
                    "peer",
                    "rpc_address",
                    "host_id",
                    "data_center",
                    "rack",
                    "schema_version",
                ]),
                rows,
            )));
        }

        Err(server_error(node, AdditionalErrorInfo::Invalid))
    }

    /// Handles `INSERT INTO <table> (<columns>) VALUES (...)` with bound values.
    fn insert(&self, query: &str, values: Option<&QueryValues>) {
        let Some(table_name) = query.split_whitespace().nth(2) else {
            return;
        };
        let table_name = table_name.split('(').next().unwrap_or_default().to_string();

        let column_list = query
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(column_list, _)| column_list)
            .unwrap_or_default();
        let column_names: Vec<String> = column_list
            .split(',')
            .map(|column| column.trim().to_string())
            .collect();

        let row = column_names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                values
                    .and_then(|values| values.get(index, name))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();

        let mut tables = lock(&self.tables);
        let table = tables.entry(table_name).or_default();
        table.columns = column_names;
        table.rows.push(row);
    }

    /// Handles `SELECT * FROM <table>`.
    fn select(&self, node: &SimulatedNode, query: &str) -> Result<ResponseBody> {
        let table_name = query
            .split_whitespace()
            .skip_while(|word| !word.eq_ignore_ascii_case("FROM"))
            .nth(1)
            .map(|name| name.trim_end_matches(';'))
            .unwrap_or_default();

        match lock(&self.tables).get(table_name) {
            Some(table) => Ok(ResponseBody::rows(BodyResResultRows::new(
                table.columns.clone(),
                table.rows.clone(),
            ))),
            None => Err(server_error(node, AdditionalErrorInfo::Invalid)),
        }
    }
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn server_error(node: &SimulatedNode, info: AdditionalErrorInfo) -> Error {
    Error::Server {
        body: ErrorBody::new("simulated error", info),
        addr: node.addr,
    }
}

fn schema_change(first_word: &str, query: &str) -> SchemaChange {
    let change_type = match first_word {
        "CREATE" => SchemaChangeType::Created,
        "ALTER" => SchemaChangeType::Updated,
        _ => SchemaChangeType::Dropped,
    };

    let name = query
        .split_whitespace()
        .skip(1)
        .find(|word| {
            !["TABLE", "KEYSPACE", "IF", "NOT", "EXISTS"]
                .contains(&word.to_uppercase().as_str())
        })
        .unwrap_or_default()
        .split('(')
        .next()
        .unwrap_or_default()
        .to_string();

    match name.split_once('.') {
        Some((keyspace, table)) => SchemaChange {
            change_type,
            target: SchemaChangeTarget::Table,
            options: SchemaChangeOptions::TableType(keyspace.to_string(), table.to_string()),
        },
        None => SchemaChange {
            change_type,
            target: SchemaChangeTarget::Keyspace,
            options: SchemaChangeOptions::Keyspace(name),
        },
    }
}

/// Cluster of simulated nodes at `127.0.0.<n>:9042`, numbered from 1.
#[derive(Debug, Clone)]
pub struct SimulatedCluster {
    state: Arc<ClusterState>,
}

impl SimulatedCluster {
    pub fn new(node_count: u8) -> Self {
        Self::with_max_version(node_count, Version::V4)
    }

    pub fn with_max_version(node_count: u8, max_version: Version) -> Self {
        let schema_version = Uuid::new_v4();
        let nodes = (1..=node_count)
            .map(|index| {
                Arc::new(SimulatedNode {
                    addr: node_addr(index),
                    host_id: Uuid::new_v4(),
                    max_version,
                    stopped: AtomicBool::new(false),
                    paused: watch::Sender::new(false),
                    schema_version: Mutex::new(schema_version),
                    primes: Default::default(),
                    log: Default::default(),
                    connections: AtomicUsize::new(0),
                })
            })
            .collect();

        SimulatedCluster {
            state: Arc::new(ClusterState {
                nodes,
                tables: Default::default(),
                prepared: Default::default(),
                listeners: Default::default(),
            }),
        }
    }

    /// Returns node with given number, starting from 1.
    pub fn node(&self, index: u8) -> &Arc<SimulatedNode> {
        &self.state.nodes[usize::from(index) - 1]
    }

    pub fn nodes(&self) -> &[Arc<SimulatedNode>] {
        &self.state.nodes
    }

    /// Sends an event to every connection registered for events.
    pub async fn push_event(&self, event: ServerEvent) {
        let listeners = lock(&self.state.listeners).clone();
        for listener in listeners {
            let _ = listener.send(event.clone()).await;
        }
    }

    /// Configuration using the first node as the only contact point.
    pub fn config(&self) -> SimulatedClusterConfig {
        SimulatedClusterConfig {
            cluster: self.state.clone(),
            contact_points: vec![node_addr(1)],
            version: Version::V5,
        }
    }

    pub fn session_builder<LB>(&self, load_balancing: LB) -> SimulatedSessionBuilder<LB>
    where
        LB: LoadBalancingStrategy<SimulatedTransport, SimulatedConnectionManager>
            + Send
            + Sync
            + 'static,
    {
        GenericSessionBuilder::new(load_balancing, self.config())
    }
}

pub fn node_addr(index: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, index)), 9042)
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(in_flight: &'a AtomicUsize) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(in_flight)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SimulatedTransport {
    node: Arc<SimulatedNode>,
    cluster: Arc<ClusterState>,
    version: Version,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    event_handler: Option<Sender<ServerEvent>>,
}

impl CqlTransport for SimulatedTransport {
    fn write_request<'a>(
        &'a self,
        request: &'a RequestBody,
    ) -> BoxFuture<'a, Result<ResponseBody>> {
        async move {
            if self.is_broken() {
                return Err(Error::ConnectionClosed(self.node.addr));
            }

            let _in_flight = InFlightGuard::new(&self.in_flight);
            self.cluster.record(&self.node, request);
            self.node.wait_while_paused().await;

            if self.is_broken() {
                return Err(Error::ConnectionClosed(self.node.addr));
            }

            self.cluster
                .respond(&self.node, request, self.event_handler.as_ref())
        }
        .boxed()
    }

    fn is_broken(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.node.is_stopped()
    }

    fn address(&self) -> SocketAddr {
        self.node.addr
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn version(&self) -> Version {
        self.version
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SimulatedConnectionManager {
    cluster: Arc<ClusterState>,
}

impl ConnectionManager<SimulatedTransport> for SimulatedConnectionManager {
    fn connection(
        &self,
        event_handler: Option<Sender<ServerEvent>>,
        _error_handler: Option<Sender<Error>>,
        addr: SocketAddr,
        version: Version,
    ) -> BoxFuture<'_, Result<SimulatedTransport>> {
        async move {
            let node = self
                .cluster
                .find_node(addr)
                .filter(|node| !node.is_stopped())
                .ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("{addr} refused connection"),
                    ))
                })?;

            if version > node.max_version {
                return Err(Error::UnsupportedProtocolVersion { addr, version });
            }

            node.connections.fetch_add(1, Ordering::SeqCst);

            Ok(SimulatedTransport {
                node: node.clone(),
                cluster: self.cluster.clone(),
                version,
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                event_handler,
            })
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct SimulatedClusterConfig {
    cluster: Arc<ClusterState>,
    contact_points: Vec<SocketAddr>,
    version: Version,
}

impl GenericClusterConfig<SimulatedTransport, SimulatedConnectionManager>
    for SimulatedClusterConfig
{
    fn create_manager(
        &self,
        _keyspace_holder: Arc<KeyspaceHolder>,
    ) -> BoxFuture<'_, Result<SimulatedConnectionManager>> {
        let cluster = self.cluster.clone();
        async move { Ok(SimulatedConnectionManager { cluster }) }.boxed()
    }

    fn contact_points(&self) -> &[SocketAddr] {
        &self.contact_points
    }

    fn version(&self) -> Version {
        self.version
    }

    fn event_channel_capacity(&self) -> usize {
        32
    }
}
