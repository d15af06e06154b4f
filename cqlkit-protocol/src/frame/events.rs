use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// Event types
const TOPOLOGY_CHANGE: &str = "TOPOLOGY_CHANGE";
const STATUS_CHANGE: &str = "STATUS_CHANGE";
const SCHEMA_CHANGE: &str = "SCHEMA_CHANGE";

/// Simplified `ServerEvent` that does not contain details
/// about a concrete change. It is used for subscription.
#[derive(Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Serialize, Deserialize)]
pub enum SimpleServerEvent {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl SimpleServerEvent {
    pub fn as_str(&self) -> &'static str {
        match *self {
            SimpleServerEvent::TopologyChange => TOPOLOGY_CHANGE,
            SimpleServerEvent::StatusChange => STATUS_CHANGE,
            SimpleServerEvent::SchemaChange => SCHEMA_CHANGE,
        }
    }
}

impl From<&ServerEvent> for SimpleServerEvent {
    fn from(event: &ServerEvent) -> SimpleServerEvent {
        match *event {
            ServerEvent::TopologyChange(_) => SimpleServerEvent::TopologyChange,
            ServerEvent::StatusChange(_) => SimpleServerEvent::StatusChange,
            ServerEvent::SchemaChange(_) => SimpleServerEvent::SchemaChange,
        }
    }
}

impl PartialEq<ServerEvent> for SimpleServerEvent {
    fn eq(&self, full_event: &ServerEvent) -> bool {
        self == &SimpleServerEvent::from(full_event)
    }
}

/// Full server event that contains all details about a concrete change.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Events related to change in the cluster topology
    TopologyChange(TopologyChange),
    /// Events related to change of node status.
    StatusChange(StatusChange),
    /// Events related to schema change.
    SchemaChange(SchemaChange),
}

impl PartialEq<SimpleServerEvent> for ServerEvent {
    fn eq(&self, event: &SimpleServerEvent) -> bool {
        &SimpleServerEvent::from(self) == event
    }
}

/// Events related to change in the cluster topology
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyChange {
    pub change_type: TopologyChangeType,
    pub addr: SocketAddr,
}

#[derive(
    Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Display, Serialize, Deserialize,
)]
pub enum TopologyChangeType {
    NewNode,
    RemovedNode,
}

/// Events related to change of node status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusChange {
    pub change_type: StatusChangeType,
    pub addr: SocketAddr,
}

#[derive(
    Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Display, Serialize, Deserialize,
)]
pub enum StatusChangeType {
    Up,
    Down,
}

/// Events related to schema change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaChange {
    pub change_type: SchemaChangeType,
    pub target: SchemaChangeTarget,
    pub options: SchemaChangeOptions,
}

#[derive(
    Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Display, Serialize, Deserialize,
)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

#[derive(
    Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Display, Serialize, Deserialize,
)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
}

/// Information about changed schema element.
#[derive(Debug, PartialEq, Clone, Ord, PartialOrd, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaChangeOptions {
    /// Keyspace name.
    Keyspace(String),
    /// Keyspace name and table or type name.
    TableType(String, String),
    /// Keyspace name, function or aggregate name and argument types.
    FunctionAggregate(String, String, Vec<String>),
}

impl SchemaChangeOptions {
    pub fn keyspace(&self) -> &str {
        match self {
            SchemaChangeOptions::Keyspace(keyspace) => keyspace,
            SchemaChangeOptions::TableType(keyspace, _) => keyspace,
            SchemaChangeOptions::FunctionAggregate(keyspace, _, _) => keyspace,
        }
    }
}
