//! **cqlkit** is the connection and session core of an asynchronous CQL cluster driver.
//!
//! ## Getting started
//!
//! This example configures a session from a single contact point, and uses round-robin load
//! balancing. The rest of the cluster is discovered by the control connection.
//!
//! ```no_run
//! use cqlkit::cluster::session::TcpSessionBuilder;
//! use cqlkit::cluster::NodeTcpConfigBuilder;
//! use cqlkit::load_balancing::RoundRobinLoadBalancingStrategy;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster_config = NodeTcpConfigBuilder::new()
//!         .with_contact_point("127.0.0.1:9042".into())
//!         .build()
//!         .await
//!         .unwrap();
//!     let session = TcpSessionBuilder::new(RoundRobinLoadBalancingStrategy::new(), cluster_config)
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let create_ks = "CREATE KEYSPACE IF NOT EXISTS test_ks WITH REPLICATION = { \
//!                      'class' : 'SimpleStrategy', 'replication_factor' : 1 };";
//!     session
//!         .query(create_ks)
//!         .await
//!         .expect("Keyspace create error");
//! }
//! ```
//!
//! ## Nodes and load balancing
//!
//! Each node gets a distance from the [load balancer](crate::load_balancing). Local and remote
//! nodes keep a pool of multiplexed connections sized by
//! [`ConnectionPoolConfig`](crate::cluster::ConnectionPoolConfig), while ignored nodes keep none.
//! Requests walk a lazily evaluated query plan; failed attempts move on to the next node
//! according to the [retry policy](crate::retry), and idempotent requests can be executed
//! [speculatively](crate::speculative_execution).

#[macro_use]
mod macros;

pub mod cluster;
pub mod envelope_parser;
pub mod events;
pub mod future;
pub mod load_balancing;
pub mod retry;
pub mod speculative_execution;
pub mod statement;
pub mod transport;

pub use cqlkit_protocol::authenticators;
pub use cqlkit_protocol::codec;
pub use cqlkit_protocol::consistency;
pub use cqlkit_protocol::error;
pub use cqlkit_protocol::frame;
pub use cqlkit_protocol::query;
pub use cqlkit_protocol::types;

pub type Error = error::Error;
pub type Result<T> = error::Result<T>;
