use fxhash::FxHashMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod cluster_metadata;
mod node;
mod node_distance;
mod node_state;

pub use self::node::{Node, NodePoolState};
pub use self::node_distance::NodeDistance;
pub use self::node_state::NodeState;

/// Known nodes, by host id.
pub type NodeMap<T, CM> = FxHashMap<Uuid, Arc<Node<T, CM>>>;
