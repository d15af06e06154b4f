use bytemuck::NoUninit;
use derive_more::Display;

/// Determines how the driver will manage connections to a node. Assigned by the load balancing
/// strategy.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Display, NoUninit)]
#[repr(u8)]
pub enum NodeDistance {
    /// The driver maintains connections to the node and prefers it, e.g. when choosing the
    /// control connection host.
    Local,
    /// The driver maintains connections to the node, but other nodes may have priority.
    Remote,
    /// The driver keeps no connections to the node and never sends requests to it.
    Ignored,
}
