use bytemuck::NoUninit;
use derive_more::Display;

/// The state of a node, as viewed from the driver.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, NoUninit)]
#[repr(u8)]
pub enum NodeState {
    /// The driver has never tried to connect to the node, nor received any status events about
    /// it. Such nodes are still included in query plans.
    Unknown,
    /// The driver has at least one working connection to the node, or received an event
    /// stating the node is up.
    Up,
    /// All connections to the node were lost (the driver is trying to reconnect), or an event
    /// stated the node is down.
    Down,
    /// The driver gave up reconnecting, e.g. the reconnection schedule was exhausted or no
    /// protocol version could be negotiated. Only a status event brings such node back.
    ForcedDown,
}

impl NodeState {
    /// Can requests be routed to a node in this state.
    #[inline]
    pub fn is_available(self) -> bool {
        matches!(self, NodeState::Unknown | NodeState::Up)
    }
}
