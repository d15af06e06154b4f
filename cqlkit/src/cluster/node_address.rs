use derive_more::Display;
use std::net::SocketAddr;
use tokio::net::lookup_host;

use crate::error::Result;

/// Contact point address. A hostname may resolve to several addresses, each of which becomes a
/// separate contact point.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeAddress {
    Direct(SocketAddr),
    Hostname(String),
}

impl NodeAddress {
    /// Resolves the address into socket addresses.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        match self {
            NodeAddress::Direct(addr) => Ok(vec![*addr]),
            NodeAddress::Hostname(hostname) => lookup_host(hostname.as_str())
                .await
                .map(Iterator::collect)
                .map_err(Into::into),
        }
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        NodeAddress::Direct(addr)
    }
}

impl From<String> for NodeAddress {
    fn from(value: String) -> Self {
        value
            .parse()
            .map(NodeAddress::Direct)
            .unwrap_or(NodeAddress::Hostname(value))
    }
}

impl From<&str> for NodeAddress {
    fn from(value: &str) -> Self {
        value.to_string().into()
    }
}
