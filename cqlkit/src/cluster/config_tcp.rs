use derivative::Derivative;
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::authenticators::{NoneAuthenticatorProvider, SaslAuthenticatorProvider};
use crate::cluster::{GenericClusterConfig, KeyspaceHolder, NodeAddress, TcpConnectionManager};
use crate::codec::{JsonCodec, MessageCodec};
use crate::error::{Error, Result};
use crate::frame::Version;
use crate::future::BoxFuture;
use crate::transport::{TransportOptions, TransportTcp, DEFAULT_MAX_REQUESTS_PER_CONNECTION};

const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Cluster TCP connection configuration: contact points used to discover the cluster, and
/// settings applied to every connection.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct NodeTcpConfig {
    pub contact_points: Vec<SocketAddr>,
    #[derivative(Debug = "ignore")]
    pub authenticator_provider: Arc<dyn SaslAuthenticatorProvider + Send + Sync>,
    /// Highest protocol version to try. Lower ones are negotiated if a node rejects it.
    pub version: Version,
    pub transport_options: TransportOptions,
    pub event_channel_capacity: usize,
}

impl GenericClusterConfig<TransportTcp, TcpConnectionManager> for NodeTcpConfig {
    fn create_manager(
        &self,
        keyspace_holder: Arc<KeyspaceHolder>,
    ) -> BoxFuture<'_, Result<TcpConnectionManager>> {
        async move {
            Ok(TcpConnectionManager::new(
                self.authenticator_provider.clone(),
                keyspace_holder,
                self.transport_options.clone(),
            ))
        }
        .boxed()
    }

    #[inline]
    fn contact_points(&self) -> &[SocketAddr] {
        &self.contact_points
    }

    #[inline]
    fn version(&self) -> Version {
        self.version
    }

    #[inline]
    fn event_channel_capacity(&self) -> usize {
        self.event_channel_capacity
    }
}

/// Builder structure that helps to configure TCP connections to the cluster.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct NodeTcpConfigBuilder {
    addrs: Vec<NodeAddress>,
    #[derivative(Debug = "ignore")]
    authenticator_provider: Arc<dyn SaslAuthenticatorProvider + Send + Sync>,
    version: Version,
    codec: Arc<dyn MessageCodec>,
    buffer_size: usize,
    tcp_nodelay: bool,
    max_requests_per_connection: usize,
    event_channel_capacity: usize,
}

impl Default for NodeTcpConfigBuilder {
    fn default() -> Self {
        NodeTcpConfigBuilder {
            addrs: vec![],
            authenticator_provider: Arc::new(NoneAuthenticatorProvider),
            version: Version::HIGHEST,
            codec: Arc::new(JsonCodec),
            buffer_size: DEFAULT_BUFFER_SIZE,
            tcp_nodelay: true,
            max_requests_per_connection: DEFAULT_MAX_REQUESTS_PER_CONNECTION,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl NodeTcpConfigBuilder {
    pub fn new() -> NodeTcpConfigBuilder {
        Default::default()
    }

    /// Sets new authenticator.
    #[must_use]
    pub fn with_authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn SaslAuthenticatorProvider + Send + Sync>,
    ) -> Self {
        self.authenticator_provider = authenticator_provider;
        self
    }

    /// Adds initial node address (a contact point for cluster discovery).
    #[must_use]
    pub fn with_contact_point(mut self, addr: NodeAddress) -> Self {
        self.addrs.push(addr);
        self
    }

    /// Adds initial node addresses.
    #[must_use]
    pub fn with_contact_points(mut self, addrs: Vec<NodeAddress>) -> Self {
        self.addrs.extend(addrs);
        self
    }

    /// Sets the highest protocol version to negotiate.
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Sets the message body codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the number of outgoing messages buffered per connection.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Enables or disables `TCP_NODELAY`.
    #[must_use]
    pub fn with_tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    /// Sets the number of stream ids (concurrent requests) of a single connection.
    #[must_use]
    pub fn with_max_requests_per_connection(mut self, max_requests_per_connection: usize) -> Self {
        self.max_requests_per_connection = max_requests_per_connection;
        self
    }

    /// Sets the capacity of the session event channel.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, event_channel_capacity: usize) -> Self {
        self.event_channel_capacity = event_channel_capacity;
        self
    }

    /// Finalizes building process, resolving hostnames.
    pub async fn build(self) -> Result<NodeTcpConfig> {
        // replace with map() when async lambdas become available
        let mut contact_points = Vec::with_capacity(self.addrs.len());
        for addr in &self.addrs {
            contact_points.append(&mut addr.resolve().await?);
        }

        if contact_points.is_empty() {
            return Err(Error::General("No contact points given!".into()));
        }

        Ok(NodeTcpConfig {
            contact_points,
            authenticator_provider: self.authenticator_provider,
            version: self.version,
            transport_options: TransportOptions {
                codec: self.codec,
                buffer_size: self.buffer_size,
                tcp_nodelay: self.tcp_nodelay,
                max_requests_per_connection: self.max_requests_per_connection,
            },
            event_channel_capacity: self.event_channel_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_build_config_with_defaults() {
        let config = NodeTcpConfigBuilder::new()
            .with_contact_point("127.0.0.1:9042".into())
            .with_contact_points(vec!["127.0.0.2:9042".into()])
            .with_max_requests_per_connection(16)
            .build()
            .await
            .unwrap();

        assert_eq!(config.contact_points.len(), 2);
        assert_eq!(config.version, Version::HIGHEST);
        assert_eq!(config.transport_options.max_requests_per_connection, 16);
        assert!(config.transport_options.tcp_nodelay);
    }

    #[tokio::test]
    async fn should_reject_empty_contact_points() {
        assert!(NodeTcpConfigBuilder::new().build().await.is_err());
    }
}
