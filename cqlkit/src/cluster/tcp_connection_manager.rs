use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::*;

use crate::authenticators::SaslAuthenticatorProvider;
use crate::cluster::connection_manager::{startup, ConnectionManager};
use crate::cluster::KeyspaceHolder;
use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::frame::Version;
use crate::future::BoxFuture;
use crate::transport::{CqlTransport, TransportOptions, TransportTcp};

/// Opens plain TCP connections and runs the startup handshake on them before handing them out.
pub struct TcpConnectionManager {
    authenticator_provider: Arc<dyn SaslAuthenticatorProvider + Send + Sync>,
    keyspace_holder: Arc<KeyspaceHolder>,
    transport_options: TransportOptions,
}

impl TcpConnectionManager {
    pub fn new(
        authenticator_provider: Arc<dyn SaslAuthenticatorProvider + Send + Sync>,
        keyspace_holder: Arc<KeyspaceHolder>,
        transport_options: TransportOptions,
    ) -> Self {
        TcpConnectionManager {
            authenticator_provider,
            keyspace_holder,
            transport_options,
        }
    }
}

impl ConnectionManager<TransportTcp> for TcpConnectionManager {
    fn connection(
        &self,
        event_handler: Option<Sender<ServerEvent>>,
        error_handler: Option<Sender<Error>>,
        addr: SocketAddr,
        version: Version,
    ) -> BoxFuture<'_, Result<TransportTcp>> {
        async move {
            let transport = TransportTcp::new(
                addr,
                version,
                Arc::clone(&self.keyspace_holder),
                event_handler,
                error_handler,
                &self.transport_options,
            )
            .await?;

            // a half-initialized connection must not linger with its reader task running
            startup(
                &transport,
                self.authenticator_provider.as_ref(),
                &self.keyspace_holder,
            )
            .await
            .inspect_err(|error| {
                debug!(%addr, %version, %error, "Connection startup failed.");
                transport.close();
            })?;

            Ok(transport)
        }
        .boxed()
    }
}
