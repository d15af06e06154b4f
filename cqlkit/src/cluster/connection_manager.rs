use std::net::SocketAddr;
use tokio::sync::mpsc::Sender;
use tracing::*;

#[cfg(test)]
use mockall::*;

use crate::authenticators::SaslAuthenticatorProvider;
use crate::cluster::KeyspaceHolder;
use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::frame::message_request::RequestBody;
use crate::frame::message_response::ResponseBody;
use crate::frame::Version;
use crate::future::BoxFuture;
use crate::query::QueryParams;
use crate::transport::CqlTransport;

/// Manages establishing connections to nodes.
pub trait ConnectionManager<T: CqlTransport>: Send + Sync {
    /// Tries to establish a new, ready to use connection speaking the given protocol version,
    /// with optional server event and error handlers.
    fn connection(
        &self,
        event_handler: Option<Sender<ServerEvent>>,
        error_handler: Option<Sender<Error>>,
        addr: SocketAddr,
        version: Version,
    ) -> BoxFuture<'_, Result<T>>;
}

#[cfg(test)]
mock! {
    pub ConnectionManager<T: CqlTransport> {
    }

    impl<T: CqlTransport> ConnectionManager<T> for ConnectionManager<T> {
        fn connection<'a>(
            &'a self,
            event_handler: Option<Sender<ServerEvent>>,
            error_handler: Option<Sender<Error>>,
            addr: SocketAddr,
            version: Version,
        ) -> BoxFuture<'a, Result<T>>;
    }
}

/// Performs the startup handshake on a fresh connection: `STARTUP`, optional SASL
/// authentication and switching to the session keyspace.
///
/// A node refusing the connection's protocol version results in
/// [`Error::UnsupportedProtocolVersion`], so the caller can retry with a lower one.
pub async fn startup<
    T: CqlTransport + 'static,
    A: SaslAuthenticatorProvider + Send + Sync + ?Sized + 'static,
>(
    transport: &T,
    authenticator_provider: &A,
    keyspace_holder: &KeyspaceHolder,
) -> Result<()> {
    let addr = transport.address();
    let version = transport.version();

    let response = transport
        .write_request(&RequestBody::new_startup())
        .await
        .map_err(|error| match error {
            Error::Server { body, addr } if body.is_bad_protocol() => {
                debug!(%addr, %version, message = %body.message, "Protocol version rejected.");
                Error::UnsupportedProtocolVersion { addr, version }
            }
            error => error,
        })?;

    match response {
        ResponseBody::Ready => {}
        ResponseBody::Authenticate(authenticate) => {
            authenticate_connection(transport, authenticator_provider, &authenticate.data)
                .await?
        }
        response => return Err(Error::UnexpectedResponse(response.opcode())),
    }

    debug!(%addr, %version, "Connection ready.");
    set_keyspace(transport, keyspace_holder).await
}

async fn authenticate_connection<
    T: CqlTransport,
    A: SaslAuthenticatorProvider + Send + Sync + ?Sized,
>(
    transport: &T,
    authenticator_provider: &A,
    server_authenticator: &str,
) -> Result<()> {
    let expected = authenticator_provider.name().ok_or_else(|| {
        Error::General(format!(
            "Node {} requires authentication with {server_authenticator}, but no authenticator \
            was provided",
            transport.address()
        ))
    })?;

    if expected != server_authenticator {
        return Err(Error::General(format!(
            "Unsupported type of authenticator. {server_authenticator} got, but {expected} is \
            supported."
        )));
    }

    let authenticator = authenticator_provider.create_authenticator();
    let mut response = transport
        .write_request(&RequestBody::new_auth_response(
            authenticator.initial_response(),
        ))
        .await?;

    loop {
        match response {
            ResponseBody::AuthChallenge(challenge) => {
                let token = authenticator.evaluate_challenge(challenge.data)?;
                response = transport
                    .write_request(&RequestBody::new_auth_response(token))
                    .await?;
            }
            ResponseBody::AuthSuccess(success) => return authenticator.handle_success(success.data),
            response => return Err(Error::UnexpectedResponse(response.opcode())),
        }
    }
}

async fn set_keyspace<T: CqlTransport>(
    transport: &T,
    keyspace_holder: &KeyspaceHolder,
) -> Result<()> {
    if let Some(use_statement) = keyspace_holder.use_statement() {
        transport
            .write_request(&RequestBody::new_query(
                use_statement,
                QueryParams::default(),
            ))
            .await
            .map(|_| ())
    } else {
        Ok(())
    }
}
