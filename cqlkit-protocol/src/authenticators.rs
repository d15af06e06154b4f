//! SASL authentication performed during connection startup.
//!
//! A node requiring authentication answers `STARTUP` with the class name of its authenticator.
//! The driver then asks the configured [`SaslAuthenticatorProvider`] for a fresh
//! [`SaslAuthenticator`], sends its initial token, and keeps answering challenges until the
//! node reports success.

use crate::error::{Error, Result};

/// Class name announced by nodes using username/password authentication.
pub const PASSWORD_AUTHENTICATOR_CLASS: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// One authentication exchange on one connection.
pub trait SaslAuthenticator {
    /// Token opening the exchange.
    fn initial_response(&self) -> Vec<u8>;

    /// Answer to a server challenge.
    fn evaluate_challenge(&self, challenge: Vec<u8>) -> Result<Vec<u8>>;

    /// Called with the final server token once authentication succeeded.
    fn handle_success(&self, data: Option<Vec<u8>>) -> Result<()>;
}

/// Creates an authenticator for every new connection.
pub trait SaslAuthenticatorProvider {
    /// Server authenticator class this provider can talk to. `None` means the provider cannot
    /// authenticate at all.
    fn name(&self) -> Option<&str>;

    fn create_authenticator(&self) -> Box<dyn SaslAuthenticator + Send>;
}

fn unsupported_challenge(authenticator: &str) -> Error {
    Error::General(format!(
        "{authenticator} cannot answer server authentication challenges"
    ))
}

/// Username and password sent as a single PLAIN token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPasswordAuthenticator {
    username: String,
    password: String,
}

impl StaticPasswordAuthenticator {
    pub fn new<S: ToString>(username: S, password: S) -> StaticPasswordAuthenticator {
        StaticPasswordAuthenticator {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl SaslAuthenticator for StaticPasswordAuthenticator {
    fn initial_response(&self) -> Vec<u8> {
        // authzid is left empty
        [&[0u8][..], self.username.as_bytes(), &[0], self.password.as_bytes()].concat()
    }

    fn evaluate_challenge(&self, _challenge: Vec<u8>) -> Result<Vec<u8>> {
        Err(unsupported_challenge("Password authentication"))
    }

    fn handle_success(&self, _data: Option<Vec<u8>>) -> Result<()> {
        Ok(())
    }
}

/// Hands out [`StaticPasswordAuthenticator`]s with fixed credentials.
#[derive(Debug, Clone)]
pub struct StaticPasswordAuthenticatorProvider {
    credentials: StaticPasswordAuthenticator,
}

impl StaticPasswordAuthenticatorProvider {
    pub fn new<S: ToString>(username: S, password: S) -> Self {
        StaticPasswordAuthenticatorProvider {
            credentials: StaticPasswordAuthenticator::new(username, password),
        }
    }
}

impl SaslAuthenticatorProvider for StaticPasswordAuthenticatorProvider {
    fn name(&self) -> Option<&str> {
        Some(PASSWORD_AUTHENTICATOR_CLASS)
    }

    fn create_authenticator(&self) -> Box<dyn SaslAuthenticator + Send> {
        Box::new(self.credentials.clone())
    }
}

/// Authenticator used when no credentials are configured.
#[derive(Debug, Clone, Copy)]
pub struct NoneAuthenticator;

impl SaslAuthenticator for NoneAuthenticator {
    fn initial_response(&self) -> Vec<u8> {
        vec![0]
    }

    fn evaluate_challenge(&self, _challenge: Vec<u8>) -> Result<Vec<u8>> {
        Err(unsupported_challenge("Anonymous authentication"))
    }

    fn handle_success(&self, _data: Option<Vec<u8>>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoneAuthenticatorProvider;

impl SaslAuthenticatorProvider for NoneAuthenticatorProvider {
    fn name(&self) -> Option<&str> {
        None
    }

    fn create_authenticator(&self) -> Box<dyn SaslAuthenticator + Send> {
        Box::new(NoneAuthenticator)
    }
}
