use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::result;
use thiserror::Error as ThisError;

use crate::frame::message_error::ErrorBody;
use crate::frame::{Opcode, Version};

pub type Result<T> = result::Result<T, Error>;

/// Driver error type. Errors fall into a few groups: connectivity problems with a single host
/// (I/O, timeouts, closed or saturated connections), protocol negotiation failures, errors
/// returned by a coordinator (`Server`), locally rejected requests and the aggregated
/// `NoHostAvailable` returned once a whole query plan has been exhausted.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Internal IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// General error
    #[error("General error: {0}")]
    General(String),
    /// Message could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
    /// Server error.
    #[error("Server {addr} error: {body:?}")]
    Server { body: ErrorBody, addr: SocketAddr },
    /// Timed out waiting for an operation to complete.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// The connection was closed while the request was pending.
    #[error("Connection to {0} closed")]
    ConnectionClosed(SocketAddr),
    /// All stream ids of all usable connections to the host are taken.
    #[error("All connections to {0} are busy")]
    Busy(SocketAddr),
    /// The pool of a host has no usable connection and cannot open one.
    #[error("No connections available to {0}")]
    NoConnectionsAvailable(SocketAddr),
    /// The host rejected the requested protocol version.
    #[error("Protocol version {version} not supported by {addr}")]
    UnsupportedProtocolVersion { addr: SocketAddr, version: Version },
    /// No protocol version could be negotiated with the host.
    #[error("Invalid protocol used when communicating with a node: {0}")]
    InvalidProtocol(SocketAddr),
    /// The request was rejected locally, before being sent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// Every host in the query plan failed; contains the last error of each attempted host.
    #[error("No host available (tried: {})", display_hosts(.errors))]
    NoHostAvailable { errors: HashMap<SocketAddr, Error> },
    /// The session has been closed.
    #[error("Session closed")]
    SessionClosed,
    /// Unknown consistency.
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(i16),
    /// Unexpected protocol version byte.
    #[error("Unknown protocol version: {0}")]
    UnknownVersion(u8),
    /// Unexpected opcode byte.
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),
    /// Server answered with a message that doesn't fit the request.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(Opcode),
    /// Column missing or of a different type.
    #[error("Column error: {0}")]
    Column(String),
}

fn display_hosts(errors: &HashMap<SocketAddr, Error>) -> String {
    let mut hosts: Vec<_> = errors
        .iter()
        .map(|(addr, error)| format!("{addr}: {error}"))
        .collect();
    hosts.sort_unstable();
    hosts.join(", ")
}

impl Error {
    /// Errors which tell nothing about the request itself, only about the host or connection
    /// it was sent through. Such errors make the request eligible for the next host.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::ConnectionClosed(_)
                | Error::Busy(_)
                | Error::NoConnectionsAvailable(_)
                | Error::InvalidProtocol(_)
                | Error::UnsupportedProtocolVersion { .. }
        )
    }

    /// Connection errors raised before the request reached the wire. Sending such a request to
    /// another host cannot execute it twice.
    pub fn is_unsent_request_error(&self) -> bool {
        matches!(
            self,
            Error::Busy(_)
                | Error::NoConnectionsAvailable(_)
                | Error::InvalidProtocol(_)
                | Error::UnsupportedProtocolVersion { .. }
        )
    }

    #[inline]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Server { .. })
    }

    /// Returns server error body, if this is a server error.
    #[inline]
    pub fn server_error(&self) -> Option<&ErrorBody> {
        match self {
            Error::Server { body, .. } => Some(body),
            _ => None,
        }
    }
}

pub fn column_is_empty_err<T: Display>(column_name: T) -> Error {
    Error::Column(format!("Column '{column_name}' is empty"))
}

impl From<String> for Error {
    fn from(err: String) -> Error {
        Error::General(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Error {
        Error::General(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Codec(err.to_string())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(error) => Error::Io(io::Error::new(error.kind(), error.to_string())),
            Error::General(error) => Error::General(error.clone()),
            Error::Codec(error) => Error::Codec(error.clone()),
            Error::Server { body, addr } => Error::Server {
                body: body.clone(),
                addr: *addr,
            },
            Error::Timeout(error) => Error::Timeout(error.clone()),
            Error::ConnectionClosed(addr) => Error::ConnectionClosed(*addr),
            Error::Busy(addr) => Error::Busy(*addr),
            Error::NoConnectionsAvailable(addr) => Error::NoConnectionsAvailable(*addr),
            Error::UnsupportedProtocolVersion { addr, version } => {
                Error::UnsupportedProtocolVersion {
                    addr: *addr,
                    version: *version,
                }
            }
            Error::InvalidProtocol(addr) => Error::InvalidProtocol(*addr),
            Error::InvalidRequest(error) => Error::InvalidRequest(error.clone()),
            Error::NoHostAvailable { errors } => Error::NoHostAvailable {
                errors: errors.clone(),
            },
            Error::SessionClosed => Error::SessionClosed,
            Error::UnknownConsistency(value) => Error::UnknownConsistency(*value),
            Error::UnknownVersion(value) => Error::UnknownVersion(*value),
            Error::UnknownOpcode(value) => Error::UnknownOpcode(*value),
            Error::UnexpectedResponse(value) => Error::UnexpectedResponse(*value),
            Error::Column(error) => Error::Column(error.clone()),
        }
    }
}
