//! Errors which a coordinator can respond with. As in the native protocol, every error carries a
//! code and a message, and depending on its kind some additional information.
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::consistency::Consistency;

pub const SERVER_ERROR: i32 = 0x0000;
pub const PROTOCOL_ERROR: i32 = 0x000A;
pub const AUTHENTICATION_ERROR: i32 = 0x0100;
pub const UNAVAILABLE: i32 = 0x1000;
pub const OVERLOADED: i32 = 0x1001;
pub const IS_BOOTSTRAPPING: i32 = 0x1002;
pub const TRUNCATE_ERROR: i32 = 0x1003;
pub const WRITE_TIMEOUT: i32 = 0x1100;
pub const READ_TIMEOUT: i32 = 0x1200;
pub const READ_FAILURE: i32 = 0x1300;
pub const FUNCTION_FAILURE: i32 = 0x1400;
pub const WRITE_FAILURE: i32 = 0x1500;
pub const SYNTAX_ERROR: i32 = 0x2000;
pub const UNAUTHORIZED: i32 = 0x2100;
pub const INVALID: i32 = 0x2200;
pub const CONFIG_ERROR: i32 = 0x2300;
pub const ALREADY_EXISTS: i32 = 0x2400;
pub const UNPREPARED: i32 = 0x2500;

const UNSUPPORTED_VERSION_MESSAGE: &str = "Invalid or unsupported protocol version";

/// Error returned by a server as a response.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Code that points to a type of error.
    pub error_code: i32,
    /// Error message string.
    pub message: String,
    /// Additional information.
    pub additional_info: AdditionalErrorInfo,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, additional_info: AdditionalErrorInfo) -> Self {
        ErrorBody {
            error_code: additional_info.code(),
            message: message.into(),
            additional_info,
        }
    }

    /// Is this the answer to a startup with a protocol version the server doesn't speak.
    pub fn is_bad_protocol(&self) -> bool {
        self.additional_info == AdditionalErrorInfo::Protocol
            && self
                .message
                .to_lowercase()
                .contains(&UNSUPPORTED_VERSION_MESSAGE.to_lowercase())
    }

    pub fn unsupported_protocol_version(message: impl fmt::Display) -> Self {
        ErrorBody::new(
            format!("{UNSUPPORTED_VERSION_MESSAGE}: {message}"),
            AdditionalErrorInfo::Protocol,
        )
    }
}

/// Additional error info, depending on the error code.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum AdditionalErrorInfo {
    Server,
    Protocol,
    Authentication,
    Unavailable(UnavailableError),
    Overloaded,
    IsBootstrapping,
    Truncate,
    WriteTimeout(WriteTimeoutError),
    ReadTimeout(ReadTimeoutError),
    ReadFailure(ReadFailureError),
    FunctionFailure(FunctionFailureError),
    WriteFailure(WriteFailureError),
    Syntax,
    Unauthorized,
    Invalid,
    Config,
    AlreadyExists(AlreadyExistsError),
    Unprepared(UnpreparedError),
}

impl AdditionalErrorInfo {
    pub fn code(&self) -> i32 {
        match self {
            AdditionalErrorInfo::Server => SERVER_ERROR,
            AdditionalErrorInfo::Protocol => PROTOCOL_ERROR,
            AdditionalErrorInfo::Authentication => AUTHENTICATION_ERROR,
            AdditionalErrorInfo::Unavailable(_) => UNAVAILABLE,
            AdditionalErrorInfo::Overloaded => OVERLOADED,
            AdditionalErrorInfo::IsBootstrapping => IS_BOOTSTRAPPING,
            AdditionalErrorInfo::Truncate => TRUNCATE_ERROR,
            AdditionalErrorInfo::WriteTimeout(_) => WRITE_TIMEOUT,
            AdditionalErrorInfo::ReadTimeout(_) => READ_TIMEOUT,
            AdditionalErrorInfo::ReadFailure(_) => READ_FAILURE,
            AdditionalErrorInfo::FunctionFailure(_) => FUNCTION_FAILURE,
            AdditionalErrorInfo::WriteFailure(_) => WRITE_FAILURE,
            AdditionalErrorInfo::Syntax => SYNTAX_ERROR,
            AdditionalErrorInfo::Unauthorized => UNAUTHORIZED,
            AdditionalErrorInfo::Invalid => INVALID,
            AdditionalErrorInfo::Config => CONFIG_ERROR,
            AdditionalErrorInfo::AlreadyExists(_) => ALREADY_EXISTS,
            AdditionalErrorInfo::Unprepared(_) => UNPREPARED,
        }
    }
}

/// Not enough live replicas to satisfy the requested consistency.
#[derive(Debug, PartialEq, Ord, PartialOrd, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub struct UnavailableError {
    /// Consistency level of query.
    pub cl: Consistency,
    /// Number of nodes that should be available to respect `cl`.
    pub required: i32,
    /// Number of replicas that were known to be alive.
    pub alive: i32,
}

#[derive(Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Serialize, Deserialize)]
pub struct WriteTimeoutError {
    pub cl: Consistency,
    pub received: i32,
    pub block_for: i32,
    pub write_type: WriteType,
}

#[derive(Debug, PartialEq, Ord, PartialOrd, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub struct ReadTimeoutError {
    pub cl: Consistency,
    pub received: i32,
    pub block_for: i32,
    pub data_present: bool,
}

impl ReadTimeoutError {
    #[inline]
    pub fn replica_has_responded(&self) -> bool {
        self.data_present
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct ReadFailureError {
    pub cl: Consistency,
    pub received: i32,
    pub block_for: i32,
    pub num_failures: i32,
    pub data_present: bool,
}

#[derive(Debug, PartialEq, Ord, PartialOrd, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct FunctionFailureError {
    pub keyspace: String,
    pub function: String,
    pub arg_types: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct WriteFailureError {
    pub cl: Consistency,
    pub received: i32,
    pub block_for: i32,
    pub num_failures: i32,
    pub write_type: WriteType,
}

/// Kind of write which timed out or failed.
#[derive(
    Debug, Ord, PartialOrd, Eq, PartialEq, Hash, Copy, Clone, Display, Serialize, Deserialize,
)]
pub enum WriteType {
    /// The write was a non-batched non-counter write.
    Simple,
    /// The write was a (logged) batch write.
    Batch,
    /// The write was an unlogged batch.
    UnloggedBatch,
    /// The write was a counter write (batched or not).
    Counter,
    /// The failure occurred during the write to the batch log when a (logged) batch
    /// write was requested.
    BatchLog,
    /// The timeout occurred during the Compare And Set write/update.
    Cas,
    /// Materialized view update.
    View,
    /// Change data capture.
    Cdc,
}

#[derive(Debug, PartialEq, Ord, PartialOrd, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct AlreadyExistsError {
    /// Represents either the keyspace that already exists,
    /// or the keyspace in which the table that already exists is.
    pub ks: String,
    /// Represents the name of the table that already exists.
    pub table: String,
}

/// The prepared statement id is unknown to the coordinator.
#[derive(Debug, PartialEq, Ord, PartialOrd, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct UnpreparedError {
    /// Unknown ID.
    pub id: Vec<u8>,
}
