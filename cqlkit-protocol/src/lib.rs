//! Protocol-level model shared by the cqlkit driver: protocol versions, envelope framing,
//! request/response messages, server errors and events, consistency levels and values.
//!
//! Message bodies are turned into bytes by a [`MessageCodec`](codec::MessageCodec), which is
//! consumed as an opaque capability by the driver.

pub mod frame;
pub mod query;
pub mod types;

pub mod authenticators;
pub mod codec;
pub mod consistency;
pub mod error;

pub type Error = error::Error;
pub type Result<T> = error::Result<T>;
