use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::frame::events::{SchemaChange, ServerEvent};
use crate::frame::message_error::ErrorBody;
use crate::frame::message_result::{
    BodyResResultPrepared, BodyResResultRows, BodyResResultSetKeyspace, ResResultBody,
};
use crate::frame::Opcode;
use crate::types::rows::Row;

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ResponseBody {
    Error(ErrorBody),
    Ready,
    Authenticate(BodyResAuthenticate),
    Supported(BodyResSupported),
    Result(ResResultBody),
    Event(BodyResEvent),
    AuthChallenge(BodyResAuthChallenge),
    AuthSuccess(BodyReqAuthSuccess),
}

impl ResponseBody {
    pub fn opcode(&self) -> Opcode {
        match self {
            ResponseBody::Error(_) => Opcode::Error,
            ResponseBody::Ready => Opcode::Ready,
            ResponseBody::Authenticate(_) => Opcode::Authenticate,
            ResponseBody::Supported(_) => Opcode::Supported,
            ResponseBody::Result(_) => Opcode::Result,
            ResponseBody::Event(_) => Opcode::Event,
            ResponseBody::AuthChallenge(_) => Opcode::AuthChallenge,
            ResponseBody::AuthSuccess(_) => Opcode::AuthSuccess,
        }
    }

    #[inline]
    pub fn void() -> Self {
        ResponseBody::Result(ResResultBody::Void)
    }

    #[inline]
    pub fn rows(rows: BodyResResultRows) -> Self {
        ResponseBody::Result(ResResultBody::Rows(rows))
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            ResponseBody::Result(res) => res.into_rows().map(Row::from_body),
            _ => None,
        }
    }

    pub fn into_prepared(self) -> Option<BodyResResultPrepared> {
        match self {
            ResponseBody::Result(res) => res.into_prepared(),
            _ => None,
        }
    }

    pub fn into_server_event(self) -> Option<ServerEvent> {
        match self {
            ResponseBody::Event(event) => Some(event.event),
            _ => None,
        }
    }

    pub fn as_set_keyspace(&self) -> Option<&BodyResResultSetKeyspace> {
        match self {
            ResponseBody::Result(res) => res.as_set_keyspace(),
            _ => None,
        }
    }

    pub fn as_schema_change(&self) -> Option<&SchemaChange> {
        match self {
            ResponseBody::Result(ResResultBody::SchemaChange(change)) => Some(change),
            _ => None,
        }
    }

    pub fn authenticator(&self) -> Option<&str> {
        match self {
            ResponseBody::Authenticate(auth) => Some(auth.data.as_str()),
            _ => None,
        }
    }
}

/// Name of the authenticator the server requires.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct BodyResAuthenticate {
    pub data: String,
}

/// Options supported by the server, answered to `OPTIONS`.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct BodyResSupported {
    pub data: HashMap<String, Vec<String>>,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct BodyResEvent {
    pub event: ServerEvent,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct BodyResAuthChallenge {
    pub data: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct BodyReqAuthSuccess {
    pub data: Option<Vec<u8>>,
}
