use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::frame::events::SimpleServerEvent;
use crate::frame::Opcode;
use crate::query::QueryParams;

const CQL_VERSION: &str = "CQL_VERSION";
const CQL_VERSION_VAL: &str = "3.0.0";
const DRIVER_NAME: &str = "DRIVER_NAME";
const DRIVER_VERSION: &str = "DRIVER_VERSION";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RequestBody {
    Startup(BodyReqStartup),
    Options,
    Query(BodyReqQuery),
    Prepare(BodyReqPrepare),
    Execute(BodyReqExecute),
    Register(BodyReqRegister),
    AuthResponse(BodyReqAuthResponse),
}

impl RequestBody {
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestBody::Startup(_) => Opcode::Startup,
            RequestBody::Options => Opcode::Options,
            RequestBody::Query(_) => Opcode::Query,
            RequestBody::Prepare(_) => Opcode::Prepare,
            RequestBody::Execute(_) => Opcode::Execute,
            RequestBody::Register(_) => Opcode::Register,
            RequestBody::AuthResponse(_) => Opcode::AuthResponse,
        }
    }

    #[inline]
    pub fn new_startup() -> Self {
        RequestBody::Startup(BodyReqStartup::new())
    }

    #[inline]
    pub fn new_query(query: impl Into<String>, query_params: QueryParams) -> Self {
        RequestBody::Query(BodyReqQuery {
            query: query.into(),
            query_params,
        })
    }

    #[inline]
    pub fn new_prepare(query: impl Into<String>, keyspace: Option<String>) -> Self {
        RequestBody::Prepare(BodyReqPrepare {
            query: query.into(),
            keyspace,
        })
    }

    #[inline]
    pub fn new_execute(id: Vec<u8>, query_params: QueryParams) -> Self {
        RequestBody::Execute(BodyReqExecute { id, query_params })
    }

    #[inline]
    pub fn new_auth_response(data: Vec<u8>) -> Self {
        RequestBody::AuthResponse(BodyReqAuthResponse { data })
    }

    #[inline]
    pub fn new_register(events: Vec<SimpleServerEvent>) -> Self {
        RequestBody::Register(BodyReqRegister { events })
    }

    /// Query parameters for requests which carry them.
    pub fn query_params(&self) -> Option<&QueryParams> {
        match self {
            RequestBody::Query(query) => Some(&query.query_params),
            RequestBody::Execute(execute) => Some(&execute.query_params),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyReqStartup {
    pub map: HashMap<String, String>,
}

impl BodyReqStartup {
    pub fn new() -> BodyReqStartup {
        let mut map = HashMap::new();
        map.insert(CQL_VERSION.into(), CQL_VERSION_VAL.into());
        map.insert(DRIVER_NAME.into(), env!("CARGO_PKG_NAME").into());
        map.insert(DRIVER_VERSION.into(), env!("CARGO_PKG_VERSION").into());

        BodyReqStartup { map }
    }
}

impl Default for BodyReqStartup {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyReqQuery {
    pub query: String,
    pub query_params: QueryParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyReqPrepare {
    pub query: String,
    pub keyspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyReqExecute {
    pub id: Vec<u8>,
    pub query_params: QueryParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyReqRegister {
    pub events: Vec<SimpleServerEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyReqAuthResponse {
    pub data: Vec<u8>,
}
