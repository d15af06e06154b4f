use serde::{Deserialize, Serialize};

use crate::frame::events::SchemaChange;
use crate::types::value::Value;

/// Kind of a `RESULT` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResResultBody {
    /// Result for statements which return nothing.
    Void,
    /// Result for `SELECT` statements.
    Rows(BodyResResultRows),
    /// Result of `USE <keyspace>`.
    SetKeyspace(BodyResResultSetKeyspace),
    /// Result of a `PREPARE` request.
    Prepared(BodyResResultPrepared),
    /// Result of a schema altering statement.
    SchemaChange(SchemaChange),
}

impl ResResultBody {
    pub fn into_rows(self) -> Option<BodyResResultRows> {
        match self {
            ResResultBody::Rows(rows_body) => Some(rows_body),
            _ => None,
        }
    }

    pub fn into_prepared(self) -> Option<BodyResResultPrepared> {
        match self {
            ResResultBody::Prepared(prepared_body) => Some(prepared_body),
            _ => None,
        }
    }

    pub fn as_set_keyspace(&self) -> Option<&BodyResResultSetKeyspace> {
        match self {
            ResResultBody::SetKeyspace(set_keyspace_body) => Some(set_keyspace_body),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyResResultSetKeyspace {
    /// It contains name of keyspace that was set.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyResResultRows {
    pub column_names: Vec<String>,
    pub rows_content: Vec<Vec<Value>>,
    pub paging_state: Option<Vec<u8>>,
}

impl BodyResResultRows {
    pub fn new(column_names: Vec<String>, rows_content: Vec<Vec<Value>>) -> Self {
        BodyResResultRows {
            column_names,
            rows_content,
            paging_state: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyResResultPrepared {
    /// Id of prepared query.
    pub id: Vec<u8>,
}
