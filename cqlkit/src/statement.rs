//! Statements executed by a session: plain CQL text or a prepared query, along with their
//! execution parameters.
mod statement_params;
mod statement_params_builder;

pub use crate::statement::statement_params::StatementParams;
pub use crate::statement::statement_params_builder::StatementParamsBuilder;

use std::sync::Arc;

use crate::consistency::Consistency;
use crate::frame::message_request::RequestBody;
use crate::query::{PreparedQuery, QueryParams};

/// A single request to execute.
#[derive(Debug, Clone)]
pub enum Statement {
    Query {
        query: String,
        params: StatementParams,
    },
    Prepared {
        prepared: Arc<PreparedQuery>,
        params: StatementParams,
    },
}

impl Statement {
    pub fn query(query: impl Into<String>, params: StatementParams) -> Self {
        Statement::Query {
            query: query.into(),
            params,
        }
    }

    pub fn prepared(prepared: Arc<PreparedQuery>, params: StatementParams) -> Self {
        Statement::Prepared { prepared, params }
    }

    #[inline]
    pub fn params(&self) -> &StatementParams {
        match self {
            Statement::Query { params, .. } | Statement::Prepared { params, .. } => params,
        }
    }

    #[inline]
    pub fn consistency(&self) -> Consistency {
        self.params().query_params.consistency
    }

    #[inline]
    pub fn is_idempotent(&self) -> bool {
        self.params().is_idempotent
    }

    /// Keyspace the statement operates on, if known. The keyspace of a prepared statement takes
    /// precedence.
    pub fn keyspace(&self) -> Option<&str> {
        match self {
            Statement::Prepared { prepared, params } => prepared
                .keyspace
                .as_deref()
                .or(params.keyspace.as_deref()),
            Statement::Query { params, .. } => params.keyspace.as_deref(),
        }
    }

    /// Builds the request to send, optionally overriding the consistency chosen by a retry
    /// policy.
    pub fn request(&self, consistency: Option<Consistency>) -> RequestBody {
        let query_params = |params: &StatementParams| QueryParams {
            consistency: consistency.unwrap_or(params.query_params.consistency),
            ..params.query_params.clone()
        };

        match self {
            Statement::Query { query, params } => {
                RequestBody::new_query(query.clone(), query_params(params))
            }
            Statement::Prepared { prepared, params } => {
                RequestBody::new_execute(prepared.id.clone(), query_params(params))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_override_consistency_in_request() {
        let statement = Statement::query(
            "SELECT * FROM ks.t",
            StatementParamsBuilder::new()
                .with_consistency(Consistency::Quorum)
                .build(),
        );

        let request = statement.request(Some(Consistency::One));
        assert_eq!(
            request.query_params().map(|params| params.consistency),
            Some(Consistency::One)
        );
        assert_eq!(
            statement
                .request(None)
                .query_params()
                .map(|params| params.consistency),
            Some(Consistency::Quorum)
        );
    }

    #[test]
    fn should_prefer_prepared_keyspace() {
        let prepared = Arc::new(PreparedQuery {
            id: vec![1],
            query: "SELECT * FROM t".into(),
            keyspace: Some("prepared_ks".into()),
        });

        let statement = Statement::prepared(
            prepared,
            StatementParamsBuilder::new()
                .with_keyspace("other_ks".into())
                .build(),
        );

        assert_eq!(statement.keyspace(), Some("prepared_ks"));
        assert!(matches!(
            statement.request(None),
            RequestBody::Execute(ref execute) if execute.id == vec![1]
        ));
    }
}
