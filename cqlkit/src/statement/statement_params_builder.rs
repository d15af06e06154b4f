use std::sync::Arc;
use std::time::Duration;

use crate::consistency::Consistency;
use crate::query::QueryValues;
use crate::retry::RetryPolicy;
use crate::speculative_execution::SpeculativeExecutionPolicy;
use crate::statement::StatementParams;

/// Fluent construction of [`StatementParams`]. Every setter consumes and returns the builder,
/// so parameters can be assembled in a single expression.
#[derive(Default, Debug)]
pub struct StatementParamsBuilder {
    params: StatementParams,
}

impl From<StatementParams> for StatementParamsBuilder {
    /// Continues building from already assembled parameters.
    fn from(params: StatementParams) -> Self {
        StatementParamsBuilder { params }
    }
}

impl StatementParamsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    #[must_use]
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.params.query_params.consistency = consistency;
        self
    }

    /// Binds values. Named values switch the request to by-name binding.
    #[must_use]
    pub fn with_values(mut self, values: QueryValues) -> Self {
        self.params.query_params.with_names = values.has_names();
        self.params.query_params.values = Some(values);
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, size: i32) -> Self {
        self.params.query_params.page_size = Some(size);
        self
    }

    /// Resumes a paged read from a state returned with a previous page.
    #[must_use]
    pub fn with_paging_state(mut self, state: Vec<u8>) -> Self {
        self.params.query_params.paging_state = Some(state);
        self
    }

    /// Consistency of the Paxos phase of conditional updates.
    #[must_use]
    pub fn with_serial_consistency(mut self, serial_consistency: Consistency) -> Self {
        self.params.query_params.serial_consistency = Some(serial_consistency);
        self
    }

    /// Client-side write timestamp in microseconds.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.params.query_params.timestamp = Some(timestamp);
        self
    }

    /// Keyspace used for routing. Does not change the keyspace of the session.
    #[must_use]
    pub fn with_keyspace(mut self, keyspace: String) -> Self {
        self.params.query_params.keyspace = Some(keyspace.clone());
        self.params.keyspace = Some(keyspace);
        self
    }

    /// Idempotent statements may be retried after ambiguous failures and executed
    /// speculatively.
    #[must_use]
    pub fn idempotent(mut self, value: bool) -> Self {
        self.params.query_params.is_idempotent = value;
        self.params.is_idempotent = value;
        self
    }

    #[must_use]
    pub fn with_speculative_execution_policy(
        mut self,
        policy: Arc<dyn SpeculativeExecutionPolicy + Send + Sync>,
    ) -> Self {
        self.params.speculative_execution_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy + Send + Sync>) -> Self {
        self.params.retry_policy = Some(policy);
        self
    }

    /// Limits each attempt of the statement, not the whole execution.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.params.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn build(self) -> StatementParams {
        self.params
    }
}
