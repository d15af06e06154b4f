use derivative::Derivative;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::query::QueryParams;
use crate::retry::RetryPolicy;
use crate::speculative_execution::SpeculativeExecutionPolicy;

/// Parameters of a statement: protocol-level ones and those driving execution.
#[derive(Default, Clone, Derivative)]
#[derivative(Debug)]
pub struct StatementParams {
    /// Protocol-level parameters.
    pub query_params: QueryParams,
    /// Is the query idempotent. Only idempotent statements are executed speculatively.
    pub is_idempotent: bool,
    /// Query keyspace. If not using a global one, setting it explicitly might help the load
    /// balancer use more appropriate nodes. Note: prepared statements with keyspace information
    /// take precedence over this field.
    pub keyspace: Option<String>,
    /// Custom statement speculative execution policy.
    #[derivative(Debug = "ignore")]
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy + Send + Sync>>,
    /// Custom statement retry policy.
    #[derivative(Debug = "ignore")]
    pub retry_policy: Option<Arc<dyn RetryPolicy + Send + Sync>>,
    /// Timeout of a single attempt, overriding the session one.
    pub request_timeout: Option<Duration>,
}

impl StatementParams {
    /// Checks the parameters can be sent at all. Serial consistencies are only valid as the
    /// serial consistency of a statement, and vice versa.
    pub fn validate(&self) -> Result<()> {
        let consistency = self.query_params.consistency;
        if consistency.is_serial() {
            return Err(Error::InvalidRequest(format!(
                "Serial consistency {consistency} can only be used as serial consistency"
            )));
        }

        match self.query_params.serial_consistency {
            Some(serial_consistency) if !serial_consistency.is_serial() => {
                Err(Error::InvalidRequest(format!(
                    "Serial consistency can only be Serial or LocalSerial, got {serial_consistency}"
                )))
            }
            _ => Ok(()),
        }
    }
}
