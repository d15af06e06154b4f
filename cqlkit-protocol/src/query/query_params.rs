use serde::{Deserialize, Serialize};

use crate::consistency::Consistency;
use crate::query::query_values::QueryValues;

/// Protocol-level parameters sent along with `QUERY` and `EXECUTE` requests.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub consistency: Consistency,
    /// Set when `values` are bound by column name.
    pub with_names: bool,
    pub values: Option<QueryValues>,
    /// Maximum number of rows per result page.
    pub page_size: Option<i32>,
    /// Opaque position returned with the previous page.
    pub paging_state: Option<Vec<u8>>,
    /// Consistency of the conditional phase of lightweight transactions.
    pub serial_consistency: Option<Consistency>,
    /// Write timestamp in microseconds since the epoch.
    pub timestamp: Option<i64>,
    /// Not sent over the wire; lets retries and speculative executions know whether repeating
    /// the request is safe.
    pub is_idempotent: bool,
    /// Not sent over the wire; routing hint for the load balancer.
    pub keyspace: Option<String>,
}
