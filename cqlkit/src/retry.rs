//! Policies deciding what happens after a failure: whether a request should be sent again, and
//! when to try reconnecting to a node.
mod reconnection_policy;
mod retry_policy;

pub use crate::retry::reconnection_policy::{
    ConstantReconnectionPolicy, ExponentialReconnectionPolicy, NeverReconnectionPolicy,
    ReconnectionPolicy, ReconnectionSchedule,
};
pub use crate::retry::retry_policy::{
    DefaultRetryPolicy, DefaultRetrySession, DowngradingConsistencyRetryPolicy,
    FallthroughRetryPolicy, QueryInfo, RetryDecision, RetryPolicy, RetrySession,
};

#[cfg(test)]
pub(crate) use crate::retry::reconnection_policy::MockReconnectionPolicy;
