//! Pre-emptively query another node if the current one takes too long to respond.
//!
//! A node can be slow to reply for reasons unrelated to the request itself, e.g. a long GC
//! pause. With a speculative execution policy, the driver sends the same request to the next
//! node of the query plan when no response arrived within the policy delay. The first successful
//! response wins and the remaining executions are abandoned.
//!
//! Only idempotent statements are executed speculatively, since more than one node might apply
//! the same mutation. Each execution is retried independently according to the retry policy.

use derive_more::Constructor;
use std::time::Duration;

/// Current speculative execution context.
#[derive(Constructor, Debug, Clone, Copy)]
pub struct Context {
    /// Executions started so far, including the initial one.
    pub running_executions: usize,
}

/// The policy that decides if the driver will send speculative queries to the next nodes when the
/// current node takes too long to respond.
pub trait SpeculativeExecutionPolicy {
    /// Returns the time until a speculative request is sent to the next node. `None` means there
    /// should not be another execution.
    fn execution_interval(&self, context: &Context) -> Option<Duration>;
}

/// A policy that schedules a configurable number of speculative executions, separated by a fixed
/// delay. `max_executions` counts the initial execution, so a value of 2 allows one speculative
/// execution.
#[derive(Debug, Clone, Copy, Constructor)]
pub struct ConstantSpeculativeExecutionPolicy {
    max_executions: usize,
    delay: Duration,
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn execution_interval(&self, context: &Context) -> Option<Duration> {
        if context.running_executions < self.max_executions {
            Some(self.delay)
        } else {
            None
        }
    }
}
