use crate::consistency::Consistency;
use crate::error::Error;
use crate::frame::message_error::{
    AdditionalErrorInfo, ReadTimeoutError, UnavailableError, WriteTimeoutError, WriteType,
};

/// What to do with a request which failed with a server error, or whose connection was lost
/// after sending it.
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum RetryDecision {
    /// Return the error to the caller.
    Rethrow,
    /// Send the request again, optionally with another consistency. `same_host` retries on the
    /// node which returned the error, otherwise the next node in the query plan is used.
    Retry {
        consistency: Option<Consistency>,
        same_host: bool,
    },
    /// Pretend the request succeeded with an empty result.
    Ignore,
}

impl RetryDecision {
    #[inline]
    fn next_host() -> Self {
        RetryDecision::Retry {
            consistency: None,
            same_host: false,
        }
    }
}

/// Information about a failed query.
#[derive(Debug, Clone, Copy)]
pub struct QueryInfo<'a> {
    pub error: &'a Error,
    pub is_idempotent: bool,
    /// Consistency the failed attempt was sent with.
    pub consistency: Consistency,
    /// Number of retries already made for this request.
    pub retry_count: usize,
}

/// Query-specific information about current state of retrying.
pub trait RetrySession {
    /// Decide what to do with the failing query.
    fn decide(&mut self, query_info: QueryInfo) -> RetryDecision;
}

/// Retry policy determines what to do in case of a server error or a request lost in transit.
pub trait RetryPolicy {
    /// Called for each new query, starts a session of deciding about retries.
    fn new_session(&self) -> Box<dyn RetrySession + Send + Sync>;
}

/// Forwards all errors directly to the user, never retries
#[derive(Default, Debug, Clone, Copy)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession + Send + Sync> {
        Box::new(FallthroughRetrySession)
    }
}

struct FallthroughRetrySession;

impl RetrySession for FallthroughRetrySession {
    fn decide(&mut self, _query_info: QueryInfo) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Default retry policy - retries on another node when the coordinator was unable to handle
/// the request at all (overloaded, bootstrapping or failed truncation). Errors carrying
/// information about replicas, like timeouts or unavailability, are returned to the caller.
/// Requests lost together with their connection are sent to the next node only if they are
/// idempotent, since the lost one might have been executed.
#[derive(Default, Debug, Clone, Copy)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession + Send + Sync> {
        Box::new(DefaultRetrySession)
    }
}

#[derive(Default)]
pub struct DefaultRetrySession;

impl RetrySession for DefaultRetrySession {
    fn decide(&mut self, query_info: QueryInfo) -> RetryDecision {
        if query_info.error.is_connection_error() {
            return if query_info.is_idempotent {
                RetryDecision::next_host()
            } else {
                RetryDecision::Rethrow
            };
        }

        match query_info.error.server_error().map(|body| &body.additional_info) {
            Some(
                AdditionalErrorInfo::Overloaded
                | AdditionalErrorInfo::IsBootstrapping
                | AdditionalErrorInfo::Truncate,
            ) => RetryDecision::next_host(),
            _ => RetryDecision::Rethrow,
        }
    }
}

/// A retry policy that sometimes retries with a lower consistency level than the one initially
/// requested. Only the first failure of a request is considered; further ones are rethrown.
///
/// - read timeout: if fewer replicas responded than required, retries with the highest level
///   that can be met by those which did; if enough responded, but the data was not retrieved,
///   retries with the same level on the same node.
/// - write timeout: for idempotent writes, ignores the error of simple and logged batch writes
///   acknowledged by at least one replica, retries unlogged batches with a lower level and
///   batch log writes with the same level.
/// - unavailable: retries with the highest level that the alive replicas can satisfy.
///
/// Other errors are handled like in [`DefaultRetryPolicy`]. This policy may break consistency
/// guarantees the application relies on, so use it only when that is acceptable.
#[derive(Default, Debug, Clone, Copy)]
pub struct DowngradingConsistencyRetryPolicy;

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession + Send + Sync> {
        Box::new(DowngradingConsistencyRetrySession)
    }
}

struct DowngradingConsistencyRetrySession;

fn max_likely_to_work_consistency(known_ok: i32, current: Consistency) -> RetryDecision {
    let consistency = match known_ok {
        known_ok if known_ok >= 3 => Consistency::Three,
        2 => Consistency::Two,
        1 => Consistency::One,
        0 if current == Consistency::EachQuorum => Consistency::One,
        _ => return RetryDecision::Rethrow,
    };

    RetryDecision::Retry {
        consistency: Some(consistency),
        same_host: true,
    }
}

impl RetrySession for DowngradingConsistencyRetrySession {
    fn decide(&mut self, query_info: QueryInfo) -> RetryDecision {
        let Some(body) = query_info.error.server_error() else {
            return DefaultRetrySession.decide(query_info);
        };

        if query_info.retry_count > 0 {
            return RetryDecision::Rethrow;
        }

        match &body.additional_info {
            AdditionalErrorInfo::ReadTimeout(ReadTimeoutError {
                cl,
                received,
                block_for,
                data_present,
            }) => {
                if cl.is_serial() {
                    RetryDecision::Rethrow
                } else if received < block_for {
                    max_likely_to_work_consistency(*received, *cl)
                } else if !data_present {
                    RetryDecision::Retry {
                        consistency: None,
                        same_host: true,
                    }
                } else {
                    RetryDecision::Rethrow
                }
            }
            AdditionalErrorInfo::WriteTimeout(WriteTimeoutError {
                cl,
                received,
                write_type,
                ..
            }) if query_info.is_idempotent => match write_type {
                WriteType::Simple | WriteType::Batch if *received > 0 => RetryDecision::Ignore,
                WriteType::UnloggedBatch => max_likely_to_work_consistency(*received, *cl),
                WriteType::BatchLog => RetryDecision::Retry {
                    consistency: None,
                    same_host: true,
                },
                _ => RetryDecision::Rethrow,
            },
            AdditionalErrorInfo::Unavailable(UnavailableError { cl, alive, .. }) => {
                if cl.is_serial() {
                    RetryDecision::Rethrow
                } else {
                    max_likely_to_work_consistency(*alive, *cl)
                }
            }
            _ => DefaultRetrySession.decide(query_info),
        }
    }
}
