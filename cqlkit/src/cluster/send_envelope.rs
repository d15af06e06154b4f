use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::pending;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout, Sleep};
use tracing::*;

use crate::cluster::topology::Node;
use crate::cluster::ConnectionManager;
use crate::consistency::Consistency;
use crate::error::{Error, Result};
use crate::frame::message_error::AdditionalErrorInfo;
use crate::frame::message_request::RequestBody;
use crate::frame::message_response::ResponseBody;
use crate::load_balancing::QueryPlan;
use crate::query::PreparedQuery;
use crate::retry::{QueryInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::speculative_execution::{Context, SpeculativeExecutionPolicy};
use crate::statement::Statement;
use crate::transport::CqlTransport;

/// Response along with the node which coordinated the request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CoordinatedResponse {
    pub(crate) body: ResponseBody,
    pub(crate) coordinator: SocketAddr,
}

/// Execution policies applied to a single request.
#[derive(Clone, Copy)]
pub(crate) struct ExecutionPolicies<'a> {
    pub(crate) retry_policy: &'a (dyn RetryPolicy + Send + Sync),
    pub(crate) speculative_execution_policy: Option<&'a (dyn SpeculativeExecutionPolicy + Send + Sync)>,
    pub(crate) request_timeout: Option<Duration>,
}

type NodeErrors = Mutex<HashMap<SocketAddr, Error>>;

/// Sends a statement to the cluster, walking the query plan. Requests which never left the
/// driver move on to the next node, while server errors and connections lost mid-request are
/// handled by the retry policy. Idempotent statements may be
/// executed speculatively on following nodes, in which case the first response wins and other
/// executions are dropped. Returns [`Error::NoHostAvailable`] when the plan is exhausted.
pub(crate) async fn send_statement<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static>(
    query_plan: QueryPlan<T, CM>,
    statement: &Statement,
    policies: ExecutionPolicies<'_>,
) -> Result<CoordinatedResponse> {
    statement.params().validate()?;

    let query_plan = Mutex::new(query_plan);
    let errors = NodeErrors::default();

    let speculative_execution_policy = policies
        .speculative_execution_policy
        .filter(|_| statement.is_idempotent());

    let new_execution = || {
        execute(
            &query_plan,
            &errors,
            statement,
            policies.retry_policy.new_session(),
            policies.request_timeout,
        )
    };

    let mut executions = FuturesUnordered::new();
    executions.push(new_execution());

    let mut next_execution = schedule_execution(speculative_execution_policy, executions.len());

    loop {
        tokio::select! {
            outcome = executions.next() => match outcome {
                Some(Some(result)) => return result,
                // this execution ran out of nodes, but others might still succeed
                Some(None) if !executions.is_empty() => {}
                _ => {
                    let errors = errors.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    return Err(Error::NoHostAvailable { errors });
                }
            },
            _ = wait_for_execution(&mut next_execution) => {
                if has_remaining_nodes(&query_plan) {
                    debug!(running_executions = executions.len(), "Starting speculative execution.");
                    executions.push(new_execution());
                    next_execution =
                        schedule_execution(speculative_execution_policy, executions.len());
                } else {
                    next_execution = None;
                }
            }
        }
    }
}

/// Sends a request to the first node of the plan able to answer it, without consulting any
/// retry policy. Used for requests which are not statements, such as `PREPARE`.
pub(crate) async fn send_to_first_available<
    T: CqlTransport + 'static,
    CM: ConnectionManager<T> + 'static,
>(
    query_plan: QueryPlan<T, CM>,
    request: &RequestBody,
    request_timeout: Option<Duration>,
) -> Result<CoordinatedResponse> {
    let mut errors = HashMap::new();

    for node in query_plan {
        let addr = node.broadcast_rpc_address();
        let result = match node.persistent_connection().await {
            Ok(connection) => send_request(connection.as_ref(), request, request_timeout).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(body) => {
                return Ok(CoordinatedResponse {
                    body,
                    coordinator: addr,
                })
            }
            Err(error) if error.is_connection_error() => {
                debug!(%addr, %error, "Connection error, trying next node.");
                errors.insert(addr, error);
            }
            Err(error) => return Err(error),
        }
    }

    Err(Error::NoHostAvailable { errors })
}

fn schedule_execution(
    speculative_execution_policy: Option<&(dyn SpeculativeExecutionPolicy + Send + Sync)>,
    running_executions: usize,
) -> Option<Pin<Box<Sleep>>> {
    speculative_execution_policy
        .and_then(|policy| policy.execution_interval(&Context::new(running_executions)))
        .map(|delay| Box::pin(sleep(delay)))
}

async fn wait_for_execution(next_execution: &mut Option<Pin<Box<Sleep>>>) {
    match next_execution {
        Some(delay) => delay.as_mut().await,
        None => pending().await,
    }
}

fn has_remaining_nodes<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static>(
    query_plan: &Mutex<QueryPlan<T, CM>>,
) -> bool {
    query_plan
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remaining_nodes()
        .iter()
        .any(|node| node.is_available())
}

fn next_node<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static>(
    query_plan: &Mutex<QueryPlan<T, CM>>,
) -> Option<Arc<Node<T, CM>>> {
    query_plan
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next()
}

fn is_unprepared(error: &Error) -> bool {
    matches!(
        error.server_error().map(|body| &body.additional_info),
        Some(AdditionalErrorInfo::Unprepared(_))
    )
}

fn record_error(errors: &NodeErrors, addr: SocketAddr, error: Error) {
    errors
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(addr, error);
}

/// A single execution of a statement. Returns `None` if the query plan has been exhausted
/// without a definitive result.
async fn execute<T: CqlTransport + 'static, CM: ConnectionManager<T> + 'static>(
    query_plan: &Mutex<QueryPlan<T, CM>>,
    errors: &NodeErrors,
    statement: &Statement,
    mut retry_session: Box<dyn RetrySession + Send + Sync>,
    request_timeout: Option<Duration>,
) -> Option<Result<CoordinatedResponse>> {
    let mut retry_count = 0;
    let mut consistency: Option<Consistency> = None;
    let mut same_host: Option<Arc<Node<T, CM>>> = None;
    let mut reprepared_id: Option<Vec<u8>> = None;

    loop {
        let node = match same_host.take() {
            Some(node) => node,
            None => next_node(query_plan)?,
        };

        let addr = node.broadcast_rpc_address();

        let connection = match node.persistent_connection().await {
            Ok(connection) => connection,
            Err(error) => {
                debug!(%addr, %error, "Cannot borrow connection, trying next node.");
                record_error(errors, addr, error);
                continue;
            }
        };

        let mut request = statement.request(consistency);
        if let (RequestBody::Execute(execute_body), Some(id)) = (&mut request, &reprepared_id) {
            execute_body.id = id.clone();
        }

        let error = match send_request(connection.as_ref(), &request, request_timeout).await {
            Ok(body) => {
                return Some(Ok(CoordinatedResponse {
                    body,
                    coordinator: addr,
                }))
            }
            Err(error) => error,
        };

        if error.is_unsent_request_error() {
            debug!(%addr, %error, "Request not sent, trying next node.");
            record_error(errors, addr, error);
            continue;
        }

        if let (Statement::Prepared { prepared, .. }, true) = (statement, is_unprepared(&error)) {
            if reprepared_id.is_some() {
                return Some(Err(error));
            }

            debug!(%addr, query = %prepared.query, "Statement not prepared on node, preparing again.");

            match reprepare(connection.as_ref(), prepared, request_timeout).await {
                Ok(id) => {
                    reprepared_id = Some(id);
                    same_host = Some(node);
                }
                Err(error) if error.is_connection_error() => record_error(errors, addr, error),
                Err(error) => return Some(Err(error)),
            }

            continue;
        }

        // the request might have been executed, so only the retry policy can resend it
        if !error.is_server_error() && !error.is_connection_error() {
            return Some(Err(error));
        }

        let decision = retry_session.decide(QueryInfo {
            error: &error,
            is_idempotent: statement.is_idempotent(),
            consistency: consistency.unwrap_or_else(|| statement.consistency()),
            retry_count,
        });

        match decision {
            RetryDecision::Rethrow => return Some(Err(error)),
            RetryDecision::Ignore => {
                debug!(%addr, %error, "Ignoring error.");
                return Some(Ok(CoordinatedResponse {
                    body: ResponseBody::void(),
                    coordinator: addr,
                }));
            }
            RetryDecision::Retry {
                consistency: new_consistency,
                same_host: retry_same_host,
            } => {
                debug!(%addr, %error, ?new_consistency, retry_same_host, "Retrying request.");

                retry_count += 1;
                if new_consistency.is_some() {
                    consistency = new_consistency;
                }

                if retry_same_host {
                    same_host = Some(node);
                } else {
                    record_error(errors, addr, error);
                }
            }
        }
    }
}

async fn send_request<T: CqlTransport>(
    transport: &T,
    request: &RequestBody,
    request_timeout: Option<Duration>,
) -> Result<ResponseBody> {
    match request_timeout {
        Some(request_timeout) => timeout(request_timeout, transport.write_request(request))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "Request to {} timed out after {request_timeout:?}",
                    transport.address()
                ))
            })?,
        None => transport.write_request(request).await,
    }
}

async fn reprepare<T: CqlTransport>(
    transport: &T,
    prepared: &PreparedQuery,
    request_timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let response = send_request(
        transport,
        &RequestBody::new_prepare(prepared.query.clone(), prepared.keyspace.clone()),
        request_timeout,
    )
    .await?;

    let opcode = response.opcode();
    response
        .into_prepared()
        .map(|prepared| prepared.id)
        .ok_or(Error::UnexpectedResponse(opcode))
}

#[cfg(test)]
mod tests {
    use atomic::Atomic;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::cluster::connection_pool::{ConnectionPoolConfig, ConnectionPoolFactory};
    use crate::cluster::topology::{NodeDistance, NodeState};
    use crate::events::ServerEvent;
    use crate::frame::message_error::{
        ErrorBody, ReadTimeoutError, UnpreparedError, WriteTimeoutError, WriteType,
    };
    use crate::frame::message_result::{BodyResResultPrepared, ResResultBody};
    use crate::frame::Version;
    use crate::future::BoxFuture;
    use crate::load_balancing::tests::{node_addr, test_node_info};
    use crate::retry::{
        DefaultRetryPolicy, DowngradingConsistencyRetryPolicy, FallthroughRetryPolicy,
        NeverReconnectionPolicy,
    };
    use crate::speculative_execution::ConstantSpeculativeExecutionPolicy;
    use crate::statement::StatementParamsBuilder;
    use crate::transport::MockCqlTransport;

    #[derive(Clone)]
    enum Behavior {
        Respond,
        Fail(Error),
        ServerError(AdditionalErrorInfo),
        UnpreparedOnce(Arc<AtomicBool>),
        Hang,
    }

    type RequestLog = Arc<Mutex<Vec<(SocketAddr, RequestBody)>>>;

    struct ScriptedConnectionManager {
        behaviors: HashMap<SocketAddr, Behavior>,
        log: RequestLog,
    }

    impl ConnectionManager<MockCqlTransport> for ScriptedConnectionManager {
        fn connection(
            &self,
            _event_handler: Option<mpsc::Sender<ServerEvent>>,
            _error_handler: Option<mpsc::Sender<Error>>,
            addr: SocketAddr,
            _version: Version,
        ) -> BoxFuture<'_, Result<MockCqlTransport>> {
            let behavior = self.behaviors.get(&addr).cloned().unwrap_or(Behavior::Respond);
            let log = self.log.clone();

            async move {
                let mut transport = MockCqlTransport::new();
                transport.expect_is_broken().return_const(false);
                transport.expect_address().return_const(addr);
                transport.expect_in_flight().return_const(0usize);
                transport.expect_version().return_const(Version::V4);
                transport.expect_close().return_const(());
                transport.expect_write_request().returning(move |request| {
                    if matches!(request, RequestBody::Options) {
                        return async { Ok(ResponseBody::Supported(Default::default())) }.boxed();
                    }

                    log.lock().unwrap().push((addr, request.clone()));

                    let server_error = |info| Error::Server {
                        body: ErrorBody::new("error", info),
                        addr,
                    };

                    let response = match (&behavior, request) {
                        (Behavior::Hang, _) => return pending().boxed(),
                        (_, RequestBody::Prepare(_)) => {
                            Ok(ResponseBody::Result(ResResultBody::Prepared(
                                BodyResResultPrepared { id: vec![2] },
                            )))
                        }
                        (Behavior::Respond, _) => Ok(ResponseBody::void()),
                        (Behavior::Fail(error), _) => Err(error.clone()),
                        (Behavior::ServerError(info), _) => Err(server_error(info.clone())),
                        (Behavior::UnpreparedOnce(failed), _) => {
                            if failed.swap(true, Ordering::SeqCst) {
                                Ok(ResponseBody::void())
                            } else {
                                Err(server_error(AdditionalErrorInfo::Unprepared(
                                    UnpreparedError { id: vec![1] },
                                )))
                            }
                        }
                    };

                    async move { response }.boxed()
                });

                Ok(transport)
            }
            .boxed()
        }
    }

    type TestPlan = QueryPlan<MockCqlTransport, ScriptedConnectionManager>;

    fn query_plan(behaviors: Vec<Behavior>) -> (TestPlan, RequestLog) {
        let log = RequestLog::default();
        let connection_manager = Arc::new(ScriptedConnectionManager {
            behaviors: behaviors
                .into_iter()
                .enumerate()
                .map(|(index, behavior)| (node_addr(index as u8 + 1), behavior))
                .collect(),
            log: log.clone(),
        });

        let (_, keyspace_receiver) = watch::channel(None);
        let factory = Arc::new(ConnectionPoolFactory::new(
            ConnectionPoolConfig::default().with_heartbeat_interval(None),
            Arc::new(Atomic::new(Version::V4)),
            connection_manager.clone(),
            keyspace_receiver,
            Arc::new(NeverReconnectionPolicy),
        ));

        let nodes = (1..=connection_manager.behaviors.len() as u8)
            .map(|last_octet| {
                Arc::new(Node::with_node_info(
                    factory.clone(),
                    test_node_info(last_octet, "dc1"),
                    NodeDistance::Local,
                    NodeState::Up,
                ))
            })
            .collect();

        (QueryPlan::new(nodes), log)
    }

    fn statement(is_idempotent: bool) -> Statement {
        Statement::query(
            "SELECT * FROM ks.t",
            StatementParamsBuilder::new()
                .with_consistency(Consistency::Quorum)
                .idempotent(is_idempotent)
                .build(),
        )
    }

    fn policies<'a>(
        retry_policy: &'a (dyn RetryPolicy + Send + Sync),
        speculative_execution_policy: Option<&'a (dyn SpeculativeExecutionPolicy + Send + Sync)>,
    ) -> ExecutionPolicies<'a> {
        ExecutionPolicies {
            retry_policy,
            speculative_execution_policy,
            request_timeout: None,
        }
    }

    fn coordinators(log: &RequestLog) -> Vec<SocketAddr> {
        log.lock().unwrap().iter().map(|(addr, _)| *addr).collect()
    }

    #[tokio::test]
    async fn should_move_idempotent_statement_to_next_node_on_connection_error() {
        let (plan, log) = query_plan(vec![
            Behavior::Fail(Error::ConnectionClosed(node_addr(1))),
            Behavior::Respond,
        ]);

        let response = send_statement(plan, &statement(true), policies(&DefaultRetryPolicy, None))
            .await
            .unwrap();

        assert_eq!(response.coordinator, node_addr(2));
        assert_eq!(coordinators(&log), vec![node_addr(1), node_addr(2)]);
    }

    #[tokio::test]
    async fn should_not_resend_non_idempotent_statement_after_connection_loss() {
        let (plan, log) = query_plan(vec![
            Behavior::Fail(Error::ConnectionClosed(node_addr(1))),
            Behavior::Respond,
        ]);

        let result =
            send_statement(plan, &statement(false), policies(&DefaultRetryPolicy, None)).await;

        assert!(matches!(result, Err(Error::ConnectionClosed(addr)) if addr == node_addr(1)));
        assert_eq!(coordinators(&log), vec![node_addr(1)]);
    }

    #[tokio::test]
    async fn should_move_non_idempotent_statement_on_when_node_is_busy() {
        let (plan, log) = query_plan(vec![
            Behavior::Fail(Error::Busy(node_addr(1))),
            Behavior::Respond,
        ]);

        let response = send_statement(plan, &statement(false), policies(&DefaultRetryPolicy, None))
            .await
            .unwrap();

        assert_eq!(response.coordinator, node_addr(2));
        assert_eq!(coordinators(&log), vec![node_addr(1), node_addr(2)]);
    }

    #[tokio::test]
    async fn should_fail_with_all_node_errors() {
        let (plan, _) = query_plan(vec![
            Behavior::Fail(Error::ConnectionClosed(node_addr(1))),
            Behavior::Fail(Error::Busy(node_addr(2))),
        ]);

        match send_statement(plan, &statement(true), policies(&DefaultRetryPolicy, None)).await {
            Err(Error::NoHostAvailable { errors }) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(errors[&node_addr(2)], Error::Busy(_)));
            }
            result => panic!("Unexpected result: {result:?}"),
        }
    }

    #[tokio::test]
    async fn should_fail_on_empty_plan() {
        let (plan, _) = query_plan(vec![]);

        assert!(matches!(
            send_statement(plan, &statement(true), policies(&DefaultRetryPolicy, None)).await,
            Err(Error::NoHostAvailable { errors }) if errors.is_empty()
        ));
    }

    #[tokio::test]
    async fn should_retry_overloaded_on_next_node() {
        let (plan, _) = query_plan(vec![
            Behavior::ServerError(AdditionalErrorInfo::Overloaded),
            Behavior::Respond,
        ]);

        let response = send_statement(plan, &statement(false), policies(&DefaultRetryPolicy, None))
            .await
            .unwrap();

        assert_eq!(response.coordinator, node_addr(2));
    }

    #[tokio::test]
    async fn should_rethrow_read_timeout() {
        let (plan, log) = query_plan(vec![
            Behavior::ServerError(AdditionalErrorInfo::ReadTimeout(ReadTimeoutError {
                cl: Consistency::Quorum,
                received: 1,
                block_for: 2,
                data_present: false,
            })),
            Behavior::Respond,
        ]);

        let result =
            send_statement(plan, &statement(true), policies(&DefaultRetryPolicy, None)).await;

        assert!(matches!(
            result.unwrap_err().server_error().map(|body| &body.additional_info),
            Some(AdditionalErrorInfo::ReadTimeout(_))
        ));
        assert_eq!(coordinators(&log), vec![node_addr(1)]);
    }

    #[tokio::test]
    async fn should_downgrade_consistency_on_same_node() {
        let (plan, log) = query_plan(vec![
            Behavior::ServerError(AdditionalErrorInfo::ReadTimeout(ReadTimeoutError {
                cl: Consistency::Quorum,
                received: 1,
                block_for: 2,
                data_present: false,
            })),
            Behavior::Respond,
        ]);

        let result = send_statement(
            plan,
            &statement(true),
            policies(&DowngradingConsistencyRetryPolicy, None),
        )
        .await;

        // the retried request fails again and is rethrown after the single downgrade
        assert!(result.is_err());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].0, node_addr(1));
        assert_eq!(
            log[1].1.query_params().map(|params| params.consistency),
            Some(Consistency::One)
        );
    }

    #[tokio::test]
    async fn should_ignore_write_timeout_with_acknowledged_writes() {
        let (plan, _) = query_plan(vec![Behavior::ServerError(AdditionalErrorInfo::WriteTimeout(
            WriteTimeoutError {
                cl: Consistency::Quorum,
                received: 1,
                block_for: 2,
                write_type: WriteType::Simple,
            },
        ))]);

        let response = send_statement(
            plan,
            &statement(true),
            policies(&DowngradingConsistencyRetryPolicy, None),
        )
        .await
        .unwrap();

        assert_eq!(response.body, ResponseBody::void());
    }

    #[tokio::test]
    async fn should_reprepare_once() {
        let (plan, log) = query_plan(vec![Behavior::UnpreparedOnce(Default::default())]);
        let prepared = Arc::new(PreparedQuery {
            id: vec![1],
            query: "SELECT * FROM ks.t".into(),
            keyspace: None,
        });

        let response = send_statement(
            plan,
            &Statement::prepared(prepared, Default::default()),
            policies(&DefaultRetryPolicy, None),
        )
        .await
        .unwrap();

        assert_eq!(response.coordinator, node_addr(1));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert!(matches!(log[1].1, RequestBody::Prepare(_)));
        assert!(matches!(&log[2].1, RequestBody::Execute(execute) if execute.id == vec![2]));
    }

    #[tokio::test]
    async fn should_reject_invalid_statement_before_sending() {
        let (plan, log) = query_plan(vec![Behavior::Respond]);
        let statement = Statement::query(
            "SELECT * FROM ks.t",
            StatementParamsBuilder::new()
                .with_consistency(Consistency::Serial)
                .build(),
        );

        assert!(matches!(
            send_statement(plan, &statement, policies(&DefaultRetryPolicy, None)).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    fn with_request_timeout(
        retry_policy: &(dyn RetryPolicy + Send + Sync),
    ) -> ExecutionPolicies<'_> {
        ExecutionPolicies {
            request_timeout: Some(Duration::from_millis(50)),
            ..policies(retry_policy, None)
        }
    }

    #[tokio::test]
    async fn should_time_out_idempotent_attempt_and_move_on() {
        let (plan, log) = query_plan(vec![Behavior::Hang, Behavior::Respond]);

        let response = send_statement(
            plan,
            &statement(true),
            with_request_timeout(&DefaultRetryPolicy),
        )
        .await
        .unwrap();

        assert_eq!(response.coordinator, node_addr(2));
        assert_eq!(coordinators(&log), vec![node_addr(1), node_addr(2)]);
    }

    #[tokio::test]
    async fn should_fail_timed_out_non_idempotent_attempt() {
        let (plan, log) = query_plan(vec![Behavior::Hang, Behavior::Respond]);

        let result = send_statement(
            plan,
            &statement(false),
            with_request_timeout(&DefaultRetryPolicy),
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(coordinators(&log), vec![node_addr(1)]);
    }

    #[tokio::test]
    async fn should_rethrow_timeout_with_fallthrough_policy() {
        let (plan, log) = query_plan(vec![Behavior::Hang, Behavior::Respond]);

        let result = send_statement(
            plan,
            &statement(true),
            with_request_timeout(&FallthroughRetryPolicy),
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(coordinators(&log), vec![node_addr(1)]);
    }

    #[tokio::test]
    async fn should_speculatively_execute_idempotent_statement() {
        let (plan, log) = query_plan(vec![Behavior::Hang, Behavior::Respond]);
        let speculative_execution_policy =
            ConstantSpeculativeExecutionPolicy::new(2, Duration::from_millis(50));

        let response = timeout(
            Duration::from_secs(5),
            send_statement(
                plan,
                &statement(true),
                policies(&DefaultRetryPolicy, Some(&speculative_execution_policy)),
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.coordinator, node_addr(2));
        assert_eq!(coordinators(&log), vec![node_addr(1), node_addr(2)]);
    }

    #[tokio::test]
    async fn should_never_speculatively_execute_non_idempotent_statement() {
        let (plan, log) = query_plan(vec![Behavior::Hang, Behavior::Respond]);
        let speculative_execution_policy =
            ConstantSpeculativeExecutionPolicy::new(2, Duration::from_millis(10));

        let result = timeout(
            Duration::from_millis(200),
            send_statement(
                plan,
                &statement(false),
                policies(&DefaultRetryPolicy, Some(&speculative_execution_policy)),
            ),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(coordinators(&log), vec![node_addr(1)]);
    }

    #[tokio::test]
    async fn should_prepare_on_first_available_node() {
        let (plan, log) = query_plan(vec![Behavior::Hang, Behavior::Respond]);

        let response = send_to_first_available(
            plan,
            &RequestBody::new_prepare("SELECT * FROM ks.t", None),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        assert_eq!(response.coordinator, node_addr(2));
        assert_eq!(response.body.into_prepared().map(|prepared| prepared.id), Some(vec![2]));
        assert_eq!(coordinators(&log), vec![node_addr(1), node_addr(2)]);
    }

    #[tokio::test]
    async fn should_count_retries_per_execution() {
        let attempts = Arc::new(AtomicUsize::new(0));

        struct CountingRetryPolicy(Arc<AtomicUsize>);
        struct CountingRetrySession(Arc<AtomicUsize>);

        impl RetryPolicy for CountingRetryPolicy {
            fn new_session(&self) -> Box<dyn RetrySession + Send + Sync> {
                Box::new(CountingRetrySession(self.0.clone()))
            }
        }

        impl RetrySession for CountingRetrySession {
            fn decide(&mut self, query_info: QueryInfo) -> RetryDecision {
                self.0.store(query_info.retry_count, Ordering::SeqCst);
                if query_info.retry_count < 2 {
                    RetryDecision::Retry {
                        consistency: None,
                        same_host: true,
                    }
                } else {
                    RetryDecision::Rethrow
                }
            }
        }

        let (plan, log) = query_plan(vec![Behavior::ServerError(AdditionalErrorInfo::Overloaded)]);
        let retry_policy = CountingRetryPolicy(attempts.clone());

        assert!(
            send_statement(plan, &statement(false), policies(&retry_policy, None))
                .await
                .is_err()
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(log.lock().unwrap().len(), 3);
    }
}
