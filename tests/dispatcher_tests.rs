use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tableroute::{
    CallContext, CancellationToken, ClientError, DispatchSettings, Dispatcher, Point,
    RemoteCallGateway, RemoteError, RequestContext, Route, RouteMap, RouteResolver,
    SqlQueryRequest, SqlQueryResponse, WriteRequest, WriteResponse, status,
};

#[derive(Default)]
struct RecordingResolver {
    owners: HashMap<String, String>,
    failure: Option<RemoteError>,
    route_calls: AtomicUsize,
    cleared: Mutex<Vec<Vec<String>>>,
}

impl RecordingResolver {
    fn with_owners(owners: &[(&str, &str)]) -> Self {
        Self {
            owners: owners
                .iter()
                .map(|(table, endpoint)| (table.to_string(), endpoint.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    fn failing(error: RemoteError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    fn route_calls(&self) -> usize {
        self.route_calls.load(Ordering::SeqCst)
    }

    fn cleared(&self) -> Vec<Vec<String>> {
        self.cleared.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteResolver for RecordingResolver {
    async fn route_for(
        &self,
        _req_ctx: &RequestContext,
        tables: &[String],
    ) -> Result<RouteMap, RemoteError> {
        self.route_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(tables
            .iter()
            .filter_map(|table| {
                self.owners
                    .get(table)
                    .map(|endpoint| (table.clone(), Route::new(table.clone(), endpoint.clone())))
            })
            .collect())
    }

    fn clear_route_for(&self, tables: &[String]) {
        self.cleared.lock().unwrap().push(tables.to_vec());
    }
}

#[derive(Default)]
struct ScriptedGateway {
    failures: HashMap<String, RemoteError>,
    latency: HashMap<String, Duration>,
    // cancels the caller's context after serving this endpoint
    cancel_after: Option<String>,
    calls: Mutex<Vec<String>>,
    databases: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn failing_on(endpoint: &str, error: RemoteError) -> Self {
        let mut gateway = Self::default();
        gateway.failures.insert(endpoint.to_string(), error);
        gateway
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteCallGateway for ScriptedGateway {
    async fn query(
        &self,
        _ctx: &CallContext,
        endpoint: &str,
        req: &SqlQueryRequest,
    ) -> Result<SqlQueryResponse, RemoteError> {
        self.calls.lock().unwrap().push(endpoint.to_string());
        self.databases
            .lock()
            .unwrap()
            .push(req.req_ctx.database.clone());
        if let Some(err) = self.failures.get(endpoint) {
            return Err(err.clone());
        }
        Ok(SqlQueryResponse {
            sql: req.sql.clone(),
            affected_rows: 0,
            rows: Vec::new(),
        })
    }

    async fn write(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        req_ctx: &RequestContext,
        points: &[Point],
    ) -> Result<WriteResponse, RemoteError> {
        self.calls.lock().unwrap().push(endpoint.to_string());
        self.databases.lock().unwrap().push(req_ctx.database.clone());
        if let Some(latency) = self.latency.get(endpoint) {
            tokio::time::sleep(*latency).await;
        }
        if let Some(err) = self.failures.get(endpoint) {
            return Err(err.clone());
        }
        if self.cancel_after.as_deref() == Some(endpoint) {
            ctx.cancellation_token().cancel();
        }
        Ok(WriteResponse::succeeded(points.len() as u32))
    }
}

fn point(table: &str, ts: i64) -> Point {
    Point::builder(table)
        .timestamp(ts)
        .tag("host", "h1")
        .field("value", ts)
        .build()
        .unwrap()
}

fn dispatcher(
    resolver: &Arc<RecordingResolver>,
    gateway: &Arc<ScriptedGateway>,
    settings: DispatchSettings,
) -> Dispatcher {
    Dispatcher::new_with_settings(resolver.clone(), gateway.clone(), settings)
}

fn with_default_db() -> DispatchSettings {
    DispatchSettings {
        default_database: Some("public".to_string()),
        ..DispatchSettings::default()
    }
}

fn tables(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn partial_write_failure_is_aggregated_and_clears_only_failing_tables() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[
        ("cpu", "node-a"),
        ("mem", "node-b"),
    ]));
    let b_error = RemoteError::server(status::INVALID_ROUTE, "table mem moved");
    let gateway = Arc::new(ScriptedGateway::failing_on("node-b", b_error.clone()));
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let points = vec![
        point("cpu", 1),
        point("mem", 2),
        point("cpu", 3),
        point("mem", 4),
        point("cpu", 5),
    ];
    let resp = dispatcher
        .write(&CallContext::background(), WriteRequest::new(points))
        .await
        .unwrap();

    assert_eq!(resp.success, 3);
    assert_eq!(resp.failed, 2);
    assert_eq!(resp.message, Some(b_error.to_string()));
    assert_eq!(resolver.cleared(), vec![tables(&["mem"])]);
    assert_eq!(gateway.calls(), vec!["node-a", "node-b"]);
}

#[tokio::test]
async fn first_failing_endpoint_message_wins() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[
        ("a", "node-1"),
        ("b", "node-2"),
        ("c", "node-3"),
    ]));
    let mut gateway = ScriptedGateway::default();
    gateway.failures.insert(
        "node-2".to_string(),
        RemoteError::server(status::INTERNAL, "node-2 broke"),
    );
    gateway.failures.insert(
        "node-3".to_string(),
        RemoteError::server(status::INTERNAL, "node-3 broke"),
    );
    let gateway = Arc::new(gateway);
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let resp = dispatcher
        .write(
            &CallContext::background(),
            WriteRequest::new(vec![point("c", 1), point("b", 2), point("a", 3)]),
        )
        .await
        .unwrap();

    assert_eq!((resp.success, resp.failed), (1, 2));
    assert!(resp.message.unwrap().contains("node-2 broke"));
    // INTERNAL is not a routing signal.
    assert!(resolver.cleared().is_empty());
}

#[tokio::test]
async fn concurrent_partitions_keep_deterministic_aggregation() {
    let owners: Vec<(String, String)> = (0..6)
        .map(|i| (format!("t{}", i), format!("node-{}", i)))
        .collect();
    let owner_refs: Vec<(&str, &str)> = owners
        .iter()
        .map(|(t, e)| (t.as_str(), e.as_str()))
        .collect();
    let resolver = Arc::new(RecordingResolver::with_owners(&owner_refs));

    let mut gateway = ScriptedGateway::default();
    for i in [1, 4] {
        gateway.failures.insert(
            format!("node-{}", i),
            RemoteError::connection(format!("node-{} down", i)),
        );
    }
    // The lowest failing endpoint answers last.
    gateway
        .latency
        .insert("node-1".to_string(), Duration::from_millis(50));
    let gateway = Arc::new(gateway);
    let dispatcher = dispatcher(
        &resolver,
        &gateway,
        DispatchSettings {
            write_concurrency: 6,
            ..with_default_db()
        },
    );

    let points: Vec<Point> = (0..30).map(|i| point(&format!("t{}", i % 6), i + 1)).collect();
    let resp = dispatcher
        .write(&CallContext::background(), WriteRequest::new(points))
        .await
        .unwrap();

    assert_eq!(resp.success + resp.failed, 30);
    assert_eq!(resp.failed, 10);
    assert!(resp.message.unwrap().contains("node-1 down"));
    let mut cleared = resolver.cleared();
    cleared.sort();
    assert_eq!(cleared, vec![tables(&["t1"]), tables(&["t4"])]);
}

#[tokio::test]
async fn empty_query_tables_never_reach_the_resolver() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let err = dispatcher
        .query(
            &CallContext::background(),
            SqlQueryRequest::new(Vec::new(), "SELECT 1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NullRequestTables));
    assert_eq!(resolver.route_calls(), 0);
}

#[tokio::test]
async fn empty_write_never_reaches_the_resolver() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let err = dispatcher
        .write(&CallContext::background(), WriteRequest::new(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NullRows));
    assert_eq!(resolver.route_calls(), 0);
}

#[tokio::test]
async fn missing_database_is_rejected_before_resolution() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, DispatchSettings::default());
    let ctx = CallContext::background();

    let err = dispatcher
        .query(&ctx, SqlQueryRequest::new(tables(&["cpu"]), "SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NoDatabaseSelected));

    let err = dispatcher
        .write(&ctx, WriteRequest::new(vec![point("cpu", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NoDatabaseSelected));
    assert_eq!(resolver.route_calls(), 0);
}

#[tokio::test]
async fn request_database_takes_precedence_over_default() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());
    let ctx = CallContext::background();

    dispatcher
        .write(&ctx, WriteRequest::new(vec![point("cpu", 1)]).database("metrics"))
        .await
        .unwrap();
    dispatcher
        .query(&ctx, SqlQueryRequest::new(tables(&["cpu"]), "SELECT 1"))
        .await
        .unwrap();
    assert_eq!(*gateway.databases.lock().unwrap(), vec!["metrics", "public"]);
}

#[tokio::test]
async fn routing_failure_is_wrapped_and_no_call_is_made() {
    let resolver = Arc::new(RecordingResolver::failing(RemoteError::connection(
        "meta unreachable",
    )));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());
    let ctx = CallContext::background();

    let err = dispatcher
        .query(&ctx, SqlQueryRequest::new(tables(&["cpu", "mem"]), "SELECT 1"))
        .await
        .unwrap_err();
    match err {
        ClientError::RoutingFailed { tables: names, .. } => {
            assert_eq!(names, tables(&["cpu", "mem"]))
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = dispatcher
        .write(&ctx, WriteRequest::new(vec![point("cpu", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RoutingFailed { .. }));
    assert!(gateway.calls().is_empty());
    // Resolver failures are not route invalidations.
    assert!(resolver.cleared().is_empty());
}

#[tokio::test]
async fn query_without_route_for_first_table_fails_with_empty_route() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("mem", "node-b")]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let err = dispatcher
        .query(
            &CallContext::background(),
            SqlQueryRequest::new(tables(&["cpu", "mem"]), "SELECT 1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::EmptyRoute(table) if table == "cpu"));
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn query_uses_first_table_route() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[
        ("cpu", "node-a"),
        ("mem", "node-b"),
    ]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let resp = dispatcher
        .query(
            &CallContext::background(),
            SqlQueryRequest::new(tables(&["mem", "cpu"]), "SELECT * FROM mem"),
        )
        .await
        .unwrap();
    assert_eq!(resp.sql, "SELECT * FROM mem");
    assert_eq!(gateway.calls(), vec!["node-b"]);
}

#[tokio::test]
async fn write_with_unroutable_table_fails_with_split_error() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let err = dispatcher
        .write(
            &CallContext::background(),
            WriteRequest::new(vec![point("cpu", 1), point("disk", 2)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SplitFailed(table) if table == "disk"));
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn query_connection_error_clears_request_routes() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::failing_on(
        "node-a",
        RemoteError::Transport("grpc: connection error: refused".to_string()),
    ));
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());
    let req = SqlQueryRequest::new(tables(&["cpu"]), "SELECT 1");

    let err = dispatcher
        .query(&CallContext::background(), req)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::RemoteCallFailed {
            operation: "query",
            ..
        }
    ));
    assert_eq!(resolver.cleared(), vec![tables(&["cpu"])]);
}

#[tokio::test]
async fn query_argument_error_keeps_routes() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::failing_on(
        "node-a",
        RemoteError::server(status::INVALID_ARGUMENT, "syntax error"),
    ));
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());
    let req = SqlQueryRequest::new(tables(&["cpu"]), "SELECT 1");

    let err = dispatcher
        .query(&CallContext::background(), req)
        .await
        .unwrap_err();
    assert_eq!(
        err.remote().and_then(|e| e.code()),
        Some(status::INVALID_ARGUMENT)
    );
    assert!(resolver.cleared().is_empty());
}

#[tokio::test]
async fn cancelled_context_is_rejected_before_resolution() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[("cpu", "node-a")]));
    let gateway = Arc::new(ScriptedGateway::default());
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());
    let token = CancellationToken::new();
    token.cancel();
    let ctx = CallContext::background().with_cancellation(token);

    let err = dispatcher
        .write(&ctx, WriteRequest::new(vec![point("cpu", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled(_)));
    let err = dispatcher
        .query(&ctx, SqlQueryRequest::new(tables(&["cpu"]), "SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled(_)));
    assert_eq!(resolver.route_calls(), 0);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn cancellation_mid_write_counts_abandoned_points_as_failed() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[
        ("cpu", "node-a"),
        ("mem", "node-b"),
    ]));
    let mut gateway = ScriptedGateway::default();
    gateway
        .latency
        .insert("node-a".to_string(), Duration::from_secs(5));
    let gateway = Arc::new(gateway);
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let token = CancellationToken::new();
    let ctx = CallContext::background().with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });

    let points = vec![point("cpu", 1), point("cpu", 2), point("mem", 3)];
    let resp = dispatcher
        .write(&ctx, WriteRequest::new(points))
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(resp.success, 0);
    assert_eq!(resp.failed, 3);
    assert!(resp.message.unwrap().contains("in flight"));
    // node-b was never attempted.
    assert_eq!(gateway.calls(), vec!["node-a"]);
    assert!(resolver.cleared().is_empty());
}

#[tokio::test]
async fn partitions_not_yet_sent_when_cancelled_are_reported_as_unsent() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[
        ("cpu", "node-a"),
        ("mem", "node-b"),
    ]));
    let gateway = Arc::new(ScriptedGateway {
        cancel_after: Some("node-a".to_string()),
        ..ScriptedGateway::default()
    });
    let dispatcher = dispatcher(&resolver, &gateway, with_default_db());

    let ctx = CallContext::background();
    let points = vec![point("cpu", 1), point("cpu", 2), point("mem", 3)];
    let resp = dispatcher
        .write(&ctx, WriteRequest::new(points))
        .await
        .unwrap();

    assert!(ctx.is_cancelled());
    assert_eq!((resp.success, resp.failed), (2, 1));
    assert!(resp.message.unwrap().contains("before the partition was sent"));
    assert_eq!(gateway.calls(), vec!["node-a"]);
}

#[tokio::test]
async fn deadline_exceeded_fails_partition_without_clearing_routes() {
    let resolver = Arc::new(RecordingResolver::with_owners(&[
        ("cpu", "node-a"),
        ("mem", "node-b"),
    ]));
    let mut gateway = ScriptedGateway::default();
    gateway
        .latency
        .insert("node-a".to_string(), Duration::from_secs(5));
    let gateway = Arc::new(gateway);
    let dispatcher = dispatcher(
        &resolver,
        &gateway,
        DispatchSettings {
            rpc_timeout: Some(Duration::from_millis(20)),
            ..with_default_db()
        },
    );

    let resp = dispatcher
        .write(
            &CallContext::background(),
            WriteRequest::new(vec![point("cpu", 1), point("mem", 2)]),
        )
        .await
        .unwrap();
    assert_eq!((resp.success, resp.failed), (1, 1));
    assert!(resp.message.unwrap().contains("Deadline exceeded"));
    assert!(resolver.cleared().is_empty());
}
