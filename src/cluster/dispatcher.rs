use super::context::CallFailure;
use super::{CallContext, RemoteCallGateway, RouteResolver};
use crate::core::{
    ClientError, Point, RemoteError, RequestContext, Result, RouteMap, SqlQueryRequest,
    SqlQueryResponse, WriteRequest, WriteResponse,
};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Marker of transport failures that mean the endpoint is unreachable.
pub const CONNECTION_ERROR_MARKER: &str = "connection error";

const CANCELLED_BEFORE_SEND: &str = "request cancelled before the partition was sent";
const CANCELLED_IN_FLIGHT: &str =
    "request cancelled while the partition write was in flight, it may have been applied";

/// Returns true when `err` means the route used for the call is stale.
///
/// Structured server errors carry the decision themselves. Untyped transport
/// failures fall back to matching the "connection error" marker.
pub fn should_clear_route(err: &RemoteError) -> bool {
    err.should_clear_route() || err.to_string().contains(CONNECTION_ERROR_MARKER)
}

/// Tunables applied to every dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Substituted when a request arrives without a database.
    pub default_database: Option<String>,
    /// Upper bound of a single remote call.
    pub rpc_timeout: Option<Duration>,
    /// Max partition writes in flight for one request. `1` writes sequentially.
    pub write_concurrency: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_database: None,
            rpc_timeout: None,
            write_concurrency: 1,
        }
    }
}

/// Routes queries and writes to the endpoints owning their tables.
///
/// Never retries. A stale route observed on a failed call is dropped from the
/// resolver so that the caller's retry resolves it again.
pub struct Dispatcher {
    resolver: Arc<dyn RouteResolver>,
    gateway: Arc<dyn RemoteCallGateway>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn RouteResolver>, gateway: Arc<dyn RemoteCallGateway>) -> Self {
        Self::new_with_settings(resolver, gateway, DispatchSettings::default())
    }

    pub fn new_with_settings(
        resolver: Arc<dyn RouteResolver>,
        gateway: Arc<dyn RemoteCallGateway>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            resolver,
            gateway,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &Arc<dyn RouteResolver> {
        &self.resolver
    }

    /// Runs a SQL query on the endpoint owning the first requested table.
    pub async fn query(
        &self,
        ctx: &CallContext,
        mut req: SqlQueryRequest,
    ) -> Result<SqlQueryResponse> {
        self.with_default_request_context(&mut req.req_ctx)?;
        if req.tables.is_empty() {
            return Err(ClientError::NullRequestTables);
        }

        let span = info_span!(
            "dispatch.query",
            request_id = %Uuid::new_v4(),
            database = %req.req_ctx.database,
            tables = req.tables.len()
        );
        self.dispatch_query(ctx, req).instrument(span).await
    }

    async fn dispatch_query(
        &self,
        ctx: &CallContext,
        req: SqlQueryRequest,
    ) -> Result<SqlQueryResponse> {
        let routes = self.resolve(ctx, &req.req_ctx, &req.tables).await?;

        // Single queries are expected to hit co-located tables.
        let first_table = &req.tables[0];
        let endpoint = match routes.get(first_table) {
            Some(route) => route.endpoint.clone(),
            None => return Err(ClientError::EmptyRoute(first_table.clone())),
        };
        event!(Level::DEBUG, endpoint = %endpoint, "query routed");

        let outcome = ctx
            .guard(
                self.settings.rpc_timeout,
                self.gateway.query(ctx, endpoint.as_str(), &req),
            )
            .await;
        match outcome {
            Ok(resp) => Ok(resp),
            Err(CallFailure::Remote(err)) => {
                if should_clear_route(&err) {
                    self.clear_routes(&req.tables, endpoint.as_str());
                }
                event!(Level::WARN, endpoint = %endpoint, error = %err, "query failed");
                Err(ClientError::RemoteCallFailed {
                    operation: "query",
                    endpoint,
                    source: err,
                })
            }
            Err(CallFailure::Cancelled { .. }) => Err(ClientError::Cancelled(format!(
                "query to '{}' was cancelled",
                endpoint
            ))),
        }
    }

    /// Writes points to the endpoints owning their tables.
    ///
    /// A failing endpoint does not fail the call: its points are counted in
    /// `failed` and the first error message is kept in `message`. Only
    /// resolution and partitioning failures are returned as errors.
    pub async fn write(&self, ctx: &CallContext, mut req: WriteRequest) -> Result<WriteResponse> {
        self.with_default_request_context(&mut req.req_ctx)?;
        if req.points.is_empty() {
            return Err(ClientError::NullRows);
        }

        let span = info_span!(
            "dispatch.write",
            request_id = %Uuid::new_v4(),
            database = %req.req_ctx.database,
            points = req.points.len()
        );
        self.dispatch_write(ctx, req).instrument(span).await
    }

    async fn dispatch_write(&self, ctx: &CallContext, req: WriteRequest) -> Result<WriteResponse> {
        let WriteRequest { req_ctx, points } = req;
        let tables = tables_from_points(&points);
        let routes = self.resolve(ctx, &req_ctx, &tables).await?;
        let partitions = split_points_by_route(points, &routes)?;
        event!(
            Level::DEBUG,
            partitions = partitions.len(),
            "write split by route"
        );

        // Outcomes come back in endpoint order regardless of concurrency, so
        // the retained message is always the lowest failing endpoint's.
        let outcomes: Vec<WriteResponse> = stream::iter(partitions)
            .map(|(endpoint, points)| self.write_partition(ctx, &req_ctx, endpoint, points))
            .buffered(self.settings.write_concurrency.max(1))
            .collect()
            .await;

        let mut total = WriteResponse::default();
        for outcome in outcomes {
            total.combine(outcome);
        }
        Ok(total)
    }

    async fn write_partition(
        &self,
        ctx: &CallContext,
        req_ctx: &RequestContext,
        endpoint: String,
        points: Vec<Point>,
    ) -> WriteResponse {
        let count = u32::try_from(points.len()).unwrap_or(u32::MAX);
        let outcome = ctx
            .guard(
                self.settings.rpc_timeout,
                self.gateway.write(ctx, endpoint.as_str(), req_ctx, &points),
            )
            .await;

        match outcome {
            Ok(resp) => normalize_partition_response(resp, count, endpoint.as_str()),
            Err(CallFailure::Remote(err)) => {
                if should_clear_route(&err) {
                    self.clear_routes(&tables_from_points(&points), endpoint.as_str());
                }
                event!(
                    Level::WARN,
                    endpoint = %endpoint,
                    points = count,
                    error = %err,
                    "partition write failed"
                );
                WriteResponse::failed(count, err.to_string())
            }
            Err(CallFailure::Cancelled { in_flight }) => {
                event!(
                    Level::WARN,
                    endpoint = %endpoint,
                    points = count,
                    in_flight,
                    "partition write cancelled"
                );
                let message = if in_flight {
                    CANCELLED_IN_FLIGHT
                } else {
                    CANCELLED_BEFORE_SEND
                };
                WriteResponse::failed(count, message)
            }
        }
    }

    async fn resolve(
        &self,
        ctx: &CallContext,
        req_ctx: &RequestContext,
        tables: &[String],
    ) -> Result<RouteMap> {
        match ctx
            .guard(
                self.settings.rpc_timeout,
                self.resolver.route_for(req_ctx, tables),
            )
            .await
        {
            Ok(routes) => Ok(routes),
            Err(CallFailure::Remote(source)) => Err(ClientError::RoutingFailed {
                tables: tables.to_vec(),
                source,
            }),
            Err(CallFailure::Cancelled { .. }) => Err(ClientError::Cancelled(format!(
                "route resolution for {:?} was cancelled",
                tables
            ))),
        }
    }

    fn clear_routes(&self, tables: &[String], endpoint: &str) {
        event!(
            Level::WARN,
            endpoint = %endpoint,
            tables = ?tables,
            "clearing stale routes"
        );
        self.resolver.clear_route_for(tables);
    }

    fn with_default_request_context(&self, req_ctx: &mut RequestContext) -> Result<()> {
        if req_ctx.database.is_empty() {
            if let Some(database) = &self.settings.default_database {
                req_ctx.database = database.clone();
            }
        }
        if req_ctx.database.is_empty() {
            return Err(ClientError::NoDatabaseSelected);
        }
        Ok(())
    }
}

/// Distinct tables referenced by `points`, in first-seen order.
pub fn tables_from_points(points: &[Point]) -> Vec<String> {
    let mut seen = HashSet::new();
    points
        .iter()
        .filter(|point| seen.insert(point.table.as_str()))
        .map(|point| point.table.clone())
        .collect()
}

/// Groups points by the endpoint owning their table, keeping their relative order.
///
/// Fails on the first table without a route; nothing is partially split.
pub fn split_points_by_route(
    points: Vec<Point>,
    routes: &RouteMap,
) -> Result<BTreeMap<String, Vec<Point>>> {
    if let Some(point) = points.iter().find(|point| !routes.contains_key(&point.table)) {
        return Err(ClientError::SplitFailed(point.table.clone()));
    }

    let mut partitions: BTreeMap<String, Vec<Point>> = BTreeMap::new();
    for point in points {
        if let Some(route) = routes.get(&point.table) {
            partitions
                .entry(route.endpoint.clone())
                .or_default()
                .push(point);
        }
    }
    Ok(partitions)
}

// Keeps `success + failed` equal to the partition size even if a server
// reports inconsistent counts.
fn normalize_partition_response(resp: WriteResponse, count: u32, endpoint: &str) -> WriteResponse {
    if resp.success.saturating_add(resp.failed) == count {
        return resp;
    }
    event!(
        Level::WARN,
        endpoint = %endpoint,
        expected = count,
        success = resp.success,
        failed = resp.failed,
        "endpoint reported inconsistent write counts"
    );
    let success = resp.success.min(count);
    WriteResponse {
        success,
        failed: count - success,
        message: resp.message,
    }
}
