use super::{CallContext, RemoteCallGateway, RouteSource};
use crate::core::{
    ClientError, Column, Point, RemoteError, RequestContext, Result, Route, Row, SqlQueryRequest,
    SqlQueryResponse, WriteResponse, status,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A simulated backend endpoint.
#[derive(Debug, Clone)]
struct InMemoryEndpoint {
    online: bool,
    latency: Option<Duration>,
    rows: HashMap<String, Vec<Point>>,
    injected: VecDeque<RemoteError>,
}

impl Default for InMemoryEndpoint {
    fn default() -> Self {
        Self {
            online: true,
            latency: None,
            rows: HashMap::new(),
            injected: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    endpoints: HashMap<String, InMemoryEndpoint>,
    owners: HashMap<String, String>,
    stats: InMemoryClusterStats,
}

/// Call counters of an [`InMemoryCluster`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryClusterStats {
    pub route_fetches: usize,
    pub query_calls: usize,
    pub write_calls: usize,
}

/// An in-process cluster acting as both route service and remote gateway.
///
/// Endpoints answer like real servers would: a call for a table they don't own
/// fails with `status::INVALID_ROUTE`, an offline endpoint fails with a
/// connection error. Failures can also be injected per endpoint.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_endpoint(&self, endpoint: impl Into<String>) -> Result<()> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(ClientError::ConfigError(
                "endpoint must not be empty".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        state.endpoints.entry(endpoint).or_default();
        Ok(())
    }

    /// Makes `endpoint` the owner of `table` without moving any stored rows.
    pub async fn assign_table(&self, table: impl Into<String>, endpoint: &str) -> Result<()> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(ClientError::ConfigError(
                "table must not be empty".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        if !state.endpoints.contains_key(endpoint) {
            return Err(unknown_endpoint(endpoint));
        }
        state.owners.insert(table, endpoint.to_string());
        Ok(())
    }

    /// Moves ownership of `table` to `endpoint`, carrying its rows along.
    pub async fn move_table(&self, table: &str, endpoint: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.endpoints.contains_key(endpoint) {
            return Err(unknown_endpoint(endpoint));
        }
        let previous = state.owners.insert(table.to_string(), endpoint.to_string());
        let moved = previous
            .and_then(|owner| state.endpoints.get_mut(&owner))
            .and_then(|owner| owner.rows.remove(table))
            .unwrap_or_default();
        if let Some(target) = state.endpoints.get_mut(endpoint) {
            target
                .rows
                .entry(table.to_string())
                .or_default()
                .extend(moved);
        }
        Ok(())
    }

    pub async fn set_online(&self, endpoint: &str, online: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let peer = state
            .endpoints
            .get_mut(endpoint)
            .ok_or_else(|| unknown_endpoint(endpoint))?;
        peer.online = online;
        Ok(())
    }

    /// Delays every call served by `endpoint`.
    pub async fn set_latency(&self, endpoint: &str, latency: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock().await;
        let peer = state
            .endpoints
            .get_mut(endpoint)
            .ok_or_else(|| unknown_endpoint(endpoint))?;
        peer.latency = latency;
        Ok(())
    }

    /// Queues `error` as the answer to the next call served by `endpoint`.
    pub async fn inject_failure(&self, endpoint: &str, error: RemoteError) -> Result<()> {
        let mut state = self.state.lock().await;
        let peer = state
            .endpoints
            .get_mut(endpoint)
            .ok_or_else(|| unknown_endpoint(endpoint))?;
        peer.injected.push_back(error);
        Ok(())
    }

    pub async fn owner_of(&self, table: &str) -> Option<String> {
        self.state.lock().await.owners.get(table).cloned()
    }

    /// Rows stored for `table` on its current owner.
    pub async fn rows_for(&self, table: &str) -> Vec<Point> {
        let state = self.state.lock().await;
        state
            .owners
            .get(table)
            .and_then(|owner| state.endpoints.get(owner))
            .and_then(|peer| peer.rows.get(table))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> InMemoryClusterStats {
        self.state.lock().await.stats.clone()
    }

    // Applies the endpoint's simulated latency without holding the state lock.
    async fn simulate_latency(&self, endpoint: &str) {
        let latency = {
            let state = self.state.lock().await;
            state.endpoints.get(endpoint).and_then(|peer| peer.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn admit<'a>(
        endpoints: &'a mut HashMap<String, InMemoryEndpoint>,
        endpoint: &str,
    ) -> std::result::Result<&'a mut InMemoryEndpoint, RemoteError> {
        let peer = endpoints.get_mut(endpoint).ok_or_else(|| {
            RemoteError::connection(format!("endpoint '{}' is unknown", endpoint))
        })?;
        if !peer.online {
            return Err(RemoteError::connection(format!(
                "endpoint '{}' is unreachable",
                endpoint
            )));
        }
        if let Some(err) = peer.injected.pop_front() {
            return Err(err);
        }
        Ok(peer)
    }

    fn check_owner(
        owners: &HashMap<String, String>,
        endpoint: &str,
        table: &str,
    ) -> std::result::Result<(), RemoteError> {
        match owners.get(table) {
            Some(owner) if owner == endpoint => Ok(()),
            Some(owner) => Err(RemoteError::server(
                status::INVALID_ROUTE,
                format!(
                    "table '{}' is served by '{}', not '{}'",
                    table, owner, endpoint
                ),
            )),
            None => Err(RemoteError::server(
                status::NOT_FOUND,
                format!("table '{}' not found", table),
            )),
        }
    }
}

fn unknown_endpoint(endpoint: &str) -> ClientError {
    ClientError::ConfigError(format!("endpoint '{}' is not registered", endpoint))
}

fn point_to_row(point: &Point) -> Row {
    let mut columns = Vec::with_capacity(1 + point.tags.len() + point.fields.len());
    columns.push(Column {
        name: "timestamp".to_string(),
        value: crate::core::Value::Timestamp(point.timestamp),
    });
    for (name, value) in point.tags.iter().chain(point.fields.iter()) {
        columns.push(Column {
            name: name.clone(),
            value: value.clone(),
        });
    }
    Row::new(columns)
}

#[async_trait]
impl RouteSource for InMemoryCluster {
    async fn fetch_routes(
        &self,
        _req_ctx: &RequestContext,
        tables: &[String],
    ) -> std::result::Result<Vec<Route>, RemoteError> {
        let mut state = self.state.lock().await;
        state.stats.route_fetches += 1;
        Ok(tables
            .iter()
            .filter_map(|table| {
                state
                    .owners
                    .get(table)
                    .map(|owner| Route::new(table.clone(), owner.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl RemoteCallGateway for InMemoryCluster {
    /// Returns every stored row of the requested tables, in table order.
    async fn query(
        &self,
        _ctx: &CallContext,
        endpoint: &str,
        req: &SqlQueryRequest,
    ) -> std::result::Result<SqlQueryResponse, RemoteError> {
        self.simulate_latency(endpoint).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.stats.query_calls += 1;
        let peer = Self::admit(&mut state.endpoints, endpoint)?;
        for table in &req.tables {
            Self::check_owner(&state.owners, endpoint, table)?;
        }

        let rows: Vec<Row> = req
            .tables
            .iter()
            .filter_map(|table| peer.rows.get(table))
            .flatten()
            .map(point_to_row)
            .collect();
        Ok(SqlQueryResponse {
            sql: req.sql.clone(),
            affected_rows: 0,
            rows,
        })
    }

    async fn write(
        &self,
        _ctx: &CallContext,
        endpoint: &str,
        _req_ctx: &RequestContext,
        points: &[Point],
    ) -> std::result::Result<WriteResponse, RemoteError> {
        self.simulate_latency(endpoint).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.stats.write_calls += 1;
        let peer = Self::admit(&mut state.endpoints, endpoint)?;
        for point in points {
            Self::check_owner(&state.owners, endpoint, &point.table)?;
        }

        for point in points {
            peer.rows
                .entry(point.table.clone())
                .or_default()
                .push(point.clone());
        }
        Ok(WriteResponse::succeeded(
            u32::try_from(points.len()).unwrap_or(u32::MAX),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_point(ts: i64) -> Point {
        Point::builder("cpu")
            .timestamp(ts)
            .tag("host", "h1")
            .field("usage", 0.5)
            .build()
            .unwrap()
    }

    async fn two_node_cluster() -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        cluster.register_endpoint("node-a").await.unwrap();
        cluster.register_endpoint("node-b").await.unwrap();
        cluster.assign_table("cpu", "node-a").await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn writes_land_on_owner_and_are_queryable() {
        let cluster = two_node_cluster().await;
        let ctx = CallContext::background();
        let resp = cluster
            .write(&ctx, "node-a", &RequestContext::new("public"), &[cpu_point(1)])
            .await
            .unwrap();
        assert_eq!(resp.success, 1);

        let req = SqlQueryRequest::new(vec!["cpu".to_string()], "SELECT * FROM cpu");
        let rows = cluster.query(&ctx, "node-a", &req).await.unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("host"), Some(&crate::core::Value::from("h1")));
        assert_eq!(cluster.stats().await.write_calls, 1);
    }

    #[tokio::test]
    async fn wrong_endpoint_reports_invalid_route() {
        let cluster = two_node_cluster().await;
        let err = cluster
            .write(
                &CallContext::background(),
                "node-b",
                &RequestContext::new("public"),
                &[cpu_point(1)],
            )
            .await
            .unwrap_err();
        assert!(err.should_clear_route());
    }

    #[tokio::test]
    async fn offline_endpoint_reports_connection_error() {
        let cluster = two_node_cluster().await;
        cluster.set_online("node-a", false).await.unwrap();
        let err = cluster
            .write(
                &CallContext::background(),
                "node-a",
                &RequestContext::new("public"),
                &[cpu_point(1)],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection error"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let cluster = two_node_cluster().await;
        cluster
            .inject_failure("node-a", RemoteError::server(status::INTERNAL, "disk full"))
            .await
            .unwrap();
        let ctx = CallContext::background();
        let req_ctx = RequestContext::new("public");
        assert!(cluster.write(&ctx, "node-a", &req_ctx, &[cpu_point(1)]).await.is_err());
        assert!(cluster.write(&ctx, "node-a", &req_ctx, &[cpu_point(2)]).await.is_ok());
    }

    #[tokio::test]
    async fn move_table_carries_rows() {
        let cluster = two_node_cluster().await;
        cluster
            .write(
                &CallContext::background(),
                "node-a",
                &RequestContext::new("public"),
                &[cpu_point(1), cpu_point(2)],
            )
            .await
            .unwrap();
        cluster.move_table("cpu", "node-b").await.unwrap();
        assert_eq!(cluster.owner_of("cpu").await.as_deref(), Some("node-b"));
        assert_eq!(cluster.rows_for("cpu").await.len(), 2);

        let routes = cluster
            .fetch_routes(&RequestContext::new("public"), &["cpu".to_string(), "mem".to_string()])
            .await
            .unwrap();
        assert_eq!(routes, vec![Route::new("cpu", "node-b")]);
    }

    #[tokio::test]
    async fn unknown_endpoints_are_rejected_by_admin_calls() {
        let cluster = InMemoryCluster::new();
        assert!(cluster.register_endpoint(" ").await.is_err());
        assert!(cluster.assign_table("cpu", "nowhere").await.is_err());
        assert!(cluster.set_online("nowhere", false).await.is_err());
    }
}
