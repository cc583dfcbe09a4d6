pub mod config;

use crate::cluster::{
    CachingRouteResolver, CallContext, DispatchSettings, Dispatcher, ProxyRouteResolver,
    RemoteCallGateway, RouteResolver, RouteSource,
};
use crate::core::{
    ClientError, Point, Result, SqlQueryRequest, SqlQueryResponse, WriteRequest, WriteResponse,
};
use config::{ClientConfig, RouteMode};
use std::sync::Arc;

/// Routing client for a distributed table store.
///
/// Resolves table owners, dispatches queries and writes to them, and drops
/// stale routes when an endpoint reports it no longer owns a table.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tableroute::{Client, ClientConfig, InMemoryCluster, Point};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cluster = InMemoryCluster::new();
/// cluster.register_endpoint("node-a:8831").await?;
/// cluster.assign_table("cpu", "node-a:8831").await?;
///
/// let config = ClientConfig::new("meta:8831").database("public");
/// let client = Client::new(config, Arc::new(cluster.clone()), Arc::new(cluster))?;
///
/// let point = Point::builder("cpu").tag("host", "h1").field("usage", 0.4).build()?;
/// let resp = client.write_points(vec![point]).await?;
/// assert_eq!(resp.success, 1);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    dispatcher: Dispatcher,
}

impl Client {
    /// Builds a client; the route source is consulted in direct mode only.
    pub fn new(
        config: ClientConfig,
        gateway: Arc<dyn RemoteCallGateway>,
        route_source: Arc<dyn RouteSource>,
    ) -> Result<Self> {
        config.validate().map_err(ClientError::ConfigError)?;
        let resolver: Arc<dyn RouteResolver> = match config.route_mode {
            RouteMode::Direct => Arc::new(CachingRouteResolver::new(
                route_source,
                config.route_cache_size,
            )?),
            RouteMode::Proxy => Arc::new(ProxyRouteResolver::new(config.endpoint.clone())),
        };
        Self::with_resolver(config, resolver, gateway)
    }

    /// Builds a client around a caller-provided resolver.
    pub fn with_resolver(
        config: ClientConfig,
        resolver: Arc<dyn RouteResolver>,
        gateway: Arc<dyn RemoteCallGateway>,
    ) -> Result<Self> {
        config.validate().map_err(ClientError::ConfigError)?;
        let settings = DispatchSettings {
            default_database: config.database.clone(),
            rpc_timeout: config.rpc_timeout,
            write_concurrency: config.write_concurrency,
        };
        let dispatcher = Dispatcher::new_with_settings(resolver, gateway, settings);
        Ok(Self { config, dispatcher })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn query(&self, ctx: &CallContext, req: SqlQueryRequest) -> Result<SqlQueryResponse> {
        self.dispatcher.query(ctx, req).await
    }

    pub async fn write(&self, ctx: &CallContext, req: WriteRequest) -> Result<WriteResponse> {
        self.dispatcher.write(ctx, req).await
    }

    /// Queries `tables` in the default database with no deadline.
    pub async fn query_sql(
        &self,
        tables: Vec<String>,
        sql: impl Into<String>,
    ) -> Result<SqlQueryResponse> {
        self.query(&CallContext::background(), SqlQueryRequest::new(tables, sql))
            .await
    }

    /// Writes `points` in the default database with no deadline.
    pub async fn write_points(&self, points: Vec<Point>) -> Result<WriteResponse> {
        self.write(&CallContext::background(), WriteRequest::new(points))
            .await
    }

    /// Forgets cached routes for `tables`, forcing a fresh lookup next time.
    pub fn clear_route_for(&self, tables: &[String]) {
        self.dispatcher.resolver().clear_route_for(tables);
    }
}
