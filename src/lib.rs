// ============================================================================
// tableroute: routing-aware dispatch for a distributed table store
// ============================================================================

pub mod core;
pub mod cluster;
pub mod client;

// Re-export main types for convenience
pub use client::Client;
pub use client::config::{ClientConfig, RouteMode};
pub use crate::core::{
    ClientError, Column, Point, PointBuilder, RemoteError, RequestContext, Result, Route,
    RouteMap, Row, SqlQueryRequest, SqlQueryResponse, Value, WriteRequest, WriteResponse, status,
};

// Re-export routing and dispatch API
pub use cluster::{
    CachingRouteResolver, CallContext, DispatchSettings, Dispatcher, InMemoryCluster,
    InMemoryClusterStats, ProxyRouteResolver, RemoteCallGateway, RouteResolver, RouteSource,
    should_clear_route,
};

pub use tokio_util::sync::CancellationToken;
