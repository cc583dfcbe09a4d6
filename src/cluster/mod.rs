//! Routing-aware dispatch: route resolution, remote calls and the dispatcher
//! tying them together.

pub mod context;
pub mod dispatcher;
pub mod gateway;
pub mod in_memory;
pub mod routing;

pub use context::CallContext;
pub use dispatcher::{
    CONNECTION_ERROR_MARKER, DispatchSettings, Dispatcher, should_clear_route,
    split_points_by_route, tables_from_points,
};
pub use gateway::RemoteCallGateway;
pub use in_memory::{InMemoryCluster, InMemoryClusterStats};
pub use routing::{
    CachingRouteResolver, DEFAULT_ROUTE_CACHE_SIZE, ProxyRouteResolver, RouteResolver,
    RouteSource,
};
