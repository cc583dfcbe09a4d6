use crate::core::{ClientError, RemoteError, RequestContext, Result, Route, RouteMap};
use async_trait::async_trait;
use log::{debug, warn};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

/// Default number of table routes kept by [`CachingRouteResolver`].
pub const DEFAULT_ROUTE_CACHE_SIZE: usize = 10_000;

/// Resolves which endpoint owns each table.
///
/// Implementations own their cache and its synchronization; `clear_route_for`
/// may be called concurrently from any number of in-flight requests.
#[async_trait]
pub trait RouteResolver: Send + Sync {
    /// Returns routes for `tables`. Tables nobody serves are simply absent.
    async fn route_for(
        &self,
        req_ctx: &RequestContext,
        tables: &[String],
    ) -> std::result::Result<RouteMap, RemoteError>;

    /// Drops any cached route for `tables`. Best-effort and idempotent.
    fn clear_route_for(&self, tables: &[String]);
}

/// The authoritative route service behind the cache.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn fetch_routes(
        &self,
        req_ctx: &RequestContext,
        tables: &[String],
    ) -> std::result::Result<Vec<Route>, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteCacheKey {
    database: String,
    table: String,
}

impl RouteCacheKey {
    fn new(database: &str, table: &str) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
        }
    }
}

struct RouteCacheState {
    routes: LruCache<RouteCacheKey, Route>,
    // table -> databases holding a cached route for it
    databases_by_table: HashMap<String, HashSet<String>>,
    // bumped by every clear; fills started before a bump are not cached
    generation: u64,
}

impl RouteCacheState {
    fn insert(&mut self, key: RouteCacheKey, route: Route) {
        self.databases_by_table
            .entry(key.table.clone())
            .or_default()
            .insert(key.database.clone());
        if let Some((evicted, _)) = self.routes.push(key.clone(), route) {
            if evicted != key {
                self.forget(&evicted);
            }
        }
    }

    fn forget(&mut self, key: &RouteCacheKey) {
        if let Some(databases) = self.databases_by_table.get_mut(&key.table) {
            databases.remove(&key.database);
            if databases.is_empty() {
                self.databases_by_table.remove(&key.table);
            }
        }
    }

    fn remove_table(&mut self, table: &str) -> usize {
        let Some(databases) = self.databases_by_table.remove(table) else {
            return 0;
        };
        databases
            .into_iter()
            .filter_map(|database| {
                self.routes.pop(&RouteCacheKey {
                    database,
                    table: table.to_string(),
                })
            })
            .count()
    }
}

/// Direct-mode resolver: LRU cache in front of a [`RouteSource`].
///
/// Cache misses of one lookup are fetched from the source in a single batch.
/// A clear that lands while a batch is in flight wins: the fetched routes are
/// returned to the caller but not cached.
pub struct CachingRouteResolver {
    source: Arc<dyn RouteSource>,
    cache: Mutex<RouteCacheState>,
}

impl CachingRouteResolver {
    pub fn new(source: Arc<dyn RouteSource>, capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            ClientError::ConfigError("route cache size must be >= 1".to_string())
        })?;
        Ok(Self {
            source,
            cache: Mutex::new(RouteCacheState {
                routes: LruCache::new(capacity),
                databases_by_table: HashMap::new(),
                generation: 0,
            }),
        })
    }

    /// Number of routes currently cached, across all databases.
    pub fn cached_len(&self) -> usize {
        self.cache().routes.len()
    }

    pub fn is_cached(&self, database: &str, table: &str) -> bool {
        self.cache()
            .routes
            .contains(&RouteCacheKey::new(database, table))
    }

    fn cache(&self) -> MutexGuard<'_, RouteCacheState> {
        // A panic while holding the lock can't leave a half-written route behind.
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RouteResolver for CachingRouteResolver {
    async fn route_for(
        &self,
        req_ctx: &RequestContext,
        tables: &[String],
    ) -> std::result::Result<RouteMap, RemoteError> {
        let database = req_ctx.database.as_str();
        let mut routes = RouteMap::with_capacity(tables.len());
        let mut missing: Vec<String> = Vec::new();
        let generation = {
            let mut cache = self.cache();
            for table in tables {
                if let Some(route) = cache.routes.get(&RouteCacheKey::new(database, table)) {
                    routes.insert(table.clone(), route.clone());
                } else if !missing.contains(table) {
                    missing.push(table.clone());
                }
            }
            cache.generation
        };

        if missing.is_empty() {
            return Ok(routes);
        }

        debug!(
            "Route cache miss in database '{}' for tables {:?}",
            database, missing
        );
        let fetched = self.source.fetch_routes(req_ctx, &missing).await?;

        let mut cache = self.cache();
        let cacheable = cache.generation == generation;
        if !cacheable {
            debug!(
                "Routes for {:?} were cleared during the fetch, not caching them",
                missing
            );
        }
        for route in fetched {
            if !missing.contains(&route.table) {
                continue;
            }
            if cacheable {
                cache.insert(RouteCacheKey::new(database, &route.table), route.clone());
            }
            routes.insert(route.table.clone(), route);
        }
        Ok(routes)
    }

    fn clear_route_for(&self, tables: &[String]) {
        let mut cache = self.cache();
        cache.generation = cache.generation.wrapping_add(1);
        let removed: usize = tables.iter().map(|table| cache.remove_table(table)).sum();
        if removed > 0 {
            warn!(
                "Cleared {} cached route(s) for tables {:?}",
                removed, tables
            );
        }
    }
}

/// Proxy-mode resolver: every table is served through one endpoint.
#[derive(Debug, Clone)]
pub struct ProxyRouteResolver {
    endpoint: String,
}

impl ProxyRouteResolver {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RouteResolver for ProxyRouteResolver {
    async fn route_for(
        &self,
        _req_ctx: &RequestContext,
        tables: &[String],
    ) -> std::result::Result<RouteMap, RemoteError> {
        Ok(tables
            .iter()
            .map(|table| (table.clone(), Route::new(table.clone(), self.endpoint.clone())))
            .collect())
    }

    fn clear_route_for(&self, _tables: &[String]) {}
}
