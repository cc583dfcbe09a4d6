use crate::cluster::DEFAULT_ROUTE_CACHE_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const URL_SCHEME: &str = "tableroute://";

/// How the client finds the endpoint owning a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Ask the route service and talk to table owners directly.
    #[default]
    Direct,
    /// Send everything to the configured endpoint, which forwards on our behalf.
    Proxy,
}

impl FromStr for RouteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "proxy" => Ok(Self::Proxy),
            other => Err(format!("Unknown route mode '{}'", other)),
        }
    }
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Route service address in direct mode, proxy address in proxy mode
    pub endpoint: String,

    pub route_mode: RouteMode,

    /// Database used when a request does not name one
    pub database: Option<String>,

    /// Maximum number of cached table routes
    pub route_cache_size: usize,

    /// Per remote call timeout
    pub rpc_timeout: Option<Duration>,

    /// Partition writes in flight per request (1 = sequential)
    pub write_concurrency: usize,
}

impl ClientConfig {
    /// Create a new configuration for the given endpoint
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            route_mode: RouteMode::Direct,
            database: None,
            route_cache_size: DEFAULT_ROUTE_CACHE_SIZE,
            rpc_timeout: None,
            write_concurrency: 1,
        }
    }

    /// Set the default database
    pub fn database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn route_mode(mut self, mode: RouteMode) -> Self {
        self.route_mode = mode;
        self
    }

    pub fn route_cache_size(mut self, size: usize) -> Self {
        self.route_cache_size = size;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn write_concurrency(mut self, concurrency: usize) -> Self {
        self.write_concurrency = concurrency;
        self
    }

    /// Parse from connection string
    ///
    /// Format: "tableroute://host:port[/database][?mode=direct|proxy]"
    ///
    /// # Examples
    ///
    /// ```
    /// use tableroute::{ClientConfig, RouteMode};
    ///
    /// let config = ClientConfig::from_url("tableroute://10.0.0.1:8831/public?mode=proxy").unwrap();
    /// assert_eq!(config.endpoint, "10.0.0.1:8831");
    /// assert_eq!(config.database.as_deref(), Some("public"));
    /// assert_eq!(config.route_mode, RouteMode::Proxy);
    /// ```
    pub fn from_url(url: &str) -> Result<Self, String> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| format!("URL must start with '{}'", URL_SCHEME))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (address, database) = match location.split_once('/') {
            Some((address, database)) => (address, database),
            None => (location, ""),
        };

        if address.is_empty() {
            return Err("URL is missing host".to_string());
        }
        if let Some((host, port)) = address.split_once(':') {
            if host.is_empty() {
                return Err("URL is missing host".to_string());
            }
            port.parse::<u16>()
                .map_err(|_| format!("Invalid port '{}'", port))?;
        }

        let mut config = Self::new(address);
        if !database.is_empty() {
            config = config.database(database);
        }
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("mode", mode)) => config = config.route_mode(mode.parse()?),
                _ => return Err(format!("Unsupported URL parameter '{}'", pair)),
            }
        }
        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        format!(
            "{}{}/{}?mode={}",
            URL_SCHEME,
            self.endpoint,
            self.database.as_deref().unwrap_or_default(),
            self.route_mode
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("Endpoint cannot be empty".to_string());
        }

        if self.route_cache_size == 0 {
            return Err("route_cache_size must be > 0".to_string());
        }

        if self.write_concurrency == 0 {
            return Err("write_concurrency must be > 0".to_string());
        }

        if matches!(self.database.as_deref(), Some(db) if db.trim().is_empty()) {
            return Err("Default database cannot be blank".to_string());
        }

        if self.rpc_timeout == Some(Duration::ZERO) {
            return Err("rpc_timeout must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:8831")
    }
}
