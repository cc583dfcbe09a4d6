use std::time::Duration;
use thiserror::Error;

/// Status codes carried by server-side failures.
pub mod status {
    pub const OK: u32 = 200;
    /// The endpoint does not own the table anymore (moved or never assigned).
    pub const INVALID_ROUTE: u32 = 302;
    pub const INVALID_ARGUMENT: u32 = 400;
    pub const UNAUTHORIZED: u32 = 401;
    pub const NOT_FOUND: u32 = 404;
    pub const TOO_MANY_REQUESTS: u32 = 429;
    pub const INTERNAL: u32 = 500;
    pub const UNAVAILABLE: u32 = 503;
}

/// Failure reported by a collaborator (route source, remote gateway).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Server error, code: {code}, msg: {message}")]
    Server { code: u32, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

impl RemoteError {
    pub fn server(code: u32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Builds the error a gateway reports when the peer can't be reached.
    pub fn connection(detail: impl std::fmt::Display) -> Self {
        Self::Transport(format!("connection error: {}", detail))
    }

    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the server explicitly says the route used for the call is stale.
    pub fn should_clear_route(&self) -> bool {
        matches!(self, Self::Server { code, .. } if *code == status::INVALID_ROUTE)
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No database selected, set one in the client config or the request context")]
    NoDatabaseSelected,

    #[error("Query request must name at least one table")]
    NullRequestTables,

    #[error("Write request must carry at least one point")]
    NullRows,

    #[error("Route tables failed, names: {tables:?}: {source}")]
    RoutingFailed {
        tables: Vec<String>,
        #[source]
        source: RemoteError,
    },

    #[error("Failed to route table '{0}': no route entry")]
    EmptyRoute(String),

    #[error("Split points by route failed: no route for table '{0}'")]
    SplitFailed(String),

    #[error("Remote {operation} call to '{endpoint}' failed: {source}")]
    RemoteCallFailed {
        operation: &'static str,
        endpoint: String,
        #[source]
        source: RemoteError,
    },

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ClientError {
    /// Returns the collaborator failure behind this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::RoutingFailed { source, .. } | Self::RemoteCallFailed { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
