//! Error types for bridge operations.
//!
//! Every failure class carries a stable code and a message identifier that
//! appear in structured log lines, so downstream alerting can match on them
//! without parsing free text.

use std::{fmt, time::Duration};

use edge_core::CoreError;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure conditions raised by the bridge and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Missing or invalid settings, or a backing store unreachable at boot.
    #[error("[E1001] configuration error: {message}")]
    Configuration {
        /// Description of the invalid setting
        message: String,
    },

    /// Upstream network failure.
    #[error("[E2001] transport error: {message}")]
    Transport {
        /// Error message describing the network failure
        message: String,
    },

    /// Upstream request exceeded its timeout.
    #[error("[E2002] request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Upstream throttled the session (HTTP 429).
    #[error("[E2003] rate limited by upstream")]
    RateLimited,

    /// Resource missing upstream (HTTP 404 or 410).
    #[error("[E2004] resource {resource_id} not found upstream (HTTP {status_code})")]
    NotFound {
        /// Identifier that was requested
        resource_id: String,
        /// HTTP status code returned
        status_code: u16,
    },

    /// Upstream answered with a status the bridge does not handle.
    #[error("[E2005] unexpected upstream status: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code returned
        status_code: u16,
    },

    /// Upstream response body did not have the expected shape.
    #[error("[E2006] invalid response: {message}")]
    InvalidResponse {
        /// What was wrong with the response
        message: String,
    },

    /// Local backing store I/O failure.
    #[error("[E3001] storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Reference exceeded the retry ceiling and was dropped.
    #[error("[E3002] {resource_id} dropped after {retries_count} retries")]
    RetryExhausted {
        /// Dropped resource identifier
        resource_id: String,
        /// Retries recorded when dropped
        retries_count: u32,
    },

    /// Worker task panicked.
    #[error("[E3003] worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the worker
        worker_id: usize,
        /// Join error message
        error: String,
    },

    /// Background task such as the feed pump panicked.
    #[error("[E3005] task {task} panicked: {error}")]
    TaskPanic {
        /// Name of the task
        task: String,
        /// Join error message
        error: String,
    },

    /// Tasks did not stop within the shutdown timeout.
    #[error("[E3004] shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },
}

impl BridgeError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a not-found error.
    pub fn not_found(resource_id: impl Into<String>, status_code: u16) -> Self {
        Self::NotFound { resource_id: resource_id.into(), status_code }
    }

    /// Creates an unexpected status error.
    pub fn unexpected_status(status_code: u16) -> Self {
        Self::UnexpectedStatus { status_code }
    }

    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a retry exhausted error.
    pub fn retry_exhausted(resource_id: impl Into<String>, retries_count: u32) -> Self {
        Self::RetryExhausted { resource_id: resource_id.into(), retries_count }
    }

    /// Creates a task panic error.
    pub fn task_panic(task: impl Into<String>, error: impl Into<String>) -> Self {
        Self::TaskPanic { task: task.into(), error: error.into() }
    }

    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "E1001",
            Self::Transport { .. } => "E2001",
            Self::Timeout { .. } => "E2002",
            Self::RateLimited => "E2003",
            Self::NotFound { .. } => "E2004",
            Self::UnexpectedStatus { .. } => "E2005",
            Self::InvalidResponse { .. } => "E2006",
            Self::Storage { .. } => "E3001",
            Self::RetryExhausted { .. } => "E3002",
            Self::WorkerPanic { .. } => "E3003",
            Self::ShutdownTimeout { .. } => "E3004",
            Self::TaskPanic { .. } => "E3005",
        }
    }

    /// Returns the message identifier emitted with log lines for this class.
    pub const fn message_id(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "edge_bridge_config_error",
            Self::Transport { .. } | Self::Timeout { .. } => "edge_bridge_transport_error",
            Self::RateLimited => "edge_bridge_rate_limited",
            Self::NotFound { .. } => "edge_bridge_not_found",
            Self::UnexpectedStatus { .. } | Self::InvalidResponse { .. } => {
                "edge_bridge_invalid_response"
            },
            Self::Storage { .. } => "edge_bridge_storage_error",
            Self::RetryExhausted { .. } => "edge_bridge_item_dropped",
            Self::WorkerPanic { .. } | Self::ShutdownTimeout { .. } => "edge_bridge_shutdown_error",
            Self::TaskPanic { .. } => "edge_bridge_task_error",
        }
    }

    /// Determines if the failed operation may succeed when repeated.
    ///
    /// Per-item upstream failures and storage I/O are retryable; configuration
    /// problems, dropped items and shutdown failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::RateLimited
            | Self::NotFound { .. }
            | Self::UnexpectedStatus { .. }
            | Self::InvalidResponse { .. }
            | Self::Storage { .. } => true,

            Self::Configuration { .. }
            | Self::RetryExhausted { .. }
            | Self::WorkerPanic { .. }
            | Self::TaskPanic { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }
}

impl From<CoreError> for BridgeError {
    fn from(error: CoreError) -> Self {
        Self::invalid_response(error.to_string())
    }
}

/// Category of bridge error for stats and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid settings.
    Configuration,
    /// Network connectivity issues.
    Transport,
    /// Upstream throttling.
    RateLimit,
    /// Missing upstream resource.
    NotFound,
    /// Malformed or unexpected upstream response.
    Response,
    /// Local store failures.
    Storage,
    /// Retry policy outcomes.
    Policy,
    /// Task lifecycle problems.
    Internal,
}

impl From<&BridgeError> for ErrorCategory {
    fn from(error: &BridgeError) -> Self {
        match error {
            BridgeError::Configuration { .. } => Self::Configuration,
            BridgeError::Transport { .. } | BridgeError::Timeout { .. } => Self::Transport,
            BridgeError::RateLimited => Self::RateLimit,
            BridgeError::NotFound { .. } => Self::NotFound,
            BridgeError::UnexpectedStatus { .. } | BridgeError::InvalidResponse { .. } => {
                Self::Response
            },
            BridgeError::Storage { .. } => Self::Storage,
            BridgeError::RetryExhausted { .. } => Self::Policy,
            BridgeError::WorkerPanic { .. }
            | BridgeError::TaskPanic { .. }
            | BridgeError::ShutdownTimeout { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transport => write!(f, "transport"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::NotFound => write!(f, "not_found"),
            Self::Response => write!(f, "response"),
            Self::Storage => write!(f, "storage"),
            Self::Policy => write!(f, "policy"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
