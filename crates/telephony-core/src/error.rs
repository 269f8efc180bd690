//! Error types for telephony operations

use serde::Serialize;
use thiserror::Error;

/// Result type for telephony operations
pub type Result<T> = std::result::Result<T, TelephonyError>;

/// Errors surfaced by the lifecycle, ledger, ingestion and query paths
#[derive(Debug, Error)]
pub enum TelephonyError {
    /// Number (or other resource) already owned by another tenant
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Unknown number, channel, function or account
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Tenant does not own the resource
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Pre-authorization could not be covered by the balance
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: i64, available: i64 },

    /// Carrier or sink did not answer in time
    #[error("Upstream timeout after {millis}ms: {operation}")]
    UpstreamTimeout { operation: String, millis: u64 },

    /// Carrier or sink answered with an error
    #[error("Upstream error: {message}")]
    Upstream { message: String },

    /// Malformed input (routing config, function payload, number format)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Idempotency key already applied
    #[error("Duplicate event: {key}")]
    DuplicateEvent { key: String },

    /// Operation not legal in the current lifecycle state
    #[error("Invalid transition: {message}")]
    InvalidTransition { message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error categories exposed to dashboard clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    NotFound,
    Unauthorized,
    InsufficientFunds,
    UpstreamTimeout,
    Upstream,
    ValidationError,
    DuplicateEvent,
    InvalidTransition,
    Config,
    Internal,
}

impl TelephonyError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition { message: message.into() }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::UpstreamTimeout { .. } => ErrorKind::UpstreamTimeout,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::DuplicateEvent { .. } => ErrorKind::DuplicateEvent,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Config(_) => ErrorKind::Config,
            Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout { .. } | Self::Upstream { .. } | Self::Database(_)
        )
    }
}

impl From<serde_json::Error> for TelephonyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {}", err))
    }
}

impl From<config::ConfigError> for TelephonyError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for TelephonyError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::validation(err.to_string())
    }
}
