//! # Infra-Common
//!
//! Shared infrastructure for the dialtone crates:
//!
//! - [`logging`]: subscriber setup and structured log contexts
//! - [`errors`]: the common error type used by infrastructure helpers
//! - [`sync`]: per-key async locks for single-writer-per-key sections
//! - [`retry`]: bounded retry with exponential backoff and per-attempt timeouts

pub mod errors;
pub mod logging;
pub mod retry;
pub mod sync;

pub use errors::types::{Error, Result};
pub use logging::context::LogContext;
pub use logging::setup::{setup_logging, LoggingConfig};
pub use retry::{retry_with_policy, AttemptError, AttemptFailure, RetryOutcome, RetryPolicy};
pub use sync::keyed_lock::{KeyedLockGuard, KeyedLocks};
