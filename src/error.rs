use std::time::Duration;

use thiserror::Error;

/// Boxed error type used at the transport seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced to callers of [`Client::request`](crate::Client::request).
///
/// Admission rejections (`QueueFull`, `QueueTimeout`, `CircuitOpen`) are
/// local decisions made before any outbound I/O; they never feed the
/// breaker's outcome window. `RequestTimeout` and `Transport` are outcomes
/// of an admitted request and count as breaker failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The limiter's wait queue was full (or queueing is disabled).
    #[error("wait queue full (max_queue = {max_queue})")]
    QueueFull { max_queue: usize },

    /// The request waited in the queue longer than `enqueue_timeout`.
    #[error("timed out waiting for a permit after {waited:?}")]
    QueueTimeout { waited: Duration },

    /// The circuit for this upstream is open; retry after `retry_after`.
    #[error("circuit open for '{key}', retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// The outbound exchange did not complete within the request deadline.
    #[error("request deadline of {deadline:?} exceeded")]
    RequestTimeout { deadline: Duration },

    /// The request URL has no host component to derive a breaker key from.
    #[error("request URL has no host: {url}")]
    InvalidUrl { url: String },

    /// Any other transport failure (connect, TLS, protocol), surfaced as-is.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
}

impl Error {
    /// Short stable name used in `request:failure` event payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Error::QueueFull { .. } => "QueueFull",
            Error::QueueTimeout { .. } => "QueueTimeout",
            Error::CircuitOpen { .. } => "CircuitOpen",
            Error::RequestTimeout { .. } => "RequestTimeout",
            Error::InvalidUrl { .. } => "InvalidUrl",
            Error::Transport(_) => "Transport",
        }
    }
}

/// Configuration validation errors, reported by
/// [`ClientBuilder::build`](crate::ClientBuilder::build).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_in_flight must be greater than 0")]
    MaxInFlight,

    #[error("enqueue_timeout must be greater than 0")]
    EnqueueTimeout,

    #[error("request_timeout must be greater than 0")]
    RequestTimeout,

    #[error("breaker.window_size must be greater than 0")]
    WindowSize,

    #[error("breaker.failure_threshold must be within 0.0..=1.0, got {0}")]
    FailureThreshold(f64),

    #[error("breaker.cooldown must be greater than 0")]
    Cooldown,

    #[error("breaker.half_open_probe_count must be greater than 0")]
    HalfOpenProbeCount,
}
