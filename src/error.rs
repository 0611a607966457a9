//! Main Crate Error

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Kadmesh crate error enum.
pub enum Error {
    /// A stop-condition configuration was built with a negative count.
    #[error("Invalid configuration: {field} must not be negative (got {value})")]
    InvalidConfig {
        /// Name of the rejected field.
        field: &'static str,
        /// The rejected value.
        value: i64,
    },

    /// Routing could not reach any peer although it had candidates to ask.
    #[error("No usable route: {0}")]
    NoRoute(String),

    /// The fan-out exhausted its failure budget before collecting enough results.
    #[error("Fan-out failed after {successes} successes and {failures} failures: {reason}")]
    FanoutFailed {
        /// Requests that completed successfully.
        successes: usize,
        /// Requests that failed.
        failures: usize,
        /// Human readable reason.
        reason: String,
    },

    /// Connections could not be reserved before the operation could start.
    #[error("Could not reserve connections: {0}")]
    Reservation(String),

    /// The operation or request was cancelled before it completed.
    #[error("Cancelled")]
    Cancelled,

    /// A single peer request failed (timeout, refused, unreachable..).
    #[error("Request failed: {0}")]
    Request(String),

    /// A verb that needs an exact number of replicas got fewer.
    #[error("Expected {expected} results, but got {actual}")]
    MinimumNotReached {
        /// Requested minimum.
        expected: usize,
        /// Replicas that actually answered.
        actual: usize,
    },

    /// An aggregation scheme was asked to reduce a result type it does not support.
    #[error("Cannot evaluate: {0}")]
    Evaluation(&'static str),

    /// Identifier bytes had the wrong length.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Identifier string was not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),
}

/// Alias for `Result<T, kadmesh::Error>`.
pub type Result<T, E = Error> = core::result::Result<T, E>;
