//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScopeError`, for the entire library.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failure classes that show up when sequencing microscope hardware,
//! from configuration issues to device-protocol faults and motion-safety vetoes.
//!
//! ## Error Hierarchy
//!
//! `ScopeError` is an enum that consolidates the failure classes:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to file
//!   parsing or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration, such as
//!   inverted axis limits or a degenerate banned rectangle. These are caught during
//!   the validation step, after parsing succeeds.
//! - **`Io`**: Wraps standard `std::io::Error`, covering serial-port and file I/O.
//! - **`Protocol`**: A malformed or unexpected response from a device controller.
//!   The command is aborted but the connection is left open for retry.
//! - **`Device`**: A numeric error code round-tripped from hardware, carrying the
//!   decoded human-readable description. Code 0 means success and never constructs
//!   this variant; "stopped by user" codes are swallowed by the protocol layer and
//!   "needs homing" codes trigger the recovery workflow before this is raised.
//! - **`MotionUnsafe`**: A proposed move would cross a banned region of stage space.
//!   Raised before any command reaches hardware; the pending motion target is rolled
//!   back, so this is always recoverable.
//! - **`TableInvariant`**: A programming error in action-table handling (indexing
//!   past length, executing with unflushed tombstones, unsorted execution). Never
//!   retried.
//! - **`Timeout`**: A serial read deadline expired. Retried a small fixed number of
//!   times inside the protocol layer, then surfaced as fatal for that command only.
//!
//! By using `#[from]`, `ScopeError` can be seamlessly created from underlying error
//! types, simplifying error handling throughout the library with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, ScopeError>;

/// Primary error type for microscope sequencing and device control.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Configuration file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected response from a device controller.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error code reported by the hardware error query.
    #[error("Device error {code}: {description}")]
    Device {
        /// Numeric code returned by the controller's error query.
        code: i32,
        /// Decoded description from the error-code table.
        description: String,
    },

    /// A motion command was vetoed before reaching hardware.
    #[error("Unsafe motion on axis {axis}: {from} -> {to} ({reason})")]
    MotionUnsafe {
        /// Axis the rejected move was issued on.
        axis: usize,
        /// Current position the move would have started from.
        from: f64,
        /// Target position of the rejected move.
        to: f64,
        /// Why the move was rejected.
        reason: String,
    },

    /// Action-table misuse; a programming error, never retried.
    #[error("Action table invariant violated: {0}")]
    TableInvariant(String),

    /// Serial read deadline expired after the retry budget was exhausted.
    #[error("Timed out after {elapsed:?} waiting for device response")]
    Timeout {
        /// Total time spent waiting before giving up.
        elapsed: Duration,
    },

    /// Transport used before a connection was established.
    #[error("Device connection not open")]
    NotConnected,

    /// A handler id or name did not resolve to the expected capability.
    #[error("Handler not available: {0}")]
    HandlerMissing(String),

    /// An action failed during timed execution of a table.
    #[error("Action {index} at t={time}s failed: {source}")]
    ActionFailed {
        /// Index of the failed entry in the executed table.
        index: usize,
        /// Scheduled time of the failed entry, in seconds.
        time: String,
        /// Underlying failure.
        #[source]
        source: Box<ScopeError>,
    },
}

impl ScopeError {
    /// True for failures the caller can retry after local cleanup, without
    /// touching hardware state: safety vetoes and per-command timeouts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScopeError::MotionUnsafe { .. } | ScopeError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScopeError::Device {
            code: 7,
            description: "parameter out of range".to_string(),
        };
        assert_eq!(err.to_string(), "Device error 7: parameter out of range");
    }

    #[test]
    fn test_motion_unsafe_display_names_axis() {
        let err = ScopeError::MotionUnsafe {
            axis: 1,
            from: 0.0,
            to: 50.0,
            reason: "crosses banned rectangle".to_string(),
        };
        assert!(err.to_string().contains("axis 1"));
        assert!(err.to_string().contains("banned"));
    }

    #[test]
    fn test_recoverable_classification() {
        let unsafe_err = ScopeError::MotionUnsafe {
            axis: 0,
            from: 0.0,
            to: 1.0,
            reason: "test".to_string(),
        };
        assert!(unsafe_err.is_recoverable());
        assert!(!ScopeError::TableInvariant("tombstones".into()).is_recoverable());
    }

    #[test]
    fn test_action_failed_chains_source() {
        let err = ScopeError::ActionFailed {
            index: 3,
            time: "1.25".to_string(),
            source: Box::new(ScopeError::Protocol("garbled response".into())),
        };
        assert!(err.to_string().contains("Action 3"));
        assert!(err.to_string().contains("t=1.25s"));
    }
}
