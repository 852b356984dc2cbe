//! Controller error-code table and classification.
//!
//! Motion controllers report faults through a dedicated error query that returns
//! a single integer line. This module holds the static mapping from code to
//! human-readable description and the classification helpers the command layer
//! uses to decide whether a code is fatal, ignorable, or recoverable by homing.
//!
//! Code 0 conventionally means success. Unknown codes are never dropped
//! silently; they decode to an "unknown error N" description.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// The controller reported no error.
pub const NO_ERROR: i32 = 0;

/// Motion was halted by an operator stop request. Non-fatal.
pub const MOTION_STOPPED_BY_USER: i32 = 8;

/// Codes that mean the axis must be homed before it will accept motion.
pub const HOMING_REQUIRED: [i32; 2] = [10, 13];

static ERROR_DESCRIPTIONS: Lazy<HashMap<i32, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (NO_ERROR, "no error"),
        (1, "motor driver fault"),
        (4, "emergency stop activated"),
        (6, "command does not exist"),
        (7, "parameter out of range"),
        (MOTION_STOPPED_BY_USER, "motion stopped by user"),
        (10, "axis not referenced; home required"),
        (13, "servo disabled; home required"),
        (20, "position following error exceeded"),
        (22, "hardware travel limit reached"),
        (26, "velocity out of range"),
        (38, "command parameter missing"),
    ])
});

/// Decode a numeric error code to its description.
pub fn describe(code: i32) -> String {
    ERROR_DESCRIPTIONS
        .get(&code)
        .map(|s| (*s).to_string())
        .unwrap_or_else(|| format!("unknown error {}", code))
}

/// True when the code means the command succeeded.
pub fn is_success(code: i32) -> bool {
    code == NO_ERROR
}

/// True for operator-initiated stops, which are swallowed rather than raised.
pub fn is_user_abort(code: i32) -> bool {
    code == MOTION_STOPPED_BY_USER
}

/// True for codes recoverable by running the homing workflow.
pub fn needs_homing(code: i32) -> bool {
    HOMING_REQUIRED.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_code_description() {
        assert_eq!(describe(7), "parameter out of range");
        assert_eq!(describe(0), "no error");
    }

    #[test]
    fn test_unknown_code_is_not_silent() {
        assert_eq!(describe(999), "unknown error 999");
    }

    #[test]
    fn test_classification() {
        assert!(is_success(0));
        assert!(!is_success(8));
        assert!(is_user_abort(8));
        assert!(needs_homing(10));
        assert!(needs_homing(13));
        assert!(!needs_homing(20));
    }
}
