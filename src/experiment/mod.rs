//! Experiment generators and the timed executor.
//!
//! Generators turn acquisition parameters into a complete, sorted,
//! positive-time action table, consulting device handlers for movement-timing
//! estimates as they lay out the timeline. The executor then walks the table
//! in time order on the Tokio clock, dispatching each action to its handler.
//!
//! Nominally simultaneous actions are separated by [`time_epsilon`] at
//! generation time. Strict ordering is established by construction, never by
//! sort tie-breaking alone, because exact decimal ties are ambiguous once a
//! table crosses a serialization boundary.

pub mod executor;
pub mod sequencer;
pub mod zstack;

use once_cell::sync::Lazy;
use rust_decimal::Decimal;

pub use executor::{AbortHandle, ExecutionReport, Executor};
pub use sequencer::{minimal_period, steps_between, SequenceExpander};
pub use zstack::{ExposureGroup, ZStackExperiment};

static TIME_EPSILON: Lazy<Decimal> = Lazy::new(|| Decimal::new(1, 10));

/// Offset inserted between nominally simultaneous actions: 1e-10 seconds,
/// far below hardware resolution but enough to fix their relative order.
pub fn time_epsilon() -> Decimal {
    *TIME_EPSILON
}
