//! The experiment action table.
//!
//! An experiment is an ordered sequence of `(time, handler, parameter)` entries
//! walked by the executor in time order. Times are `rust_decimal::Decimal`
//! seconds so that thousands of chained offsets accumulate exactly, with none
//! of the cumulative drift binary floats pick up across serialization
//! boundaries.
//!
//! Entries reference handlers by stable [`HandlerId`] index; the table never
//! owns handler lifetime. A `None` entry is a tombstone left by in-place edits.
//!
//! Before execution, callers must run `sort()`, `clear_bad_entries()`, and
//! `enforce_positive_timepoints()` in that order; `validate()` rejects a table
//! that skipped any of them. A table is never silently repaired, and indexing
//! past the end panics like any slice access would.

use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::TimingConfig;
use crate::error::{AppResult, ScopeError};
use crate::handler::{HandlerId, HandlerRegistry};

/// Convert a wall-clock duration to exact decimal seconds.
pub fn decimal_secs(duration: Duration) -> Decimal {
    Decimal::from(duration.as_nanos() as i64) / Decimal::from(1_000_000_000_i64)
}

/// Payload of one scheduled action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActionParameter {
    /// Hardware trigger level (the two halves of a pulse).
    Toggle(bool),
    /// A position, voltage, or exposure value.
    Value(Decimal),
    /// Abstract pattern-sequence marker, rewritten into trigger pulses before
    /// execution.
    SequenceIndex(usize),
}

impl fmt::Display for ActionParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionParameter::Toggle(level) => write!(f, "{}", level),
            ActionParameter::Value(value) => write!(f, "{}", value),
            ActionParameter::SequenceIndex(index) => write!(f, "sequence[{}]", index),
        }
    }
}

/// One scheduled instruction: at `time` seconds, apply `parameter` to `handler`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Scheduled time in seconds from experiment start.
    pub time: Decimal,
    /// Stable registry index of the target handler.
    pub handler: HandlerId,
    /// What to do at that time.
    pub parameter: ActionParameter,
}

/// Externally visible form of one action, with the handler name resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    /// Scheduled time as a decimal string.
    pub time: String,
    /// Resolved handler name.
    pub handler: String,
    /// Action payload.
    pub parameter: ActionParameter,
}

/// Ordered experiment timeline with tombstone-aware editing.
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    entries: Vec<Option<Action>>,
    toggle_time: Decimal,
}

impl ActionTable {
    /// Create an empty table with the given toggle pulse width, in seconds.
    pub fn new(toggle_time: Decimal) -> Self {
        Self {
            entries: Vec::new(),
            toggle_time,
        }
    }

    /// Create an empty table using the configured toggle width.
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self::new(decimal_secs(timing.toggle_time))
    }

    /// Width of the pulses produced by [`add_toggle`](Self::add_toggle).
    pub fn toggle_time(&self) -> Decimal {
        self.toggle_time
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry without sorting. Returns `time` unchanged for chaining.
    pub fn add_action(
        &mut self,
        time: Decimal,
        handler: HandlerId,
        parameter: ActionParameter,
    ) -> Decimal {
        self.entries.push(Some(Action {
            time,
            handler,
            parameter,
        }));
        time
    }

    /// Append an on/off pulse pair at `time` and `time + toggle_time`.
    ///
    /// Returns the time of the falling edge.
    pub fn add_toggle(&mut self, time: Decimal, handler: HandlerId) -> Decimal {
        self.add_action(time, handler, ActionParameter::Toggle(true));
        let off = time + self.toggle_time;
        self.add_action(off, handler, ActionParameter::Toggle(false));
        off
    }

    /// Most recent entry for `handler`, scanning from the end.
    ///
    /// Assumes the table is sorted; on an unsorted table this returns the last
    /// inserted entry for the handler instead of the latest-scheduled one.
    pub fn last_action_for(&self, handler: HandlerId) -> Option<(Decimal, ActionParameter)> {
        self.entries
            .iter()
            .rev()
            .flatten()
            .find(|action| action.handler == handler)
            .map(|action| (action.time, action.parameter.clone()))
    }

    /// Stable sort by time only; exact ties keep insertion order.
    ///
    /// Callers that need strict ordering between nominally simultaneous
    /// actions add an epsilon to the later time instead of relying on tie
    /// ordering surviving a round-trip through external formats. Tombstones
    /// sort after all live entries so `clear_bad_entries` can truncate.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| match (a, b) {
            (Some(x), Some(y)) => x.time.cmp(&y.time),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }

    /// Remove all tombstones, preserving the relative order of survivors.
    pub fn clear_bad_entries(&mut self) {
        self.entries.retain(Option::is_some);
    }

    /// Shift the whole timeline so the earliest entry sits at exactly 0.
    ///
    /// Requires the table to already be sorted. When the first time is
    /// negative, the same delta is applied to every entry, preserving all
    /// gaps exactly; otherwise this is a no-op.
    pub fn enforce_positive_timepoints(&mut self) {
        let Some(first) = self.entries.iter().flatten().next().map(|a| a.time) else {
            return;
        };
        if first >= Decimal::ZERO {
            return;
        }
        let delta = -first;
        for action in self.entries.iter_mut().flatten() {
            action.time += delta;
        }
    }

    /// Add `delta` to the time of every entry scheduled at or after
    /// `mark_time`, making room for newly inserted synchronization events
    /// without disturbing earlier actions.
    pub fn shift_actions_back(&mut self, mark_time: Decimal, delta: Decimal) {
        for action in self.entries.iter_mut().flatten() {
            if action.time >= mark_time {
                action.time += delta;
            }
        }
    }

    /// Earliest and latest scheduled times, or `None` for an empty table.
    pub fn first_and_last_times(&self) -> Option<(Decimal, Decimal)> {
        let mut bounds: Option<(Decimal, Decimal)> = None;
        for action in self.entries.iter().flatten() {
            bounds = Some(match bounds {
                None => (action.time, action.time),
                Some((min, max)) => (min.min(action.time), max.max(action.time)),
            });
        }
        bounds
    }

    /// Entry at `index`. Panics on out-of-range access, which is a programming
    /// error and never recovered.
    pub fn get(&self, index: usize) -> Option<&Action> {
        self.entries[index].as_ref()
    }

    /// Replace the entry at `index`; `None` leaves a tombstone. Panics on
    /// out-of-range access.
    pub fn set(&mut self, index: usize, entry: Option<Action>) {
        self.entries[index] = entry;
    }

    /// Iterate live entries in storage order, with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Action)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|action| (i, action)))
    }

    /// Check execution invariants: sorted, tombstone-free, non-negative start.
    pub fn validate(&self) -> AppResult<()> {
        if self.entries.iter().any(Option::is_none) {
            return Err(ScopeError::TableInvariant(
                "tombstones not flushed before execution".to_string(),
            ));
        }
        let mut previous: Option<Decimal> = None;
        for action in self.entries.iter().flatten() {
            if let Some(prev) = previous {
                if action.time < prev {
                    return Err(ScopeError::TableInvariant(format!(
                        "table not sorted: {} follows {}",
                        action.time, prev
                    )));
                }
            }
            previous = Some(action.time);
        }
        if let Some((first, _)) = self.first_and_last_times() {
            if first < Decimal::ZERO {
                return Err(ScopeError::TableInvariant(format!(
                    "negative timepoint {} not enforced away",
                    first
                )));
            }
        }
        Ok(())
    }

    /// Resolve handler names and render one `time  handler  parameter` line
    /// per live entry.
    pub fn render(&self, registry: &HandlerRegistry) -> String {
        let mut out = String::new();
        for (_, action) in self.iter() {
            let name = registry
                .get(action.handler)
                .map(|entry| entry.info.name.as_str())
                .unwrap_or("<unregistered>");
            out.push_str(&format!("{}  {}  {}\n", action.time, name, action.parameter));
        }
        out
    }

    /// Export live entries for an external executor or log.
    pub fn to_rows(&self, registry: &HandlerRegistry) -> Vec<TableRow> {
        self.iter()
            .map(|(_, action)| TableRow {
                time: action.time.to_string(),
                handler: registry
                    .get(action.handler)
                    .map(|entry| entry.info.name.clone())
                    .unwrap_or_else(|| "<unregistered>".to_string()),
                parameter: action.parameter.clone(),
            })
            .collect()
    }
}
