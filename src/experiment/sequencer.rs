//! Pattern-sequence support for structured-illumination style devices.
//!
//! Some devices step through a fixed internal sequence of patterns and only
//! expose a "advance one step" trigger line. Generators schedule abstract
//! [`ActionParameter::SequenceIndex`] markers; before execution a
//! [`SequenceExpander`] rewrites each marker into the concrete burst of
//! trigger pulses that walks the device from its current pattern index to the
//! requested one, shifting later actions back to make room.

use rust_decimal::Decimal;

use crate::error::{AppResult, ScopeError};
use crate::handler::HandlerId;
use crate::table::{ActionParameter, ActionTable};

/// Smallest period of `frames`: the least `k` dividing `frames.len()` such
/// that the sequence is the first `k` elements repeated. Returns the full
/// length for an aperiodic sequence and 0 for an empty one.
pub fn minimal_period<T: PartialEq>(frames: &[T]) -> usize {
    let len = frames.len();
    for period in 1..=len / 2 {
        if len % period != 0 {
            continue;
        }
        if frames
            .chunks(period)
            .all(|chunk| chunk == &frames[..period])
        {
            return period;
        }
    }
    len
}

/// Trigger pulses needed to advance a cyclic sequence of length `len` from
/// index `from` to index `to`: `(to - from) mod len`.
pub fn steps_between(from: usize, to: usize, len: usize) -> AppResult<usize> {
    if len == 0 {
        return Err(ScopeError::Configuration(
            "sequence stepping over an empty sequence".to_string(),
        ));
    }
    if from >= len || to >= len {
        return Err(ScopeError::Configuration(format!(
            "sequence index out of range: {} -> {} in sequence of length {}",
            from, to, len
        )));
    }
    Ok((to + len - from) % len)
}

/// Rewrites abstract sequence markers into concrete trigger bursts.
#[derive(Debug, Clone)]
pub struct SequenceExpander {
    trigger: HandlerId,
    sequence_len: usize,
    settling_time: Decimal,
}

impl SequenceExpander {
    /// Expander for a device with `sequence_len` patterns, pulsed on the
    /// `trigger` handler and needing `settling_time` seconds after a burst.
    pub fn new(trigger: HandlerId, sequence_len: usize, settling_time: Decimal) -> Self {
        Self {
            trigger,
            sequence_len,
            settling_time,
        }
    }

    /// Derive the sequence length from per-frame parameters by detecting
    /// their minimal repeating unit.
    pub fn from_frames<T: PartialEq>(
        trigger: HandlerId,
        frames: &[T],
        settling_time: Decimal,
    ) -> Self {
        Self::new(trigger, minimal_period(frames), settling_time)
    }

    /// Sequence length this expander steps over.
    pub fn sequence_len(&self) -> usize {
        self.sequence_len
    }

    /// Replace every `SequenceIndex` marker in `table` with trigger pulses.
    ///
    /// Markers are consumed in time order, tracking the device's pattern
    /// index across the run (starting at 0). Each burst of `n` pulses claims
    /// `settling_time + 2 * n * toggle_time` seconds: all actions at or after
    /// the marker are shifted back by that amount before the pulses are laid
    /// in. The table comes back sorted and tombstone-free.
    pub fn expand(&self, table: &mut ActionTable) -> AppResult<()> {
        if self.sequence_len == 0 {
            return Err(ScopeError::Configuration(
                "cannot expand markers for an empty sequence".to_string(),
            ));
        }

        let toggle_time = table.toggle_time();
        let mut current_index = 0usize;

        while let Some((index, time, target)) = next_marker(table) {
            let pulses = steps_between(current_index, target, self.sequence_len)?;
            table.set(index, None);

            if pulses > 0 {
                let dt = self.settling_time
                    + Decimal::from(2 * pulses as u64) * toggle_time;
                table.shift_actions_back(time, dt);

                let mut edge = time;
                for _ in 0..pulses {
                    edge = table.add_toggle(edge, self.trigger) + toggle_time;
                }
            }

            current_index = target;
        }

        table.sort();
        table.clear_bad_entries();
        Ok(())
    }
}

/// Earliest remaining sequence marker, by scheduled time then storage order.
fn next_marker(table: &ActionTable) -> Option<(usize, Decimal, usize)> {
    table
        .iter()
        .filter_map(|(index, action)| match action.parameter {
            ActionParameter::SequenceIndex(target) => Some((index, action.time, target)),
            _ => None,
        })
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}
