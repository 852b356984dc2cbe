//! Z-stack experiment generator.
//!
//! Steps the focus axis through evenly spaced altitudes and fires the
//! configured camera/light groupings at every slice. Representative of the
//! wider family of generators: per-slice motion laid out from handler timing
//! estimates, per-group exposures separated by the global time epsilon, and a
//! defensive hold keeping drift-prone actuators pinned through long exposures.

use std::time::Duration;

use rust_decimal::Decimal;

use super::time_epsilon;
use crate::config::TimingConfig;
use crate::error::{AppResult, ScopeError};
use crate::handler::{HandlerId, HandlerRegistry};
use crate::table::{decimal_secs, ActionParameter, ActionTable};

/// One camera/light pairing exposed at every slice.
#[derive(Debug, Clone)]
pub struct ExposureGroup {
    /// Camera taking the exposure.
    pub camera: HandlerId,
    /// Light providing illumination for it.
    pub light: HandlerId,
    /// Exposure duration.
    pub exposure: Duration,
}

/// Parameters for a Z-stack acquisition.
#[derive(Debug, Clone)]
pub struct ZStackExperiment {
    z_handler: HandlerId,
    groups: Vec<ExposureGroup>,
    num_slices: usize,
    slice_height: f64,
    num_reps: usize,
    rep_duration: Duration,
}

impl ZStackExperiment {
    /// Describe a stack of `num_slices` slices spaced `slice_height` apart,
    /// driven on the `z_handler` axis.
    pub fn new(z_handler: HandlerId, num_slices: usize, slice_height: f64) -> Self {
        Self {
            z_handler,
            groups: Vec::new(),
            num_slices,
            slice_height,
            num_reps: 1,
            rep_duration: Duration::ZERO,
        }
    }

    /// Add a camera/light grouping exposed at every slice.
    pub fn with_group(mut self, camera: HandlerId, light: HandlerId, exposure: Duration) -> Self {
        self.groups.push(ExposureGroup {
            camera,
            light,
            exposure,
        });
        self
    }

    /// Repeat the stack `num_reps` times, each repetition starting
    /// `rep_duration` after the previous one began (or immediately after it
    /// finished, when it runs longer than that).
    pub fn with_reps(mut self, num_reps: usize, rep_duration: Duration) -> Self {
        self.num_reps = num_reps;
        self.rep_duration = rep_duration;
        self
    }

    /// Lay out the complete timeline: sorted, tombstone-free, starting at 0.
    pub fn generate(
        &self,
        registry: &HandlerRegistry,
        timing: &TimingConfig,
    ) -> AppResult<ActionTable> {
        if self.num_slices == 0 {
            return Err(ScopeError::Configuration(
                "Z-stack needs at least one slice".to_string(),
            ));
        }
        if !self.slice_height.is_finite() || self.slice_height < 0.0 {
            return Err(ScopeError::Configuration(format!(
                "invalid slice height {}",
                self.slice_height
            )));
        }

        // Resolve every handler up front; a capability mismatch is a
        // composition error, not a mid-run surprise.
        let z = registry.positioner(self.z_handler)?;
        let mut groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let camera = registry.camera(group.camera)?;
            registry.light(group.light)?;
            groups.push((group, camera));
        }

        let mut table = ActionTable::from_timing(timing);
        let mut current = Decimal::ZERO;
        let mut ready_time = Decimal::ZERO;
        let mut previous_altitude = 0.0;

        for rep in 0..self.num_reps.max(1) {
            let rep_start = current;

            for slice in 0..self.num_slices {
                let altitude = slice as f64 * self.slice_height;
                let (motion, stabilization) = z.movement_time(previous_altitude, altitude);
                table.add_action(
                    current,
                    self.z_handler,
                    ActionParameter::Value(decimal_from(altitude)?),
                );
                current += decimal_secs(motion) + decimal_secs(stabilization);

                let mut exposure_end = current;
                for (index, (group, camera)) in groups.iter().enumerate() {
                    let group_time = current + time_epsilon() * Decimal::from(index as u64);
                    let exposure = decimal_secs(group.exposure);

                    table.add_action(group_time, group.light, ActionParameter::Toggle(true));
                    table.add_action(group_time, group.camera, ActionParameter::Value(exposure));
                    table.add_action(
                        group_time + exposure,
                        group.light,
                        ActionParameter::Toggle(false),
                    );

                    exposure_end = exposure_end.max(group_time + exposure);
                    ready_time = ready_time.max(
                        group_time + exposure + decimal_secs(camera.time_between_exposures()),
                    );
                }

                // Pin the actuator at the target altitude across the exposure
                // window so drift actuators cannot creep mid-exposure.
                table.add_action(
                    exposure_end,
                    self.z_handler,
                    ActionParameter::Value(decimal_from(altitude)?),
                );
                current = exposure_end;
                previous_altitude = altitude;
            }

            // Return to the starting altitude; the final hold waits for the
            // slowest camera so the next repetition can expose immediately.
            let (motion, stabilization) = z.movement_time(previous_altitude, 0.0);
            let return_time = current + decimal_secs(motion) + decimal_secs(stabilization);
            current = return_time.max(ready_time);
            table.add_action(current, self.z_handler, ActionParameter::Value(Decimal::ZERO));
            previous_altitude = 0.0;

            if rep + 1 < self.num_reps {
                let paced = rep_start + decimal_secs(self.rep_duration);
                current = current.max(paced);
            }
        }

        table.sort();
        table.clear_bad_entries();
        table.enforce_positive_timepoints();
        table.validate()?;
        Ok(table)
    }
}

fn decimal_from(value: f64) -> AppResult<Decimal> {
    Decimal::from_f64_retain(value)
        .ok_or_else(|| ScopeError::Configuration(format!("non-finite value {}", value)))
}
