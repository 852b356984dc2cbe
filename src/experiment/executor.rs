//! Timed execution of a validated action table.
//!
//! The executor walks entries in time order on the Tokio clock and dispatches
//! each one to its handler through the registry. A failed action aborts the
//! run and reports which action, at which time, failed; a user abort halts
//! every positioner immediately and ends the run at the next action boundary.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::watch;

use crate::error::{AppResult, ScopeError};
use crate::handler::{HandlerCapability, HandlerRegistry};
use crate::table::{Action, ActionParameter, ActionTable};

/// Outcome of one table run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Actions dispatched before the run ended.
    pub actions_run: usize,
    /// True when the run ended on a user abort rather than completion.
    pub aborted: bool,
}

/// Signals a running executor to stop.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Request an abort. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// Walks a table in time order, dispatching actions to handlers.
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    abort_rx: watch::Receiver<bool>,
}

impl Executor {
    /// Create an executor over the given handlers, plus its abort handle.
    pub fn new(registry: Arc<HandlerRegistry>) -> (Self, AbortHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                registry,
                abort_rx: rx,
            },
            AbortHandle { tx: Arc::new(tx) },
        )
    }

    /// Run a table to completion, abort, or first failure.
    ///
    /// The table must already be sorted, tombstone-free, and start at a
    /// non-negative time; anything else is a [`ScopeError::TableInvariant`].
    pub async fn run(&mut self, table: &ActionTable) -> AppResult<ExecutionReport> {
        table.validate()?;

        let start = tokio::time::Instant::now();
        let mut actions_run = 0;

        for (index, action) in table.iter() {
            let offset = action.time.to_f64().ok_or_else(|| {
                ScopeError::TableInvariant(format!("time {} not representable", action.time))
            })?;
            let deadline = start + Duration::from_secs_f64(offset.max(0.0));

            // Wait out the action's deadline unless an abort arrives first.
            let abort_rx = &mut self.abort_rx;
            let aborted = tokio::time::timeout_at(deadline, async {
                loop {
                    if abort_rx.changed().await.is_err() {
                        // Abort handle dropped; no abort can arrive anymore.
                        std::future::pending::<()>().await;
                    }
                    if *abort_rx.borrow() {
                        break;
                    }
                }
            })
            .await
            .is_ok();

            if aborted {
                warn!("execution aborted before action {}", index);
                self.halt_all().await;
                return Ok(ExecutionReport {
                    actions_run,
                    aborted: true,
                });
            }

            if let Err(e) = self.dispatch(action).await {
                self.halt_all().await;
                return Err(ScopeError::ActionFailed {
                    index,
                    time: action.time.to_string(),
                    source: Box::new(e),
                });
            }
            actions_run += 1;
        }

        info!("table complete: {} actions dispatched", actions_run);
        Ok(ExecutionReport {
            actions_run,
            aborted: false,
        })
    }

    async fn dispatch(&self, action: &Action) -> AppResult<()> {
        let entry = self
            .registry
            .get(action.handler)
            .ok_or_else(|| ScopeError::HandlerMissing(format!("id {}", action.handler.index())))?;

        match (&entry.capability, &action.parameter) {
            (HandlerCapability::Positioner(positioner), ActionParameter::Value(value)) => {
                positioner.move_absolute(decimal_to_f64(value)?).await
            }
            (HandlerCapability::Light(light), ActionParameter::Toggle(level)) => {
                light.set_enabled(*level).await
            }
            (HandlerCapability::Camera(camera), ActionParameter::Value(exposure)) => {
                camera
                    .set_exposure_time(Duration::from_secs_f64(decimal_to_f64(exposure)?))
                    .await?;
                camera.expose().await
            }
            // A camera on a trigger pulse exposes on the rising edge only.
            (HandlerCapability::Camera(camera), ActionParameter::Toggle(true)) => {
                camera.expose().await
            }
            (HandlerCapability::Camera(_), ActionParameter::Toggle(false)) => Ok(()),
            (_, ActionParameter::SequenceIndex(_)) => Err(ScopeError::TableInvariant(format!(
                "unexpanded sequence marker for '{}'",
                entry.info.name
            ))),
            (capability, parameter) => Err(ScopeError::TableInvariant(format!(
                "'{}' ({}) cannot apply parameter {}",
                entry.info.name,
                capability.kind(),
                parameter
            ))),
        }
    }

    async fn halt_all(&self) {
        for (_, positioner) in self.registry.positioners() {
            if let Err(e) = positioner.halt().await {
                warn!("halt failed: {}", e);
            }
        }
    }
}

fn decimal_to_f64(value: &rust_decimal::Decimal) -> AppResult<f64> {
    value
        .to_f64()
        .ok_or_else(|| ScopeError::TableInvariant(format!("value {} not representable", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{
        Camera, HandlerCapability, HandlerId, HandlerInfo, MockCamera, MockLight, MockPositioner,
    };
    use rust_decimal_macros::dec;

    struct Rig {
        registry: Arc<HandlerRegistry>,
        z: HandlerId,
        z_mock: Arc<MockPositioner>,
        camera: HandlerId,
        camera_mock: Arc<MockCamera>,
        light: HandlerId,
        light_mock: Arc<MockLight>,
    }

    fn rig() -> Rig {
        let z_mock = MockPositioner::shared(100.0);
        let camera_mock = MockCamera::shared(Duration::from_millis(20));
        let light_mock = MockLight::shared();

        let mut registry = HandlerRegistry::new();
        let z = registry.add(
            HandlerInfo::with_axis("z piezo", "stage", 3),
            HandlerCapability::Positioner(z_mock.clone()),
        );
        let camera = registry.add(
            HandlerInfo::new("west camera", "cameras"),
            HandlerCapability::Camera(camera_mock.clone()),
        );
        let light = registry.add(
            HandlerInfo::new("488 laser", "lights"),
            HandlerCapability::Light(light_mock.clone()),
        );

        Rig {
            registry: Arc::new(registry),
            z,
            z_mock,
            camera,
            camera_mock,
            light,
            light_mock,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_in_time_order() {
        let rig = rig();
        let mut table = ActionTable::new(dec!(0.01));
        table.add_action(dec!(0), rig.z, ActionParameter::Value(dec!(1.5)));
        table.add_action(dec!(0.1), rig.light, ActionParameter::Toggle(true));
        table.add_action(dec!(0.2), rig.camera, ActionParameter::Value(dec!(0.05)));
        table.add_action(dec!(0.3), rig.light, ActionParameter::Toggle(false));
        table.sort();

        let (mut executor, _abort) = Executor::new(rig.registry.clone());
        let report = executor.run(&table).await.unwrap();

        assert_eq!(
            report,
            ExecutionReport {
                actions_run: 4,
                aborted: false
            }
        );
        assert_eq!(rig.z_mock.moves().await, vec![1.5]);
        assert_eq!(rig.light_mock.transitions().await, vec![true, false]);
        assert_eq!(rig.camera_mock.exposures().await, 1);
        assert_eq!(
            rig.camera_mock.exposure_time().await.unwrap(),
            Duration::from_millis(50)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unvalidated_table_is_rejected() {
        let rig = rig();
        let mut table = ActionTable::new(dec!(0.01));
        table.add_action(dec!(1), rig.z, ActionParameter::Value(dec!(1)));
        table.add_action(dec!(0.5), rig.z, ActionParameter::Value(dec!(2)));
        // Not sorted.

        let (mut executor, _abort) = Executor::new(rig.registry.clone());
        let err = executor.run(&table).await.unwrap_err();
        assert!(matches!(err, ScopeError::TableInvariant(_)));
        assert!(rig.z_mock.moves().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_action_reports_index_and_time() {
        let rig = rig();
        let mut table = ActionTable::new(dec!(0.01));
        table.add_action(dec!(0), rig.light, ActionParameter::Toggle(true));
        // A light cannot apply a numeric value; dispatch fails here.
        table.add_action(dec!(0.25), rig.light, ActionParameter::Value(dec!(3)));
        table.sort();

        let (mut executor, _abort) = Executor::new(rig.registry.clone());
        let err = executor.run(&table).await.unwrap_err();
        match err {
            ScopeError::ActionFailed { index, time, .. } => {
                assert_eq!(index, 1);
                assert_eq!(time, "0.25");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // The failure halted the stage defensively.
        assert!(rig.z_mock.was_halted().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_halts_positioners() {
        let rig = rig();
        let mut table = ActionTable::new(dec!(0.01));
        table.add_action(dec!(0), rig.z, ActionParameter::Value(dec!(1)));
        table.add_action(dec!(60), rig.z, ActionParameter::Value(dec!(2)));
        table.sort();

        let (mut executor, abort) = Executor::new(rig.registry.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            abort.abort();
        });

        let report = executor.run(&table).await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.actions_run, 1);
        assert!(rig.z_mock.was_halted().await);
        // The 60-second action never fired.
        assert_eq!(rig.z_mock.moves().await, vec![1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_marker_left_in_table_is_invariant_error() {
        let rig = rig();
        let mut table = ActionTable::new(dec!(0.01));
        table.add_action(dec!(0), rig.light, ActionParameter::SequenceIndex(2));
        table.sort();

        let (mut executor, _abort) = Executor::new(rig.registry.clone());
        let err = executor.run(&table).await.unwrap_err();
        match err {
            ScopeError::ActionFailed { source, .. } => {
                assert!(matches!(*source, ScopeError::TableInvariant(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
