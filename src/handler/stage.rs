//! Stage axis handler speaking the motion-controller wire protocol.
//!
//! Each controller axis gets its own handler. A handler owns the axis's soft
//! limits, its cached position, and its pending motion target; the serial
//! connection itself is shared through a [`CommandChannel`] and is never
//! written to by any other component.
//!
//! ## Motion lifecycle
//!
//! `Idle -> Moving -> Idle`. A move enters `Moving` by setting the motion
//! target and issuing `{axis}PA{position}`; a background watcher polls
//! `{axis}TP` each polling interval and exits once the position delta stays
//! under the settle epsilon for one interval, publishing a single
//! [`AxisEvent::Stopped`] per motion episode and clearing the target.
//!
//! A second move on an axis whose target is still pending is a no-op, which
//! prevents command stacking from queuing unbounded travel.
//!
//! ## Abort latency
//!
//! `halt` sends the hardware stop command immediately, but the watcher only
//! observes the abort on its next iteration, so the stop notification can lag
//! by up to one polling interval (bounded at 150 ms by configuration).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{broadcast, watch, Mutex};

use super::{AxisEvent, HandlerInfo, Positioner};
use crate::config::TimingConfig;
use crate::error::{AppResult, ScopeError};
use crate::protocol::CommandChannel;
use crate::safety::MotionChecker;

/// Last known XY position of the stage, shared by the two plane axes.
///
/// Each axis handler updates its own component; safety checks snapshot the
/// pair. Kept behind its own lock rather than as free-floating state.
#[derive(Clone, Default)]
pub struct SharedPlanePosition {
    inner: Arc<StdMutex<[f64; 2]>>,
}

impl SharedPlanePosition {
    /// Create a shared position at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh reading for one plane component (0 = x, 1 = y).
    pub fn update(&self, role: usize, value: f64) {
        self.lock()[role] = value;
    }

    /// Current `[x, y]` pair.
    pub fn snapshot(&self) -> [f64; 2] {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [f64; 2]> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One controller axis, addressed as `{axis}PA` / `{axis}TP` / `{axis}ST`
/// on the wire.
pub struct StageAxisHandler {
    info: HandlerInfo,
    axis: usize,
    channel: CommandChannel,

    limits: Mutex<(f64, f64)>,
    cached_position: Arc<Mutex<f64>>,
    motion_target: Arc<Mutex<Option<f64>>>,

    // Safety wiring; absent for axes outside the XY plane.
    checker: Option<Arc<MotionChecker>>,
    plane: SharedPlanePosition,
    plane_role: Option<usize>,

    // Motion profile used for timeline estimates.
    velocity: f64,
    stabilization: Duration,

    polling_interval: Duration,
    settle_epsilon: f64,

    events_tx: broadcast::Sender<AxisEvent>,
    abort_tx: watch::Sender<bool>,
}

impl StageAxisHandler {
    /// Create a handler for `axis` with wide-open soft limits.
    pub fn new(
        info: HandlerInfo,
        axis: usize,
        channel: CommandChannel,
        timing: &TimingConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let (abort_tx, _) = watch::channel(false);

        Self {
            info,
            axis,
            channel,
            limits: Mutex::new((f64::NEG_INFINITY, f64::INFINITY)),
            cached_position: Arc::new(Mutex::new(0.0)),
            motion_target: Arc::new(Mutex::new(None)),
            checker: None,
            plane: SharedPlanePosition::new(),
            plane_role: None,
            velocity: 5.0,
            stabilization: Duration::from_millis(50),
            polling_interval: timing.polling_interval,
            settle_epsilon: timing.settle_epsilon,
            events_tx,
            abort_tx,
        }
    }

    /// Set the soft travel limits.
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Mutex::new((min, max));
        self
    }

    /// Wire this axis into the XY safety plane as component `role`
    /// (0 = x, 1 = y).
    pub fn with_safety(
        mut self,
        checker: Arc<MotionChecker>,
        plane: SharedPlanePosition,
        role: usize,
    ) -> Self {
        self.checker = Some(checker);
        self.plane = plane;
        self.plane_role = Some(role);
        self
    }

    /// Set the motion profile used for `movement_time` estimates.
    pub fn with_motion_profile(mut self, velocity: f64, stabilization: Duration) -> Self {
        self.velocity = velocity;
        self.stabilization = stabilization;
        self
    }

    /// Handler identity.
    pub fn info(&self) -> &HandlerInfo {
        &self.info
    }

    /// Subscribe to motion status notifications.
    pub fn events(&self) -> broadcast::Receiver<AxisEvent> {
        self.events_tx.subscribe()
    }

    async fn query_position(&self) -> AppResult<f64> {
        let response = self.channel.query_value(&format!("{}TP", self.axis)).await?;
        let position = response.trim().parse::<f64>().map_err(|_| {
            ScopeError::Protocol(format!("malformed position response: '{}'", response))
        })?;
        *self.cached_position.lock().await = position;
        if let Some(role) = self.plane_role {
            self.plane.update(role, position);
        }
        Ok(position)
    }

    async fn clear_target(&self) {
        *self.motion_target.lock().await = None;
    }

    fn spawn_watcher(&self) {
        let channel = self.channel.clone();
        let cached = self.cached_position.clone();
        let target = self.motion_target.clone();
        let plane = self.plane.clone();
        let plane_role = self.plane_role;
        let events = self.events_tx.clone();
        let abort = self.abort_tx.subscribe();
        let axis = self.axis;
        let interval = self.polling_interval;
        let epsilon = self.settle_epsilon;

        tokio::spawn(async move {
            let mut previous = f64::NAN;
            loop {
                tokio::time::sleep(interval).await;
                let aborted = *abort.borrow();

                let position = match channel.query_value(&format!("{}TP", axis)).await {
                    Ok(response) => match response.trim().parse::<f64>() {
                        Ok(position) => position,
                        Err(_) => {
                            warn!("axis {} watcher: malformed position '{}'", axis, response);
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!("axis {} watcher: position poll failed: {}", axis, e);
                        *target.lock().await = None;
                        break;
                    }
                };

                *cached.lock().await = position;
                if let Some(role) = plane_role {
                    plane.update(role, position);
                }

                let converged = !previous.is_nan() && (position - previous).abs() < epsilon;
                if aborted || converged {
                    *target.lock().await = None;
                    let _ = events.send(AxisEvent::Stopped {
                        axis,
                        position,
                        timestamp: Utc::now(),
                    });
                    debug!(
                        "axis {} settled at {} ({})",
                        axis,
                        position,
                        if aborted { "aborted" } else { "converged" }
                    );
                    break;
                }
                previous = position;
            }
        });
    }
}

#[async_trait]
impl Positioner for StageAxisHandler {
    async fn move_absolute(&self, position: f64) -> AppResult<()> {
        {
            let mut target = self.motion_target.lock().await;
            if let Some(pending) = *target {
                debug!(
                    "axis {} move to {} ignored; motion to {} still pending",
                    self.axis, position, pending
                );
                return Ok(());
            }
            *target = Some(position);
        }

        let current = match self.query_position().await {
            Ok(position) => position,
            Err(e) => {
                self.clear_target().await;
                return Err(e);
            }
        };

        let (min, max) = *self.limits.lock().await;
        if position < min || position > max {
            self.clear_target().await;
            return Err(ScopeError::MotionUnsafe {
                axis: self.axis,
                from: current,
                to: position,
                reason: format!("target outside soft limits [{}, {}]", min, max),
            });
        }

        if let (Some(checker), Some(role)) = (&self.checker, self.plane_role) {
            let from = self.plane.snapshot();
            let mut to = from;
            to[role] = position;
            if let Err(e) = checker.check_move(self.axis, (from[0], from[1]), (to[0], to[1])) {
                self.clear_target().await;
                return Err(e);
            }
        }

        // Fresh motion episode; reset the abort latch from any earlier halt.
        self.abort_tx.send_replace(false);

        let command = format!("{}PA{}", self.axis, position);
        let home = format!("{}OR", self.axis);
        if let Err(e) = self.channel.command(&command, Some(&home)).await {
            self.clear_target().await;
            return Err(e);
        }

        self.spawn_watcher();
        info!("axis {} moving {} -> {}", self.axis, current, position);
        Ok(())
    }

    async fn move_relative(&self, delta: f64) -> AppResult<()> {
        if delta == 0.0 {
            return Ok(());
        }
        let current = *self.cached_position.lock().await;
        self.move_absolute(current + delta).await
    }

    async fn position(&self, use_cache: bool) -> AppResult<f64> {
        if use_cache {
            Ok(*self.cached_position.lock().await)
        } else {
            self.query_position().await
        }
    }

    fn movement_time(&self, start: f64, end: f64) -> (Duration, Duration) {
        let motion = if self.velocity > 0.0 {
            Duration::from_secs_f64((end - start).abs() / self.velocity)
        } else {
            Duration::ZERO
        };
        (motion, self.stabilization)
    }

    async fn set_safety(&self, value: f64, is_max: bool) -> AppResult<()> {
        {
            let mut limits = self.limits.lock().await;
            let proposed = if is_max {
                (limits.0, value)
            } else {
                (value, limits.1)
            };
            if proposed.0 >= proposed.1 {
                return Err(ScopeError::Configuration(format!(
                    "axis {} soft limits inverted: [{}, {}]",
                    self.axis, proposed.0, proposed.1
                )));
            }
            *limits = proposed;
        }

        // SL/SR mirror the soft limits into the controller.
        let command = if is_max {
            format!("{}SR{}", self.axis, value)
        } else {
            format!("{}SL{}", self.axis, value)
        };
        self.channel.command(&command, None).await
    }

    async fn halt(&self) -> AppResult<()> {
        self.abort_tx.send_replace(true);
        self.channel
            .command(&format!("{}ST", self.axis), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::protocol::MockTransport;
    use crate::safety::BannedRectangle;
    use tokio::time::timeout;

    fn timing() -> TimingConfig {
        TimingConfig {
            polling_interval: Duration::from_millis(10),
            ..TimingConfig::default()
        }
    }

    fn handler_on(mock: &MockTransport, axis: usize) -> StageAxisHandler {
        let channel = CommandChannel::new(Box::new(mock.clone()), 1);
        StageAxisHandler::new(
            HandlerInfo::with_axis(format!("axis {}", axis), "stage", axis),
            axis,
            channel,
            &timing(),
        )
    }

    async fn wait_for_stop(events: &mut broadcast::Receiver<AxisEvent>) -> AxisEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no stop event within deadline")
            .expect("event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_issues_command_and_settles() {
        let mock = MockTransport::new();
        mock.push_response("1TP", "0.0");
        mock.latch_response("1TP", "10.0");

        let handler = handler_on(&mock, 1);
        let mut events = handler.events();

        handler.move_absolute(10.0).await.unwrap();
        assert!(mock.sent_with_prefix("1PA10"));

        let AxisEvent::Stopped { axis, position, .. } = wait_for_stop(&mut events).await;
        assert_eq!(axis, 1);
        assert_eq!(position, 10.0);
        assert_eq!(handler.position(true).await.unwrap(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_move_while_pending_is_noop() {
        let mock = MockTransport::new();
        // Initial fresh read, then a slow crawl so the watcher stays busy.
        mock.push_response("1TP", "0.0");
        for i in 0..50 {
            mock.push_response("1TP", &format!("{}.0", i));
        }
        mock.latch_response("1TP", "50.0");

        let handler = handler_on(&mock, 1);
        let mut events = handler.events();

        handler.move_absolute(50.0).await.unwrap();
        handler.move_absolute(99.0).await.unwrap();

        // Only the first target reached the wire.
        assert_eq!(mock.count_with_prefix("1PA"), 1);
        assert!(mock.sent_with_prefix("1PA50"));
        assert!(!mock.sent_with_prefix("1PA99"));

        let _ = wait_for_stop(&mut events).await;

        // Axis idle again; a new move goes through.
        handler.move_absolute(99.0).await.unwrap();
        assert!(mock.sent_with_prefix("1PA99"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_move_never_reaches_hardware() {
        let mock = MockTransport::new();
        mock.latch_response("1TP", "0.0");

        let checker = Arc::new(MotionChecker::new(vec![BannedRectangle::new(
            (4.0, -1.0),
            (6.0, 1.0),
        )]));
        let plane = SharedPlanePosition::new();
        let handler = handler_on(&mock, 1).with_safety(checker, plane, 0);

        let err = handler.move_absolute(10.0).await.unwrap_err();
        assert!(matches!(err, ScopeError::MotionUnsafe { .. }));
        assert!(!mock.sent_with_prefix("1PA"));

        // Target rolled back: a safe move afterwards is accepted.
        handler.move_absolute(2.0).await.unwrap();
        assert!(mock.sent_with_prefix("1PA2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_limit_veto_rolls_back_target() {
        let mock = MockTransport::new();
        mock.latch_response("2TP", "0.0");

        let handler = handler_on(&mock, 2).with_limits(-5.0, 5.0);

        let err = handler.move_absolute(50.0).await.unwrap_err();
        assert!(matches!(err, ScopeError::MotionUnsafe { .. }));
        assert!(!mock.sent_with_prefix("2PA"));

        handler.move_absolute(3.0).await.unwrap();
        assert!(mock.sent_with_prefix("2PA3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_relative_zero_delta_is_noop() {
        let mock = MockTransport::new();
        let handler = handler_on(&mock, 1);

        handler.move_relative(0.0).await.unwrap();
        assert!(mock.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_position_skips_hardware() {
        let mock = MockTransport::new();
        mock.latch_response("1TP", "7.5");

        let handler = handler_on(&mock, 1);
        assert_eq!(handler.position(false).await.unwrap(), 7.5);
        let queries_after_fresh = mock.count_with_prefix("1TP");

        assert_eq!(handler.position(true).await.unwrap(), 7.5);
        assert_eq!(mock.count_with_prefix("1TP"), queries_after_fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_stops_within_one_polling_interval() {
        let mock = MockTransport::new();
        mock.push_response("1TP", "0.0");
        // Position keeps changing, so only the abort can end the episode.
        for i in 0..500 {
            mock.push_response("1TP", &format!("{}.0", i));
        }

        let handler = handler_on(&mock, 1);
        let mut events = handler.events();

        handler.move_absolute(500.0).await.unwrap();
        handler.halt().await.unwrap();
        assert!(mock.sent_with_prefix("1ST"));

        let started = tokio::time::Instant::now();
        let _ = wait_for_stop(&mut events).await;
        // One polling interval plus scheduling slack.
        assert!(started.elapsed() <= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_event_published_exactly_once() {
        let mock = MockTransport::new();
        mock.push_response("1TP", "0.0");
        mock.latch_response("1TP", "10.0");

        let handler = handler_on(&mock, 1);
        let mut events = handler.events();

        handler.move_absolute(10.0).await.unwrap();
        let _ = wait_for_stop(&mut events).await;

        // Let several more intervals elapse; no further events appear.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_safety_mirrors_limits_to_controller() {
        let mock = MockTransport::new();
        let handler = handler_on(&mock, 1);

        handler.set_safety(100.0, true).await.unwrap();
        handler.set_safety(-100.0, false).await.unwrap();
        assert!(mock.sent_with_prefix("1SR100"));
        assert!(mock.sent_with_prefix("1SL-100"));

        let err = handler.set_safety(500.0, false).await.unwrap_err();
        assert!(err.to_string().contains("inverted"));
    }
}
