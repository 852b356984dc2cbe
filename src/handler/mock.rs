//! Mock handlers that complete every operation instantly.
//!
//! Used by experiment-generator and executor tests, and usable as stand-ins
//! for hardware that is absent on a development machine. Every operation is
//! recorded so tests can assert on the order of what "hardware" was asked
//! to do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Camera, LightSource, Positioner};
use crate::error::{AppResult, ScopeError};

/// A positioner that teleports to its target.
pub struct MockPositioner {
    position: Mutex<f64>,
    velocity: f64,
    stabilization: Duration,
    moves: Mutex<Vec<f64>>,
    halted: Mutex<bool>,
    limits: Mutex<(f64, f64)>,
}

impl MockPositioner {
    /// Create a mock axis moving at `velocity` units per second.
    pub fn new(velocity: f64) -> Self {
        Self {
            position: Mutex::new(0.0),
            velocity,
            stabilization: Duration::from_millis(5),
            moves: Mutex::new(Vec::new()),
            halted: Mutex::new(false),
            limits: Mutex::new((f64::NEG_INFINITY, f64::INFINITY)),
        }
    }

    /// Override the fixed stabilization time.
    pub fn with_stabilization(mut self, stabilization: Duration) -> Self {
        self.stabilization = stabilization;
        self
    }

    /// Every absolute target commanded so far, in order.
    pub async fn moves(&self) -> Vec<f64> {
        self.moves.lock().await.clone()
    }

    /// True once `halt` has been called.
    pub async fn was_halted(&self) -> bool {
        *self.halted.lock().await
    }

    /// Convenience for building an `Arc`ed mock.
    pub fn shared(velocity: f64) -> Arc<Self> {
        Arc::new(Self::new(velocity))
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    async fn move_absolute(&self, position: f64) -> AppResult<()> {
        *self.position.lock().await = position;
        self.moves.lock().await.push(position);
        Ok(())
    }

    async fn move_relative(&self, delta: f64) -> AppResult<()> {
        if delta == 0.0 {
            return Ok(());
        }
        let current = *self.position.lock().await;
        self.move_absolute(current + delta).await
    }

    async fn position(&self, _use_cache: bool) -> AppResult<f64> {
        Ok(*self.position.lock().await)
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
        let mut limits = self.limits.lock().await;
        let proposed = if is_max {
            (limits.0, value)
        } else {
            (value, limits.1)
        };
        if proposed.0 >= proposed.1 {
            return Err(ScopeError::Configuration(format!(
                "soft limits inverted: [{}, {}]",
                proposed.0, proposed.1
            )));
        }
        *limits = proposed;
        Ok(())
    }

    async fn halt(&self) -> AppResult<()> {
        *self.halted.lock().await = true;
        Ok(())
    }
}

/// A light source that just records its switching history.
#[derive(Default)]
pub struct MockLight {
    enabled: Mutex<bool>,
    transitions: Mutex<Vec<bool>>,
}

impl MockLight {
    /// Create a mock light, initially off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every level transition commanded so far, in order.
    pub async fn transitions(&self) -> Vec<bool> {
        self.transitions.lock().await.clone()
    }

    /// Convenience for building an `Arc`ed mock.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl LightSource for MockLight {
    async fn set_enabled(&self, enabled: bool) -> AppResult<()> {
        *self.enabled.lock().await = enabled;
        self.transitions.lock().await.push(enabled);
        Ok(())
    }

    async fn is_enabled(&self) -> AppResult<bool> {
        Ok(*self.enabled.lock().await)
    }
}

/// A camera that exposes instantly with a configurable readout dead time.
pub struct MockCamera {
    exposure: Mutex<Duration>,
    readout: Duration,
    exposures: Mutex<usize>,
}

impl MockCamera {
    /// Create a mock camera with the given readout dead time.
    pub fn new(readout: Duration) -> Self {
        Self {
            exposure: Mutex::new(Duration::from_millis(100)),
            readout,
            exposures: Mutex::new(0),
        }
    }

    /// Number of exposures taken so far.
    pub async fn exposures(&self) -> usize {
        *self.exposures.lock().await
    }

    /// Convenience for building an `Arc`ed mock.
    pub fn shared(readout: Duration) -> Arc<Self> {
        Arc::new(Self::new(readout))
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn set_exposure_time(&self, exposure: Duration) -> AppResult<()> {
        *self.exposure.lock().await = exposure;
        Ok(())
    }

    async fn exposure_time(&self) -> AppResult<Duration> {
        Ok(*self.exposure.lock().await)
    }

    fn time_between_exposures(&self) -> Duration {
        self.readout
    }

    async fn expose(&self) -> AppResult<()> {
        *self.exposures.lock().await += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_positioner_records_moves() {
        let axis = MockPositioner::new(10.0);
        axis.move_absolute(5.0).await.unwrap();
        axis.move_relative(2.5).await.unwrap();
        axis.move_relative(0.0).await.unwrap();

        assert_eq!(axis.moves().await, vec![5.0, 7.5]);
        assert_eq!(axis.position(true).await.unwrap(), 7.5);
    }

    #[tokio::test]
    async fn test_mock_positioner_movement_time_scales_with_distance() {
        let axis = MockPositioner::new(10.0).with_stabilization(Duration::from_millis(20));
        let (motion, stabilization) = axis.movement_time(0.0, 25.0);
        assert_eq!(motion, Duration::from_secs_f64(2.5));
        assert_eq!(stabilization, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_mock_positioner_rejects_inverted_limits() {
        let axis = MockPositioner::new(10.0);
        axis.set_safety(100.0, true).await.unwrap();
        let err = axis.set_safety(200.0, false).await.unwrap_err();
        assert!(err.to_string().contains("inverted"));
    }

    #[tokio::test]
    async fn test_mock_light_transitions() {
        let light = MockLight::new();
        light.set_enabled(true).await.unwrap();
        light.set_enabled(false).await.unwrap();
        assert_eq!(light.transitions().await, vec![true, false]);
        assert!(!light.is_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_camera_counts_exposures() {
        let camera = MockCamera::new(Duration::from_millis(50));
        camera
            .set_exposure_time(Duration::from_millis(80))
            .await
            .unwrap();
        camera.expose().await.unwrap();
        camera.expose().await.unwrap();

        assert_eq!(camera.exposures().await, 2);
        assert_eq!(
            camera.exposure_time().await.unwrap(),
            Duration::from_millis(80)
        );
        assert_eq!(camera.time_between_exposures(), Duration::from_millis(50));
    }
}
