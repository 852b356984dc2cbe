//! Device handlers and capability traits.
//!
//! Instead of one monolithic device interface, hardware exposes the specific
//! capabilities it actually supports:
//!
//! - A stage axis implements [`Positioner`]
//! - A laser line or shutter implements [`LightSource`]
//! - A camera implements [`Camera`]
//!
//! Capability mismatches are caught when an experiment is composed, not when
//! an action fires mid-run.
//!
//! Handlers live in a [`HandlerRegistry`] arena and are addressed by stable
//! [`HandlerId`] indices. Action tables store ids, never owning references, so
//! a table can outlive or predate any particular wiring of device objects
//! without lifetime cycles.

pub mod mock;
pub mod stage;

use std::ops::Index;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ScopeError};

pub use mock::{MockCamera, MockLight, MockPositioner};
pub use stage::{SharedPlanePosition, StageAxisHandler};

/// Stable arena index of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(usize);

impl HandlerId {
    /// Wrap a raw arena index.
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// The raw arena index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identity of one controllable capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    /// Unique handler name (e.g., "z stage", "488 laser", "west camera")
    pub name: String,
    /// Logical device group the handler belongs to (e.g., "stage", "lights")
    pub group_name: String,
    /// Controller axis number for positioners, if any
    pub axis: Option<usize>,
}

impl HandlerInfo {
    /// Identity for a non-axis capability (light, camera).
    pub fn new(name: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_name: group_name.into(),
            axis: None,
        }
    }

    /// Identity for a positioner on the given controller axis.
    pub fn with_axis(name: impl Into<String>, group_name: impl Into<String>, axis: usize) -> Self {
        Self {
            name: name.into(),
            group_name: group_name.into(),
            axis: Some(axis),
        }
    }
}

/// Capability for handlers that control a motion axis.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Move to an absolute position. A no-op while a motion is already
    /// pending on this axis; vetoed by the safety checker before any command
    /// reaches hardware.
    async fn move_absolute(&self, position: f64) -> AppResult<()>;

    /// Move by a delta from the cached position. A no-op on zero delta.
    async fn move_relative(&self, delta: f64) -> AppResult<()>;

    /// Current position. `use_cache` returns the last known value instantly;
    /// safety-relevant callers must pass `false` to force a fresh query.
    async fn position(&self, use_cache: bool) -> AppResult<f64>;

    /// Estimated `(motion, stabilization)` time for a move between two
    /// positions. Used by experiment generators to lay out the timeline.
    fn movement_time(&self, start: f64, end: f64) -> (Duration, Duration);

    /// Update one side of the soft travel limits.
    async fn set_safety(&self, value: f64, is_max: bool) -> AppResult<()>;

    /// Stop motion immediately.
    async fn halt(&self) -> AppResult<()>;
}

/// Capability for handlers that switch illumination on and off.
#[async_trait]
pub trait LightSource: Send + Sync {
    /// Set the output level.
    async fn set_enabled(&self, enabled: bool) -> AppResult<()>;

    /// Current output level.
    async fn is_enabled(&self) -> AppResult<bool>;
}

/// Capability for handlers that take exposures.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Set the exposure duration used by subsequent exposures.
    async fn set_exposure_time(&self, exposure: Duration) -> AppResult<()>;

    /// Currently configured exposure duration.
    async fn exposure_time(&self) -> AppResult<Duration>;

    /// Dead time after an exposure before the sensor is ready again.
    fn time_between_exposures(&self) -> Duration;

    /// Take one exposure at the configured duration.
    async fn expose(&self) -> AppResult<()>;
}

/// Erased capability handle stored in the registry.
#[derive(Clone)]
pub enum HandlerCapability {
    /// A motion axis.
    Positioner(Arc<dyn Positioner>),
    /// A switchable light or trigger line.
    Light(Arc<dyn LightSource>),
    /// An exposing camera.
    Camera(Arc<dyn Camera>),
}

impl HandlerCapability {
    /// Capability kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerCapability::Positioner(_) => "positioner",
            HandlerCapability::Light(_) => "light",
            HandlerCapability::Camera(_) => "camera",
        }
    }

    /// Downcast to a positioner.
    pub fn as_positioner(&self) -> Option<Arc<dyn Positioner>> {
        match self {
            HandlerCapability::Positioner(handler) => Some(handler.clone()),
            _ => None,
        }
    }

    /// Downcast to a light source.
    pub fn as_light(&self) -> Option<Arc<dyn LightSource>> {
        match self {
            HandlerCapability::Light(handler) => Some(handler.clone()),
            _ => None,
        }
    }

    /// Downcast to a camera.
    pub fn as_camera(&self) -> Option<Arc<dyn Camera>> {
        match self {
            HandlerCapability::Camera(handler) => Some(handler.clone()),
            _ => None,
        }
    }
}

/// One registered handler: identity plus capability.
#[derive(Clone)]
pub struct HandlerEntry {
    /// Handler identity.
    pub info: HandlerInfo,
    /// The capability it exposes.
    pub capability: HandlerCapability,
}

/// Arena of device handlers with stable integer indices.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler and return its stable id.
    pub fn add(&mut self, info: HandlerInfo, capability: HandlerCapability) -> HandlerId {
        let id = HandlerId(self.entries.len());
        self.entries.push(HandlerEntry { info, capability });
        id
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `id`, if registered.
    pub fn get(&self, id: HandlerId) -> Option<&HandlerEntry> {
        self.entries.get(id.0)
    }

    /// Look a handler up by name.
    pub fn find(&self, name: &str) -> Option<(HandlerId, &HandlerEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.info.name == name)
            .map(|(i, entry)| (HandlerId(i), entry))
    }

    /// Iterate all entries with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (HandlerId, &HandlerEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (HandlerId(i), entry))
    }

    /// Resolve `id` to a positioner, or fail with the capability it has.
    pub fn positioner(&self, id: HandlerId) -> AppResult<Arc<dyn Positioner>> {
        let entry = self.require(id)?;
        entry.capability.as_positioner().ok_or_else(|| {
            ScopeError::HandlerMissing(format!(
                "'{}' is a {}, not a positioner",
                entry.info.name,
                entry.capability.kind()
            ))
        })
    }

    /// Resolve `id` to a light source, or fail with the capability it has.
    pub fn light(&self, id: HandlerId) -> AppResult<Arc<dyn LightSource>> {
        let entry = self.require(id)?;
        entry.capability.as_light().ok_or_else(|| {
            ScopeError::HandlerMissing(format!(
                "'{}' is a {}, not a light source",
                entry.info.name,
                entry.capability.kind()
            ))
        })
    }

    /// Resolve `id` to a camera, or fail with the capability it has.
    pub fn camera(&self, id: HandlerId) -> AppResult<Arc<dyn Camera>> {
        let entry = self.require(id)?;
        entry.capability.as_camera().ok_or_else(|| {
            ScopeError::HandlerMissing(format!(
                "'{}' is a {}, not a camera",
                entry.info.name,
                entry.capability.kind()
            ))
        })
    }

    /// All registered positioners, for bulk operations like halt-all.
    pub fn positioners(&self) -> Vec<(HandlerId, Arc<dyn Positioner>)> {
        self.iter()
            .filter_map(|(id, entry)| entry.capability.as_positioner().map(|p| (id, p)))
            .collect()
    }

    fn require(&self, id: HandlerId) -> AppResult<&HandlerEntry> {
        self.get(id)
            .ok_or_else(|| ScopeError::HandlerMissing(format!("no handler with id {}", id.0)))
    }
}

impl Index<HandlerId> for HandlerRegistry {
    type Output = HandlerEntry;

    fn index(&self, id: HandlerId) -> &HandlerEntry {
        &self.entries[id.0]
    }
}

/// Status notifications published by axis motion watchers.
#[derive(Debug, Clone)]
pub enum AxisEvent {
    /// The axis settled; published exactly once per motion episode.
    Stopped {
        /// Controller axis number.
        axis: usize,
        /// Position at settle time.
        position: f64,
        /// When the watcher observed convergence.
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_mock() -> (HandlerRegistry, HandlerId, HandlerId) {
        let mut registry = HandlerRegistry::new();
        let stage = registry.add(
            HandlerInfo::with_axis("z stage", "stage", 1),
            HandlerCapability::Positioner(Arc::new(MockPositioner::new(5.0))),
        );
        let light = registry.add(
            HandlerInfo::new("488 laser", "lights"),
            HandlerCapability::Light(Arc::new(MockLight::new())),
        );
        (registry, stage, light)
    }

    #[test]
    fn test_ids_are_stable_insertion_indices() {
        let (registry, stage, light) = registry_with_mock();
        assert_eq!(stage.index(), 0);
        assert_eq!(light.index(), 1);
        assert_eq!(registry[stage].info.name, "z stage");
        assert_eq!(registry[light].info.group_name, "lights");
    }

    #[test]
    fn test_find_by_name() {
        let (registry, _, light) = registry_with_mock();
        let (found, entry) = registry.find("488 laser").unwrap();
        assert_eq!(found, light);
        assert_eq!(entry.capability.kind(), "light");
        assert!(registry.find("nonexistent").is_none());
    }

    #[test]
    fn test_capability_mismatch_is_composition_error() {
        let (registry, stage, light) = registry_with_mock();
        assert!(registry.positioner(stage).is_ok());
        let err = registry.positioner(light).err().unwrap();
        assert!(err.to_string().contains("not a positioner"));
        let err = registry.camera(stage).err().unwrap();
        assert!(err.to_string().contains("not a camera"));
    }

    #[test]
    fn test_positioners_enumerates_only_axes() {
        let (registry, stage, _) = registry_with_mock();
        let positioners = registry.positioners();
        assert_eq!(positioners.len(), 1);
        assert_eq!(positioners[0].0, stage);
    }
}
