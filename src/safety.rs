//! Stage motion safety checking.
//!
//! Physical stages can carry objectives, immersion dishes, and other obstacles
//! that the sample holder must never be driven through. Forbidden regions are
//! described as axis-aligned rectangles in XY stage space; a proposed move is
//! vetoed when the axis-aligned bounding rectangle of its straight-line path
//! intersects any banned rectangle.
//!
//! The intersection test is the separating-axis theorem specialized to
//! axis-aligned boxes: two rectangles are disjoint along an axis iff one
//! interval's max is strictly less than the other's min, and they intersect
//! overall iff they are not disjoint on every axis. The result is invariant
//! under axis swap and coordinate reflection, which the tests verify.
//!
//! Checks run synchronously, before any command is issued to hardware; a veto
//! is a local validation failure and always recoverable.

use serde::{Deserialize, Serialize};

use crate::config::RectConfig;
use crate::error::{AppResult, ScopeError};

/// An axis-aligned forbidden rectangle in XY stage space.
///
/// Immutable once constructed; corners are normalized so `min.0 <= max.0` and
/// `min.1 <= max.1` regardless of the order they were given in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BannedRectangle {
    min: (f64, f64),
    max: (f64, f64),
}

impl BannedRectangle {
    /// Create a rectangle from two opposite corners, in either order.
    pub fn new(corner1: (f64, f64), corner2: (f64, f64)) -> Self {
        Self {
            min: (corner1.0.min(corner2.0), corner1.1.min(corner2.1)),
            max: (corner1.0.max(corner2.0), corner1.1.max(corner2.1)),
        }
    }

    /// Lower-left corner after normalization.
    pub fn min_corner(&self) -> (f64, f64) {
        self.min
    }

    /// Upper-right corner after normalization.
    pub fn max_corner(&self) -> (f64, f64) {
        self.max
    }

    /// Separating-axis intersection test against another rectangle.
    ///
    /// Touching edges count as intersecting: disjointness requires one max to
    /// be strictly below the other min on some axis.
    pub fn intersects(&self, other: &BannedRectangle) -> bool {
        let disjoint_x = self.max.0 < other.min.0 || other.max.0 < self.min.0;
        let disjoint_y = self.max.1 < other.min.1 || other.max.1 < self.min.1;
        !(disjoint_x || disjoint_y)
    }
}

impl From<RectConfig> for BannedRectangle {
    fn from(rect: RectConfig) -> Self {
        Self::new(rect.corner1, rect.corner2)
    }
}

/// Vetoes stage moves whose path would cross a forbidden zone.
#[derive(Debug, Clone, Default)]
pub struct MotionChecker {
    banned: Vec<BannedRectangle>,
}

impl MotionChecker {
    /// Build a checker from configured forbidden zones.
    pub fn new(banned: Vec<BannedRectangle>) -> Self {
        Self { banned }
    }

    /// Build a checker straight from stage configuration.
    pub fn from_config(rects: &[RectConfig]) -> Self {
        Self::new(rects.iter().copied().map(BannedRectangle::from).collect())
    }

    /// Number of configured forbidden zones.
    pub fn num_zones(&self) -> usize {
        self.banned.len()
    }

    /// Check a straight-line XY move from `from` to `to`.
    ///
    /// The path is conservatively approximated by its axis-aligned bounding
    /// rectangle. `axis` only labels the error; the check itself is 2-D.
    pub fn check_move(&self, axis: usize, from: (f64, f64), to: (f64, f64)) -> AppResult<()> {
        let path = BannedRectangle::new(from, to);
        for (i, zone) in self.banned.iter().enumerate() {
            if path.intersects(zone) {
                return Err(ScopeError::MotionUnsafe {
                    axis,
                    from: if axis == 0 { from.0 } else { from.1 },
                    to: if axis == 0 { to.0 } else { to.1 },
                    reason: format!(
                        "path crosses banned rectangle {} ({:?} - {:?})",
                        i, zone.min, zone.max
                    ),
                });
            }
        }
        Ok(())
    }
}
