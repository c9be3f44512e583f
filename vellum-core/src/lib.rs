//! # vellum-core — Data model for the Vellum design surface
//!
//! Everything the synchronization layers agree on lives here:
//!
//! ```text
//!  CanvasObject (durable row) ──── shape_data ────► hydrate() ──► Shape
//!                                                                  │
//!  Delta { add | modify | remove } ─────────────────────────────► Scene
//!                                                           (id-indexed,
//!                                                            z-ordered)
//! ```
//!
//! ## Modules
//!
//! - [`object`] — persisted `CanvasObject` rows and local snapshots
//! - [`shape`] — closed shape-kind set, hydration factory, derived geometry
//! - [`delta`] — add/modify/remove instructions for a live scene
//! - [`scene`] — `SceneGraph` trait and the id-indexed `Scene`

pub mod delta;
pub mod object;
pub mod scene;
pub mod shape;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub use delta::{Delta, DeltaOp};
pub use object::{CanvasObject, DesignId, DesignScope, LocalObject, ObjectId, UserId};
pub use scene::{Scene, SceneEntry, SceneGraph};
pub use shape::{hydrate, hydrate_str, Geometry, HydrationError, Shape, ShapeKind};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Axis-aligned rectangle in document coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    /// Smallest rectangle containing every point. Empty input gives the zero rect.
    pub fn enclosing(points: &[Point]) -> Self {
        let Some(first) = points.first() else {
            return Rect::default();
        };
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Rect {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.x + self.width && p.y >= self.y && p.y <= self.y + self.height
    }
}

/// Milliseconds since the Unix epoch, used for `created_at` / `updated_at`.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
