//! Object hydration.

use async_trait::async_trait;
use serde_json::Value;
use vellum_core::{hydrate, HydrationError, ObjectId, Shape};

/// Builds a renderable [`Shape`] from a plain description.
///
/// Implementations may be slow (image decoding, font loading); the renderer
/// runs each call on its own task and never awaits it inline.
#[async_trait]
pub trait Hydrator: Send + Sync + 'static {
    async fn hydrate(&self, object_id: ObjectId, description: Value)
        -> Result<Shape, HydrationError>;
}

/// Default hydrator backed by the closed shape-kind factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShapeFactory;

#[async_trait]
impl Hydrator for ShapeFactory {
    async fn hydrate(
        &self,
        object_id: ObjectId,
        description: Value,
    ) -> Result<Shape, HydrationError> {
        log::trace!("hydrating {object_id}");
        hydrate(&description)
    }
}
