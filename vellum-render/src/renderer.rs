//! The delta renderer.
//!
//! Per object id the renderer walks `absent → materializing → present →
//! absent`. `add` starts a hydration task and returns immediately; the
//! finished shape comes back over a channel and is integrated by
//! [`DeltaRenderer::drain_hydrated`], [`DeltaRenderer::next_hydrated`] or
//! [`DeltaRenderer::settle`].
//!
//! While an id is materializing, `modify` and `remove` for it are parked and
//! replayed in arrival order once the hydration lands. A later `add` for the
//! same id supersedes the earlier one: its parked operations are discarded
//! and the earlier task's result is ignored when it arrives.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use vellum_core::{Delta, DeltaOp, HydrationError, ObjectId, SceneEntry, SceneGraph, Shape};

use crate::hydrator::Hydrator;
use crate::scheduler::RenderScheduler;
use crate::target::{Frame, FrameStats, RenderTarget};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error("add for {0} carries no description")]
    MissingDescription(ObjectId),
    #[error("modify for {id} rejected: {source}")]
    Merge {
        id: ObjectId,
        #[source]
        source: HydrationError,
    },
}

/// What a single `apply` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Hydration started for an `add`.
    Hydrating,
    /// Parked until the id's hydration completes.
    Queued,
    Modified,
    Removed,
    /// Nothing to act on; the delta was dropped.
    Ignored,
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// Operations parked per materializing id before further ones are dropped.
    pub max_queued_per_object: usize,
    /// Capacity of the hydration completion channel.
    pub completion_buffer: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_queued_per_object: 256,
            completion_buffer: 1024,
        }
    }
}

impl RendererConfig {
    pub fn for_testing() -> Self {
        Self {
            max_queued_per_object: 8,
            completion_buffer: 16,
        }
    }
}

struct Hydrated {
    object_id: ObjectId,
    generation: u64,
    result: Result<Shape, HydrationError>,
}

struct Materializing {
    generation: u64,
    queued: Vec<Delta>,
}

/// Applies deltas to one participant's scene.
///
/// Hydration tasks are spawned on the ambient tokio runtime, so `apply` must
/// be called from within one.
pub struct DeltaRenderer<G: SceneGraph, H: Hydrator, T: RenderTarget> {
    scene: G,
    hydrator: Arc<H>,
    target: T,
    scheduler: RenderScheduler,
    config: RendererConfig,
    materializing: HashMap<ObjectId, Materializing>,
    next_generation: u64,
    pending_active: Option<ObjectId>,
    completions_tx: mpsc::Sender<Hydrated>,
    completions_rx: mpsc::Receiver<Hydrated>,
    stats: FrameStats,
}

impl<G: SceneGraph, H: Hydrator, T: RenderTarget> DeltaRenderer<G, H, T> {
    pub fn new(scene: G, hydrator: H, target: T) -> Self {
        Self::with_config(scene, hydrator, target, RendererConfig::default())
    }

    pub fn with_config(scene: G, hydrator: H, target: T, config: RendererConfig) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel(config.completion_buffer.max(1));
        Self {
            scene,
            hydrator: Arc::new(hydrator),
            target,
            scheduler: RenderScheduler::new(),
            config,
            materializing: HashMap::new(),
            next_generation: 0,
            pending_active: None,
            completions_tx,
            completions_rx,
            stats: FrameStats::default(),
        }
    }

    pub fn scene(&self) -> &G {
        &self.scene
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    /// Whether an `add` for `id` is still hydrating.
    pub fn is_materializing(&self, id: &ObjectId) -> bool {
        self.materializing.contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.materializing.len()
    }

    /// Apply one delta.
    ///
    /// Errors leave the scene unchanged for that id; they never poison the
    /// renderer.
    pub fn apply(&mut self, delta: Delta) -> Result<Applied, ApplyError> {
        let result = match delta.op {
            DeltaOp::Add => self.apply_add(delta.object_id, delta.changes),
            DeltaOp::Modify | DeltaOp::Remove => {
                if let Some(slot) = self.materializing.get_mut(&delta.object_id) {
                    if slot.queued.len() >= self.config.max_queued_per_object {
                        log::warn!(
                            "dropping {:?} for {}: {} operations already queued",
                            delta.op,
                            delta.object_id,
                            slot.queued.len()
                        );
                        Ok(Applied::Ignored)
                    } else {
                        slot.queued.push(delta);
                        self.stats.deltas_queued += 1;
                        Ok(Applied::Queued)
                    }
                } else if delta.op == DeltaOp::Modify {
                    self.apply_modify(delta.object_id, delta.changes.unwrap_or(Value::Null))
                } else {
                    Ok(self.apply_remove(&delta.object_id))
                }
            }
        };

        match &result {
            Ok(Applied::Ignored) => self.stats.deltas_dropped += 1,
            Ok(_) => self.stats.deltas_applied += 1,
            Err(e) => log::warn!("delta rejected: {e}"),
        }
        result
    }

    /// Apply a batch with rendering suspended; one redraw follows, whatever
    /// the outcome. Stops at the first error.
    pub fn apply_batch<I>(&mut self, deltas: I) -> Result<usize, ApplyError>
    where
        I: IntoIterator<Item = Delta>,
    {
        let mut batch = self.suspend();
        let mut applied = 0;
        for delta in deltas {
            batch.apply(delta)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_add(&mut self, id: ObjectId, description: Option<Value>) -> Result<Applied, ApplyError> {
        let description = description.ok_or(ApplyError::MissingDescription(id))?;

        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(superseded) = self.materializing.insert(
            id,
            Materializing {
                generation,
                queued: Vec::new(),
            },
        ) {
            log::debug!(
                "add for {id} supersedes in-flight hydration ({} queued ops discarded)",
                superseded.queued.len()
            );
        }

        let hydrator = Arc::clone(&self.hydrator);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(async move { hydrator.hydrate(id, description).await });
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(HydrationError::Malformed(format!("hydration task failed: {e}"))),
            };
            // A closed channel means the renderer is gone.
            let _ = tx
                .send(Hydrated {
                    object_id: id,
                    generation,
                    result,
                })
                .await;
        });

        Ok(Applied::Hydrating)
    }

    fn apply_modify(&mut self, id: ObjectId, changes: Value) -> Result<Applied, ApplyError> {
        let Some(entry) = self.scene.get(&id) else {
            log::debug!("modify for absent {id} dropped");
            return Ok(Applied::Ignored);
        };

        let mut shape = entry.shape.clone();
        shape
            .merge(&changes)
            .map_err(|source| ApplyError::Merge { id, source })?;
        self.scene.update(&id, shape);

        if self.scene.active() == Some(id) {
            self.scene.set_active(Some(id));
        }
        self.request_redraw();
        Ok(Applied::Modified)
    }

    fn apply_remove(&mut self, id: &ObjectId) -> Applied {
        if self.pending_active == Some(*id) {
            self.pending_active = None;
        }
        match self.scene.remove(id) {
            Some(_) => {
                self.request_redraw();
                Applied::Removed
            }
            None => Applied::Ignored,
        }
    }

    /// Mark `id` active. If it is still materializing the marker is held and
    /// applied when the entry lands. Returns `false` for unknown ids.
    pub fn set_active(&mut self, id: ObjectId) -> bool {
        if self.scene.contains(&id) {
            self.pending_active = None;
            self.scene.set_active(Some(id));
            self.request_redraw();
            true
        } else if self.materializing.contains_key(&id) {
            self.pending_active = Some(id);
            true
        } else {
            false
        }
    }

    pub fn clear_active(&mut self) {
        self.pending_active = None;
        if self.scene.active().is_some() {
            self.scene.set_active(None);
            self.request_redraw();
        }
    }

    /// Integrate every hydration that has already completed. Never waits.
    pub fn drain_hydrated(&mut self) -> usize {
        let mut landed = 0;
        while let Ok(hydrated) = self.completions_rx.try_recv() {
            if self.integrate(hydrated).is_some() {
                landed += 1;
            }
        }
        landed
    }

    /// Wait for the next current hydration and integrate it.
    ///
    /// Returns `None` once nothing is materializing.
    pub async fn next_hydrated(&mut self) -> Option<ObjectId> {
        while !self.materializing.is_empty() {
            let hydrated = self.completions_rx.recv().await?;
            if let Some(id) = self.integrate(hydrated) {
                return Some(id);
            }
        }
        None
    }

    /// Wait until every in-flight hydration has been integrated.
    pub async fn settle(&mut self) {
        while self.next_hydrated().await.is_some() {}
    }

    /// Land a hydration result. Returns the id when the result was current.
    fn integrate(&mut self, hydrated: Hydrated) -> Option<ObjectId> {
        let Hydrated {
            object_id: id,
            generation,
            result,
        } = hydrated;

        match self.materializing.get(&id) {
            Some(slot) if slot.generation == generation => {}
            _ => {
                log::trace!("stale hydration for {id} (generation {generation}) ignored");
                return None;
            }
        }
        let slot = self.materializing.remove(&id)?;

        let mut batch = self.suspend();
        match result {
            Ok(shape) => {
                batch.scene.insert(SceneEntry::new(id, shape));
                if batch.pending_active == Some(id) {
                    batch.pending_active = None;
                    batch.scene.set_active(Some(id));
                }
                batch.request_redraw();
            }
            Err(e) => {
                log::warn!("hydration of {id} failed: {e}");
                batch.stats.hydrations_failed += 1;
                if batch.pending_active == Some(id) {
                    batch.pending_active = None;
                }
            }
        }

        for delta in slot.queued {
            if let Err(e) = batch.apply(delta) {
                log::debug!("queued delta for {id} not applied: {e}");
            }
        }
        Some(id)
    }

    /// Suspend rendering until the returned guard is dropped.
    ///
    /// Dropping the outermost guard draws exactly one frame, including when
    /// the guarded scope exits early through `?` or a panic.
    pub fn suspend(&mut self) -> SuspendGuard<'_, G, H, T> {
        self.scheduler.enter();
        SuspendGuard { renderer: self }
    }

    fn request_redraw(&mut self) {
        if self.scheduler.is_suspended() {
            self.scheduler.defer();
        } else {
            self.redraw();
        }
    }

    fn redraw(&mut self) {
        let entries = self.scene.ordered();
        let frame = Frame {
            sequence: self.stats.frames_drawn + 1,
            entries: &entries,
            active: self.scene.active(),
        };
        self.target.draw(&frame);
        self.stats.frames_drawn += 1;
        self.stats.entries_in_last_frame = entries.len();
    }
}

/// Scope in which redraws are deferred. Derefs to the renderer.
pub struct SuspendGuard<'a, G: SceneGraph, H: Hydrator, T: RenderTarget> {
    renderer: &'a mut DeltaRenderer<G, H, T>,
}

impl<G: SceneGraph, H: Hydrator, T: RenderTarget> Deref for SuspendGuard<'_, G, H, T> {
    type Target = DeltaRenderer<G, H, T>;

    fn deref(&self) -> &Self::Target {
        self.renderer
    }
}

impl<G: SceneGraph, H: Hydrator, T: RenderTarget> DerefMut for SuspendGuard<'_, G, H, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.renderer
    }
}

impl<G: SceneGraph, H: Hydrator, T: RenderTarget> Drop for SuspendGuard<'_, G, H, T> {
    fn drop(&mut self) {
        if self.renderer.scheduler.exit() {
            self.renderer.redraw();
        }
    }
}
