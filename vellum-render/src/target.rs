//! Frame sinks.

use vellum_core::{ObjectId, SceneEntry};

/// One redraw pass: every scene entry in paint order.
#[derive(Debug)]
pub struct Frame<'a> {
    pub sequence: u64,
    pub entries: &'a [&'a SceneEntry],
    pub active: Option<ObjectId>,
}

/// Receives each frame the renderer produces.
pub trait RenderTarget: Send {
    fn draw(&mut self, frame: &Frame<'_>);
}

/// Discards frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTarget;

impl RenderTarget for NullTarget {
    fn draw(&mut self, _frame: &Frame<'_>) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub sequence: u64,
    pub ids: Vec<ObjectId>,
    pub active: Option<ObjectId>,
}

/// Keeps the id list of every frame drawn. Useful for snapshot export and tests.
#[derive(Debug, Default)]
pub struct FrameRecorder {
    frames: Vec<RecordedFrame>,
}

impl FrameRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[RecordedFrame] {
        &self.frames
    }

    pub fn last(&self) -> Option<&RecordedFrame> {
        self.frames.last()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl RenderTarget for FrameRecorder {
    fn draw(&mut self, frame: &Frame<'_>) {
        self.frames.push(RecordedFrame {
            sequence: frame.sequence,
            ids: frame.entries.iter().map(|e| e.object_id).collect(),
            active: frame.active,
        });
    }
}

/// Counters accumulated by a renderer over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames handed to the target.
    pub frames_drawn: u64,
    /// Entry count of the most recent frame.
    pub entries_in_last_frame: usize,
    /// Deltas that changed (or scheduled a change to) the scene.
    pub deltas_applied: u64,
    /// Deltas with nothing to act on.
    pub deltas_dropped: u64,
    /// Deltas parked behind an in-flight hydration.
    pub deltas_queued: u64,
    pub hydrations_failed: u64,
}
