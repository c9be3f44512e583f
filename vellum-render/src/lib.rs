//! # vellum-render
//!
//! Live scene maintenance for one participant's view of a design.
//!
//! ## Architecture
//!
//! ```text
//!  Delta stream (decrypted relay traffic)
//!       │
//!       ▼
//!  DeltaRenderer.apply(delta)
//!       │ remove / modify ─────────────► Scene (vellum-core)
//!       │ add ──► tokio task ──► Hydrator ──┐
//!       │                                   │ mpsc
//!       ◄──────── drain_hydrated() ◄────────┘
//!       │
//!       ▼
//!  RenderScheduler ── not suspended ──► RenderTarget.draw(frame)
//! ```
//!
//! ## Crate modules
//!
//! - [`hydrator`] — async description → shape construction
//! - [`scheduler`] — per-renderer render suspension
//! - [`target`] — frame sink trait, recorder, frame statistics
//! - [`renderer`] — the delta renderer itself

pub mod hydrator;
pub mod renderer;
pub mod scheduler;
pub mod target;

pub use hydrator::{Hydrator, ShapeFactory};
pub use renderer::{Applied, ApplyError, DeltaRenderer, RendererConfig, SuspendGuard};
pub use scheduler::RenderScheduler;
pub use target::{Frame, FrameRecorder, FrameStats, NullTarget, RecordedFrame, RenderTarget};
