//! Backend: render-target store, visual trees and GPU execution.
//!
//! The backend mirrors each client render target as a visual tree whose
//! visuals own platform surfaces and per-surface render-target contexts.
//! Invariant-heavy bookkeeping (rect sanitization, backing-dimension
//! clamping, the no-op frame policy, effect queues, telemetry) is concrete
//! and backend-agnostic; the GPU itself sits behind the [`surface::GpuSurface`]
//! seam, implemented by the wgpu reference backend in [`engine`] and by the
//! recording backend used in tests.

/// Per-surface render target context: logical rect, backing store, draw
/// dispatch and the effect queue.
pub mod context;
/// Blur effect pipelines for the wgpu backend.
pub mod effects;
/// The wgpu reference backend.
pub mod engine;
/// Render-target store and compositor command execution.
pub mod store;
/// The GPU seam: surface factory and per-surface operations.
pub mod surface;
/// CPU tessellation of visual commands into triangle meshes.
pub mod tessellation;
/// Visual-tree arena mirroring layer limbs.
pub mod visual;

pub use context::RenderTargetContext;
pub use store::{ExecutionState, RenderTargetStore};
pub use surface::{BackendError, GpuSurface, PaintSpec, PresentTicket, SurfaceBackend, SurfaceKind};
pub use visual::{VisualId, VisualTree};
