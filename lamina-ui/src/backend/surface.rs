//! The GPU seam between the compositor and a concrete backend.
//!
//! A [`SurfaceBackend`] creates one [`GpuSurface`] per visual: root surfaces
//! bind to the view's opaque native handle, child surfaces composite under
//! the root. All methods are called from the scheduler's execution context
//! only, so implementations hold their resources exclusively.

use std::sync::Arc;
use std::time::Instant;

use glam::Mat4;
use thiserror::Error;

use crate::canvas::{CanvasEffect, Gradient, GpuFence, GpuTexture};
use crate::client::ViewRenderTarget;
use crate::geometry::{Color, Point};
use crate::layer::DropShadowParams;
use crate::telemetry::CompletionHandler;

use super::tessellation::Mesh;

/// Backend-level failures. These never escape as panics; the affected
/// packet resolves `Delayed` and the last good state is retained.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backing target rebuild failed")]
    RebuildFailed,
    #[error("no surface exists for the referenced layer")]
    MissingSurface,
    #[error("native surface handle is not usable by this backend")]
    UnsupportedSurface,
    #[error("gpu device unavailable: {0}")]
    GpuUnavailable(String),
}

/// Whether a surface backs a limb root or a child layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    Root,
    Child,
}

/// Identity of one commit for completion correlation.
#[derive(Debug, Clone, Copy)]
pub struct PresentTicket {
    pub lane_id: u64,
    pub packet_id: u64,
    pub submit_cpu: Instant,
}

/// Paint source for one mesh draw. Solid colors ride in the vertices; the
/// textured pipeline is selected for image and gradient brushes.
pub enum PaintSpec {
    /// Per-vertex color, color pipeline.
    Solid,
    /// Sample the given texture, honoring its producer fence.
    Texture {
        texture: Arc<dyn GpuTexture>,
        fence: Option<Arc<dyn GpuFence>>,
    },
    /// Sample a ramp generated from the gradient stops.
    Gradient(Gradient),
}

impl PaintSpec {
    pub fn is_textured(&self) -> bool {
        !matches!(self, PaintSpec::Solid)
    }
}

/// One visual's GPU state.
pub trait GpuSurface: Send {
    /// (Re)creates the backing resources at the given dimensions. Called
    /// once at creation and again whenever the backing dimensions change.
    fn rebuild(&mut self, backing_width: u32, backing_height: u32) -> Result<(), BackendError>;

    /// Opens the pre-effect pass for a new frame, clearing once to
    /// `background`.
    fn begin_frame(&mut self, background: Color) -> Result<(), BackendError>;

    /// Draws one tessellated mesh with the given paint into the pre-effect
    /// pass.
    fn draw_mesh(&mut self, mesh: &Mesh, paint: &PaintSpec) -> Result<(), BackendError>;

    /// Runs the queued canvas effects into the effect texture. Returns
    /// `false` when no effect processor or spare texture is available, in
    /// which case the pre-effect texture is treated as final.
    fn apply_effects(&mut self, effects: &[CanvasEffect]) -> Result<bool, BackendError>;

    /// Copies the final texture into the native target and presents.
    /// `on_complete` must be invoked with this commit's telemetry once the
    /// submission finishes on the GPU timeline.
    fn present(
        &mut self,
        ticket: PresentTicket,
        on_complete: CompletionHandler,
    ) -> Result<(), BackendError>;

    /// Moves the visual within its parent (backing-pixel coordinates).
    fn set_position(&mut self, position: Point);

    /// Applies drop-shadow parameters to the owning visual.
    fn set_shadow(&mut self, params: &DropShadowParams);

    /// Applies a composed transformation matrix to the owning visual.
    fn set_transform(&mut self, matrix: Mat4);
}

/// Factory for per-visual surfaces.
pub trait SurfaceBackend: Send {
    /// Platform floor for the render scale (2 on macOS, 1 elsewhere).
    fn scale_floor(&self) -> f32 {
        if cfg!(target_os = "macos") { 2.0 } else { 1.0 }
    }

    /// Creates a surface for one visual of `target` at `position`
    /// (backing-pixel coordinates). Root surfaces bind to the target's
    /// native handle; child surfaces composite under the root.
    fn create_surface(
        &mut self,
        target: &ViewRenderTarget,
        kind: SurfaceKind,
        position: Point,
    ) -> Result<Box<dyn GpuSurface>, BackendError>;
}
