//! Per-surface render-target state: logical rect, render scale, backing
//! dimensions and the draw/effect/present flow.
//!
//! The context owns the sanitization and clamping rules that keep backing
//! textures inside `[1, 16384]` on both axes, and rebuilds GPU resources
//! only when a resize actually changes the backing dimensions. Resize
//! decisions are made exclusively from the scheduler's execution context.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::canvas::{CanvasEffect, VisualCommand};
use crate::geometry::{Color, MAX_TEXTURE_DIMENSION, Rect, sanitize_rect, to_backing_dimension};
use crate::telemetry::CompletionHandler;

use super::surface::{BackendError, GpuSurface, PresentTicket};
use super::tessellation::tessellate_visual;

static RESOURCE_ID_SEED: AtomicU64 = AtomicU64::new(1);

/// Per-surface GPU state and the contract around it.
pub struct RenderTargetContext {
    logical_rect: Rect,
    render_scale: f32,
    backing_width: u32,
    backing_height: u32,
    effect_queue: Vec<CanvasEffect>,
    surface: Box<dyn GpuSurface>,
    resource_id: u64,
}

impl RenderTargetContext {
    /// Builds a context over `surface`, sanitizing `rect` and clamping
    /// `render_scale` to `[scale_floor, 16384]`.
    pub fn new(
        rect: Rect,
        render_scale: f32,
        scale_floor: f32,
        mut surface: Box<dyn GpuSurface>,
    ) -> Result<Self, BackendError> {
        let scale = sanitize_scale(render_scale, scale_floor);
        let logical_rect = sanitize_rect(&rect, &Rect::UNIT, scale);
        let backing_width = to_backing_dimension(logical_rect.width, scale);
        let backing_height = to_backing_dimension(logical_rect.height, scale);
        let resource_id = RESOURCE_ID_SEED.fetch_add(1, Ordering::Relaxed);
        debug!(
            resource_id,
            width = logical_rect.width,
            height = logical_rect.height,
            scale,
            "create texture target"
        );
        surface.rebuild(backing_width, backing_height)?;
        Ok(Self {
            logical_rect,
            render_scale: scale,
            backing_width,
            backing_height,
            effect_queue: Vec::new(),
            surface,
            resource_id,
        })
    }

    pub fn logical_rect(&self) -> Rect {
        self.logical_rect
    }

    pub fn render_scale(&self) -> f32 {
        self.render_scale
    }

    pub fn backing_dimensions(&self) -> (u32, u32) {
        (self.backing_width, self.backing_height)
    }

    /// Applies the resize contract: sanitize, recompute backing dimensions,
    /// and rebuild GPU resources only if they changed. Returns whether a
    /// rebuild happened. On rebuild failure the last good backing target is
    /// retained and the error surfaces to the caller.
    pub fn set_size(&mut self, rect: Rect) -> Result<bool, BackendError> {
        let sane = sanitize_rect(&rect, &self.logical_rect, self.render_scale);
        let new_width = to_backing_dimension(sane.width, self.render_scale);
        let new_height = to_backing_dimension(sane.height, self.render_scale);
        if new_width == self.backing_width && new_height == self.backing_height {
            self.logical_rect = sane;
            return Ok(false);
        }
        if let Err(error) = self.surface.rebuild(new_width, new_height) {
            warn!(
                resource_id = self.resource_id,
                new_width, new_height, "backing rebuild failed; keeping last good target"
            );
            return Err(error);
        }
        debug!(
            resource_id = self.resource_id,
            new_width, new_height, "resize rebuild"
        );
        self.logical_rect = sane;
        self.backing_width = new_width;
        self.backing_height = new_height;
        Ok(true)
    }

    /// Opens the frame's single pre-effect pass, clearing to `background`.
    pub fn clear(&mut self, background: Color) -> Result<(), BackendError> {
        self.surface.begin_frame(background)
    }

    /// Tessellates and draws one visual command. Mesh positions are scaled
    /// from logical to backing pixels before they reach the surface.
    pub fn render_visual(&mut self, command: &VisualCommand) -> Result<(), BackendError> {
        for mut op in tessellate_visual(command, self.render_scale) {
            if op.mesh.is_empty() {
                continue;
            }
            if self.render_scale != 1.0 {
                for vertex in &mut op.mesh.vertices {
                    vertex.position[0] *= self.render_scale;
                    vertex.position[1] *= self.render_scale;
                }
            }
            self.surface.draw_mesh(&op.mesh, &op.paint)?;
        }
        Ok(())
    }

    /// Appends a canvas effect for this commit.
    pub fn queue_effect(&mut self, effect: CanvasEffect) {
        self.effect_queue.push(effect);
    }

    /// Runs queued effects (draining the queue) and presents the final
    /// texture. `on_complete` fires with the commit's telemetry.
    pub fn commit(
        &mut self,
        ticket: PresentTicket,
        on_complete: CompletionHandler,
    ) -> Result<(), BackendError> {
        let effects = std::mem::take(&mut self.effect_queue);
        if !effects.is_empty() {
            let applied = self.surface.apply_effects(&effects)?;
            if !applied {
                debug!(
                    resource_id = self.resource_id,
                    count = effects.len(),
                    "no effect processor; pre-effect texture is final"
                );
            }
        }
        self.surface.present(ticket, on_complete)
    }

    pub fn surface_mut(&mut self) -> &mut dyn GpuSurface {
        self.surface.as_mut()
    }
}

fn sanitize_scale(scale: f32, floor: f32) -> f32 {
    let floor = if floor.is_finite() && floor > 0.0 { floor } else { 1.0 };
    if !scale.is_finite() || scale <= 0.0 {
        return floor;
    }
    scale.clamp(floor, MAX_TEXTURE_DIMENSION)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use glam::Mat4;
    use parking_lot::Mutex;

    use super::*;
    use crate::geometry::Point;
    use crate::layer::DropShadowParams;
    use crate::telemetry::{SubmissionStatus, SubmissionTelemetry};

    use crate::backend::surface::PaintSpec;
    use crate::backend::tessellation::Mesh;

    /// Minimal surface stub counting rebuilds, optionally failing them.
    #[derive(Default)]
    struct StubState {
        rebuilds: Vec<(u32, u32)>,
        fail_next_rebuild: bool,
        presents: u32,
    }

    #[derive(Clone, Default)]
    struct StubSurface {
        state: Arc<Mutex<StubState>>,
    }

    impl GpuSurface for StubSurface {
        fn rebuild(&mut self, w: u32, h: u32) -> Result<(), BackendError> {
            let mut state = self.state.lock();
            if state.fail_next_rebuild {
                state.fail_next_rebuild = false;
                return Err(BackendError::RebuildFailed);
            }
            state.rebuilds.push((w, h));
            Ok(())
        }
        fn begin_frame(&mut self, _background: Color) -> Result<(), BackendError> {
            Ok(())
        }
        fn draw_mesh(&mut self, _mesh: &Mesh, _paint: &PaintSpec) -> Result<(), BackendError> {
            Ok(())
        }
        fn apply_effects(&mut self, _effects: &[CanvasEffect]) -> Result<bool, BackendError> {
            Ok(true)
        }
        fn present(
            &mut self,
            ticket: PresentTicket,
            on_complete: CompletionHandler,
        ) -> Result<(), BackendError> {
            self.state.lock().presents += 1;
            let now = Instant::now();
            on_complete(SubmissionTelemetry {
                lane_id: ticket.lane_id,
                packet_id: ticket.packet_id,
                submit_cpu: ticket.submit_cpu,
                complete_cpu: now,
                present_cpu: now,
                gpu_start_sec: 0.0,
                gpu_end_sec: 0.0,
                status: SubmissionStatus::Completed,
            });
            Ok(())
        }
        fn set_position(&mut self, _position: Point) {}
        fn set_shadow(&mut self, _params: &DropShadowParams) {}
        fn set_transform(&mut self, _matrix: Mat4) {}
    }

    fn context_with(rect: Rect, scale: f32) -> (RenderTargetContext, StubSurface) {
        let stub = StubSurface::default();
        let ctx = RenderTargetContext::new(rect, scale, 1.0, Box::new(stub.clone())).unwrap();
        (ctx, stub)
    }

    #[test]
    fn backing_dimensions_stay_in_range_across_resizes() {
        let (mut ctx, _stub) = context_with(Rect::new(0.0, 0.0, 800.0, 600.0), 2.0);
        for rect in [
            Rect::new(0.0, 0.0, 1.0, 1.0),
            Rect::new(0.0, 0.0, 100000.0, 100000.0),
            Rect::new(0.0, 0.0, f32::NAN, -3.0),
            Rect::new(0.0, 0.0, 0.3, 0.2),
        ] {
            let _ = ctx.set_size(rect);
            let (w, h) = ctx.backing_dimensions();
            assert!((1..=16384).contains(&w));
            assert!((1..=16384).contains(&h));
        }
    }

    #[test]
    fn rebuild_happens_only_when_backing_changes() {
        let (mut ctx, stub) = context_with(Rect::new(0.0, 0.0, 100.0, 100.0), 1.0);
        assert_eq!(stub.state.lock().rebuilds.len(), 1);

        // Sub-pixel drift keeps the same backing dims: no rebuild.
        assert!(!ctx.set_size(Rect::new(0.0, 0.0, 100.2, 100.3)).unwrap());
        assert_eq!(stub.state.lock().rebuilds.len(), 1);

        assert!(ctx.set_size(Rect::new(0.0, 0.0, 200.0, 100.0)).unwrap());
        assert_eq!(stub.state.lock().rebuilds.last(), Some(&(200, 100)));
    }

    #[test]
    fn failed_rebuild_keeps_the_last_good_target() {
        let (mut ctx, stub) = context_with(Rect::new(0.0, 0.0, 100.0, 100.0), 1.0);
        stub.state.lock().fail_next_rebuild = true;
        let err = ctx.set_size(Rect::new(0.0, 0.0, 300.0, 300.0));
        assert!(matches!(err, Err(BackendError::RebuildFailed)));
        assert_eq!(ctx.backing_dimensions(), (100, 100));
        assert_eq!(ctx.logical_rect(), Rect::new(0.0, 0.0, 100.0, 100.0));
        // A later resize succeeds and rebuilds normally.
        assert!(ctx.set_size(Rect::new(0.0, 0.0, 300.0, 300.0)).unwrap());
        assert_eq!(ctx.backing_dimensions(), (300, 300));
    }

    #[test]
    fn scale_floor_is_enforced() {
        let stub = StubSurface::default();
        let ctx = RenderTargetContext::new(
            Rect::new(0.0, 0.0, 10.0, 10.0),
            0.5,
            2.0,
            Box::new(stub),
        )
        .unwrap();
        assert_eq!(ctx.render_scale(), 2.0);
        assert_eq!(ctx.backing_dimensions(), (20, 20));
    }

    #[test]
    fn commit_drains_the_effect_queue() {
        let (mut ctx, stub) = context_with(Rect::new(0.0, 0.0, 64.0, 64.0), 1.0);
        ctx.queue_effect(CanvasEffect::GaussianBlur { radius: 4.0 });
        ctx.queue_effect(CanvasEffect::DirectionalBlur { radius: 2.0, angle: 0.5 });
        let ticket = PresentTicket {
            lane_id: 1,
            packet_id: 1,
            submit_cpu: Instant::now(),
        };
        ctx.commit(ticket, Box::new(|_| {})).unwrap();
        assert!(ctx.effect_queue.is_empty());
        assert_eq!(stub.state.lock().presents, 1);
    }
}
