//! Test support: a recording surface backend.
//!
//! [`RecordingBackend`] implements the GPU seam with no GPU at all: every
//! operation is appended to a shared op log stamped with lane and packet
//! ids, and presents complete synchronously so presented-clock behavior is
//! deterministic. Gated behind `cfg(test)` and the `testing` feature.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use glam::Mat4;
use parking_lot::Mutex;

use crate::backend::surface::{BackendError, GpuSurface, PaintSpec, PresentTicket, SurfaceBackend, SurfaceKind};
use crate::backend::tessellation::Mesh;
use crate::canvas::CanvasEffect;
use crate::client::ViewRenderTarget;
use crate::geometry::{Color, Point};
use crate::layer::DropShadowParams;
use crate::telemetry::{CompletionHandler, SubmissionStatus, SubmissionTelemetry};

/// One backend operation as observed by the recording surface.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    CreateSurface { kind: SurfaceKind },
    Rebuild { width: u32, height: u32 },
    Clear { background: Color },
    Draw { textured: bool, vertex_count: usize },
    Effects { count: usize },
    Present { lane_id: u64, packet_id: u64 },
    Shadow { radius: f32, opacity: f32 },
    Transform,
    Position(Point),
}

#[derive(Default)]
struct RecorderShared {
    ops: Mutex<Vec<RecordedOp>>,
    fail_next_rebuild: AtomicBool,
}

/// Surface factory recording every backend operation.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    shared: Arc<RecorderShared>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the full op log.
    pub fn ops(&self) -> Vec<RecordedOp> {
        self.shared.ops.lock().clone()
    }

    /// True if any recorded op matches the predicate.
    pub fn saw(&self, predicate: impl Fn(&RecordedOp) -> bool) -> bool {
        self.shared.ops.lock().iter().any(predicate)
    }

    pub fn clear_ops(&self) {
        self.shared.ops.lock().clear();
    }

    /// Makes the next backing rebuild fail, exercising the retained-target
    /// path.
    pub fn fail_next_rebuild(&self) {
        self.shared.fail_next_rebuild.store(true, Ordering::SeqCst);
    }
}

impl SurfaceBackend for RecordingBackend {
    // Fixed floor keeps backing-dimension expectations identical on every
    // platform the tests run on.
    fn scale_floor(&self) -> f32 {
        1.0
    }

    fn create_surface(
        &mut self,
        _target: &ViewRenderTarget,
        kind: SurfaceKind,
        position: Point,
    ) -> Result<Box<dyn GpuSurface>, BackendError> {
        let mut ops = self.shared.ops.lock();
        ops.push(RecordedOp::CreateSurface { kind });
        ops.push(RecordedOp::Position(position));
        Ok(Box::new(RecordingSurface {
            shared: self.shared.clone(),
        }))
    }
}

struct RecordingSurface {
    shared: Arc<RecorderShared>,
}

impl GpuSurface for RecordingSurface {
    fn rebuild(&mut self, backing_width: u32, backing_height: u32) -> Result<(), BackendError> {
        if self.shared.fail_next_rebuild.swap(false, Ordering::SeqCst) {
            return Err(BackendError::RebuildFailed);
        }
        self.shared.ops.lock().push(RecordedOp::Rebuild {
            width: backing_width,
            height: backing_height,
        });
        Ok(())
    }

    fn begin_frame(&mut self, background: Color) -> Result<(), BackendError> {
        self.shared.ops.lock().push(RecordedOp::Clear { background });
        Ok(())
    }

    fn draw_mesh(&mut self, mesh: &Mesh, paint: &PaintSpec) -> Result<(), BackendError> {
        self.shared.ops.lock().push(RecordedOp::Draw {
            textured: paint.is_textured(),
            vertex_count: mesh.vertex_count(),
        });
        Ok(())
    }

    fn apply_effects(&mut self, effects: &[CanvasEffect]) -> Result<bool, BackendError> {
        self.shared.ops.lock().push(RecordedOp::Effects {
            count: effects.len(),
        });
        Ok(true)
    }

    fn present(
        &mut self,
        ticket: PresentTicket,
        on_complete: CompletionHandler,
    ) -> Result<(), BackendError> {
        self.shared.ops.lock().push(RecordedOp::Present {
            lane_id: ticket.lane_id,
            packet_id: ticket.packet_id,
        });
        // Synchronous completion keeps presented-clock tests deterministic.
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

    fn set_position(&mut self, position: Point) {
        self.shared.ops.lock().push(RecordedOp::Position(position));
    }

    fn set_shadow(&mut self, params: &DropShadowParams) {
        self.shared.ops.lock().push(RecordedOp::Shadow {
            radius: params.radius,
            opacity: params.opacity,
        });
    }

    fn set_transform(&mut self, _matrix: Mat4) {
        self.shared.ops.lock().push(RecordedOp::Transform);
    }
}
