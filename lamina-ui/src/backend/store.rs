//! Render-target store and compositor command execution.
//!
//! The store maps client render-target ids to their backend state: a visual
//! tree plus the layer → visual cache. [`ExecutionState`] owns the store,
//! the surface backend and the telemetry handle, and executes the
//! non-structural command variants on the scheduler's execution context
//! (cancel filtering and packet unrolling live in the scheduler itself).

use std::sync::Arc;
use std::time::Instant;

use glam::Mat4;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::client::{RenderTargetId, ViewRenderTarget};
use crate::command::{CommandStatus, CompositorCommand};
use crate::geometry::Rect;
use crate::layer::{LayerEffect, LayerId, LayerTree, TransformationParams};
use crate::telemetry::{PacketDropReason, TelemetryState};

use super::context::RenderTargetContext;
use super::surface::{BackendError, PresentTicket, SurfaceBackend, SurfaceKind};
use super::visual::{Visual, VisualId, VisualTree};

/// Backend state of one client render target.
#[derive(Default)]
pub struct BackendCompRenderTarget {
    pub tree: VisualTree,
    pub surface_targets: FxHashMap<LayerId, VisualId>,
}

/// All known render targets.
#[derive(Default)]
pub struct RenderTargetStore {
    targets: FxHashMap<RenderTargetId, BackendCompRenderTarget>,
}

impl RenderTargetStore {
    pub fn get(&self, id: RenderTargetId) -> Option<&BackendCompRenderTarget> {
        self.targets.get(&id)
    }

    pub fn get_mut(&mut self, id: RenderTargetId) -> Option<&mut BackendCompRenderTarget> {
        self.targets.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Scheduler-side executor of backend-visible commands.
pub struct ExecutionState {
    store: RenderTargetStore,
    backend: Box<dyn SurfaceBackend>,
    telemetry: Arc<TelemetryState>,
    render_scale: f32,
}

impl ExecutionState {
    pub fn new(
        backend: Box<dyn SurfaceBackend>,
        telemetry: Arc<TelemetryState>,
        render_scale: Option<f32>,
    ) -> Self {
        let floor = backend.scale_floor();
        Self {
            store: RenderTargetStore::default(),
            backend,
            telemetry,
            render_scale: render_scale.unwrap_or(floor).max(floor),
        }
    }

    pub fn store(&self) -> &RenderTargetStore {
        &self.store
    }

    /// Executes one non-packet, non-cancel command, resolving its status.
    pub fn execute(&mut self, command: CompositorCommand) {
        match command {
            CompositorCommand::Render { header, target, frame } => {
                self.execute_render(header, target, frame);
            }
            CompositorCommand::LayerResize {
                mut header,
                tree,
                layer,
                delta,
                ..
            } => {
                match tree.layer_rect(layer) {
                    Ok(rect) => {
                        let next = rect.offset_by(delta.dx, delta.dy, delta.dw, delta.dh);
                        let _ = tree.resize_layer(layer, next);
                        header.status.resolve(CommandStatus::Ok);
                    }
                    Err(_) => {
                        self.telemetry.mark_failed(header.lane_id, header.packet_id);
                        header.status.resolve(CommandStatus::Failed);
                    }
                }
            }
            CompositorCommand::LayerEffect {
                header,
                target,
                tree,
                layer,
                effect,
            } => {
                self.execute_layer_effect(header, target, tree, layer, effect);
            }
            CompositorCommand::ViewResize { mut header, target, delta } => {
                let resized = self.resize_root_visual(target.id(), |rect| {
                    rect.offset_by(delta.dx, delta.dy, delta.dw, delta.dh)
                });
                match resized {
                    Ok(()) => header.status.resolve(CommandStatus::Ok),
                    Err(_) => {
                        self.telemetry.mark_dropped(
                            header.lane_id,
                            header.packet_id,
                            PacketDropReason::RebuildFailed,
                        );
                        header.status.resolve(CommandStatus::Delayed);
                    }
                }
            }
            CompositorCommand::Cancel { mut header, .. } => {
                // Cancel is filtered by the scheduler against its queue; by
                // the time it reaches execution there is nothing left to do.
                header.status.resolve(CommandStatus::Ok);
            }
            CompositorCommand::Packet { mut header, commands } => {
                for inner in commands {
                    self.execute(inner);
                }
                header.status.resolve(CommandStatus::Ok);
            }
        }
    }

    fn execute_render(
        &mut self,
        mut header: crate::command::CommandHeader,
        target: Arc<ViewRenderTarget>,
        frame: crate::canvas::Frame,
    ) {
        let lane_id = header.lane_id;
        let packet_id = header.packet_id;

        let visual_id = match self.ensure_layer_context(&target, &frame.tree, frame.target_layer) {
            Ok(id) => id,
            Err(error) => {
                warn!(?error, "could not resolve a surface for render command");
                self.telemetry
                    .mark_dropped(lane_id, packet_id, drop_reason_of(&error));
                header.status.resolve(CommandStatus::Delayed);
                return;
            }
        };

        let Ok(layer_rect) = frame.tree.layer_rect(frame.target_layer) else {
            self.telemetry.mark_failed(lane_id, packet_id);
            header.status.resolve(CommandStatus::Failed);
            return;
        };

        let entry = self
            .store
            .targets
            .get_mut(&target.id())
            .expect("target entry created by ensure_layer_context");
        let visual = entry
            .tree
            .get_mut(visual_id)
            .expect("visual created by ensure_layer_context");

        if visual.resize(layer_rect).is_err() {
            self.telemetry
                .mark_dropped(lane_id, packet_id, PacketDropReason::RebuildFailed);
            header.status.resolve(CommandStatus::Delayed);
            return;
        }

        // Spurious empty transparent frames show up during startup and
        // layout. Dropping them before any clear keeps the last presented
        // content on screen.
        if frame.is_no_op() {
            debug!(lane_id, packet_id, "skipping no-op transparent frame");
            self.telemetry
                .mark_dropped(lane_id, packet_id, PacketDropReason::NoOpTransparent);
            header.status.resolve(CommandStatus::Ok);
            return;
        }

        if visual.context.clear(frame.background).is_err() {
            self.telemetry.mark_failed(lane_id, packet_id);
            header.status.resolve(CommandStatus::Failed);
            return;
        }
        for command in &frame.visuals {
            if let Err(error) = visual.context.render_visual(command) {
                warn!(?error, "draw dispatch failed; continuing frame");
            }
        }
        for effect in &frame.effects {
            visual.context.queue_effect(*effect);
        }

        let submit_cpu = Instant::now();
        self.telemetry.mark_submitted(lane_id, packet_id);
        let telemetry = self.telemetry.clone();
        let ticket = PresentTicket {
            lane_id,
            packet_id,
            submit_cpu,
        };
        match visual.context.commit(
            ticket,
            Box::new(move |report| telemetry.on_backend_completed(&report)),
        ) {
            Ok(()) => header.status.resolve(CommandStatus::Ok),
            Err(error) => {
                warn!(?error, "commit failed");
                self.telemetry.mark_failed(lane_id, packet_id);
                header.status.resolve(CommandStatus::Failed);
            }
        }
    }

    fn execute_layer_effect(
        &mut self,
        mut header: crate::command::CommandHeader,
        target: Arc<ViewRenderTarget>,
        tree: Arc<LayerTree>,
        layer: LayerId,
        effect: LayerEffect,
    ) {
        let lane_id = header.lane_id;
        let packet_id = header.packet_id;
        let _ = tree.set_layer_effect(layer, effect);

        let visual_id = match self.ensure_layer_context(&target, &tree, layer) {
            Ok(id) => id,
            Err(error) => {
                warn!(?error, "layer effect arrived before its surface could be built");
                self.telemetry
                    .mark_dropped(lane_id, packet_id, PacketDropReason::MissingSurface);
                header.status.resolve(CommandStatus::Delayed);
                return;
            }
        };

        let entry = self
            .store
            .targets
            .get_mut(&target.id())
            .expect("target entry created by ensure_layer_context");
        let visual = entry
            .tree
            .get_mut(visual_id)
            .expect("visual created by ensure_layer_context");
        match effect {
            LayerEffect::DropShadow(params) => visual.context.surface_mut().set_shadow(&params),
            LayerEffect::Transformation(params) => visual
                .context
                .surface_mut()
                .set_transform(compose_transform(&params)),
        }
        header.status.resolve(CommandStatus::Ok);
    }

    fn resize_root_visual(
        &mut self,
        target: RenderTargetId,
        update: impl FnOnce(Rect) -> Rect,
    ) -> Result<(), BackendError> {
        let Some(entry) = self.store.targets.get_mut(&target) else {
            // Nothing materialized yet; the first render sizes the surface.
            return Ok(());
        };
        let Some(root) = entry.tree.root() else {
            return Ok(());
        };
        let visual = entry.tree.get_mut(root).expect("root visual resolves");
        let next = update(visual.context.logical_rect());
        visual.resize(next)
    }

    /// Resolves (or creates) the surface context for `layer` under `target`,
    /// following the three-way root/child/cached logic.
    fn ensure_layer_context(
        &mut self,
        target: &Arc<ViewRenderTarget>,
        tree: &Arc<LayerTree>,
        layer: LayerId,
    ) -> Result<VisualId, BackendError> {
        let scale = self.render_scale;
        let floor = self.backend.scale_floor();
        let entry = self.store.targets.entry(target.id()).or_default();

        if let Some(&visual_id) = entry.surface_targets.get(&layer) {
            return Ok(visual_id);
        }

        let is_child = tree
            .is_child_layer(layer)
            .map_err(|_| BackendError::MissingSurface)?;
        let layer_rect = tree
            .layer_rect(layer)
            .map_err(|_| BackendError::MissingSurface)?;

        if is_child {
            if !entry.tree.has_root() {
                let limb = tree.limb_of(layer).map_err(|_| BackendError::MissingSurface)?;
                let root_layer = tree
                    .limb_root_layer(limb)
                    .map_err(|_| BackendError::MissingSurface)?;
                let root_rect = tree
                    .layer_rect(root_layer)
                    .map_err(|_| BackendError::MissingSurface)?;
                let root_id = make_visual(
                    self.backend.as_mut(),
                    target,
                    SurfaceKind::Root,
                    root_rect,
                    scale,
                    floor,
                    &mut entry.tree,
                )?;
                entry.tree.set_root(root_id);
                entry.surface_targets.insert(root_layer, root_id);
            }
            let visual_id = make_visual(
                self.backend.as_mut(),
                target,
                SurfaceKind::Child,
                layer_rect,
                scale,
                floor,
                &mut entry.tree,
            )?;
            entry.tree.add_body(visual_id);
            entry.surface_targets.insert(layer, visual_id);
            return Ok(visual_id);
        }

        if let Some(root_id) = entry.tree.root() {
            // Tree root layer appearing after the root visual exists: cache
            // the root context for it and size the root to the layer rect.
            entry.surface_targets.insert(layer, root_id);
            let visual = entry.tree.get_mut(root_id).expect("root visual resolves");
            visual.resize(layer_rect)?;
            return Ok(root_id);
        }

        let root_id = make_visual(
            self.backend.as_mut(),
            target,
            SurfaceKind::Root,
            layer_rect,
            scale,
            floor,
            &mut entry.tree,
        )?;
        entry.tree.set_root(root_id);
        entry.surface_targets.insert(layer, root_id);
        Ok(root_id)
    }

    /// Drains every backend resource; called once at scheduler shutdown.
    pub fn teardown(&mut self) {
        self.store.targets.clear();
    }
}

fn make_visual(
    backend: &mut dyn SurfaceBackend,
    target: &Arc<ViewRenderTarget>,
    kind: SurfaceKind,
    rect: Rect,
    scale: f32,
    floor: f32,
    tree: &mut VisualTree,
) -> Result<VisualId, BackendError> {
    // Surfaces place themselves in backing pixels.
    let position = crate::geometry::Point::new(rect.origin.x * scale, rect.origin.y * scale);
    let surface = backend.create_surface(target, kind, position)?;
    let context = RenderTargetContext::new(rect, scale, floor, surface)?;
    Ok(tree.insert(Visual::new(context, rect.origin)))
}

fn drop_reason_of(error: &BackendError) -> PacketDropReason {
    match error {
        BackendError::RebuildFailed => PacketDropReason::RebuildFailed,
        _ => PacketDropReason::MissingSurface,
    }
}

/// Composes the layer transformation as `T · Rz · Ry · Rx · S`.
pub fn compose_transform(params: &TransformationParams) -> Mat4 {
    let translate = Mat4::from_translation(params.translate.into());
    let rz = Mat4::from_rotation_z(params.rotate.pitch);
    let ry = Mat4::from_rotation_y(params.rotate.yaw);
    let rx = Mat4::from_rotation_x(params.rotate.roll);
    let scale = Mat4::from_scale(params.scale.into());
    translate * rz * ry * rx * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Frame;
    use crate::command::{CommandHeader, Priority, Schedule};
    use crate::geometry::Color;
    use crate::layer::{DropShadowParams, Rotation};
    use crate::testing::{RecordedOp, RecordingBackend};

    fn execution_with(backend: RecordingBackend) -> (ExecutionState, Arc<TelemetryState>) {
        let telemetry = TelemetryState::new();
        (
            ExecutionState::new(Box::new(backend), telemetry.clone(), Some(1.0)),
            telemetry,
        )
    }

    fn render_command(
        target: &Arc<ViewRenderTarget>,
        tree: &Arc<LayerTree>,
        layer: LayerId,
        background: Color,
        lane: u64,
        packet: u64,
    ) -> (CompositorCommand, crate::command::CommandReceipt) {
        let mut frame = Frame::new(tree.clone(), layer);
        frame.background = background;
        let (mut header, receipt) =
            CommandHeader::new(0, 1, Priority::Low, Schedule::immediate(Instant::now()));
        header.lane_id = lane;
        header.packet_id = packet;
        (
            CompositorCommand::Render {
                header,
                target: target.clone(),
                frame,
            },
            receipt,
        )
    }

    fn tree_with_root() -> (Arc<LayerTree>, LayerId) {
        let tree = Arc::new(LayerTree::new());
        let limb = tree.create_limb(Rect::new(0.0, 0.0, 200.0, 100.0));
        let root = tree.limb_root_layer(limb).unwrap();
        (tree, root)
    }

    #[test]
    fn first_render_creates_root_visual_and_presents() {
        let backend = RecordingBackend::new();
        let (mut exec, telemetry) = execution_with(backend.clone());
        let target = Arc::new(ViewRenderTarget::new(Arc::new(())));
        let (tree, root) = tree_with_root();

        let (command, receipt) = render_command(&target, &tree, root, Color::WHITE, 3, 1);
        exec.execute(command);

        assert_eq!(receipt.wait(), CommandStatus::Ok);
        assert!(backend.saw(|op| matches!(op, RecordedOp::Clear { .. })));
        assert!(backend.saw(|op| matches!(op, RecordedOp::Present { lane_id: 3, packet_id: 1 })));
        let lane = telemetry.lane(3);
        assert_eq!(lane.submitted_packets, 1);
        assert_eq!(lane.presented_packets, 1);
        assert_eq!(lane.last_presented_packet_id, 1);
        assert_eq!(exec.store().len(), 1);
    }

    #[test]
    fn no_op_transparent_frame_is_dropped_without_backend_work() {
        let backend = RecordingBackend::new();
        let (mut exec, telemetry) = execution_with(backend.clone());
        let target = Arc::new(ViewRenderTarget::new(Arc::new(())));
        let (tree, root) = tree_with_root();

        // Prime the surface with a real frame, then record the op count.
        let (command, receipt) = render_command(&target, &tree, root, Color::WHITE, 5, 1);
        exec.execute(command);
        assert_eq!(receipt.wait(), CommandStatus::Ok);
        let ops_before = backend.ops().len();

        let (command, receipt) = render_command(&target, &tree, root, Color::TRANSPARENT, 5, 2);
        exec.execute(command);
        assert_eq!(receipt.wait(), CommandStatus::Ok);

        // No clear, draw or present was recorded for the no-op frame.
        assert_eq!(backend.ops().len(), ops_before);
        let lane = telemetry.lane(5);
        assert_eq!(lane.dropped_packets, 1);
        assert_eq!(lane.last_drop_reason, Some(PacketDropReason::NoOpTransparent));
        assert_eq!(lane.last_presented_packet_id, 1);
    }

    #[test]
    fn child_layer_creates_root_then_child_visual() {
        let backend = RecordingBackend::new();
        let (mut exec, _telemetry) = execution_with(backend.clone());
        let target = Arc::new(ViewRenderTarget::new(Arc::new(())));
        let (tree, _root) = tree_with_root();
        let limb = tree.root_limb().unwrap_or_else(|| tree.limb_of(_root).unwrap());
        let child = tree.make_layer(limb, Rect::new(10.0, 10.0, 50.0, 40.0)).unwrap();

        let (command, receipt) = render_command(&target, &tree, child, Color::BLACK, 1, 1);
        exec.execute(command);
        assert_eq!(receipt.wait(), CommandStatus::Ok);

        let entry = exec.store().get(target.id()).unwrap();
        assert!(entry.tree.has_root());
        assert_eq!(entry.tree.body().len(), 1);
        // Root layer and child layer both resolve to cached contexts.
        assert_eq!(entry.surface_targets.len(), 2);
        let creates = backend
            .ops()
            .iter()
            .filter(|op| matches!(op, RecordedOp::CreateSurface { .. }))
            .count();
        assert_eq!(creates, 2);
    }

    #[test]
    fn layer_effect_creates_surface_on_demand() {
        let backend = RecordingBackend::new();
        let (mut exec, _telemetry) = execution_with(backend.clone());
        let target = Arc::new(ViewRenderTarget::new(Arc::new(())));
        let (tree, root) = tree_with_root();

        let (mut header, receipt) =
            CommandHeader::new(0, 1, Priority::High, Schedule::immediate(Instant::now()));
        header.lane_id = 2;
        header.packet_id = 1;
        exec.execute(CompositorCommand::LayerEffect {
            header,
            target: target.clone(),
            tree: tree.clone(),
            layer: root,
            effect: LayerEffect::DropShadow(DropShadowParams {
                radius: 4.0,
                opacity: 0.5,
                ..Default::default()
            }),
        });
        assert_eq!(receipt.wait(), CommandStatus::Ok);
        assert!(backend.saw(|op| matches!(op, RecordedOp::Shadow { .. })));
        assert!(exec.store().get(target.id()).unwrap().tree.has_root());
    }

    #[test]
    fn rebuild_failure_resolves_delayed_and_keeps_target() {
        let backend = RecordingBackend::new();
        let (mut exec, telemetry) = execution_with(backend.clone());
        let target = Arc::new(ViewRenderTarget::new(Arc::new(())));
        let (tree, root) = tree_with_root();

        let (command, receipt) = render_command(&target, &tree, root, Color::WHITE, 9, 1);
        exec.execute(command);
        assert_eq!(receipt.wait(), CommandStatus::Ok);

        // Grow the layer so the next render must rebuild, and make that
        // rebuild fail.
        tree.resize_layer(root, Rect::new(0.0, 0.0, 800.0, 800.0)).unwrap();
        backend.fail_next_rebuild();
        let (command, receipt) = render_command(&target, &tree, root, Color::WHITE, 9, 2);
        exec.execute(command);
        assert_eq!(receipt.wait(), CommandStatus::Delayed);
        let lane = telemetry.lane(9);
        assert_eq!(lane.last_drop_reason, Some(PacketDropReason::RebuildFailed));

        // The retry on the next frame succeeds against the kept target.
        let (command, receipt) = render_command(&target, &tree, root, Color::WHITE, 9, 3);
        exec.execute(command);
        assert_eq!(receipt.wait(), CommandStatus::Ok);
    }

    #[test]
    fn transform_composition_order_is_t_rz_ry_rx_s() {
        let params = TransformationParams {
            translate: [10.0, 0.0, 0.0],
            rotate: Rotation {
                pitch: std::f32::consts::FRAC_PI_2,
                yaw: 0.0,
                roll: 0.0,
            },
            scale: [2.0, 2.0, 1.0],
        };
        let m = compose_transform(&params);
        // Scale applies before rotation, rotation before translation:
        // (1, 0) → scaled (2, 0) → rotated (0, 2) → translated (10, 2).
        let v = m * glam::Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert!((v.x - 10.0).abs() < 1e-4);
        assert!((v.y - 2.0).abs() < 1e-4);
    }
}
