//! The widget tree host: compositor ownership, paint dispatch and the
//! resize coordinator.
//!
//! A host owns one [`Compositor`] (constructed with it, shut down with it)
//! and one sync lane shared by all of its widgets' views. During a live
//! window resize the host runs a resize session: while the session is
//! active or settling and the sub-tree is static (no running animations),
//! paint invalidations are deferred and counted; completing the session
//! emits one authoritative flush that repaints every widget synchronously
//! in compositor-recording order, exactly one packet per proxy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

use crate::animation::{AnimatorProbe, ViewAnimator};
use crate::backend::surface::SurfaceBackend;
use crate::client::NativeSurfaceHandle;
use crate::geometry::Rect;
use crate::layer::LayerTree;
use crate::scheduler::{Compositor, CompositorConfig};
use crate::view::View;
use crate::widget::{PaintMode, PaintReason, Widget, WidgetPod};

static HOST_LANE_SEED: AtomicU64 = AtomicU64::new(1);
static SESSION_ID_SEED: AtomicU64 = AtomicU64::new(1);

/// Phase of one resize session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResizePhase {
    #[default]
    Idle,
    Active,
    Settling,
    Completed,
}

/// One dynamics sample of a live resize.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ResizeDynamicsSample {
    pub timestamp_ms: f64,
    pub width: f32,
    pub height: f32,
    pub velocity_px_per_sec: f32,
    pub acceleration_px_per_sec2: f32,
}

/// Observable state of the current (or last) resize session.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ResizeSessionState {
    pub session_id: u64,
    pub phase: ResizePhase,
    pub sample: ResizeDynamicsSample,
    pub animated_tree: bool,
}

/// Finite-difference tracker of resize velocity and acceleration.
#[derive(Default)]
pub struct ResizeDynamicsTracker {
    session_id: u64,
    in_session: bool,
    started_at: Option<Instant>,
    last_tick: Option<Instant>,
    last_width: f32,
    last_height: f32,
    last_velocity: f32,
}

impl ResizeDynamicsTracker {
    pub fn active(&self) -> bool {
        self.in_session
    }

    pub fn begin(&mut self, width: f32, height: f32, now: Instant) -> ResizeSessionState {
        self.session_id = SESSION_ID_SEED.fetch_add(1, Ordering::Relaxed);
        self.in_session = true;
        self.started_at = Some(now);
        self.last_tick = Some(now);
        self.last_width = width;
        self.last_height = height;
        self.last_velocity = 0.0;
        ResizeSessionState {
            session_id: self.session_id,
            phase: ResizePhase::Active,
            sample: ResizeDynamicsSample {
                timestamp_ms: 0.0,
                width,
                height,
                velocity_px_per_sec: 0.0,
                acceleration_px_per_sec2: 0.0,
            },
            animated_tree: false,
        }
    }

    fn sample(&mut self, width: f32, height: f32, now: Instant) -> ResizeDynamicsSample {
        let dt = self
            .last_tick
            .map(|t| now.saturating_duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        let dw = width - self.last_width;
        let dh = height - self.last_height;
        let velocity = if dt > 0.0 {
            (dw * dw + dh * dh).sqrt() / dt
        } else {
            self.last_velocity
        };
        let acceleration = if dt > 0.0 {
            (velocity - self.last_velocity) / dt
        } else {
            0.0
        };
        self.last_tick = Some(now);
        self.last_width = width;
        self.last_height = height;
        self.last_velocity = velocity;
        ResizeDynamicsSample {
            timestamp_ms: self
                .started_at
                .map(|t| now.saturating_duration_since(t).as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            width,
            height,
            velocity_px_per_sec: velocity,
            acceleration_px_per_sec2: acceleration,
        }
    }

    pub fn update(&mut self, width: f32, height: f32, now: Instant) -> ResizeSessionState {
        if !self.in_session {
            return self.begin(width, height, now);
        }
        ResizeSessionState {
            session_id: self.session_id,
            phase: ResizePhase::Active,
            sample: self.sample(width, height, now),
            animated_tree: false,
        }
    }

    pub fn end(&mut self, width: f32, height: f32, now: Instant) -> ResizeSessionState {
        let sample = self.sample(width, height, now);
        self.in_session = false;
        ResizeSessionState {
            session_id: self.session_id,
            phase: ResizePhase::Settling,
            sample,
            animated_tree: false,
        }
    }
}

/// Counters of the static-suspend contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuspendCounters {
    pub resize_updates: u64,
    pub deferred_paints: u64,
    pub deferred_resize_paints: u64,
    pub deferred_immediate_paints: u64,
    pub authoritative_flushes: u64,
    pub last_deferred_reason: Option<PaintReason>,
}

/// Handle of a widget mounted in a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidgetId(usize);

/// Owns a widget tree, its compositor and the resize coordinator.
pub struct WidgetTreeHost {
    compositor: Compositor,
    lane_id: u64,
    widgets: Vec<WidgetPod>,
    tracker: ResizeDynamicsTracker,
    session: ResizeSessionState,
    counters: SuspendCounters,
    probes: Vec<AnimatorProbe>,
}

impl WidgetTreeHost {
    pub fn new(backend: Box<dyn SurfaceBackend>, config: CompositorConfig) -> Self {
        Self {
            compositor: Compositor::new(backend, config),
            lane_id: HOST_LANE_SEED.fetch_add(1, Ordering::Relaxed),
            widgets: Vec::new(),
            tracker: ResizeDynamicsTracker::default(),
            session: ResizeSessionState::default(),
            counters: SuspendCounters::default(),
            probes: Vec::new(),
        }
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    pub fn lane_id(&self) -> u64 {
        self.lane_id
    }

    /// Mounts a widget: builds its layer tree and root view, wires the
    /// compositor frontend and the host lane, and (for automatic-mode
    /// widgets) issues the initial paint.
    pub fn add_widget(
        &mut self,
        widget: Box<dyn Widget>,
        native: NativeSurfaceHandle,
        rect: Rect,
    ) -> WidgetId {
        let tree = Arc::new(LayerTree::new());
        let view = View::new_root(native, rect, tree);
        view.set_frontend_recurse(Some(self.compositor.frontend()));
        view.set_sync_lane_recurse(self.lane_id);
        let pod = WidgetPod::new(widget, view);
        let automatic = pod.paint_mode() == PaintMode::Automatic;
        let id = WidgetId(self.widgets.len());
        self.widgets.push(pod);
        if automatic {
            self.invalidate_now(id, PaintReason::Initial);
        }
        id
    }

    pub fn widget(&self, id: WidgetId) -> Option<&WidgetPod> {
        self.widgets.get(id.0)
    }

    pub fn widget_mut(&mut self, id: WidgetId) -> Option<&mut WidgetPod> {
        self.widgets.get_mut(id.0)
    }

    /// An animation driver over the widget's view, registered with the
    /// resize coordinator's animated-tree detection.
    pub fn animator_for(&mut self, id: WidgetId) -> Option<ViewAnimator> {
        let pod = self.widgets.get(id.0)?;
        let animator = pod.view().animator(self.compositor.telemetry());
        self.probes.push(animator.probe());
        Some(animator)
    }

    /// Requests a repaint; deferred while a static resize session is live.
    pub fn invalidate(&mut self, id: WidgetId, reason: PaintReason) {
        self.invalidate_impl(id, reason, false);
    }

    /// Requests an immediate repaint; still deferred (and counted as an
    /// immediate deferral) while a static resize session is live.
    pub fn invalidate_now(&mut self, id: WidgetId, reason: PaintReason) {
        self.invalidate_impl(id, reason, true);
    }

    fn invalidate_impl(&mut self, id: WidgetId, reason: PaintReason, immediate: bool) {
        let suspended = self.should_suspend_paint_during_resize();
        let Some(pod) = self.widgets.get_mut(id.0) else {
            return;
        };
        if suspended {
            if immediate {
                self.counters.deferred_immediate_paints += 1;
            } else if reason == PaintReason::Resize {
                self.counters.deferred_resize_paints += 1;
            } else {
                self.counters.deferred_paints += 1;
            }
            self.counters.last_deferred_reason = Some(reason);
            pod.note_pending(reason);
            return;
        }
        pod.paint_now(reason);
    }

    /// Resizes a widget (deduped) and, per its paint options, invalidates.
    pub fn set_widget_rect(&mut self, id: WidgetId, rect: Rect) {
        let Some(pod) = self.widgets.get_mut(id.0) else {
            return;
        };
        if !pod.set_rect(rect) {
            return;
        }
        if pod.paint_options().invalidate_on_resize {
            self.invalidate(id, PaintReason::Resize);
        }
    }

    /// True while paints must be deferred: session Active/Settling over a
    /// static sub-tree.
    pub fn should_suspend_paint_during_resize(&self) -> bool {
        matches!(self.session.phase, ResizePhase::Active | ResizePhase::Settling)
            && !self.session.animated_tree
    }

    pub fn counters(&self) -> &SuspendCounters {
        &self.counters
    }

    pub fn session_state(&self) -> &ResizeSessionState {
        &self.session
    }

    /// Opens a resize session. A sub-tree with at least one running
    /// animation disables suspension for the whole session.
    pub fn notify_window_resize_begin(&mut self, rect: Rect) {
        let animated = self.probes.iter().any(|p| p.has_running_animations());
        self.session = self.tracker.begin(rect.width, rect.height, Instant::now());
        self.session.animated_tree = animated;
        self.counters = SuspendCounters::default();
        for probe in &self.probes {
            probe.set_resize_budget_active(true);
        }
        debug!(
            session_id = self.session.session_id,
            animated, "resize session began"
        );
    }

    /// Records one live resize update, resizing the root widget's view.
    pub fn notify_window_resize(&mut self, rect: Rect) {
        let animated = self.session.animated_tree;
        self.session = self.tracker.update(rect.width, rect.height, Instant::now());
        self.session.animated_tree = animated;
        self.counters.resize_updates += 1;
        if let Some(root) = self.widgets.first_mut() {
            root.set_rect(rect);
        }
    }

    /// Ends the session: settles, then completes with the authoritative
    /// flush (static sub-trees only; animated trees painted normally all
    /// along).
    pub fn notify_window_resize_end(&mut self, rect: Rect) {
        let animated = self.session.animated_tree;
        self.session = self.tracker.end(rect.width, rect.height, Instant::now());
        self.session.animated_tree = animated;
        if let Some(root) = self.widgets.first_mut() {
            root.set_rect(rect);
        }
        for probe in &self.probes {
            probe.set_resize_budget_active(false);
        }
        if !animated {
            self.flush_authoritative();
        }
        self.session.phase = ResizePhase::Completed;
        debug!(session_id = self.session.session_id, "resize session completed");
    }

    /// Repaints every widget synchronously in compositor-recording order;
    /// each widget's paint is one recording session, so each affected proxy
    /// submits exactly one packet.
    fn flush_authoritative(&mut self) {
        self.counters.authoritative_flushes += 1;
        for pod in &mut self.widgets {
            let reason = pod.take_pending().unwrap_or(PaintReason::Resize);
            pod.paint_now(reason);
        }
    }

    /// Shuts the compositor down explicitly (also happens on drop).
    pub fn shutdown(&mut self) {
        for pod in &self.widgets {
            pod.notify_detach();
        }
        self.compositor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use super::*;
    use crate::animation::{LayerClip, TimingOptions};
    use crate::animation::track::KeyframeTrack;
    use crate::animation::curve::AnimationCurve;
    use crate::canvas::Brush;
    use crate::geometry::Color;
    use crate::testing::RecordingBackend;
    use crate::widget::PaintContext;

    struct FillWidget {
        paints: Arc<AtomicUsize>,
    }

    impl Widget for FillWidget {
        fn on_paint(&mut self, context: &mut PaintContext<'_>, _reason: PaintReason) {
            let bounds = context.bounds();
            context.canvas().set_background(Color::WHITE);
            context.canvas().draw_rect(bounds, Brush::Solid(Color::BLACK), None);
            self.paints.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    fn host_with_widget() -> (WidgetTreeHost, WidgetId, Arc<AtomicUsize>, RecordingBackend) {
        let backend = RecordingBackend::new();
        let mut host = WidgetTreeHost::new(Box::new(backend.clone()), CompositorConfig::default());
        let paints = Arc::new(AtomicUsize::new(0));
        let id = host.add_widget(
            Box::new(FillWidget { paints: paints.clone() }),
            Arc::new(()),
            Rect::new(0.0, 0.0, 640.0, 480.0),
        );
        (host, id, paints, backend)
    }

    #[test]
    fn static_resize_session_defers_then_flushes_once() {
        let (mut host, id, paints, _backend) = host_with_widget();
        let lane = host.lane_id();
        // Initial paint (with warmup) has already queued its packets.
        let baseline_packets = host.compositor().telemetry().lane(lane).queued_packets;
        let baseline_paints = paints.load(AtomicOrdering::Relaxed);

        host.notify_window_resize_begin(Rect::new(0.0, 0.0, 640.0, 480.0));
        assert!(host.should_suspend_paint_during_resize());

        host.invalidate(id, PaintReason::StateChanged);
        host.invalidate(id, PaintReason::StateChanged);
        host.invalidate(id, PaintReason::StateChanged);
        host.invalidate_now(id, PaintReason::Resize);

        // Nothing painted, nothing queued while suspended.
        assert_eq!(paints.load(AtomicOrdering::Relaxed), baseline_paints);
        assert_eq!(
            host.compositor().telemetry().lane(lane).queued_packets,
            baseline_packets
        );
        let counters = host.counters();
        assert_eq!(counters.deferred_paints, 3);
        assert_eq!(counters.deferred_immediate_paints, 1);
        assert_eq!(counters.deferred_resize_paints, 0);
        assert_eq!(counters.last_deferred_reason, Some(PaintReason::Resize));

        host.notify_window_resize_end(Rect::new(0.0, 0.0, 800.0, 600.0));
        assert_eq!(host.session_state().phase, ResizePhase::Completed);
        let counters = host.counters();
        assert_eq!(counters.authoritative_flushes, 1);
        // The flush repainted the widget exactly once, as exactly one packet.
        assert_eq!(paints.load(AtomicOrdering::Relaxed), baseline_paints + 1);
        assert_eq!(
            host.compositor().telemetry().lane(lane).queued_packets,
            baseline_packets + 1
        );
    }

    #[test]
    fn flush_emits_one_packet_per_proxy() {
        let (mut host, _id, _paints, _backend) = host_with_widget();
        let second_paints = Arc::new(AtomicUsize::new(0));
        host.add_widget(
            Box::new(FillWidget { paints: second_paints.clone() }),
            Arc::new(()),
            Rect::new(0.0, 0.0, 320.0, 240.0),
        );
        let lane = host.lane_id();
        let baseline = host.compositor().telemetry().lane(lane).queued_packets;

        host.notify_window_resize_begin(Rect::new(0.0, 0.0, 640.0, 480.0));
        host.notify_window_resize(Rect::new(0.0, 0.0, 700.0, 500.0));
        host.notify_window_resize_end(Rect::new(0.0, 0.0, 720.0, 520.0));

        assert_eq!(host.counters().resize_updates, 1);
        // Two widgets, two proxies, two packets.
        assert_eq!(
            host.compositor().telemetry().lane(lane).queued_packets,
            baseline + 2
        );
        // Initial paint warmed up with two passes; the flush added one more.
        assert_eq!(second_paints.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn animated_tree_disables_suspension() {
        let (mut host, id, paints, _backend) = host_with_widget();
        let animator = host.animator_for(id).expect("animator");
        let layer = host.widget(id).unwrap().view().root_layer();
        let clip = LayerClip {
            rect: Some(KeyframeTrack::transition(
                Rect::new(0.0, 0.0, 640.0, 480.0),
                Rect::new(0.0, 0.0, 800.0, 600.0),
                AnimationCurve::linear(),
            )),
            ..Default::default()
        };
        let handle = animator.layer_animator(layer).animate(
            clip,
            TimingOptions {
                duration_ms: 10_000,
                ..Default::default()
            },
        );
        assert!(handle.valid());

        host.notify_window_resize_begin(Rect::new(0.0, 0.0, 640.0, 480.0));
        assert!(host.session_state().animated_tree);
        assert!(!host.should_suspend_paint_during_resize());

        let before = paints.load(AtomicOrdering::Relaxed);
        host.invalidate(id, PaintReason::StateChanged);
        // Paints propagate normally.
        assert_eq!(paints.load(AtomicOrdering::Relaxed), before + 1);
        assert_eq!(host.counters().deferred_paints, 0);
        host.notify_window_resize_end(Rect::new(0.0, 0.0, 640.0, 480.0));
    }

    #[test]
    fn dynamics_tracker_computes_velocity_and_acceleration() {
        let mut tracker = ResizeDynamicsTracker::default();
        let t0 = Instant::now();
        let state = tracker.begin(100.0, 100.0, t0);
        assert_eq!(state.phase, ResizePhase::Active);
        assert_eq!(state.sample.velocity_px_per_sec, 0.0);

        let state = tracker.update(150.0, 100.0, t0 + Duration::from_millis(100));
        assert!((state.sample.velocity_px_per_sec - 500.0).abs() < 1.0);
        assert!((state.sample.acceleration_px_per_sec2 - 5000.0).abs() < 10.0);

        let state = tracker.end(150.0, 100.0, t0 + Duration::from_millis(200));
        assert_eq!(state.phase, ResizePhase::Settling);
        assert!(!tracker.active());
        // Size stopped changing: velocity decays to zero, acceleration is
        // the negative of the previous velocity over dt.
        assert_eq!(state.sample.velocity_px_per_sec, 0.0);
        assert!(state.sample.acceleration_px_per_sec2 < 0.0);
    }
}
