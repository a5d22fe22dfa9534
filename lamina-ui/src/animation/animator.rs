//! Per-view animation drivers.
//!
//! A [`ViewAnimator`] owns the tick loop for one view: every tick samples
//! the active clips, diffs against the last submitted values and pushes the
//! resulting layer/view commands through the view's proxy as one packet
//! with a deadline one tick budget out. [`LayerAnimator`]s share the view
//! animator's state and bind clips to specific layers.
//!
//! Ticks run on a dedicated per-animator timer thread (never on the
//! scheduler thread); [`ViewAnimator::advance`] is the same entry point the
//! timer uses and can be driven directly with a synthetic clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::client::{ClientProxy, CompositorClient};
use crate::command::RectDelta;
use crate::geometry::Rect;
use crate::layer::{DropShadowParams, LayerEffect, LayerId, LayerTree, TransformationParams};
use crate::telemetry::TelemetryState;

use super::curve::clamp01;
use super::handle::{
    AnimationHandle, AnimationId, AnimationState, ClockMode, Direction, FillMode, TimingOptions,
};
use super::track::{Interpolate, KeyframeTrack};
use crate::animation::curve::AnimationCurve;

static ANIMATION_ID_SEED: AtomicU64 = AtomicU64::new(1);

/// Animatable properties of one layer.
#[derive(Default, Clone)]
pub struct LayerClip {
    pub rect: Option<KeyframeTrack<Rect>>,
    pub transform: Option<KeyframeTrack<TransformationParams>>,
    pub shadow: Option<KeyframeTrack<DropShadowParams>>,
    pub opacity: Option<KeyframeTrack<f32>>,
}

impl LayerClip {
    fn track_count(&self) -> u64 {
        self.rect.is_some() as u64
            + self.transform.is_some() as u64
            + self.shadow.is_some() as u64
            + self.opacity.is_some() as u64
    }

    fn is_empty(&self) -> bool {
        self.track_count() == 0
    }
}

/// Animatable properties of the view surface itself.
#[derive(Default, Clone)]
pub struct ViewClip {
    pub rect: Option<KeyframeTrack<Rect>>,
    pub opacity: Option<KeyframeTrack<f32>>,
}

/// The authoritative per-view animation counter block.
#[derive(Debug, Default, Clone)]
pub struct AnimationDiagnostics {
    pub sync_lane_id: u64,
    pub tick_count: u64,
    pub stale_steps_skipped: u64,
    pub monotonic_progress_clamps: u64,
    pub active_track_count: u64,
    pub completed_track_count: u64,
    pub cancelled_track_count: u64,
    pub failed_track_count: u64,
    pub queued_packet_count: u64,
    pub submitted_packet_count: u64,
    pub presented_packet_count: u64,
    pub dropped_packet_count: u64,
    pub failed_packet_count: u64,
    pub last_submitted_packet_id: u64,
    pub last_presented_packet_id: u64,
    pub in_flight: u32,
    pub stale_skip_mode: bool,
    pub lane_under_pressure: bool,
    pub resize_budget_active: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AnimationTarget {
    Layer(LayerId),
    View,
}

#[derive(Default)]
struct LastValues {
    rect: Option<Rect>,
    transform: Option<TransformationParams>,
    shadow: Option<DropShadowParams>,
    opacity: Option<f32>,
}

struct ActiveAnimation {
    handle: AnimationHandle,
    target: AnimationTarget,
    clip: LayerClip,
    timing: TimingOptions,
    start_at: Option<Instant>,
    last_tick: Option<Instant>,
    iter_progress: f32,
    laps: f32,
    reversed_leg: bool,
    overall_progress: f32,
    stale_ticks: u32,
    pending_packet: Option<u64>,
    total_steps: u32,
    presented_step: bool,
    last_values: LastValues,
    finalized: bool,
}

struct AnimatorState {
    client: CompositorClient,
    animations: Vec<ActiveAnimation>,
    diagnostics: AnimationDiagnostics,
    resize_budget_active: bool,
    last_observed_dropped: u64,
}

struct Ticker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

struct AnimatorInner {
    proxy: Arc<ClientProxy>,
    tree: Arc<LayerTree>,
    telemetry: Arc<TelemetryState>,
    state: Mutex<AnimatorState>,
    registry: DashMap<AnimationId, AnimationHandle>,
    frame_rate: AtomicU32,
    ticker: Mutex<Option<Ticker>>,
}

/// Animation driver for one view.
pub struct ViewAnimator {
    inner: Arc<AnimatorInner>,
}

/// Weak observation handle to a view animator, used by the resize
/// coordinator to detect animated sub-trees and flip the resize-safe
/// budget without owning the animator.
pub struct AnimatorProbe {
    inner: std::sync::Weak<AnimatorInner>,
}

impl AnimatorProbe {
    pub fn has_running_animations(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            inner.state.lock().animations.iter().any(|a| {
                matches!(
                    a.handle.state(),
                    AnimationState::Pending | AnimationState::Running
                )
            })
        })
    }

    pub fn set_resize_budget_active(&self, active: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state.lock().resize_budget_active = active;
        }
    }
}

/// Animation driver bound to one layer of a view.
pub struct LayerAnimator {
    inner: Arc<AnimatorInner>,
    layer: LayerId,
}

impl ViewAnimator {
    pub fn new(proxy: Arc<ClientProxy>, tree: Arc<LayerTree>, telemetry: Arc<TelemetryState>) -> Self {
        let client = CompositorClient::new(proxy.clone());
        Self {
            inner: Arc::new(AnimatorInner {
                proxy,
                tree,
                telemetry,
                state: Mutex::new(AnimatorState {
                    client,
                    animations: Vec::new(),
                    diagnostics: AnimationDiagnostics::default(),
                    resize_budget_active: false,
                    last_observed_dropped: 0,
                }),
                registry: DashMap::new(),
                frame_rate: AtomicU32::new(30),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Registers a view clip; returns an invalid handle for empty clips.
    pub fn animate(&self, clip: ViewClip, timing: TimingOptions) -> AnimationHandle {
        let clip = LayerClip {
            rect: clip.rect,
            opacity: clip.opacity,
            ..Default::default()
        };
        register(&self.inner, clip, AnimationTarget::View, timing)
    }

    /// Like [`Self::animate`], binding the view's proxy to a caller-chosen
    /// sync lane first so related animations correlate across widgets.
    pub fn animate_on_lane(
        &self,
        clip: ViewClip,
        timing: TimingOptions,
        sync_lane_id: u64,
    ) -> AnimationHandle {
        self.inner.proxy.set_sync_lane_id(sync_lane_id);
        self.animate(clip, timing)
    }

    /// A weak observation handle for the resize coordinator.
    pub fn probe(&self) -> AnimatorProbe {
        AnimatorProbe {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// A layer-bound driver sharing this animator's tick loop and lane.
    pub fn layer_animator(&self, layer: LayerId) -> LayerAnimator {
        LayerAnimator {
            inner: self.inner.clone(),
            layer,
        }
    }

    pub fn set_frame_rate(&self, frames_per_sec: u32) {
        self.inner.frame_rate.store(frames_per_sec.max(2), Ordering::Relaxed);
    }

    /// Cancels all outstanding animation commands of this view.
    pub fn pause(&self) {
        self.inner.state.lock().client.cancel_current_jobs();
    }

    /// Animation commands are queue-driven; resume is a no-op.
    pub fn resume(&self) {}

    /// True while any registered animation is pending or running.
    pub fn has_running_animations(&self) -> bool {
        self.inner.state.lock().animations.iter().any(|a| {
            matches!(
                a.handle.state(),
                AnimationState::Pending | AnimationState::Running
            )
        })
    }

    /// Marks resize-safe budget mode (widened tick deadlines) on or off.
    pub fn set_resize_budget_active(&self, active: bool) {
        self.inner.state.lock().resize_budget_active = active;
    }

    /// Drives one tick at `now`. Also the timer-thread entry point; tests
    /// call it directly with a synthetic clock.
    pub fn advance(&self, now: Instant) {
        advance_inner(&self.inner, now);
    }

    /// Spawns the periodic tick thread at the current frame rate.
    pub fn start_ticker(&self) {
        let mut guard = self.inner.ticker.lock();
        if guard.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner = self.inner.clone();
        let thread = std::thread::Builder::new()
            .name("lamina-animator".into())
            .spawn(move || {
                loop {
                    let fps = inner.frame_rate.load(Ordering::Relaxed).max(2);
                    let interval = Duration::from_micros(1_000_000 / fps as u64);
                    match stop_rx.recv_timeout(interval) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            advance_inner(&inner, Instant::now());
                        }
                        _ => break,
                    }
                }
            })
            .expect("failed to spawn the animator tick thread");
        *guard = Some(Ticker { stop_tx, thread });
    }

    pub fn stop_ticker(&self) {
        let ticker = self.inner.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.stop_tx.send(());
            let _ = ticker.thread.join();
        }
    }

    /// Snapshot of the per-view diagnostics merged with the lane telemetry.
    pub fn diagnostics(&self) -> AnimationDiagnostics {
        let state = self.inner.state.lock();
        let mut diagnostics = state.diagnostics.clone();
        let lane_id = self.inner.proxy.sync_lane_id();
        let lane = self.inner.telemetry.lane(lane_id);
        diagnostics.sync_lane_id = lane_id;
        diagnostics.presented_packet_count = lane.presented_packets;
        diagnostics.dropped_packet_count = lane.dropped_packets;
        diagnostics.failed_packet_count = lane.failed_packets;
        diagnostics.last_presented_packet_id = lane.last_presented_packet_id;
        diagnostics.in_flight = state
            .animations
            .iter()
            .filter(|a| a.pending_packet.is_some())
            .count() as u32;
        diagnostics.lane_under_pressure =
            lane.last_submitted_packet_id > lane.last_presented_packet_id + 1;
        diagnostics.resize_budget_active = state.resize_budget_active;
        diagnostics
    }
}

impl Drop for ViewAnimator {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

impl LayerAnimator {
    /// Registers a layer clip; returns an invalid handle for empty clips.
    pub fn animate(&self, clip: LayerClip, timing: TimingOptions) -> AnimationHandle {
        register(&self.inner, clip, AnimationTarget::Layer(self.layer), timing)
    }

    pub fn animate_on_lane(
        &self,
        clip: LayerClip,
        timing: TimingOptions,
        sync_lane_id: u64,
    ) -> AnimationHandle {
        self.inner.proxy.set_sync_lane_id(sync_lane_id);
        self.animate(clip, timing)
    }

    /// Applies a drop shadow immediately.
    pub fn apply_shadow(&self, params: DropShadowParams) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.client.push_layer_effect(
            self.inner.tree.clone(),
            self.layer,
            LayerEffect::DropShadow(params),
            now,
            now,
        );
    }

    /// Applies a transformation immediately.
    pub fn apply_transformation(&self, params: TransformationParams) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.client.push_layer_effect(
            self.inner.tree.clone(),
            self.layer,
            LayerEffect::Transformation(params),
            now,
            now,
        );
    }

    /// Eased shadow burst: one effect command per frame over `duration_ms`.
    pub fn shadow_transition(
        &self,
        from: DropShadowParams,
        to: DropShadowParams,
        duration_ms: u32,
        curve: AnimationCurve,
    ) {
        self.effect_transition(duration_ms, |t| {
            LayerEffect::DropShadow(Interpolate::interpolate(&from, &to, curve.sample(t)))
        });
    }

    /// Eased transformation burst.
    pub fn transform_transition(
        &self,
        from: TransformationParams,
        to: TransformationParams,
        duration_ms: u32,
        curve: AnimationCurve,
    ) {
        self.effect_transition(duration_ms, |t| {
            LayerEffect::Transformation(Interpolate::interpolate(&from, &to, curve.sample(t)))
        });
    }

    /// Spreads a rect delta evenly over the frames of `duration_ms`.
    pub fn resize_transition(&self, delta: RectDelta, duration_ms: u32) {
        let frames = self.frames_for(duration_ms);
        let step = RectDelta {
            dx: delta.dx / frames as f32,
            dy: delta.dy / frames as f32,
            dw: delta.dw / frames as f32,
            dh: delta.dh / frames as f32,
        };
        let start = Instant::now();
        let interval = Duration::from_millis((duration_ms / frames).max(1) as u64);
        let mut deadline = start + interval;
        let mut state = self.inner.state.lock();
        for _ in 0..frames {
            state.client.push_layer_resize(
                self.inner.tree.clone(),
                self.layer,
                step,
                start,
                deadline,
            );
            deadline += interval;
        }
    }

    fn frames_for(&self, duration_ms: u32) -> u32 {
        let fps = self.inner.frame_rate.load(Ordering::Relaxed).max(2);
        ((duration_ms as u64 * fps as u64) / 1000).max(1) as u32
    }

    fn effect_transition(&self, duration_ms: u32, effect_at: impl Fn(f32) -> LayerEffect) {
        let frames = self.frames_for(duration_ms);
        let start = Instant::now();
        let interval = Duration::from_millis((duration_ms / frames).max(1) as u64);
        let mut deadline = start + interval;
        let mut state = self.inner.state.lock();
        for i in 0..frames {
            let t = (i + 1) as f32 / frames as f32;
            state.client.push_layer_effect(
                self.inner.tree.clone(),
                self.layer,
                effect_at(t),
                start,
                deadline,
            );
            deadline += interval;
        }
    }
}

fn register(
    inner: &Arc<AnimatorInner>,
    clip: LayerClip,
    target: AnimationTarget,
    timing: TimingOptions,
) -> AnimationHandle {
    if clip.is_empty() {
        return AnimationHandle::default();
    }
    let id = ANIMATION_ID_SEED.fetch_add(1, Ordering::Relaxed);
    let handle = AnimationHandle::create(id, AnimationState::Pending);
    handle.set_playback_rate(timing.playback_rate.max(f32::EPSILON));
    let total_steps = ((timing.duration_ms as u64 * timing.frame_rate_hint.max(1) as u64) / 1000)
        .max(1) as u32;
    let mut state = inner.state.lock();
    state.diagnostics.active_track_count += clip.track_count();
    state.animations.push(ActiveAnimation {
        handle: handle.clone(),
        target,
        clip,
        timing,
        start_at: None,
        last_tick: None,
        iter_progress: 0.0,
        laps: 0.0,
        reversed_leg: matches!(timing.direction, Direction::Reverse | Direction::AlternateReverse),
        overall_progress: 0.0,
        stale_ticks: 0,
        pending_packet: None,
        total_steps,
        presented_step: false,
        last_values: LastValues::default(),
        finalized: false,
    });
    inner.registry.insert(id, handle.clone());
    debug!(animation_id = id, "animation registered");
    handle
}

fn advance_inner(inner: &Arc<AnimatorInner>, now: Instant) {
    let lane_id = inner.proxy.sync_lane_id();
    let lane = inner.telemetry.lane(lane_id);
    let frame_rate = inner.frame_rate.load(Ordering::Relaxed).max(2);

    let mut state = inner.state.lock();
    let AnimatorState {
        client,
        animations,
        diagnostics,
        resize_budget_active,
        last_observed_dropped,
    } = &mut *state;
    diagnostics.tick_count += 1;

    // Lane drops since the last tick are attributed to whatever is still
    // in flight.
    if lane.dropped_packets > *last_observed_dropped {
        for animation in animations.iter().filter(|a| a.pending_packet.is_some()) {
            animation.handle.add_dropped();
        }
        *last_observed_dropped = lane.dropped_packets;
    }

    inner.proxy.begin_record();
    let packet_id = inner.proxy.peek_next_packet_id();
    let mut submitted_handles: Vec<AnimationHandle> = Vec::new();
    let mut any_stale_skip = false;

    for animation in animations.iter_mut() {
        let outcome = update_animation(
            animation,
            now,
            client,
            &inner.tree,
            lane.last_presented_packet_id,
            diagnostics,
            frame_rate,
            *resize_budget_active,
        );
        match outcome {
            TickOutcome::Submitted => {
                animation.pending_packet = Some(packet_id);
                submitted_handles.push(animation.handle.clone());
            }
            TickOutcome::StaleSkipped => any_stale_skip = true,
            TickOutcome::Idle => {}
        }
    }
    inner.proxy.end_record();

    if !submitted_handles.is_empty() {
        diagnostics.queued_packet_count += 1;
        diagnostics.submitted_packet_count += 1;
        diagnostics.last_submitted_packet_id = packet_id;
        for handle in &submitted_handles {
            handle.set_submitted_packet(packet_id);
        }
    }
    diagnostics.stale_skip_mode = any_stale_skip;

    // Drop finalized animations from the runtime registry.
    for animation in animations.iter().filter(|a| a.finalized) {
        inner.registry.remove(&animation.handle.id());
    }
    animations.retain(|a| !a.finalized);
}

enum TickOutcome {
    Idle,
    Submitted,
    StaleSkipped,
}

#[allow(clippy::too_many_arguments)]
fn update_animation(
    animation: &mut ActiveAnimation,
    now: Instant,
    client: &mut CompositorClient,
    tree: &Arc<LayerTree>,
    lane_last_presented: u64,
    diagnostics: &mut AnimationDiagnostics,
    frame_rate: u32,
    resize_budget_active: bool,
) -> TickOutcome {
    match animation.handle.state() {
        AnimationState::Cancelled => {
            if !animation.finalized {
                client.cancel_current_jobs();
                diagnostics.cancelled_track_count += animation.clip.track_count();
                animation.finalized = true;
            }
            return TickOutcome::Idle;
        }
        AnimationState::Failed => {
            if !animation.finalized {
                diagnostics.failed_track_count += animation.clip.track_count();
                animation.finalized = true;
            }
            return TickOutcome::Idle;
        }
        AnimationState::Completed => return TickOutcome::Idle,
        AnimationState::Paused => {
            animation.last_tick = Some(now);
            return TickOutcome::Idle;
        }
        AnimationState::Pending => {
            let start_at = *animation
                .start_at
                .get_or_insert(now + Duration::from_millis(animation.timing.delay_ms as u64));
            if now < start_at {
                return TickOutcome::Idle;
            }
            animation.handle.set_state(AnimationState::Running);
            animation.last_tick = Some(now);
        }
        AnimationState::Running => {}
    }

    // A layer-bound animation whose target left the tree cannot make
    // further progress.
    if let AnimationTarget::Layer(layer) = animation.target
        && tree.layer_rect(layer).is_err()
    {
        animation.handle.set_failure_reason("target layer detached");
        return TickOutcome::Idle;
    }

    // Feed back presentation of the last submitted step.
    if let Some(pending) = animation.pending_packet
        && lane_last_presented >= pending
    {
        animation.handle.set_presented_packet(pending);
        animation.pending_packet = None;
        animation.stale_ticks = 0;
        animation.presented_step = true;
    }

    // External seek: the handle's progress is authoritative when it moved
    // under us.
    let external = animation.handle.progress();
    if external.to_bits() != animation.overall_progress.to_bits() {
        let iterations = animation.timing.iterations.max(f32::EPSILON);
        let total = external * iterations;
        animation.laps = total.floor();
        animation.iter_progress = total - animation.laps;
        if matches!(
            animation.timing.direction,
            Direction::Alternate | Direction::AlternateReverse
        ) {
            let base = matches!(animation.timing.direction, Direction::AlternateReverse);
            animation.reversed_leg = base ^ ((animation.laps as u64) % 2 == 1);
        }
        animation.overall_progress = external;
    }

    let last_tick = animation.last_tick.replace(now).unwrap_or(now);
    let dt = now.saturating_duration_since(last_tick);
    let duration = Duration::from_millis(animation.timing.duration_ms.max(1) as u64);
    let rate = animation.handle.playback_rate();

    let advance = match animation.timing.clock_mode {
        ClockMode::WallClock => dt.as_secs_f32() * rate / duration.as_secs_f32(),
        ClockMode::PresentedClock => {
            if animation.pending_packet.is_some() {
                // The reserved step has not presented yet; hold progress.
                0.0
            } else if std::mem::take(&mut animation.presented_step) {
                rate / animation.total_steps as f32
            } else {
                0.0
            }
        }
        ClockMode::Hybrid => {
            if animation.pending_packet.is_some() {
                animation.stale_ticks += 1;
                if animation.stale_ticks > animation.timing.max_catchup_steps as u32 {
                    // Presentation lags past the catch-up budget: wait for it.
                    diagnostics.stale_steps_skipped += 1;
                    return TickOutcome::StaleSkipped;
                }
            }
            dt.as_secs_f32() * rate / duration.as_secs_f32()
        }
    };

    // Integrate in per-iteration space, flipping alternate legs per lap.
    let mut completed = false;
    let mut remaining = advance.max(0.0);
    while remaining > 0.0 {
        let room = 1.0 - animation.iter_progress;
        if remaining < room {
            animation.iter_progress += remaining;
            break;
        }
        remaining -= room;
        animation.iter_progress = 1.0;
        if animation.laps + 1.0 >= animation.timing.iterations {
            completed = true;
            break;
        }
        animation.laps += 1.0;
        animation.iter_progress = 0.0;
        if matches!(
            animation.timing.direction,
            Direction::Alternate | Direction::AlternateReverse
        ) {
            animation.reversed_leg = !animation.reversed_leg;
        }
    }

    let iterations = animation.timing.iterations.max(f32::EPSILON);
    let mut overall = clamp01((animation.laps + animation.iter_progress) / iterations);
    if completed {
        overall = 1.0;
    }
    if overall < animation.overall_progress {
        overall = animation.overall_progress;
        diagnostics.monotonic_progress_clamps += 1;
    }
    animation.overall_progress = overall;
    animation.handle.set_progress(overall);

    let mut sample_t = if animation.reversed_leg {
        1.0 - animation.iter_progress
    } else {
        animation.iter_progress
    };
    if completed && matches!(animation.timing.fill_mode, FillMode::None | FillMode::Backwards) {
        // Snap back to the first leg's start value.
        sample_t = if matches!(
            animation.timing.direction,
            Direction::Reverse | Direction::AlternateReverse
        ) {
            1.0
        } else {
            0.0
        };
    }

    let budget_ms = {
        let base = (1000 / frame_rate.max(2) as u64).max(1);
        if resize_budget_active && animation.timing.prefer_resize_safe_budget {
            base * 2
        } else {
            base
        }
    };
    let deadline = now + Duration::from_millis(budget_ms);

    let submitted = sample_and_push(animation, sample_t, client, tree, now, deadline);

    if completed {
        animation.handle.set_state(AnimationState::Completed);
        diagnostics.completed_track_count += animation.clip.track_count();
        animation.finalized = true;
    }

    if submitted {
        TickOutcome::Submitted
    } else {
        TickOutcome::Idle
    }
}

fn sample_and_push(
    animation: &mut ActiveAnimation,
    t: f32,
    client: &mut CompositorClient,
    tree: &Arc<LayerTree>,
    now: Instant,
    deadline: Instant,
) -> bool {
    let mut pushed = false;

    if let Some(track) = &animation.clip.rect {
        let sampled = track.sample(t);
        let changed = animation
            .last_values
            .rect
            .is_none_or(|last| !last.approx_eq(&sampled));
        if changed {
            let current = current_rect(animation, tree).unwrap_or(sampled);
            let delta = RectDelta {
                dx: sampled.origin.x - current.origin.x,
                dy: sampled.origin.y - current.origin.y,
                dw: sampled.width - current.width,
                dh: sampled.height - current.height,
            };
            match animation.target {
                AnimationTarget::Layer(layer) => {
                    client.push_layer_resize(tree.clone(), layer, delta, now, deadline);
                }
                AnimationTarget::View => {
                    client.push_view_resize(delta, now, deadline);
                }
            }
            animation.last_values.rect = Some(sampled);
            pushed = true;
        }
    }

    if let Some(track) = &animation.clip.transform {
        let sampled = track.sample(t);
        if animation.last_values.transform != Some(sampled)
            && let Some(layer) = effect_layer(animation, tree)
        {
            client.push_layer_effect(
                tree.clone(),
                layer,
                LayerEffect::Transformation(sampled),
                now,
                deadline,
            );
            animation.last_values.transform = Some(sampled);
            pushed = true;
        }
    }

    // Opacity has no standalone surface property; it rides on the shadow
    // parameters.
    let shadow_sample = animation.clip.shadow.as_ref().map(|track| track.sample(t));
    let opacity_sample = animation.clip.opacity.as_ref().map(|track| track.sample(t));
    if shadow_sample.is_some() || opacity_sample.is_some() {
        let mut params = shadow_sample
            .or(animation.last_values.shadow)
            .unwrap_or_default();
        if let Some(opacity) = opacity_sample {
            params.opacity = opacity;
        }
        let changed = animation.last_values.shadow != Some(params)
            || animation.last_values.opacity != opacity_sample;
        if changed && let Some(layer) = effect_layer(animation, tree) {
            client.push_layer_effect(
                tree.clone(),
                layer,
                LayerEffect::DropShadow(params),
                now,
                deadline,
            );
            animation.last_values.shadow = Some(params);
            animation.last_values.opacity = opacity_sample;
            pushed = true;
        }
    }

    pushed
}

fn current_rect(animation: &ActiveAnimation, tree: &Arc<LayerTree>) -> Option<Rect> {
    match animation.target {
        AnimationTarget::Layer(layer) => tree.layer_rect(layer).ok(),
        AnimationTarget::View => {
            let limb = tree.root_limb()?;
            let root = tree.limb_root_layer(limb).ok()?;
            tree.layer_rect(root).ok()
        }
    }
}

fn effect_layer(animation: &ActiveAnimation, tree: &Arc<LayerTree>) -> Option<LayerId> {
    match animation.target {
        AnimationTarget::Layer(layer) => Some(layer),
        AnimationTarget::View => {
            let limb = tree.root_limb()?;
            tree.limb_root_layer(limb).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::client::CommandFrontend;
    use crate::command::{CommandStatus, CompositorCommand};
    use crate::telemetry::{SubmissionStatus, SubmissionTelemetry};

    /// Frontend recording variant tags; optionally resolves everything `Ok`
    /// (leave unresolved to keep client receipts outstanding).
    struct OkFrontend {
        seen: PlMutex<Vec<&'static str>>,
        resolve: bool,
        held: PlMutex<Vec<CompositorCommand>>,
    }

    impl OkFrontend {
        fn new(resolve: bool) -> Self {
            Self {
                seen: PlMutex::new(Vec::new()),
                resolve,
                held: PlMutex::new(Vec::new()),
            }
        }
    }

    impl CommandFrontend for OkFrontend {
        fn schedule(&self, mut command: CompositorCommand) {
            let tag = match &command {
                CompositorCommand::Render { .. } => "render",
                CompositorCommand::LayerResize { .. } => "layer_resize",
                CompositorCommand::LayerEffect { .. } => "layer_effect",
                CompositorCommand::ViewResize { .. } => "view_resize",
                CompositorCommand::Cancel { .. } => "cancel",
                CompositorCommand::Packet { .. } => "packet",
            };
            self.seen.lock().push(tag);
            if self.resolve {
                command.resolve(CommandStatus::Ok);
            } else {
                self.held.lock().push(command);
            }
        }
    }

    struct Fixture {
        animator: ViewAnimator,
        frontend: Arc<OkFrontend>,
        telemetry: Arc<TelemetryState>,
        tree: Arc<LayerTree>,
        layer: LayerId,
        lane: u64,
    }

    fn fixture(lane: u64) -> Fixture {
        fixture_opts(lane, true)
    }

    fn fixture_opts(lane: u64, resolve: bool) -> Fixture {
        let proxy = Arc::new(ClientProxy::new_detached());
        proxy.set_sync_lane_id(lane);
        let frontend = Arc::new(OkFrontend::new(resolve));
        proxy.set_frontend(Some(frontend.clone()));
        let tree = Arc::new(LayerTree::new());
        let limb = tree.create_limb(Rect::new(0.0, 0.0, 100.0, 100.0));
        tree.set_root_limb(limb).unwrap();
        let layer = tree.limb_root_layer(limb).unwrap();
        let telemetry = TelemetryState::new();
        let animator = ViewAnimator::new(proxy, tree.clone(), telemetry.clone());
        Fixture {
            animator,
            frontend,
            telemetry,
            tree,
            layer,
            lane,
        }
    }

    fn rect_clip(to: Rect) -> LayerClip {
        LayerClip {
            rect: Some(KeyframeTrack::transition(
                Rect::new(0.0, 0.0, 100.0, 100.0),
                to,
                AnimationCurve::linear(),
            )),
            ..Default::default()
        }
    }

    fn present(telemetry: &Arc<TelemetryState>, lane: u64, packet: u64) {
        let now = Instant::now();
        telemetry.on_backend_completed(&SubmissionTelemetry {
            lane_id: lane,
            packet_id: packet,
            submit_cpu: now,
            complete_cpu: now,
            present_cpu: now,
            gpu_start_sec: 0.0,
            gpu_end_sec: 0.0,
            status: SubmissionStatus::Completed,
        });
    }

    #[test]
    fn empty_clip_yields_an_invalid_handle() {
        let f = fixture(11);
        let handle = f
            .animator
            .layer_animator(f.layer)
            .animate(LayerClip::default(), TimingOptions::default());
        assert!(!handle.valid());
        assert!(!f.animator.has_running_animations());
    }

    #[test]
    fn wall_clock_animation_runs_to_completion() {
        let f = fixture(12);
        let timing = TimingOptions {
            duration_ms: 100,
            clock_mode: ClockMode::WallClock,
            ..Default::default()
        };
        let handle = f
            .animator
            .layer_animator(f.layer)
            .animate(rect_clip(Rect::new(0.0, 0.0, 200.0, 100.0)), timing);
        assert!(handle.valid());
        assert_eq!(handle.state(), AnimationState::Pending);

        let t0 = Instant::now();
        f.animator.advance(t0);
        assert_eq!(handle.state(), AnimationState::Running);
        f.animator.advance(t0 + Duration::from_millis(50));
        assert!((handle.progress() - 0.5).abs() < 0.05);
        f.animator.advance(t0 + Duration::from_millis(150));
        assert_eq!(handle.state(), AnimationState::Completed);
        assert_eq!(handle.progress(), 1.0);

        // The runtime registry drops completed animations.
        assert!(!f.animator.has_running_animations());
        assert!(f.frontend.seen.lock().iter().any(|t| *t == "layer_resize"));
        let diagnostics = f.animator.diagnostics();
        assert_eq!(diagnostics.completed_track_count, 1);
        assert!(diagnostics.submitted_packet_count >= 1);
    }

    #[test]
    fn identical_timing_and_clock_produce_identical_progress() {
        let run = |lane: u64, base: Instant| -> Vec<u32> {
            let f = fixture(lane);
            let timing = TimingOptions {
                duration_ms: 200,
                clock_mode: ClockMode::WallClock,
                ..Default::default()
            };
            let handle = f
                .animator
                .layer_animator(f.layer)
                .animate(rect_clip(Rect::new(0.0, 0.0, 300.0, 50.0)), timing);
            let mut samples = Vec::new();
            for step in 0..10 {
                f.animator.advance(base + Duration::from_millis(step * 25));
                samples.push(handle.progress().to_bits());
            }
            samples
        };
        let base = Instant::now();
        assert_eq!(run(13, base), run(14, base));
    }

    #[test]
    fn hybrid_clock_stale_skips_when_presentation_lags() {
        let f = fixture(15);
        let timing = TimingOptions {
            duration_ms: 1000,
            clock_mode: ClockMode::Hybrid,
            max_catchup_steps: 1,
            ..Default::default()
        };
        let handle = f
            .animator
            .layer_animator(f.layer)
            .animate(rect_clip(Rect::new(0.0, 0.0, 500.0, 100.0)), timing);

        let t0 = Instant::now();
        let mut last_progress = 0.0f32;
        // Five ticks with no presentation at all: the animator submits,
        // overruns its catch-up budget, then waits.
        for i in 0..5 {
            f.animator.advance(t0 + Duration::from_millis(16 * i));
            let progress = handle.progress();
            assert!(progress >= last_progress, "progress must never regress");
            last_progress = progress;
        }
        let diagnostics = f.animator.diagnostics();
        assert!(diagnostics.stale_steps_skipped >= 2);
        assert!(diagnostics.stale_skip_mode);
        assert!(diagnostics.in_flight >= 1);

        // Presentation catches up: the animator resumes advancing.
        let lagging = handle.last_submitted_packet_id();
        present(&f.telemetry, f.lane, lagging);
        f.animator.advance(t0 + Duration::from_millis(96));
        assert!(!f.animator.diagnostics().stale_skip_mode);
        assert_eq!(handle.last_presented_packet_id(), lagging);
        assert!(handle.progress() > last_progress);
    }

    #[test]
    fn presented_clock_advances_only_on_presentation() {
        let f = fixture(16);
        let timing = TimingOptions {
            duration_ms: 100,
            frame_rate_hint: 10, // ten steps
            clock_mode: ClockMode::PresentedClock,
            ..Default::default()
        };
        let handle = f
            .animator
            .layer_animator(f.layer)
            .animate(rect_clip(Rect::new(0.0, 0.0, 200.0, 200.0)), timing);

        let t0 = Instant::now();
        f.animator.advance(t0);
        let after_first = handle.progress();
        // No presentation: further ticks do not advance.
        f.animator.advance(t0 + Duration::from_millis(16));
        f.animator.advance(t0 + Duration::from_millis(32));
        assert_eq!(handle.progress(), after_first);

        present(&f.telemetry, f.lane, handle.last_submitted_packet_id());
        f.animator.advance(t0 + Duration::from_millis(48));
        assert!(handle.progress() > after_first);
    }

    #[test]
    fn cancel_issues_a_covering_cancel_command() {
        // Keep receipts outstanding so the cancel range has jobs to cover.
        let f = fixture_opts(17, false);
        let timing = TimingOptions {
            duration_ms: 1000,
            clock_mode: ClockMode::WallClock,
            ..Default::default()
        };
        let handle = f
            .animator
            .layer_animator(f.layer)
            .animate(rect_clip(Rect::new(0.0, 0.0, 400.0, 400.0)), timing);

        let t0 = Instant::now();
        f.animator.advance(t0);
        f.animator.advance(t0 + Duration::from_millis(16));
        handle.cancel();
        f.animator.advance(t0 + Duration::from_millis(32));

        assert_eq!(handle.state(), AnimationState::Cancelled);
        assert!(f.frontend.seen.lock().iter().any(|t| *t == "cancel"));
        assert_eq!(f.animator.diagnostics().cancelled_track_count, 1);
        assert!(!f.animator.has_running_animations());
    }

    #[test]
    fn alternate_direction_flips_each_lap() {
        let f = fixture(18);
        let timing = TimingOptions {
            duration_ms: 100,
            iterations: 2.0,
            direction: Direction::Alternate,
            clock_mode: ClockMode::WallClock,
            fill_mode: FillMode::Forwards,
            ..Default::default()
        };
        let target = Rect::new(0.0, 0.0, 300.0, 100.0);
        let handle = f
            .animator
            .layer_animator(f.layer)
            .animate(rect_clip(target), timing);

        let t0 = Instant::now();
        f.animator.advance(t0);
        // Mid second lap: past the first iteration, below completion.
        f.animator.advance(t0 + Duration::from_millis(150));
        assert_eq!(handle.state(), AnimationState::Running);
        assert!(handle.progress() > 0.5 && handle.progress() < 1.0);
        f.animator.advance(t0 + Duration::from_millis(250));
        assert_eq!(handle.state(), AnimationState::Completed);
    }

    #[test]
    fn animation_fails_when_its_layer_is_unresolvable() {
        let f = fixture(21);
        // A layer handle this animator's tree cannot resolve.
        let other = LayerTree::new();
        let foreign_limb = other.create_limb(Rect::UNIT);
        let _filler = other.make_layer(foreign_limb, Rect::UNIT).unwrap();
        let foreign_layer = other.make_layer(foreign_limb, Rect::UNIT).unwrap();
        assert!(f.tree.layer_rect(foreign_layer).is_err());

        let handle = f.animator.layer_animator(foreign_layer).animate(
            rect_clip(Rect::UNIT),
            TimingOptions {
                clock_mode: ClockMode::WallClock,
                ..Default::default()
            },
        );
        assert!(handle.valid());

        let t0 = Instant::now();
        f.animator.advance(t0);
        assert_eq!(handle.state(), AnimationState::Failed);
        assert!(handle.failure_reason().is_some());
        f.animator.advance(t0 + Duration::from_millis(16));
        assert_eq!(f.animator.diagnostics().failed_track_count, 1);
        assert!(!f.animator.has_running_animations());
    }

    #[test]
    fn transitions_emit_one_command_per_frame() {
        let f = fixture(20);
        f.animator.set_frame_rate(10);
        let layer_animator = f.animator.layer_animator(f.layer);

        layer_animator.shadow_transition(
            DropShadowParams::default(),
            DropShadowParams {
                radius: 8.0,
                opacity: 1.0,
                ..Default::default()
            },
            500,
            AnimationCurve::ease_out(),
        );
        // 10 fps over 500 ms: five effect commands.
        let effects = f
            .frontend
            .seen
            .lock()
            .iter()
            .filter(|t| **t == "layer_effect")
            .count();
        assert_eq!(effects, 5);

        layer_animator.resize_transition(
            RectDelta {
                dx: 0.0,
                dy: 0.0,
                dw: 50.0,
                dh: 0.0,
            },
            300,
        );
        let resizes = f
            .frontend
            .seen
            .lock()
            .iter()
            .filter(|t| **t == "layer_resize")
            .count();
        assert_eq!(resizes, 3);
    }

    #[test]
    fn opacity_rides_on_the_shadow_parameters() {
        let f = fixture(19);
        let clip = LayerClip {
            opacity: Some(KeyframeTrack::transition(0.0f32, 1.0, AnimationCurve::linear())),
            ..Default::default()
        };
        let timing = TimingOptions {
            duration_ms: 100,
            clock_mode: ClockMode::WallClock,
            ..Default::default()
        };
        let handle = f.animator.layer_animator(f.layer).animate(clip, timing);
        assert!(handle.valid());
        f.animator.advance(Instant::now());
        assert!(f.frontend.seen.lock().iter().any(|t| *t == "layer_effect"));
    }
}
