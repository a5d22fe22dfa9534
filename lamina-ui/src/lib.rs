//! # Lamina UI
//!
//! Lamina is a retained-mode compositor for widget toolkits. Widgets capture
//! paint intent into frames of draw commands; frames travel through per-view
//! client proxies as atomically-dispatched packets; a deadline-aware
//! scheduler thread orders and executes them against a GPU backend that
//! mirrors each view's layer tree as a visual tree of surfaces.
//!
//! ## Architecture Overview
//!
//! The core is a pipeline from widget paint calls to on-screen submission:
//!
//! - **Layer trees** ([`layer`]) — the retained scene graph widgets own:
//!   a [`LayerTree`] of per-view limbs of layers, arena-backed with handle
//!   back-references.
//! - **Canvases and frames** ([`canvas`]) — a [`Canvas`] is bound to one
//!   layer and accumulates ordered [`VisualCommand`]s and [`CanvasEffect`]s
//!   into single-use [`Frame`]s.
//! - **Client proxies** ([`client`]) — per-view record/submit frontends:
//!   everything recorded in one `begin_record`/`end_record` window submits
//!   as one packet stamped with the proxy's sync lane and a per-proxy
//!   monotonic packet id.
//! - **The scheduler** ([`scheduler`]) — one [`Compositor`] per widget tree
//!   host owns a total-ordered priority queue and a dedicated dispatcher
//!   thread with deadline waits, range cancellation and drain-on-shutdown.
//! - **The backend** ([`backend`]) — the render-target store maps targets
//!   to visual trees; per-surface contexts own sanitized rects, clamped
//!   backing stores, the effect queue and present flow. The GPU sits behind
//!   a surface seam implemented by the wgpu reference backend.
//! - **Animation** ([`animation`]) — keyframe tracks sampled on per-view
//!   ticks, driven by wall-clock, presentation telemetry, or a hybrid that
//!   stale-skips when the lane lags.
//! - **Hosting** ([`host`], [`widget`], [`view`]) — the widget tree host
//!   owns the compositor, dispatches paints, and coordinates live resizes
//!   (paint suspension plus one authoritative post-resize flush).
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lamina_ui::{
//!     Brush, Color, CompositorConfig, PaintContext, PaintReason, Rect, Widget, WidgetTreeHost,
//! };
//! use lamina_ui::backend::engine::{GpuEngine, WgpuBackend};
//!
//! struct Fill;
//!
//! impl Widget for Fill {
//!     fn on_paint(&mut self, context: &mut PaintContext<'_>, _reason: PaintReason) {
//!         let bounds = context.bounds();
//!         context.canvas().set_background(Color::WHITE);
//!         context.canvas().draw_rect(bounds, Brush::Solid(Color::BLACK), None);
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = GpuEngine::new()?;
//! let mut host = WidgetTreeHost::new(
//!     Box::new(WgpuBackend::new(engine)),
//!     CompositorConfig::default(),
//! );
//! // The native handle wraps the platform window (`WgpuNativeSurface`).
//! host.add_widget(Box::new(Fill), Arc::new(()), Rect::new(0.0, 0.0, 640.0, 480.0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! One scheduler thread per compositor, created at construction and joined
//! at shutdown. Proxy methods are callable from any thread. Widget paint
//! callbacks run on the invoking thread and only produce data. Animation
//! ticks run on per-animator timer threads and never block the scheduler.

/// Animation runtime: curves, tracks, handles, animators.
pub mod animation;
/// Render-target store, visual trees and GPU execution.
pub mod backend;
/// Paint intent capture: brushes, visual commands, frames, canvases.
pub mod canvas;
/// Per-view record/submit proxies and command producers.
pub mod client;
/// Compositor commands and their completion channels.
pub mod command;
/// Geometry and color primitives.
pub mod geometry;
/// Widget tree hosting and the resize coordinator.
pub mod host;
/// The retained layer scene graph.
pub mod layer;
/// The compositor frontend and scheduler thread.
pub mod scheduler;
/// Submission telemetry and per-lane counters.
pub mod telemetry;
/// Views bridging widgets to render targets.
pub mod view;
/// The widget paint contract.
pub mod widget;

/// Test support: the recording surface backend.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use animation::{
    AnimationCurve, AnimationDiagnostics, AnimationHandle, AnimationState, ClockMode, Direction,
    FillMode, KeyframeTrack, KeyframeValue, LayerAnimator, LayerClip, TimingOptions, ViewAnimator,
    ViewClip,
};
pub use canvas::{
    Border, Brush, Canvas, CanvasEffect, FontEngine, Frame, Gradient, GradientStop, GpuFence,
    GpuTexture, TextAlignment, TextLayoutDescriptor, TextWrapping, VisualCommand,
};
pub use client::{ClientProxy, CommandFrontend, CompositorClient, RenderTargetId, ViewRenderTarget};
pub use command::{CommandReceipt, CommandStatus, CompositorCommand, Priority, RectDelta, Schedule};
pub use geometry::{Color, Ellipse, Point, Rect, RoundedRect, VectorPath};
pub use host::{
    ResizeDynamicsSample, ResizePhase, ResizeSessionState, SuspendCounters, WidgetId,
    WidgetTreeHost,
};
pub use layer::{
    DropShadowParams, LayerEffect, LayerId, LayerTree, LayerTreeObserver, LimbId, Rotation,
    TransformationParams, TreeError,
};
pub use scheduler::{Compositor, CompositorConfig, InlineExecutor, MainThreadExecutor};
pub use telemetry::{
    LaneTelemetry, PacketDropReason, SubmissionStatus, SubmissionTelemetry, TelemetryState,
};
pub use view::View;
pub use widget::{PaintContext, PaintMode, PaintOptions, PaintReason, Widget, WidgetObserver, WidgetPod};

// Re-exported so embedders build against the same GPU API version.
pub use wgpu;
