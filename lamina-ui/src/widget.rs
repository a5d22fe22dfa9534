//! The widget paint contract and the host-side widget pod.
//!
//! Widgets implement [`Widget`] and only ever produce paint intent: the
//! host hands them a [`PaintContext`] over the view's root canvas, the
//! resulting frame is submitted through the view's proxy in one recording
//! session. `invalidate` never fails; failures are only observable through
//! compositor diagnostics.

use std::sync::Arc;

use tracing::debug;

use crate::canvas::Canvas;
use crate::geometry::Rect;
use crate::layer::LayerId;
use crate::view::View;

/// Whether the host repaints the widget automatically.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PaintMode {
    #[default]
    Automatic,
    Manual,
}

/// Why a paint was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintReason {
    Initial,
    StateChanged,
    Resize,
    ThemeChanged,
}

/// Knobs for the paint dispatch glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaintOptions {
    pub auto_warmup_on_initial_paint: bool,
    pub warmup_frame_count: u8,
    pub coalesce_invalidates: bool,
    pub invalidate_on_resize: bool,
}

impl Default for PaintOptions {
    fn default() -> Self {
        Self {
            auto_warmup_on_initial_paint: true,
            warmup_frame_count: 2,
            coalesce_invalidates: true,
            invalidate_on_resize: true,
        }
    }
}

/// What a widget sees while painting.
pub struct PaintContext<'a> {
    view: &'a Arc<View>,
    canvas: &'a mut Canvas,
    bounds: Rect,
    reason: PaintReason,
}

impl<'a> PaintContext<'a> {
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn reason(&self) -> PaintReason {
        self.reason
    }

    /// The canvas bound to the widget's root layer.
    pub fn canvas(&mut self) -> &mut Canvas {
        self.canvas
    }

    /// A canvas bound to a specific child layer of the widget's view.
    pub fn make_canvas(&self, layer: LayerId) -> Canvas {
        self.view.make_canvas(layer)
    }

    /// Creates a child layer under the widget's limb.
    pub fn make_layer(&self, rect: Rect) -> LayerId {
        self.view.make_layer(rect)
    }

    /// Fills the frame background.
    pub fn clear(&mut self, color: crate::geometry::Color) {
        self.canvas.set_background(color);
    }

    pub fn draw_rect(&mut self, rect: Rect, brush: crate::canvas::Brush) {
        self.canvas.draw_rect(rect, brush, None);
    }

    pub fn draw_rounded_rect(
        &mut self,
        rect: crate::geometry::RoundedRect,
        brush: crate::canvas::Brush,
    ) {
        self.canvas.draw_rounded_rect(rect, brush, None);
    }

    pub fn draw_image(&mut self, texture: std::sync::Arc<dyn crate::canvas::GpuTexture>, rect: Rect) {
        self.canvas.draw_image(texture, rect);
    }
}

/// Observer of widget lifecycle events.
pub trait WidgetObserver: Send + Sync {
    fn on_widget_attach(&self) {}
    fn on_widget_detach(&self) {}
    fn on_widget_did_show(&self) {}
    fn on_widget_did_hide(&self) {}
    fn on_widget_change_size(&self, _old: &Rect, _new: &Rect) {}
}

/// A modular UI component. Widgets only produce data (frames, commands)
/// from their paint callback; they never block or talk to the GPU.
pub trait Widget: Send {
    fn on_mount(&mut self, _view: &Arc<View>) {}
    fn on_paint(&mut self, context: &mut PaintContext<'_>, reason: PaintReason);
}

/// Host-side state of one mounted widget.
pub struct WidgetPod {
    widget: Box<dyn Widget>,
    view: Arc<View>,
    canvas: Canvas,
    mode: PaintMode,
    options: PaintOptions,
    observers: Vec<Arc<dyn WidgetObserver>>,
    pending_reason: Option<PaintReason>,
    initial_paint_done: bool,
    visible: bool,
}

impl WidgetPod {
    pub fn new(mut widget: Box<dyn Widget>, view: Arc<View>) -> Self {
        widget.on_mount(&view);
        let canvas = view.make_canvas(view.root_layer());
        Self {
            widget,
            view,
            canvas,
            mode: PaintMode::default(),
            options: PaintOptions::default(),
            observers: Vec::new(),
            pending_reason: None,
            initial_paint_done: false,
            visible: true,
        }
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    pub fn rect(&self) -> Rect {
        self.view.rect()
    }

    pub fn paint_mode(&self) -> PaintMode {
        self.mode
    }

    pub fn set_paint_mode(&mut self, mode: PaintMode) {
        self.mode = mode;
    }

    pub fn paint_options(&self) -> &PaintOptions {
        &self.options
    }

    pub fn set_paint_options(&mut self, options: PaintOptions) {
        self.options = options;
    }

    pub fn add_observer(&mut self, observer: Arc<dyn WidgetObserver>) {
        observer.on_widget_attach();
        self.observers.push(observer);
    }

    /// Resizes the widget's view; equal rects are a no-op. Returns whether
    /// the rect actually changed.
    pub fn set_rect(&mut self, rect: Rect) -> bool {
        let old = self.view.rect();
        if !self.view.resize(rect) {
            return false;
        }
        let new = self.view.rect();
        for observer in &self.observers {
            observer.on_widget_change_size(&old, &new);
        }
        true
    }

    pub fn show(&mut self) {
        if self.visible {
            return;
        }
        self.visible = true;
        let _ = self.view.tree().set_layer_visible(self.view.root_layer(), true);
        for observer in &self.observers {
            observer.on_widget_did_show();
        }
    }

    pub fn hide(&mut self) {
        if !self.visible {
            return;
        }
        self.visible = false;
        let _ = self.view.tree().set_layer_visible(self.view.root_layer(), false);
        for observer in &self.observers {
            observer.on_widget_did_hide();
        }
    }

    /// Records the pending (coalesced) invalidation reason.
    pub fn note_pending(&mut self, reason: PaintReason) {
        if self.options.coalesce_invalidates && self.pending_reason.is_some() {
            return;
        }
        self.pending_reason = Some(reason);
    }

    pub fn take_pending(&mut self) -> Option<PaintReason> {
        self.pending_reason.take()
    }

    /// Runs one paint pass synchronously: one recording session, one frame,
    /// one submitted packet. Initial paints optionally warm up with extra
    /// frames so the first presented frame is coherent.
    pub fn paint_now(&mut self, reason: PaintReason) {
        self.pending_reason = None;
        let passes = if reason == PaintReason::Initial
            && !self.initial_paint_done
            && self.options.auto_warmup_on_initial_paint
        {
            self.options.warmup_frame_count.max(1)
        } else {
            1
        };
        for _ in 0..passes {
            self.paint_pass(reason);
        }
        if reason == PaintReason::Initial {
            self.initial_paint_done = true;
        }
        debug!(?reason, passes, "widget painted");
    }

    fn paint_pass(&mut self, reason: PaintReason) {
        self.view.begin_composition_session();
        let bounds = self.view.rect();
        let mut context = PaintContext {
            view: &self.view,
            canvas: &mut self.canvas,
            bounds,
            reason,
        };
        self.widget.on_paint(&mut context, reason);
        self.canvas.send_frame();
        self.view.end_composition_session();
    }

    pub fn notify_detach(&self) {
        for observer in &self.observers {
            observer.on_widget_detach();
        }
        self.view.tree().notify_detached();
    }
}
