//! Views: the bridge between a widget's layer tree and its render target.
//!
//! A view owns one render target (wrapping the opaque native surface), the
//! proxy that talks to the compositor, and one limb of the widget's layer
//! tree. Subviews attach under a parent view and immediately inherit its
//! compositor frontend and sync lane.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::animation::ViewAnimator;
use crate::canvas::Canvas;
use crate::client::{ClientProxy, CommandFrontend, NativeSurfaceHandle, ViewRenderTarget};
use crate::geometry::{Rect, sanitize_rect};
use crate::layer::{LayerId, LayerTree, LimbId, TreeError};
use crate::telemetry::TelemetryState;

/// One composition surface of a widget.
pub struct View {
    render_target: Arc<ViewRenderTarget>,
    proxy: Arc<ClientProxy>,
    tree: Arc<LayerTree>,
    limb: LimbId,
    rect: Mutex<Rect>,
    subviews: Mutex<Vec<Arc<View>>>,
}

impl View {
    /// Creates a root view over `native`, owning the root limb of `tree`.
    pub fn new_root(native: NativeSurfaceHandle, rect: Rect, tree: Arc<LayerTree>) -> Arc<Self> {
        let rect = sanitize_rect(&rect, &Rect::UNIT, 1.0);
        let render_target = Arc::new(ViewRenderTarget::new(native));
        let proxy = Arc::new(ClientProxy::new(render_target.clone()));
        let limb = tree.create_limb(rect);
        let _ = tree.set_root_limb(limb);
        Arc::new(Self {
            render_target,
            proxy,
            tree,
            limb,
            rect: Mutex::new(rect),
            subviews: Mutex::new(Vec::new()),
        })
    }

    /// Creates a subview attached under `parent`, inheriting its compositor
    /// wiring.
    pub fn new_child(
        native: NativeSurfaceHandle,
        rect: Rect,
        parent: &Arc<View>,
    ) -> Result<Arc<Self>, TreeError> {
        let rect = sanitize_rect(&rect, &Rect::UNIT, 1.0);
        let tree = parent.tree.clone();
        let render_target = Arc::new(ViewRenderTarget::new(native));
        let proxy = Arc::new(ClientProxy::new(render_target.clone()));
        let limb = tree.create_limb(rect);
        tree.add_child_limb(limb, parent.limb)?;
        let view = Arc::new(Self {
            render_target,
            proxy,
            tree,
            limb,
            rect: Mutex::new(rect),
            subviews: Mutex::new(Vec::new()),
        });
        parent.add_subview(view.clone());
        Ok(view)
    }

    /// Attaches `child` to this view's subview list. Newly attached
    /// subviews inherit the compositor frontend and sync lane immediately.
    pub fn add_subview(&self, child: Arc<View>) {
        child.set_frontend_recurse(self.proxy.frontend());
        child.set_sync_lane_recurse(self.proxy.sync_lane_id());
        self.subviews.lock().push(child);
    }

    /// Propagates the compositor frontend down the subview hierarchy.
    pub fn set_frontend_recurse(&self, frontend: Option<Arc<dyn CommandFrontend>>) {
        self.proxy.set_frontend(frontend.clone());
        for subview in self.subviews.lock().iter() {
            subview.set_frontend_recurse(frontend.clone());
        }
    }

    /// Propagates the sync lane down the subview hierarchy.
    pub fn set_sync_lane_recurse(&self, lane_id: u64) {
        self.proxy.set_sync_lane_id(lane_id);
        for subview in self.subviews.lock().iter() {
            subview.set_sync_lane_recurse(lane_id);
        }
    }

    pub fn rect(&self) -> Rect {
        *self.rect.lock()
    }

    /// Resizes the view, its limb root layer included. Returns false when
    /// the sanitized rect equals the current one (dedup by equality).
    pub fn resize(&self, new_rect: Rect) -> bool {
        let mut rect = self.rect.lock();
        let sane = sanitize_rect(&new_rect, &rect, 1.0);
        if rect.approx_eq(&sane) {
            return false;
        }
        *rect = sane;
        drop(rect);
        if let Ok(root) = self.tree.limb_root_layer(self.limb) {
            let _ = self.tree.resize_layer(root, sane);
        }
        true
    }

    pub fn render_target(&self) -> &Arc<ViewRenderTarget> {
        &self.render_target
    }

    pub fn proxy(&self) -> &Arc<ClientProxy> {
        &self.proxy
    }

    pub fn tree(&self) -> &Arc<LayerTree> {
        &self.tree
    }

    pub fn limb(&self) -> LimbId {
        self.limb
    }

    pub fn root_layer(&self) -> LayerId {
        self.tree
            .limb_root_layer(self.limb)
            .expect("view limb always has a root layer")
    }

    /// Creates a child layer of this view's limb.
    pub fn make_layer(&self, rect: Rect) -> LayerId {
        self.tree
            .make_layer(self.limb, rect)
            .expect("view limb always resolves")
    }

    /// A canvas bound to one of this view's layers.
    pub fn make_canvas(&self, layer: LayerId) -> Canvas {
        Canvas::new(self.proxy.clone(), self.tree.clone(), layer)
    }

    /// Opens a recording session on this view's proxy. If the proxy has no
    /// frontend yet, it inherits the parent's (together with its lane).
    pub fn begin_composition_session(&self) {
        self.proxy.begin_record();
    }

    pub fn end_composition_session(&self) {
        self.proxy.end_record();
    }

    /// An animation driver for this view.
    pub fn animator(&self, telemetry: Arc<TelemetryState>) -> ViewAnimator {
        ViewAnimator::new(self.proxy.clone(), self.tree.clone(), telemetry)
    }
}
