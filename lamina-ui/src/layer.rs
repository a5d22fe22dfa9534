//! Retained scene graph: layer trees, limbs and layers.
//!
//! A [`LayerTree`] owns per-view subtrees called [`Limb`]s; each limb owns a
//! set of [`Layer`]s rooted at one root layer. Widgets hold their tree, views
//! hold a limb, canvases draw into a layer. All nodes live in slotmap arenas
//! and reference each other through handles, so the widget ↔ tree ↔ limb ↔
//! layer cycle never turns into owning links.
//!
//! Trees are shared across threads (`Arc<LayerTree>`): widget code mutates
//! them from paint callbacks while the scheduler thread applies layer resize
//! commands. All access goes through the tree's internal lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use slotmap::{SlotMap, new_key_type};
use thiserror::Error;
use tracing::debug;

use crate::geometry::{Color, Rect, sanitize_rect};

new_key_type! {
    /// Handle of a [`Layer`] inside its tree's arena.
    pub struct LayerId;
    /// Handle of a [`Limb`] inside its tree's arena.
    pub struct LimbId;
}

/// Errors from structural layer-tree operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// The referenced parent limb belongs to a different tree or is gone.
    #[error("invalid parent limb for this tree")]
    InvalidParent,
    /// The layer handle does not resolve in this tree.
    #[error("unknown layer handle")]
    UnknownLayer,
    /// The limb handle does not resolve in this tree.
    #[error("unknown limb handle")]
    UnknownLimb,
}

/// Drop-shadow parameters applied to a layer's backing visual.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DropShadowParams {
    pub x_offset: f32,
    pub y_offset: f32,
    pub radius: f32,
    pub blur: f32,
    pub opacity: f32,
    pub color: Color,
}

/// Euler rotation in radians.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Rotation {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

/// Affine transformation parameters, composed by the backend as
/// `T · Rz · Ry · Rx · S`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformationParams {
    pub translate: [f32; 3],
    pub rotate: Rotation,
    pub scale: [f32; 3],
}

impl Default for TransformationParams {
    fn default() -> Self {
        Self {
            translate: [0.0; 3],
            rotate: Rotation::default(),
            scale: [1.0; 3],
        }
    }
}

/// A visual effect applied to a layer as a whole.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerEffect {
    DropShadow(DropShadowParams),
    Transformation(TransformationParams),
}

/// Observer of layer-tree mutations. All callbacks run under the tree lock
/// on the mutating thread; implementations must not call back into the tree.
pub trait LayerTreeObserver: Send + Sync {
    fn on_layer_rect_changed(&self, _layer: LayerId, _old: &Rect, _new: &Rect) {}
    fn on_layer_visibility_changed(&self, _layer: LayerId, _visible: bool) {}
    fn on_tree_detached(&self) {}
}

#[derive(Debug)]
struct Layer {
    rect: Rect,
    visible: bool,
    shadow: Option<DropShadowParams>,
    transform: Option<TransformationParams>,
    limb: LimbId,
}

#[derive(Debug)]
struct Limb {
    root_layer: LayerId,
    layers: Vec<LayerId>,
    parent: Option<LimbId>,
    children: Vec<LimbId>,
}

struct TreeState {
    layers: SlotMap<LayerId, Layer>,
    limbs: SlotMap<LimbId, Limb>,
    root_limb: Option<LimbId>,
    observers: Vec<Arc<dyn LayerTreeObserver>>,
}

/// A retained scene graph owned by one widget.
pub struct LayerTree {
    id: u64,
    state: RwLock<TreeState>,
}

static TREE_ID_SEED: AtomicU64 = AtomicU64::new(1);

impl Default for LayerTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerTree {
    pub fn new() -> Self {
        Self {
            id: TREE_ID_SEED.fetch_add(1, Ordering::Relaxed),
            state: RwLock::new(TreeState {
                layers: SlotMap::with_key(),
                limbs: SlotMap::with_key(),
                root_limb: None,
                observers: Vec::new(),
            }),
        }
    }

    /// Stable identity of this tree, used to reject cross-tree reparents.
    pub fn tree_id(&self) -> u64 {
        self.id
    }

    /// Creates a limb with a fresh root layer covering `rect`.
    pub fn create_limb(&self, rect: Rect) -> LimbId {
        let mut state = self.state.write();
        let sane = sanitize_rect(&rect, &Rect::UNIT, 1.0);
        let limb = state.limbs.insert(Limb {
            root_layer: LayerId::default(),
            layers: Vec::new(),
            parent: None,
            children: Vec::new(),
        });
        let root_layer = state.layers.insert(Layer {
            rect: sane,
            visible: true,
            shadow: None,
            transform: None,
            limb,
        });
        let limb_node = &mut state.limbs[limb];
        limb_node.root_layer = root_layer;
        limb_node.layers.push(root_layer);
        limb
    }

    /// Marks `limb` as the root limb of the tree.
    pub fn set_root_limb(&self, limb: LimbId) -> Result<(), TreeError> {
        let mut state = self.state.write();
        if !state.limbs.contains_key(limb) {
            return Err(TreeError::UnknownLimb);
        }
        state.root_limb = Some(limb);
        Ok(())
    }

    pub fn root_limb(&self) -> Option<LimbId> {
        self.state.read().root_limb
    }

    /// Attaches `limb` under `parent`. Both handles must resolve in this
    /// tree; a handle minted by another tree fails with
    /// [`TreeError::InvalidParent`].
    pub fn add_child_limb(&self, limb: LimbId, parent: LimbId) -> Result<(), TreeError> {
        let mut state = self.state.write();
        if !state.limbs.contains_key(parent) {
            return Err(TreeError::InvalidParent);
        }
        if !state.limbs.contains_key(limb) {
            return Err(TreeError::InvalidParent);
        }
        if let Some(old_parent) = state.limbs[limb].parent {
            let old = &mut state.limbs[old_parent];
            old.children.retain(|c| *c != limb);
        }
        state.limbs[limb].parent = Some(parent);
        state.limbs[parent].children.push(limb);
        Ok(())
    }

    /// Creates a child layer inside `limb`.
    pub fn make_layer(&self, limb: LimbId, rect: Rect) -> Result<LayerId, TreeError> {
        let mut state = self.state.write();
        if !state.limbs.contains_key(limb) {
            return Err(TreeError::UnknownLimb);
        }
        let sane = sanitize_rect(&rect, &Rect::UNIT, 1.0);
        let layer = state.layers.insert(Layer {
            rect: sane,
            visible: true,
            shadow: None,
            transform: None,
            limb,
        });
        state.limbs[limb].layers.push(layer);
        Ok(layer)
    }

    pub fn layer_rect(&self, layer: LayerId) -> Result<Rect, TreeError> {
        self.state
            .read()
            .layers
            .get(layer)
            .map(|l| l.rect)
            .ok_or(TreeError::UnknownLayer)
    }

    pub fn limb_of(&self, layer: LayerId) -> Result<LimbId, TreeError> {
        self.state
            .read()
            .layers
            .get(layer)
            .map(|l| l.limb)
            .ok_or(TreeError::UnknownLayer)
    }

    pub fn limb_root_layer(&self, limb: LimbId) -> Result<LayerId, TreeError> {
        self.state
            .read()
            .limbs
            .get(limb)
            .map(|l| l.root_layer)
            .ok_or(TreeError::UnknownLimb)
    }

    /// Whether `layer` is a child layer (not the root layer of its limb).
    pub fn is_child_layer(&self, layer: LayerId) -> Result<bool, TreeError> {
        let state = self.state.read();
        let node = state.layers.get(layer).ok_or(TreeError::UnknownLayer)?;
        let limb = state.limbs.get(node.limb).ok_or(TreeError::UnknownLimb)?;
        Ok(limb.root_layer != layer)
    }

    /// Resizes `layer` to the sanitized `rect`. Children keep their own
    /// rects; a parent resize never reshapes or reparents them.
    pub fn resize_layer(&self, layer: LayerId, rect: Rect) -> Result<Rect, TreeError> {
        let mut state = self.state.write();
        let node = state.layers.get(layer).ok_or(TreeError::UnknownLayer)?;
        let old = node.rect;
        let sane = sanitize_rect(&rect, &old, 1.0);
        if old.approx_eq(&sane) {
            return Ok(old);
        }
        state.layers[layer].rect = sane;
        debug!(layer = ?layer, ?old, new = ?sane, "layer resized");
        for observer in &state.observers {
            observer.on_layer_rect_changed(layer, &old, &sane);
        }
        Ok(sane)
    }

    pub fn set_layer_visible(&self, layer: LayerId, visible: bool) -> Result<(), TreeError> {
        let mut state = self.state.write();
        let node = state.layers.get_mut(layer).ok_or(TreeError::UnknownLayer)?;
        if node.visible == visible {
            return Ok(());
        }
        node.visible = visible;
        for observer in &state.observers {
            observer.on_layer_visibility_changed(layer, visible);
        }
        Ok(())
    }

    pub fn layer_visible(&self, layer: LayerId) -> Result<bool, TreeError> {
        self.state
            .read()
            .layers
            .get(layer)
            .map(|l| l.visible)
            .ok_or(TreeError::UnknownLayer)
    }

    /// Stores the effect on the layer and returns it for command dispatch.
    pub fn set_layer_effect(&self, layer: LayerId, effect: LayerEffect) -> Result<(), TreeError> {
        let mut state = self.state.write();
        let node = state.layers.get_mut(layer).ok_or(TreeError::UnknownLayer)?;
        match effect {
            LayerEffect::DropShadow(params) => node.shadow = Some(params),
            LayerEffect::Transformation(params) => node.transform = Some(params),
        }
        Ok(())
    }

    pub fn layer_shadow(&self, layer: LayerId) -> Result<Option<DropShadowParams>, TreeError> {
        self.state
            .read()
            .layers
            .get(layer)
            .map(|l| l.shadow)
            .ok_or(TreeError::UnknownLayer)
    }

    pub fn layer_transform(
        &self,
        layer: LayerId,
    ) -> Result<Option<TransformationParams>, TreeError> {
        self.state
            .read()
            .layers
            .get(layer)
            .map(|l| l.transform)
            .ok_or(TreeError::UnknownLayer)
    }

    /// The layers of `limb`, root layer first.
    pub fn limb_layers(&self, limb: LimbId) -> Result<Vec<LayerId>, TreeError> {
        self.state
            .read()
            .limbs
            .get(limb)
            .map(|l| l.layers.clone())
            .ok_or(TreeError::UnknownLimb)
    }

    /// The limbs attached under `limb`.
    pub fn child_limbs(&self, limb: LimbId) -> Result<Vec<LimbId>, TreeError> {
        self.state
            .read()
            .limbs
            .get(limb)
            .map(|l| l.children.clone())
            .ok_or(TreeError::UnknownLimb)
    }

    pub fn add_observer(&self, observer: Arc<dyn LayerTreeObserver>) {
        self.state.write().observers.push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn LayerTreeObserver>) {
        self.state
            .write()
            .observers
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Notifies observers that the owning widget left its widget tree.
    pub fn notify_detached(&self) {
        let state = self.state.read();
        for observer in &state.observers {
            observer.on_tree_detached();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingObserver {
        rect_changes: AtomicUsize,
        visibility_changes: AtomicUsize,
        detaches: AtomicUsize,
    }

    impl LayerTreeObserver for CountingObserver {
        fn on_layer_rect_changed(&self, _layer: LayerId, _old: &Rect, _new: &Rect) {
            self.rect_changes.fetch_add(1, Ordering::Relaxed);
        }
        fn on_layer_visibility_changed(&self, _layer: LayerId, _visible: bool) {
            self.visibility_changes.fetch_add(1, Ordering::Relaxed);
        }
        fn on_tree_detached(&self) {
            self.detaches.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn limb_root_layer_is_not_a_child_layer() {
        let tree = LayerTree::new();
        let limb = tree.create_limb(Rect::new(0.0, 0.0, 200.0, 100.0));
        let root = tree.limb_root_layer(limb).unwrap();
        assert!(!tree.is_child_layer(root).unwrap());
        let child = tree.make_layer(limb, Rect::new(10.0, 10.0, 50.0, 50.0)).unwrap();
        assert!(tree.is_child_layer(child).unwrap());
        assert_eq!(tree.limb_of(child).unwrap(), limb);
        assert_eq!(tree.limb_layers(limb).unwrap(), vec![root, child]);
    }

    #[test]
    fn layer_effects_are_retained() {
        let tree = LayerTree::new();
        let limb = tree.create_limb(Rect::UNIT);
        let root = tree.limb_root_layer(limb).unwrap();
        tree.set_layer_effect(
            root,
            LayerEffect::DropShadow(DropShadowParams {
                radius: 3.0,
                ..Default::default()
            }),
        )
        .unwrap();
        tree.set_layer_effect(root, LayerEffect::Transformation(TransformationParams::default()))
            .unwrap();
        assert_eq!(tree.layer_shadow(root).unwrap().unwrap().radius, 3.0);
        assert!(tree.layer_transform(root).unwrap().is_some());
    }

    #[test]
    fn cross_tree_reparent_is_rejected() {
        let a = LayerTree::new();
        let b = LayerTree::new();
        let limb_a = a.create_limb(Rect::UNIT);
        let limb_b = b.create_limb(Rect::UNIT);
        // Handles from `b` do not resolve in `a`.
        assert_eq!(a.add_child_limb(limb_b, limb_a), Err(TreeError::InvalidParent));

        // Same-tree attachment works and is observable.
        let child_limb = a.create_limb(Rect::UNIT);
        a.add_child_limb(child_limb, limb_a).unwrap();
        assert_eq!(a.child_limbs(limb_a).unwrap(), vec![child_limb]);
    }

    #[test]
    fn resize_sanitizes_and_dedups() {
        let tree = LayerTree::new();
        let limb = tree.create_limb(Rect::new(0.0, 0.0, 100.0, 100.0));
        let root = tree.limb_root_layer(limb).unwrap();
        let observer = Arc::new(CountingObserver::default());
        tree.add_observer(observer.clone());

        let got = tree.resize_layer(root, Rect::new(0.0, 0.0, 250.0, 150.0)).unwrap();
        assert_eq!(got, Rect::new(0.0, 0.0, 250.0, 150.0));
        assert_eq!(observer.rect_changes.load(Ordering::Relaxed), 1);

        // Identical resize produces no notification.
        tree.resize_layer(root, Rect::new(0.0, 0.0, 250.0, 150.0)).unwrap();
        assert_eq!(observer.rect_changes.load(Ordering::Relaxed), 1);

        // Degenerate extents fall back to the last stable rect.
        let got = tree.resize_layer(root, Rect::new(0.0, 0.0, -5.0, f32::NAN)).unwrap();
        assert_eq!(got, Rect::new(0.0, 0.0, 250.0, 150.0));
    }

    #[test]
    fn parent_resize_leaves_children_untouched() {
        let tree = LayerTree::new();
        let limb = tree.create_limb(Rect::new(0.0, 0.0, 100.0, 100.0));
        let root = tree.limb_root_layer(limb).unwrap();
        let child_rect = Rect::new(5.0, 5.0, 20.0, 20.0);
        let child = tree.make_layer(limb, child_rect).unwrap();
        tree.resize_layer(root, Rect::new(0.0, 0.0, 400.0, 400.0)).unwrap();
        assert_eq!(tree.layer_rect(child).unwrap(), child_rect);
        assert_eq!(tree.limb_of(child).unwrap(), limb);
    }

    #[test]
    fn observers_see_visibility_and_detach() {
        let tree = LayerTree::new();
        let limb = tree.create_limb(Rect::UNIT);
        let root = tree.limb_root_layer(limb).unwrap();
        let observer = Arc::new(CountingObserver::default());
        tree.add_observer(observer.clone());
        tree.set_layer_visible(root, false).unwrap();
        tree.set_layer_visible(root, false).unwrap();
        tree.notify_detached();
        assert_eq!(observer.visibility_changes.load(Ordering::Relaxed), 1);
        assert_eq!(observer.detaches.load(Ordering::Relaxed), 1);
    }
}
