//! Visual-tree arena: the backend mirror of a layer tree.
//!
//! A `Visual` owns its platform surface (through its render-target context)
//! and its placement in the parent. The tree keeps one root visual plus a
//! body of child visuals, mirroring limb root layers and child layers.

use slotmap::{SlotMap, new_key_type};

use crate::geometry::{Point, Rect};

use super::context::RenderTargetContext;
use super::surface::BackendError;

new_key_type! {
    /// Handle of a visual inside its tree's arena.
    pub struct VisualId;
}

/// One composited node: a surface context plus its placement.
pub struct Visual {
    pub context: RenderTargetContext,
    pub position: Point,
}

impl Visual {
    pub fn new(context: RenderTargetContext, position: Point) -> Self {
        Self { context, position }
    }

    /// Resizes the visual's surface and moves it to the rect origin.
    /// Surface positions are expressed in backing pixels.
    pub fn resize(&mut self, rect: Rect) -> Result<(), BackendError> {
        self.context.set_size(rect)?;
        self.position = rect.origin;
        let scale = self.context.render_scale();
        self.context
            .surface_mut()
            .set_position(Point::new(rect.origin.x * scale, rect.origin.y * scale));
        Ok(())
    }
}

/// Backend mirror of one layer tree, rooted at one render target.
#[derive(Default)]
pub struct VisualTree {
    visuals: SlotMap<VisualId, Visual>,
    root: Option<VisualId>,
    body: Vec<VisualId>,
}

impl VisualTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, visual: Visual) -> VisualId {
        self.visuals.insert(visual)
    }

    pub fn set_root(&mut self, id: VisualId) {
        self.root = Some(id);
    }

    pub fn root(&self) -> Option<VisualId> {
        self.root
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    /// Registers a child visual under the root.
    pub fn add_body(&mut self, id: VisualId) {
        self.body.push(id);
    }

    pub fn body(&self) -> &[VisualId] {
        &self.body
    }

    pub fn get(&self, id: VisualId) -> Option<&Visual> {
        self.visuals.get(id)
    }

    pub fn get_mut(&mut self, id: VisualId) -> Option<&mut Visual> {
        self.visuals.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.visuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visuals.is_empty()
    }
}
