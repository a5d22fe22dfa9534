//! Paint intent capture: brushes, visual commands, frames and the canvas.
//!
//! A [`Canvas`] is bound to exactly one layer. Draw calls append
//! [`VisualCommand`]s to the in-progress [`Frame`]; [`Canvas::send_frame`]
//! atomically swaps in a fresh frame and queues the finished one through the
//! canvas' compositor client with the current time and no deadline.
//!
//! Text, images and externally produced GPU textures enter as opaque
//! [`GpuTexture`] / [`GpuFence`] trait objects; the active backend downcasts
//! them to its own types. Font shaping and rasterization live behind the
//! [`FontEngine`] seam — the compositor only ever sees the resulting texture.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::debug;

use crate::client::{ClientProxy, CompositorClient};
use crate::geometry::{Color, Ellipse, Rect, RoundedRect, VectorPath};
use crate::layer::{LayerId, LayerTree};

/// An opaque GPU texture produced outside the compositor (rasterized text,
/// decoded images, video frames). Backends downcast to their own handle type.
pub trait GpuTexture: Any + Send + Sync {
    fn dimensions(&self) -> (u32, u32);
    fn as_any(&self) -> &dyn Any;
}

/// An opaque fence ordering a producer's GPU work before the compositor
/// samples the associated texture.
pub trait GpuFence: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A color stop of a gradient brush.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientStop {
    pub position: f32,
    pub color: Color,
}

/// Gradient description shared by the linear and radial brush variants.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    pub stops: Vec<GradientStop>,
}

/// Fill source for geometry commands.
#[derive(Clone)]
pub enum Brush {
    Solid(Color),
    LinearGradient(Gradient),
    RadialGradient(Gradient),
    Image(Arc<dyn GpuTexture>),
}

impl Brush {
    /// Solid brushes go through the color-vertex pipeline; everything else
    /// needs the textured pipeline.
    pub fn is_solid(&self) -> bool {
        matches!(self, Brush::Solid(_))
    }

    pub fn solid_color(&self) -> Option<Color> {
        match self {
            Brush::Solid(color) => Some(*color),
            _ => None,
        }
    }
}

/// Optional stroked border riding along a geometry command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Border {
    pub color: Color,
    pub width: f32,
}

/// Horizontal text anchoring passed through to the font engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TextAlignment {
    #[default]
    LeftUpper,
    Center,
    RightLower,
}

/// Wrapping mode passed through to the font engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TextWrapping {
    #[default]
    None,
    WrapByWord,
    WrapByCharacter,
}

/// Line/wrap request forwarded verbatim to the font engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TextLayoutDescriptor {
    pub alignment: TextAlignment,
    pub wrapping: TextWrapping,
}

/// Opaque font reference owned by the embedding toolkit.
pub type FontRef = Arc<dyn Any + Send + Sync>;

/// Opaque glyph run produced by the font engine.
pub type GlyphRunRef = Arc<dyn Any + Send + Sync>;

/// A shaped-and-rasterized text run: a texture plus its producer fence.
pub struct RasterizedText {
    pub texture: Arc<dyn GpuTexture>,
    pub fence: Option<Arc<dyn GpuFence>>,
}

/// External text producer. Shapes `text` with `font` into `rect` and
/// rasterizes the run to a GPU texture the compositor samples as a bitmap.
pub trait FontEngine: Send + Sync {
    fn rasterize(
        &self,
        text: &str,
        font: &FontRef,
        rect: &Rect,
        color: Color,
        layout: &TextLayoutDescriptor,
    ) -> Option<RasterizedText>;
}

/// One retained draw operation inside a frame.
pub enum VisualCommand {
    Rect {
        rect: Rect,
        brush: Brush,
        border: Option<Border>,
    },
    RoundedRect {
        rect: RoundedRect,
        brush: Brush,
        border: Option<Border>,
    },
    Ellipse {
        ellipse: Ellipse,
        brush: Brush,
        border: Option<Border>,
    },
    VectorPath {
        path: VectorPath,
        brush: Brush,
        stroke_width: f32,
        contour: bool,
        fill: bool,
    },
    Bitmap {
        rect: Rect,
        texture: Arc<dyn GpuTexture>,
        fence: Option<Arc<dyn GpuFence>>,
    },
    /// A glyph run kept client-side. Backends composite text through the
    /// pre-rasterized [`VisualCommand::Bitmap`] path and skip this variant.
    Text { rect: Rect, run: GlyphRunRef },
}

/// A post-geometry effect applied to the frame, in append order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CanvasEffect {
    GaussianBlur { radius: f32 },
    DirectionalBlur { radius: f32, angle: f32 },
}

/// Captured state of one `send_frame` call. Single-use: once queued, a frame
/// is never mutated again.
pub struct Frame {
    pub tree: Arc<LayerTree>,
    pub target_layer: LayerId,
    pub background: Color,
    pub visuals: SmallVec<[VisualCommand; 8]>,
    pub effects: SmallVec<[CanvasEffect; 2]>,
}

impl Frame {
    pub fn new(tree: Arc<LayerTree>, target_layer: LayerId) -> Self {
        Self {
            tree,
            target_layer,
            background: Color::TRANSPARENT,
            visuals: SmallVec::new(),
            effects: SmallVec::new(),
        }
    }

    /// A frame with no commands, no effects and a fully transparent
    /// background does no work; the backend drops it without clearing or
    /// presenting so the last visible frame survives spurious paints.
    pub fn is_no_op(&self) -> bool {
        self.visuals.is_empty()
            && self.effects.is_empty()
            && self.background.is_fully_transparent()
    }
}

/// Per-layer draw recorder.
pub struct Canvas {
    client: CompositorClient,
    tree: Arc<LayerTree>,
    layer: LayerId,
    font_engine: Option<Arc<dyn FontEngine>>,
    current: Frame,
}

impl Canvas {
    pub fn new(proxy: Arc<ClientProxy>, tree: Arc<LayerTree>, layer: LayerId) -> Self {
        let current = Frame::new(tree.clone(), layer);
        Self {
            client: CompositorClient::new(proxy),
            tree,
            layer,
            font_engine: None,
            current,
        }
    }

    pub fn with_font_engine(mut self, engine: Arc<dyn FontEngine>) -> Self {
        self.font_engine = Some(engine);
        self
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    /// Frame-scoped background; defaults to fully transparent.
    pub fn set_background(&mut self, color: Color) {
        self.current.background = color;
    }

    pub fn draw_rect(&mut self, rect: Rect, brush: Brush, border: Option<Border>) {
        self.current.visuals.push(VisualCommand::Rect { rect, brush, border });
    }

    pub fn draw_rounded_rect(&mut self, rect: RoundedRect, brush: Brush, border: Option<Border>) {
        self.current
            .visuals
            .push(VisualCommand::RoundedRect { rect, brush, border });
    }

    pub fn draw_ellipse(&mut self, ellipse: Ellipse, brush: Brush, border: Option<Border>) {
        self.current
            .visuals
            .push(VisualCommand::Ellipse { ellipse, brush, border });
    }

    pub fn draw_path(&mut self, path: VectorPath, brush: Brush, stroke_width: f32, fill: bool) {
        if path.points.len() < 2 {
            return;
        }
        let contour = path.closed;
        self.current.visuals.push(VisualCommand::VectorPath {
            path,
            brush,
            stroke_width,
            contour,
            fill,
        });
    }

    /// Shapes and rasterizes `text` through the font engine, then records the
    /// result as a bitmap command. Degenerate input is a silent no-op.
    pub fn draw_text(
        &mut self,
        text: &str,
        font: &FontRef,
        rect: Rect,
        color: Color,
        layout: TextLayoutDescriptor,
    ) {
        if text.is_empty() || rect.width <= 0.0 || rect.height <= 0.0 {
            return;
        }
        let Some(engine) = self.font_engine.clone() else {
            debug!("draw_text without a font engine; ignoring");
            return;
        };
        let Some(rasterized) = engine.rasterize(text, font, &rect, color, &layout) else {
            return;
        };
        self.draw_texture(rasterized.texture, rect, rasterized.fence);
    }

    pub fn draw_image(&mut self, texture: Arc<dyn GpuTexture>, rect: Rect) {
        self.draw_texture(texture, rect, None);
    }

    /// Records an externally produced GPU texture, honoring its fence.
    pub fn draw_texture(
        &mut self,
        texture: Arc<dyn GpuTexture>,
        rect: Rect,
        fence: Option<Arc<dyn GpuFence>>,
    ) {
        self.current
            .visuals
            .push(VisualCommand::Bitmap { rect, texture, fence });
    }

    /// Appends a post-geometry effect, applied after all visuals in order.
    pub fn apply_effect(&mut self, effect: CanvasEffect) {
        self.current.effects.push(effect);
    }

    /// Detaches the in-progress frame, replacing it with a fresh one.
    pub fn next_frame(&mut self) -> Frame {
        std::mem::replace(&mut self.current, Frame::new(self.tree.clone(), self.layer))
    }

    /// Queues the in-progress frame with `now()` as timestamp and no
    /// deadline, then starts a fresh frame.
    pub fn send_frame(&mut self) {
        let frame = self.next_frame();
        self.client.push_frame(frame, Instant::now());
    }

    /// Queues the in-progress frame with an explicit deadline.
    pub fn send_frame_by(&mut self, deadline: Instant) {
        let frame = self.next_frame();
        self.client.push_timed_frame(frame, Instant::now(), deadline);
    }

    pub fn client(&self) -> &CompositorClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut CompositorClient {
        &mut self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    #[test]
    fn no_op_frame_detection() {
        let tree = Arc::new(LayerTree::new());
        let limb = tree.create_limb(Rect::UNIT);
        let layer = tree.limb_root_layer(limb).unwrap();

        let mut frame = Frame::new(tree.clone(), layer);
        assert!(frame.is_no_op());

        frame.background = Color::new(0.0, 0.0, 0.0, 0.01);
        assert!(!frame.is_no_op());

        let mut frame = Frame::new(tree, layer);
        frame.visuals.push(VisualCommand::Rect {
            rect: Rect::UNIT,
            brush: Brush::Solid(Color::WHITE),
            border: None,
        });
        assert!(!frame.is_no_op());
    }

    #[test]
    fn degenerate_paths_are_dropped_at_record_time() {
        let tree = Arc::new(LayerTree::new());
        let limb = tree.create_limb(Rect::UNIT);
        let layer = tree.limb_root_layer(limb).unwrap();
        let proxy = Arc::new(ClientProxy::new_detached());
        let mut canvas = Canvas::new(proxy, tree, layer);

        canvas.draw_path(
            VectorPath::new(vec![Point::ZERO], false),
            Brush::Solid(Color::WHITE),
            1.0,
            false,
        );
        assert!(canvas.current.visuals.is_empty());

        canvas.draw_path(
            VectorPath::new(vec![Point::ZERO, Point::new(10.0, 10.0)], false),
            Brush::Solid(Color::WHITE),
            1.0,
            false,
        );
        assert_eq!(canvas.current.visuals.len(), 1);
    }
}
