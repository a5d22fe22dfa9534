//! CPU tessellation of visual commands into triangle meshes.
//!
//! Geometry is produced in the target's local pixel space; the backend
//! converts to clip space when it writes vertex buffers. Solid brushes bake
//! their color into the vertices; textured paints carry normalized UVs
//! relative to the command's rect.

use smallvec::SmallVec;

use crate::canvas::{Border, Brush, VisualCommand};
use crate::geometry::{Color, Ellipse, Point, Rect, RoundedRect, VectorPath};

use super::surface::PaintSpec;

/// One interleaved vertex: local-space position, normalized UV, straight
/// RGBA color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

/// A triangle-list mesh ready for a vertex buffer.
#[derive(Debug, Default, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    /// True when the mesh is meant for the textured pipeline.
    pub textured: bool,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// One draw of a mesh with its paint source.
pub struct DrawOp {
    pub mesh: Mesh,
    pub paint: PaintSpec,
}

/// Minimum segment count of an ellipse fan.
const MIN_ELLIPSE_SEGMENTS: u32 = 96;
/// Per-corner arc segments of a rounded rect, before scale.
const CORNER_SEGMENTS: u32 = 8;

fn vertex(p: Point, uv: [f32; 2], color: Color) -> Vertex {
    Vertex {
        position: [p.x, p.y],
        uv,
        color: color.to_array(),
    }
}

fn rect_uv(rect: &Rect, p: Point) -> [f32; 2] {
    let w = rect.width.max(1.0);
    let h = rect.height.max(1.0);
    [
        ((p.x - rect.origin.x) / w).clamp(0.0, 1.0),
        ((p.y - rect.origin.y) / h).clamp(0.0, 1.0),
    ]
}

fn brush_vertex_color(brush: &Brush) -> Color {
    brush.solid_color().unwrap_or(Color::WHITE)
}

fn paint_for(brush: &Brush) -> PaintSpec {
    match brush {
        Brush::Solid(_) => PaintSpec::Solid,
        Brush::Image(texture) => PaintSpec::Texture {
            texture: texture.clone(),
            fence: None,
        },
        Brush::LinearGradient(gradient) | Brush::RadialGradient(gradient) => {
            PaintSpec::Gradient(gradient.clone())
        }
    }
}

/// Two triangles covering `rect`.
pub fn tessellate_quad(rect: &Rect, color: Color, textured: bool) -> Mesh {
    let Rect { origin, width, height } = *rect;
    let corners = [
        origin,
        Point::new(origin.x + width, origin.y),
        Point::new(origin.x + width, origin.y + height),
        Point::new(origin.x, origin.y + height),
    ];
    let uv = |p: Point| if textured { rect_uv(rect, p) } else { [0.0, 0.0] };
    let mut vertices = Vec::with_capacity(6);
    for &i in &[0usize, 1, 2, 0, 2, 3] {
        vertices.push(vertex(corners[i], uv(corners[i]), color));
    }
    Mesh { vertices, textured }
}

/// Center fan over a convex outline ring.
fn fan_from_outline(center: Point, outline: &[Point], bounds: &Rect, color: Color, textured: bool) -> Mesh {
    let mut vertices = Vec::with_capacity(outline.len() * 3);
    let uv = |p: Point| if textured { rect_uv(bounds, p) } else { [0.0, 0.0] };
    for i in 0..outline.len() {
        let a = outline[i];
        let b = outline[(i + 1) % outline.len()];
        vertices.push(vertex(center, uv(center), color));
        vertices.push(vertex(a, uv(a), color));
        vertices.push(vertex(b, uv(b), color));
    }
    Mesh { vertices, textured }
}

/// Quad strip along an outline ring, used for borders and path contours.
fn stroke_ring(points: &[Point], width: f32, closed: bool, color: Color) -> Mesh {
    let mut vertices = Vec::new();
    if points.len() < 2 || width <= 0.0 {
        return Mesh { vertices, textured: false };
    }
    let half = width * 0.5;
    let segment_count = if closed { points.len() } else { points.len() - 1 };
    for i in 0..segment_count {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let len = (dx * dx + dy * dy).sqrt();
        if len <= f32::EPSILON {
            continue;
        }
        let nx = -dy / len * half;
        let ny = dx / len * half;
        let quad = [
            Point::new(a.x + nx, a.y + ny),
            Point::new(b.x + nx, b.y + ny),
            Point::new(b.x - nx, b.y - ny),
            Point::new(a.x - nx, a.y - ny),
        ];
        for &i in &[0usize, 1, 2, 0, 2, 3] {
            vertices.push(vertex(quad[i], [0.0, 0.0], color));
        }
    }
    Mesh { vertices, textured: false }
}

fn rounded_rect_outline(rrect: &RoundedRect, scale: f32) -> Vec<Point> {
    let rect = rrect.rect;
    let rx = rrect.radius_x.clamp(0.0, rect.width * 0.5);
    let ry = rrect.radius_y.clamp(0.0, rect.height * 0.5);
    if rx <= 0.0 || ry <= 0.0 {
        return vec![
            rect.origin,
            Point::new(rect.origin.x + rect.width, rect.origin.y),
            Point::new(rect.origin.x + rect.width, rect.origin.y + rect.height),
            Point::new(rect.origin.x, rect.origin.y + rect.height),
        ];
    }
    let segments = (CORNER_SEGMENTS as f32 * scale.max(1.0)).ceil() as u32;
    let segments = segments.clamp(2, 32);
    // Corner centers in clockwise order starting top-left, with the angle
    // range each arc sweeps.
    let corners = [
        (
            Point::new(rect.origin.x + rx, rect.origin.y + ry),
            std::f32::consts::PI,
            1.5 * std::f32::consts::PI,
        ),
        (
            Point::new(rect.origin.x + rect.width - rx, rect.origin.y + ry),
            1.5 * std::f32::consts::PI,
            2.0 * std::f32::consts::PI,
        ),
        (
            Point::new(
                rect.origin.x + rect.width - rx,
                rect.origin.y + rect.height - ry,
            ),
            0.0,
            0.5 * std::f32::consts::PI,
        ),
        (
            Point::new(rect.origin.x + rx, rect.origin.y + rect.height - ry),
            0.5 * std::f32::consts::PI,
            std::f32::consts::PI,
        ),
    ];
    let mut outline = Vec::with_capacity((segments as usize + 1) * 4);
    for (center, start, end) in corners {
        for step in 0..=segments {
            let t = step as f32 / segments as f32;
            let angle = start + (end - start) * t;
            outline.push(Point::new(
                center.x + angle.cos() * rx,
                center.y + angle.sin() * ry,
            ));
        }
    }
    outline
}

fn ellipse_outline(ellipse: &Ellipse, scale: f32) -> Vec<Point> {
    let rx = ellipse.radius_x.max(0.0);
    let ry = ellipse.radius_y.max(0.0);
    if rx <= 0.0 || ry <= 0.0 {
        return Vec::new();
    }
    let segments = MIN_ELLIPSE_SEGMENTS.max((rx.max(ry) * scale.max(1.0)).ceil() as u32);
    let two_pi = 2.0 * std::f32::consts::PI;
    (0..segments)
        .map(|i| {
            let angle = two_pi * i as f32 / segments as f32;
            Point::new(
                ellipse.center.x + angle.cos() * rx,
                ellipse.center.y + angle.sin() * ry,
            )
        })
        .collect()
}

fn border_ops(outline: &[Point], border: &Option<Border>) -> Option<DrawOp> {
    let border = border.as_ref()?;
    if border.width <= 0.0 {
        return None;
    }
    let mesh = stroke_ring(outline, border.width, true, border.color);
    if mesh.is_empty() {
        return None;
    }
    Some(DrawOp {
        mesh,
        paint: PaintSpec::Solid,
    })
}

/// Tessellates one visual command into draw operations (fill first, then
/// border). Degenerate geometry yields no operations. `scale` is the
/// context's render scale, used for curve segment counts.
pub fn tessellate_visual(command: &VisualCommand, scale: f32) -> SmallVec<[DrawOp; 2]> {
    let mut ops = SmallVec::new();
    match command {
        VisualCommand::Rect { rect, brush, border } => {
            if rect.width <= 0.0 || rect.height <= 0.0 {
                return ops;
            }
            let paint = paint_for(brush);
            let mesh = tessellate_quad(rect, brush_vertex_color(brush), paint.is_textured());
            ops.push(DrawOp { mesh, paint });
            let outline = vec![
                rect.origin,
                Point::new(rect.origin.x + rect.width, rect.origin.y),
                Point::new(rect.origin.x + rect.width, rect.origin.y + rect.height),
                Point::new(rect.origin.x, rect.origin.y + rect.height),
            ];
            ops.extend(border_ops(&outline, border));
        }
        VisualCommand::RoundedRect { rect, brush, border } => {
            if rect.rect.width <= 0.0 || rect.rect.height <= 0.0 {
                return ops;
            }
            let outline = rounded_rect_outline(rect, scale);
            let paint = paint_for(brush);
            let center = Point::new(
                rect.rect.origin.x + rect.rect.width * 0.5,
                rect.rect.origin.y + rect.rect.height * 0.5,
            );
            let mesh = fan_from_outline(
                center,
                &outline,
                &rect.rect,
                brush_vertex_color(brush),
                paint.is_textured(),
            );
            ops.push(DrawOp { mesh, paint });
            ops.extend(border_ops(&outline, border));
        }
        VisualCommand::Ellipse { ellipse, brush, border } => {
            let outline = ellipse_outline(ellipse, scale);
            if outline.is_empty() {
                return ops;
            }
            let bounds = Rect::new(
                ellipse.center.x - ellipse.radius_x,
                ellipse.center.y - ellipse.radius_y,
                ellipse.radius_x * 2.0,
                ellipse.radius_y * 2.0,
            );
            let paint = paint_for(brush);
            let mesh = fan_from_outline(
                ellipse.center,
                &outline,
                &bounds,
                brush_vertex_color(brush),
                paint.is_textured(),
            );
            ops.push(DrawOp { mesh, paint });
            ops.extend(border_ops(&outline, border));
        }
        VisualCommand::VectorPath {
            path,
            brush,
            stroke_width,
            contour,
            fill,
        } => {
            if path.points.len() < 2 {
                return ops;
            }
            let color = brush_vertex_color(brush);
            if *fill {
                let fill_mesh = fill_path(path, color);
                if !fill_mesh.is_empty() {
                    ops.push(DrawOp {
                        mesh: fill_mesh,
                        paint: PaintSpec::Solid,
                    });
                }
            }
            let stroke = stroke_ring(&path.points, stroke_width.max(1.0), *contour, color);
            if !stroke.is_empty() {
                ops.push(DrawOp {
                    mesh: stroke,
                    paint: PaintSpec::Solid,
                });
            }
        }
        VisualCommand::Bitmap { rect, texture, fence } => {
            if rect.width <= 0.0 || rect.height <= 0.0 {
                return ops;
            }
            let mesh = tessellate_quad(rect, Color::WHITE, true);
            ops.push(DrawOp {
                mesh,
                paint: PaintSpec::Texture {
                    texture: texture.clone(),
                    fence: fence.clone(),
                },
            });
        }
        // Shaped text reaches the backend pre-rasterized as Bitmap commands.
        VisualCommand::Text { .. } => {}
    }
    ops
}

/// Convex fill: fan from the first point.
fn fill_path(path: &VectorPath, color: Color) -> Mesh {
    if path.points.len() < 3 {
        return Mesh::default();
    }
    let mut vertices = Vec::with_capacity((path.points.len() - 2) * 3);
    let anchor = path.points[0];
    for window in path.points[1..].windows(2) {
        vertices.push(vertex(anchor, [0.0, 0.0], color));
        vertices.push(vertex(window[0], [0.0, 0.0], color));
        vertices.push(vertex(window[1], [0.0, 0.0], color));
    }
    Mesh {
        vertices,
        textured: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_is_two_triangles_with_normalized_uvs() {
        let rect = Rect::new(10.0, 20.0, 100.0, 50.0);
        let mesh = tessellate_quad(&rect, Color::WHITE, true);
        assert_eq!(mesh.vertex_count(), 6);
        for v in &mesh.vertices {
            assert!((0.0..=1.0).contains(&v.uv[0]));
            assert!((0.0..=1.0).contains(&v.uv[1]));
        }
        // Top-left corner maps to uv (0,0); bottom-right to (1,1).
        assert_eq!(mesh.vertices[0].uv, [0.0, 0.0]);
        assert_eq!(mesh.vertices[2].uv, [1.0, 1.0]);
    }

    #[test]
    fn ellipse_fan_respects_minimum_segments() {
        let ellipse = Ellipse {
            center: Point::new(50.0, 50.0),
            radius_x: 10.0,
            radius_y: 10.0,
        };
        let ops = tessellate_visual(
            &VisualCommand::Ellipse {
                ellipse,
                brush: Brush::Solid(Color::BLACK),
                border: None,
            },
            1.0,
        );
        assert_eq!(ops.len(), 1);
        // A fan emits three vertices per outline segment.
        assert_eq!(ops[0].mesh.vertex_count(), MIN_ELLIPSE_SEGMENTS as usize * 3);
    }

    #[test]
    fn large_scaled_ellipse_grows_its_fan() {
        let ellipse = Ellipse {
            center: Point::ZERO,
            radius_x: 200.0,
            radius_y: 100.0,
        };
        let outline = ellipse_outline(&ellipse, 2.0);
        assert_eq!(outline.len(), 400);
    }

    #[test]
    fn degenerate_ellipse_yields_nothing() {
        let ops = tessellate_visual(
            &VisualCommand::Ellipse {
                ellipse: Ellipse {
                    center: Point::ZERO,
                    radius_x: 0.0,
                    radius_y: 10.0,
                },
                brush: Brush::Solid(Color::BLACK),
                border: None,
            },
            1.0,
        );
        assert!(ops.is_empty());
    }

    #[test]
    fn border_adds_a_second_solid_op() {
        let ops = tessellate_visual(
            &VisualCommand::Rect {
                rect: Rect::new(0.0, 0.0, 10.0, 10.0),
                brush: Brush::Solid(Color::WHITE),
                border: Some(Border {
                    color: Color::BLACK,
                    width: 2.0,
                }),
            },
            1.0,
        );
        assert_eq!(ops.len(), 2);
        assert!(!ops[1].mesh.is_empty());
        assert!(matches!(ops[1].paint, PaintSpec::Solid));
    }

    #[test]
    fn solid_color_rides_in_the_vertices() {
        let color = Color::new(0.2, 0.4, 0.6, 1.0);
        let ops = tessellate_visual(
            &VisualCommand::Rect {
                rect: Rect::new(0.0, 0.0, 4.0, 4.0),
                brush: Brush::Solid(color),
                border: None,
            },
            1.0,
        );
        assert!(ops[0].mesh.vertices.iter().all(|v| v.color == color.to_array()));
        assert!(!ops[0].mesh.textured);
    }
}
