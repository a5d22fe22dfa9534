//! Geometry and color primitives for the compositor.
//!
//! All compositor geometry is expressed in logical (pre-scale) `f32`
//! coordinates with the origin at the top-left corner, x growing right and
//! y growing down. Backing-store dimensions are derived from logical rects
//! by the render-target contexts in [`crate::backend`].
//!
//! The sanitization helpers in this module are shared by the view layer and
//! the backend: hostile or degenerate rects (NaN/infinite coordinates,
//! non-positive extents, absurd aspect ratios) never reach GPU resource
//! creation.

/// Largest texture dimension any backend is asked to allocate.
pub const MAX_TEXTURE_DIMENSION: f32 = 16384.0;

/// A 2D point in logical coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle: origin plus extent.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Rect {
    pub origin: Point,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            origin: Point::new(x, y),
            width,
            height,
        }
    }

    /// The unit rect used as the fallback of last resort by sanitizers.
    pub const UNIT: Self = Self::new(0.0, 0.0, 1.0, 1.0);

    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.origin.x + dx, self.origin.y + dy, self.width, self.height)
    }

    /// Applies a signed delta to every component.
    pub fn offset_by(&self, dx: f32, dy: f32, dw: f32, dh: f32) -> Self {
        Self::new(
            self.origin.x + dx,
            self.origin.y + dy,
            self.width + dw,
            self.height + dh,
        )
    }

    /// Component-wise equality within `epsilon`, used to dedup resizes.
    pub fn approx_eq(&self, other: &Rect) -> bool {
        const EPSILON: f32 = 1e-3;
        (self.origin.x - other.origin.x).abs() <= EPSILON
            && (self.origin.y - other.origin.y).abs() <= EPSILON
            && (self.width - other.width).abs() <= EPSILON
            && (self.height - other.height).abs() <= EPSILON
    }
}

/// A rectangle with per-axis corner radii.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RoundedRect {
    pub rect: Rect,
    pub radius_x: f32,
    pub radius_y: f32,
}

/// An ellipse: center plus radii.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub center: Point,
    pub radius_x: f32,
    pub radius_y: f32,
}

/// A straight-line vector path in logical coordinates.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VectorPath {
    pub points: Vec<Point>,
    pub closed: bool,
}

impl VectorPath {
    pub fn new(points: Vec<Point>, closed: bool) -> Self {
        Self { points, closed }
    }
}

/// A straight-alpha RGBA color with components in `[0, 1]`.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// True for the fully transparent black that marks a no-op frame
    /// background.
    pub fn is_fully_transparent(&self) -> bool {
        self.r == 0.0 && self.g == 0.0 && self.b == 0.0 && self.a == 0.0
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn sane_coordinate(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value } else { fallback }
}

/// A `(width, height)` pair that no plausible resize would produce: either
/// an extreme aspect ratio or a near-degenerate strip at close to the
/// texture clamp. Such pairs show up when uninitialized native rects leak
/// through during window construction.
pub fn is_suspicious_dimension_pair(w: f32, h: f32) -> bool {
    if !w.is_finite() || !h.is_finite() || w <= 0.0 || h <= 0.0 {
        return true;
    }
    let max_dim = w.max(h);
    let min_dim = w.min(h);
    if max_dim >= MAX_TEXTURE_DIMENSION * 0.5 && min_dim <= 2.0 {
        return true;
    }
    max_dim / min_dim > 256.0
}

/// Sanitizes `candidate` against `fallback` under a render scale.
///
/// Rules, applied in order: non-finite coordinates are replaced component-wise
/// from the fallback; non-positive or non-finite extents are replaced from
/// the fallback; extents are clamped so `extent * scale` stays within
/// `[1, MAX_TEXTURE_DIMENSION]`; finally a suspicious width/height pair is
/// replaced wholesale by the fallback extents. The fallback itself is
/// sanitized first (against [`Rect::UNIT`]) so a corrupt last-stable rect
/// cannot propagate.
pub fn sanitize_rect(candidate: &Rect, fallback: &Rect, scale: f32) -> Rect {
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    let max_logical = (MAX_TEXTURE_DIMENSION / scale).max(1.0);

    let mut sane_fallback = *fallback;
    sane_fallback.origin.x = sane_coordinate(sane_fallback.origin.x, 0.0);
    sane_fallback.origin.y = sane_coordinate(sane_fallback.origin.y, 0.0);
    if !sane_fallback.width.is_finite() || sane_fallback.width <= 0.0 {
        sane_fallback.width = 1.0;
    }
    if !sane_fallback.height.is_finite() || sane_fallback.height <= 0.0 {
        sane_fallback.height = 1.0;
    }
    sane_fallback.width = sane_fallback.width.clamp(1.0, max_logical);
    sane_fallback.height = sane_fallback.height.clamp(1.0, max_logical);
    if is_suspicious_dimension_pair(sane_fallback.width, sane_fallback.height) {
        sane_fallback.width = 1.0;
        sane_fallback.height = 1.0;
    }

    let mut sanitized = *candidate;
    sanitized.origin.x = sane_coordinate(sanitized.origin.x, sane_fallback.origin.x);
    sanitized.origin.y = sane_coordinate(sanitized.origin.y, sane_fallback.origin.y);
    if !sanitized.width.is_finite() || sanitized.width <= 0.0 {
        sanitized.width = sane_fallback.width;
    }
    if !sanitized.height.is_finite() || sanitized.height <= 0.0 {
        sanitized.height = sane_fallback.height;
    }
    sanitized.width = sanitized.width.clamp(1.0, max_logical);
    sanitized.height = sanitized.height.clamp(1.0, max_logical);
    if is_suspicious_dimension_pair(sanitized.width, sanitized.height) {
        sanitized.width = sane_fallback.width;
        sanitized.height = sane_fallback.height;
    }
    sanitized
}

/// Converts one logical extent to a backing-store dimension under `scale`,
/// clamped to `[1, MAX_TEXTURE_DIMENSION]`.
pub fn to_backing_dimension(logical: f32, scale: f32) -> u32 {
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    let logical = if logical.is_finite() && logical > 0.0 { logical } else { 1.0 };
    let scaled = (logical * scale).round();
    scaled.clamp(1.0, MAX_TEXTURE_DIMENSION) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_finite_components_from_fallback() {
        let fallback = Rect::new(10.0, 20.0, 300.0, 200.0);
        let candidate = Rect::new(f32::NAN, 5.0, f32::INFINITY, -4.0);
        let sane = sanitize_rect(&candidate, &fallback, 1.0);
        assert_eq!(sane.origin.x, 10.0);
        assert_eq!(sane.origin.y, 5.0);
        assert_eq!(sane.width, 300.0);
        assert_eq!(sane.height, 200.0);
    }

    #[test]
    fn sanitize_clamps_scaled_extents_to_texture_limit() {
        let sane = sanitize_rect(
            &Rect::new(0.0, 0.0, 40000.0, 40000.0),
            &Rect::new(0.0, 0.0, 40000.0, 40000.0),
            2.0,
        );
        assert_eq!(sane.width, MAX_TEXTURE_DIMENSION / 2.0);
        assert_eq!(sane.height, MAX_TEXTURE_DIMENSION / 2.0);
        assert_eq!(to_backing_dimension(sane.width, 2.0), 16384);
    }

    #[test]
    fn suspicious_pair_falls_back_to_last_stable() {
        let fallback = Rect::new(0.0, 0.0, 640.0, 480.0);
        // A near-degenerate strip at half the texture clamp.
        let sane = sanitize_rect(&Rect::new(0.0, 0.0, 9000.0, 1.0), &fallback, 1.0);
        assert_eq!(sane.width, 640.0);
        assert_eq!(sane.height, 480.0);
        // Extreme aspect ratio alone also triggers the fallback.
        let sane = sanitize_rect(&Rect::new(0.0, 0.0, 2000.0, 4.0), &fallback, 1.0);
        assert_eq!(sane.width, 640.0);
        assert_eq!(sane.height, 480.0);
    }

    #[test]
    fn backing_dimension_is_always_in_range() {
        assert_eq!(to_backing_dimension(0.0, 1.0), 1);
        assert_eq!(to_backing_dimension(f32::NAN, 1.0), 1);
        assert_eq!(to_backing_dimension(0.4, 1.0), 1);
        assert_eq!(to_backing_dimension(100.0, 2.0), 200);
        assert_eq!(to_backing_dimension(1e9, 1.0), 16384);
    }

    #[test]
    fn approx_eq_tolerates_sub_epsilon_drift() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        let b = Rect::new(0.0004, 0.0, 100.0005, 100.0);
        assert!(a.approx_eq(&b));
        assert!(!a.approx_eq(&Rect::new(0.0, 0.0, 101.0, 100.0)));
    }
}
