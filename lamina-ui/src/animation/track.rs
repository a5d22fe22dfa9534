//! Keyframe tracks with type-specialized interpolation.

use crate::geometry::{Color, Point, Rect};
use crate::layer::{DropShadowParams, Rotation, TransformationParams};

use super::curve::{AnimationCurve, clamp01, lerp};

/// Component-wise linear interpolation between two track values.
pub trait Interpolate: Clone {
    fn interpolate(a: &Self, b: &Self, t: f32) -> Self;
}

impl Interpolate for f32 {
    fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
        lerp(*a, *b, t)
    }
}

impl Interpolate for Rect {
    fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
        Rect {
            origin: Point::new(lerp(a.origin.x, b.origin.x, t), lerp(a.origin.y, b.origin.y, t)),
            width: lerp(a.width, b.width, t),
            height: lerp(a.height, b.height, t),
        }
    }
}

impl Interpolate for TransformationParams {
    fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
        TransformationParams {
            translate: [
                lerp(a.translate[0], b.translate[0], t),
                lerp(a.translate[1], b.translate[1], t),
                lerp(a.translate[2], b.translate[2], t),
            ],
            rotate: Rotation {
                pitch: lerp(a.rotate.pitch, b.rotate.pitch, t),
                yaw: lerp(a.rotate.yaw, b.rotate.yaw, t),
                roll: lerp(a.rotate.roll, b.rotate.roll, t),
            },
            scale: [
                lerp(a.scale[0], b.scale[0], t),
                lerp(a.scale[1], b.scale[1], t),
                lerp(a.scale[2], b.scale[2], t),
            ],
        }
    }
}

impl Interpolate for DropShadowParams {
    fn interpolate(a: &Self, b: &Self, t: f32) -> Self {
        DropShadowParams {
            x_offset: lerp(a.x_offset, b.x_offset, t),
            y_offset: lerp(a.y_offset, b.y_offset, t),
            radius: lerp(a.radius, b.radius, t),
            blur: lerp(a.blur, b.blur, t),
            opacity: lerp(a.opacity, b.opacity, t),
            color: Color::new(
                lerp(a.color.r, b.color.r, t),
                lerp(a.color.g, b.color.g, t),
                lerp(a.color.b, b.color.b, t),
                lerp(a.color.a, b.color.a, t),
            ),
        }
    }
}

/// One keyframe: a normalized offset, a value and the easing toward the
/// next keyframe.
#[derive(Debug, Clone)]
pub struct KeyframeValue<T> {
    pub offset: f32,
    pub value: T,
    pub easing_to_next: Option<AnimationCurve>,
}

impl<T> KeyframeValue<T> {
    pub fn new(offset: f32, value: T) -> Self {
        Self {
            offset,
            value,
            easing_to_next: None,
        }
    }

    pub fn eased(offset: f32, value: T, easing: AnimationCurve) -> Self {
        Self {
            offset,
            value,
            easing_to_next: Some(easing),
        }
    }
}

/// A sorted keyframe timeline over one animatable value.
#[derive(Debug, Clone)]
pub struct KeyframeTrack<T> {
    keys: Vec<KeyframeValue<T>>,
}

impl<T: Interpolate + Default> KeyframeTrack<T> {
    /// Builds a track from keys, sorting by offset and clamping offsets to
    /// `[0, 1]`.
    pub fn from_keys(mut keys: Vec<KeyframeValue<T>>) -> Self {
        keys.sort_by(|a, b| a.offset.total_cmp(&b.offset));
        for key in &mut keys {
            key.offset = clamp01(key.offset);
        }
        Self { keys }
    }

    /// Convenience two-key track from `from` to `to` with one easing.
    pub fn transition(from: T, to: T, easing: AnimationCurve) -> Self {
        Self::from_keys(vec![
            KeyframeValue::eased(0.0, from, easing),
            KeyframeValue::new(1.0, to),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[KeyframeValue<T>] {
        &self.keys
    }

    /// Samples the track at normalized time `t`.
    ///
    /// Empty tracks yield the default value; a single key is constant; `t`
    /// outside the key range clamps to the first/last key; otherwise the
    /// bracketing pair is interpolated with the leading key's easing (or
    /// identity).
    pub fn sample(&self, t: f32) -> T {
        if self.keys.is_empty() {
            return T::default();
        }
        if self.keys.len() == 1 {
            return self.keys[0].value.clone();
        }
        let normalized = clamp01(t);
        let first = &self.keys[0];
        let last = &self.keys[self.keys.len() - 1];
        if normalized <= first.offset {
            return first.value.clone();
        }
        if normalized >= last.offset {
            return last.value.clone();
        }
        for pair in self.keys.windows(2) {
            let prev = &pair[0];
            let next = &pair[1];
            if normalized > next.offset {
                continue;
            }
            let span = (next.offset - prev.offset).max(f32::EPSILON);
            let local = clamp01((normalized - prev.offset) / span);
            let eased = match &prev.easing_to_next {
                Some(curve) => curve.sample(local),
                None => local,
            };
            return T::interpolate(&prev.value, &next.value, clamp01(eased));
        }
        last.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_single_key_tracks() {
        let empty: KeyframeTrack<f32> = KeyframeTrack::from_keys(vec![]);
        assert_eq!(empty.sample(0.5), 0.0);

        let single = KeyframeTrack::from_keys(vec![KeyframeValue::new(0.3, 7.0)]);
        assert_eq!(single.sample(0.0), 7.0);
        assert_eq!(single.sample(1.0), 7.0);
    }

    #[test]
    fn sampling_clamps_outside_the_key_range() {
        let track = KeyframeTrack::from_keys(vec![
            KeyframeValue::new(0.2, 10.0),
            KeyframeValue::new(0.8, 20.0),
        ]);
        assert_eq!(track.sample(0.0), 10.0);
        assert_eq!(track.sample(0.2), 10.0);
        assert_eq!(track.sample(1.0), 20.0);
        assert_eq!(track.sample(0.5), 15.0);
    }

    #[test]
    fn keys_are_sorted_and_offsets_clamped() {
        let track = KeyframeTrack::from_keys(vec![
            KeyframeValue::new(1.7, 30.0),
            KeyframeValue::new(-0.5, 0.0),
            KeyframeValue::new(0.5, 10.0),
        ]);
        let offsets: Vec<f32> = track.keys().iter().map(|k| k.offset).collect();
        assert_eq!(offsets, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn easing_applies_between_the_bracketing_pair() {
        let eased = KeyframeTrack::transition(0.0, 1.0, AnimationCurve::ease_in());
        let linear = KeyframeTrack::transition(0.0, 1.0, AnimationCurve::linear());
        assert!(eased.sample(0.25) < linear.sample(0.25));
        assert_eq!(eased.sample(1.0), 1.0);
    }

    #[test]
    fn rect_interpolation_is_componentwise() {
        let track = KeyframeTrack::transition(
            Rect::new(0.0, 0.0, 100.0, 50.0),
            Rect::new(10.0, 20.0, 200.0, 150.0),
            AnimationCurve::linear(),
        );
        let mid = track.sample(0.5);
        assert_eq!(mid, Rect::new(5.0, 10.0, 150.0, 100.0));
    }

    #[test]
    fn shadow_interpolation_covers_color_channels() {
        let from = DropShadowParams {
            opacity: 0.0,
            color: Color::new(0.0, 0.0, 0.0, 0.0),
            ..Default::default()
        };
        let to = DropShadowParams {
            opacity: 1.0,
            color: Color::new(1.0, 0.5, 0.0, 1.0),
            ..Default::default()
        };
        let track = KeyframeTrack::transition(from, to, AnimationCurve::linear());
        let mid = track.sample(0.5);
        assert_eq!(mid.opacity, 0.5);
        assert_eq!(mid.color, Color::new(0.5, 0.25, 0.0, 0.5));
    }

    #[test]
    fn identical_inputs_sample_bit_for_bit_identically() {
        let track = KeyframeTrack::transition(0.0f32, 123.456, AnimationCurve::ease_in_out());
        for i in 0..=64 {
            let t = i as f32 / 64.0;
            assert_eq!(track.sample(t).to_bits(), track.sample(t).to_bits());
        }
    }
}
