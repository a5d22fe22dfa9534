//! Animation runtime: curves, keyframe tracks, handles and animators.
//!
//! Animations sample keyframe tracks on a per-view tick, diff the sampled
//! values against the last submitted ones, and push layer/view commands
//! through the view's client proxy with a deadline one tick budget out.
//! Progress is driven by one of three clocks: wall time, backend
//! presentation telemetry, or a hybrid that falls back to waiting on
//! presentation when the lane lags ("stale-skip").

/// Animator runtime: per-view ticking, clocks and diagnostics.
pub mod animator;
/// Easing curves and presets.
pub mod curve;
/// Shared animation handles and timing options.
pub mod handle;
/// Keyframe tracks with type-specialized interpolation.
pub mod track;

pub use animator::{
    AnimationDiagnostics, AnimatorProbe, LayerAnimator, LayerClip, ViewAnimator, ViewClip,
};
pub use curve::AnimationCurve;
pub use handle::{
    AnimationHandle, AnimationId, AnimationState, ClockMode, Direction, FillMode, TimingOptions,
};
pub use track::{KeyframeTrack, KeyframeValue};
