//! Shared animation handles and timing options.
//!
//! A handle is a cheap clone of the animation's shared state block; every
//! field is atomically accessible from any thread. The animator owns the
//! lifecycle transitions, the handle owner may pause, resume, cancel, seek
//! and change the playback rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::curve::clamp01;

/// Process-wide unique animation identity.
pub type AnimationId = u64;

/// Lifecycle of one animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnimationState {
    Pending = 0,
    Running = 1,
    Paused = 2,
    Completed = 3,
    Cancelled = 4,
    Failed = 5,
}

impl AnimationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Completed,
            4 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// What value the animation leaves behind outside its active interval.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    None,
    #[default]
    Forwards,
    Backwards,
    Both,
}

/// Play direction across iterations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Normal,
    Reverse,
    Alternate,
    AlternateReverse,
}

/// What drives animation progress.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    WallClock,
    PresentedClock,
    #[default]
    Hybrid,
}

/// Timing envelope of one animation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingOptions {
    pub duration_ms: u32,
    pub delay_ms: u32,
    pub playback_rate: f32,
    pub iterations: f32,
    pub frame_rate_hint: u16,
    pub fill_mode: FillMode,
    pub direction: Direction,
    pub clock_mode: ClockMode,
    pub max_catchup_steps: u8,
    pub prefer_resize_safe_budget: bool,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            duration_ms: 300,
            delay_ms: 0,
            playback_rate: 1.0,
            iterations: 1.0,
            frame_rate_hint: 60,
            fill_mode: FillMode::Forwards,
            direction: Direction::Normal,
            clock_mode: ClockMode::Hybrid,
            max_catchup_steps: 1,
            prefer_resize_safe_budget: true,
        }
    }
}

struct StateBlock {
    id: AnimationId,
    state: AtomicU8,
    // f32 progress and rate stored as raw bits.
    progress: AtomicU32,
    rate: AtomicU32,
    last_submitted_packet: AtomicU64,
    last_presented_packet: AtomicU64,
    dropped_count: AtomicU32,
    failure_reason: Mutex<Option<String>>,
}

/// Shared, atomically accessible animation state.
#[derive(Clone, Default)]
pub struct AnimationHandle {
    block: Option<Arc<StateBlock>>,
}

impl AnimationHandle {
    pub(crate) fn create(id: AnimationId, initial: AnimationState) -> Self {
        Self {
            block: Some(Arc::new(StateBlock {
                id,
                state: AtomicU8::new(initial as u8),
                progress: AtomicU32::new(0.0f32.to_bits()),
                rate: AtomicU32::new(1.0f32.to_bits()),
                last_submitted_packet: AtomicU64::new(0),
                last_presented_packet: AtomicU64::new(0),
                dropped_count: AtomicU32::new(0),
                failure_reason: Mutex::new(None),
            })),
        }
    }

    /// False for the default handle and for handles whose animation never
    /// registered (e.g. an empty clip).
    pub fn valid(&self) -> bool {
        self.block.as_ref().is_some_and(|b| b.id != 0)
    }

    pub fn id(&self) -> AnimationId {
        self.block.as_ref().map(|b| b.id).unwrap_or(0)
    }

    pub fn state(&self) -> AnimationState {
        self.block
            .as_ref()
            .map(|b| AnimationState::from_u8(b.state.load(Ordering::Acquire)))
            .unwrap_or(AnimationState::Failed)
    }

    pub fn progress(&self) -> f32 {
        self.block
            .as_ref()
            .map(|b| f32::from_bits(b.progress.load(Ordering::Acquire)))
            .unwrap_or(0.0)
    }

    pub fn playback_rate(&self) -> f32 {
        self.block
            .as_ref()
            .map(|b| f32::from_bits(b.rate.load(Ordering::Acquire)))
            .unwrap_or(0.0)
    }

    pub fn last_submitted_packet_id(&self) -> u64 {
        self.block
            .as_ref()
            .map(|b| b.last_submitted_packet.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn last_presented_packet_id(&self) -> u64 {
        self.block
            .as_ref()
            .map(|b| b.last_presented_packet.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn dropped_packet_count(&self) -> u32 {
        self.block
            .as_ref()
            .map(|b| b.dropped_count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.block.as_ref().and_then(|b| b.failure_reason.lock().clone())
    }

    pub fn pause(&self) {
        let Some(block) = &self.block else { return };
        let _ = block.state.compare_exchange(
            AnimationState::Running as u8,
            AnimationState::Paused as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = block.state.compare_exchange(
            AnimationState::Pending as u8,
            AnimationState::Paused as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn resume(&self) {
        let Some(block) = &self.block else { return };
        let _ = block.state.compare_exchange(
            AnimationState::Paused as u8,
            AnimationState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Requests cancellation; the animator observes the transition on its
    /// next tick and issues the covering cancel command.
    pub fn cancel(&self) {
        let Some(block) = &self.block else { return };
        if !self.state().is_terminal() {
            block
                .state
                .store(AnimationState::Cancelled as u8, Ordering::Release);
        }
    }

    pub fn seek(&self, normalized: f32) {
        if let Some(block) = &self.block {
            block
                .progress
                .store(clamp01(normalized).to_bits(), Ordering::Release);
        }
    }

    pub fn set_playback_rate(&self, rate: f32) {
        if let Some(block) = &self.block {
            let safe = rate.max(f32::EPSILON);
            block.rate.store(safe.to_bits(), Ordering::Release);
        }
    }

    pub(crate) fn set_state(&self, state: AnimationState) {
        if let Some(block) = &self.block {
            block.state.store(state as u8, Ordering::Release);
        }
    }

    pub(crate) fn set_progress(&self, normalized: f32) {
        if let Some(block) = &self.block {
            block
                .progress
                .store(clamp01(normalized).to_bits(), Ordering::Release);
        }
    }

    pub(crate) fn set_submitted_packet(&self, packet_id: u64) {
        if let Some(block) = &self.block {
            block.last_submitted_packet.store(packet_id, Ordering::Release);
        }
    }

    pub(crate) fn set_presented_packet(&self, packet_id: u64) {
        if let Some(block) = &self.block {
            block.last_presented_packet.store(packet_id, Ordering::Release);
        }
    }

    pub(crate) fn add_dropped(&self) {
        if let Some(block) = &self.block {
            block.dropped_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_failure_reason(&self, reason: impl Into<String>) {
        if let Some(block) = &self.block {
            *block.failure_reason.lock() = Some(reason.into());
            block
                .state
                .store(AnimationState::Failed as u8, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handle_is_invalid() {
        let handle = AnimationHandle::default();
        assert!(!handle.valid());
        assert_eq!(handle.state(), AnimationState::Failed);
        assert_eq!(handle.progress(), 0.0);
    }

    #[test]
    fn pause_resume_cancel_transitions() {
        let handle = AnimationHandle::create(1, AnimationState::Running);
        handle.pause();
        assert_eq!(handle.state(), AnimationState::Paused);
        handle.resume();
        assert_eq!(handle.state(), AnimationState::Running);
        handle.cancel();
        assert_eq!(handle.state(), AnimationState::Cancelled);
        // Terminal states stick.
        handle.resume();
        assert_eq!(handle.state(), AnimationState::Cancelled);
    }

    #[test]
    fn seek_and_rate_are_clamped() {
        let handle = AnimationHandle::create(2, AnimationState::Running);
        handle.seek(3.0);
        assert_eq!(handle.progress(), 1.0);
        handle.seek(-1.0);
        assert_eq!(handle.progress(), 0.0);
        handle.set_playback_rate(0.0);
        assert!(handle.playback_rate() > 0.0);
    }
}
