//! Submission telemetry: per-lane packet counters and backend completion
//! reports.
//!
//! The scheduler marks packets queued / submitted / dropped / failed; the
//! backend completion callback marks them presented. The resulting per-lane
//! state is readable from any thread and is the signal source for
//! `PresentedClock` animations and the diagnostics blocks test suites
//! assert against.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Outcome of one backend commit as observed at completion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Completed,
    Error,
    Timeout,
    Dropped,
}

/// Why a packet was dropped without backend work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDropReason {
    /// Fully transparent zero-command frame; skipping preserves the last
    /// presented content.
    NoOpTransparent,
    /// A layer-effect command arrived before its surface could be built.
    MissingSurface,
    /// The backing texture rebuild failed; the last good target is kept.
    RebuildFailed,
}

/// Completion report produced by a backend commit.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionTelemetry {
    pub lane_id: u64,
    pub packet_id: u64,
    pub submit_cpu: Instant,
    pub complete_cpu: Instant,
    pub present_cpu: Instant,
    pub gpu_start_sec: f64,
    pub gpu_end_sec: f64,
    pub status: SubmissionStatus,
}

/// Callback a backend invokes once a commit completes on the GPU timeline.
pub type CompletionHandler = Box<dyn FnOnce(SubmissionTelemetry) + Send>;

/// Counter block for one sync lane.
#[derive(Debug, Default, Clone, Copy)]
pub struct LaneTelemetry {
    pub queued_packets: u64,
    pub submitted_packets: u64,
    pub presented_packets: u64,
    pub dropped_packets: u64,
    pub failed_packets: u64,
    pub last_submitted_packet_id: u64,
    pub last_presented_packet_id: u64,
    pub last_drop_reason: Option<PacketDropReason>,
}

/// Shared lane-indexed telemetry state.
#[derive(Default)]
pub struct TelemetryState {
    lanes: Mutex<FxHashMap<u64, LaneTelemetry>>,
}

impl TelemetryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of one lane's counters (zeroed if the lane is unknown).
    pub fn lane(&self, lane_id: u64) -> LaneTelemetry {
        self.lanes.lock().get(&lane_id).copied().unwrap_or_default()
    }

    pub fn mark_queued(&self, lane_id: u64, packet_id: u64) {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(lane_id).or_default();
        lane.queued_packets += 1;
        let _ = packet_id;
    }

    pub fn mark_submitted(&self, lane_id: u64, packet_id: u64) {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(lane_id).or_default();
        lane.submitted_packets += 1;
        lane.last_submitted_packet_id = lane.last_submitted_packet_id.max(packet_id);
    }

    pub fn mark_dropped(&self, lane_id: u64, packet_id: u64, reason: PacketDropReason) {
        debug!(lane_id, packet_id, ?reason, "packet dropped");
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(lane_id).or_default();
        lane.dropped_packets += 1;
        lane.last_drop_reason = Some(reason);
    }

    pub fn mark_failed(&self, lane_id: u64, packet_id: u64) {
        let _ = packet_id;
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(lane_id).or_default();
        lane.failed_packets += 1;
    }

    /// Feeds one backend completion back into the lane counters. Presented
    /// ids are monotonic per lane; an out-of-order completion only bumps the
    /// presented count.
    pub fn on_backend_completed(&self, telemetry: &SubmissionTelemetry) {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(telemetry.lane_id).or_default();
        match telemetry.status {
            SubmissionStatus::Completed => {
                lane.presented_packets += 1;
                lane.last_presented_packet_id =
                    lane.last_presented_packet_id.max(telemetry.packet_id);
            }
            SubmissionStatus::Dropped => {
                lane.dropped_packets += 1;
            }
            SubmissionStatus::Error | SubmissionStatus::Timeout => {
                lane.failed_packets += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(lane_id: u64, packet_id: u64) -> SubmissionTelemetry {
        let now = Instant::now();
        SubmissionTelemetry {
            lane_id,
            packet_id,
            submit_cpu: now,
            complete_cpu: now,
            present_cpu: now,
            gpu_start_sec: 0.0,
            gpu_end_sec: 0.0,
            status: SubmissionStatus::Completed,
        }
    }

    #[test]
    fn presented_packet_ids_are_monotonic() {
        let state = TelemetryState::new();
        state.on_backend_completed(&completed(3, 5));
        state.on_backend_completed(&completed(3, 4));
        let lane = state.lane(3);
        assert_eq!(lane.presented_packets, 2);
        assert_eq!(lane.last_presented_packet_id, 5);
    }

    #[test]
    fn drops_record_the_reason() {
        let state = TelemetryState::new();
        state.mark_dropped(1, 9, PacketDropReason::NoOpTransparent);
        let lane = state.lane(1);
        assert_eq!(lane.dropped_packets, 1);
        assert_eq!(lane.last_drop_reason, Some(PacketDropReason::NoOpTransparent));
        // Unknown lanes read as zeroed counters.
        assert_eq!(state.lane(2).dropped_packets, 0);
    }
}
