//! The compositor frontend and its scheduler thread.
//!
//! One [`Compositor`] owns one priority queue and one dispatcher thread,
//! created at construction and joined at shutdown; there is no global
//! instance. Proxies reach the queue through the [`CommandFrontend`] handle.
//!
//! Dispatch order is a total order: view resizes first, then cancels, then
//! everything else by deadline (earlier deadline, then earlier timestamp;
//! commands without a deadline sort after those with one and keep their
//! submission order). The dispatcher pops one command at a time; a command
//! whose deadline lies in the future is held until the deadline or shutdown,
//! a late command runs immediately. Backend execution is marshalled through
//! the injected [`MainThreadExecutor`] on platforms that require it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::backend::ExecutionState;
use crate::backend::surface::SurfaceBackend;
use crate::client::CommandFrontend;
use crate::command::{CommandStatus, CompositorCommand};
use crate::telemetry::TelemetryState;

/// Marshals command execution onto the platform's main thread when the
/// platform requires it. The default executor runs inline on the scheduler
/// thread (correct on Windows and Linux); macOS embedders inject an
/// executor that hops through the process main queue synchronously.
pub trait MainThreadExecutor: Send + Sync {
    fn execute(&self, task: &mut dyn FnMut());
}

/// Runs tasks inline on the calling thread.
pub struct InlineExecutor;

impl MainThreadExecutor for InlineExecutor {
    fn execute(&self, task: &mut dyn FnMut()) {
        task();
    }
}

/// Construction-time compositor settings.
#[derive(Clone)]
pub struct CompositorConfig {
    /// Render scale applied to new surface contexts; defaults to the
    /// backend's platform floor.
    pub render_scale: Option<f32>,
    /// Initial capacity of the command queue.
    pub queue_capacity: usize,
    /// Main-thread hop capability.
    pub main_thread: Arc<dyn MainThreadExecutor>,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            render_scale: None,
            queue_capacity: 200,
            main_thread: Arc::new(InlineExecutor),
        }
    }
}

struct QueueEntry {
    class: u8,
    deadline: Option<Instant>,
    timestamp: Instant,
    seq: u64,
    command: CompositorCommand,
}

impl QueueEntry {
    fn new(command: CompositorCommand, seq: u64) -> Self {
        let schedule = command.header().schedule;
        Self {
            class: command.class_rank(),
            deadline: schedule.deadline,
            timestamp: schedule.timestamp,
            seq,
            command,
        }
    }
}

/// Total dispatch order; `Less` means dispatched first.
fn dispatch_cmp(a: &QueueEntry, b: &QueueEntry) -> CmpOrdering {
    a.class
        .cmp(&b.class)
        .then_with(|| match (a.deadline, b.deadline) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.timestamp.cmp(&b.timestamp)),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        })
        .then_with(|| a.seq.cmp(&b.seq))
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap pops its greatest entry; invert so the first-dispatched
        // entry is the greatest.
        dispatch_cmp(self, other).reverse()
    }
}

struct QueueState {
    queue: BinaryHeap<QueueEntry>,
    shutdown: bool,
    next_seq: u64,
}

struct SchedulerShared {
    state: Mutex<QueueState>,
    condvar: Condvar,
    telemetry: Arc<TelemetryState>,
}

impl SchedulerShared {
    /// Removes queued commands of `client_id` with ids in
    /// `[start_id, end_id]`, resolving them `Failed`. In-flight commands are
    /// untouched.
    fn cancel_queued(&self, client_id: u64, start_id: u32, end_id: u32) {
        let mut state = self.state.lock();
        let entries = std::mem::take(&mut state.queue);
        let mut kept = BinaryHeap::with_capacity(entries.len());
        let mut cancelled = 0usize;
        for mut entry in entries {
            let header = entry.command.header();
            if header.client_id == client_id && header.id >= start_id && header.id <= end_id {
                self.telemetry.mark_failed(header.lane_id, header.packet_id);
                entry.command.resolve(CommandStatus::Failed);
                cancelled += 1;
            } else {
                kept.push(entry);
            }
        }
        state.queue = kept;
        debug!(client_id, start_id, end_id, cancelled, "cancel range applied");
    }
}

impl CommandFrontend for SchedulerShared {
    fn schedule(&self, command: CompositorCommand) {
        let mut command = command;
        {
            let header = command.header();
            self.telemetry.mark_queued(header.lane_id, header.packet_id);
        }
        {
            let mut state = self.state.lock();
            if state.shutdown {
                warn!("command scheduled after shutdown");
                command.resolve(CommandStatus::Failed);
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueueEntry::new(command, seq));
        }
        self.condvar.notify_one();
    }
}

/// The composition engine frontend: owns the queue, the scheduler thread
/// and the backend execution state. Explicitly constructed and shut down
/// by the application (usually via a widget tree host).
pub struct Compositor {
    shared: Arc<SchedulerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Compositor {
    pub fn new(backend: Box<dyn SurfaceBackend>, config: CompositorConfig) -> Self {
        let telemetry = TelemetryState::new();
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(QueueState {
                queue: BinaryHeap::with_capacity(config.queue_capacity),
                shutdown: false,
                next_seq: 0,
            }),
            condvar: Condvar::new(),
            telemetry: telemetry.clone(),
        });
        let execution = ExecutionState::new(backend, telemetry, config.render_scale);
        let thread_shared = shared.clone();
        let main_thread = config.main_thread.clone();
        let thread = std::thread::Builder::new()
            .name("lamina-scheduler".into())
            .spawn(move || scheduler_loop(thread_shared, execution, main_thread))
            .expect("failed to spawn the compositor scheduler thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Submission handle for client proxies.
    pub fn frontend(&self) -> Arc<dyn CommandFrontend> {
        self.shared.clone()
    }

    pub fn telemetry(&self) -> Arc<TelemetryState> {
        self.shared.telemetry.clone()
    }

    /// Drains the queue (pending commands resolve `Failed`) and joins the
    /// scheduler thread. Safe to call more than once; joining is skipped if
    /// called from the scheduler thread itself.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown && self.thread.is_none() {
                return;
            }
            state.shutdown = true;
        }
        self.shared.condvar.notify_all();
        if let Some(thread) = self.thread.take() {
            if std::thread::current().id() == thread.thread().id() {
                return;
            }
            let _ = thread.join();
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_loop(
    shared: Arc<SchedulerShared>,
    mut execution: ExecutionState,
    main_thread: Arc<dyn MainThreadExecutor>,
) {
    debug!("scheduler starting up");
    loop {
        let entry = {
            let mut state = shared.state.lock();
            while !state.shutdown && state.queue.is_empty() {
                shared.condvar.wait(&mut state);
            }
            if state.shutdown {
                while let Some(mut pending) = state.queue.pop() {
                    pending.command.resolve(CommandStatus::Failed);
                }
                break;
            }
            state.queue.pop().expect("queue non-empty after wait")
        };
        process_command(&shared, &mut execution, main_thread.as_ref(), entry.command);
    }
    execution.teardown();
    debug!("scheduler shut down");
}

fn process_command(
    shared: &Arc<SchedulerShared>,
    execution: &mut ExecutionState,
    main_thread: &dyn MainThreadExecutor,
    mut command: CompositorCommand,
) {
    if let Some(deadline) = command.header().schedule.deadline {
        let now = Instant::now();
        if deadline > now {
            let mut state = shared.state.lock();
            while !state.shutdown {
                if shared.condvar.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.shutdown {
                drop(state);
                command.resolve(CommandStatus::Failed);
                return;
            }
        }
        // A deadline already in the past means the command is late; it runs
        // immediately, observable only through telemetry.
    }
    execute_command(shared, execution, main_thread, command);
}

fn execute_command(
    shared: &Arc<SchedulerShared>,
    execution: &mut ExecutionState,
    main_thread: &dyn MainThreadExecutor,
    command: CompositorCommand,
) {
    match command {
        CompositorCommand::Cancel {
            mut header,
            start_id,
            end_id,
        } => {
            shared.cancel_queued(header.client_id, start_id, end_id);
            header.status.resolve(CommandStatus::Ok);
        }
        CompositorCommand::Packet { mut header, commands } => {
            // Packets dispatch atomically: inner commands run back to back
            // in insertion order.
            for inner in commands {
                match inner {
                    CompositorCommand::Cancel {
                        mut header,
                        start_id,
                        end_id,
                    } => {
                        shared.cancel_queued(header.client_id, start_id, end_id);
                        header.status.resolve(CommandStatus::Ok);
                    }
                    other => marshal(execution, main_thread, other),
                }
            }
            header.status.resolve(CommandStatus::Ok);
        }
        other => marshal(execution, main_thread, other),
    }
}

fn marshal(
    execution: &mut ExecutionState,
    main_thread: &dyn MainThreadExecutor,
    command: CompositorCommand,
) {
    let mut slot = Some(command);
    main_thread.execute(&mut || {
        if let Some(command) = slot.take() {
            execution.execute(command);
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::canvas::Frame;
    use crate::client::{ClientProxy, CompositorClient};
    use crate::geometry::{Color, Rect};
    use crate::layer::{LayerId, LayerTree};
    use crate::testing::{RecordedOp, RecordingBackend};

    fn compositor_with(backend: RecordingBackend) -> Compositor {
        Compositor::new(Box::new(backend), CompositorConfig::default())
    }

    fn view_setup(compositor: &Compositor, lane: u64) -> (Arc<ClientProxy>, Arc<LayerTree>, LayerId) {
        let proxy = Arc::new(ClientProxy::new_detached());
        proxy.set_sync_lane_id(lane);
        proxy.set_frontend(Some(compositor.frontend()));
        let tree = Arc::new(LayerTree::new());
        let limb = tree.create_limb(Rect::new(0.0, 0.0, 120.0, 80.0));
        let layer = tree.limb_root_layer(limb).unwrap();
        (proxy, tree, layer)
    }

    fn white_frame(tree: &Arc<LayerTree>, layer: LayerId) -> Frame {
        let mut frame = Frame::new(tree.clone(), layer);
        frame.background = Color::WHITE;
        frame
    }

    #[test]
    fn queue_order_is_total() {
        fn entry(class: u8, deadline: Option<Instant>, timestamp: Instant, seq: u64) -> QueueEntry {
            use crate::command::{CommandHeader, Priority, RectDelta, Schedule};
            let schedule = Schedule {
                timestamp,
                deadline,
            };
            let (header, _receipt) = CommandHeader::new(0, 0, Priority::Low, schedule);
            let command = match class {
                0 => CompositorCommand::ViewResize {
                    header,
                    target: Arc::new(crate::client::ViewRenderTarget::new(Arc::new(()))),
                    delta: RectDelta::default(),
                },
                1 => CompositorCommand::Cancel {
                    header,
                    start_id: 0,
                    end_id: 0,
                },
                _ => {
                    let tree = Arc::new(LayerTree::new());
                    let limb = tree.create_limb(Rect::UNIT);
                    let layer = tree.limb_root_layer(limb).unwrap();
                    CompositorCommand::Render {
                        header,
                        target: Arc::new(crate::client::ViewRenderTarget::new(Arc::new(()))),
                        frame: Frame::new(tree, layer),
                    }
                }
            };
            QueueEntry::new(command, seq)
        }

        let now = Instant::now();
        let soon = now + Duration::from_millis(10);
        let later = now + Duration::from_millis(30);

        // View before cancel before render.
        let view = entry(0, None, now, 10);
        let cancel = entry(1, None, now, 11);
        let render = entry(2, Some(soon), now, 12);
        assert_eq!(dispatch_cmp(&view, &cancel), CmpOrdering::Less);
        assert_eq!(dispatch_cmp(&cancel, &render), CmpOrdering::Less);

        // Earlier deadline wins; deadline-less sorts after deadline-carrying.
        let early = entry(2, Some(soon), now, 13);
        let late = entry(2, Some(later), now, 14);
        let untimed = entry(2, None, now, 15);
        assert_eq!(dispatch_cmp(&early, &late), CmpOrdering::Less);
        assert_eq!(dispatch_cmp(&late, &untimed), CmpOrdering::Less);

        // Same deadline: earlier timestamp wins, then submission order.
        let ts_early = entry(2, Some(later), now, 16);
        let ts_late = entry(2, Some(later), now + Duration::from_millis(1), 17);
        assert_eq!(dispatch_cmp(&ts_early, &ts_late), CmpOrdering::Less);
        let first = entry(2, None, now, 18);
        let second = entry(2, None, now, 19);
        assert_eq!(dispatch_cmp(&first, &second), CmpOrdering::Less);
    }

    #[test]
    fn render_roundtrip_executes_and_reports_telemetry() {
        let backend = RecordingBackend::new();
        let compositor = compositor_with(backend.clone());
        let (proxy, tree, layer) = view_setup(&compositor, 7);
        let mut client = CompositorClient::new(proxy.clone());

        client.push_frame(white_frame(&tree, layer), Instant::now());
        let status = client.last_receipt().expect("receipt").wait();
        assert_eq!(status, CommandStatus::Ok);
        assert!(backend.saw(|op| matches!(op, RecordedOp::Present { lane_id: 7, packet_id: 1 })));
        let lane = compositor.telemetry().lane(7);
        assert_eq!(lane.queued_packets, 1);
        assert_eq!(lane.presented_packets, 1);
    }

    #[test]
    fn deadline_order_dispatches_earliest_first() {
        let backend = RecordingBackend::new();
        let compositor = compositor_with(backend.clone());

        // Occupy the dispatcher with a far-deadline blocker so the three
        // probes are all queued before any of them is popped.
        let (blocker_proxy, blocker_tree, blocker_layer) = view_setup(&compositor, 100);
        let mut blocker = CompositorClient::new(blocker_proxy);
        let t0 = Instant::now();
        blocker.push_timed_frame(
            white_frame(&blocker_tree, blocker_layer),
            t0,
            t0 + Duration::from_millis(80),
        );
        std::thread::sleep(Duration::from_millis(20));

        let mut clients = Vec::new();
        for (lane, offset_ms) in [(101u64, 30u64), (102, 10), (103, 20)] {
            let (proxy, tree, layer) = view_setup(&compositor, lane);
            let mut client = CompositorClient::new(proxy);
            client.push_timed_frame(
                white_frame(&tree, layer),
                t0,
                t0 + Duration::from_millis(offset_ms),
            );
            clients.push(client);
        }
        for client in &clients {
            assert_eq!(client.last_receipt().expect("receipt").wait(), CommandStatus::Ok);
        }

        let lanes: Vec<u64> = backend
            .ops()
            .iter()
            .filter_map(|op| match op {
                RecordedOp::Present { lane_id, .. } if *lane_id >= 101 => Some(*lane_id),
                _ => None,
            })
            .collect();
        assert_eq!(lanes, vec![102, 103, 101]);
    }

    #[test]
    fn cancel_range_fails_queued_commands_and_spares_the_rest() {
        let backend = RecordingBackend::new();
        let compositor = compositor_with(backend.clone());
        let (proxy, tree, layer) = view_setup(&compositor, 40);
        let mut client = CompositorClient::new(proxy.clone());

        // Blocker occupies the dispatcher while the probes accumulate.
        let t0 = Instant::now();
        client.push_timed_frame(white_frame(&tree, layer), t0, t0 + Duration::from_millis(80));
        std::thread::sleep(Duration::from_millis(20));

        // Each push submits immediately (no record window), so the five
        // probes queue as separate commands with client ids 1..=5.
        for _ in 0..5 {
            client.push_timed_frame(white_frame(&tree, layer), t0, t0 + Duration::from_millis(100));
        }
        // Cancel ids 2..=4.
        let cancel_receipt = proxy.queue_cancel(99, client.client_id(), 2, 4);

        // Ids 1 and 5 execute, 2..4 fail, the cancel itself resolves ok.
        assert_eq!(cancel_receipt.wait(), CommandStatus::Ok);
        // Wait for the tail command to finish.
        std::thread::sleep(Duration::from_millis(120));
        let lane = compositor.telemetry().lane(40);
        assert_eq!(lane.failed_packets, 3);
        // Blocker + ids 1 and 5 presented.
        assert_eq!(lane.presented_packets, 3);
    }

    #[test]
    fn shutdown_drains_pending_commands_as_failed() {
        let backend = RecordingBackend::new();
        let mut compositor = compositor_with(backend);
        let (proxy, tree, layer) = view_setup(&compositor, 60);
        let mut client = CompositorClient::new(proxy);

        let t0 = Instant::now();
        client.push_timed_frame(white_frame(&tree, layer), t0, t0 + Duration::from_secs(10));
        client.push_timed_frame(white_frame(&tree, layer), t0, t0 + Duration::from_secs(10));
        std::thread::sleep(Duration::from_millis(20));
        compositor.shutdown();

        assert_eq!(client.last_receipt().expect("receipt").wait(), CommandStatus::Failed);
        // Commands scheduled after shutdown fail immediately.
        client.push_frame(white_frame(&tree, layer), Instant::now());
        assert_eq!(client.last_receipt().expect("receipt").wait(), CommandStatus::Failed);
    }

    #[test]
    fn packet_preserves_insertion_order_on_execution() {
        let backend = RecordingBackend::new();
        let compositor = compositor_with(backend.clone());
        let (proxy, tree, layer) = view_setup(&compositor, 9);
        let mut client = CompositorClient::new(proxy.clone());

        proxy.begin_record();
        let mut first = white_frame(&tree, layer);
        first.background = Color::new(0.1, 0.0, 0.0, 1.0);
        let mut second = white_frame(&tree, layer);
        second.background = Color::new(0.0, 0.2, 0.0, 1.0);
        client.push_frame(first, Instant::now());
        client.push_frame(second, Instant::now());
        proxy.end_record();

        while client.busy() {
            std::thread::sleep(Duration::from_millis(5));
        }
        let clears: Vec<Color> = backend
            .ops()
            .iter()
            .filter_map(|op| match op {
                RecordedOp::Clear { background } => Some(*background),
                _ => None,
            })
            .collect();
        assert_eq!(
            clears,
            vec![Color::new(0.1, 0.0, 0.0, 1.0), Color::new(0.0, 0.2, 0.0, 1.0)]
        );
    }
}
