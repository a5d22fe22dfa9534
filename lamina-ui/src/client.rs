//! Client-side command production: render targets, the per-view proxy and
//! the per-producer client.
//!
//! A [`ClientProxy`] belongs to one view render target. Producers (canvases,
//! animators, the paint glue) record commands into the proxy between
//! `begin_record` / `end_record`; the outermost `end_record` submits
//! everything recorded in that window as one atomic packet carrying the
//! proxy's sync lane id and the next packet id. Commands queued outside a
//! record window submit immediately.
//!
//! All proxy methods are callable from any thread; state is guarded by one
//! per-proxy mutex ([`ClientProxy::peek_next_packet_id`] and
//! [`ClientProxy::sync_lane_id`] take the same lock).

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::canvas::Frame;
use crate::command::{
    CommandHeader, CommandReceipt, CommandStatus, CompositorCommand, Priority, RectDelta, Schedule,
};
use crate::layer::{LayerEffect, LayerId, LayerTree};

/// Opaque handle to a platform surface (HWND, CAMetalLayer, Wayland
/// surface, `wgpu::SurfaceTarget`, ...). The active backend downcasts it.
pub type NativeSurfaceHandle = Arc<dyn Any + Send + Sync>;

/// Identity of a view render target inside the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetId(u64);

static TARGET_ID_SEED: AtomicU64 = AtomicU64::new(1);
static LANE_ID_SEED: AtomicU64 = AtomicU64::new(1);
static CLIENT_ID_SEED: AtomicU64 = AtomicU64::new(1);

/// The compositor's interface for composing to one view.
pub struct ViewRenderTarget {
    id: RenderTargetId,
    native: NativeSurfaceHandle,
}

impl ViewRenderTarget {
    pub fn new(native: NativeSurfaceHandle) -> Self {
        Self {
            id: RenderTargetId(TARGET_ID_SEED.fetch_add(1, Ordering::Relaxed)),
            native,
        }
    }

    pub fn id(&self) -> RenderTargetId {
        self.id
    }

    pub fn native_handle(&self) -> &NativeSurfaceHandle {
        &self.native
    }
}

/// Submission side of the compositor, as seen by proxies.
pub trait CommandFrontend: Send + Sync {
    fn schedule(&self, command: CompositorCommand);
}

struct ProxyState {
    frontend: Option<Arc<dyn CommandFrontend>>,
    record_depth: u32,
    pending: VecDeque<CompositorCommand>,
    lane_id: u64,
    next_packet_id: u64,
    // Set once by peek_next_packet_id; consumed by the next non-empty
    // submit so preview ids always match the submitted packet.
    packet_reserved: bool,
}

/// Per-view record/submit frontend.
pub struct ClientProxy {
    target: Arc<ViewRenderTarget>,
    state: Mutex<ProxyState>,
}

impl ClientProxy {
    pub fn new(target: Arc<ViewRenderTarget>) -> Self {
        Self {
            target,
            state: Mutex::new(ProxyState {
                frontend: None,
                record_depth: 0,
                pending: VecDeque::new(),
                lane_id: LANE_ID_SEED.fetch_add(1, Ordering::Relaxed),
                next_packet_id: 1,
                packet_reserved: false,
            }),
        }
    }

    /// A proxy over a fresh target with no native surface. Commands submitted
    /// without a frontend resolve `Failed`; useful for wiring and tests.
    pub fn new_detached() -> Self {
        Self::new(Arc::new(ViewRenderTarget::new(Arc::new(()))))
    }

    pub fn render_target(&self) -> &Arc<ViewRenderTarget> {
        &self.target
    }

    pub fn set_frontend(&self, frontend: Option<Arc<dyn CommandFrontend>>) {
        self.state.lock().frontend = frontend;
    }

    pub fn has_frontend(&self) -> bool {
        self.state.lock().frontend.is_some()
    }

    pub fn frontend(&self) -> Option<Arc<dyn CommandFrontend>> {
        self.state.lock().frontend.clone()
    }

    pub fn set_sync_lane_id(&self, lane_id: u64) {
        self.state.lock().lane_id = lane_id;
    }

    pub fn sync_lane_id(&self) -> u64 {
        self.state.lock().lane_id
    }

    /// The packet id the next non-empty submit will carry. Reserves exactly
    /// once: repeated peeks between submits return the same id; the next
    /// submit consumes the reservation.
    pub fn peek_next_packet_id(&self) -> u64 {
        let mut state = self.state.lock();
        if !state.packet_reserved {
            state.packet_reserved = true;
        }
        state.next_packet_id
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().record_depth > 0
    }

    /// Opens (or nests into) a recording window.
    pub fn begin_record(&self) {
        self.state.lock().record_depth += 1;
    }

    /// Closes one recording level; the outermost close submits.
    pub fn end_record(&self) {
        {
            let mut state = self.state.lock();
            if state.record_depth == 0 {
                return;
            }
            state.record_depth -= 1;
            if state.record_depth > 0 {
                return;
            }
        }
        self.submit();
    }

    fn enqueue(&self, command: CompositorCommand) {
        let submit_now = {
            let mut state = self.state.lock();
            state.pending.push_back(command);
            state.record_depth == 0
        };
        if submit_now {
            self.submit();
        }
    }

    pub(crate) fn queue_frame(
        &self,
        id: u32,
        client_id: u64,
        frame: Frame,
        start: Instant,
    ) -> CommandReceipt {
        let (header, receipt) = CommandHeader::new(id, client_id, Priority::Low, Schedule::immediate(start));
        self.enqueue(CompositorCommand::Render {
            header,
            target: self.target.clone(),
            frame,
        });
        receipt
    }

    pub(crate) fn queue_timed_frame(
        &self,
        id: u32,
        client_id: u64,
        frame: Frame,
        start: Instant,
        deadline: Instant,
    ) -> CommandReceipt {
        let (header, receipt) =
            CommandHeader::new(id, client_id, Priority::High, Schedule::with_deadline(start, deadline));
        self.enqueue(CompositorCommand::Render {
            header,
            target: self.target.clone(),
            frame,
        });
        receipt
    }

    pub(crate) fn queue_layer_resize(
        &self,
        id: u32,
        client_id: u64,
        tree: Arc<LayerTree>,
        layer: LayerId,
        delta: RectDelta,
        start: Instant,
        deadline: Instant,
    ) -> CommandReceipt {
        let (header, receipt) =
            CommandHeader::new(id, client_id, Priority::High, Schedule::with_deadline(start, deadline));
        self.enqueue(CompositorCommand::LayerResize {
            header,
            target: self.target.clone(),
            tree,
            layer,
            delta,
        });
        receipt
    }

    pub(crate) fn queue_layer_effect(
        &self,
        id: u32,
        client_id: u64,
        tree: Arc<LayerTree>,
        layer: LayerId,
        effect: LayerEffect,
        start: Instant,
        deadline: Instant,
    ) -> CommandReceipt {
        let (header, receipt) =
            CommandHeader::new(id, client_id, Priority::High, Schedule::with_deadline(start, deadline));
        self.enqueue(CompositorCommand::LayerEffect {
            header,
            target: self.target.clone(),
            tree,
            layer,
            effect,
        });
        receipt
    }

    pub(crate) fn queue_view_resize(
        &self,
        id: u32,
        client_id: u64,
        delta: RectDelta,
        start: Instant,
        deadline: Instant,
    ) -> CommandReceipt {
        let (header, receipt) =
            CommandHeader::new(id, client_id, Priority::High, Schedule::with_deadline(start, deadline));
        self.enqueue(CompositorCommand::ViewResize {
            header,
            target: self.target.clone(),
            delta,
        });
        receipt
    }

    pub(crate) fn queue_cancel(
        &self,
        id: u32,
        client_id: u64,
        start_id: u32,
        end_id: u32,
    ) -> CommandReceipt {
        let now = Instant::now();
        let (header, receipt) = CommandHeader::new(id, client_id, Priority::High, Schedule::immediate(now));
        self.enqueue(CompositorCommand::Cancel {
            header,
            start_id,
            end_id,
        });
        receipt
    }

    /// Drains the pending window and hands it to the frontend.
    ///
    /// Zero commands: no-op (an armed packet-id reservation stays armed).
    /// One command: submitted unwrapped. More: wrapped in a packet whose
    /// header inherits the first command's id, client, priority and
    /// schedule. Without a frontend every drained command resolves `Failed`.
    fn submit(&self) {
        let (frontend, mut batch, lane_id, packet_id) = {
            let mut state = self.state.lock();
            let Some(frontend) = state.frontend.clone() else {
                if !state.pending.is_empty() {
                    warn!(
                        count = state.pending.len(),
                        "submit without frontend; failing queued commands"
                    );
                }
                while let Some(mut command) = state.pending.pop_front() {
                    command.resolve(CommandStatus::Failed);
                }
                return;
            };
            if state.pending.is_empty() {
                return;
            }
            let batch: SmallVec<[CompositorCommand; 8]> = state.pending.drain(..).collect();
            let packet_id = state.next_packet_id;
            state.next_packet_id += 1;
            state.packet_reserved = false;
            (frontend, batch, state.lane_id, packet_id)
        };

        for command in batch.iter_mut() {
            command.stamp(lane_id, packet_id);
        }
        debug!(lane_id, packet_id, count = batch.len(), "submitting packet");

        if batch.len() == 1 {
            let command = batch.pop().expect("len checked above");
            frontend.schedule(command);
            return;
        }

        let first = batch.first().expect("non-empty batch");
        let (mut header, _receipt) = CommandHeader::new(
            first.header().id,
            first.header().client_id,
            first.header().priority,
            first.header().schedule,
        );
        header.lane_id = lane_id;
        header.packet_id = packet_id;
        frontend.schedule(CompositorCommand::Packet {
            header,
            commands: batch.into_vec(),
        });
    }
}

struct ActiveCommand {
    id: u32,
    receipt: CommandReceipt,
}

/// A producer of commands against one proxy. Assigns the client-scoped
/// monotonic command ids and tracks outstanding receipts so a burst of
/// in-flight work can be range-cancelled.
pub struct CompositorClient {
    proxy: Arc<ClientProxy>,
    client_id: u64,
    next_command_id: u32,
    active: Vec<ActiveCommand>,
}

impl CompositorClient {
    pub fn new(proxy: Arc<ClientProxy>) -> Self {
        Self {
            proxy,
            client_id: CLIENT_ID_SEED.fetch_add(1, Ordering::Relaxed),
            next_command_id: 0,
            active: Vec::new(),
        }
    }

    pub fn proxy(&self) -> &Arc<ClientProxy> {
        &self.proxy
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_command_id;
        self.next_command_id += 1;
        id
    }

    pub fn push_frame(&mut self, frame: Frame, start: Instant) {
        self.prune_settled();
        let id = self.next_id();
        let receipt = self.proxy.queue_frame(id, self.client_id, frame, start);
        self.active.push(ActiveCommand { id, receipt });
    }

    pub fn push_timed_frame(&mut self, frame: Frame, start: Instant, deadline: Instant) {
        self.prune_settled();
        let id = self.next_id();
        let receipt = self
            .proxy
            .queue_timed_frame(id, self.client_id, frame, start, deadline);
        self.active.push(ActiveCommand { id, receipt });
    }

    pub fn push_layer_resize(
        &mut self,
        tree: Arc<LayerTree>,
        layer: LayerId,
        delta: RectDelta,
        start: Instant,
        deadline: Instant,
    ) {
        self.prune_settled();
        let id = self.next_id();
        let receipt = self
            .proxy
            .queue_layer_resize(id, self.client_id, tree, layer, delta, start, deadline);
        self.active.push(ActiveCommand { id, receipt });
    }

    pub fn push_layer_effect(
        &mut self,
        tree: Arc<LayerTree>,
        layer: LayerId,
        effect: LayerEffect,
        start: Instant,
        deadline: Instant,
    ) {
        self.prune_settled();
        let id = self.next_id();
        let receipt = self
            .proxy
            .queue_layer_effect(id, self.client_id, tree, layer, effect, start, deadline);
        self.active.push(ActiveCommand { id, receipt });
    }

    pub fn push_view_resize(&mut self, delta: RectDelta, start: Instant, deadline: Instant) {
        self.prune_settled();
        let id = self.next_id();
        let receipt = self
            .proxy
            .queue_view_resize(id, self.client_id, delta, start, deadline);
        self.active.push(ActiveCommand { id, receipt });
    }

    /// Cancels every outstanding command of this client as one inclusive
    /// id range. No-op when nothing is outstanding.
    pub fn cancel_current_jobs(&mut self) {
        if !self.busy() {
            return;
        }
        let start_id = self.active.first().map(|c| c.id).unwrap_or(0);
        let end_id = self.active.last().map(|c| c.id).unwrap_or(start_id);
        let id = self.next_id();
        let receipt = self.proxy.queue_cancel(id, self.client_id, start_id, end_id);
        self.active.push(ActiveCommand { id, receipt });
    }

    fn prune_settled(&mut self) {
        self.active.retain(|c| !c.receipt.is_settled());
    }

    /// True while any issued command has not settled.
    pub fn busy(&mut self) -> bool {
        self.prune_settled();
        !self.active.is_empty()
    }

    /// Receipt of the most recently issued command, if still outstanding.
    pub fn last_receipt(&self) -> Option<&CommandReceipt> {
        self.active.last().map(|c| &c.receipt)
    }
}
