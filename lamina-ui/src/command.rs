//! Compositor commands and their completion channels.
//!
//! Every unit of work travelling from a client proxy to the scheduler is a
//! [`CompositorCommand`]: a sum type the scheduler pattern-matches once per
//! dispatch. Commands carry a [`CommandHeader`] with the client-scoped id,
//! lane and packet ids stamped at submit time, a priority, a schedule
//! (timestamp plus optional deadline) and a one-shot status channel.
//!
//! Outcomes propagate exclusively through the status channel as a
//! [`CommandStatus`]; no error crosses a thread boundary as a panic.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::canvas::Frame;
use crate::client::ViewRenderTarget;
use crate::layer::{LayerEffect, LayerId, LayerTree};

/// Terminal status of a command, delivered through its status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Executed (or deliberately skipped as a no-op).
    Ok,
    /// Dropped: cancelled, shutdown, or unroutable.
    Failed,
    /// Backend could not act yet; the client may retry next frame.
    Delayed,
}

/// Scheduling priority carried by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    High,
}

/// When a command was issued and, optionally, when it should run.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub timestamp: Instant,
    pub deadline: Option<Instant>,
}

impl Schedule {
    /// Immediate schedule: issue time only, no deadline.
    pub fn immediate(now: Instant) -> Self {
        Self {
            timestamp: now,
            deadline: None,
        }
    }

    /// Deadline schedule: run at `deadline` (or immediately if already late).
    pub fn with_deadline(now: Instant, deadline: Instant) -> Self {
        Self {
            timestamp: now,
            deadline: Some(deadline),
        }
    }
}

/// Sending half of a command's one-shot status channel.
///
/// The channel resolves exactly once; later resolutions are ignored.
pub struct StatusSender {
    tx: Option<Sender<CommandStatus>>,
}

impl StatusSender {
    pub fn resolve(&mut self, status: CommandStatus) {
        if let Some(tx) = self.tx.take() {
            // A dropped receipt is fine; the outcome is then observable only
            // through diagnostics.
            let _ = tx.send(status);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

/// Awaitable handle to a command's terminal status.
pub struct CommandReceipt {
    rx: Receiver<CommandStatus>,
    settled: Mutex<Option<CommandStatus>>,
}

impl CommandReceipt {
    /// Non-blocking status probe. Caches the first delivered value.
    pub fn status(&self) -> Option<CommandStatus> {
        let mut settled = self.settled.lock();
        if settled.is_none()
            && let Ok(status) = self.rx.try_recv()
        {
            *settled = Some(status);
        }
        *settled
    }

    /// Blocks until the command settles. A severed channel (scheduler gone)
    /// reads as `Failed`.
    pub fn wait(&self) -> CommandStatus {
        let mut settled = self.settled.lock();
        if let Some(status) = *settled {
            return status;
        }
        let status = self.rx.recv().unwrap_or(CommandStatus::Failed);
        *settled = Some(status);
        status
    }

    pub fn is_settled(&self) -> bool {
        self.status().is_some()
    }
}

/// Creates the one-shot status pair for a new command.
pub fn status_channel() -> (StatusSender, CommandReceipt) {
    let (tx, rx) = bounded(1);
    (
        StatusSender { tx: Some(tx) },
        CommandReceipt {
            rx,
            settled: Mutex::new(None),
        },
    )
}

/// Header shared by every command variant.
pub struct CommandHeader {
    /// Monotonic id within the issuing client.
    pub id: u32,
    /// Identity of the issuing client, scoping cancel ranges.
    pub client_id: u64,
    /// Sync lane, stamped at submit.
    pub lane_id: u64,
    /// Sync packet, stamped at submit.
    pub packet_id: u64,
    pub priority: Priority,
    pub schedule: Schedule,
    pub status: StatusSender,
}

impl CommandHeader {
    pub fn new(id: u32, client_id: u64, priority: Priority, schedule: Schedule) -> (Self, CommandReceipt) {
        let (status, receipt) = status_channel();
        (
            Self {
                id,
                client_id,
                lane_id: 0,
                packet_id: 0,
                priority,
                schedule,
                status,
            },
            receipt,
        )
    }
}

/// Signed rect delta applied by resize commands.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RectDelta {
    pub dx: f32,
    pub dy: f32,
    pub dw: f32,
    pub dh: f32,
}

/// The unit of scheduler dispatch.
pub enum CompositorCommand {
    /// Draw one frame into a layer of a render target.
    Render {
        header: CommandHeader,
        target: Arc<ViewRenderTarget>,
        frame: Frame,
    },
    /// Apply a rect delta to a layer.
    LayerResize {
        header: CommandHeader,
        target: Arc<ViewRenderTarget>,
        tree: Arc<LayerTree>,
        layer: LayerId,
        delta: RectDelta,
    },
    /// Apply a shadow or transformation to a layer's visual.
    LayerEffect {
        header: CommandHeader,
        target: Arc<ViewRenderTarget>,
        tree: Arc<LayerTree>,
        layer: LayerId,
        effect: LayerEffect,
    },
    /// Apply a rect delta to the view's root surface.
    ViewResize {
        header: CommandHeader,
        target: Arc<ViewRenderTarget>,
        delta: RectDelta,
    },
    /// Remove queued commands of the issuing client in `[start_id, end_id]`.
    Cancel {
        header: CommandHeader,
        start_id: u32,
        end_id: u32,
    },
    /// Atomic group of commands recorded in one record window.
    Packet {
        header: CommandHeader,
        commands: Vec<CompositorCommand>,
    },
}

impl CompositorCommand {
    pub fn header(&self) -> &CommandHeader {
        match self {
            Self::Render { header, .. }
            | Self::LayerResize { header, .. }
            | Self::LayerEffect { header, .. }
            | Self::ViewResize { header, .. }
            | Self::Cancel { header, .. }
            | Self::Packet { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut CommandHeader {
        match self {
            Self::Render { header, .. }
            | Self::LayerResize { header, .. }
            | Self::LayerEffect { header, .. }
            | Self::ViewResize { header, .. }
            | Self::Cancel { header, .. }
            | Self::Packet { header, .. } => header,
        }
    }

    /// Stamps lane and packet ids on this command (and, for packets, on
    /// every inner command).
    pub fn stamp(&mut self, lane_id: u64, packet_id: u64) {
        {
            let header = self.header_mut();
            header.lane_id = lane_id;
            header.packet_id = packet_id;
        }
        if let Self::Packet { commands, .. } = self {
            for command in commands {
                command.stamp(lane_id, packet_id);
            }
        }
    }

    /// Resolves this command's status channel; a packet also resolves every
    /// unresolved inner command.
    pub fn resolve(&mut self, status: CommandStatus) {
        if let Self::Packet { commands, .. } = self {
            for command in commands {
                command.resolve(status);
            }
        }
        self.header_mut().status.resolve(status);
    }

    /// Queue-ordering class: view resizes first, then cancels, then the rest.
    pub fn class_rank(&self) -> u8 {
        match self {
            Self::ViewResize { .. } => 0,
            Self::Cancel { .. } => 1,
            _ => 2,
        }
    }
}
