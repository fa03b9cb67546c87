//! Generic capture backend: session state machine + slot table.
//!
//! ```text
//!   tick ──► lowest Idle slot ──► request_frame ──► Requested
//!                                                     │
//!              Metadata / Done (validated) ◄──────────┤
//!                                                     │ Ready
//!                                                     ▼
//!          on_frame (ascending frame_index) ◄──── Filled ──► Idle
//! ```
//!
//! The backend is protocol-agnostic: both screencopy variants plug in through
//! [`ScreencopyProtocol`]. Everything runs on the single dispatch thread, so
//! no state here is locked.

use tracing::{debug, error, info, warn};
use wlgrab_core::{BackendKind, CaptureError, DisplayInfo, SessionState, SlotId};

use crate::allocator::{BufferAllocator, BufferId, ShmPool, ShmProvider};
use crate::consumer::{CaptureConsumer, Frame};
use crate::protocol::{FrameEventKind, FrameTarget, ProtocolEvent, ScreencopyProtocol};
use crate::state::StateWatch;
use crate::tick::{FrameTick, TickHandle};

// ── Slots ─────────────────────────────────────────────────────────────────────

enum SlotState<F> {
    Idle,
    Requested { frame_index: u64, frame: F },
    Filled { frame_index: u64 },
}

struct Slot<F> {
    buffer: BufferId,
    state:  SlotState<F>,
}

impl<F> Slot<F> {
    fn frame_index(&self) -> Option<u64> {
        match self.state {
            SlotState::Idle => None,
            SlotState::Requested { frame_index, .. } | SlotState::Filled { frame_index } => {
                Some(frame_index)
            }
        }
    }
}

/// Observable state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Requested { frame_index: u64 },
    Filled { frame_index: u64 },
}

// ── CaptureBackend ────────────────────────────────────────────────────────────

pub struct CaptureBackend<P, S, T>
where
    S: ShmProvider,
    P: ScreencopyProtocol<Buffer = <S::Pool as ShmPool>::Buffer>,
    T: FrameTick,
{
    protocol:     P,
    shm:          S,
    tick:         T,
    buffer_count: usize,
    state:        SessionState,
    watch:        StateWatch,
    consumer:     Option<Box<dyn CaptureConsumer>>,
    probe:        Option<P::Frame>,
    info:         Option<DisplayInfo>,
    allocator:    Option<BufferAllocator<S::Pool>>,
    slots:        Vec<Slot<P::Frame>>,
    tick_handle:  Option<TickHandle>,
    next_index:   u64,
}

impl<P, S, T> CaptureBackend<P, S, T>
where
    S: ShmProvider,
    P: ScreencopyProtocol<Buffer = <S::Pool as ShmPool>::Buffer>,
    T: FrameTick,
{
    pub fn new(protocol: P, shm: S, tick: T, buffer_count: usize) -> Self {
        Self {
            protocol,
            shm,
            tick,
            buffer_count: buffer_count.max(1),
            state: SessionState::Uninitialized,
            watch: StateWatch::new(SessionState::Uninitialized),
            consumer: None,
            probe: None,
            info: None,
            allocator: None,
            slots: Vec::new(),
            tick_handle: None,
            next_index: 0,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn kind(&self) -> BackendKind {
        self.protocol.kind()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn watch(&self) -> StateWatch {
        self.watch.clone()
    }

    /// Negotiated output geometry, once open.
    pub fn display_info(&self) -> Option<DisplayInfo> {
        self.info
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_status(&self, slot: SlotId) -> Option<SlotStatus> {
        self.slots.get(slot.index()).map(|s| match s.state {
            SlotState::Idle => SlotStatus::Idle,
            SlotState::Requested { frame_index, .. } => SlotStatus::Requested { frame_index },
            SlotState::Filled { frame_index } => SlotStatus::Filled { frame_index },
        })
    }

    /// Number of capture requests currently outstanding with the protocol.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Requested { .. }))
            .count()
    }

    pub fn tick_registered(&self) -> bool {
        self.tick_handle.is_some()
    }

    // ── Session operations ───────────────────────────────────────────────────

    /// Starts negotiation by issuing the probe capture.
    pub fn request_open(&mut self, consumer: Box<dyn CaptureConsumer>) -> Result<(), CaptureError> {
        if self.state != SessionState::Uninitialized {
            return Err(CaptureError::invalid_state("request_open", self.state));
        }
        self.consumer = Some(consumer);
        self.set_state(SessionState::InitPending);

        match self.protocol.request_frame(FrameTarget::Probe, None) {
            Ok(frame) => {
                debug!("{} probe frame requested", self.protocol.kind());
                self.probe = Some(frame);
                Ok(())
            }
            Err(e) => self.fail_init(e),
        }
    }

    pub fn pause(&mut self) -> Result<(), CaptureError> {
        if self.state != SessionState::Open {
            return Err(CaptureError::invalid_state("pause", self.state));
        }
        if let Err(e) = self.unregister_tick() {
            return self.fatal(e);
        }
        let discarded = self.cancel_all();
        debug!("Paused, discarded {} pending frame(s)", discarded);
        self.set_state(SessionState::Paused);
        Ok(())
    }

    pub fn unpause(&mut self) -> Result<(), CaptureError> {
        if self.state != SessionState::Paused {
            return Err(CaptureError::invalid_state("unpause", self.state));
        }
        match self.tick.add_frame_tick() {
            Ok(handle) => {
                self.tick_handle = Some(handle);
                self.set_state(SessionState::Open);
                Ok(())
            }
            Err(e) => self.fatal(CaptureError::TickRegistration { reason: e.to_string() }),
        }
    }

    /// Ends the session, destroying any in-flight frames before the pool is
    /// released.
    pub fn close(&mut self) -> Result<(), CaptureError> {
        if !matches!(self.state, SessionState::Open | SessionState::Paused) {
            return Err(CaptureError::invalid_state("close", self.state));
        }
        if let Err(e) = self.unregister_tick() {
            warn!("Removing frame tick on close: {}", e);
        }
        self.release_pool();
        self.set_state(SessionState::Closed);
        info!("{} capture session closed", self.protocol.kind());
        Ok(())
    }

    /// Frame-tick handler: issues one capture into the lowest free slot.
    pub fn on_tick(&mut self) -> Result<(), CaptureError> {
        if self.state != SessionState::Open {
            return Err(CaptureError::invalid_state("tick", self.state));
        }
        let Some(idx) = self.slots.iter().position(|s| matches!(s.state, SlotState::Idle)) else {
            return self.fatal(CaptureError::NoFreeSlot);
        };
        let Some(allocator) = self.allocator.as_ref() else {
            return self.fatal(CaptureError::protocol("open session without a buffer pool"));
        };

        let frame_index = self.next_index;
        let target = FrameTarget::Slot { slot: SlotId(idx), frame_index };
        let buffer = allocator.buffer(self.slots[idx].buffer);

        match self.protocol.request_frame(target, Some(buffer)) {
            Ok(frame) => {
                self.next_index += 1;
                self.slots[idx].state = SlotState::Requested { frame_index, frame };
                Ok(())
            }
            Err(e) => self.fatal(e),
        }
    }

    /// Applies one protocol event.
    pub fn handle_event(&mut self, event: ProtocolEvent) -> Result<(), CaptureError> {
        match event.target {
            FrameTarget::Probe => self.handle_probe_event(event.kind),
            FrameTarget::Slot { slot, frame_index } => {
                self.handle_slot_event(slot, frame_index, event.kind)
            }
        }
    }

    // ── Negotiation ──────────────────────────────────────────────────────────

    fn handle_probe_event(&mut self, kind: FrameEventKind) -> Result<(), CaptureError> {
        if self.state != SessionState::InitPending || self.probe.is_none() {
            debug!("Ignoring probe event {:?} in state {}", kind, self.state);
            return Ok(());
        }
        match kind {
            FrameEventKind::Metadata(info) => self.negotiate(info),
            FrameEventKind::Done => Ok(()),
            FrameEventKind::Ready => {
                self.destroy_probe();
                self.fail_init(CaptureError::protocol("probe completed without buffer metadata"))
            }
            FrameEventKind::Failed { reason } => {
                self.destroy_probe();
                self.fail_init(CaptureError::ProtocolFailed { reason })
            }
        }
    }

    fn negotiate(&mut self, info: DisplayInfo) -> Result<(), CaptureError> {
        self.destroy_probe();
        if let Err(e) = info.validate() {
            return self.fail_init(e);
        }

        let frame_size = info.frame_size();
        let Some(pool_size) = frame_size.checked_mul(self.buffer_count) else {
            return self.fail_init(CaptureError::allocation(format!(
                "{} buffers of {frame_size} bytes overflow the pool size",
                self.buffer_count
            )));
        };
        let mut allocator =
            match BufferAllocator::init(pool_size, frame_size, &mut self.shm) {
                Ok(a) => a,
                Err(e) => return self.fail_init(e),
            };
        let mut slots = Vec::with_capacity(self.buffer_count);
        for _ in 0..self.buffer_count {
            match allocator.create(&info) {
                Ok(buffer) => slots.push(Slot { buffer, state: SlotState::Idle }),
                Err(e) => return self.fail_init(e),
            }
        }
        let handle = match self.tick.add_frame_tick() {
            Ok(h) => h,
            Err(e) => {
                return self.fail_init(CaptureError::TickRegistration { reason: e.to_string() })
            }
        };

        self.info = Some(info);
        self.allocator = Some(allocator);
        self.slots = slots;
        self.tick_handle = Some(handle);
        self.set_state(SessionState::Open);
        info!(
            "{} capture open: {} with {} buffers",
            self.protocol.kind(),
            info,
            self.buffer_count
        );
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.on_open(info.width, info.height);
        }
        Ok(())
    }

    fn destroy_probe(&mut self) {
        if let Some(frame) = self.probe.take() {
            self.protocol.destroy_frame(frame);
        }
    }

    fn fail_init(&mut self, err: CaptureError) -> Result<(), CaptureError> {
        error!("{} negotiation failed: {}", self.protocol.kind(), err);
        self.set_state(SessionState::InitFailed);
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.on_open_error(&err);
        }
        Err(err)
    }

    // ── Slot events ──────────────────────────────────────────────────────────

    fn handle_slot_event(
        &mut self,
        slot: SlotId,
        frame_index: u64,
        kind: FrameEventKind,
    ) -> Result<(), CaptureError> {
        let current = self.slots.get(slot.index()).and_then(|s| match s.state {
            SlotState::Requested { frame_index, .. } => Some(frame_index),
            _ => None,
        });
        if self.state != SessionState::Open || current != Some(frame_index) {
            debug!(
                "Ignoring stale event {:?} for {} frame {} (state {})",
                kind, slot, frame_index, self.state
            );
            return Ok(());
        }

        match kind {
            FrameEventKind::Metadata(reported) => {
                if Some(reported) != self.info {
                    let negotiated = self.info.map(|i| i.to_string()).unwrap_or_default();
                    return self.fatal(CaptureError::FormatChanged {
                        reason: format!("negotiated {negotiated}, frame {frame_index} reports {reported}"),
                    });
                }
                Ok(())
            }
            FrameEventKind::Done => Ok(()),
            FrameEventKind::Ready => {
                self.retire(slot, Some(frame_index));
                self.deliver_ready();
                Ok(())
            }
            FrameEventKind::Failed { reason } => {
                warn!("{} capture of frame {} failed: {}", slot, frame_index, reason);
                self.retire(slot, None);
                self.fatal(CaptureError::ProtocolFailed { reason })
            }
        }
    }

    /// Destroys a slot's frame handle after its terminal event, leaving the
    /// slot `Filled` (success) or `Idle` (failure).
    fn retire(&mut self, slot: SlotId, filled: Option<u64>) {
        let next = match filled {
            Some(frame_index) => SlotState::Filled { frame_index },
            None => SlotState::Idle,
        };
        let prev = std::mem::replace(&mut self.slots[slot.index()].state, next);
        if let SlotState::Requested { frame, .. } = prev {
            self.protocol.destroy_frame(frame);
        }
    }

    /// Hands filled slots to the consumer in ascending frame order, stopping
    /// at the first older request that is still in flight.
    fn deliver_ready(&mut self) {
        loop {
            let oldest = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.frame_index().map(|f| (f, i)))
                .min();
            let Some((frame_index, idx)) = oldest else { break };
            if !matches!(self.slots[idx].state, SlotState::Filled { .. }) {
                break;
            }

            if let (Some(consumer), Some(allocator), Some(info)) =
                (self.consumer.as_mut(), self.allocator.as_ref(), self.info)
            {
                consumer.on_frame(Frame {
                    info,
                    index: frame_index,
                    slot: SlotId(idx),
                    pixels: allocator.mapped(self.slots[idx].buffer),
                });
            }
            self.slots[idx].state = SlotState::Idle;
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Destroys every in-flight frame and drops unread ones. Returns how many
    /// slots were not idle.
    fn cancel_all(&mut self) -> usize {
        let mut discarded = 0;
        for slot in &mut self.slots {
            match std::mem::replace(&mut slot.state, SlotState::Idle) {
                SlotState::Idle => {}
                SlotState::Requested { frame, .. } => {
                    self.protocol.destroy_frame(frame);
                    discarded += 1;
                }
                SlotState::Filled { .. } => discarded += 1,
            }
        }
        discarded
    }

    /// Cancels every slot, then drops the slot table and the pool.
    fn release_pool(&mut self) {
        self.cancel_all();
        self.slots.clear();
        self.allocator = None;
    }

    fn unregister_tick(&mut self) -> Result<(), CaptureError> {
        match self.tick_handle.take() {
            Some(handle) => self.tick.remove_frame_tick(handle),
            None => Ok(()),
        }
    }

    fn fatal(&mut self, err: CaptureError) -> Result<(), CaptureError> {
        error!("{} capture session failed: {}", self.protocol.kind(), err);
        if let Err(e) = self.unregister_tick() {
            warn!("Removing frame tick after failure: {}", e);
        }
        self.release_pool();
        self.set_state(SessionState::FatalError);
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.on_fatal(&err);
        }
        Err(err)
    }

    fn set_state(&mut self, next: SessionState) {
        debug!("Session state {} → {}", self.state, next);
        self.state = next;
        self.watch.set(next);
    }

    #[cfg(test)]
    pub(crate) fn slot_memory_mut(&mut self, slot: SlotId) -> Option<&mut [u8]> {
        let buffer = self.slots.get(slot.index())?.buffer;
        Some(self.allocator.as_mut()?.mapped_mut(buffer))
    }
}

impl<P, S, T> Drop for CaptureBackend<P, S, T>
where
    S: ShmProvider,
    P: ScreencopyProtocol<Buffer = <S::Pool as ShmPool>::Buffer>,
    T: FrameTick,
{
    fn drop(&mut self) {
        self.destroy_probe();
        self.cancel_all();
        if let Some(handle) = self.tick_handle.take() {
            let _ = self.tick.remove_frame_tick(handle);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
