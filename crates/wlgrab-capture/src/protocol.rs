//! Protocol seam between the generic capture backend and a concrete
//! compositor screencopy protocol.
//!
//! Requests flow backend → [`ScreencopyProtocol`]; events flow back as typed
//! [`ProtocolEvent`]s, queued by the protocol's dispatch glue in an
//! [`EventSink`] and fed to the backend by the event loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use wlgrab_core::{BackendKind, CaptureError, DisplayInfo, SlotId};

/// Which request a protocol event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTarget {
    /// The negotiation frame; only its metadata is used.
    Probe,
    /// A capture into a pool slot.
    Slot { slot: SlotId, frame_index: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEventKind {
    /// Buffer geometry and format the compositor will write.
    Metadata(DisplayInfo),
    /// All metadata for the frame has been announced.
    Done,
    /// Terminal: the buffer holds a complete frame.
    Ready,
    /// Terminal: the capture failed.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEvent {
    pub target: FrameTarget,
    pub kind:   FrameEventKind,
}

impl ProtocolEvent {
    pub fn new(target: FrameTarget, kind: FrameEventKind) -> Self {
        Self { target, kind }
    }
}

/// Request side of a compositor capture protocol.
pub trait ScreencopyProtocol {
    /// Buffer handle the protocol copies into.
    type Buffer;
    /// In-flight frame handle, owned by the protocol until its terminal event.
    type Frame;

    fn kind(&self) -> BackendKind;

    /// Starts a capture for `target`. `buffer` is `None` for the probe.
    fn request_frame(
        &mut self,
        target: FrameTarget,
        buffer: Option<&Self::Buffer>,
    ) -> Result<Self::Frame, CaptureError>;

    /// Releases a frame handle. Called exactly once per handle.
    fn destroy_frame(&mut self, frame: Self::Frame);
}

// ── EventSink ─────────────────────────────────────────────────────────────────

/// FIFO of protocol events shared between dispatch glue and the event loop.
///
/// Single-threaded: lives on the dispatch thread only.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    queue: Rc<RefCell<VecDeque<ProtocolEvent>>>,
}

impl EventSink {
    pub fn push(&self, target: FrameTarget, kind: FrameEventKind) {
        self.queue.borrow_mut().push_back(ProtocolEvent::new(target, kind));
    }

    pub fn pop(&self) -> Option<ProtocolEvent> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}
