//! In-memory stand-ins for the compositor, shm facility, tick source and
//! consumer, shared by the unit tests.

use std::cell::{Cell, Ref, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use wlgrab_core::{BackendKind, CaptureError, DisplayInfo};

use crate::allocator::{ShmPool, ShmProvider};
use crate::backend::CaptureBackend;
use crate::consumer::{CaptureConsumer, Frame};
use crate::protocol::{FrameEventKind, FrameTarget, ProtocolEvent, ScreencopyProtocol};
use crate::tick::{FrameTick, TickHandle};

pub(crate) const MOCK_KIND: BackendKind = BackendKind::WlrScreencopy;

// ── Protocol ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct MockFrame {
    id:     u32,
    target: FrameTarget,
}

#[derive(Debug, Default)]
pub(crate) struct ProtocolLog {
    pub requests:  Vec<(FrameTarget, Option<usize>)>,
    pub destroyed: Vec<(u32, FrameTarget)>,
    next_id:       u32,
}

impl ProtocolLog {
    pub fn destroyed_slot_frames(&self) -> usize {
        self.destroyed.iter().filter(|(_, t)| matches!(t, FrameTarget::Slot { .. })).count()
    }

    pub fn destroyed_probes(&self) -> usize {
        self.destroyed.iter().filter(|(_, t)| *t == FrameTarget::Probe).count()
    }
}

#[derive(Default)]
pub(crate) struct MockProtocol {
    pub log: Rc<RefCell<ProtocolLog>>,
}

impl ScreencopyProtocol for MockProtocol {
    type Buffer = MockBuffer;
    type Frame = MockFrame;

    fn kind(&self) -> BackendKind {
        MOCK_KIND
    }

    fn request_frame(
        &mut self,
        target: FrameTarget,
        buffer: Option<&MockBuffer>,
    ) -> Result<MockFrame, CaptureError> {
        let mut log = self.log.borrow_mut();
        log.next_id += 1;
        log.requests.push((target, buffer.map(|b| b.offset)));
        Ok(MockFrame { id: log.next_id, target })
    }

    fn destroy_frame(&mut self, frame: MockFrame) {
        let mut log = self.log.borrow_mut();
        assert!(
            log.destroyed.iter().all(|(id, _)| *id != frame.id),
            "frame {} destroyed twice",
            frame.id
        );
        log.destroyed.push((frame.id, frame.target));
    }
}

// ── Shared memory ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MockBuffer {
    pub offset: usize,
    pub info:   DisplayInfo,
}

pub(crate) struct VecPool {
    memory: Vec<u8>,
}

impl ShmPool for VecPool {
    type Buffer = MockBuffer;

    fn create_buffer(&mut self, offset: usize, info: &DisplayInfo) -> Result<MockBuffer, CaptureError> {
        Ok(MockBuffer { offset, info: *info })
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockShm {
    fail:      bool,
    pools:     Rc<Cell<usize>>,
    last_size: Rc<Cell<usize>>,
}

impl MockShm {
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn pools_created(&self) -> usize {
        self.pools.get()
    }

    pub fn last_pool_size(&self) -> usize {
        self.last_size.get()
    }
}

impl ShmProvider for MockShm {
    type Pool = VecPool;

    fn create_pool(&mut self, size: usize) -> Result<VecPool, CaptureError> {
        if self.fail {
            return Err(CaptureError::allocation("memfd_create: out of memory"));
        }
        self.pools.set(self.pools.get() + 1);
        self.last_size.set(size);
        Ok(VecPool { memory: vec![0; size] })
    }
}

// ── Tick ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct TickLog {
    pub active:  BTreeSet<u64>,
    pub adds:    usize,
    pub removes: usize,
    next:        u64,
}

#[derive(Default)]
pub(crate) struct MockTick {
    pub log:  Rc<RefCell<TickLog>>,
    pub fail: Rc<Cell<bool>>,
}

impl FrameTick for MockTick {
    fn add_frame_tick(&mut self) -> Result<TickHandle, CaptureError> {
        if self.fail.get() {
            return Err(CaptureError::TickRegistration { reason: "no frame callback".into() });
        }
        let mut log = self.log.borrow_mut();
        log.next += 1;
        log.adds += 1;
        let id = log.next;
        log.active.insert(id);
        Ok(TickHandle::new(id))
    }

    fn remove_frame_tick(&mut self, handle: TickHandle) -> Result<(), CaptureError> {
        let mut log = self.log.borrow_mut();
        if !log.active.remove(&handle.id()) {
            return Err(CaptureError::TickNotRegistered { handle: handle.id() });
        }
        log.removes += 1;
        Ok(())
    }
}

// ── Consumer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct FrameRecord {
    pub index:       u64,
    pub width:       u32,
    pub height:      u32,
    pub len:         usize,
    pub first_pixel: [u8; 4],
}

#[derive(Debug, Default)]
pub(crate) struct ConsumerLog {
    pub opened:      Vec<(u32, u32)>,
    pub open_errors: usize,
    pub frames:      Vec<FrameRecord>,
    pub fatal:       Vec<String>,
}

impl ConsumerLog {
    pub fn frame_indices(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.index).collect()
    }
}

pub(crate) struct RecordingConsumer {
    pub log: Rc<RefCell<ConsumerLog>>,
}

impl CaptureConsumer for RecordingConsumer {
    fn on_open(&mut self, width: u32, height: u32) {
        self.log.borrow_mut().opened.push((width, height));
    }

    fn on_open_error(&mut self, _error: &CaptureError) {
        self.log.borrow_mut().open_errors += 1;
    }

    fn on_frame(&mut self, frame: Frame<'_>) {
        let mut first_pixel = [0u8; 4];
        first_pixel.copy_from_slice(&frame.pixels[..4]);
        self.log.borrow_mut().frames.push(FrameRecord {
            index: frame.index,
            width: frame.width(),
            height: frame.height(),
            len: frame.pixels.len(),
            first_pixel,
        });
    }

    fn on_fatal(&mut self, error: &CaptureError) {
        self.log.borrow_mut().fatal.push(error.to_string());
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

pub(crate) type MockBackend = CaptureBackend<MockProtocol, MockShm, MockTick>;

pub(crate) struct Harness {
    pub backend:  MockBackend,
    pub shm:      MockShm,
    protocol_log: Rc<RefCell<ProtocolLog>>,
    tick_log:     Rc<RefCell<TickLog>>,
    tick_fail:    Rc<Cell<bool>>,
    consumer_log: Rc<RefCell<ConsumerLog>>,
}

impl Harness {
    pub fn new(buffer_count: usize) -> Self {
        Self::build(MockShm::default(), buffer_count)
    }

    pub fn with_failing_shm(buffer_count: usize) -> Self {
        Self::build(MockShm::failing(), buffer_count)
    }

    fn build(shm: MockShm, buffer_count: usize) -> Self {
        let protocol = MockProtocol::default();
        let tick = MockTick::default();
        let protocol_log = Rc::clone(&protocol.log);
        let tick_log = Rc::clone(&tick.log);
        let tick_fail = Rc::clone(&tick.fail);
        Self {
            backend: CaptureBackend::new(protocol, shm.clone(), tick, buffer_count),
            shm,
            protocol_log,
            tick_log,
            tick_fail,
            consumer_log: Rc::default(),
        }
    }

    pub fn consumer_box(&self) -> Box<dyn CaptureConsumer> {
        Box::new(RecordingConsumer { log: Rc::clone(&self.consumer_log) })
    }

    /// Requests open and answers the probe with `info`.
    pub fn open(&mut self, info: DisplayInfo) -> Result<(), CaptureError> {
        let consumer = self.consumer_box();
        self.backend.request_open(consumer)?;
        self.event(FrameTarget::Probe, FrameEventKind::Metadata(info))
    }

    pub fn event(&mut self, target: FrameTarget, kind: FrameEventKind) -> Result<(), CaptureError> {
        self.backend.handle_event(ProtocolEvent::new(target, kind))
    }

    pub fn consumer(&self) -> Ref<'_, ConsumerLog> {
        self.consumer_log.borrow()
    }

    pub fn protocol(&self) -> Ref<'_, ProtocolLog> {
        self.protocol_log.borrow()
    }

    pub fn protocol_log(&self) -> Rc<RefCell<ProtocolLog>> {
        Rc::clone(&self.protocol_log)
    }

    pub fn tick(&self) -> Ref<'_, TickLog> {
        self.tick_log.borrow()
    }

    pub fn tick_log(&self) -> Rc<RefCell<TickLog>> {
        Rc::clone(&self.tick_log)
    }

    pub fn tick_fails(&self, fail: bool) {
        self.tick_fail.set(fail);
    }
}
