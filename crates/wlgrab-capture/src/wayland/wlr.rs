//! `wlr-screencopy-unstable-v1` adapter.
//!
//! Every capture, the probe included, is a fresh `zwlr_screencopy_frame_v1`.
//! The compositor lists its buffer offers, closes the list with
//! `buffer_done`, and only then does the client attach a buffer with `copy`.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, trace};
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{Connection, Dispatch, QueueHandle};
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_frame_v1::{self, ZwlrScreencopyFrameV1};
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1;
use wlgrab_core::{BackendKind, CaptureError, DisplayInfo};

use super::shm::{WlShmBuffer, WlShmProvider};
use super::{choose_offer, pixel_format, SessionParts, WaylandState};
use crate::backend::CaptureBackend;
use crate::protocol::{FrameEventKind, FrameTarget, ScreencopyProtocol};
use crate::{Candidate, ScreenCapture};

// ── Adapter ───────────────────────────────────────────────────────────────────

pub struct WlrScreencopy {
    manager:        ZwlrScreencopyManagerV1,
    output:         WlOutput,
    qh:             QueueHandle<WaylandState>,
    overlay_cursor: bool,
}

impl WlrScreencopy {
    pub fn new(
        manager: ZwlrScreencopyManagerV1,
        output: WlOutput,
        qh: QueueHandle<WaylandState>,
        overlay_cursor: bool,
    ) -> Self {
        Self { manager, output, qh, overlay_cursor }
    }
}

impl ScreencopyProtocol for WlrScreencopy {
    type Buffer = WlShmBuffer;
    type Frame = ZwlrScreencopyFrameV1;

    fn kind(&self) -> BackendKind {
        BackendKind::WlrScreencopy
    }

    fn request_frame(
        &mut self,
        target: FrameTarget,
        buffer: Option<&WlShmBuffer>,
    ) -> Result<ZwlrScreencopyFrameV1, CaptureError> {
        if matches!(target, FrameTarget::Slot { .. }) && buffer.is_none() {
            return Err(CaptureError::protocol("slot capture requested without a buffer"));
        }
        let data = WlrFrameData { target, buffer: buffer.cloned(), offers: Mutex::default() };
        Ok(self.manager.capture_output(i32::from(self.overlay_cursor), &self.output, &self.qh, data))
    }

    fn destroy_frame(&mut self, frame: ZwlrScreencopyFrameV1) {
        frame.destroy();
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Per-frame user data.
pub struct WlrFrameData {
    target: FrameTarget,
    /// Destination for slot captures; `None` for the probe.
    buffer: Option<WlShmBuffer>,
    offers: Mutex<Vec<DisplayInfo>>,
}

impl Dispatch<ZwlrScreencopyFrameV1, WlrFrameData> for WaylandState {
    fn event(
        state: &mut Self,
        frame: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        data: &WlrFrameData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use zwlr_screencopy_frame_v1::Event;

        let target = data.target;
        match event {
            Event::Buffer { format, width, height, stride } => {
                let offer = DisplayInfo { width, height, stride, format: pixel_format(format) };
                trace!("wlr offer for {:?}: {}", target, offer);
                data.offers.lock().unwrap_or_else(PoisonError::into_inner).push(offer);
            }
            Event::BufferDone => {
                let offers = std::mem::take(&mut *data.offers.lock().unwrap_or_else(PoisonError::into_inner));
                let Some(chosen) = choose_offer(&offers, |o| o.format) else {
                    state.sink.push(target, FrameEventKind::Failed {
                        reason: "compositor offered no shm buffer".into(),
                    });
                    return;
                };
                state.sink.push(target, FrameEventKind::Metadata(chosen));
                state.sink.push(target, FrameEventKind::Done);

                // A mismatching slot buffer is left uncopied; the backend
                // rejects the metadata and tears the frame down.
                if let Some(buffer) = data.buffer.as_ref().filter(|b| b.info == chosen) {
                    frame.copy(&buffer.wl_buffer);
                }
            }
            Event::Ready { .. } => state.sink.push(target, FrameEventKind::Ready),
            Event::Failed => state.sink.push(target, FrameEventKind::Failed {
                reason: "zwlr_screencopy_frame_v1.failed".into(),
            }),
            _ => {}
        }
    }
}

// ── Candidate ─────────────────────────────────────────────────────────────────

pub struct WlrCandidate {
    parts:   SessionParts,
    manager: Option<ZwlrScreencopyManagerV1>,
}

impl WlrCandidate {
    pub(crate) fn new(parts: SessionParts, manager: Option<ZwlrScreencopyManagerV1>) -> Self {
        Self { parts, manager }
    }
}

impl Candidate for WlrCandidate {
    fn kind(&self) -> BackendKind {
        BackendKind::WlrScreencopy
    }

    fn detect_support(&self) -> bool {
        self.manager.is_some() && self.parts.has_basics()
    }

    fn build(self: Box<Self>) -> Result<Box<dyn ScreenCapture>, CaptureError> {
        let Self { parts, manager } = *self;
        let (Some(manager), Some(output), Some(shm)) = (manager, parts.output, parts.shm) else {
            return Err(CaptureError::NoSupportedBackend);
        };
        debug!("Building wlr-screencopy backend ({} buffers)", parts.buffer_count);
        let protocol = WlrScreencopy::new(manager, output, parts.qh.clone(), parts.overlay_cursor);
        let shm = WlShmProvider::new(shm, parts.qh);
        Ok(Box::new(CaptureBackend::new(protocol, shm, parts.tick, parts.buffer_count)))
    }
}
