//! `ext-image-copy-capture-v1` adapter.
//!
//! The session advertises buffer constraints once (`buffer_size`,
//! `shm_format`…, `done`) and again whenever they change. The probe is not a
//! protocol frame: it resolves as soon as the session's constraints are
//! known. Slot captures are session frames with an attached buffer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{Connection, Dispatch, QueueHandle};
use wayland_protocols::ext::image_capture_source::v1::client::{
    ext_image_capture_source_v1::ExtImageCaptureSourceV1,
    ext_output_image_capture_source_manager_v1::ExtOutputImageCaptureSourceManagerV1,
};
use wayland_protocols::ext::image_copy_capture::v1::client::{
    ext_image_copy_capture_frame_v1::{self, ExtImageCopyCaptureFrameV1},
    ext_image_copy_capture_manager_v1::{self, ExtImageCopyCaptureManagerV1},
    ext_image_copy_capture_session_v1::{self, ExtImageCopyCaptureSessionV1},
};
use wlgrab_core::{BackendKind, CaptureError, DisplayInfo, PixelFormat};

use super::shm::{WlShmBuffer, WlShmProvider};
use super::{choose_offer, pixel_format, SessionParts, WaylandState};
use crate::backend::CaptureBackend;
use crate::protocol::{EventSink, FrameEventKind, FrameTarget, ScreencopyProtocol};
use crate::{Candidate, ScreenCapture};

// ── Session constraints ───────────────────────────────────────────────────────

/// Constraints collected from session events, shared with the dispatch glue.
#[derive(Debug, Default)]
pub struct SessionInfo {
    size:          Option<(u32, u32)>,
    formats:       Vec<PixelFormat>,
    /// Constraints from the latest `done`.
    current:       Option<DisplayInfo>,
    probe_pending: bool,
    stopped:       bool,
}

impl SessionInfo {
    /// Resolves the pending constraint batch into buffer geometry. Rows are
    /// always tightly packed.
    fn resolve(&mut self) -> Option<DisplayInfo> {
        let (width, height) = self.size?;
        let format = choose_offer(&self.formats, |f| *f)?;
        self.formats.clear();
        // An overflowing row saturates so negotiation rejects it.
        let stride = format.row_bytes(width).unwrap_or(u32::MAX);
        let info = DisplayInfo { width, height, stride, format };
        self.current = Some(info);
        Some(info)
    }
}

type SharedInfo = Arc<Mutex<SessionInfo>>;

fn lock(info: &SharedInfo) -> MutexGuard<'_, SessionInfo> {
    info.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Adapter ───────────────────────────────────────────────────────────────────

/// Frame handle: the probe holds no protocol object.
pub enum ExtFrame {
    Probe,
    Capture(ExtImageCopyCaptureFrameV1),
}

pub struct ExtImageCopy {
    source:  ExtImageCaptureSourceV1,
    session: ExtImageCopyCaptureSessionV1,
    info:    SharedInfo,
    sink:    EventSink,
    qh:      QueueHandle<WaylandState>,
}

impl ExtImageCopy {
    /// Creates the capture source and session for `output`.
    pub fn new(
        manager: &ExtImageCopyCaptureManagerV1,
        sources: &ExtOutputImageCaptureSourceManagerV1,
        output: &WlOutput,
        qh: QueueHandle<WaylandState>,
        sink: EventSink,
        overlay_cursor: bool,
    ) -> Self {
        let options = if overlay_cursor {
            ext_image_copy_capture_manager_v1::Options::PaintCursors
        } else {
            ext_image_copy_capture_manager_v1::Options::empty()
        };
        let info = SharedInfo::default();
        let source = sources.create_source(output, &qh, ());
        let session = manager.create_session(&source, options, &qh, Arc::clone(&info));
        Self { source, session, info, sink, qh }
    }
}

impl ScreencopyProtocol for ExtImageCopy {
    type Buffer = WlShmBuffer;
    type Frame = ExtFrame;

    fn kind(&self) -> BackendKind {
        BackendKind::ExtImageCopyCapture
    }

    fn request_frame(
        &mut self,
        target: FrameTarget,
        buffer: Option<&WlShmBuffer>,
    ) -> Result<ExtFrame, CaptureError> {
        let mut info = lock(&self.info);
        if info.stopped {
            return Err(CaptureError::protocol("capture session stopped"));
        }

        match (target, buffer) {
            (FrameTarget::Probe, _) => {
                match info.current {
                    Some(current) => {
                        self.sink.push(target, FrameEventKind::Metadata(current));
                        self.sink.push(target, FrameEventKind::Done);
                    }
                    None => info.probe_pending = true,
                }
                Ok(ExtFrame::Probe)
            }
            (FrameTarget::Slot { .. }, Some(buffer)) => {
                if let Some(current) = info.current {
                    self.sink.push(target, FrameEventKind::Metadata(current));
                }
                let frame = self.session.create_frame(&self.qh, target);
                frame.attach_buffer(&buffer.wl_buffer);
                let (w, h) = (buffer.info.width as i32, buffer.info.height as i32);
                frame.damage_buffer(0, 0, w, h);
                frame.capture();
                Ok(ExtFrame::Capture(frame))
            }
            (FrameTarget::Slot { .. }, None) => {
                Err(CaptureError::protocol("slot capture requested without a buffer"))
            }
        }
    }

    fn destroy_frame(&mut self, frame: ExtFrame) {
        match frame {
            ExtFrame::Probe => lock(&self.info).probe_pending = false,
            ExtFrame::Capture(frame) => frame.destroy(),
        }
    }
}

impl Drop for ExtImageCopy {
    fn drop(&mut self) {
        self.session.destroy();
        self.source.destroy();
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

impl Dispatch<ExtImageCopyCaptureSessionV1, SharedInfo> for WaylandState {
    fn event(
        state: &mut Self,
        _session: &ExtImageCopyCaptureSessionV1,
        event: ext_image_copy_capture_session_v1::Event,
        data: &SharedInfo,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use ext_image_copy_capture_session_v1::Event;

        let mut info = lock(data);
        match event {
            Event::BufferSize { width, height } => info.size = Some((width, height)),
            Event::ShmFormat { format } => info.formats.push(pixel_format(format)),
            Event::Done => {
                let resolved = info.resolve();
                trace!("ext session constraints: {:?}", resolved);
                if !info.probe_pending {
                    return;
                }
                info.probe_pending = false;
                match resolved {
                    Some(current) => {
                        state.sink.push(FrameTarget::Probe, FrameEventKind::Metadata(current));
                        state.sink.push(FrameTarget::Probe, FrameEventKind::Done);
                    }
                    None => state.sink.push(FrameTarget::Probe, FrameEventKind::Failed {
                        reason: "session advertised no shm buffer constraints".into(),
                    }),
                }
            }
            Event::Stopped => {
                warn!("ext-image-copy-capture session stopped by compositor");
                info.stopped = true;
                if info.probe_pending {
                    info.probe_pending = false;
                    state.sink.push(FrameTarget::Probe, FrameEventKind::Failed {
                        reason: "capture session stopped".into(),
                    });
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<ExtImageCopyCaptureFrameV1, FrameTarget> for WaylandState {
    fn event(
        state: &mut Self,
        _frame: &ExtImageCopyCaptureFrameV1,
        event: ext_image_copy_capture_frame_v1::Event,
        target: &FrameTarget,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use ext_image_copy_capture_frame_v1::Event;

        match event {
            Event::Ready => state.sink.push(*target, FrameEventKind::Ready),
            Event::Failed { reason } => state.sink.push(*target, FrameEventKind::Failed {
                reason: format!("{reason:?}"),
            }),
            _ => {}
        }
    }
}

// ── Candidate ─────────────────────────────────────────────────────────────────

pub struct ExtCandidate {
    parts:   SessionParts,
    manager: Option<ExtImageCopyCaptureManagerV1>,
    sources: Option<ExtOutputImageCaptureSourceManagerV1>,
}

impl ExtCandidate {
    pub(crate) fn new(
        parts: SessionParts,
        manager: Option<ExtImageCopyCaptureManagerV1>,
        sources: Option<ExtOutputImageCaptureSourceManagerV1>,
    ) -> Self {
        Self { parts, manager, sources }
    }
}

impl Candidate for ExtCandidate {
    fn kind(&self) -> BackendKind {
        BackendKind::ExtImageCopyCapture
    }

    fn detect_support(&self) -> bool {
        self.manager.is_some() && self.sources.is_some() && self.parts.has_basics()
    }

    fn build(self: Box<Self>) -> Result<Box<dyn ScreenCapture>, CaptureError> {
        let Self { parts, manager, sources } = *self;
        let (Some(manager), Some(sources), Some(output), Some(shm)) =
            (manager, sources, parts.output, parts.shm)
        else {
            return Err(CaptureError::NoSupportedBackend);
        };
        debug!("Building ext-image-copy-capture backend ({} buffers)", parts.buffer_count);
        let protocol = ExtImageCopy::new(
            &manager,
            &sources,
            &output,
            parts.qh.clone(),
            parts.sink,
            parts.overlay_cursor,
        );
        let shm = WlShmProvider::new(shm, parts.qh);
        Ok(Box::new(CaptureBackend::new(protocol, shm, parts.tick, parts.buffer_count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_packed_geometry_with_preferred_format() {
        let mut info = SessionInfo {
            size: Some((1280, 720)),
            formats: vec![PixelFormat::Argb8888, PixelFormat::Xrgb8888],
            ..Default::default()
        };
        let resolved = info.resolve().unwrap();
        assert_eq!(resolved, DisplayInfo::packed(1280, 720));
        assert_eq!(info.current, Some(resolved));
        assert!(info.formats.is_empty());
    }

    #[test]
    fn unresolved_without_size_or_formats() {
        let mut info = SessionInfo { formats: vec![PixelFormat::Xrgb8888], ..Default::default() };
        assert_eq!(info.resolve(), None);

        let mut info = SessionInfo { size: Some((8, 8)), ..Default::default() };
        assert_eq!(info.resolve(), None);
        assert_eq!(info.current, None);
    }

    #[test]
    fn overflowing_width_does_not_wrap() {
        let mut info = SessionInfo {
            size: Some((u32::MAX / 2, 1)),
            formats: vec![PixelFormat::Xrgb8888],
            ..Default::default()
        };
        let resolved = info.resolve().unwrap();
        assert_eq!(resolved.stride, u32::MAX);
        assert!(matches!(resolved.validate(), Err(CaptureError::ProtocolFailed { .. })));
    }

    #[test]
    fn unsupported_only_offer_is_reported_as_is() {
        let mut info = SessionInfo {
            size: Some((64, 64)),
            formats: vec![PixelFormat::Abgr8888],
            ..Default::default()
        };
        let resolved = info.resolve().unwrap();
        assert_eq!(resolved.format, PixelFormat::Abgr8888);
        assert!(resolved.validate().is_err());
    }
}
