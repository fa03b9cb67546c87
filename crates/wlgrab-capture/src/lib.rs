//! wlgrab-capture: frame-buffer lifecycle and backend abstraction for
//! Wayland screen capture.
//!
//! # Capture backends
//!
//! | Backend | Protocol | Preference |
//! |---------|----------|------------|
//! | ext-image-copy-capture | `ext_image_copy_capture_manager_v1` | 1st |
//! | wlr-screencopy | `zwlr_screencopy_manager_v1` | 2nd |
//! | PipeWire (`pipewire` feature) | ScreenCast portal via ashpd + GStreamer | 3rd |
//!
//! All of them speak to the same generic [`CaptureBackend`], which owns the
//! shm buffer pool and the slot table, and are exposed through the
//! backend-agnostic [`ScreenCapture`] trait.
//!
//! # Architecture
//!
//! ```text
//! event loop ──tick──► ScreenCapture::on_tick ──► request_frame(slot)
//!      │                                               │
//!      │            compositor writes into wl_shm ◄────┘
//!      ▼
//! dispatch ──► EventSink ──► ScreenCapture::handle_event
//!                                   │ Ready (ascending index)
//!                                   ▼
//!                       CaptureConsumer::on_frame(&pixels)
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # #[cfg(target_os = "linux")]
//! # fn example(consumer: Box<dyn wlgrab_capture::CaptureConsumer>) -> anyhow::Result<()> {
//! use wlgrab_capture::wayland::{run_capture_loop, Control};
//! use wlgrab_core::CaptureConfig;
//!
//! let (_control_tx, control_rx) = std::sync::mpsc::channel::<Control>();
//! let (watch_tx, _watch_rx) = tokio::sync::oneshot::channel();
//! run_capture_loop(&CaptureConfig::default(), consumer, control_rx, watch_tx)?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod backend;
pub mod consumer;
pub mod protocol;
pub mod state;
pub mod tick;

#[cfg(target_os = "linux")]
pub mod pipewire;
#[cfg(target_os = "linux")]
pub mod wayland;

#[cfg(test)]
mod testing;

use tracing::{debug, info};
use wlgrab_core::{BackendKind, CaptureError, SessionState};

pub use allocator::{BufferAllocator, BufferId, ShmPool, ShmProvider};
pub use backend::{CaptureBackend, SlotStatus};
pub use consumer::{CaptureConsumer, Frame};
pub use protocol::{EventSink, FrameEventKind, FrameTarget, ProtocolEvent, ScreencopyProtocol};
pub use state::StateWatch;
pub use tick::{FrameTick, TickHandle, TickScheduler};

// ── ScreenCapture ─────────────────────────────────────────────────────────────

/// Backend-agnostic capture session.
pub trait ScreenCapture {
    fn backend_kind(&self) -> BackendKind;

    fn request_open(&mut self, consumer: Box<dyn CaptureConsumer>) -> Result<(), CaptureError>;

    /// Non-blocking read of the session state.
    fn state(&self) -> SessionState;

    /// Snapshot handle other threads can poll.
    fn state_watch(&self) -> StateWatch;

    fn pause(&mut self) -> Result<(), CaptureError>;

    fn unpause(&mut self) -> Result<(), CaptureError>;

    fn close(&mut self) -> Result<(), CaptureError>;

    /// Frame-tick entry point, called by the event loop.
    fn on_tick(&mut self) -> Result<(), CaptureError>;

    /// Protocol event entry point, called by the event loop.
    fn handle_event(&mut self, event: ProtocolEvent) -> Result<(), CaptureError>;
}

impl<P, S, T> ScreenCapture for CaptureBackend<P, S, T>
where
    S: ShmProvider,
    P: ScreencopyProtocol<Buffer = <S::Pool as ShmPool>::Buffer>,
    T: FrameTick,
{
    fn backend_kind(&self) -> BackendKind {
        self.kind()
    }

    fn request_open(&mut self, consumer: Box<dyn CaptureConsumer>) -> Result<(), CaptureError> {
        CaptureBackend::request_open(self, consumer)
    }

    fn state(&self) -> SessionState {
        CaptureBackend::state(self)
    }

    fn state_watch(&self) -> StateWatch {
        self.watch()
    }

    fn pause(&mut self) -> Result<(), CaptureError> {
        CaptureBackend::pause(self)
    }

    fn unpause(&mut self) -> Result<(), CaptureError> {
        CaptureBackend::unpause(self)
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        CaptureBackend::close(self)
    }

    fn on_tick(&mut self) -> Result<(), CaptureError> {
        CaptureBackend::on_tick(self)
    }

    fn handle_event(&mut self, event: ProtocolEvent) -> Result<(), CaptureError> {
        CaptureBackend::handle_event(self, event)
    }
}

// ── Backend selection ─────────────────────────────────────────────────────────

/// A backend variant that may or may not be usable on the running
/// compositor.
pub trait Candidate {
    fn kind(&self) -> BackendKind;

    /// Whether every global this variant needs is present.
    fn detect_support(&self) -> bool;

    fn build(self: Box<Self>) -> Result<Box<dyn ScreenCapture>, CaptureError>;
}

/// Builds the first supported candidate in [`BackendKind::PREFERENCE`] order,
/// or only `forced` when set.
pub fn select_backend(
    mut candidates: Vec<Box<dyn Candidate>>,
    forced: Option<BackendKind>,
) -> Result<Box<dyn ScreenCapture>, CaptureError> {
    let order: &[BackendKind] = match &forced {
        Some(kind) => std::slice::from_ref(kind),
        None => &BackendKind::PREFERENCE,
    };

    for kind in order {
        let Some(pos) = candidates.iter().position(|c| c.kind() == *kind) else {
            debug!("No {} candidate compiled in", kind);
            continue;
        };
        let candidate = candidates.swap_remove(pos);
        if candidate.detect_support() {
            info!("Selected capture backend: {}", kind);
            return candidate.build();
        }
        debug!("Capture backend {} not supported by compositor", kind);
    }
    Err(CaptureError::NoSupportedBackend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProtocol, MockShm, MockTick};

    struct FakeCandidate {
        kind:      BackendKind,
        supported: bool,
    }

    impl Candidate for FakeCandidate {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn detect_support(&self) -> bool {
            self.supported
        }

        fn build(self: Box<Self>) -> Result<Box<dyn ScreenCapture>, CaptureError> {
            let backend =
                CaptureBackend::new(MockProtocol::default(), MockShm::default(), MockTick::default(), 2);
            Ok(Box::new(backend))
        }
    }

    fn candidates(ext: bool, wlr: bool) -> Vec<Box<dyn Candidate>> {
        // Deliberately listed in reverse preference order.
        vec![
            Box::new(FakeCandidate { kind: BackendKind::WlrScreencopy, supported: wlr }),
            Box::new(FakeCandidate { kind: BackendKind::ExtImageCopyCapture, supported: ext }),
        ]
    }

    fn selected(ext: bool, wlr: bool, forced: Option<BackendKind>) -> Option<SessionState> {
        select_backend(candidates(ext, wlr), forced).ok().map(|c| c.state())
    }

    #[test]
    fn picks_first_supported_in_preference_order() {
        struct Tagged(BackendKind);
        impl Candidate for Tagged {
            fn kind(&self) -> BackendKind {
                self.0
            }
            fn detect_support(&self) -> bool {
                true
            }
            fn build(self: Box<Self>) -> Result<Box<dyn ScreenCapture>, CaptureError> {
                Err(CaptureError::ConfigurationInvalid { reason: self.0.to_string() })
            }
        }

        let list: Vec<Box<dyn Candidate>> = vec![
            Box::new(Tagged(BackendKind::WlrScreencopy)),
            Box::new(Tagged(BackendKind::ExtImageCopyCapture)),
        ];
        match select_backend(list, None) {
            Err(CaptureError::ConfigurationInvalid { reason }) => {
                assert_eq!(reason, "ext-image-copy-capture")
            }
            _ => panic!("expected the ext candidate to be built"),
        }
    }

    #[test]
    fn falls_back_when_preferred_is_unsupported() {
        assert_eq!(selected(false, true, None), Some(SessionState::Uninitialized));
        assert_eq!(selected(false, false, None), None);
    }

    #[test]
    fn portal_is_tried_after_both_protocols() {
        let mut list = candidates(false, false);
        list.insert(0, Box::new(FakeCandidate { kind: BackendKind::PipeWire, supported: true }));
        let capture = select_backend(list, None).expect("portal fallback");
        assert_eq!(capture.state(), SessionState::Uninitialized);

        let mut list = candidates(false, true);
        list.insert(0, Box::new(FakeCandidate { kind: BackendKind::PipeWire, supported: false }));
        assert!(select_backend(list, None).is_ok());
    }

    #[test]
    fn forced_backend_is_the_only_one_probed() {
        assert_eq!(selected(true, false, Some(BackendKind::WlrScreencopy)), None);
        assert!(selected(true, false, Some(BackendKind::ExtImageCopyCapture)).is_some());
        assert!(matches!(
            select_backend(Vec::new(), None),
            Err(CaptureError::NoSupportedBackend)
        ));
    }

    #[test]
    fn facade_forwards_to_backend() {
        let mut capture: Box<dyn ScreenCapture> = Box::new(CaptureBackend::new(
            MockProtocol::default(),
            MockShm::default(),
            MockTick::default(),
            2,
        ));
        assert_eq!(capture.backend_kind(), crate::testing::MOCK_KIND);
        assert!(matches!(capture.pause(), Err(CaptureError::InvalidState { .. })));
        let watch = capture.state_watch();
        assert_eq!(watch.get(), SessionState::Uninitialized);
    }
}
