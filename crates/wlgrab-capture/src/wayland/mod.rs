//! Wayland glue: registry binding, `wl_shm` pools, the screencopy protocol
//! adapters and the dispatch loop that drives a [`ScreenCapture`] session.
//!
//! ```text
//! ┌─────────────── capture thread ────────────────┐
//! │ EventQueue<WaylandState>                      │
//! │   ├─ registry  → Globals                      │
//! │   ├─ frames    → EventSink (ProtocolEvent)    │
//! │   └─ sessions  → EventSink (probe metadata)   │
//! │                                               │
//! │ run_capture_loop: poll ▸ dispatch ▸ drain     │
//! │                   ▸ tick ▸ control commands   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! [`ScreenCapture`]: crate::ScreenCapture

mod event_loop;
mod shm;

#[cfg(feature = "ext")]
mod ext;
#[cfg(feature = "wlr")]
mod wlr;

use tracing::debug;
use wayland_client::protocol::{wl_buffer, wl_output, wl_registry, wl_shm, wl_shm_pool};
use wayland_client::{delegate_noop, Connection, Dispatch, QueueHandle, WEnum};
use wlgrab_core::{CaptureConfig, PixelFormat};

use crate::protocol::EventSink;
use crate::tick::TickScheduler;
use crate::Candidate;

pub use event_loop::{run_capture_loop, Control};
pub use shm::{WlShmBuffer, WlShmPoolMemory, WlShmProvider};

#[cfg(feature = "ext")]
pub use ext::{ExtCandidate, ExtFrame, ExtImageCopy};
#[cfg(feature = "wlr")]
pub use wlr::{WlrCandidate, WlrScreencopy};

#[cfg(feature = "ext")]
use wayland_protocols::ext::image_capture_source::v1::client::{
    ext_image_capture_source_v1::ExtImageCaptureSourceV1,
    ext_output_image_capture_source_manager_v1::ExtOutputImageCaptureSourceManagerV1,
};
#[cfg(feature = "ext")]
use wayland_protocols::ext::image_copy_capture::v1::client::ext_image_copy_capture_manager_v1::ExtImageCopyCaptureManagerV1;
#[cfg(feature = "wlr")]
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1;

/// Lowest `zwlr_screencopy_manager_v1` version with `buffer_done`.
#[cfg(feature = "wlr")]
const WLR_MIN_VERSION: u32 = 3;

// ── Globals ───────────────────────────────────────────────────────────────────

/// Globals bound from the registry during the initial roundtrip.
#[derive(Debug, Default)]
pub struct Globals {
    pub outputs: Vec<wl_output::WlOutput>,
    pub shm:     Option<wl_shm::WlShm>,
    #[cfg(feature = "wlr")]
    pub wlr_manager: Option<ZwlrScreencopyManagerV1>,
    #[cfg(feature = "ext")]
    pub ext_manager: Option<ExtImageCopyCaptureManagerV1>,
    #[cfg(feature = "ext")]
    pub ext_sources: Option<ExtOutputImageCaptureSourceManagerV1>,
}

/// Dispatch state for the capture event queue.
#[derive(Debug, Default)]
pub struct WaylandState {
    pub globals: Globals,
    /// Protocol events waiting to be fed to the capture backend.
    pub sink:    EventSink,
}

impl Dispatch<wl_registry::WlRegistry, ()> for WaylandState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let wl_registry::Event::Global { name, interface, version } = event else { return };
        let globals = &mut state.globals;
        match interface.as_str() {
            "wl_output" => {
                globals.outputs.push(registry.bind(name, version.min(4), qh, ()));
            }
            "wl_shm" => {
                globals.shm = Some(registry.bind(name, version.min(1), qh, ()));
            }
            #[cfg(feature = "wlr")]
            "zwlr_screencopy_manager_v1" => {
                if version < WLR_MIN_VERSION {
                    debug!("Skipping zwlr_screencopy_manager_v1 v{} (need v{})", version, WLR_MIN_VERSION);
                    return;
                }
                globals.wlr_manager = Some(registry.bind(name, version.min(WLR_MIN_VERSION), qh, ()));
            }
            #[cfg(feature = "ext")]
            "ext_image_copy_capture_manager_v1" => {
                globals.ext_manager = Some(registry.bind(name, version.min(1), qh, ()));
            }
            #[cfg(feature = "ext")]
            "ext_output_image_capture_source_manager_v1" => {
                globals.ext_sources = Some(registry.bind(name, version.min(1), qh, ()));
            }
            _ => return,
        }
        debug!("Bound {} v{}", interface, version);
    }
}

delegate_noop!(WaylandState: ignore wl_output::WlOutput);
delegate_noop!(WaylandState: ignore wl_shm::WlShm);
delegate_noop!(WaylandState: ignore wl_buffer::WlBuffer);
delegate_noop!(WaylandState: wl_shm_pool::WlShmPool);

#[cfg(feature = "wlr")]
delegate_noop!(WaylandState: ZwlrScreencopyManagerV1);
#[cfg(feature = "ext")]
delegate_noop!(WaylandState: ExtImageCopyCaptureManagerV1);
#[cfg(feature = "ext")]
delegate_noop!(WaylandState: ExtOutputImageCaptureSourceManagerV1);
#[cfg(feature = "ext")]
delegate_noop!(WaylandState: ExtImageCaptureSourceV1);

// ── Candidates ────────────────────────────────────────────────────────────────

/// What every backend variant needs besides its protocol manager.
#[derive(Clone)]
pub(crate) struct SessionParts {
    pub qh:             QueueHandle<WaylandState>,
    pub shm:            Option<wl_shm::WlShm>,
    pub output:         Option<wl_output::WlOutput>,
    pub sink:           EventSink,
    pub tick:           TickScheduler,
    pub buffer_count:   usize,
    pub overlay_cursor: bool,
}

impl SessionParts {
    fn has_basics(&self) -> bool {
        self.shm.is_some() && self.output.is_some()
    }
}

/// Every backend variant compiled in, ready for [`crate::select_backend`].
pub fn candidates(
    state: &WaylandState,
    qh: &QueueHandle<WaylandState>,
    tick: &TickScheduler,
    config: &CaptureConfig,
) -> Vec<Box<dyn Candidate>> {
    let output = state.globals.outputs.get(config.output_index).cloned();
    if output.is_none() {
        debug!(
            "Output {} not advertised ({} output(s) available)",
            config.output_index,
            state.globals.outputs.len()
        );
    }
    let parts = SessionParts {
        qh: qh.clone(),
        shm: state.globals.shm.clone(),
        output,
        sink: state.sink.clone(),
        tick: tick.clone(),
        buffer_count: config.buffer_count,
        overlay_cursor: config.overlay_cursor,
    };

    let mut list: Vec<Box<dyn Candidate>> = Vec::new();
    #[cfg(feature = "ext")]
    list.push(Box::new(ExtCandidate::new(
        parts.clone(),
        state.globals.ext_manager.clone(),
        state.globals.ext_sources.clone(),
    )));
    #[cfg(feature = "wlr")]
    list.push(Box::new(WlrCandidate::new(parts.clone(), state.globals.wlr_manager.clone())));
    #[cfg(feature = "pipewire")]
    list.push(Box::new(crate::pipewire::PipeWireCandidate::new(
        parts.sink.clone(),
        parts.tick.clone(),
        config,
    )));
    drop(parts);
    list
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub(crate) fn pixel_format(format: WEnum<wl_shm::Format>) -> PixelFormat {
    match format {
        WEnum::Value(f) => PixelFormat::from_shm_code(f.into()),
        WEnum::Unknown(code) => PixelFormat::from_shm_code(code),
    }
}

/// Picks the supported format among the compositor's offers, falling back
/// to the first offer so negotiation can report what was rejected.
pub(crate) fn choose_offer<T: Copy>(offers: &[T], format_of: impl Fn(&T) -> PixelFormat) -> Option<T> {
    offers
        .iter()
        .find(|o| format_of(*o).is_supported())
        .or_else(|| offers.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_supported_offer() {
        let offers = [PixelFormat::Argb8888, PixelFormat::Xbgr8888, PixelFormat::Xrgb8888];
        assert_eq!(choose_offer(&offers, |f| *f), Some(PixelFormat::Xrgb8888));
    }

    #[test]
    fn falls_back_to_first_offer() {
        let offers = [PixelFormat::Abgr8888, PixelFormat::Argb8888];
        assert_eq!(choose_offer(&offers, |f| *f), Some(PixelFormat::Abgr8888));
        assert_eq!(choose_offer::<PixelFormat>(&[], |f| *f), None);
    }

    #[test]
    fn maps_wire_formats() {
        assert_eq!(pixel_format(WEnum::Value(wl_shm::Format::Xrgb8888)), PixelFormat::Xrgb8888);
        assert_eq!(pixel_format(WEnum::Value(wl_shm::Format::Argb8888)), PixelFormat::Argb8888);
        assert_eq!(pixel_format(WEnum::Value(wl_shm::Format::Xbgr8888)), PixelFormat::Xbgr8888);
        assert_eq!(pixel_format(WEnum::Unknown(0xdead)), PixelFormat::Other(0xdead));
    }
}
