//! PipeWire backend: ScreenCast portal session feeding a GStreamer appsink.
//!
//! ```text
//! ashpd portal ──► PipeWire node_id + remote fd
//!                        │
//!            pipewiresrc(fd, path) ! appsink(caps = negotiation_caps())
//!                        │ latest sample
//!                        ▼
//!   request_frame(slot) ──► copy into PoolRegion ──► Metadata, Done, Ready
//! ```
//!
//! PipeWire only produces a sample when the screen changes, so a request
//! with no new sample re-delivers the last one.

use std::os::fd::{AsRawFd, OwnedFd};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::PersistMode;
use ashpd::WindowIdentifier;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use tracing::{debug, info, trace};
use wlgrab_core::{BackendKind, CaptureConfig, CaptureError};

use super::format::{negotiation_caps, StreamFormat};
use super::memory::{PoolRegion, PortalShm};
use crate::backend::CaptureBackend;
use crate::protocol::{EventSink, FrameEventKind, FrameTarget, ScreencopyProtocol};
use crate::tick::TickScheduler;
use crate::{Candidate, ScreenCapture};

/// How long the probe waits for the stream's first sample.
const FIRST_SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Portal negotiation ────────────────────────────────────────────────────────

struct PortalStream {
    node_id: u32,
    remote:  OwnedFd,
}

/// Asks the XDG desktop portal for a monitor stream.
async fn negotiate_portal(output_index: usize, overlay_cursor: bool) -> anyhow::Result<PortalStream> {
    let proxy = Screencast::new().await.context("ScreenCast portal")?;

    let session = proxy.create_session().await.context("create_session")?;

    let cursor = if overlay_cursor { CursorMode::Embedded } else { CursorMode::Hidden };
    proxy
        .select_sources(
            &session,
            cursor,
            SourceType::Monitor.into(),
            false, // multiple
            None,  // restore_token
            PersistMode::DoNot,
        )
        .await
        .context("select_sources")?;

    let response = proxy
        .start(&session, &WindowIdentifier::default())
        .await
        .context("portal start")?
        .response()
        .context("portal denied")?;

    let streams = response.streams();
    let Some(stream) = streams.get(output_index).or_else(|| streams.first()) else {
        anyhow::bail!("No PipeWire streams returned by portal");
    };
    let node_id = stream.pipe_wire_node_id();

    let remote = proxy
        .open_pipe_wire_remote(&session)
        .await
        .context("open_pipe_wire_remote")?;

    Ok(PortalStream { node_id, remote })
}

fn portal_runtime() -> Result<tokio::runtime::Runtime, CaptureError> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// Frame handle: PipeWire has no per-request object.
#[derive(Debug)]
pub struct PipeWireFrame(FrameTarget);

pub struct PipeWireStream {
    pipeline: gstreamer::Pipeline,
    appsink:  AppSink,
    sink:     EventSink,
    last:     Option<gstreamer::Sample>,
    _remote:  OwnedFd,
    // Keeps the portal's D-Bus connection serviced for the session.
    _runtime: tokio::runtime::Runtime,
}

impl PipeWireStream {
    fn start(
        portal: PortalStream,
        sink: EventSink,
        runtime: tokio::runtime::Runtime,
    ) -> anyhow::Result<Self> {
        gstreamer::init().context("GStreamer init")?;

        let desc = format!(
            "pipewiresrc fd={} path={} do-timestamp=true \
             ! appsink name=sink max-buffers=1 drop=true sync=false emit-signals=false",
            portal.remote.as_raw_fd(),
            portal.node_id
        );
        debug!("GStreamer pipeline: {}", desc);

        let pipeline = gstreamer::parse::launch(&desc)
            .context("Parsing GStreamer pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("Expected Pipeline element"))?;

        let appsink: AppSink = pipeline
            .by_name("sink")
            .context("Finding appsink 'sink'")?
            .downcast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Expected AppSink"))?;
        let caps = gstreamer::Caps::from_str(&negotiation_caps()).context("Parsing stream caps")?;
        appsink.set_caps(Some(&caps));

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("GStreamer set Playing")?;

        Ok(Self { pipeline, appsink, sink, last: None, _remote: portal.remote, _runtime: runtime })
    }

    /// Surfaces pipeline errors and end-of-stream as protocol failures.
    fn check_bus(&self) -> Result<(), CaptureError> {
        let Some(bus) = self.pipeline.bus() else { return Ok(()) };
        let kinds = [gstreamer::MessageType::Error, gstreamer::MessageType::Eos];
        while let Some(msg) = bus.pop_filtered(&kinds) {
            match msg.view() {
                gstreamer::MessageView::Error(e) => {
                    return Err(CaptureError::protocol(format!("GStreamer error: {}", e.error())));
                }
                gstreamer::MessageView::Eos(_) => {
                    return Err(CaptureError::protocol("PipeWire stream ended"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Newest sample, waiting for the first one if none arrived yet.
    fn latest_sample(&mut self) -> Option<gstreamer::Sample> {
        let wait = if self.last.is_some() { Duration::ZERO } else { FIRST_SAMPLE_TIMEOUT };
        let timeout = gstreamer::ClockTime::from_mseconds(wait.as_millis() as u64);
        if let Some(sample) = self.appsink.try_pull_sample(timeout) {
            self.last = Some(sample);
        }
        self.last.clone()
    }

    fn fail(&self, target: FrameTarget, reason: String) {
        self.sink.push(target, FrameEventKind::Failed { reason });
    }
}

fn sample_format(sample: &gstreamer::Sample) -> Result<StreamFormat, CaptureError> {
    let caps = sample.caps().ok_or_else(|| CaptureError::protocol("sample without caps"))?;
    let structure = caps.structure(0).ok_or_else(|| CaptureError::protocol("empty sample caps"))?;
    let media_type: &str = structure.name();
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|e| CaptureError::protocol(format!("unreadable video caps: {e}")))?;
    let stride = u32::try_from(info.stride()[0])
        .map_err(|_| CaptureError::protocol("negative stride in video caps"))?;
    StreamFormat::parse(media_type, info.format().to_str(), info.width(), info.height(), stride)
}

fn copy_sample(sample: &gstreamer::Sample, region: &PoolRegion) -> Result<(), CaptureError> {
    let buffer = sample.buffer().ok_or_else(|| CaptureError::protocol("sample without buffer"))?;
    let map = buffer
        .map_readable()
        .map_err(|_| CaptureError::protocol("sample buffer is not readable"))?;
    region.fill(map.as_slice())
}

impl ScreencopyProtocol for PipeWireStream {
    type Buffer = PoolRegion;
    type Frame = PipeWireFrame;

    fn kind(&self) -> BackendKind {
        BackendKind::PipeWire
    }

    fn request_frame(
        &mut self,
        target: FrameTarget,
        buffer: Option<&PoolRegion>,
    ) -> Result<PipeWireFrame, CaptureError> {
        self.check_bus()?;
        if matches!(target, FrameTarget::Slot { .. }) && buffer.is_none() {
            return Err(CaptureError::protocol("slot capture requested without a buffer"));
        }

        let Some(sample) = self.latest_sample() else {
            self.fail(target, format!("no PipeWire frame within {FIRST_SAMPLE_TIMEOUT:?}"));
            return Ok(PipeWireFrame(target));
        };
        let reported = match sample_format(&sample) {
            Ok(format) => format.display_info(),
            Err(e) => {
                self.fail(target, e.to_string());
                return Ok(PipeWireFrame(target));
            }
        };
        self.sink.push(target, FrameEventKind::Metadata(reported));

        match buffer {
            None => self.sink.push(target, FrameEventKind::Done),
            // A mismatch was just reported as metadata; nothing is copied.
            Some(region) if region.info != reported => {}
            Some(region) => match copy_sample(&sample, region) {
                Ok(()) => {
                    self.sink.push(target, FrameEventKind::Done);
                    self.sink.push(target, FrameEventKind::Ready);
                }
                Err(e) => self.fail(target, e.to_string()),
            },
        }
        Ok(PipeWireFrame(target))
    }

    fn destroy_frame(&mut self, frame: PipeWireFrame) {
        trace!("Released PipeWire request {:?}", frame.0);
    }
}

impl Drop for PipeWireStream {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

// ── Candidate ─────────────────────────────────────────────────────────────────

pub struct PipeWireCandidate {
    sink:           EventSink,
    tick:           TickScheduler,
    buffer_count:   usize,
    output_index:   usize,
    overlay_cursor: bool,
}

impl PipeWireCandidate {
    pub(crate) fn new(sink: EventSink, tick: TickScheduler, config: &CaptureConfig) -> Self {
        Self {
            sink,
            tick,
            buffer_count: config.buffer_count,
            output_index: config.output_index,
            overlay_cursor: config.overlay_cursor,
        }
    }
}

impl Candidate for PipeWireCandidate {
    fn kind(&self) -> BackendKind {
        BackendKind::PipeWire
    }

    /// True when the ScreenCast portal answers on the session bus.
    fn detect_support(&self) -> bool {
        let runtime = match portal_runtime() {
            Ok(rt) => rt,
            Err(e) => {
                debug!("No runtime for portal probe: {}", e);
                return false;
            }
        };
        match runtime.block_on(Screencast::new()) {
            Ok(_) => true,
            Err(e) => {
                debug!("ScreenCast portal unavailable: {}", e);
                false
            }
        }
    }

    fn build(self: Box<Self>) -> Result<Box<dyn ScreenCapture>, CaptureError> {
        let Self { sink, tick, buffer_count, output_index, overlay_cursor } = *self;
        let runtime = portal_runtime()?;
        let portal = runtime
            .block_on(negotiate_portal(output_index, overlay_cursor))
            .map_err(|e| CaptureError::protocol(format!("{e:#}")))?;
        info!("PipeWire portal ok: node_id={} (output {})", portal.node_id, output_index);

        let stream = PipeWireStream::start(portal, sink, runtime)
            .map_err(|e| CaptureError::protocol(format!("{e:#}")))?;
        Ok(Box::new(CaptureBackend::new(stream, PortalShm, tick, buffer_count)))
    }
}
