//! `Recorder`: runs one capture session and consumes its frames.
//!
//! ```text
//! wlgrab-capture thread                      tokio runtime
//! ─────────────────────────────────         ─────────────────────────────
//! run_capture_loop                           Recorder::run
//!   └─ FrameForwarder ──frames (bounded)──►    ├─ FrameStats
//!                     ──events (unbounded)─►   ├─ lifecycle logging
//!                  ◄──── Control ───────────   └─ Ctrl-C / max_frames → Stop
//! ```
//!
//! Pixels are copied out of the shared-memory slot inside the consumer
//! callback, so the capture slot is free again before the frame crosses the
//! channel. When the channel is full the frame is dropped and counted.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use wlgrab_capture::wayland::{run_capture_loop, Control};
use wlgrab_capture::{CaptureConsumer, Frame, StateWatch};
use wlgrab_core::{CaptureError, SessionState};

use crate::config::RecorderConfig;

// ── Frames & events ───────────────────────────────────────────────────────────

/// An owned copy of one captured frame.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub index:  u64,
    pub width:  u32,
    pub height: u32,
    pub stride: u32,
    pub data:   Bytes,
}

/// Session lifecycle notifications from the capture thread.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Opened { width: u32, height: u32 },
    OpenFailed(String),
    Fatal(String),
}

// ── FrameForwarder ────────────────────────────────────────────────────────────

/// [`CaptureConsumer`] that forwards frames to the recorder task without
/// ever blocking the dispatch thread.
pub struct FrameForwarder {
    frames_tx: mpsc::Sender<CapturedFrame>,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    dropped:   Arc<AtomicU64>,
}

impl FrameForwarder {
    pub fn new(
        frames_tx: mpsc::Sender<CapturedFrame>,
        events_tx: mpsc::UnboundedSender<CaptureEvent>,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self { frames_tx, events_tx, dropped }
    }
}

impl CaptureConsumer for FrameForwarder {
    fn on_open(&mut self, width: u32, height: u32) {
        let _ = self.events_tx.send(CaptureEvent::Opened { width, height });
    }

    fn on_open_error(&mut self, error: &CaptureError) {
        let _ = self.events_tx.send(CaptureEvent::OpenFailed(error.to_string()));
    }

    fn on_frame(&mut self, frame: Frame<'_>) {
        let captured = CapturedFrame {
            index:  frame.index,
            width:  frame.width(),
            height: frame.height(),
            stride: frame.stride(),
            data:   Bytes::copy_from_slice(frame.pixels),
        };
        match self.frames_tx.try_send(captured) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(f)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 || total % 100 == 0 {
                    warn!("Recorder behind, dropped frame {} ({} total)", f.index, total);
                }
            }
            Err(mpsc::error::TrySendError::Closed(f)) => {
                debug!("Recorder gone, discarding frame {}", f.index);
            }
        }
    }

    fn on_fatal(&mut self, error: &CaptureError) {
        let _ = self.events_tx.send(CaptureEvent::Fatal(error.to_string()));
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Live recorder status, logged once per second.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderStatus {
    pub state:   SessionState,
    /// Frames received by the recorder.
    pub frames:  u64,
    /// Frames dropped because the recorder fell behind.
    pub dropped: u64,
    pub fps:     f32,
}

impl std::fmt::Display for RecorderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "state={} frames={} dropped={} fps={:.1}",
            self.state, self.frames, self.dropped, self.fps
        )
    }
}

/// Frame counter with a rolling ~1 second FPS window.
#[derive(Debug)]
pub struct FrameStats {
    total:        u64,
    last_index:   Option<u64>,
    window_count: u32,
    window_start: Instant,
    last_fps:     f32,
}

impl FrameStats {
    pub fn new(now: Instant) -> Self {
        Self { total: 0, last_index: None, window_count: 0, window_start: now, last_fps: 0.0 }
    }

    pub fn record(&mut self, frame: &CapturedFrame) {
        if let Some(prev) = self.last_index {
            if frame.index <= prev {
                warn!("Frame {} arrived after frame {}", frame.index, prev);
            }
        }
        let expected = frame.stride as usize * frame.height as usize;
        if frame.data.len() != expected {
            warn!(
                "Frame {} is {} bytes, expected {} for {}×{}",
                frame.index,
                frame.data.len(),
                expected,
                frame.width,
                frame.height
            );
        }
        self.last_index = Some(frame.index);
        self.total += 1;
        self.window_count += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// FPS over the last window; starts a new window once ≥0.5 s elapsed.
    pub fn fps(&mut self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f32();
        if elapsed >= 0.5 {
            self.last_fps = self.window_count as f32 / elapsed;
            self.window_count = 0;
            self.window_start = now;
        }
        self.last_fps
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

pub struct Recorder {
    config: RecorderConfig,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    /// Captures until Ctrl-C, `max_frames`, or the session ends.
    pub async fn run(self) -> Result<RecorderStatus> {
        let (frames_tx, frames_rx) = mpsc::channel::<CapturedFrame>(self.config.channel_depth);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<CaptureEvent>();
        let (control_tx, control_rx) = std_mpsc::channel::<Control>();
        let (watch_tx, watch_rx) = oneshot::channel::<StateWatch>();
        let dropped = Arc::new(AtomicU64::new(0));

        let forwarder = FrameForwarder::new(frames_tx, events_tx, Arc::clone(&dropped));
        let capture_cfg = self.config.capture.clone();
        let handle = std::thread::Builder::new()
            .name("wlgrab-capture".to_owned())
            .spawn(move || run_capture_loop(&capture_cfg, Box::new(forwarder), control_rx, watch_tx))
            .context("spawning capture thread")?;

        // The sender is dropped without a value when setup fails before a
        // backend is selected; the thread's error is reported below.
        let watch = watch_rx.await.ok();

        let status = match watch {
            Some(watch) => {
                let mut channels = Channels { frames_rx, events_rx };
                channels
                    .drive(&control_tx, &watch, &dropped, self.config.max_frames, shutdown_signal())
                    .await
            }
            None => RecorderStatus {
                state:   SessionState::Uninitialized,
                frames:  0,
                dropped: 0,
                fps:     0.0,
            },
        };

        let outcome = tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("joining capture thread")?
            .map_err(|_| anyhow!("capture thread panicked"))?;
        outcome.context("capture session failed")?;

        info!("Recorder finished: {}", status);
        Ok(status)
    }
}

/// Receiving ends of the capture thread's channels.
pub(crate) struct Channels {
    frames_rx: mpsc::Receiver<CapturedFrame>,
    events_rx: mpsc::UnboundedReceiver<CaptureEvent>,
}

impl Channels {
    /// Consumes frames and events until the capture thread hangs up,
    /// sending [`Control::Stop`] on `shutdown` or after `max_frames`.
    pub(crate) async fn drive(
        &mut self,
        control_tx: &std_mpsc::Sender<Control>,
        watch: &StateWatch,
        dropped: &AtomicU64,
        max_frames: Option<u64>,
        shutdown: impl Future<Output = ()>,
    ) -> RecorderStatus {
        tokio::pin!(shutdown);
        let mut stats = FrameStats::new(Instant::now());
        let mut status_ticker = tokio::time::interval(Duration::from_secs(1));
        let mut stop_sent = false;

        loop {
            tokio::select! {
                _ = &mut shutdown, if !stop_sent => {
                    request_stop(control_tx, &mut stop_sent, "interrupted");
                }

                maybe_frame = self.frames_rx.recv() => {
                    let Some(frame) = maybe_frame else {
                        debug!("Capture thread closed the frame channel");
                        break;
                    };
                    stats.record(&frame);
                    if max_frames.is_some_and(|max| stats.total() >= max) {
                        request_stop(control_tx, &mut stop_sent, "frame limit reached");
                    }
                }

                Some(event) = self.events_rx.recv() => match event {
                    CaptureEvent::Opened { width, height } => {
                        info!("Capturing {}×{}", width, height);
                    }
                    CaptureEvent::OpenFailed(reason) => error!("Capture failed to open: {}", reason),
                    CaptureEvent::Fatal(reason) => error!("Capture session failed: {}", reason),
                },

                _ = status_ticker.tick() => {
                    let status = RecorderStatus {
                        state:   watch.get(),
                        frames:  stats.total(),
                        dropped: dropped.load(Ordering::Relaxed),
                        fps:     stats.fps(Instant::now()),
                    };
                    info!("{}", status);
                }
            }
        }

        RecorderStatus {
            state:   watch.get(),
            frames:  stats.total(),
            dropped: dropped.load(Ordering::Relaxed),
            fps:     stats.fps(Instant::now()),
        }
    }
}

fn request_stop(control_tx: &std_mpsc::Sender<Control>, stop_sent: &mut bool, why: &str) {
    if *stop_sent {
        return;
    }
    info!("Stopping capture: {}", why);
    // The loop may already be gone; nothing to stop then.
    let _ = control_tx.send(Control::Stop);
    *stop_sent = true;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
