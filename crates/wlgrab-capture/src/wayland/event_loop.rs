//! Dispatch loop for one capture session.
//!
//! Runs on a dedicated thread. Each iteration flushes outgoing requests,
//! waits for the Wayland socket (bounded by the next tick deadline), feeds
//! queued protocol events to the backend, then fires the frame tick if due.

use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use wayland_client::{Connection, EventQueue};
use wlgrab_core::{CaptureConfig, SessionState};

use super::{candidates, WaylandState};
use crate::consumer::CaptureConsumer;
use crate::state::StateWatch;
use crate::tick::TickScheduler;
use crate::{select_backend, ScreenCapture};

/// Upper bound on one socket wait, so control commands are noticed while
/// the tick is disarmed.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Commands accepted by a running capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Stop,
}

/// Connects to the compositor, selects a backend and captures until the
/// session ends or [`Control::Stop`] arrives.
///
/// The session's [`StateWatch`] is sent on `watch_tx` once a backend is
/// selected. Returns an error when the session ends in `InitFailed` or
/// `FatalError`.
pub fn run_capture_loop(
    config: &CaptureConfig,
    consumer: Box<dyn CaptureConsumer>,
    control_rx: mpsc::Receiver<Control>,
    watch_tx: oneshot::Sender<StateWatch>,
) -> anyhow::Result<()> {
    config.validate()?;

    let conn = Connection::connect_to_env().context("Failed to connect to Wayland display")?;
    let mut queue: EventQueue<WaylandState> = conn.new_event_queue();
    let qh = queue.handle();
    let mut state = WaylandState::default();

    conn.display().get_registry(&qh, ());
    queue.roundtrip(&mut state).context("Wayland registry roundtrip failed")?;
    info!(
        "Wayland globals: {} output(s), wl_shm {}",
        state.globals.outputs.len(),
        if state.globals.shm.is_some() { "present" } else { "missing" }
    );

    let tick = TickScheduler::from_fps(config.target_fps);
    let mut capture = select_backend(candidates(&state, &qh, &tick, config), config.backend)?;
    let _ = watch_tx.send(capture.state_watch());

    capture.request_open(consumer)?;

    loop {
        if !apply_control(capture.as_mut(), &control_rx) {
            info!("Capture stop requested");
            break;
        }

        conn.flush().context("Wayland flush failed")?;
        let wait = tick
            .next_deadline()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .map_or(IDLE_POLL, |d| d.min(IDLE_POLL));
        read_events(&queue, wait)?;
        queue.dispatch_pending(&mut state).context("Wayland dispatch failed")?;

        while let Some(event) = state.sink.pop() {
            if let Err(e) = capture.handle_event(event) {
                debug!("Protocol event rejected: {}", e);
            }
        }
        if tick.take_due(Instant::now()) {
            if let Err(e) = capture.on_tick() {
                debug!("Frame tick rejected: {}", e);
            }
        }

        if capture.state().is_terminal() {
            break;
        }
    }

    let last = capture.state();
    if matches!(last, SessionState::Open | SessionState::Paused) {
        capture.close()?;
    }
    // A failed session already released its pool. Dropping the backend
    // destroys the protocol objects, flushed with the final request batch.
    drop(capture);
    conn.flush().context("Wayland flush failed")?;

    match last {
        SessionState::InitFailed | SessionState::FatalError => bail!("capture session ended in {last}"),
        _ => Ok(()),
    }
}

/// Applies pending control commands. Returns `false` once the loop should
/// stop.
fn apply_control(capture: &mut dyn ScreenCapture, control_rx: &mpsc::Receiver<Control>) -> bool {
    loop {
        let cmd = match control_rx.try_recv() {
            Ok(cmd) => cmd,
            Err(mpsc::TryRecvError::Empty) => return true,
            Err(mpsc::TryRecvError::Disconnected) => return false,
        };
        let result = match cmd {
            Control::Pause => capture.pause(),
            Control::Resume => capture.unpause(),
            Control::Stop => return false,
        };
        match result {
            Ok(()) => info!("Capture {:?} applied, state {}", cmd, capture.state()),
            Err(e) => warn!("Capture {:?} ignored: {}", cmd, e),
        }
    }
}

/// Waits up to `timeout` for the socket and reads whatever arrived.
fn read_events(queue: &EventQueue<WaylandState>, timeout: Duration) -> anyhow::Result<()> {
    // `None` means events are already queued for dispatch.
    let Some(guard) = queue.prepare_read() else { return Ok(()) };

    let mut pollfd = libc::pollfd {
        fd:      guard.connection_fd().as_raw_fd(),
        events:  libc::POLLIN,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: one valid pollfd for the duration of the call.
    let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };

    if ready > 0 {
        guard.read().context("Wayland read failed")?;
        return Ok(());
    }
    if ready < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err).context("poll() on Wayland socket failed");
        }
    }
    // Timeout or EINTR: dropping the guard cancels the read.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProtocol, MockShm, MockTick};
    use crate::CaptureBackend;
    use wlgrab_core::DisplayInfo;

    struct NullConsumer;

    impl CaptureConsumer for NullConsumer {
        fn on_open(&mut self, _width: u32, _height: u32) {}
        fn on_open_error(&mut self, _error: &wlgrab_core::CaptureError) {}
        fn on_frame(&mut self, _frame: crate::Frame<'_>) {}
    }

    fn open_backend() -> CaptureBackend<MockProtocol, MockShm, MockTick> {
        let mut backend =
            CaptureBackend::new(MockProtocol::default(), MockShm::default(), MockTick::default(), 2);
        backend.request_open(Box::new(NullConsumer)).unwrap();
        backend
            .handle_event(crate::ProtocolEvent::new(
                crate::FrameTarget::Probe,
                crate::FrameEventKind::Metadata(DisplayInfo::packed(4, 4)),
            ))
            .unwrap();
        backend
    }

    #[test]
    fn control_commands_drive_the_session() {
        let mut backend = open_backend();
        let (tx, rx) = mpsc::channel();

        tx.send(Control::Pause).unwrap();
        assert!(apply_control(&mut backend, &rx));
        assert_eq!(backend.state(), SessionState::Paused);

        // A second pause is rejected and logged, not fatal.
        tx.send(Control::Pause).unwrap();
        tx.send(Control::Resume).unwrap();
        assert!(apply_control(&mut backend, &rx));
        assert_eq!(backend.state(), SessionState::Open);

        tx.send(Control::Stop).unwrap();
        assert!(!apply_control(&mut backend, &rx));
    }

    #[test]
    fn dropped_controller_stops_the_loop() {
        let mut backend = open_backend();
        let (tx, rx) = mpsc::channel::<Control>();
        drop(tx);
        assert!(!apply_control(&mut backend, &rx));
        assert_eq!(backend.state(), SessionState::Open);
    }
}
