//! Frame-tick hook: the periodic signal that paces capture requests.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use wlgrab_core::CaptureError;

/// Registration handle returned by [`FrameTick::add_frame_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickHandle(u64);

impl TickHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Registration interface of the event loop's tick source.
pub trait FrameTick {
    fn add_frame_tick(&mut self) -> Result<TickHandle, CaptureError>;

    /// Fails with [`CaptureError::TickNotRegistered`] for unknown handles.
    fn remove_frame_tick(&mut self, handle: TickHandle) -> Result<(), CaptureError>;
}

// ── TickScheduler ─────────────────────────────────────────────────────────────

/// Interval-driven tick source owned by the event loop.
///
/// Cloning yields another handle to the same schedule: the backend holds one
/// to register/unregister, the loop holds one to ask when the next tick is
/// due. Ticks only fire while at least one registration is active.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    inner: Rc<RefCell<Schedule>>,
}

#[derive(Debug)]
struct Schedule {
    interval: Duration,
    next_due: Option<Instant>,
    active:   BTreeSet<u64>,
    next_id:  u64,
}

impl TickScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Schedule {
                interval,
                next_due: None,
                active: BTreeSet::new(),
                next_id: 1,
            })),
        }
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(Duration::from_micros(1_000_000 / fps.max(1) as u64))
    }

    pub fn interval(&self) -> Duration {
        self.inner.borrow().interval
    }

    pub fn is_armed(&self) -> bool {
        !self.inner.borrow().active.is_empty()
    }

    pub fn registrations(&self) -> usize {
        self.inner.borrow().active.len()
    }

    /// When the next tick fires, or `None` while disarmed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.borrow().next_due
    }

    /// Consumes one tick if it is due at `now`.
    ///
    /// After a stall longer than one interval the schedule restarts from
    /// `now` instead of firing a burst of catch-up ticks.
    pub fn take_due(&self, now: Instant) -> bool {
        let mut schedule = self.inner.borrow_mut();
        let Some(due) = schedule.next_due else { return false };
        if now < due {
            return false;
        }
        let next = due + schedule.interval;
        schedule.next_due = Some(if next <= now { now + schedule.interval } else { next });
        true
    }

    fn register_at(&self, now: Instant) -> TickHandle {
        let mut schedule = self.inner.borrow_mut();
        let id = schedule.next_id;
        schedule.next_id += 1;
        schedule.active.insert(id);
        if schedule.next_due.is_none() {
            schedule.next_due = Some(now);
        }
        TickHandle(id)
    }
}

impl FrameTick for TickScheduler {
    fn add_frame_tick(&mut self) -> Result<TickHandle, CaptureError> {
        Ok(self.register_at(Instant::now()))
    }

    fn remove_frame_tick(&mut self, handle: TickHandle) -> Result<(), CaptureError> {
        let mut schedule = self.inner.borrow_mut();
        if !schedule.active.remove(&handle.0) {
            return Err(CaptureError::TickNotRegistered { handle: handle.0 });
        }
        if schedule.active.is_empty() {
            schedule.next_due = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn fires_once_per_interval_while_armed() {
        let sched = TickScheduler::new(10 * MS);
        let t0 = Instant::now();
        assert!(!sched.take_due(t0));

        let handle = sched.register_at(t0);
        assert!(sched.is_armed());
        assert!(sched.take_due(t0));
        assert!(!sched.take_due(t0 + 5 * MS));
        assert!(sched.take_due(t0 + 10 * MS));
        assert_eq!(sched.next_deadline(), Some(t0 + 20 * MS));

        let mut hook = sched.clone();
        hook.remove_frame_tick(handle).unwrap();
        assert!(!sched.is_armed());
        assert_eq!(sched.next_deadline(), None);
        assert!(!sched.take_due(t0 + 100 * MS));
    }

    #[test]
    fn stall_does_not_burst() {
        let sched = TickScheduler::new(10 * MS);
        let t0 = Instant::now();
        sched.register_at(t0);
        assert!(sched.take_due(t0));

        let late = t0 + 55 * MS;
        assert!(sched.take_due(late));
        assert!(!sched.take_due(late + MS));
        assert_eq!(sched.next_deadline(), Some(late + 10 * MS));
    }

    #[test]
    fn removing_unknown_handle_is_an_error() {
        let mut sched = TickScheduler::from_fps(30);
        let handle = sched.add_frame_tick().unwrap();
        sched.remove_frame_tick(handle).unwrap();
        assert!(matches!(
            sched.remove_frame_tick(handle),
            Err(CaptureError::TickNotRegistered { .. })
        ));
    }

    #[test]
    fn handles_are_unique() {
        let mut sched = TickScheduler::from_fps(60);
        let a = sched.add_frame_tick().unwrap();
        let b = sched.add_frame_tick().unwrap();
        assert_ne!(a, b);
        assert_eq!(sched.registrations(), 2);
        sched.remove_frame_tick(a).unwrap();
        assert!(sched.is_armed());
    }
}
