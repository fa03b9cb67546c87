use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use wlgrab_core::SessionState;

/// Read-only, thread-safe snapshot of a session's state.
///
/// The backend is the only writer; any thread may poll.
#[derive(Debug, Clone)]
pub struct StateWatch {
    state: Arc<AtomicU8>,
}

impl StateWatch {
    pub(crate) fn new(initial: SessionState) -> Self {
        Self { state: Arc::new(AtomicU8::new(initial.as_u8())) }
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::FatalError)
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_from_other_threads() {
        let watch = StateWatch::new(SessionState::Uninitialized);
        let remote = watch.clone();
        watch.set(SessionState::Open);
        let seen = std::thread::spawn(move || remote.get()).join().unwrap();
        assert_eq!(seen, SessionState::Open);
    }
}
