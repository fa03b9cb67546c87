//! Consumer-facing callbacks.

use wlgrab_core::{CaptureError, DisplayInfo, SlotId};

/// One captured frame, lent to the consumer for the duration of
/// [`CaptureConsumer::on_frame`].
///
/// `pixels` points straight into the shared-memory slot; the slot is
/// recycled as soon as the callback returns, so copy out anything that must
/// outlive it.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub info:   DisplayInfo,
    /// Monotonic capture sequence number.
    pub index:  u64,
    pub slot:   SlotId,
    pub pixels: &'a [u8],
}

impl Frame<'_> {
    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn stride(&self) -> u32 {
        self.info.stride
    }
}

/// Callbacks invoked synchronously on the dispatch thread. Implementations
/// must not block.
pub trait CaptureConsumer {
    /// Negotiation succeeded; frames of this size will follow.
    fn on_open(&mut self, width: u32, height: u32);

    /// Negotiation failed. Called at most once, and never after `on_open`.
    fn on_open_error(&mut self, error: &CaptureError);

    fn on_frame(&mut self, frame: Frame<'_>);

    /// The session hit an unrecoverable runtime error.
    fn on_fatal(&mut self, error: &CaptureError) {
        let _ = error;
    }
}
