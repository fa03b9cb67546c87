//! PipeWire capture through the XDG desktop ScreenCast portal.
//!
//! Unlike the screencopy protocols, the portal stream owns its buffers, so
//! each request copies the newest sample into the requested pool slot. The
//! same [`CaptureBackend`](crate::CaptureBackend) drives the slots.
//!
//! Format negotiation and slot memory are always built. The portal and
//! GStreamer side needs the `pipewire` feature.

pub mod format;
mod memory;
#[cfg(feature = "pipewire")]
mod stream;

pub use format::{negotiation_caps, StreamFormat, StreamPixelFormat};
pub use memory::{PoolRegion, PortalPool, PortalShm};
#[cfg(feature = "pipewire")]
pub use stream::{PipeWireCandidate, PipeWireFrame, PipeWireStream};
