use thiserror::Error;

use crate::types::{PixelFormat, SessionState};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Shared-memory allocation failed: {reason}")]
    AllocationFailed { reason: String },

    #[error("Buffer pool exhausted ({capacity} buffers already created)")]
    PoolExhausted { capacity: usize },

    #[error("Unsupported pixel format {format} (only XRGB8888 is accepted)")]
    UnsupportedFormat { format: PixelFormat },

    #[error("Stride {stride} does not match packed row size {expected}")]
    StrideMismatch { stride: u32, expected: u32 },

    #[error("Output format changed mid-session: {reason}")]
    FormatChanged { reason: String },

    #[error("`{op}` is not allowed in state {state}")]
    InvalidState { op: &'static str, state: SessionState },

    #[error("No free buffer slot for a new capture request")]
    NoFreeSlot,

    #[error("Protocol failure: {reason}")]
    ProtocolFailed { reason: String },

    #[error("Frame tick registration failed: {reason}")]
    TickRegistration { reason: String },

    #[error("Frame tick handle {handle} is not registered")]
    TickNotRegistered { handle: u64 },

    #[error("No supported capture backend on this compositor")]
    NoSupportedBackend,

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn invalid_state(op: &'static str, state: SessionState) -> Self {
        Self::InvalidState { op, state }
    }

    pub fn allocation(reason: impl Into<String>) -> Self {
        Self::AllocationFailed { reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolFailed { reason: reason.into() }
    }
}
