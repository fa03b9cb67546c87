use serde::{Deserialize, Serialize};

use crate::CaptureError;

// MARK: - PixelFormat

/// Pixel layout of a captured output, as announced by the compositor.
///
/// Codes follow `wl_shm.format`: the two legacy formats use 0 and 1, every
/// other format uses its DRM fourcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit, bytes B, G, R, A in memory.
    Argb8888,
    /// 32-bit, bytes B, G, R, X in memory (X unused).
    Xrgb8888,
    /// 32-bit, bytes R, G, B, A in memory.
    Abgr8888,
    /// 32-bit, bytes R, G, B, X in memory.
    Xbgr8888,
    /// Anything else the compositor may report.
    Other(u32),
}

impl PixelFormat {
    /// The one format the capture core accepts.
    pub const SUPPORTED: Self = Self::Xrgb8888;

    const ABGR8888_CODE: u32 = fourcc(b"AB24");
    const XBGR8888_CODE: u32 = fourcc(b"XB24");

    pub fn from_shm_code(code: u32) -> Self {
        match code {
            0 => Self::Argb8888,
            1 => Self::Xrgb8888,
            Self::ABGR8888_CODE => Self::Abgr8888,
            Self::XBGR8888_CODE => Self::Xbgr8888,
            other => Self::Other(other),
        }
    }

    pub fn shm_code(self) -> u32 {
        match self {
            Self::Argb8888 => 0,
            Self::Xrgb8888 => 1,
            Self::Abgr8888 => Self::ABGR8888_CODE,
            Self::Xbgr8888 => Self::XBGR8888_CODE,
            Self::Other(code) => code,
        }
    }

    /// Bytes per pixel, when known.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Argb8888 | Self::Xrgb8888 | Self::Abgr8888 | Self::Xbgr8888 => Some(4),
            Self::Other(_) => None,
        }
    }

    pub fn is_supported(self) -> bool {
        self == Self::SUPPORTED
    }

    /// Packed row size for `width` pixels, or `None` on overflow. Unknown
    /// formats are sized as 4 bytes per pixel.
    pub fn row_bytes(self, width: u32) -> Option<u32> {
        width.checked_mul(self.bytes_per_pixel().unwrap_or(4))
    }
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argb8888 => write!(f, "ARGB8888"),
            Self::Xrgb8888 => write!(f, "XRGB8888"),
            Self::Abgr8888 => write!(f, "ABGR8888"),
            Self::Xbgr8888 => write!(f, "XBGR8888"),
            Self::Other(code) => write!(f, "0x{code:08x}"),
        }
    }
}

// MARK: - DisplayInfo

/// Geometry and pixel format of a captured output.
///
/// Fixed at the first successful negotiation and immutable for the rest of
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    pub width:  u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    pub format: PixelFormat,
}

impl DisplayInfo {
    /// Tightly packed geometry in the supported format.
    pub fn packed(width: u32, height: u32) -> Self {
        let stride = PixelFormat::SUPPORTED.row_bytes(width).unwrap_or(u32::MAX);
        Self { width, height, stride, format: PixelFormat::SUPPORTED }
    }

    /// Size in bytes of one frame.
    pub fn frame_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Checks the format is the supported one and rows are tightly packed.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !self.format.is_supported() {
            return Err(CaptureError::UnsupportedFormat { format: self.format });
        }
        let Some(expected) = self.format.row_bytes(self.width) else {
            return Err(CaptureError::ProtocolFailed {
                reason: format!("output width {} overflows the row size", self.width),
            });
        };
        if self.stride != expected {
            return Err(CaptureError::StrideMismatch { stride: self.stride, expected });
        }
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::ProtocolFailed {
                reason: format!("empty output geometry {}×{}", self.width, self.height),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for DisplayInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{} stride={} {}", self.width, self.height, self.stride, self.format)
    }
}

// MARK: - SessionState

/// Lifecycle of one capture session.
///
/// ```text
/// Uninitialized ─► InitPending ─► Open ⇄ Paused ─► Closed
///                      │            │      │
///                      ▼            └──┬───┘
///                  InitFailed          ▼
///                                  FatalError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    InitPending   = 1,
    InitFailed    = 2,
    Open          = 3,
    Paused        = 4,
    Closed        = 5,
    FatalError    = 6,
}

impl SessionState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Uninitialized,
            1 => Self::InitPending,
            2 => Self::InitFailed,
            3 => Self::Open,
            4 => Self::Paused,
            5 => Self::Closed,
            6 => Self::FatalError,
            _ => return None,
        })
    }

    /// No further transition is possible except releasing resources.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::InitFailed | Self::Closed | Self::FatalError)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::InitPending => "init_pending",
            Self::InitFailed => "init_failed",
            Self::Open => "open",
            Self::Paused => "paused",
            Self::Closed => "closed",
            Self::FatalError => "fatal_error",
        };
        f.write_str(name)
    }
}

// MARK: - SlotId

/// Index of one buffer slot in a backend's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

// MARK: - BackendKind

/// Capture sources a backend can speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// `ext-image-copy-capture-v1`
    ExtImageCopyCapture,
    /// `wlr-screencopy-unstable-v1`
    WlrScreencopy,
    /// PipeWire stream from the XDG desktop ScreenCast portal.
    #[serde(rename = "pipewire")]
    PipeWire,
}

impl BackendKind {
    /// Probe order used when no backend is forced. The portal comes last
    /// since it asks the user for permission.
    pub const PREFERENCE: [Self; 3] = [Self::ExtImageCopyCapture, Self::WlrScreencopy, Self::PipeWire];
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExtImageCopyCapture => write!(f, "ext-image-copy-capture"),
            Self::WlrScreencopy => write!(f, "wlr-screencopy"),
            Self::PipeWire => write!(f, "pipewire"),
        }
    }
}
