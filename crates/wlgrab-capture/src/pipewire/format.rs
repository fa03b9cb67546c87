//! Raw-video format negotiation for the PipeWire stream.
//!
//! The stream is offered five packed RGB layouts, sizes up to 4096×4096 and
//! any frame rate up to 1000/1. Whatever the producer picks is mapped onto a
//! [`DisplayInfo`]; only `BGRx` (byte order B, G, R, X, i.e. XRGB8888) then
//! passes validation.

use wlgrab_core::{CaptureError, DisplayInfo, PixelFormat};

/// Media type of uncompressed video caps.
pub const RAW_VIDEO: &str = "video/x-raw";

/// Largest width or height accepted from the stream.
pub const MAX_DIMENSION: u32 = 4096;

/// Upper bound of the offered frame-rate range.
pub const MAX_FRAMERATE: u32 = 1000;

/// Packed layouts a PipeWire producer may settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPixelFormat {
    Rgb,
    Rgba,
    Rgbx,
    Bgra,
    Bgrx,
    Bgr,
}

impl StreamPixelFormat {
    /// Formats listed in the negotiation caps, in order.
    pub const OFFERED: [Self; 5] = [Self::Rgb, Self::Rgba, Self::Rgbx, Self::Bgr, Self::Bgrx];

    const RGB888: u32 = u32::from_le_bytes(*b"RG24");
    const BGR888: u32 = u32::from_le_bytes(*b"BG24");

    pub fn from_caps_name(name: &str) -> Option<Self> {
        Some(match name {
            "RGB" => Self::Rgb,
            "RGBA" => Self::Rgba,
            "RGBx" => Self::Rgbx,
            "BGRA" => Self::Bgra,
            "BGRx" => Self::Bgrx,
            "BGR" => Self::Bgr,
            _ => return None,
        })
    }

    pub fn caps_name(self) -> &'static str {
        match self {
            Self::Rgb => "RGB",
            Self::Rgba => "RGBA",
            Self::Rgbx => "RGBx",
            Self::Bgra => "BGRA",
            Self::Bgrx => "BGRx",
            Self::Bgr => "BGR",
        }
    }

    /// The same memory layout expressed as a `wl_shm`/DRM format.
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            Self::Bgrx => PixelFormat::Xrgb8888,
            Self::Bgra => PixelFormat::Argb8888,
            Self::Rgbx => PixelFormat::Xbgr8888,
            Self::Rgba => PixelFormat::Abgr8888,
            Self::Rgb => PixelFormat::Other(Self::BGR888),
            Self::Bgr => PixelFormat::Other(Self::RGB888),
        }
    }
}

/// Format the producer settled on, read from a sample's caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub format: StreamPixelFormat,
    pub width:  u32,
    pub height: u32,
    /// Bytes per row of the first plane.
    pub stride: u32,
}

impl StreamFormat {
    /// Checks the media type, format name and size range of negotiated caps.
    pub fn parse(
        media_type: &str,
        format_name: &str,
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<Self, CaptureError> {
        if media_type != RAW_VIDEO {
            return Err(CaptureError::protocol(format!(
                "stream negotiated {media_type}, expected {RAW_VIDEO}"
            )));
        }
        let Some(format) = StreamPixelFormat::from_caps_name(format_name) else {
            return Err(CaptureError::protocol(format!(
                "stream negotiated unknown video format {format_name}"
            )));
        };
        let in_range = |v: u32| (1..=MAX_DIMENSION).contains(&v);
        if !in_range(width) || !in_range(height) {
            return Err(CaptureError::protocol(format!(
                "stream size {width}×{height} outside 1..={MAX_DIMENSION}"
            )));
        }
        Ok(Self { format, width, height, stride })
    }

    pub fn display_info(&self) -> DisplayInfo {
        DisplayInfo {
            width:  self.width,
            height: self.height,
            stride: self.stride,
            format: self.format.pixel_format(),
        }
    }
}

/// Caps string restricting the stream to the offered formats and ranges.
pub fn negotiation_caps() -> String {
    let formats: Vec<&str> = StreamPixelFormat::OFFERED.iter().map(|f| f.caps_name()).collect();
    format!(
        "{RAW_VIDEO},format=(string){{ {} }},width=(int)[ 1, {MAX_DIMENSION} ],\
         height=(int)[ 1, {MAX_DIMENSION} ],framerate=(fraction)[ 0/1, {MAX_FRAMERATE}/1 ]",
        formats.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgrx_is_the_supported_layout() {
        let format = StreamFormat::parse(RAW_VIDEO, "BGRx", 1920, 1080, 1920 * 4).unwrap();
        let info = format.display_info();
        assert_eq!(info, DisplayInfo::packed(1920, 1080));
        assert!(info.validate().is_ok());
    }

    #[test]
    fn other_layouts_fail_validation() {
        for name in ["RGB", "RGBA", "RGBx", "BGRA", "BGR"] {
            let format = StreamFormat::parse(RAW_VIDEO, name, 64, 64, 64 * 4).unwrap();
            assert!(
                matches!(format.display_info().validate(), Err(CaptureError::UnsupportedFormat { .. })),
                "{name} accepted"
            );
        }
    }

    #[test]
    fn rejects_non_raw_unknown_and_oversized() {
        assert!(StreamFormat::parse("video/x-h264", "BGRx", 8, 8, 32).is_err());
        assert!(StreamFormat::parse(RAW_VIDEO, "NV12", 8, 8, 8).is_err());
        assert!(StreamFormat::parse(RAW_VIDEO, "BGRx", 4097, 8, 4097 * 4).is_err());
        assert!(StreamFormat::parse(RAW_VIDEO, "BGRx", 8, 0, 32).is_err());
        assert!(StreamFormat::parse(RAW_VIDEO, "BGRx", 4096, 4096, 4096 * 4).is_ok());
    }

    #[test]
    fn caps_names_round_trip_and_are_offered() {
        for format in StreamPixelFormat::OFFERED {
            assert_eq!(StreamPixelFormat::from_caps_name(format.caps_name()), Some(format));
        }
        let caps = negotiation_caps();
        assert!(caps.starts_with("video/x-raw,format=(string){ RGB, RGBA, RGBx, BGR, BGRx }"));
        assert!(caps.contains("width=(int)[ 1, 4096 ]"));
        assert!(caps.contains("framerate=(fraction)[ 0/1, 1000/1 ]"));
    }
}
