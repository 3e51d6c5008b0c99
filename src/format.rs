//! Host pixel formats and their PNG color types.

use crate::abi;

/// Pixel layout of an [`Image`](crate::Image).
///
/// The format names the color family the image came from (or is written
/// as). The buffer type is shared within a family: RGB and RGBA images are
/// both stored as `Rgba<u8>`, grayscale and grayscale-alpha as
/// `GrayAlpha<u8>`, indexed images as palette indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PixelFormat {
    Rgb,
    Rgba,
    Grayscale,
    GrayscaleAlpha,
    Indexed,
}

impl PixelFormat {
    /// Map a PNG color type. `None` for values PNG does not define.
    pub fn from_color_type(color_type: u8) -> Option<Self> {
        match color_type {
            abi::COLOR_TYPE_GRAY => Some(Self::Grayscale),
            abi::COLOR_TYPE_RGB => Some(Self::Rgb),
            abi::COLOR_TYPE_PALETTE => Some(Self::Indexed),
            abi::COLOR_TYPE_GRAY_ALPHA => Some(Self::GrayscaleAlpha),
            abi::COLOR_TYPE_RGB_ALPHA => Some(Self::Rgba),
            _ => None,
        }
    }

    /// PNG color type for this format.
    pub fn color_type(self) -> u8 {
        match self {
            Self::Grayscale => abi::COLOR_TYPE_GRAY,
            Self::Rgb => abi::COLOR_TYPE_RGB,
            Self::Indexed => abi::COLOR_TYPE_PALETTE,
            Self::GrayscaleAlpha => abi::COLOR_TYPE_GRAY_ALPHA,
            Self::Rgba => abi::COLOR_TYPE_RGB_ALPHA,
        }
    }

    /// Samples per pixel in a decoded 8-bit row.
    pub fn channels(self) -> u32 {
        match self {
            Self::Grayscale | Self::Indexed => 1,
            Self::GrayscaleAlpha => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    /// Whether the format stores an alpha channel.
    pub fn has_alpha_channel(self) -> bool {
        matches!(self, Self::Rgba | Self::GrayscaleAlpha)
    }

    /// Whether this is one of the gray formats.
    pub fn is_gray(self) -> bool {
        matches!(self, Self::Grayscale | Self::GrayscaleAlpha)
    }

    /// The same family with or without an alpha channel. Indexed stays
    /// indexed.
    pub(crate) fn with_alpha(self, alpha: bool) -> Self {
        match (self, alpha) {
            (Self::Rgb | Self::Rgba, true) => Self::Rgba,
            (Self::Rgb | Self::Rgba, false) => Self::Rgb,
            (Self::Grayscale | Self::GrayscaleAlpha, true) => Self::GrayscaleAlpha,
            (Self::Grayscale | Self::GrayscaleAlpha, false) => Self::Grayscale,
            (Self::Indexed, _) => Self::Indexed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_types_round_trip() {
        for format in [
            PixelFormat::Rgb,
            PixelFormat::Rgba,
            PixelFormat::Grayscale,
            PixelFormat::GrayscaleAlpha,
            PixelFormat::Indexed,
        ] {
            assert_eq!(PixelFormat::from_color_type(format.color_type()), Some(format));
        }
        assert_eq!(PixelFormat::from_color_type(1), None);
        assert_eq!(PixelFormat::from_color_type(5), None);
        assert_eq!(PixelFormat::from_color_type(7), None);
    }

    #[test]
    fn alpha_toggles_within_family() {
        assert_eq!(PixelFormat::Rgb.with_alpha(true), PixelFormat::Rgba);
        assert_eq!(PixelFormat::GrayscaleAlpha.with_alpha(false), PixelFormat::Grayscale);
        assert_eq!(PixelFormat::Indexed.with_alpha(true), PixelFormat::Indexed);
        assert!(PixelFormat::Rgba.has_alpha_channel());
        assert!(!PixelFormat::Indexed.has_alpha_channel());
    }
}
