//! The host image model handed to and returned from the pipelines.

use rgb::{Rgb, Rgba};

use crate::chunks::ChunkStore;
use crate::color::ColorProfile;
use crate::format::PixelFormat;
use crate::pixel::PixelData;

/// Color table of an indexed image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Palette {
    /// Up to 256 entries, each with its own alpha.
    pub entries: Vec<Rgba<u8>>,
    /// Index drawn as fully transparent, if any.
    pub mask_index: Option<u8>,
}

impl Palette {
    /// Palette with fully opaque entries and no mask.
    pub fn opaque(colors: impl IntoIterator<Item = Rgb<u8>>) -> Self {
        Self {
            entries: colors.into_iter().map(|c| Rgba::new(c.r, c.g, c.b, 255)).collect(),
            mask_index: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with_mask_index(mut self, index: u8) -> Self {
        self.mask_index = Some(index);
        self
    }
}

/// Exact sample value that decodes as alpha 0. Only RGB and grayscale
/// images carry one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransparentColorKey {
    Rgb(Rgb<u8>),
    Gray(u8),
}

/// A decoded image, or an image to encode.
///
/// `format` is the color family of the file (RGB images decode into
/// `Rgba8` pixel data, grayscale into `GrayAlpha8`); `has_alpha` records
/// whether any pixel is not fully opaque once palette alpha and color keys
/// are applied.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct Image {
    pub pixels: PixelData,
    pub format: PixelFormat,
    pub has_alpha: bool,
    /// Present for indexed images.
    pub palette: Option<Palette>,
    pub transparent_key: Option<TransparentColorKey>,
    pub color_profile: ColorProfile,
    /// Unrecognized chunks, replayed on encode.
    pub chunks: ChunkStore,
    /// A visible opaque background hides the palette's mask index, so the
    /// encoder does not force it transparent.
    pub has_background: bool,
}

impl Image {
    /// An image of `format` over `pixels`, with alpha taken from the format.
    pub fn new(format: PixelFormat, pixels: PixelData) -> Self {
        Self {
            pixels,
            format,
            has_alpha: format.has_alpha_channel(),
            palette: None,
            transparent_key: None,
            color_profile: ColorProfile::None,
            chunks: ChunkStore::new(),
            has_background: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn with_alpha(mut self, has_alpha: bool) -> Self {
        self.has_alpha = has_alpha;
        self
    }

    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = Some(palette);
        self
    }

    pub fn with_transparent_key(mut self, key: TransparentColorKey) -> Self {
        self.transparent_key = Some(key);
        self
    }

    pub fn with_color_profile(mut self, profile: ColorProfile) -> Self {
        self.color_profile = profile;
        self
    }

    pub fn with_chunks(mut self, chunks: ChunkStore) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_background(mut self, visible: bool) -> Self {
        self.has_background = visible;
        self
    }

    /// Check that the pixel buffer, palette and key agree with `format`.
    pub(crate) fn validate(&self) -> Result<(), String> {
        let buffer_matches = match self.format {
            PixelFormat::Rgb | PixelFormat::Rgba => matches!(self.pixels, PixelData::Rgba8(_)),
            PixelFormat::Grayscale | PixelFormat::GrayscaleAlpha => {
                matches!(self.pixels, PixelData::GrayAlpha8(_))
            }
            PixelFormat::Indexed => matches!(self.pixels, PixelData::Indexed8(_)),
        };
        if !buffer_matches {
            return Err(format!("{:?} image with a mismatched pixel buffer", self.format));
        }
        if self.width() == 0 || self.height() == 0 {
            return Err("image has no pixels".to_owned());
        }
        if self.format == PixelFormat::Indexed {
            let palette = self.palette.as_ref().ok_or("indexed image without a palette")?;
            if palette.len() > 256 {
                return Err(format!("palette has {} entries", palette.len()));
            }
        }
        match (self.transparent_key, self.format) {
            (None, _) | (Some(TransparentColorKey::Rgb(_)), PixelFormat::Rgb) => Ok(()),
            (Some(TransparentColorKey::Gray(_)), PixelFormat::Grayscale) => Ok(()),
            (Some(key), format) => Err(format!("{key:?} color key on a {format:?} image")),
        }
    }
}
