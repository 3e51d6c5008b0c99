//! Encode pipeline.
//!
//! The written color type follows the image's color family plus whether
//! alpha is needed: RGB or RGBA, gray or gray-alpha, indexed. An indexed
//! image is promoted to RGBA only to carry the single-alpha-pixel marker.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rgb::Rgba;

use crate::abi::{Color16, ColorEntry};
use crate::color::{self, ColorProfile};
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::image::{Image, TransparentColorKey};
use crate::limits::ResourceLimits;
use crate::marshal::{CodecSession, Header, Transparency};
use crate::pixel::{self, PixelData};
use crate::sandbox::{Sandbox, with_domain};
use crate::Progress;

/// Longest profile name a PNG keyword allows.
const MAX_PROFILE_NAME_LEN: usize = 79;

/// Name written for an ICC profile that has none.
const DEFAULT_PROFILE_NAME: &str = "ICC profile";

/// Per-call encode switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct EncodeOptions {
    /// Write an alpha channel even for a fully opaque image, with the
    /// bottom-right pixel at alpha 254, so readers that sniff for
    /// transparency treat the file as transparent.
    pub force_single_alpha_pixel: bool,
    /// Write the image's color profile.
    pub preserve_color_profile: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            force_single_alpha_pixel: false,
            preserve_color_profile: true,
        }
    }
}

impl EncodeOptions {
    pub fn with_force_single_alpha_pixel(mut self, force: bool) -> Self {
        self.force_single_alpha_pixel = force;
        self
    }

    pub fn with_preserve_color_profile(mut self, preserve: bool) -> Self {
        self.preserve_color_profile = preserve;
        self
    }
}

/// Encode configuration.
///
/// Reusable and cheap to clone. Call [`job`](Self::job) for each encode.
#[derive(Clone, Debug, Default)]
pub struct EncoderConfig {
    options: EncodeOptions,
    limits: ResourceLimits,
}

impl EncoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: EncodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Apply resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    /// Create a per-operation job for this config.
    pub fn job(&self) -> EncodeJob<'_> {
        EncodeJob {
            options: self.options,
            limits: self.limits,
            progress: None,
        }
    }
}

/// One encode call.
pub struct EncodeJob<'a> {
    options: EncodeOptions,
    limits: ResourceLimits,
    progress: Option<&'a dyn Progress>,
}

impl<'a> EncodeJob<'a> {
    /// Receive the fraction of rows written, after every row.
    pub fn with_progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Override resource limits for this operation.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Encode `image` to a file at `path` on the process-wide domain.
    pub fn encode(self, image: &Image, path: impl AsRef<Path>) -> Result<EncodeOutput> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| Error::FileOpen {
            path: path.to_owned(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        log::debug!("encoding {}", path.display());
        let output = with_domain(|sandbox| self.encode_to(sandbox, image, &mut writer))??;
        writer.flush().map_err(|e| Error::RowIo(e.to_string()))?;
        Ok(output)
    }

    /// Encode `image` as a PNG stream inside `sandbox`.
    pub fn encode_to(self, sandbox: &Sandbox, image: &Image, sink: &mut dyn Write) -> Result<EncodeOutput> {
        image.validate().map_err(Error::InvalidImage)?;
        let (width, height) = (image.width(), image.height());
        self.limits.check_dimensions(width, height)?;

        let force = self.options.force_single_alpha_pixel;
        let needs_alpha = image.has_alpha && image.transparent_key.is_none();
        let target = match image.format {
            PixelFormat::Indexed if force => PixelFormat::Rgba,
            PixelFormat::Indexed => PixelFormat::Indexed,
            family => family.with_alpha(needs_alpha || force),
        };
        log::debug!("writing {width}x{height} {:?} image as {target:?}", image.format);

        // Palette alpha with the mask applied; also drives indexed promotion.
        let palette = effective_palette(image);

        let mut session = CodecSession::writer(sandbox, sink, self.limits)?;
        session.set_ihdr(&Header {
            width,
            height,
            bit_depth: 8,
            color_type: target.color_type(),
            interlaced: false,
        })?;
        session.set_unknown_chunks(&image.chunks)?;
        if self.options.preserve_color_profile {
            write_profile(&mut session, &image.color_profile)?;
        }

        if target == PixelFormat::Indexed {
            let colors: Vec<ColorEntry> = palette
                .iter()
                .map(|p| ColorEntry {
                    red: p.r,
                    green: p.g,
                    blue: p.b,
                })
                .collect();
            session.set_plte(&colors)?;
            let has_mask = mask_index(image).is_some();
            if has_mask || palette.iter().any(|p| p.a < 255) {
                let alpha = palette.iter().map(|p| p.a).collect();
                session.set_trns(&Transparency::Alpha(alpha))?;
            }
        } else if !target.has_alpha_channel()
            && let Some(key) = image.transparent_key
        {
            let color = match key {
                TransparentColorKey::Rgb(c) => Color16 {
                    red: c.r.into(),
                    green: c.g.into(),
                    blue: c.b.into(),
                    ..Color16::default()
                },
                TransparentColorKey::Gray(v) => Color16 {
                    gray: v.into(),
                    ..Color16::default()
                },
            };
            session.set_trns(&Transparency::Key(color))?;
        }

        session.write_info()?;
        session.confirm_color_type(target.color_type())?;

        let mut row = Vec::with_capacity(width as usize * target.channels() as usize);
        for y in 0..height as usize {
            let mark_last = force && y + 1 == height as usize;
            row.clear();
            pack_row(&image.pixels, target, &palette, y, mark_last, &mut row);
            session.write_row(&row)?;
            if let Some(progress) = self.progress {
                progress.report((y + 1) as f64 / f64::from(height));
            }
        }
        session.write_end()?;

        let bytes_written = session.bytes_written();
        drop(session);
        log::debug!("wrote {bytes_written} bytes");
        Ok(EncodeOutput {
            bytes_written,
            format: target,
        })
    }
}

/// Result of an encode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeOutput {
    bytes_written: u64,
    format: PixelFormat,
}

impl EncodeOutput {
    /// Encoded byte count.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// The format the file was written in.
    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

/// The document's transparent index, unless a visible background covers it.
fn mask_index(image: &Image) -> Option<u8> {
    if image.has_background {
        return None;
    }
    image.palette.as_ref()?.mask_index
}

/// Palette entries as written: clamped to 1..=256 entries, mask forced
/// transparent. Empty for images without a palette.
fn effective_palette(image: &Image) -> Vec<Rgba<u8>> {
    let Some(palette) = &image.palette else {
        return Vec::new();
    };
    let mut entries: Vec<Rgba<u8>> = palette.entries.iter().take(256).copied().collect();
    if entries.is_empty() {
        entries.push(Rgba::new(0, 0, 0, 255));
    }
    if let Some(mask) = mask_index(image)
        && let Some(entry) = entries.get_mut(usize::from(mask))
    {
        entry.a = 0;
    }
    entries
}

fn pack_row(pixels: &PixelData, target: PixelFormat, palette: &[Rgba<u8>], y: usize, mark_last: bool, out: &mut Vec<u8>) {
    fn row_of<T>(img: &imgref::ImgVec<T>, y: usize) -> &[T] {
        let (width, stride) = (img.width(), img.stride());
        &img.buf()[y * stride..y * stride + width]
    }
    match pixels {
        PixelData::Rgba8(img) if target.has_alpha_channel() => pixel::pack_rgba(row_of(img, y), mark_last, out),
        PixelData::Rgba8(img) => pixel::pack_rgb(row_of(img, y), out),
        PixelData::GrayAlpha8(img) if target.has_alpha_channel() => {
            pixel::pack_gray_alpha(row_of(img, y), mark_last, out)
        }
        PixelData::GrayAlpha8(img) => pixel::pack_gray(row_of(img, y), out),
        PixelData::Indexed8(img) if target == PixelFormat::Indexed => pixel::pack_indexed(row_of(img, y), out),
        PixelData::Indexed8(img) => pixel::pack_indexed_as_rgba(row_of(img, y), palette, mark_last, out),
    }
}

fn write_profile(session: &mut CodecSession<'_, '_>, profile: &ColorProfile) -> Result<()> {
    match profile {
        ColorProfile::None => Ok(()),
        ColorProfile::Srgb { gamma: None } => session.set_srgb(),
        ColorProfile::Srgb { gamma: Some(gamma) } => match gamma_fixed(*gamma) {
            Some(fixed) => session.set_gama(fixed),
            None => Ok(()),
        },
        ColorProfile::RgbPrimaries { primaries, gamma } => {
            session.set_chrm(primaries.to_fixed())?;
            match gamma.and_then(gamma_fixed) {
                Some(fixed) => session.set_gama(fixed),
                None => Ok(()),
            }
        }
        ColorProfile::Icc { name, data } => {
            if data.is_empty() {
                log::warn!("skipping empty ICC profile");
                return Ok(());
            }
            session.set_iccp(&profile_keyword(name), data)
        }
    }
}

fn gamma_fixed(gamma: f64) -> Option<i32> {
    if gamma.is_finite() && gamma > 0.0 {
        let fixed = color::gamma_to_fixed(gamma);
        if fixed > 0 {
            return Some(fixed);
        }
    }
    log::warn!("gamma {gamma} cannot be stored, skipping gAMA");
    None
}

/// A PNG keyword for the profile name: up to the first NUL, at most 79
/// bytes, never empty.
fn profile_keyword(name: &str) -> String {
    let name = name.split('\0').next().unwrap_or_default();
    let mut end = name.len().min(MAX_PROFILE_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    match &name[..end] {
        "" => DEFAULT_PROFILE_NAME.to_owned(),
        keyword => keyword.to_owned(),
    }
}
