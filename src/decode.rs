//! Decode pipeline.
//!
//! [`DecoderConfig`] holds reusable settings; [`DecodeJob`] borrows a stop
//! token, a progress sink and the document's current color profile for one
//! call. The job drives a [`CodecSession`] through header, transforms,
//! palette, rows, trailing chunks and color chunks, and converts each row
//! into the host buffer as soon as it has been copied out of the domain.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use enough::{Stop, Unstoppable};
use rgb::{Rgb, Rgba};

use crate::color::ColorProfile;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::image::{Image, Palette, TransparentColorKey};
use crate::limits::{LimitExceeded, ResourceLimits};
use crate::marshal::{CodecSession, Header, Transparency};
use crate::pixel::{self, PixelData};
use crate::sandbox::{Sandbox, with_domain};
use crate::Progress;

/// Decode configuration.
///
/// Reusable and cheap to clone. Call [`job`](Self::job) for each decode.
#[derive(Clone, Debug, Default)]
pub struct DecoderConfig {
    limits: ResourceLimits,
}

impl DecoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Create a per-operation job for this config.
    pub fn job(&self) -> DecodeJob<'_> {
        DecodeJob {
            limits: self.limits,
            stop: &Unstoppable,
            progress: None,
            document_profile: None,
        }
    }
}

/// One decode call.
pub struct DecodeJob<'a> {
    limits: ResourceLimits,
    stop: &'a dyn Stop,
    progress: Option<&'a dyn Progress>,
    document_profile: Option<&'a ColorProfile>,
}

impl<'a> DecodeJob<'a> {
    /// Set cooperative cancellation token, checked after every row.
    ///
    /// A stop is not an error: the decode returns the rows read so far and
    /// [`DecodeOutput::is_complete`] reports `false`.
    pub fn with_stop(mut self, stop: &'a dyn Stop) -> Self {
        self.stop = stop;
        self
    }

    /// Receive the fraction of rows decoded, after every row.
    pub fn with_progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Override resource limits for this operation.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Profile the target document already has. A file without color
    /// chunks keeps it instead of falling back to sRGB.
    pub fn with_document_profile(mut self, profile: &'a ColorProfile) -> Self {
        self.document_profile = Some(profile);
        self
    }

    /// Decode the file at `path` on the process-wide domain.
    pub fn decode(self, path: impl AsRef<Path>) -> Result<DecodeOutput> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::FileOpen {
            path: path.to_owned(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        log::debug!("decoding {}", path.display());
        with_domain(|sandbox| self.decode_from(sandbox, &mut reader))?
    }

    /// Decode a PNG stream inside `sandbox`.
    pub fn decode_from(self, sandbox: &Sandbox, source: &mut dyn Read) -> Result<DecodeOutput> {
        let mut session = CodecSession::reader(sandbox, source, self.limits)?;

        session.read_info()?;
        let header = session.get_ihdr()?;
        log::debug!(
            "header {}x{} depth {} color type {}{}",
            header.width,
            header.height,
            header.bit_depth,
            header.color_type,
            if header.interlaced { " (Adam7)" } else { "" }
        );
        self.limits.check_dimensions(header.width, header.height)?;
        let format = PixelFormat::from_color_type(header.color_type).ok_or(Error::UnsupportedFormat {
            color_type: header.color_type,
        })?;

        session.set_strip_16()?;
        session.set_packing()?;
        if format == PixelFormat::Grayscale && header.bit_depth < 8 {
            session.set_expand_gray()?;
        }
        let passes = session.set_interlace_handling(header.interlaced)?;
        session.read_update_info()?;
        session.confirm_size(&header)?;
        let expected = header
            .width
            .checked_mul(format.channels())
            .ok_or(LimitExceeded::Memory {
                actual: u64::from(header.width) * u64::from(format.channels()),
                max: u64::from(u32::MAX),
            })?;
        let rowbytes = session.rowbytes(expected)?;

        self.limits.check_memory(host_buffer_bytes(format, &header))?;
        let width = header.width as usize;
        let height = header.height as usize;
        let mut pixels = PixelData::blank(format, width, height)?;

        let mut has_alpha = format.has_alpha_channel();
        let mut palette = None;
        let mut key = None;
        match format {
            PixelFormat::Indexed => {
                let decoded = read_palette(&mut session)?;
                has_alpha = decoded.entries.iter().any(|e| e.a < 255);
                palette = Some(decoded);
            }
            PixelFormat::Rgb | PixelFormat::Grayscale => {
                if let Some(Transparency::Key(color)) = session.get_trns(None)? {
                    // Samples were verified to fit 8 bits.
                    key = Some(if format == PixelFormat::Rgb {
                        TransparentColorKey::Rgb(Rgb::new(color.red as u8, color.green as u8, color.blue as u8))
                    } else {
                        TransparentColorKey::Gray(color.gray as u8)
                    });
                }
            }
            PixelFormat::Rgba | PixelFormat::GrayscaleAlpha => {}
        }

        let mut complete = true;
        let mut key_matched = false;
        let total_rows = f64::from(passes) * f64::from(header.height);
        'passes: for pass in 0..passes {
            let final_pass = pass + 1 == passes;
            for y in 0..header.height {
                let row = session.row_buffer(rowbytes)?;
                let bytes = session.read_row(&row)?;
                row.release();

                let matched = convert_row(&mut pixels, format, y as usize, &bytes, key);
                // Earlier passes hold placeholder samples.
                key_matched |= matched && final_pass;

                if let Some(progress) = self.progress {
                    progress.report((f64::from(pass) * f64::from(header.height) + f64::from(y + 1)) / total_rows);
                }
                // Once the last row is in, finish normally so trailing chunks are read.
                let last_row = final_pass && y + 1 == header.height;
                if !last_row && let Err(reason) = self.stop.check() {
                    log::debug!("decode stopped after pass {pass} row {y}: {reason:?}");
                    complete = false;
                    break 'passes;
                }
            }
        }
        has_alpha |= key_matched;

        if complete {
            session.read_end()?;
        }

        let resolved = ColorProfile::resolve(session.color_chunks()?);
        let embedded_profile = !resolved.is_none();
        let color_profile = if embedded_profile {
            resolved
        } else {
            match self.document_profile {
                Some(profile) if !profile.is_none() => profile.clone(),
                _ => ColorProfile::SRGB,
            }
        };
        let chunks = session.take_chunks();
        if !chunks.is_empty() {
            log::debug!("{} pass-through chunks", chunks.len());
        }
        drop(session);

        Ok(DecodeOutput {
            image: Image {
                pixels,
                format,
                has_alpha,
                palette,
                transparent_key: key,
                color_profile,
                chunks,
                has_background: false,
            },
            complete,
            embedded_profile,
        })
    }
}

/// Result of a decode.
#[derive(Clone, Debug)]
pub struct DecodeOutput {
    image: Image,
    complete: bool,
    embedded_profile: bool,
}

impl DecodeOutput {
    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn into_image(self) -> Image {
        self.image
    }

    /// `false` when a stop token ended the decode early. The image then
    /// holds the rows read before the stop.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the color profile came from the file rather than a default.
    pub fn has_embedded_profile(&self) -> bool {
        self.embedded_profile
    }
}

fn host_buffer_bytes(format: PixelFormat, header: &Header) -> u64 {
    let per_pixel: u64 = match format {
        PixelFormat::Rgb | PixelFormat::Rgba => 4,
        PixelFormat::Grayscale | PixelFormat::GrayscaleAlpha => 2,
        PixelFormat::Indexed => 1,
    };
    u64::from(header.width) * u64::from(header.height) * per_pixel
}

/// Palette plus per-entry alpha; the first fully transparent entry becomes
/// the mask index.
fn read_palette(session: &mut CodecSession<'_, '_>) -> Result<Palette> {
    let colors = session
        .get_plte()?
        .ok_or_else(|| Error::Codec("indexed image without a palette".to_owned()))?;
    let alpha = match session.get_trns(Some(colors.len() as u32))? {
        Some(Transparency::Alpha(alpha)) => alpha,
        _ => Vec::new(),
    };
    let entries = colors
        .iter()
        .enumerate()
        .map(|(i, c)| Rgba::new(c.red, c.green, c.blue, alpha.get(i).copied().unwrap_or(255)))
        .collect();
    let mask_index = alpha.iter().position(|&a| a == 0).map(|i| i as u8);
    Ok(Palette { entries, mask_index })
}

/// Convert one decoded row into row `y` of the host buffer. Returns whether
/// a color key matched.
fn convert_row(
    pixels: &mut PixelData,
    format: PixelFormat,
    y: usize,
    src: &[u8],
    key: Option<TransparentColorKey>,
) -> bool {
    fn row_of<T>(img: &mut imgref::ImgVec<T>, y: usize) -> &mut [T] {
        let (width, stride) = (img.width(), img.stride());
        &mut img.buf_mut()[y * stride..y * stride + width]
    }
    match (pixels, format, key) {
        (PixelData::Rgba8(img), PixelFormat::Rgba, _) => {
            pixel::unpack_rgba(src, row_of(img, y));
            false
        }
        (PixelData::Rgba8(img), _, key) => {
            let key = match key {
                Some(TransparentColorKey::Rgb(c)) => Some([c.r, c.g, c.b]),
                _ => None,
            };
            pixel::unpack_rgb(src, key, row_of(img, y))
        }
        (PixelData::GrayAlpha8(img), PixelFormat::GrayscaleAlpha, _) => {
            pixel::unpack_gray_alpha(src, row_of(img, y));
            false
        }
        (PixelData::GrayAlpha8(img), _, key) => {
            let key = match key {
                Some(TransparentColorKey::Gray(v)) => Some(v),
                _ => None,
            };
            pixel::unpack_gray(src, key, row_of(img, y))
        }
        (PixelData::Indexed8(img), _, _) => {
            pixel::unpack_indexed(src, row_of(img, y));
            false
        }
    }
}
