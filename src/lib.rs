//! PNG decode and encode through an isolated codec domain.
//!
//! The PNG codec runs inside a [`Sandbox`]: it sees only its own linear
//! memory and the callback slots it is handed, and a fault inside it poisons
//! the domain instead of the host. Everything it returns arrives as an
//! unverified boundary value that the host checks against an explicit bound
//! before using it.
//!
//! - [`decode`] / [`encode`]: path-based calls on the process-wide domain
//!   ([`create_domain`] / [`destroy_domain`])
//! - [`DecoderConfig`] / [`DecodeJob`]: decode with limits, cancellation,
//!   progress, or from any [`Read`](std::io::Read) inside an explicit sandbox
//! - [`EncoderConfig`] / [`EncodeJob`] / [`EncodeOptions`]: the same for
//!   encoding
//! - [`Image`] / [`PixelData`] / [`PixelFormat`]: the host image model
//! - [`ColorProfile`]: ICC, sRGB, chromaticities or gamma, one per image
//! - [`ChunkStore`]: unrecognized chunks, replayed byte for byte
//! - [`ResourceLimits`]: resource limit configuration
//!
//! ```no_run
//! pngbox::create_domain("libpng.wasm")?;
//! let decoded = pngbox::decode("in.png")?;
//! pngbox::encode(decoded.image(), pngbox::EncodeOptions::default(), "out.png")?;
//! pngbox::destroy_domain()?;
//! # Ok::<(), pngbox::Error>(())
//! ```

#![forbid(unsafe_code)]

mod abi;
mod boundary;
mod callback;
mod chunks;
mod codec;
mod color;
mod decode;
mod encode;
mod error;
mod format;
mod image;
mod limits;
mod marshal;
mod memory;
mod pixel;
mod sandbox;

use std::path::Path;

pub use boundary::BoundaryError;
pub use chunks::{Chunk, ChunkLocation, ChunkStore};
pub use color::{Chromaticities, ColorProfile, fixed_to_float, float_to_fixed};
pub use decode::{DecodeJob, DecodeOutput, DecoderConfig};
pub use encode::{EncodeJob, EncodeOptions, EncodeOutput, EncoderConfig};
pub use error::{DecodeError, DomainError, EncodeError, Error, Result, Trap};
pub use format::PixelFormat;
pub use image::{Image, Palette, TransparentColorKey};
pub use limits::{
    DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_ICC_BYTES, DEFAULT_MAX_MEMORY_BYTES, DEFAULT_MAX_PIXELS, LimitExceeded,
    ResourceLimits,
};
pub use memory::{AllocStats, DEFAULT_MEMORY_LIMIT};
pub use pixel::PixelData;
pub use sandbox::{Sandbox, create_domain, destroy_domain, domain_exists, with_domain};

// Re-exports for users.
pub use enough::{Stop, StopReason, Unstoppable};
pub use imgref::{Img, ImgRef, ImgVec};
pub use rgb;
pub use rgb::alt::GrayAlpha;
pub use rgb::{Rgb, Rgba};

/// Receives decode or encode progress as a fraction in `0.0..=1.0`.
pub trait Progress {
    fn report(&self, fraction: f64);
}

impl<F: Fn(f64)> Progress for F {
    fn report(&self, fraction: f64) {
        self(fraction)
    }
}

/// Decode the PNG file at `path` on the process-wide domain.
pub fn decode(path: impl AsRef<Path>) -> Result<DecodeOutput, DecodeError> {
    DecoderConfig::new().job().decode(path)
}

/// Encode `image` to `path` on the process-wide domain.
pub fn encode(image: &Image, options: EncodeOptions, path: impl AsRef<Path>) -> Result<EncodeOutput, EncodeError> {
    EncoderConfig::new().with_options(options).job().encode(image, path)
}
