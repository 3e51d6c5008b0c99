//! Typed pixel buffers and per-color-type row conversion.
//!
//! Uses `imgref::ImgVec` for 2D pixel data with typed pixels from the `rgb`
//! crate. The `unpack_*` functions turn one decoded 8-bit row into host
//! pixels, the `pack_*` functions do the reverse for the encoder. None of
//! them touch the domain; they only see bytes that were already copied out.

use imgref::ImgVec;
use rgb::Rgba;
use rgb::alt::GrayAlpha;

use crate::limits::LimitExceeded;

/// Decoded pixel data in a typed buffer.
///
/// RGB images share the `Rgba8` variant with RGBA images (alpha is 255
/// unless a transparent color key matched), and grayscale shares
/// `GrayAlpha8` with grayscale-alpha. Indexed images hold palette indices.
/// Width and height are embedded in the `ImgVec`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PixelData {
    Rgba8(ImgVec<Rgba<u8>>),
    GrayAlpha8(ImgVec<GrayAlpha<u8>>),
    Indexed8(ImgVec<u8>),
}

impl PixelData {
    /// Image width in pixels.
    pub fn width(&self) -> u32 {
        match self {
            PixelData::Rgba8(img) => img.width() as u32,
            PixelData::GrayAlpha8(img) => img.width() as u32,
            PixelData::Indexed8(img) => img.width() as u32,
        }
    }

    /// Image height in pixels.
    pub fn height(&self) -> u32 {
        match self {
            PixelData::Rgba8(img) => img.height() as u32,
            PixelData::GrayAlpha8(img) => img.height() as u32,
            PixelData::Indexed8(img) => img.height() as u32,
        }
    }

    /// Borrow as RGBA8 if that is the buffer type.
    pub fn as_rgba8(&self) -> Option<imgref::ImgRef<'_, Rgba<u8>>> {
        match self {
            PixelData::Rgba8(img) => Some(img.as_ref()),
            _ => None,
        }
    }

    /// Borrow as gray-alpha if that is the buffer type.
    pub fn as_gray_alpha8(&self) -> Option<imgref::ImgRef<'_, GrayAlpha<u8>>> {
        match self {
            PixelData::GrayAlpha8(img) => Some(img.as_ref()),
            _ => None,
        }
    }

    /// Borrow as palette indices if that is the buffer type.
    pub fn as_indexed8(&self) -> Option<imgref::ImgRef<'_, u8>> {
        match self {
            PixelData::Indexed8(img) => Some(img.as_ref()),
            _ => None,
        }
    }

    /// Whether any stored alpha is below 255. Always `false` for indices.
    pub fn any_translucent(&self) -> bool {
        match self {
            PixelData::Rgba8(img) => img.pixels().any(|p| p.a < 255),
            PixelData::GrayAlpha8(img) => img.pixels().any(|p| p.a < 255),
            PixelData::Indexed8(_) => false,
        }
    }

    /// Buffer of the right variant for `format`, filled with zeroes.
    ///
    /// The buffer is reserved fallibly, so a size the host cannot provide
    /// comes back as [`LimitExceeded::Allocation`].
    pub(crate) fn blank(format: crate::PixelFormat, width: usize, height: usize) -> Result<Self, LimitExceeded> {
        use crate::PixelFormat;
        Ok(match format {
            PixelFormat::Rgb | PixelFormat::Rgba => {
                PixelData::Rgba8(zeroed(Rgba::new(0, 0, 0, 0), width, height)?)
            }
            PixelFormat::Grayscale | PixelFormat::GrayscaleAlpha => {
                PixelData::GrayAlpha8(zeroed(GrayAlpha::new(0, 0), width, height)?)
            }
            PixelFormat::Indexed => PixelData::Indexed8(zeroed(0u8, width, height)?),
        })
    }
}

fn zeroed<T: Copy>(fill: T, width: usize, height: usize) -> Result<ImgVec<T>, LimitExceeded> {
    let bytes = (width as u64)
        .saturating_mul(height as u64)
        .saturating_mul(size_of::<T>() as u64);
    let len = width.checked_mul(height).ok_or(LimitExceeded::Allocation { bytes })?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| LimitExceeded::Allocation { bytes })?;
    buf.resize(len, fill);
    Ok(ImgVec::new(buf, width, height))
}

impl PartialEq for PixelData {
    fn eq(&self, other: &Self) -> bool {
        fn same<T: PartialEq>(a: &ImgVec<T>, b: &ImgVec<T>) -> bool {
            a.width() == b.width()
                && a.height() == b.height()
                && a.as_ref().rows().zip(b.as_ref().rows()).all(|(x, y)| x == y)
        }
        match (self, other) {
            (PixelData::Rgba8(a), PixelData::Rgba8(b)) => same(a, b),
            (PixelData::GrayAlpha8(a), PixelData::GrayAlpha8(b)) => same(a, b),
            (PixelData::Indexed8(a), PixelData::Indexed8(b)) => same(a, b),
            _ => false,
        }
    }
}

impl Eq for PixelData {}

impl From<ImgVec<Rgba<u8>>> for PixelData {
    fn from(img: ImgVec<Rgba<u8>>) -> Self {
        PixelData::Rgba8(img)
    }
}

impl From<ImgVec<GrayAlpha<u8>>> for PixelData {
    fn from(img: ImgVec<GrayAlpha<u8>>) -> Self {
        PixelData::GrayAlpha8(img)
    }
}

impl From<ImgVec<u8>> for PixelData {
    fn from(img: ImgVec<u8>) -> Self {
        PixelData::Indexed8(img)
    }
}

// --- decode side ---

pub(crate) fn unpack_rgba(src: &[u8], out: &mut [Rgba<u8>]) {
    for (px, s) in out.iter_mut().zip(src.chunks_exact(4)) {
        *px = Rgba::new(s[0], s[1], s[2], s[3]);
    }
}

/// Returns whether any pixel matched the key.
pub(crate) fn unpack_rgb(src: &[u8], key: Option<[u8; 3]>, out: &mut [Rgba<u8>]) -> bool {
    let mut matched = false;
    for (px, s) in out.iter_mut().zip(src.chunks_exact(3)) {
        let hit = key == Some([s[0], s[1], s[2]]);
        matched |= hit;
        *px = Rgba::new(s[0], s[1], s[2], if hit { 0 } else { 255 });
    }
    matched
}

pub(crate) fn unpack_gray_alpha(src: &[u8], out: &mut [GrayAlpha<u8>]) {
    for (px, s) in out.iter_mut().zip(src.chunks_exact(2)) {
        *px = GrayAlpha::new(s[0], s[1]);
    }
}

/// Returns whether any pixel matched the key.
pub(crate) fn unpack_gray(src: &[u8], key: Option<u8>, out: &mut [GrayAlpha<u8>]) -> bool {
    let mut matched = false;
    for (px, &v) in out.iter_mut().zip(src) {
        let hit = key == Some(v);
        matched |= hit;
        *px = GrayAlpha::new(v, if hit { 0 } else { 255 });
    }
    matched
}

pub(crate) fn unpack_indexed(src: &[u8], out: &mut [u8]) {
    let n = out.len().min(src.len());
    out[..n].copy_from_slice(&src[..n]);
}

// --- encode side ---

/// Alpha to write for one pixel, tracking whether the row is still opaque.
///
/// The marker pixel of a row that is opaque up to it is written as 254.
fn marked(opaque: &mut bool, alpha: u8, is_marker: bool) -> u8 {
    if *opaque {
        if alpha < 255 {
            *opaque = false;
        } else if is_marker {
            return 254;
        }
    }
    alpha
}

/// RGBA row. With `mark_last`, the last pixel may become alpha 254.
pub(crate) fn pack_rgba(src: &[Rgba<u8>], mark_last: bool, out: &mut Vec<u8>) {
    let last = src.len().wrapping_sub(1);
    let mut opaque = true;
    for (x, p) in src.iter().enumerate() {
        let a = marked(&mut opaque, p.a, mark_last && x == last);
        out.extend_from_slice(&[p.r, p.g, p.b, a]);
    }
}

pub(crate) fn pack_rgb(src: &[Rgba<u8>], out: &mut Vec<u8>) {
    for p in src {
        out.extend_from_slice(&[p.r, p.g, p.b]);
    }
}

/// Gray-alpha row. With `mark_last`, the last pixel may become alpha 254.
pub(crate) fn pack_gray_alpha(src: &[GrayAlpha<u8>], mark_last: bool, out: &mut Vec<u8>) {
    let last = src.len().wrapping_sub(1);
    let mut opaque = true;
    for (x, p) in src.iter().enumerate() {
        let a = marked(&mut opaque, p.a, mark_last && x == last);
        out.extend_from_slice(&[p.v, a]);
    }
}

pub(crate) fn pack_gray(src: &[GrayAlpha<u8>], out: &mut Vec<u8>) {
    out.extend(src.iter().map(|p| p.v));
}

pub(crate) fn pack_indexed(src: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(src);
}

/// Indexed row expanded through its palette to RGBA. Indices past the end
/// of the palette come out as transparent black.
pub(crate) fn pack_indexed_as_rgba(src: &[u8], palette: &[Rgba<u8>], mark_last: bool, out: &mut Vec<u8>) {
    let last = src.len().wrapping_sub(1);
    let mut opaque = true;
    for (x, &i) in src.iter().enumerate() {
        let p = palette.get(usize::from(i)).copied().unwrap_or_default();
        let a = marked(&mut opaque, p.a, mark_last && x == last);
        out.extend_from_slice(&[p.r, p.g, p.b, a]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rgb_key_becomes_transparent() {
        let mut out = [Rgba::new(0, 0, 0, 0); 2];
        let matched = unpack_rgb(&[1, 2, 3, 9, 9, 9], Some([9, 9, 9]), &mut out);
        assert!(matched);
        assert_eq!(out, [Rgba::new(1, 2, 3, 255), Rgba::new(9, 9, 9, 0)]);

        assert!(!unpack_rgb(&[1, 2, 3, 9, 9, 9], None, &mut out));
        assert_eq!(out[1].a, 255);
    }

    #[test]
    fn gray_key_becomes_transparent() {
        let mut out = [GrayAlpha::new(0, 0); 3];
        assert!(unpack_gray(&[0, 128, 255], Some(128), &mut out));
        assert_eq!(out, [GrayAlpha::new(0, 255), GrayAlpha::new(128, 0), GrayAlpha::new(255, 255)]);
    }

    #[test]
    fn marker_only_in_opaque_rows() {
        let opaque = [Rgba::new(1, 1, 1, 255), Rgba::new(2, 2, 2, 255)];
        let mut out = Vec::new();
        pack_rgba(&opaque, true, &mut out);
        assert_eq!(out, [1, 1, 1, 255, 2, 2, 2, 254]);

        let translucent = [Rgba::new(1, 1, 1, 10), Rgba::new(2, 2, 2, 255)];
        out.clear();
        pack_rgba(&translucent, true, &mut out);
        assert_eq!(out, [1, 1, 1, 10, 2, 2, 2, 255]);

        out.clear();
        pack_gray_alpha(&[GrayAlpha::new(7, 255)], true, &mut out);
        assert_eq!(out, [7, 254]);
    }

    #[test]
    fn indexed_promotion_uses_palette_alpha() {
        let palette = [Rgba::new(10, 20, 30, 255), Rgba::new(0, 0, 0, 0)];
        let mut out = Vec::new();
        pack_indexed_as_rgba(&[0, 1, 5], &palette, false, &mut out);
        assert_eq!(out, [10, 20, 30, 255, 0, 0, 0, 0, 0, 0, 0, 0]);

        out.clear();
        pack_indexed_as_rgba(&[0, 0], &palette, true, &mut out);
        assert_eq!(out, [10, 20, 30, 255, 10, 20, 30, 254]);
    }

    #[test]
    fn equality_compares_visible_pixels() {
        let a = PixelData::Indexed8(ImgVec::new(vec![1, 2, 3, 4], 2, 2));
        let b = PixelData::Indexed8(ImgVec::new(vec![1, 2, 3, 4], 2, 2));
        let c = PixelData::Indexed8(ImgVec::new(vec![1, 2, 3, 4], 4, 1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.width(), 2);
        assert!(!a.any_translucent());
    }

    proptest! {
        #[test]
        fn rgba_rows_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let n = bytes.len() / 4;
            let mut px = vec![Rgba::new(0, 0, 0, 0); n];
            unpack_rgba(&bytes, &mut px);
            let mut back = Vec::new();
            pack_rgba(&px, false, &mut back);
            prop_assert_eq!(&back[..], &bytes[..n * 4]);
        }

        #[test]
        fn keyed_rgb_rows_round_trip(
            bytes in proptest::collection::vec(any::<u8>(), 0..48),
            key in any::<[u8; 3]>(),
        ) {
            let n = bytes.len() / 3;
            let mut px = vec![Rgba::new(0, 0, 0, 0); n];
            let matched = unpack_rgb(&bytes, Some(key), &mut px);
            prop_assert_eq!(matched, px.iter().any(|p| p.a == 0));
            let mut back = Vec::new();
            pack_rgb(&px, &mut back);
            prop_assert_eq!(&back[..], &bytes[..n * 3]);
        }

        #[test]
        fn marker_touches_at_most_one_sample(alpha in proptest::collection::vec(any::<u8>(), 1..32)) {
            let px: Vec<GrayAlpha<u8>> = alpha.iter().map(|&a| GrayAlpha::new(0, a)).collect();
            let mut out = Vec::new();
            pack_gray_alpha(&px, true, &mut out);
            let written: Vec<u8> = out.chunks_exact(2).map(|c| c[1]).collect();
            let changed = written.iter().zip(&alpha).filter(|(w, a)| w != a).count();
            let all_opaque = alpha.iter().all(|&a| a == 255);
            prop_assert_eq!(changed, usize::from(all_opaque));
            if all_opaque {
                prop_assert_eq!(written.last().copied(), Some(254));
            }
        }
    }
}
