//! Binary interface between the host and the codec module.
//!
//! Constants mirror libpng's public values so the codec entry points look
//! the same from both sides. Composite values that live in linear memory
//! use the little-endian [`Wire`] layouts defined here.

use crate::boundary::{GuestPtr, Wire};

/// Version string the host was built against.
pub(crate) const LIBPNG_VER_STRING: &str = "1.6.37";

pub(crate) const COLOR_TYPE_GRAY: u8 = 0;
pub(crate) const COLOR_TYPE_RGB: u8 = 2;
pub(crate) const COLOR_TYPE_PALETTE: u8 = 3;
pub(crate) const COLOR_TYPE_GRAY_ALPHA: u8 = 4;
pub(crate) const COLOR_TYPE_RGB_ALPHA: u8 = 6;

pub(crate) const INTERLACE_NONE: u8 = 0;
pub(crate) const INTERLACE_ADAM7: u8 = 1;

pub(crate) const INFO_GAMA: u32 = 0x0001;
pub(crate) const INFO_CHRM: u32 = 0x0004;
pub(crate) const INFO_PLTE: u32 = 0x0008;
pub(crate) const INFO_TRNS: u32 = 0x0010;
pub(crate) const INFO_SRGB: u32 = 0x0800;
pub(crate) const INFO_ICCP: u32 = 0x1000;

pub(crate) const OPTION_SKIP_SRGB_CHECK_PROFILE: u32 = 4;
pub(crate) const OPTION_INVALID: u32 = 1;
pub(crate) const OPTION_ON: u32 = 3;
pub(crate) const OPTION_OFF: u32 = 2;

pub(crate) const HAVE_IHDR: u8 = 0x01;
pub(crate) const HAVE_PLTE: u8 = 0x02;
pub(crate) const AFTER_IDAT: u8 = 0x08;

pub(crate) const SRGB_INTENT_PERCEPTUAL: u32 = 0;

pub(crate) const COMPRESSION_TYPE_BASE: u32 = 0;

pub(crate) const MAX_PALETTE_LENGTH: u32 = 256;

/// Longest profile name a codec may hand out, including the terminator.
pub(crate) const MAX_PROFILE_NAME: u32 = 80;

/// Longest error message the host reads back from the codec.
pub(crate) const MAX_MESSAGE: u32 = 1024;

/// Entry points exported by the codec module.
///
/// Arguments are scalars and guest pointers only. Callback arguments are
/// slot numbers handed out by the domain's callback table.
#[derive(Clone, Debug)]
pub(crate) enum Call {
    CreateReadStruct { version: GuestPtr, error_fn: u32 },
    CreateWriteStruct { version: GuestPtr, error_fn: u32 },
    CreateInfoStruct { png: GuestPtr },
    DestroyReadStruct { png: GuestPtr, info: GuestPtr },
    DestroyWriteStruct { png: GuestPtr, info: GuestPtr },
    SetOption { png: GuestPtr, option: u32, onoff: u32 },
    SetReadUserChunkFn { png: GuestPtr, callback: u32 },
    SetReadFn { png: GuestPtr, callback: u32 },
    SetWriteFn { png: GuestPtr, callback: u32 },
    SetSigBytes { png: GuestPtr, count: u32 },
    ReadInfo { png: GuestPtr, info: GuestPtr },
    /// Out-parameters: width, height, bit depth, color type, interlace (u32 each).
    GetIhdr { png: GuestPtr, info: GuestPtr, out: [GuestPtr; 5] },
    SetStrip16 { png: GuestPtr },
    SetPacking { png: GuestPtr },
    SetExpandGray1_2_4To8 { png: GuestPtr },
    SetInterlaceHandling { png: GuestPtr },
    ReadUpdateInfo { png: GuestPtr, info: GuestPtr },
    GetImageWidth { png: GuestPtr, info: GuestPtr },
    GetImageHeight { png: GuestPtr, info: GuestPtr },
    GetPlte { png: GuestPtr, info: GuestPtr, palette: GuestPtr, count: GuestPtr },
    GetTrns { png: GuestPtr, info: GuestPtr, trans: GuestPtr, count: GuestPtr, color: GuestPtr },
    GetRowbytes { png: GuestPtr, info: GuestPtr },
    ReadRow { png: GuestPtr, row: GuestPtr, display: GuestPtr },
    ReadEnd { png: GuestPtr, info: GuestPtr },
    GetValid { png: GuestPtr, info: GuestPtr, flag: u32 },
    GetIccp {
        png: GuestPtr,
        info: GuestPtr,
        name: GuestPtr,
        compression: GuestPtr,
        profile: GuestPtr,
        len: GuestPtr,
    },
    /// Out-parameter: eight consecutive i32 cells (wx, wy, rx, ry, gx, gy, bx, by).
    GetChrmFixed { png: GuestPtr, info: GuestPtr, out: GuestPtr },
    GetGamaFixed { png: GuestPtr, info: GuestPtr, out: GuestPtr },
    SetIhdr {
        png: GuestPtr,
        info: GuestPtr,
        width: u32,
        height: u32,
        bit_depth: u32,
        color_type: u32,
        interlace: u32,
    },
    SetPlte { png: GuestPtr, info: GuestPtr, palette: GuestPtr, count: u32 },
    SetTrns { png: GuestPtr, info: GuestPtr, trans: GuestPtr, count: u32, color: GuestPtr },
    SetSrgb { png: GuestPtr, info: GuestPtr, intent: u32 },
    SetChrmFixed { png: GuestPtr, info: GuestPtr, values: [i32; 8] },
    SetGamaFixed { png: GuestPtr, info: GuestPtr, gamma: i32 },
    SetIccp {
        png: GuestPtr,
        info: GuestPtr,
        name: GuestPtr,
        compression: u32,
        profile: GuestPtr,
        len: u32,
    },
    SetUnknownChunks { png: GuestPtr, info: GuestPtr, chunks: GuestPtr, count: u32 },
    WriteInfo { png: GuestPtr, info: GuestPtr },
    GetColorType { png: GuestPtr, info: GuestPtr },
    WriteRow { png: GuestPtr, row: GuestPtr },
    WriteEnd { png: GuestPtr, info: GuestPtr },
}

impl Call {
    /// Entry point name, for logs.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::CreateReadStruct { .. } => "png_create_read_struct",
            Self::CreateWriteStruct { .. } => "png_create_write_struct",
            Self::CreateInfoStruct { .. } => "png_create_info_struct",
            Self::DestroyReadStruct { .. } => "png_destroy_read_struct",
            Self::DestroyWriteStruct { .. } => "png_destroy_write_struct",
            Self::SetOption { .. } => "png_set_option",
            Self::SetReadUserChunkFn { .. } => "png_set_read_user_chunk_fn",
            Self::SetReadFn { .. } => "png_set_read_fn",
            Self::SetWriteFn { .. } => "png_set_write_fn",
            Self::SetSigBytes { .. } => "png_set_sig_bytes",
            Self::ReadInfo { .. } => "png_read_info",
            Self::GetIhdr { .. } => "png_get_IHDR",
            Self::SetStrip16 { .. } => "png_set_strip_16",
            Self::SetPacking { .. } => "png_set_packing",
            Self::SetExpandGray1_2_4To8 { .. } => "png_set_expand_gray_1_2_4_to_8",
            Self::SetInterlaceHandling { .. } => "png_set_interlace_handling",
            Self::ReadUpdateInfo { .. } => "png_read_update_info",
            Self::GetImageWidth { .. } => "png_get_image_width",
            Self::GetImageHeight { .. } => "png_get_image_height",
            Self::GetPlte { .. } => "png_get_PLTE",
            Self::GetTrns { .. } => "png_get_tRNS",
            Self::GetRowbytes { .. } => "png_get_rowbytes",
            Self::ReadRow { .. } => "png_read_row",
            Self::ReadEnd { .. } => "png_read_end",
            Self::GetValid { .. } => "png_get_valid",
            Self::GetIccp { .. } => "png_get_iCCP",
            Self::GetChrmFixed { .. } => "png_get_cHRM_fixed",
            Self::GetGamaFixed { .. } => "png_get_gAMA_fixed",
            Self::SetIhdr { .. } => "png_set_IHDR",
            Self::SetPlte { .. } => "png_set_PLTE",
            Self::SetTrns { .. } => "png_set_tRNS",
            Self::SetSrgb { .. } => "png_set_sRGB",
            Self::SetChrmFixed { .. } => "png_set_cHRM_fixed",
            Self::SetGamaFixed { .. } => "png_set_gAMA_fixed",
            Self::SetIccp { .. } => "png_set_iCCP",
            Self::SetUnknownChunks { .. } => "png_set_unknown_chunks",
            Self::WriteInfo { .. } => "png_write_info",
            Self::GetColorType { .. } => "png_get_color_type",
            Self::WriteRow { .. } => "png_write_row",
            Self::WriteEnd { .. } => "png_write_end",
        }
    }
}

/// One palette entry as stored in linear memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ColorEntry {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Wire for ColorEntry {
    const SIZE: usize = 3;

    fn read_le(bytes: &[u8]) -> Self {
        Self {
            red: bytes[0],
            green: bytes[1],
            blue: bytes[2],
        }
    }

    fn write_le(&self, out: &mut [u8]) {
        out[..3].copy_from_slice(&[self.red, self.green, self.blue]);
    }
}

/// A 16-bit color value (transparent color key).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Color16 {
    pub index: u8,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub gray: u16,
}

impl Wire for Color16 {
    const SIZE: usize = 9;

    fn read_le(bytes: &[u8]) -> Self {
        Self {
            index: bytes[0],
            red: u16::read_le(&bytes[1..3]),
            green: u16::read_le(&bytes[3..5]),
            blue: u16::read_le(&bytes[5..7]),
            gray: u16::read_le(&bytes[7..9]),
        }
    }

    fn write_le(&self, out: &mut [u8]) {
        out[0] = self.index;
        self.red.write_le(&mut out[1..3]);
        self.green.write_le(&mut out[3..5]);
        self.blue.write_le(&mut out[5..7]);
        self.gray.write_le(&mut out[7..9]);
    }
}

/// An unknown chunk as exchanged with the codec: the name is four ASCII
/// letters plus a terminator, `data` points at `size` bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct UnknownChunkRecord {
    pub name: [u8; 5],
    pub location: u8,
    pub data: GuestPtr,
    pub size: u32,
}

impl Wire for UnknownChunkRecord {
    const SIZE: usize = 14;

    fn read_le(bytes: &[u8]) -> Self {
        let mut name = [0u8; 5];
        name.copy_from_slice(&bytes[..5]);
        Self {
            name,
            location: bytes[5],
            data: GuestPtr::read_le(&bytes[6..10]),
            size: u32::read_le(&bytes[10..14]),
        }
    }

    fn write_le(&self, out: &mut [u8]) {
        out[..5].copy_from_slice(&self.name);
        out[5] = self.location;
        self.data.write_le(&mut out[6..10]);
        self.size.write_le(&mut out[10..14]);
    }
}

/// Whether a codec reporting `version` can serve a host built against
/// [`LIBPNG_VER_STRING`]: major and minor must match.
pub(crate) fn version_compatible(version: &[u8]) -> bool {
    fn major_minor(v: &[u8]) -> Option<(&[u8], &[u8])> {
        let mut parts = v.split(|&b| b == b'.');
        Some((parts.next()?, parts.next()?))
    }
    match (major_minor(version), major_minor(LIBPNG_VER_STRING.as_bytes())) {
        (Some(theirs), Some(ours)) => theirs == ours,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let rec = UnknownChunkRecord {
            name: *b"teSt\0",
            location: AFTER_IDAT,
            data: GuestPtr::new(0x40),
            size: 3,
        };
        let mut buf = [0u8; UnknownChunkRecord::SIZE];
        rec.write_le(&mut buf);
        assert_eq!(&buf[..6], b"teSt\0\x08");
        assert_eq!(UnknownChunkRecord::read_le(&buf), rec);
    }

    #[test]
    fn version_match_ignores_patch_level() {
        assert!(version_compatible(b"1.6.40"));
        assert!(version_compatible(b"1.6"));
        assert!(!version_compatible(b"1.5.30"));
        assert!(!version_compatible(b"garbage"));
    }
}
