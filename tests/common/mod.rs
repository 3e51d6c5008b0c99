//! Shared fixtures: an explicit sandbox and a hand-rolled PNG writer for
//! streams the encoder never produces (16-bit, sub-byte, interlaced, broken).

#![allow(dead_code)]

use pngbox::{DecodeOutput, DecoderConfig, EncodeOptions, EncodeOutput, EncoderConfig, Image, Sandbox};

pub const SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

pub fn sandbox() -> Sandbox {
    Sandbox::create("libpng.wasm").unwrap()
}

pub fn encode_bytes(sandbox: &Sandbox, image: &Image, options: EncodeOptions) -> (Vec<u8>, EncodeOutput) {
    let mut out = Vec::new();
    let written = EncoderConfig::new()
        .with_options(options)
        .job()
        .encode_to(sandbox, image, &mut out)
        .unwrap();
    (out, written)
}

pub fn decode_bytes(sandbox: &Sandbox, bytes: &[u8]) -> pngbox::Result<DecodeOutput> {
    let mut input = bytes;
    DecoderConfig::new().job().decode_from(sandbox, &mut input)
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    !crc
}

pub fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let start = out.len();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let crc = crc32(&out[start..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

pub fn ihdr(width: u32, height: u32, bit_depth: u8, color_type: u8, interlace: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity(13);
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&[bit_depth, color_type, 0, 0, interlace]);
    chunk(b"IHDR", &data)
}

/// A complete PNG: header, `before_idat` chunks verbatim, one IDAT holding
/// the zlib-compressed `scanlines` (filter bytes included), IEND.
pub fn png(header: Vec<u8>, before_idat: &[Vec<u8>], scanlines: &[u8]) -> Vec<u8> {
    let mut out = SIGNATURE.to_vec();
    out.extend_from_slice(&header);
    for extra in before_idat {
        out.extend_from_slice(extra);
    }
    let compressed = miniz_oxide::deflate::compress_to_vec_zlib(scanlines, 6);
    out.extend_from_slice(&chunk(b"IDAT", &compressed));
    out.extend_from_slice(&chunk(b"IEND", &[]));
    out
}

/// Scanlines with filter type 0 in front of each row.
pub fn unfiltered(rows: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for row in rows {
        out.push(0);
        out.extend_from_slice(row);
    }
    out
}

/// Chunk types in file order, skipping the signature.
pub fn chunk_types(bytes: &[u8]) -> Vec<[u8; 4]> {
    let mut types = Vec::new();
    let mut pos = SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        types.push(bytes[pos + 4..pos + 8].try_into().unwrap());
        pos += len + 12;
    }
    types
}

/// Payload of the first chunk of type `kind`.
pub fn chunk_data<'a>(bytes: &'a [u8], kind: &[u8; 4]) -> Option<&'a [u8]> {
    let mut pos = SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        if &bytes[pos + 4..pos + 8] == kind {
            return Some(&bytes[pos + 8..pos + 8 + len]);
        }
        pos += len + 12;
    }
    None
}
