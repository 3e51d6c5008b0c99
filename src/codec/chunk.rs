//! PNG chunk framing.

/// The eight-byte PNG signature.
pub(super) const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Largest value a PNG length field may hold.
pub(super) const MAX_CHUNK_LEN: u32 = 0x7FFF_FFFF;

pub(super) const IHDR: [u8; 4] = *b"IHDR";
pub(super) const PLTE: [u8; 4] = *b"PLTE";
pub(super) const IDAT: [u8; 4] = *b"IDAT";
pub(super) const IEND: [u8; 4] = *b"IEND";
pub(super) const TRNS: [u8; 4] = *b"tRNS";
pub(super) const GAMA: [u8; 4] = *b"gAMA";
pub(super) const CHRM: [u8; 4] = *b"cHRM";
pub(super) const SRGB: [u8; 4] = *b"sRGB";
pub(super) const ICCP: [u8; 4] = *b"iCCP";

const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
};

/// CRC-32 over the concatenation of `parts`.
pub(super) fn crc32(parts: &[&[u8]]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for part in parts {
        for &b in *part {
            crc = CRC_TABLE[((crc ^ u32::from(b)) & 0xFF) as usize] ^ (crc >> 8);
        }
    }
    crc ^ 0xFFFF_FFFF
}

/// Chunk type as printable text for messages.
pub(super) fn name(kind: &[u8; 4]) -> String {
    String::from_utf8_lossy(kind).into_owned()
}

/// Chunk types are four ASCII letters.
pub(super) fn valid_name(kind: &[u8; 4]) -> bool {
    kind.iter().all(u8::is_ascii_alphabetic)
}

/// Critical chunks have an uppercase first letter.
pub(super) fn is_critical(kind: &[u8; 4]) -> bool {
    kind[0] & 0x20 == 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct ChunkHeader {
    pub length: u32,
    pub kind: [u8; 4],
}

/// Frame `data` as a complete chunk: length, type, data, CRC.
pub(super) fn encode(kind: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc32(&[&kind, data]).to_be_bytes());
    out
}

pub(super) fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(super) fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}
