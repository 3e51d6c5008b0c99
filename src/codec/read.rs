//! Read side of the codec: signature, chunk walk, inflate and row delivery.

use miniz_oxide::inflate::{self, TINFLStatus};

use super::chunk::{self, ChunkHeader};
use super::filter::{self, Pass};
use super::{Exports, Fault, Ihdr, CodecResult, check_info, parse_ihdr, put};
use crate::abi::{self, Color16, ColorEntry, UnknownChunkRecord};
use crate::boundary::{GuestPtr, Wire};
use crate::sandbox::GuestEnv;

/// Read callback buffer size.
const IO_CHUNK: u32 = 8192;

/// Ancillary chunks larger than this are skipped unread.
const USER_CHUNK_MAX: u32 = 8 * 1024 * 1024;

/// Inflate cap for embedded ICC profiles.
const ICC_INFLATE_MAX: usize = 16 * 1024 * 1024;

/// ICC header size; the profile signature `acsp` sits at offset 36.
const ICC_HEADER_LEN: usize = 132;

#[derive(Debug, Default)]
pub(super) struct Transforms {
    pub strip_16: bool,
    pub packing: bool,
    pub expand_gray: bool,
    pub interlace: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Created,
    InfoRead,
    Updated,
    Ended,
}

#[derive(Debug, Default)]
struct Metadata {
    valid: u32,
    palette: Vec<ColorEntry>,
    trns_alpha: Vec<u8>,
    trns_color: Color16,
    gama: i32,
    chrm: [i32; 8],
    icc_name: Vec<u8>,
    icc_profile: Vec<u8>,
}

/// Output row geometry once transforms are fixed.
#[derive(Clone, Copy, Debug)]
struct Layout {
    /// Bytes per output sample; zero keeps packed sub-byte rows as stored.
    sample_bytes: usize,
    rowbytes: usize,
    /// Multiplier taking a sub-byte gray sample to 8 bits.
    scale: u8,
}

/// Inflated image data and the canvas rows are served from.
#[derive(Debug)]
struct Decoded {
    passes: Vec<Pass>,
    raw: Vec<u8>,
    cursor: usize,
    pass: usize,
    y: u32,
    canvas: Vec<u8>,
}

#[derive(Debug)]
pub(super) struct ReadStruct {
    pub(super) error_fn: u32,
    pub(super) info: GuestPtr,
    pub(super) read_fn: u32,
    pub(super) chunk_fn: u32,
    pub(super) transforms: Transforms,
    sig_bytes: u8,
    skip_profile_check: bool,
    stage: Stage,
    ihdr: Option<Ihdr>,
    seen_plte: bool,
    meta: Metadata,
    exports: Exports,
    io_buf: GuestPtr,
    pending: Option<ChunkHeader>,
    layout: Option<Layout>,
    image: Option<Decoded>,
}

impl ReadStruct {
    pub(super) fn new(error_fn: u32) -> Self {
        Self {
            error_fn,
            info: GuestPtr::NULL,
            read_fn: 0,
            chunk_fn: 0,
            transforms: Transforms::default(),
            sig_bytes: 0,
            skip_profile_check: false,
            stage: Stage::Created,
            ihdr: None,
            seen_plte: false,
            meta: Metadata::default(),
            exports: Exports::default(),
            io_buf: GuestPtr::NULL,
            pending: None,
            layout: None,
            image: None,
        }
    }

    pub(super) fn into_parts(self: Box<Self>) -> (Exports, GuestPtr, Vec<GuestPtr>) {
        (self.exports, self.info, vec![self.io_buf])
    }

    pub(super) fn set_option(&mut self, option: u32, onoff: u32) -> u32 {
        if option != abi::OPTION_SKIP_SRGB_CHECK_PROFILE {
            return abi::OPTION_INVALID;
        }
        let previous = self.skip_profile_check;
        self.skip_profile_check = onoff == abi::OPTION_ON;
        if previous { abi::OPTION_ON } else { abi::OPTION_OFF }
    }

    pub(super) fn set_sig_bytes(&mut self, count: u32) -> CodecResult<u32> {
        if count > chunk::SIGNATURE.len() as u32 {
            return Err(Fault::png("Too many bytes for PNG signature"));
        }
        self.sig_bytes = count as u8;
        Ok(0)
    }

    pub(super) fn set_interlace_handling(&mut self) -> u32 {
        self.transforms.interlace = true;
        match self.ihdr {
            Some(ihdr) if ihdr.interlace == abi::INTERLACE_ADAM7 => 7,
            _ => 1,
        }
    }

    fn header(&self) -> CodecResult<Ihdr> {
        self.ihdr.ok_or_else(|| Fault::png("png_read_info has not been called"))
    }

    // Stream access

    fn pull(&mut self, env: &mut GuestEnv<'_>, len: usize, mut sink: impl FnMut(&[u8])) -> CodecResult<()> {
        if self.read_fn == 0 {
            return Err(Fault::png("Call to NULL read function"));
        }
        if self.io_buf.is_null() {
            self.io_buf = env.memory_mut().alloc(IO_CHUNK)?;
        }
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(IO_CHUNK as usize) as u32;
            if let Err(fault) = env.call_read(self.read_fn, self.io_buf, n)? {
                return Err(Fault::Host(fault.message));
            }
            sink(env.memory().read(self.io_buf, n)?);
            remaining -= n as usize;
        }
        Ok(())
    }

    fn read_bytes(&mut self, env: &mut GuestEnv<'_>, len: usize) -> CodecResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(IO_CHUNK as usize));
        self.pull(env, len, |bytes| out.extend_from_slice(bytes))?;
        Ok(out)
    }

    fn next_header(&mut self, env: &mut GuestEnv<'_>) -> CodecResult<ChunkHeader> {
        if let Some(header) = self.pending.take() {
            return Ok(header);
        }
        let bytes = self.read_bytes(env, 8)?;
        let length = chunk::be_u32(&bytes[0..4]);
        let kind = [bytes[4], bytes[5], bytes[6], bytes[7]];
        if length > chunk::MAX_CHUNK_LEN {
            return Err(Fault::png("PNG unsigned integer out of range"));
        }
        if !chunk::valid_name(&kind) {
            return Err(Fault::png("invalid chunk type"));
        }
        Ok(ChunkHeader { length, kind })
    }

    /// Chunk data, or `None` when an ancillary chunk fails its CRC.
    fn read_body(&mut self, env: &mut GuestEnv<'_>, header: ChunkHeader) -> CodecResult<Option<Vec<u8>>> {
        let data = self.read_bytes(env, header.length as usize)?;
        let crc = chunk::be_u32(&self.read_bytes(env, 4)?);
        if crc == chunk::crc32(&[&header.kind, &data]) {
            return Ok(Some(data));
        }
        let message = format!("{}: CRC error", chunk::name(&header.kind));
        if chunk::is_critical(&header.kind) {
            return Err(Fault::png(message));
        }
        env.warn(&message);
        Ok(None)
    }

    fn critical_body(&mut self, env: &mut GuestEnv<'_>, header: ChunkHeader) -> CodecResult<Vec<u8>> {
        self.read_body(env, header)?
            .ok_or_else(|| Fault::png(format!("{}: CRC error", chunk::name(&header.kind))))
    }

    fn ancillary_body(&mut self, env: &mut GuestEnv<'_>, header: ChunkHeader) -> CodecResult<Option<Vec<u8>>> {
        if header.length > USER_CHUNK_MAX {
            env.warn(&format!("{}: chunk data is too large", chunk::name(&header.kind)));
            self.skip(env, header)?;
            return Ok(None);
        }
        self.read_body(env, header)
    }

    fn skip(&mut self, env: &mut GuestEnv<'_>, header: ChunkHeader) -> CodecResult<()> {
        self.pull(env, header.length as usize + 4, |_| {})
    }

    // Header chunks

    pub(super) fn read_info(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        if self.stage != Stage::Created {
            return Err(Fault::png("png_read_info: already called"));
        }
        let skip = usize::from(self.sig_bytes);
        let signature = self.read_bytes(env, chunk::SIGNATURE.len() - skip)?;
        if signature[..] != chunk::SIGNATURE[skip..] {
            return Err(Fault::png("Not a PNG file"));
        }

        loop {
            let header = self.next_header(env)?;
            let Some(ihdr) = self.ihdr else {
                if header.kind != chunk::IHDR {
                    return Err(Fault::png(format!("{}: missing IHDR", chunk::name(&header.kind))));
                }
                let data = self.critical_body(env, header)?;
                self.ihdr = Some(parse_ihdr(&data)?);
                continue;
            };

            match header.kind {
                chunk::IHDR => return Err(Fault::png("IHDR: out of place")),
                chunk::IEND => return Err(Fault::png("No image in file")),
                chunk::IDAT => {
                    if ihdr.color_type == abi::COLOR_TYPE_PALETTE && self.meta.valid & abi::INFO_PLTE == 0 {
                        return Err(Fault::png("Missing PLTE before IDAT"));
                    }
                    self.pending = Some(header);
                    break;
                }
                chunk::PLTE => {
                    let data = self.critical_body(env, header)?;
                    self.handle_plte(env, &ihdr, &data)?;
                }
                chunk::TRNS | chunk::GAMA | chunk::CHRM | chunk::SRGB | chunk::ICCP => {
                    if let Some(data) = self.ancillary_body(env, header)? {
                        self.handle_ancillary(env, &ihdr, header.kind, &data);
                    }
                }
                _ => {
                    let location = if self.seen_plte { abi::HAVE_PLTE } else { abi::HAVE_IHDR };
                    self.handle_unknown(env, header, location)?;
                }
            }
        }

        self.stage = Stage::InfoRead;
        Ok(0)
    }

    fn handle_plte(&mut self, env: &GuestEnv<'_>, ihdr: &Ihdr, data: &[u8]) -> CodecResult<()> {
        if self.seen_plte {
            return Err(Fault::png("PLTE: duplicate"));
        }
        self.seen_plte = true;
        let indexed = ihdr.color_type == abi::COLOR_TYPE_PALETTE;
        if ihdr.color_type & 2 == 0 {
            env.warn("PLTE: ignored in grayscale PNG");
            return Ok(());
        }
        let count = data.len() / 3;
        if data.len() % 3 != 0 || count == 0 || count > abi::MAX_PALETTE_LENGTH as usize {
            if indexed {
                return Err(Fault::png("PLTE: invalid"));
            }
            env.warn("PLTE: invalid");
            return Ok(());
        }
        let mut entries: Vec<ColorEntry> = data.chunks_exact(3).map(ColorEntry::read_le).collect();
        let max = 1usize << ihdr.bit_depth.min(8);
        if indexed && entries.len() > max {
            env.warn("PLTE: truncated to bit depth");
            entries.truncate(max);
        }
        self.meta.palette = entries;
        self.meta.valid |= abi::INFO_PLTE;
        Ok(())
    }

    /// Known ancillary chunks. Malformed ones are reported and dropped.
    fn handle_ancillary(&mut self, env: &GuestEnv<'_>, ihdr: &Ihdr, kind: [u8; 4], data: &[u8]) {
        let name = chunk::name(&kind);
        let flag = match kind {
            chunk::TRNS => abi::INFO_TRNS,
            chunk::GAMA => abi::INFO_GAMA,
            chunk::CHRM => abi::INFO_CHRM,
            chunk::SRGB => abi::INFO_SRGB,
            _ => abi::INFO_ICCP,
        };
        if self.meta.valid & flag != 0 {
            env.warn(&format!("{name}: duplicate"));
            return;
        }
        let outcome = match kind {
            chunk::TRNS => self.parse_trns(ihdr, data),
            chunk::GAMA => self.parse_gama(data),
            chunk::CHRM => self.parse_chrm(data),
            chunk::SRGB => parse_srgb(data),
            _ => self.parse_iccp(data),
        };
        match outcome {
            Ok(()) => self.meta.valid |= flag,
            Err(reason) => env.warn(&format!("{name}: {reason}")),
        }
    }

    fn parse_trns(&mut self, ihdr: &Ihdr, data: &[u8]) -> Result<(), &'static str> {
        match ihdr.color_type {
            abi::COLOR_TYPE_PALETTE => {
                if self.meta.valid & abi::INFO_PLTE == 0 {
                    return Err("missing PLTE");
                }
                if data.is_empty() || data.len() > self.meta.palette.len() {
                    return Err("invalid");
                }
                self.meta.trns_alpha = data.to_vec();
            }
            abi::COLOR_TYPE_GRAY => {
                if data.len() != 2 {
                    return Err("invalid");
                }
                self.meta.trns_color.gray = chunk::be_u16(data);
            }
            abi::COLOR_TYPE_RGB => {
                if data.len() != 6 {
                    return Err("invalid");
                }
                self.meta.trns_color.red = chunk::be_u16(&data[0..2]);
                self.meta.trns_color.green = chunk::be_u16(&data[2..4]);
                self.meta.trns_color.blue = chunk::be_u16(&data[4..6]);
            }
            _ => return Err("invalid with alpha channel"),
        }
        Ok(())
    }

    fn parse_gama(&mut self, data: &[u8]) -> Result<(), &'static str> {
        if data.len() != 4 {
            return Err("invalid");
        }
        match i32::try_from(chunk::be_u32(data)) {
            Ok(gamma) if gamma > 0 => {
                self.meta.gama = gamma;
                Ok(())
            }
            _ => Err("out of range"),
        }
    }

    fn parse_chrm(&mut self, data: &[u8]) -> Result<(), &'static str> {
        if data.len() != 32 {
            return Err("invalid");
        }
        let mut values = [0i32; 8];
        for (value, raw) in values.iter_mut().zip(data.chunks_exact(4)) {
            *value = i32::try_from(chunk::be_u32(raw)).map_err(|_| "out of range")?;
        }
        self.meta.chrm = values;
        Ok(())
    }

    fn parse_iccp(&mut self, data: &[u8]) -> Result<(), &'static str> {
        let nul = data.iter().position(|&b| b == 0).ok_or("bad keyword")?;
        let name = &data[..nul];
        if name.is_empty() || name.len() >= abi::MAX_PROFILE_NAME as usize {
            return Err("bad keyword");
        }
        if data.get(nul + 1) != Some(&0) {
            return Err("unknown compression type");
        }
        let profile = inflate::decompress_to_vec_zlib_with_limit(&data[nul + 2..], ICC_INFLATE_MAX)
            .map_err(|err| match err.status {
                TINFLStatus::HasMoreOutput => "profile too large",
                _ => "damaged compressed data",
            })?;
        check_profile(&profile, self.skip_profile_check)?;
        self.meta.icc_name = name.to_vec();
        self.meta.icc_profile = profile;
        Ok(())
    }

    fn handle_unknown(&mut self, env: &mut GuestEnv<'_>, header: ChunkHeader, location: u8) -> CodecResult<()> {
        let name = chunk::name(&header.kind);
        if chunk::is_critical(&header.kind) {
            return Err(Fault::png(format!("{name}: unknown critical chunk")));
        }
        let Some(data) = self.ancillary_body(env, header)? else {
            return Ok(());
        };
        if self.chunk_fn == 0 {
            return Ok(());
        }

        let payload = env.memory_mut().alloc(header.length)?;
        env.memory_mut().write(payload, &data)?;
        let record_ptr = env.memory_mut().alloc(UnknownChunkRecord::SIZE as u32)?;
        let mut chunk_name = [0u8; 5];
        chunk_name[..4].copy_from_slice(&header.kind);
        let record = UnknownChunkRecord {
            name: chunk_name,
            location,
            data: payload,
            size: header.length,
        };
        env.memory_mut().store(record_ptr, record)?;

        let answer = env.call_unknown_chunk(self.chunk_fn, record_ptr);
        let freed = env.memory_mut().free(record_ptr).and(env.memory_mut().free(payload));
        let answer = answer?;
        freed?;
        if answer < 0 {
            return Err(Fault::png(format!("{name}: error in user chunk")));
        }
        Ok(())
    }

    // Queries

    pub(super) fn get_ihdr(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr, out: [GuestPtr; 5]) -> CodecResult<u32> {
        check_info(self.info, info)?;
        let Some(ihdr) = self.ihdr else {
            return Ok(0);
        };
        let values = [
            ihdr.width,
            ihdr.height,
            u32::from(ihdr.bit_depth),
            u32::from(ihdr.color_type),
            u32::from(ihdr.interlace),
        ];
        for (ptr, value) in out.into_iter().zip(values) {
            put(env, ptr, value)?;
        }
        Ok(1)
    }

    pub(super) fn image_width(&self, info: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        Ok(self.ihdr.map_or(0, |ihdr| ihdr.width))
    }

    pub(super) fn image_height(&self, info: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        Ok(self.ihdr.map_or(0, |ihdr| ihdr.height))
    }

    pub(super) fn valid(&self, info: GuestPtr, flag: u32) -> CodecResult<u32> {
        check_info(self.info, info)?;
        Ok(self.meta.valid & flag)
    }

    pub(super) fn rowbytes(&self, info: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        let bytes = match (self.layout, self.ihdr) {
            (Some(layout), _) => layout.rowbytes,
            (None, Some(ihdr)) => ihdr.raw_rowbytes(ihdr.width),
            (None, None) => 0,
        };
        u32::try_from(bytes).map_err(|_| Fault::png("Image too wide to process in memory"))
    }

    pub(super) fn get_plte(
        &mut self,
        env: &mut GuestEnv<'_>,
        info: GuestPtr,
        palette: GuestPtr,
        count: GuestPtr,
    ) -> CodecResult<u32> {
        check_info(self.info, info)?;
        if self.meta.valid & abi::INFO_PLTE == 0 {
            return Ok(0);
        }
        let mut bytes = vec![0u8; self.meta.palette.len() * ColorEntry::SIZE];
        for (entry, out) in self.meta.palette.iter().zip(bytes.chunks_exact_mut(ColorEntry::SIZE)) {
            entry.write_le(out);
        }
        let ptr = self.exports.export(env, "PLTE", &bytes)?;
        put(env, palette, ptr)?;
        put(env, count, self.meta.palette.len() as u32)?;
        Ok(abi::INFO_PLTE)
    }

    pub(super) fn get_trns(
        &mut self,
        env: &mut GuestEnv<'_>,
        info: GuestPtr,
        trans: GuestPtr,
        count: GuestPtr,
        color: GuestPtr,
    ) -> CodecResult<u32> {
        check_info(self.info, info)?;
        if self.meta.valid & abi::INFO_TRNS == 0 {
            return Ok(0);
        }
        let ihdr = self.header()?;
        let (alpha, entries, key) = if ihdr.color_type == abi::COLOR_TYPE_PALETTE {
            let ptr = self.exports.export(env, "tRNS", &self.meta.trns_alpha)?;
            (ptr, self.meta.trns_alpha.len() as u32, Color16::default())
        } else {
            (GuestPtr::NULL, 1, self.key_in_output_space(&ihdr))
        };
        let mut key_bytes = [0u8; Color16::SIZE];
        key.write_le(&mut key_bytes);
        let key_ptr = self.exports.export(env, "trans_color", &key_bytes)?;

        put(env, trans, alpha)?;
        put(env, count, entries)?;
        put(env, color, key_ptr)?;
        Ok(abi::INFO_TRNS)
    }

    /// The color key as it compares against transformed output samples.
    fn key_in_output_space(&self, ihdr: &Ihdr) -> Color16 {
        let mut key = self.meta.trns_color;
        let adjust = |value: u16| -> u16 {
            if ihdr.bit_depth == 16 && self.transforms.strip_16 {
                value >> 8
            } else if ihdr.bit_depth < 8 && self.transforms.expand_gray {
                let max = (1u16 << ihdr.bit_depth) - 1;
                value.min(max) * (255 / max)
            } else {
                value
            }
        };
        key.gray = adjust(key.gray);
        key.red = adjust(key.red);
        key.green = adjust(key.green);
        key.blue = adjust(key.blue);
        key
    }

    pub(super) fn get_iccp(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr, out: [GuestPtr; 4]) -> CodecResult<u32> {
        check_info(self.info, info)?;
        if self.meta.valid & abi::INFO_ICCP == 0 {
            return Ok(0);
        }
        let mut name = self.meta.icc_name.clone();
        name.push(0);
        let name_ptr = self.exports.export(env, "iCCP name", &name)?;
        let profile_ptr = self.exports.export(env, "iCCP profile", &self.meta.icc_profile)?;
        let [name_out, compression_out, profile_out, len_out] = out;
        put(env, name_out, name_ptr)?;
        put(env, compression_out, abi::COMPRESSION_TYPE_BASE)?;
        put(env, profile_out, profile_ptr)?;
        put(env, len_out, self.meta.icc_profile.len() as u32)?;
        Ok(abi::INFO_ICCP)
    }

    pub(super) fn get_chrm(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr, out: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        if self.meta.valid & abi::INFO_CHRM == 0 {
            return Ok(0);
        }
        if !out.is_null() {
            env.memory_mut().store_array(out, &self.meta.chrm)?;
        }
        Ok(abi::INFO_CHRM)
    }

    pub(super) fn get_gama(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr, out: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        if self.meta.valid & abi::INFO_GAMA == 0 {
            return Ok(0);
        }
        put(env, out, self.meta.gama)?;
        Ok(abi::INFO_GAMA)
    }

    // Image data

    pub(super) fn read_update_info(&mut self, info: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        match self.stage {
            Stage::InfoRead => {}
            Stage::Created => return Err(Fault::png("png_read_update_info: png_read_info not called")),
            Stage::Updated | Stage::Ended => {
                return Err(Fault::png("png_read_update_info/png_start_read_image: duplicate call"));
            }
        }
        let ihdr = self.header()?;
        ihdr.check_format()?;
        let interlaced = ihdr.interlace == abi::INTERLACE_ADAM7;
        if interlaced && !self.transforms.interlace {
            return Err(Fault::png("Interlace handling should be turned on when using png_read_image"));
        }

        let channels = ihdr.channels() as usize;
        let width = ihdr.width as usize;
        let layout = if ihdr.bit_depth < 8 {
            let expand = self.transforms.expand_gray && ihdr.color_type == abi::COLOR_TYPE_GRAY;
            if expand || self.transforms.packing {
                let scale = if expand { 255 / ((1u8 << ihdr.bit_depth) - 1) } else { 1 };
                Layout {
                    sample_bytes: 1,
                    rowbytes: width * channels,
                    scale,
                }
            } else if interlaced {
                return Err(Fault::png("Interlaced sub-byte rows need png_set_packing"));
            } else {
                Layout {
                    sample_bytes: 0,
                    rowbytes: ihdr.raw_rowbytes(ihdr.width),
                    scale: 1,
                }
            }
        } else {
            let sample_bytes = if ihdr.bit_depth == 16 && !self.transforms.strip_16 { 2 } else { 1 };
            Layout {
                sample_bytes,
                rowbytes: width * channels * sample_bytes,
                scale: 1,
            }
        };
        self.layout = Some(layout);
        self.stage = Stage::Updated;
        Ok(0)
    }

    /// Gather every consecutive IDAT chunk's payload.
    fn collect_idat(&mut self, env: &mut GuestEnv<'_>, budget: u64) -> CodecResult<Vec<u8>> {
        let mut compressed = Vec::new();
        let mut header = self.next_header(env)?;
        while header.kind == chunk::IDAT {
            if compressed.len() as u64 + u64::from(header.length) > budget {
                return Err(Fault::png("Out of memory"));
            }
            compressed.extend(self.critical_body(env, header)?);
            header = self.next_header(env)?;
        }
        self.pending = Some(header);
        Ok(compressed)
    }

    fn start_image(&mut self, env: &mut GuestEnv<'_>, ihdr: &Ihdr, layout: &Layout) -> CodecResult<Decoded> {
        let passes = if ihdr.interlace == abi::INTERLACE_ADAM7 {
            filter::adam7(ihdr.width, ihdr.height)
        } else {
            filter::single(ihdr.width, ihdr.height)
        };
        let expected: u64 = passes
            .iter()
            .filter(|p| p.width > 0 && p.height > 0)
            .map(|p| u64::from(p.height) * (1 + ihdr.raw_rowbytes(p.width) as u64))
            .sum();
        let canvas_len = layout.rowbytes as u64 * u64::from(ihdr.height);
        let budget = u64::from(env.memory().limit());
        if expected + canvas_len > budget {
            return Err(Fault::png("Out of memory"));
        }

        let compressed = self.collect_idat(env, budget)?;
        let raw = match inflate::decompress_to_vec_zlib_with_limit(&compressed, expected as usize + 1) {
            Ok(raw) => raw,
            Err(err) if err.status == TINFLStatus::HasMoreOutput => err.output,
            Err(err) if err.output.len() as u64 >= expected => {
                env.warn("IDAT: damaged stream after image data");
                err.output
            }
            Err(_) => return Err(Fault::png("Not enough image data")),
        };
        if (raw.len() as u64) < expected {
            return Err(Fault::png("Not enough image data"));
        }
        if raw.len() as u64 > expected {
            env.warn("Too much image data");
        }

        Ok(Decoded {
            passes,
            raw,
            cursor: 0,
            pass: 0,
            y: 0,
            canvas: vec![0; canvas_len as usize],
        })
    }

    pub(super) fn read_row(&mut self, env: &mut GuestEnv<'_>, row: GuestPtr, display: GuestPtr) -> CodecResult<u32> {
        let layout = match (self.stage, self.layout) {
            (Stage::Updated, Some(layout)) => layout,
            (Stage::Ended, _) => return Err(Fault::png("png_read_row: image already finished")),
            _ => return Err(Fault::png("png_read_row: png_read_update_info not called")),
        };
        let ihdr = self.header()?;
        if self.image.is_none() {
            self.image = Some(self.start_image(env, &ihdr, &layout)?);
        }
        let Some(image) = self.image.as_mut() else {
            return Err(Fault::png("png_read_row: no image data"));
        };
        let line = image.next_row(&ihdr, &layout)?;
        for target in [row, display] {
            if !target.is_null() {
                env.memory_mut().write(target, &line)?;
            }
        }
        Ok(0)
    }

    pub(super) fn read_end(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        match self.stage {
            Stage::Created => return Err(Fault::png("png_read_end: png_read_info not called")),
            Stage::Ended => return Ok(0),
            Stage::InfoRead | Stage::Updated => {}
        }
        if self.image.is_none() {
            let budget = u64::from(env.memory().limit());
            self.collect_idat(env, budget)?;
        }

        loop {
            let header = self.next_header(env)?;
            match header.kind {
                chunk::IEND => {
                    self.critical_body(env, header)?;
                    break;
                }
                chunk::IDAT => return Err(Fault::png("Too many IDATs found")),
                chunk::IHDR | chunk::PLTE => {
                    return Err(Fault::png(format!("{}: out of place", chunk::name(&header.kind))));
                }
                chunk::TRNS | chunk::GAMA | chunk::CHRM | chunk::SRGB | chunk::ICCP => {
                    env.warn(&format!("{}: out of place", chunk::name(&header.kind)));
                    self.skip(env, header)?;
                }
                _ => self.handle_unknown(env, header, abi::AFTER_IDAT)?,
            }
        }
        self.stage = Stage::Ended;
        Ok(0)
    }
}

impl Decoded {
    /// Next output row. Each pass serves every canvas row once, so an
    /// interlaced image yields `7 * height` rows with the final pass
    /// leaving the canvas complete.
    fn next_row(&mut self, ihdr: &Ihdr, layout: &Layout) -> CodecResult<Vec<u8>> {
        if self.pass >= self.passes.len() {
            return Err(Fault::png("Read past the last image row"));
        }
        if self.y == 0 {
            self.decode_pass(ihdr, layout)?;
        }
        let start = self.y as usize * layout.rowbytes;
        let line = self.canvas[start..start + layout.rowbytes].to_vec();
        self.y += 1;
        if self.y == ihdr.height {
            self.y = 0;
            self.pass += 1;
        }
        Ok(line)
    }

    fn decode_pass(&mut self, ihdr: &Ihdr, layout: &Layout) -> CodecResult<()> {
        let pass = self.passes[self.pass];
        if pass.width == 0 || pass.height == 0 {
            return Ok(());
        }
        let raw_len = ihdr.raw_rowbytes(pass.width);
        let bpp = ihdr.filter_bpp();
        let channels = ihdr.channels() as usize;
        let mut prev = vec![0u8; raw_len];

        for py in 0..pass.height {
            let end = self.cursor + 1 + raw_len;
            let Some(src) = self.raw.get(self.cursor..end) else {
                return Err(Fault::png("Not enough image data"));
            };
            let mut line = src[1..].to_vec();
            if !filter::unfilter(src[0], &mut line, &prev, bpp) {
                return Err(Fault::png("bad adaptive filter value"));
            }
            self.cursor = end;

            let y = pass.y0 + py * pass.dy;
            let row_start = y as usize * layout.rowbytes;
            if layout.sample_bytes == 0 {
                self.canvas[row_start..row_start + raw_len].copy_from_slice(&line);
            } else {
                let pixel_bytes = channels * layout.sample_bytes;
                for px in 0..pass.width {
                    let x = pass.x0 + px * pass.dx;
                    let dst = row_start + x as usize * pixel_bytes;
                    for c in 0..channels {
                        let sample = px as usize * channels + c;
                        let at = dst + c * layout.sample_bytes;
                        store_sample(&mut self.canvas[at..at + layout.sample_bytes], &line, sample, ihdr.bit_depth, layout.scale);
                    }
                }
            }
            prev = line;
        }
        Ok(())
    }
}

/// Copy sample number `index` of a defiltered row into `out`, which is one
/// or two bytes wide.
fn store_sample(out: &mut [u8], line: &[u8], index: usize, depth: u8, scale: u8) {
    match depth {
        16 => {
            out[0] = line[index * 2];
            if out.len() == 2 {
                out[1] = line[index * 2 + 1];
            }
        }
        8 => out[0] = line[index],
        _ => {
            let depth = usize::from(depth);
            let bit = index * depth;
            let shift = 8 - depth - bit % 8;
            let mask = (1u8 << depth) - 1;
            out[0] = ((line[bit / 8] >> shift) & mask) * scale;
        }
    }
}

fn parse_srgb(data: &[u8]) -> Result<(), &'static str> {
    match data {
        [intent] if *intent <= 3 => Ok(()),
        [_] => Err("invalid rendering intent"),
        _ => Err("invalid"),
    }
}

/// Sanity checks on an inflated ICC profile. `lenient` keeps any non-empty
/// profile.
pub(super) fn check_profile(profile: &[u8], lenient: bool) -> Result<(), &'static str> {
    if profile.is_empty() {
        return Err("empty profile");
    }
    if lenient {
        return Ok(());
    }
    if profile.len() < ICC_HEADER_LEN {
        return Err("profile too short");
    }
    if chunk::be_u32(&profile[0..4]) as usize != profile.len() {
        return Err("length does not match profile");
    }
    if &profile[36..40] != b"acsp" {
        return Err("invalid signature");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_byte_samples_unpack_and_scale() {
        let line = [0b1011_0001u8];
        let mut out = [0u8; 1];
        store_sample(&mut out, &line, 0, 2, 85);
        assert_eq!(out[0], 2 * 85);
        store_sample(&mut out, &line, 3, 2, 1);
        assert_eq!(out[0], 1);
        store_sample(&mut out, &line, 0, 1, 255);
        assert_eq!(out[0], 255);
        store_sample(&mut out, &line, 1, 1, 255);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn sixteen_bit_samples_strip_to_high_byte() {
        let line = [0x12u8, 0x34, 0xAB, 0xCD];
        let mut one = [0u8; 1];
        store_sample(&mut one, &line, 1, 16, 1);
        assert_eq!(one, [0xAB]);
        let mut two = [0u8; 2];
        store_sample(&mut two, &line, 0, 16, 1);
        assert_eq!(two, [0x12, 0x34]);
    }

    #[test]
    fn profile_checks_depend_on_option() {
        assert_eq!(check_profile(&[], true), Err("empty profile"));
        assert_eq!(check_profile(b"junk", true), Ok(()));
        assert_eq!(check_profile(b"junk", false), Err("profile too short"));

        let mut profile = vec![0u8; 200];
        profile[0..4].copy_from_slice(&200u32.to_be_bytes());
        assert_eq!(check_profile(&profile, false), Err("invalid signature"));
        profile[36..40].copy_from_slice(b"acsp");
        assert_eq!(check_profile(&profile, false), Ok(()));
        profile[3] = 199;
        assert_eq!(check_profile(&profile, false), Err("length does not match profile"));
    }

    #[test]
    fn srgb_intent_is_range_checked() {
        assert!(parse_srgb(&[0]).is_ok());
        assert!(parse_srgb(&[4]).is_err());
        assert!(parse_srgb(&[0, 0]).is_err());
    }

    #[test]
    fn option_reports_previous_setting() {
        let mut s = ReadStruct::new(0);
        assert_eq!(s.set_option(abi::OPTION_SKIP_SRGB_CHECK_PROFILE, abi::OPTION_ON), abi::OPTION_OFF);
        assert_eq!(s.set_option(abi::OPTION_SKIP_SRGB_CHECK_PROFILE, abi::OPTION_OFF), abi::OPTION_ON);
        assert_eq!(s.set_option(99, abi::OPTION_ON), abi::OPTION_INVALID);
    }

    #[test]
    fn key_is_reported_in_output_space() {
        let mut s = ReadStruct::new(0);
        s.meta.trns_color.gray = 2;
        let gray2 = Ihdr {
            width: 1,
            height: 1,
            bit_depth: 2,
            color_type: abi::COLOR_TYPE_GRAY,
            interlace: 0,
        };
        s.transforms.expand_gray = true;
        assert_eq!(s.key_in_output_space(&gray2).gray, 170);

        s.meta.trns_color.gray = 0x1234;
        s.transforms.strip_16 = true;
        let gray16 = Ihdr { bit_depth: 16, ..gray2 };
        assert_eq!(s.key_in_output_space(&gray16).gray, 0x12);
    }
}
