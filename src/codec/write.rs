//! Write side of the codec.

use miniz_oxide::deflate;

use super::chunk;
use super::filter;
use super::read::check_profile;
use super::{CodecResult, Exports, Fault, Ihdr, check_dimension, check_info, ihdr_bytes};
use crate::abi::{self, Color16, ColorEntry, UnknownChunkRecord};
use crate::boundary::GuestPtr;
use crate::sandbox::GuestEnv;

/// Image data is split into IDAT chunks of this size.
const IDAT_CHUNK: usize = 8192;

const DEFLATE_LEVEL: u8 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Created,
    InfoWritten,
    Ended,
}

#[derive(Debug)]
struct PendingChunk {
    kind: [u8; 4],
    location: u8,
    data: Vec<u8>,
}

#[derive(Debug)]
pub(super) struct WriteStruct {
    pub(super) error_fn: u32,
    pub(super) info: GuestPtr,
    pub(super) write_fn: u32,
    skip_profile_check: bool,
    stage: Stage,
    ihdr: Option<Ihdr>,
    palette: Vec<ColorEntry>,
    trns_alpha: Vec<u8>,
    trns_color: Option<Color16>,
    srgb: Option<u8>,
    chrm: Option<[i32; 8]>,
    gama: Option<i32>,
    iccp: Option<(Vec<u8>, Vec<u8>)>,
    unknown: Vec<PendingChunk>,
    rows: u32,
    prev: Vec<u8>,
    filtered: Vec<u8>,
}

impl WriteStruct {
    pub(super) fn new(error_fn: u32) -> Self {
        Self {
            error_fn,
            info: GuestPtr::NULL,
            write_fn: 0,
            skip_profile_check: false,
            stage: Stage::Created,
            ihdr: None,
            palette: Vec::new(),
            trns_alpha: Vec::new(),
            trns_color: None,
            srgb: None,
            chrm: None,
            gama: None,
            iccp: None,
            unknown: Vec::new(),
            rows: 0,
            prev: Vec::new(),
            filtered: Vec::new(),
        }
    }

    pub(super) fn into_parts(self: Box<Self>) -> (Exports, GuestPtr, Vec<GuestPtr>) {
        (Exports::default(), self.info, Vec::new())
    }

    pub(super) fn set_option(&mut self, option: u32, onoff: u32) -> u32 {
        if option != abi::OPTION_SKIP_SRGB_CHECK_PROFILE {
            return abi::OPTION_INVALID;
        }
        let previous = self.skip_profile_check;
        self.skip_profile_check = onoff == abi::OPTION_ON;
        if previous { abi::OPTION_ON } else { abi::OPTION_OFF }
    }

    fn header(&self) -> CodecResult<Ihdr> {
        self.ihdr.ok_or_else(|| Fault::png("png_set_IHDR has not been called"))
    }

    fn editable(&self, info: GuestPtr) -> CodecResult<()> {
        check_info(self.info, info)?;
        if self.stage != Stage::Created {
            return Err(Fault::png("info struct already written"));
        }
        Ok(())
    }

    pub(super) fn set_ihdr(&mut self, info: GuestPtr, fields: [u32; 5]) -> CodecResult<u32> {
        self.editable(info)?;
        let [width, height, bit_depth, color_type, interlace] = fields;
        let narrow = |value: u32, what: &str| {
            u8::try_from(value).map_err(|_| Fault::png(format!("Invalid {what} in IHDR")))
        };
        let ihdr = Ihdr {
            width: check_dimension(width, "width")?,
            height: check_dimension(height, "height")?,
            bit_depth: narrow(bit_depth, "bit depth")?,
            color_type: narrow(color_type, "color type")?,
            interlace: narrow(interlace, "interlace method")?,
        };
        ihdr.check_format()?;
        match ihdr.interlace {
            abi::INTERLACE_NONE => {}
            abi::INTERLACE_ADAM7 => return Err(Fault::png("Interlaced writing is not supported")),
            _ => return Err(Fault::png("Unknown interlace method in IHDR")),
        }
        self.ihdr = Some(ihdr);
        Ok(0)
    }

    pub(super) fn set_plte(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr, palette: GuestPtr, count: u32) -> CodecResult<u32> {
        self.editable(info)?;
        let ihdr = self.header()?;
        let max = if ihdr.color_type == abi::COLOR_TYPE_PALETTE {
            1u32 << ihdr.bit_depth
        } else {
            abi::MAX_PALETTE_LENGTH
        };
        if count > max || (count == 0 && ihdr.color_type == abi::COLOR_TYPE_PALETTE) {
            return Err(Fault::png("Invalid palette length"));
        }
        self.palette = env.memory().load_array::<ColorEntry>(palette, count)?;
        Ok(0)
    }

    pub(super) fn set_trns(
        &mut self,
        env: &mut GuestEnv<'_>,
        info: GuestPtr,
        trans: GuestPtr,
        count: u32,
        color: GuestPtr,
    ) -> CodecResult<u32> {
        self.editable(info)?;
        let ihdr = self.header()?;
        match ihdr.color_type {
            abi::COLOR_TYPE_PALETTE => {
                if count == 0 || count > abi::MAX_PALETTE_LENGTH {
                    env.warn("png_set_tRNS: invalid transparency count, ignored");
                    return Ok(0);
                }
                self.trns_alpha = env.memory().read(trans, count)?.to_vec();
            }
            abi::COLOR_TYPE_GRAY | abi::COLOR_TYPE_RGB => {
                if color.is_null() {
                    return Ok(0);
                }
                let key: Color16 = env.memory().load(color)?;
                let limit = (1u32 << ihdr.bit_depth) - 1;
                let samples = if ihdr.color_type == abi::COLOR_TYPE_GRAY {
                    vec![key.gray]
                } else {
                    vec![key.red, key.green, key.blue]
                };
                if samples.iter().any(|&s| u32::from(s) > limit) {
                    env.warn("tRNS chunk has out-of-range samples for bit_depth");
                }
                self.trns_color = Some(key);
            }
            _ => env.warn("png_set_tRNS: ignored for images with an alpha channel"),
        }
        Ok(0)
    }

    pub(super) fn set_srgb(&mut self, info: GuestPtr, intent: u32) -> CodecResult<u32> {
        self.editable(info)?;
        let intent = u8::try_from(intent)
            .ok()
            .filter(|&i| i <= 3)
            .ok_or_else(|| Fault::png("sRGB: invalid rendering intent"))?;
        self.srgb = Some(intent);
        Ok(0)
    }

    pub(super) fn set_chrm(&mut self, info: GuestPtr, values: [i32; 8]) -> CodecResult<u32> {
        self.editable(info)?;
        if values.iter().any(|&v| v < 0) {
            return Err(Fault::png("cHRM: invalid chromaticities"));
        }
        self.chrm = Some(values);
        Ok(0)
    }

    pub(super) fn set_gama(&mut self, info: GuestPtr, gamma: i32) -> CodecResult<u32> {
        self.editable(info)?;
        if gamma <= 0 {
            return Err(Fault::png("gAMA: out of range"));
        }
        self.gama = Some(gamma);
        Ok(0)
    }

    pub(super) fn set_iccp(
        &mut self,
        env: &mut GuestEnv<'_>,
        info: GuestPtr,
        name: GuestPtr,
        compression: u32,
        profile: GuestPtr,
        len: u32,
    ) -> CodecResult<u32> {
        self.editable(info)?;
        if name.is_null() || profile.is_null() {
            return Ok(0);
        }
        if compression != abi::COMPRESSION_TYPE_BASE {
            env.warn("png_set_iCCP: unknown compression type, profile ignored");
            return Ok(0);
        }
        let keyword = match env.memory().c_string(name, abi::MAX_PROFILE_NAME)? {
            Some(keyword) if !keyword.is_empty() => keyword.to_vec(),
            _ => return Err(Fault::png("iCCP: invalid keyword")),
        };
        let data = env.memory().read(profile, len)?.to_vec();
        if let Err(reason) = check_profile(&data, self.skip_profile_check) {
            env.warn(&format!("png_set_iCCP: {reason}; profile ignored"));
            return Ok(0);
        }
        self.iccp = Some((keyword, data));
        Ok(0)
    }

    pub(super) fn set_unknown_chunks(
        &mut self,
        env: &mut GuestEnv<'_>,
        info: GuestPtr,
        chunks: GuestPtr,
        count: u32,
    ) -> CodecResult<u32> {
        self.editable(info)?;
        if count == 0 {
            return Ok(0);
        }
        let records = env.memory().load_array::<UnknownChunkRecord>(chunks, count)?;
        for record in records {
            let kind = [record.name[0], record.name[1], record.name[2], record.name[3]];
            if record.name[4] != 0 || !chunk::valid_name(&kind) {
                env.warn("png_set_unknown_chunks: invalid chunk name, ignored");
                continue;
            }
            if chunk::is_critical(&kind) {
                env.warn(&format!("{}: refusing to write unknown critical chunk", chunk::name(&kind)));
                continue;
            }
            if !matches!(record.location, abi::HAVE_IHDR | abi::HAVE_PLTE | abi::AFTER_IDAT) {
                env.warn(&format!("{}: invalid chunk location, ignored", chunk::name(&kind)));
                continue;
            }
            let data = if record.size == 0 {
                Vec::new()
            } else {
                env.memory().read(record.data, record.size)?.to_vec()
            };
            self.unknown.push(PendingChunk {
                kind,
                location: record.location,
                data,
            });
        }
        Ok(0)
    }

    pub(super) fn color_type(&self, info: GuestPtr) -> CodecResult<u32> {
        check_info(self.info, info)?;
        Ok(self.ihdr.map_or(0, |ihdr| u32::from(ihdr.color_type)))
    }

    // Output

    fn write_raw(&mut self, env: &mut GuestEnv<'_>, bytes: &[u8]) -> CodecResult<()> {
        if self.write_fn == 0 {
            return Err(Fault::png("Call to NULL write function"));
        }
        let len = u32::try_from(bytes.len()).map_err(|_| Fault::png("Out of memory"))?;
        let buf = env.memory_mut().alloc(len)?;
        env.memory_mut().write(buf, bytes)?;
        let outcome = env.call_write(self.write_fn, buf, len);
        env.memory_mut().free(buf)?;
        match outcome? {
            Ok(()) => Ok(()),
            Err(fault) => Err(Fault::Host(fault.message)),
        }
    }

    fn emit(&mut self, env: &mut GuestEnv<'_>, kind: [u8; 4], data: &[u8]) -> CodecResult<()> {
        self.write_raw(env, &chunk::encode(kind, data))
    }

    fn emit_unknown(&mut self, env: &mut GuestEnv<'_>, location: u8) -> CodecResult<()> {
        let chunks: Vec<([u8; 4], Vec<u8>)> = self
            .unknown
            .iter()
            .filter(|c| c.location == location)
            .map(|c| (c.kind, c.data.clone()))
            .collect();
        for (kind, data) in chunks {
            self.emit(env, kind, &data)?;
        }
        Ok(())
    }

    pub(super) fn write_info(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr) -> CodecResult<u32> {
        self.editable(info)?;
        let ihdr = self.header()?;
        let indexed = ihdr.color_type == abi::COLOR_TYPE_PALETTE;
        if indexed && self.palette.is_empty() {
            return Err(Fault::png("Valid palette required for paletted images"));
        }

        self.write_raw(env, &chunk::SIGNATURE)?;
        self.emit(env, chunk::IHDR, &ihdr_bytes(&ihdr))?;
        if let Some(gamma) = self.gama {
            self.emit(env, chunk::GAMA, &gamma.to_be_bytes())?;
        }
        if let Some((name, profile)) = self.iccp.take() {
            let mut data = name;
            data.extend_from_slice(&[0, 0]);
            data.extend(deflate::compress_to_vec_zlib(&profile, DEFLATE_LEVEL));
            self.emit(env, chunk::ICCP, &data)?;
        } else if let Some(intent) = self.srgb {
            self.emit(env, chunk::SRGB, &[intent])?;
        }
        if let Some(values) = self.chrm {
            let data: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
            self.emit(env, chunk::CHRM, &data)?;
        }
        self.emit_unknown(env, abi::HAVE_IHDR)?;

        if !self.palette.is_empty() && ihdr.color_type & 2 != 0 {
            let data: Vec<u8> = self.palette.iter().flat_map(|e| [e.red, e.green, e.blue]).collect();
            self.emit(env, chunk::PLTE, &data)?;
        }
        if let Some(trns) = self.trns_payload(&ihdr) {
            self.emit(env, chunk::TRNS, &trns)?;
        }
        self.emit_unknown(env, abi::HAVE_PLTE)?;

        self.prev = vec![0; ihdr.raw_rowbytes(ihdr.width)];
        self.stage = Stage::InfoWritten;
        Ok(0)
    }

    fn trns_payload(&self, ihdr: &Ihdr) -> Option<Vec<u8>> {
        match ihdr.color_type {
            abi::COLOR_TYPE_PALETTE if !self.trns_alpha.is_empty() => {
                let len = self.trns_alpha.len().min(self.palette.len());
                Some(self.trns_alpha[..len].to_vec())
            }
            abi::COLOR_TYPE_GRAY => self.trns_color.map(|key| key.gray.to_be_bytes().to_vec()),
            abi::COLOR_TYPE_RGB => self
                .trns_color
                .map(|key| [key.red, key.green, key.blue].iter().flat_map(|s| s.to_be_bytes()).collect()),
            _ => None,
        }
    }

    pub(super) fn write_row(&mut self, env: &mut GuestEnv<'_>, row: GuestPtr) -> CodecResult<u32> {
        if self.stage != Stage::InfoWritten {
            return Err(Fault::png("png_write_info was not called"));
        }
        let ihdr = self.header()?;
        if self.rows >= ihdr.height {
            return Err(Fault::png("Too many rows written"));
        }
        let rowbytes = u32::try_from(ihdr.raw_rowbytes(ihdr.width)).map_err(|_| Fault::png("Image too wide"))?;
        let line = env.memory().read(row, rowbytes)?.to_vec();
        if ihdr.color_type == abi::COLOR_TYPE_PALETTE || ihdr.bit_depth < 8 {
            self.filtered.push(filter::NONE);
            self.filtered.extend_from_slice(&line);
        } else {
            filter::filter_adaptive(&line, &self.prev, ihdr.filter_bpp(), &mut self.filtered);
        }
        self.prev = line;
        self.rows += 1;
        Ok(0)
    }

    pub(super) fn write_end(&mut self, env: &mut GuestEnv<'_>, info: GuestPtr) -> CodecResult<u32> {
        if !info.is_null() {
            check_info(self.info, info)?;
        }
        if self.stage != Stage::InfoWritten {
            return Err(Fault::png("png_write_end: png_write_info was not called"));
        }
        let ihdr = self.header()?;
        if self.rows != ihdr.height {
            return Err(Fault::png("No IDATs written into file"));
        }

        let compressed = deflate::compress_to_vec_zlib(&self.filtered, DEFLATE_LEVEL);
        self.filtered = Vec::new();
        for piece in compressed.chunks(IDAT_CHUNK) {
            self.emit(env, chunk::IDAT, piece)?;
        }
        self.emit_unknown(env, abi::AFTER_IDAT)?;
        self.emit(env, chunk::IEND, &[])?;
        self.stage = Stage::Ended;
        Ok(0)
    }
}
