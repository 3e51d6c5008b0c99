//! The untrusted PNG codec module.
//!
//! Everything in here runs inside the isolated domain: it sees only scalar
//! arguments, guest pointers into linear memory, and the callback slots it
//! was handed. State the host needs to read (palette, transparency, profile)
//! is exported into linear memory and handed out by address, the same way a
//! C codec hands out pointers into its own structures.

mod chunk;
mod filter;
mod read;
mod write;

use std::collections::BTreeMap;
use std::path::Path;

use crate::abi::{self, Call};
use crate::boundary::GuestPtr;
use crate::error::{DomainError, Trap};
use crate::sandbox::GuestEnv;

use read::ReadStruct;
use write::WriteStruct;

/// A codec module instance living in the domain.
pub(crate) trait CodecModule {
    fn name(&self) -> &'static str;

    /// Run one entry point to completion.
    fn call(&mut self, env: &mut GuestEnv<'_>, call: &Call) -> Result<u32, GuestAbort>;
}

/// How control left the module when an entry point did not return normally.
#[derive(Debug)]
pub(crate) enum GuestAbort {
    /// The codec reported an error through its error handler and unwound.
    Error,
    /// The codec faulted.
    Trap(Trap),
}

impl From<Trap> for GuestAbort {
    fn from(trap: Trap) -> Self {
        Self::Trap(trap)
    }
}

/// Resolve a module path to a module. Only the PNG codec ships with the
/// crate; it answers to `libpng` with any directory and extension.
pub(crate) fn load(path: &Path) -> Result<Box<dyn CodecModule + Send>, DomainError> {
    let stem = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .unwrap_or_default();
    match stem {
        "libpng" | "libpng16" => Ok(Box::new(PngModule::default())),
        "" => Err(DomainError::ModuleLoad {
            path: path.to_owned(),
            reason: "empty module name".to_owned(),
        }),
        other => Err(DomainError::ModuleLoad {
            path: path.to_owned(),
            reason: format!("no codec module named {other:?}"),
        }),
    }
}

/// Internal failure of a codec routine, turned into a [`GuestAbort`] at the
/// entry point.
#[derive(Debug)]
pub(super) enum Fault {
    /// A codec error with its message.
    Png(String),
    /// A host callback asked the codec to fail with a domain-resident message.
    Host(GuestPtr),
    Trap(Trap),
}

impl Fault {
    pub(super) fn png(message: impl Into<String>) -> Self {
        Self::Png(message.into())
    }

    /// Run the codec's error path: hand the message to the registered error
    /// handler, then unwind.
    fn raise(self, env: &mut GuestEnv<'_>, error_fn: u32) -> GuestAbort {
        match self {
            Fault::Trap(trap) => GuestAbort::Trap(trap),
            Fault::Host(message) if error_fn != 0 && !message.is_null() => {
                match env.call_error(error_fn, message) {
                    Ok(()) => GuestAbort::Error,
                    Err(trap) => GuestAbort::Trap(trap),
                }
            }
            Fault::Host(_) => GuestAbort::Error,
            Fault::Png(text) => {
                if error_fn == 0 {
                    return GuestAbort::Error;
                }
                let ptr = match env.memory_mut().alloc_c_string(text.as_bytes()) {
                    Ok(ptr) => ptr,
                    Err(trap) => return GuestAbort::Trap(trap),
                };
                let called = env.call_error(error_fn, ptr);
                let freed = env.memory_mut().free(ptr);
                match called.and(freed) {
                    Ok(()) => GuestAbort::Error,
                    Err(trap) => GuestAbort::Trap(trap),
                }
            }
        }
    }
}

impl From<Trap> for Fault {
    fn from(trap: Trap) -> Self {
        Self::Trap(trap)
    }
}

pub(super) type CodecResult<T> = Result<T, Fault>;

/// Image header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Ihdr {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub color_type: u8,
    pub interlace: u8,
}

impl Ihdr {
    pub(super) fn channels(&self) -> u32 {
        match self.color_type {
            abi::COLOR_TYPE_RGB => 3,
            abi::COLOR_TYPE_GRAY_ALPHA => 2,
            abi::COLOR_TYPE_RGB_ALPHA => 4,
            _ => 1,
        }
    }

    /// Validate the color type / bit depth pairing.
    pub(super) fn check_format(&self) -> CodecResult<()> {
        let allowed: &[u8] = match self.color_type {
            abi::COLOR_TYPE_GRAY => &[1, 2, 4, 8, 16],
            abi::COLOR_TYPE_PALETTE => &[1, 2, 4, 8],
            abi::COLOR_TYPE_RGB | abi::COLOR_TYPE_GRAY_ALPHA | abi::COLOR_TYPE_RGB_ALPHA => &[8, 16],
            _ => return Err(Fault::png("Invalid color type in IHDR")),
        };
        if allowed.contains(&self.bit_depth) {
            Ok(())
        } else {
            Err(Fault::png("Invalid color type/bit depth combination in IHDR"))
        }
    }

    /// Bytes in an unfiltered row of `width` pixels at the stored depth.
    pub(super) fn raw_rowbytes(&self, width: u32) -> usize {
        let bits = u64::from(width) * u64::from(self.channels()) * u64::from(self.bit_depth);
        bits.div_ceil(8) as usize
    }

    /// Filter unit: bytes per complete pixel, at least one.
    pub(super) fn filter_bpp(&self) -> usize {
        ((self.channels() * u32::from(self.bit_depth)) / 8).max(1) as usize
    }
}

fn check_dimension(value: u32, what: &str) -> CodecResult<u32> {
    if value == 0 || value > chunk::MAX_CHUNK_LEN {
        Err(Fault::png(format!("Invalid image {what} in IHDR")))
    } else {
        Ok(value)
    }
}

/// Codec memory handed out to the host by address, released with the struct.
#[derive(Debug, Default)]
pub(super) struct Exports {
    by_key: BTreeMap<&'static str, GuestPtr>,
}

impl Exports {
    /// Place `bytes` in linear memory once under `key` and return the address.
    pub(super) fn export(&mut self, env: &mut GuestEnv<'_>, key: &'static str, bytes: &[u8]) -> Result<GuestPtr, Trap> {
        if let Some(&ptr) = self.by_key.get(key) {
            return Ok(ptr);
        }
        let len = u32::try_from(bytes.len()).map_err(|_| Trap::OutOfMemory { requested: u32::MAX })?;
        let ptr = env.memory_mut().alloc(len)?;
        env.memory_mut().write(ptr, bytes)?;
        self.by_key.insert(key, ptr);
        Ok(ptr)
    }

    fn release(self, env: &mut GuestEnv<'_>) -> Result<(), Trap> {
        for ptr in self.by_key.into_values() {
            env.memory_mut().free(ptr)?;
        }
        Ok(())
    }
}

/// Store `value` through an out-parameter unless the host passed null.
pub(super) fn put<T: crate::boundary::Wire>(env: &mut GuestEnv<'_>, out: GuestPtr, value: T) -> Result<(), Trap> {
    if out.is_null() {
        return Ok(());
    }
    env.memory_mut().store(out, value)
}

enum PngStruct {
    Read(Box<ReadStruct>),
    Write(Box<WriteStruct>),
}

impl PngStruct {
    fn error_fn(&self) -> u32 {
        match self {
            Self::Read(s) => s.error_fn,
            Self::Write(s) => s.error_fn,
        }
    }

    fn info_mut(&mut self) -> &mut GuestPtr {
        match self {
            Self::Read(s) => &mut s.info,
            Self::Write(s) => &mut s.info,
        }
    }
}

/// Structure handles double as the struct's identity: each is a small
/// allocation in linear memory keyed by address.
#[derive(Default)]
pub(crate) struct PngModule {
    structs: BTreeMap<u32, PngStruct>,
}

const HANDLE_SIZE: u32 = 16;

impl PngModule {
    fn create(&mut self, env: &mut GuestEnv<'_>, version: GuestPtr, error_fn: u32, reading: bool) -> Result<u32, GuestAbort> {
        let compatible = env
            .memory()
            .c_string(version, 32)?
            .is_some_and(abi::version_compatible);
        if !compatible {
            // libpng reports the mismatch and returns null.
            let _ = Fault::png("Incompatible libpng version in application and library")
                .raise(env, error_fn);
            return Ok(0);
        }
        let handle = env.memory_mut().alloc(HANDLE_SIZE)?;
        let state = if reading {
            PngStruct::Read(Box::new(ReadStruct::new(error_fn)))
        } else {
            PngStruct::Write(Box::new(WriteStruct::new(error_fn)))
        };
        self.structs.insert(handle.addr(), state);
        Ok(handle.addr())
    }

    fn create_info(&mut self, env: &mut GuestEnv<'_>, png: GuestPtr) -> Result<u32, GuestAbort> {
        let state = self.structs.get_mut(&png.addr()).ok_or_else(|| bad_handle(png))?;
        if !state.info_mut().is_null() {
            let error_fn = state.error_fn();
            return Err(Fault::png("info struct already created").raise(env, error_fn));
        }
        let info = env.memory_mut().alloc(HANDLE_SIZE)?;
        *state.info_mut() = info;
        Ok(info.addr())
    }

    /// Free a control struct and its info struct. A non-null `info` must be
    /// the one created for `png`.
    fn destroy(&mut self, env: &mut GuestEnv<'_>, png: GuestPtr, info: GuestPtr) -> Result<u32, GuestAbort> {
        if png.is_null() {
            return Ok(0);
        }
        let own_info = self
            .structs
            .get_mut(&png.addr())
            .map(|state| *state.info_mut())
            .ok_or_else(|| bad_handle(png))?;
        if !info.is_null() && info != own_info {
            return Err(bad_handle(info));
        }
        let state = self.structs.remove(&png.addr()).ok_or_else(|| bad_handle(png))?;
        let (exports, info, scratch) = match state {
            PngStruct::Read(s) => s.into_parts(),
            PngStruct::Write(s) => s.into_parts(),
        };
        exports.release(env)?;
        for ptr in scratch.into_iter().chain([info]).filter(|p| !p.is_null()) {
            env.memory_mut().free(ptr)?;
        }
        env.memory_mut().free(png)?;
        Ok(0)
    }

    fn with_read(
        &mut self,
        env: &mut GuestEnv<'_>,
        png: GuestPtr,
        f: impl FnOnce(&mut ReadStruct, &mut GuestEnv<'_>) -> CodecResult<u32>,
    ) -> Result<u32, GuestAbort> {
        let Some(PngStruct::Read(state)) = self.structs.get_mut(&png.addr()) else {
            return Err(bad_handle(png));
        };
        let error_fn = state.error_fn;
        f(state, env).map_err(|fault| fault.raise(env, error_fn))
    }

    fn with_write(
        &mut self,
        env: &mut GuestEnv<'_>,
        png: GuestPtr,
        f: impl FnOnce(&mut WriteStruct, &mut GuestEnv<'_>) -> CodecResult<u32>,
    ) -> Result<u32, GuestAbort> {
        let Some(PngStruct::Write(state)) = self.structs.get_mut(&png.addr()) else {
            return Err(bad_handle(png));
        };
        let error_fn = state.error_fn;
        f(state, env).map_err(|fault| fault.raise(env, error_fn))
    }
}

/// A struct pointer the codec never handed out: dereferencing it faults.
fn bad_handle(png: GuestPtr) -> GuestAbort {
    GuestAbort::Trap(Trap::MemoryFault {
        addr: png.addr(),
        len: HANDLE_SIZE,
    })
}

impl CodecModule for PngModule {
    fn name(&self) -> &'static str {
        "libpng"
    }

    fn call(&mut self, env: &mut GuestEnv<'_>, call: &Call) -> Result<u32, GuestAbort> {
        match *call {
            Call::CreateReadStruct { version, error_fn } => self.create(env, version, error_fn, true),
            Call::CreateWriteStruct { version, error_fn } => self.create(env, version, error_fn, false),
            Call::CreateInfoStruct { png } => self.create_info(env, png),
            Call::DestroyReadStruct { png, info } | Call::DestroyWriteStruct { png, info } => {
                self.destroy(env, png, info)
            }
            Call::SetOption { png, option, onoff } => match self.structs.get_mut(&png.addr()) {
                Some(PngStruct::Read(s)) => Ok(s.set_option(option, onoff)),
                Some(PngStruct::Write(s)) => Ok(s.set_option(option, onoff)),
                None => Err(bad_handle(png)),
            },

            Call::SetReadUserChunkFn { png, callback } => self.with_read(env, png, |s, _| {
                s.chunk_fn = callback;
                Ok(0)
            }),
            Call::SetReadFn { png, callback } => self.with_read(env, png, |s, _| {
                s.read_fn = callback;
                Ok(0)
            }),
            Call::SetSigBytes { png, count } => self.with_read(env, png, |s, _| s.set_sig_bytes(count)),
            Call::ReadInfo { png, info } => self.with_read(env, png, |s, env| s.read_info(env, info)),
            Call::GetIhdr { png, info, out } => self.with_read(env, png, |s, env| s.get_ihdr(env, info, out)),
            Call::SetStrip16 { png } => self.with_read(env, png, |s, _| {
                s.transforms.strip_16 = true;
                Ok(0)
            }),
            Call::SetPacking { png } => self.with_read(env, png, |s, _| {
                s.transforms.packing = true;
                Ok(0)
            }),
            Call::SetExpandGray1_2_4To8 { png } => self.with_read(env, png, |s, _| {
                s.transforms.expand_gray = true;
                Ok(0)
            }),
            Call::SetInterlaceHandling { png } => self.with_read(env, png, |s, _| Ok(s.set_interlace_handling())),
            Call::ReadUpdateInfo { png, info } => self.with_read(env, png, |s, _| s.read_update_info(info)),
            Call::GetImageWidth { png, info } => self.with_read(env, png, |s, _| s.image_width(info)),
            Call::GetImageHeight { png, info } => self.with_read(env, png, |s, _| s.image_height(info)),
            Call::GetPlte {
                png,
                info,
                palette,
                count,
            } => self.with_read(env, png, |s, env| s.get_plte(env, info, palette, count)),
            Call::GetTrns {
                png,
                info,
                trans,
                count,
                color,
            } => self.with_read(env, png, |s, env| s.get_trns(env, info, trans, count, color)),
            Call::GetRowbytes { png, info } => self.with_read(env, png, |s, _| s.rowbytes(info)),
            Call::ReadRow { png, row, display } => self.with_read(env, png, |s, env| s.read_row(env, row, display)),
            Call::ReadEnd { png, info } => self.with_read(env, png, |s, env| s.read_end(env, info)),
            Call::GetValid { png, info, flag } => self.with_read(env, png, |s, _| s.valid(info, flag)),
            Call::GetIccp {
                png,
                info,
                name,
                compression,
                profile,
                len,
            } => self.with_read(env, png, |s, env| s.get_iccp(env, info, [name, compression, profile, len])),
            Call::GetChrmFixed { png, info, out } => self.with_read(env, png, |s, env| s.get_chrm(env, info, out)),
            Call::GetGamaFixed { png, info, out } => self.with_read(env, png, |s, env| s.get_gama(env, info, out)),

            Call::SetWriteFn { png, callback } => self.with_write(env, png, |s, _| {
                s.write_fn = callback;
                Ok(0)
            }),
            Call::SetIhdr {
                png,
                info,
                width,
                height,
                bit_depth,
                color_type,
                interlace,
            } => self.with_write(env, png, |s, _| {
                s.set_ihdr(info, [width, height, bit_depth, color_type, interlace])
            }),
            Call::SetPlte {
                png,
                info,
                palette,
                count,
            } => self.with_write(env, png, |s, env| s.set_plte(env, info, palette, count)),
            Call::SetTrns {
                png,
                info,
                trans,
                count,
                color,
            } => self.with_write(env, png, |s, env| s.set_trns(env, info, trans, count, color)),
            Call::SetSrgb { png, info, intent } => self.with_write(env, png, |s, _| s.set_srgb(info, intent)),
            Call::SetChrmFixed { png, info, values } => self.with_write(env, png, |s, _| s.set_chrm(info, values)),
            Call::SetGamaFixed { png, info, gamma } => self.with_write(env, png, |s, _| s.set_gama(info, gamma)),
            Call::SetIccp {
                png,
                info,
                name,
                compression,
                profile,
                len,
            } => self.with_write(env, png, |s, env| s.set_iccp(env, info, name, compression, profile, len)),
            Call::SetUnknownChunks {
                png,
                info,
                chunks,
                count,
            } => self.with_write(env, png, |s, env| s.set_unknown_chunks(env, info, chunks, count)),
            Call::WriteInfo { png, info } => self.with_write(env, png, |s, env| s.write_info(env, info)),
            Call::GetColorType { png, info } => self.with_write(env, png, |s, _| s.color_type(info)),
            Call::WriteRow { png, row } => self.with_write(env, png, |s, env| s.write_row(env, row)),
            Call::WriteEnd { png, info } => self.with_write(env, png, |s, env| s.write_end(env, info)),
        }
    }
}

/// Reject an info pointer that is not the one created for this struct.
pub(super) fn check_info(own: GuestPtr, given: GuestPtr) -> CodecResult<()> {
    if own.is_null() || own != given {
        Err(Fault::png("Invalid info struct"))
    } else {
        Ok(())
    }
}

pub(super) fn parse_ihdr(data: &[u8]) -> CodecResult<Ihdr> {
    if data.len() != 13 {
        return Err(Fault::png("IHDR: invalid"));
    }
    let ihdr = Ihdr {
        width: check_dimension(chunk::be_u32(&data[0..4]), "width")?,
        height: check_dimension(chunk::be_u32(&data[4..8]), "height")?,
        bit_depth: data[8],
        color_type: data[9],
        interlace: data[12],
    };
    if !matches!(ihdr.bit_depth, 1 | 2 | 4 | 8 | 16) {
        return Err(Fault::png("Invalid bit depth in IHDR"));
    }
    if data[10] != 0 {
        return Err(Fault::png("Unknown compression method in IHDR"));
    }
    if data[11] != 0 {
        return Err(Fault::png("Unknown filter method in IHDR"));
    }
    if ihdr.interlace > abi::INTERLACE_ADAM7 {
        return Err(Fault::png("Unknown interlace method in IHDR"));
    }
    Ok(ihdr)
}

pub(super) fn ihdr_bytes(ihdr: &Ihdr) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[0..4].copy_from_slice(&ihdr.width.to_be_bytes());
    out[4..8].copy_from_slice(&ihdr.height.to_be_bytes());
    out[8] = ihdr.bit_depth;
    out[9] = ihdr.color_type;
    out[12] = ihdr.interlace;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_resolves_from_file_stem() {
        for path in ["libpng", "../../main/libpng.so", "/opt/libpng16.wasm"] {
            let module = load(Path::new(path)).unwrap();
            assert_eq!(module.name(), "libpng");
        }
        assert!(load(Path::new("/opt/zlib.so")).is_err());
        assert!(load(Path::new("")).is_err());
    }

    #[test]
    fn ihdr_round_trips_and_validates() {
        let ihdr = Ihdr {
            width: 3,
            height: 2,
            bit_depth: 8,
            color_type: abi::COLOR_TYPE_RGB_ALPHA,
            interlace: 0,
        };
        assert_eq!(parse_ihdr(&ihdr_bytes(&ihdr)).unwrap(), ihdr);
        assert!(ihdr.check_format().is_ok());
        assert_eq!(ihdr.raw_rowbytes(3), 12);

        let mut bad = ihdr_bytes(&ihdr);
        bad[8] = 3;
        assert!(parse_ihdr(&bad).is_err());

        let odd = Ihdr { color_type: 5, ..ihdr };
        assert!(matches!(odd.check_format(), Err(Fault::Png(_))));
        let rgb4 = Ihdr { color_type: abi::COLOR_TYPE_RGB, bit_depth: 4, ..ihdr };
        assert!(rgb4.check_format().is_err());
    }

    #[test]
    fn packed_rows_round_up() {
        let gray1 = Ihdr {
            width: 10,
            height: 1,
            bit_depth: 1,
            color_type: abi::COLOR_TYPE_GRAY,
            interlace: 0,
        };
        assert_eq!(gray1.raw_rowbytes(10), 2);
        assert_eq!(gray1.filter_bpp(), 1);
    }
}
