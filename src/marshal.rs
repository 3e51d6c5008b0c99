//! Typed host-side wrappers around the codec entry points.
//!
//! A [`CodecSession`] is one decode or one encode on a [`Sandbox`]. It owns
//! the callback registrations and the host end of the callbacks, and it
//! destroys the codec's structures when dropped, whatever path led there.
//! Every value the codec hands back is verified before it leaves this module.

use std::io::{Read, Write};

use crate::abi::{self, Call, Color16, ColorEntry, UnknownChunkRecord};
use crate::boundary::{BoundaryValue, GuestPtr};
use crate::callback::{Bridge, CallbackKind, CallbackRegistration};
use crate::chunks::{Chunk, ChunkStore};
use crate::error::{Error, Result, Trap};
use crate::limits::ResourceLimits;
use crate::sandbox::{Sandbox, SandboxAllocation};

/// Largest width or height a PNG header may declare.
const MAX_DIMENSION: u32 = 0x7FFF_FFFF;

/// Image header as verified on the host side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub color_type: u8,
    pub interlaced: bool,
}

/// Transparency as reported by the codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Transparency {
    /// Per-entry alpha for an indexed image; may be shorter than the palette.
    Alpha(Vec<u8>),
    /// Transparent sample values for an image without alpha.
    Key(Color16),
}

/// The color chunks the codec found.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ColorChunks {
    pub icc: Option<(String, Vec<u8>)>,
    pub srgb: bool,
    pub chrm: Option<[i32; 8]>,
    pub gama: Option<i32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

pub(crate) struct CodecSession<'s, 'io> {
    sandbox: &'s Sandbox,
    bridge: Bridge<'io>,
    direction: Direction,
    png: GuestPtr,
    info: GuestPtr,
    limits: ResourceLimits,
    registrations: Vec<CallbackRegistration<'s>>,
}

impl<'s, 'io> CodecSession<'s, 'io> {
    /// Open a decode session pulling bytes from `source`.
    pub(crate) fn reader(sandbox: &'s Sandbox, source: &'io mut dyn Read, limits: ResourceLimits) -> Result<Self> {
        let mut session = Self::open(sandbox, Bridge::reading(source, limits), Direction::Read, limits)?;
        let read = session.register(CallbackKind::Read)?;
        session.simple(Call::SetReadFn {
            png: session.png,
            callback: read,
        })?;
        // The codec reads the whole signature itself.
        session.simple(Call::SetSigBytes {
            png: session.png,
            count: 0,
        })?;
        let chunk = session.register(CallbackKind::UnknownChunk)?;
        session.simple(Call::SetReadUserChunkFn {
            png: session.png,
            callback: chunk,
        })?;
        Ok(session)
    }

    /// Open an encode session pushing bytes to `sink`.
    pub(crate) fn writer(sandbox: &'s Sandbox, sink: &'io mut dyn Write, limits: ResourceLimits) -> Result<Self> {
        let mut session = Self::open(sandbox, Bridge::writing(sink, limits), Direction::Write, limits)?;
        let write = session.register(CallbackKind::Write)?;
        session.simple(Call::SetWriteFn {
            png: session.png,
            callback: write,
        })?;
        Ok(session)
    }

    fn open(sandbox: &'s Sandbox, bridge: Bridge<'io>, direction: Direction, limits: ResourceLimits) -> Result<Self> {
        if sandbox.is_poisoned() {
            return Err(Error::Trap(Trap::Poisoned));
        }
        if !sandbox.claim_session() {
            return Err(Error::SessionInit(
                "another codec session is open on this domain".to_owned(),
            ));
        }
        // From here on, Drop releases the session claim.
        let mut session = Self {
            sandbox,
            bridge,
            direction,
            png: GuestPtr::NULL,
            info: GuestPtr::NULL,
            limits,
            registrations: Vec::new(),
        };

        let error_fn = session.register(CallbackKind::Error)?;
        let version = sandbox.copy_in_str(abi::LIBPNG_VER_STRING)?;
        let create = match direction {
            Direction::Read => Call::CreateReadStruct {
                version: version.ptr(),
                error_fn,
            },
            Direction::Write => Call::CreateWriteStruct {
                version: version.ptr(),
                error_fn,
            },
        };
        let name = create.name();
        let png = session.call(create);
        version.release();
        session.png = png?
            .verify_ptr("codec returns a control struct")
            .map_err(|_| Error::SessionInit(format!("{name} failed")))?;

        session.info = session
            .call(Call::CreateInfoStruct { png: session.png })?
            .verify_ptr("codec returns an info struct")
            .map_err(|_| Error::SessionInit("png_create_info_struct failed".to_owned()))?;

        // Profiles are vetted on the host side; the codec only needs to carry them.
        session.simple(Call::SetOption {
            png: session.png,
            option: abi::OPTION_SKIP_SRGB_CHECK_PROFILE,
            onoff: abi::OPTION_ON,
        })?;
        log::debug!("codec session open (png {:?}, info {:?})", session.png, session.info);
        Ok(session)
    }

    fn register(&mut self, kind: CallbackKind) -> Result<u32> {
        let registration = self.sandbox.register_callback(kind)?;
        let slot = registration.slot();
        self.registrations.push(registration);
        Ok(slot)
    }

    /// Invoke an entry point and fold callback failures into the result.
    fn call(&mut self, call: Call) -> Result<BoundaryValue<u32>> {
        match self.sandbox.invoke(call, &mut self.bridge) {
            Ok(value) => {
                self.bridge.check()?;
                Ok(value)
            }
            Err(trap) => Err(self.bridge.fail(trap)),
        }
    }

    /// Chunks captured by the unknown-chunk callback so far.
    pub(crate) fn take_chunks(&mut self) -> ChunkStore {
        self.bridge.take_chunks()
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bridge.bytes_written()
    }

    // Decode side

    pub(crate) fn read_info(&mut self) -> Result<()> {
        let call = Call::ReadInfo {
            png: self.png,
            info: self.info,
        };
        self.simple(call)
    }

    pub(crate) fn get_ihdr(&mut self) -> Result<Header> {
        let out = self.sandbox.malloc::<u32>(5)?;
        let call = Call::GetIhdr {
            png: self.png,
            info: self.info,
            out: [0, 1, 2, 3, 4].map(|i| out.element(i)),
        };
        self.call(call)?.verify_eq(1, "png_get_IHDR found a header")?;

        let width = out.get(0)?.verify_in(1..=MAX_DIMENSION, "width is a positive 31-bit value")?;
        let height = out.get(1)?.verify_in(1..=MAX_DIMENSION, "height is a positive 31-bit value")?;
        let bit_depth = out.get(2)?.verify("bit depth is 1, 2, 4, 8 or 16", |d| {
            matches!(d, 1 | 2 | 4 | 8 | 16).then_some(d as u8)
        })?;
        let color_type = out.get(3)?.verify_at_most(u32::from(u8::MAX), "color type fits a byte")? as u8;
        let interlace = out.get(4)?.verify_at_most(1, "interlace method is none or Adam7")?;
        Ok(Header {
            width,
            height,
            bit_depth,
            color_type,
            interlaced: interlace == 1,
        })
    }

    /// Invoke an entry point whose return value carries nothing the host uses.
    fn simple(&mut self, call: Call) -> Result<()> {
        let name = call.name();
        self.call(call)?.discard(name);
        Ok(())
    }

    pub(crate) fn set_strip_16(&mut self) -> Result<()> {
        self.simple(Call::SetStrip16 { png: self.png })
    }

    pub(crate) fn set_packing(&mut self) -> Result<()> {
        self.simple(Call::SetPacking { png: self.png })
    }

    pub(crate) fn set_expand_gray(&mut self) -> Result<()> {
        self.simple(Call::SetExpandGray1_2_4To8 { png: self.png })
    }

    /// Number of passes the image is delivered in: 7 for Adam7, else 1.
    pub(crate) fn set_interlace_handling(&mut self, interlaced: bool) -> Result<u32> {
        let expected = if interlaced { 7 } else { 1 };
        let passes = self
            .call(Call::SetInterlaceHandling { png: self.png })?
            .verify_eq(expected, "pass count matches the interlace method")?;
        Ok(passes)
    }

    pub(crate) fn read_update_info(&mut self) -> Result<()> {
        let call = Call::ReadUpdateInfo {
            png: self.png,
            info: self.info,
        };
        self.simple(call)
    }

    /// Confirm that the codec still reports the header's dimensions.
    pub(crate) fn confirm_size(&mut self, header: &Header) -> Result<()> {
        let (png, info) = (self.png, self.info);
        self.call(Call::GetImageWidth { png, info })?
            .verify_eq(header.width, "image width is unchanged since the header")?;
        self.call(Call::GetImageHeight { png, info })?
            .verify_eq(header.height, "image height is unchanged since the header")?;
        Ok(())
    }

    pub(crate) fn rowbytes(&mut self, expected: u32) -> Result<u32> {
        let call = Call::GetRowbytes {
            png: self.png,
            info: self.info,
        };
        Ok(self.call(call)?.verify_eq(expected, "row size matches the output format")?)
    }

    pub(crate) fn valid(&mut self, flag: u32) -> Result<bool> {
        let call = Call::GetValid {
            png: self.png,
            info: self.info,
            flag,
        };
        Ok(self.call(call)?.verify_flag(flag, "png_get_valid answers for the asked flag")?)
    }

    pub(crate) fn get_plte(&mut self) -> Result<Option<Vec<ColorEntry>>> {
        let palette = self.sandbox.malloc::<GuestPtr>(1)?;
        let count = self.sandbox.malloc::<u32>(1)?;
        let call = Call::GetPlte {
            png: self.png,
            info: self.info,
            palette: palette.ptr(),
            count: count.ptr(),
        };
        if !self.call(call)?.verify_flag(abi::INFO_PLTE, "png_get_PLTE answers for PLTE")? {
            return Ok(None);
        }
        let count = count
            .get(0)?
            .verify_in(1..=abi::MAX_PALETTE_LENGTH, "palette has 1 to 256 entries")?;
        let ptr = palette
            .get(0)?
            .map(GuestPtr::addr)
            .verify_ptr("palette pointer is not null")?;
        let entries = self
            .sandbox
            .load_array::<ColorEntry>(ptr, count)?
            .verify("palette was copied at its declared size", Some)?;
        Ok(Some(entries))
    }

    pub(crate) fn get_trns(&mut self, palette_len: Option<u32>) -> Result<Option<Transparency>> {
        let trans = self.sandbox.malloc::<GuestPtr>(1)?;
        let count = self.sandbox.malloc::<u32>(1)?;
        let color = self.sandbox.malloc::<GuestPtr>(1)?;
        let call = Call::GetTrns {
            png: self.png,
            info: self.info,
            trans: trans.ptr(),
            count: count.ptr(),
            color: color.ptr(),
        };
        if !self.call(call)?.verify_flag(abi::INFO_TRNS, "png_get_tRNS answers for tRNS")? {
            return Ok(None);
        }

        if let Some(palette_len) = palette_len {
            let count = count
                .get(0)?
                .verify_in(1..=palette_len, "transparency table is no longer than the palette")?;
            let ptr = trans
                .get(0)?
                .map(GuestPtr::addr)
                .verify_ptr("transparency table pointer is not null")?;
            let alpha = self
                .sandbox
                .load_array::<u8>(ptr, count)?
                .verify("transparency table was copied at its declared size", Some)?;
            return Ok(Some(Transparency::Alpha(alpha)));
        }

        let ptr = color
            .get(0)?
            .map(GuestPtr::addr)
            .verify_ptr("transparent color pointer is not null")?;
        let key = self
            .sandbox
            .load::<Color16>(ptr)?
            .verify_with("transparent color is in 8-bit output space", |key| {
                let samples = [key.red, key.green, key.blue, key.gray];
                match samples.iter().find(|&&s| s > 0xFF) {
                    Some(s) => Err(format!("sample {s} does not fit 8 bits")),
                    None => Ok(key),
                }
            })?;
        Ok(Some(Transparency::Key(key)))
    }

    /// Collect the color chunks, verifying each against its own bound.
    pub(crate) fn color_chunks(&mut self) -> Result<ColorChunks> {
        let mut chunks = ColorChunks::default();
        if self.valid(abi::INFO_ICCP)? {
            // A profile that fails verification is treated as absent.
            chunks.icc = match self.get_iccp() {
                Err(Error::Boundary(err)) => {
                    log::warn!("ignoring embedded profile: {err}");
                    None
                }
                icc => icc?,
            };
        }
        chunks.srgb = self.valid(abi::INFO_SRGB)?;
        if self.valid(abi::INFO_CHRM)? {
            let out = self.sandbox.malloc::<i32>(8)?;
            let call = Call::GetChrmFixed {
                png: self.png,
                info: self.info,
                out: out.ptr(),
            };
            if self.call(call)?.verify_flag(abi::INFO_CHRM, "png_get_cHRM_fixed answers for cHRM")? {
                let values = out.read_all()?.verify("chromaticities are eight values", |v| {
                    <[i32; 8]>::try_from(v).ok()
                })?;
                chunks.chrm = Some(values);
            }
        }
        if self.valid(abi::INFO_GAMA)? {
            let out = self.sandbox.malloc::<i32>(1)?;
            let call = Call::GetGamaFixed {
                png: self.png,
                info: self.info,
                out: out.ptr(),
            };
            if self.call(call)?.verify_flag(abi::INFO_GAMA, "png_get_gAMA_fixed answers for gAMA")? {
                let gamma = out.get(0)?.verify("gamma is positive", |g| (g > 0).then_some(g))?;
                chunks.gama = Some(gamma);
            }
        }
        Ok(chunks)
    }

    fn get_iccp(&mut self) -> Result<Option<(String, Vec<u8>)>> {
        let name = self.sandbox.malloc::<GuestPtr>(1)?;
        let compression = self.sandbox.malloc::<u32>(1)?;
        let profile = self.sandbox.malloc::<GuestPtr>(1)?;
        let len = self.sandbox.malloc::<u32>(1)?;
        let call = Call::GetIccp {
            png: self.png,
            info: self.info,
            name: name.ptr(),
            compression: compression.ptr(),
            profile: profile.ptr(),
            len: len.ptr(),
        };
        if !self.call(call)?.verify_flag(abi::INFO_ICCP, "png_get_iCCP answers for iCCP")? {
            return Ok(None);
        }
        compression
            .get(0)?
            .verify_eq(abi::COMPRESSION_TYPE_BASE, "profile compression is deflate")?;

        let limits = self.limits;
        let len = len
            .get(0)?
            .verify("profile is within the ICC size limit", |n| limits.check_icc(n).ok().map(|()| n))?;
        let profile_ptr = profile
            .get(0)?
            .map(GuestPtr::addr)
            .verify_ptr("profile pointer is not null")?;
        let data = self
            .sandbox
            .load_array::<u8>(profile_ptr, len)?
            .verify("profile was copied at its declared size", Some)?;

        let name_ptr = name
            .get(0)?
            .map(GuestPtr::addr)
            .verify_ptr("profile name pointer is not null")?;
        let name = self
            .sandbox
            .c_string(name_ptr, abi::MAX_PROFILE_NAME)?
            .verify("profile name is terminated within 80 bytes", |name| name)?;
        Ok(Some((String::from_utf8_lossy(&name).into_owned(), data)))
    }

    /// A domain buffer large enough for one output row.
    pub(crate) fn row_buffer(&self, rowbytes: u32) -> Result<SandboxAllocation<'s, u8>> {
        Ok(self.sandbox.malloc::<u8>(rowbytes)?)
    }

    /// Decode the next row into `row` and copy it out.
    pub(crate) fn read_row(&mut self, row: &SandboxAllocation<'s, u8>) -> Result<Vec<u8>> {
        let call = Call::ReadRow {
            png: self.png,
            row: row.ptr(),
            display: GuestPtr::NULL,
        };
        self.simple(call)?;
        let len = row.count() as usize;
        Ok(row.read_all()?.verify("row fits its buffer", |bytes| (bytes.len() == len).then_some(bytes))?)
    }

    pub(crate) fn read_end(&mut self) -> Result<()> {
        let call = Call::ReadEnd {
            png: self.png,
            info: self.info,
        };
        self.simple(call)
    }

    // Encode side

    pub(crate) fn set_ihdr(&mut self, header: &Header) -> Result<()> {
        let call = Call::SetIhdr {
            png: self.png,
            info: self.info,
            width: header.width,
            height: header.height,
            bit_depth: u32::from(header.bit_depth),
            color_type: u32::from(header.color_type),
            interlace: u32::from(header.interlaced),
        };
        self.simple(call)
    }

    pub(crate) fn set_plte(&mut self, entries: &[ColorEntry]) -> Result<()> {
        let palette = self.sandbox.copy_in(entries)?;
        let call = Call::SetPlte {
            png: self.png,
            info: self.info,
            palette: palette.ptr(),
            count: palette.count(),
        };
        self.simple(call)
    }

    pub(crate) fn set_trns(&mut self, transparency: &Transparency) -> Result<()> {
        match transparency {
            Transparency::Alpha(alpha) => {
                let table = self.sandbox.copy_in(alpha)?;
                let call = Call::SetTrns {
                    png: self.png,
                    info: self.info,
                    trans: table.ptr(),
                    count: table.count(),
                    color: GuestPtr::NULL,
                };
                self.simple(call)
            }
            Transparency::Key(key) => {
                let color = self.sandbox.copy_in(&[*key])?;
                let call = Call::SetTrns {
                    png: self.png,
                    info: self.info,
                    trans: GuestPtr::NULL,
                    count: 1,
                    color: color.ptr(),
                };
                self.simple(call)
            }
        }
    }

    pub(crate) fn set_srgb(&mut self) -> Result<()> {
        let call = Call::SetSrgb {
            png: self.png,
            info: self.info,
            intent: abi::SRGB_INTENT_PERCEPTUAL,
        };
        self.simple(call)
    }

    pub(crate) fn set_chrm(&mut self, values: [i32; 8]) -> Result<()> {
        let call = Call::SetChrmFixed {
            png: self.png,
            info: self.info,
            values,
        };
        self.simple(call)
    }

    pub(crate) fn set_gama(&mut self, gamma: i32) -> Result<()> {
        let call = Call::SetGamaFixed {
            png: self.png,
            info: self.info,
            gamma,
        };
        self.simple(call)
    }

    pub(crate) fn set_iccp(&mut self, name: &str, profile: &[u8]) -> Result<()> {
        let name = self.sandbox.copy_in_str(name)?;
        let data = self.sandbox.copy_in(profile)?;
        let call = Call::SetIccp {
            png: self.png,
            info: self.info,
            name: name.ptr(),
            compression: abi::COMPRESSION_TYPE_BASE,
            profile: data.ptr(),
            len: data.count(),
        };
        self.simple(call)
    }

    pub(crate) fn set_unknown_chunks(&mut self, chunks: &ChunkStore) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let payloads = chunks
            .iter()
            .map(|chunk| self.sandbox.copy_in(&chunk.data))
            .collect::<core::result::Result<Vec<_>, Trap>>()?;
        let records: Vec<UnknownChunkRecord> = chunks
            .iter()
            .zip(&payloads)
            .map(|(chunk, payload)| record_for(chunk, payload))
            .collect();
        let table = self.sandbox.copy_in(&records)?;
        let call = Call::SetUnknownChunks {
            png: self.png,
            info: self.info,
            chunks: table.ptr(),
            count: table.count(),
        };
        self.simple(call)
    }

    pub(crate) fn write_info(&mut self) -> Result<()> {
        let call = Call::WriteInfo {
            png: self.png,
            info: self.info,
        };
        self.simple(call)
    }

    /// Confirm the codec accepted the requested color type.
    pub(crate) fn confirm_color_type(&mut self, color_type: u8) -> Result<()> {
        let call = Call::GetColorType {
            png: self.png,
            info: self.info,
        };
        self.call(call)?
            .verify_eq(u32::from(color_type), "codec writes the requested color type")?;
        Ok(())
    }

    pub(crate) fn write_row(&mut self, row: &[u8]) -> Result<()> {
        let buffer = self.sandbox.copy_in(row)?;
        let call = Call::WriteRow {
            png: self.png,
            row: buffer.ptr(),
        };
        self.simple(call)
    }

    pub(crate) fn write_end(&mut self) -> Result<()> {
        let call = Call::WriteEnd {
            png: self.png,
            info: self.info,
        };
        self.simple(call)
    }
}

fn record_for(chunk: &Chunk, payload: &SandboxAllocation<'_, u8>) -> UnknownChunkRecord {
    let mut name = [0u8; 5];
    name[..4].copy_from_slice(&chunk.name());
    UnknownChunkRecord {
        name,
        location: chunk.location.raw(),
        data: payload.ptr(),
        size: payload.count(),
    }
}

impl Drop for CodecSession<'_, '_> {
    fn drop(&mut self) {
        if !self.png.is_null() && !self.sandbox.is_poisoned() {
            let (png, info) = (self.png, self.info);
            let destroy = match self.direction {
                Direction::Read => Call::DestroyReadStruct { png, info },
                Direction::Write => Call::DestroyWriteStruct { png, info },
            };
            if let Err(trap) = self.sandbox.invoke(destroy, &mut self.bridge) {
                log::warn!("destroying codec structures: {trap}");
            }
        }
        self.sandbox.end_session();
        log::debug!("codec session closed");
    }
}
