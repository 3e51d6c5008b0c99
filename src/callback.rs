//! Host functions the codec may call back into.
//!
//! The codec only ever holds slot numbers from the domain's
//! [`CallbackTable`]; a call through a slot that is not registered for the
//! expected use traps the codec. The host side of every callback is the
//! [`Bridge`], which verifies each argument before touching the host stream
//! or the chunk store.

use std::io::{self, Read, Write};

use crate::abi::{self, UnknownChunkRecord};
use crate::boundary::{BoundaryError, BoundaryValue, GuestPtr, Wire};
use crate::chunks::{self, Chunk, ChunkLocation, ChunkStore};
use crate::error::{Error, Trap};
use crate::limits::{LimitExceeded, ResourceLimits};
use crate::memory::LinearMemory;
use crate::sandbox::Sandbox;

/// What a registered callback slot may be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallbackKind {
    /// Pull bytes from the host input stream.
    Read,
    /// Push bytes to the host output sink.
    Write,
    /// Report a chunk the codec does not interpret.
    UnknownChunk,
    /// Report a fatal codec error message.
    Error,
}

#[derive(Debug, Default)]
pub(crate) struct CallbackTable {
    slots: Vec<Option<CallbackKind>>,
}

impl CallbackTable {
    /// Register `kind` and return its slot. Slot 0 is never handed out.
    pub(crate) fn register(&mut self, kind: CallbackKind) -> u32 {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(kind);
                free
            }
            None => {
                self.slots.push(Some(kind));
                self.slots.len() - 1
            }
        };
        index as u32 + 1
    }

    pub(crate) fn unregister(&mut self, slot: u32) -> bool {
        let Some(entry) = slot
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i as usize))
        else {
            return false;
        };
        entry.take().is_some()
    }

    pub(crate) fn kind(&self, slot: u32) -> Option<CallbackKind> {
        let index = slot.checked_sub(1)? as usize;
        self.slots.get(index).copied().flatten()
    }

    pub(crate) fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// A registered callback slot. Unregisters itself on drop.
pub(crate) struct CallbackRegistration<'s> {
    sandbox: &'s Sandbox,
    slot: u32,
}

impl<'s> CallbackRegistration<'s> {
    pub(crate) fn new(sandbox: &'s Sandbox, slot: u32) -> Self {
        Self { sandbox, slot }
    }

    pub(crate) fn slot(&self) -> u32 {
        self.slot
    }
}

impl Drop for CallbackRegistration<'_> {
    fn drop(&mut self) {
        self.sandbox.unregister_callback(self.slot);
    }
}

/// Returned by a host callback that wants the codec to fail. `message` is a
/// domain-resident string the codec passes to its own error path.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HostFault {
    pub(crate) message: GuestPtr,
}

/// Host-side view of linear memory while a callback runs.
pub(crate) struct CallbackCx<'a> {
    memory: &'a mut LinearMemory,
    scratch: &'a mut Vec<GuestPtr>,
}

impl<'a> CallbackCx<'a> {
    pub(crate) fn new(memory: &'a mut LinearMemory, scratch: &'a mut Vec<GuestPtr>) -> Self {
        Self { memory, scratch }
    }

    pub(crate) fn copy_out(&self, ptr: GuestPtr, len: u32) -> Result<BoundaryValue<Vec<u8>>, Trap> {
        Ok(BoundaryValue::untrusted(self.memory.read(ptr, len)?.to_vec()))
    }

    pub(crate) fn load<T: Wire>(&self, ptr: GuestPtr) -> Result<BoundaryValue<T>, Trap> {
        Ok(BoundaryValue::untrusted(self.memory.load(ptr)?))
    }

    pub(crate) fn c_string(&self, ptr: GuestPtr, max: u32) -> Result<BoundaryValue<Option<Vec<u8>>>, Trap> {
        let text = self.memory.c_string(ptr, max)?.map(<[u8]>::to_vec);
        Ok(BoundaryValue::untrusted(text))
    }

    /// Copy host bytes into a codec buffer.
    pub(crate) fn fill(&mut self, ptr: GuestPtr, data: &[u8]) -> Result<(), Trap> {
        self.memory.write(ptr, data)
    }

    /// Place a message in domain memory. It is released once control
    /// returns from the current entry point.
    pub(crate) fn alloc_message(&mut self, text: &str) -> Result<GuestPtr, Trap> {
        let ptr = self.memory.alloc_c_string(text.as_bytes())?;
        self.scratch.push(ptr);
        Ok(ptr)
    }
}

/// Host implementations of the callbacks the codec can reach.
pub(crate) trait HostCallbacks {
    fn on_read(&mut self, cx: &mut CallbackCx<'_>, buf: GuestPtr, len: u32) -> Result<(), HostFault>;

    fn on_write(&mut self, cx: &mut CallbackCx<'_>, buf: GuestPtr, len: u32) -> Result<(), HostFault>;

    /// Returns 1 when the chunk was handled, a negative value to make the
    /// codec fail.
    fn on_unknown_chunk(&mut self, cx: &mut CallbackCx<'_>, record: GuestPtr) -> i32;

    fn on_error(&mut self, cx: &mut CallbackCx<'_>, message: GuestPtr);
}

#[derive(Debug)]
enum Failure {
    ShortRead { requested: u32, received: u32 },
    ReadFailed(String),
    WriteRejected(String),
    Violation(BoundaryError),
    Limit(LimitExceeded),
}

/// The host end of one codec session's callbacks.
pub(crate) struct Bridge<'io> {
    source: Option<&'io mut dyn Read>,
    sink: Option<&'io mut dyn Write>,
    limits: ResourceLimits,
    chunks: ChunkStore,
    codec_message: Option<String>,
    failure: Option<Failure>,
    bytes_read: u64,
    bytes_written: u64,
}

impl<'io> Bridge<'io> {
    pub(crate) fn reading(source: &'io mut dyn Read, limits: ResourceLimits) -> Self {
        Self::new(Some(source), None, limits)
    }

    pub(crate) fn writing(sink: &'io mut dyn Write, limits: ResourceLimits) -> Self {
        Self::new(None, Some(sink), limits)
    }

    fn new(source: Option<&'io mut dyn Read>, sink: Option<&'io mut dyn Write>, limits: ResourceLimits) -> Self {
        Self {
            source,
            sink,
            limits,
            chunks: ChunkStore::new(),
            codec_message: None,
            failure: None,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub(crate) fn take_chunks(&mut self) -> ChunkStore {
        core::mem::take(&mut self.chunks)
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Error for an entry point that trapped or aborted.
    pub(crate) fn fail(&mut self, trap: Trap) -> Error {
        if let Some(failure) = self.failure.take() {
            return failure.into_error();
        }
        match trap {
            Trap::Aborted => Error::Codec(
                self.codec_message
                    .take()
                    .unwrap_or_else(|| "unspecified codec error".to_owned()),
            ),
            trap => Error::Trap(trap),
        }
    }

    /// Error recorded by a callback during an entry point that nevertheless
    /// returned normally.
    pub(crate) fn check(&mut self) -> Result<(), Error> {
        match self.failure.take() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    fn fault(&mut self, cx: &mut CallbackCx<'_>, failure: Failure, text: &str) -> HostFault {
        log::debug!("callback failed: {failure:?}");
        self.failure = Some(failure);
        let message = cx.alloc_message(text).unwrap_or(GuestPtr::NULL);
        HostFault { message }
    }
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Failure::ShortRead {
                requested,
                received,
            } => Error::RowIo(format!(
                "stream ended early: {received} of {requested} bytes available"
            )),
            Failure::ReadFailed(msg) | Failure::WriteRejected(msg) => Error::RowIo(msg),
            Failure::Violation(err) => Error::Boundary(err),
            Failure::Limit(err) => Error::Limit(err),
        }
    }
}

fn read_fully(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn violation(justification: &'static str, trap: Trap) -> Failure {
    Failure::Violation(BoundaryError::new(justification, trap.to_string()))
}

impl HostCallbacks for Bridge<'_> {
    fn on_read(&mut self, cx: &mut CallbackCx<'_>, buf: GuestPtr, len: u32) -> Result<(), HostFault> {
        // Reject before reading anything if the destination is not in the domain.
        if let Err(trap) = cx.copy_out(buf, len) {
            return Err(self.fault(
                cx,
                violation("read buffer lies inside domain memory", trap),
                "Read Error",
            ));
        }
        if let Err(limit) = self.limits.check_file_size(self.bytes_read + u64::from(len)) {
            return Err(self.fault(cx, Failure::Limit(limit), "Read Error"));
        }
        let Some(source) = self.source.as_deref_mut() else {
            return Err(self.fault(
                cx,
                Failure::ReadFailed("no input stream attached".to_owned()),
                "Read Error",
            ));
        };

        let mut data = vec![0u8; len as usize];
        let received = match read_fully(source, &mut data) {
            Ok(n) => n,
            Err(e) => return Err(self.fault(cx, Failure::ReadFailed(e.to_string()), "Read Error")),
        };
        if let Err(trap) = cx.fill(buf, &data[..received]) {
            return Err(self.fault(
                cx,
                violation("read buffer lies inside domain memory", trap),
                "Read Error",
            ));
        }
        self.bytes_read += received as u64;
        if received < len as usize {
            return Err(self.fault(
                cx,
                Failure::ShortRead {
                    requested: len,
                    received: received as u32,
                },
                "Read Error",
            ));
        }
        Ok(())
    }

    fn on_write(&mut self, cx: &mut CallbackCx<'_>, buf: GuestPtr, len: u32) -> Result<(), HostFault> {
        let data = match cx.copy_out(buf, len) {
            Ok(bytes) => bytes.verify_len(len as usize, "write buffer is exactly the declared length"),
            Err(trap) => Err(BoundaryError::new(
                "write buffer lies inside domain memory",
                trap.to_string(),
            )),
        };
        let data = match data {
            Ok(data) => data,
            Err(err) => return Err(self.fault(cx, Failure::Violation(err), "Write Error")),
        };
        if let Err(limit) = self.limits.check_output_size(self.bytes_written + data.len() as u64) {
            return Err(self.fault(cx, Failure::Limit(limit), "Write Error"));
        }
        let Some(sink) = self.sink.as_deref_mut() else {
            return Err(self.fault(
                cx,
                Failure::WriteRejected("no output sink attached".to_owned()),
                "Write Error",
            ));
        };
        if let Err(e) = sink.write_all(&data) {
            return Err(self.fault(cx, Failure::WriteRejected(e.to_string()), "Write Error"));
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn on_unknown_chunk(&mut self, cx: &mut CallbackCx<'_>, record: GuestPtr) -> i32 {
        let record = match cx.load::<UnknownChunkRecord>(record) {
            Ok(raw) => raw.verify_with(
                "unknown chunk has a letter name and a known location",
                |r| {
                    if !chunks::is_chunk_name(&r.name[..4]) || r.name[4] != 0 {
                        return Err(format!("bad chunk name {:?}", &r.name[..4]));
                    }
                    let location = ChunkLocation::from_raw(r.location)
                        .ok_or_else(|| format!("bad chunk location {:#x}", r.location))?;
                    Ok((r, location))
                },
            ),
            Err(trap) => Err(BoundaryError::new(
                "unknown chunk record lies inside domain memory",
                trap.to_string(),
            )),
        };
        let (record, location) = match record {
            Ok(v) => v,
            Err(err) => {
                self.failure = Some(Failure::Violation(err));
                return -1;
            }
        };

        let mut name = [0u8; 4];
        name.copy_from_slice(&record.name[..4]);
        if let Err(limit) = self.limits.check_chunk(record.size) {
            log::warn!(
                "dropping {} chunk: {limit}",
                String::from_utf8_lossy(&name)
            );
            return 1;
        }

        let data = match cx.copy_out(record.data, record.size) {
            Ok(bytes) => bytes.verify_len(record.size as usize, "chunk payload matches its size"),
            Err(trap) => Err(BoundaryError::new(
                "chunk payload lies inside domain memory",
                trap.to_string(),
            )),
        };
        let data = match data {
            Ok(data) => data,
            Err(err) => {
                self.failure = Some(Failure::Violation(err));
                return -1;
            }
        };

        match Chunk::new(name, location, data) {
            Some(chunk) => {
                log::debug!("captured {} chunk ({:?})", chunk.name_str(), location);
                self.chunks.push(chunk);
                1
            }
            None => -1,
        }
    }

    fn on_error(&mut self, cx: &mut CallbackCx<'_>, message: GuestPtr) {
        let text = cx
            .c_string(message, abi::MAX_MESSAGE)
            .ok()
            .and_then(|raw| {
                raw.verify("codec message is a terminated string", |s| s)
                    .ok()
            })
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| "<unreadable codec message>".to_owned());
        log::debug!("codec error: {text}");
        self.codec_message = Some(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_cx<R>(f: impl FnOnce(&mut CallbackCx<'_>) -> R) -> (R, LinearMemory) {
        let mut memory = LinearMemory::new(1 << 16);
        let mut scratch = Vec::new();
        let out = f(&mut CallbackCx::new(&mut memory, &mut scratch));
        for ptr in scratch {
            memory.free(ptr).unwrap();
        }
        (out, memory)
    }

    #[test]
    fn table_hands_out_nonzero_slots_and_reuses_them() {
        let mut table = CallbackTable::default();
        let a = table.register(CallbackKind::Read);
        let b = table.register(CallbackKind::Error);
        assert_eq!((a, b), (1, 2));
        assert_eq!(table.kind(0), None);
        assert_eq!(table.kind(b), Some(CallbackKind::Error));
        assert!(table.unregister(a));
        assert!(!table.unregister(a));
        assert_eq!(table.register(CallbackKind::Write), 1);
        assert_eq!(table.active(), 2);
    }

    #[test]
    fn read_copies_exactly_the_requested_bytes() {
        let mut input: &[u8] = b"abcdef";
        let mut bridge = Bridge::reading(&mut input, ResourceLimits::default());
        let (res, _) = with_cx(|cx| {
            let buf = cx.memory.alloc(4).unwrap();
            let res = bridge.on_read(cx, buf, 4);
            let got = cx.memory.read(buf, 4).unwrap().to_vec();
            cx.memory.free(buf).unwrap();
            (res.is_ok(), got)
        });
        assert_eq!(res, (true, b"abcd".to_vec()));
        assert!(bridge.check().is_ok());
    }

    #[test]
    fn short_read_faults_with_a_domain_message() {
        let mut input: &[u8] = b"abc";
        let mut bridge = Bridge::reading(&mut input, ResourceLimits::default());
        let (message, memory) = with_cx(|cx| {
            let buf = cx.memory.alloc(4).unwrap();
            let fault = bridge.on_read(cx, buf, 4).unwrap_err();
            let text = cx.memory.c_string(fault.message, 64).unwrap().unwrap().to_vec();
            cx.memory.free(buf).unwrap();
            text
        });
        assert_eq!(message, b"Read Error");
        assert_eq!(memory.stats().live(), 0);
        assert!(matches!(bridge.fail(Trap::Aborted), Error::RowIo(_)));
    }

    #[test]
    fn read_into_foreign_address_is_a_violation() {
        let mut input: &[u8] = b"abcdef";
        let mut bridge = Bridge::reading(&mut input, ResourceLimits::default());
        let (res, _) = with_cx(|cx| bridge.on_read(cx, GuestPtr::new(0xFFFF_0000), 4).is_err());
        assert!(res);
        assert!(matches!(bridge.fail(Trap::Aborted), Error::Boundary(_)));
    }

    #[test]
    fn unknown_chunk_record_is_verified() {
        let mut input: &[u8] = b"";
        let mut bridge = Bridge::reading(&mut input, ResourceLimits::default());
        let (codes, _) = with_cx(|cx| {
            let data = cx.memory.alloc(3).unwrap();
            cx.memory.write(data, b"xyz").unwrap();
            let rec = cx.memory.alloc(UnknownChunkRecord::SIZE as u32).unwrap();

            let mut record = UnknownChunkRecord {
                name: *b"prVt\0",
                location: abi::HAVE_PLTE,
                data,
                size: 3,
            };
            cx.memory.store(rec, record).unwrap();
            let ok = bridge.on_unknown_chunk(cx, rec);

            record.location = 4;
            cx.memory.store(rec, record).unwrap();
            let bad_location = bridge.on_unknown_chunk(cx, rec);
            (ok, bad_location)
        });
        assert_eq!(codes, (1, -1));
        let chunks = bridge.take_chunks();
        assert_eq!(chunks.len(), 1);
        let chunk = chunks.iter().next().unwrap();
        assert_eq!(chunk.name(), *b"prVt");
        assert_eq!(chunk.location, ChunkLocation::BeforeImageData);
        assert_eq!(chunk.data, b"xyz");
        assert!(matches!(bridge.check(), Err(Error::Boundary(_))));
    }

    #[test]
    fn oversized_chunk_is_dropped() {
        let mut input: &[u8] = b"";
        let limits = ResourceLimits::default().with_max_chunk_bytes(2);
        let mut bridge = Bridge::reading(&mut input, limits);
        let (code, _) = with_cx(|cx| {
            let data = cx.memory.alloc(3).unwrap();
            let rec = cx.memory.alloc(UnknownChunkRecord::SIZE as u32).unwrap();
            let record = UnknownChunkRecord {
                name: *b"biGg\0",
                location: abi::HAVE_IHDR,
                data,
                size: 3,
            };
            cx.memory.store(rec, record).unwrap();
            bridge.on_unknown_chunk(cx, rec)
        });
        assert_eq!(code, 1);
        assert!(bridge.take_chunks().is_empty());
    }

    #[test]
    fn error_message_is_recorded() {
        let mut input: &[u8] = b"";
        let mut bridge = Bridge::reading(&mut input, ResourceLimits::default());
        with_cx(|cx| {
            let msg = cx.memory.alloc_c_string(b"IHDR: CRC error").unwrap();
            bridge.on_error(cx, msg);
        });
        match bridge.fail(Trap::Aborted) {
            Error::Codec(msg) => assert_eq!(msg, "IHDR: CRC error"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn write_goes_to_sink() {
        let mut out = Vec::new();
        {
            let mut bridge = Bridge::writing(&mut out, ResourceLimits::default());
            with_cx(|cx| {
                let buf = cx.memory.alloc_c_string(b"PNG").unwrap();
                assert!(bridge.on_write(cx, buf, 3).is_ok());
            });
            assert_eq!(bridge.bytes_written(), 3);
        }
        assert_eq!(out, b"PNG");
    }
}
