//! Linear memory of the isolated domain.
//!
//! The codec only ever sees 32-bit offsets into this arena. Every read and
//! write is bounds-checked against the current memory size and the low
//! null page; a bad access is reported as a [`Trap`], never performed.

use std::collections::BTreeMap;

use crate::boundary::{GuestPtr, Wire};
use crate::error::Trap;

/// Addresses below this are the null page and always fault.
pub(crate) const NULL_PAGE: u32 = 16;

const ALIGN: u32 = 8;

/// Default size cap of a domain's linear memory.
pub const DEFAULT_MEMORY_LIMIT: u32 = 256 * 1024 * 1024;

/// Allocation counters of a domain.
///
/// `allocations == releases` whenever no session is open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Allocations made since the domain was created.
    pub allocations: u64,
    /// Allocations released since the domain was created.
    pub releases: u64,
    /// Bytes currently held by live allocations.
    pub bytes_in_use: u64,
}

impl AllocStats {
    /// Allocations that are still live.
    pub fn live(&self) -> u64 {
        self.allocations - self.releases
    }
}

#[derive(Debug)]
pub(crate) struct LinearMemory {
    bytes: Vec<u8>,
    limit: u32,
    /// Live blocks: address -> requested length.
    live: BTreeMap<u32, u32>,
    /// Free blocks: address -> capacity. Adjacent blocks are coalesced.
    free: BTreeMap<u32, u32>,
    stats: AllocStats,
}

fn capacity_of(len: u32) -> Option<u32> {
    len.max(1).checked_add(ALIGN - 1).map(|n| n & !(ALIGN - 1))
}

impl LinearMemory {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            bytes: vec![0; NULL_PAGE as usize],
            limit: limit.max(NULL_PAGE),
            live: BTreeMap::new(),
            free: BTreeMap::new(),
            stats: AllocStats::default(),
        }
    }

    /// Size cap of the arena.
    pub(crate) fn limit(&self) -> u32 {
        self.limit
    }

    pub(crate) fn stats(&self) -> AllocStats {
        self.stats
    }

    /// Allocate `len` zeroed bytes.
    pub(crate) fn alloc(&mut self, len: u32) -> Result<GuestPtr, Trap> {
        let oom = Trap::OutOfMemory { requested: len };
        let cap = capacity_of(len).ok_or(oom.clone())?;

        let reuse = self
            .free
            .iter()
            .find(|&(_, &size)| size >= cap)
            .map(|(&addr, &size)| (addr, size));

        let addr = match reuse {
            Some((addr, size)) => {
                self.free.remove(&addr);
                if size > cap {
                    self.free.insert(addr + cap, size - cap);
                }
                addr
            }
            None => {
                let addr = self.bytes.len() as u32;
                let end = addr.checked_add(cap).ok_or(oom.clone())?;
                if end > self.limit {
                    return Err(oom);
                }
                self.bytes.resize(end as usize, 0);
                addr
            }
        };

        self.live.insert(addr, len);
        self.stats.allocations += 1;
        self.stats.bytes_in_use += u64::from(len);
        Ok(GuestPtr::new(addr))
    }

    /// Release a live allocation. The block is zeroed before reuse.
    pub(crate) fn free(&mut self, ptr: GuestPtr) -> Result<(), Trap> {
        let addr = ptr.addr();
        let len = self.live.remove(&addr).ok_or(Trap::InvalidFree(addr))?;
        let mut cap = capacity_of(len).ok_or(Trap::InvalidFree(addr))?;
        self.bytes[addr as usize..(addr + cap) as usize].fill(0);

        let mut start = addr;
        if let Some((&prev, &prev_cap)) = self.free.range(..addr).next_back()
            && prev + prev_cap == addr
        {
            self.free.remove(&prev);
            start = prev;
            cap += prev_cap;
        }
        if let Some(next_cap) = self.free.remove(&(start + cap)) {
            cap += next_cap;
        }
        self.free.insert(start, cap);

        self.stats.releases += 1;
        self.stats.bytes_in_use -= u64::from(len);
        Ok(())
    }

    fn range(&self, ptr: GuestPtr, len: u32) -> Result<core::ops::Range<usize>, Trap> {
        let fault = Trap::MemoryFault {
            addr: ptr.addr(),
            len,
        };
        if ptr.addr() < NULL_PAGE {
            return Err(fault);
        }
        let end = ptr.addr().checked_add(len).ok_or(fault.clone())?;
        if end as usize > self.bytes.len() {
            return Err(fault);
        }
        Ok(ptr.addr() as usize..end as usize)
    }

    pub(crate) fn read(&self, ptr: GuestPtr, len: u32) -> Result<&[u8], Trap> {
        let range = self.range(ptr, len)?;
        Ok(&self.bytes[range])
    }

    pub(crate) fn write(&mut self, ptr: GuestPtr, data: &[u8]) -> Result<(), Trap> {
        let len = u32::try_from(data.len()).map_err(|_| Trap::MemoryFault {
            addr: ptr.addr(),
            len: u32::MAX,
        })?;
        let range = self.range(ptr, len)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn load<T: Wire>(&self, ptr: GuestPtr) -> Result<T, Trap> {
        Ok(T::read_le(self.read(ptr, T::SIZE as u32)?))
    }

    pub(crate) fn store<T: Wire>(&mut self, ptr: GuestPtr, value: T) -> Result<(), Trap> {
        let range = self.range(ptr, T::SIZE as u32)?;
        value.write_le(&mut self.bytes[range]);
        Ok(())
    }

    pub(crate) fn load_array<T: Wire>(&self, ptr: GuestPtr, count: u32) -> Result<Vec<T>, Trap> {
        let len = count.checked_mul(T::SIZE as u32).ok_or(Trap::MemoryFault {
            addr: ptr.addr(),
            len: u32::MAX,
        })?;
        let bytes = self.read(ptr, len)?;
        Ok(bytes.chunks_exact(T::SIZE).map(T::read_le).collect())
    }

    pub(crate) fn store_array<T: Wire>(&mut self, ptr: GuestPtr, values: &[T]) -> Result<(), Trap> {
        let mut encoded = vec![0u8; values.len() * T::SIZE];
        for (value, out) in values.iter().zip(encoded.chunks_exact_mut(T::SIZE)) {
            value.write_le(out);
        }
        self.write(ptr, &encoded)
    }

    /// NUL-terminated string at `ptr`, scanning at most `max` bytes.
    ///
    /// `Ok(None)` when no terminator is found inside the scan window.
    pub(crate) fn c_string(&self, ptr: GuestPtr, max: u32) -> Result<Option<&[u8]>, Trap> {
        self.range(ptr, 1)?;
        let available = self.bytes.len() as u32 - ptr.addr();
        let window = self.read(ptr, available.min(max))?;
        Ok(window.iter().position(|&b| b == 0).map(|end| &window[..end]))
    }

    /// Allocate and fill a NUL-terminated copy of `text`.
    pub(crate) fn alloc_c_string(&mut self, text: &[u8]) -> Result<GuestPtr, Trap> {
        let len = u32::try_from(text.len() + 1).map_err(|_| Trap::OutOfMemory {
            requested: u32::MAX,
        })?;
        let ptr = self.alloc(len)?;
        self.write(ptr, text)?;
        Ok(ptr)
    }
}
