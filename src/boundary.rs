//! Values that cross the isolation boundary.
//!
//! Everything the codec hands back (return values, out-parameters, pointers,
//! lengths, callback arguments) arrives as a [`BoundaryValue`]. The raw
//! value is private; the only way to get at it is [`BoundaryValue::verify`]
//! and its bounded shorthands, each of which takes a justification that is
//! logged when trust is granted and reported when it is refused.

use core::fmt;
use core::ops::RangeInclusive;

/// An address in the domain's linear memory.
///
/// Guest pointers are plain offsets. They are never turned into host
/// references; every dereference goes through the bounds-checked
/// [`LinearMemory`](crate::memory::LinearMemory) accessors.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestPtr(u32);

impl GuestPtr {
    /// The null guest pointer.
    pub const NULL: Self = Self(0);

    /// Wrap a raw guest address.
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Raw guest address.
    pub const fn addr(self) -> u32 {
        self.0
    }

    /// Whether this is the null pointer.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for GuestPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestPtr({:#x})", self.0)
    }
}

/// Fixed-size little-endian layout of a value stored in linear memory.
pub trait Wire: Copy {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from exactly [`Self::SIZE`] bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into exactly [`Self::SIZE`] bytes.
    fn write_le(&self, out: &mut [u8]);
}

macro_rules! wire_int {
    ($($t:ty),*) => {$(
        impl Wire for $t {
            const SIZE: usize = core::mem::size_of::<$t>();

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$t>::from_le_bytes(raw)
            }

            fn write_le(&self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

wire_int!(u8, u16, u32, i32);

impl Wire for GuestPtr {
    const SIZE: usize = 4;

    fn read_le(bytes: &[u8]) -> Self {
        Self(u32::read_le(bytes))
    }

    fn write_le(&self, out: &mut [u8]) {
        self.0.write_le(out);
    }
}

/// A datum produced by the untrusted side that has not been verified yet.
///
/// Host logic cannot read the wrapped value without calling one of the
/// `verify*` methods. `Debug` deliberately hides it.
#[must_use = "values from the codec must be verified before use"]
pub struct BoundaryValue<T> {
    raw: T,
}

impl<T> BoundaryValue<T> {
    pub(crate) fn untrusted(raw: T) -> Self {
        Self { raw }
    }

    /// Grant trust to the value if `check` accepts it.
    ///
    /// `check` returns the verified (possibly converted) value or `None` to
    /// reject it. `justification` names the property being relied upon.
    pub fn verify<U>(
        self,
        justification: &'static str,
        check: impl FnOnce(T) -> Option<U>,
    ) -> Result<U, BoundaryError> {
        match check(self.raw) {
            Some(value) => {
                log::trace!("boundary: trusted value ({justification})");
                Ok(value)
            }
            None => Err(BoundaryError::new(justification, "value rejected")),
        }
    }

    /// Like [`verify`](Self::verify), with a rejection reason from `check`.
    pub fn verify_with<U>(
        self,
        justification: &'static str,
        check: impl FnOnce(T) -> Result<U, String>,
    ) -> Result<U, BoundaryError> {
        match check(self.raw) {
            Ok(value) => {
                log::trace!("boundary: trusted value ({justification})");
                Ok(value)
            }
            Err(detail) => Err(BoundaryError::new(justification, detail)),
        }
    }

    /// Drop a value the host never relies on, such as the result of an
    /// entry point that only has side effects.
    pub(crate) fn discard(self, what: &'static str) {
        log::trace!("boundary: discarded result of {what}");
    }

    /// Transform the untrusted value without granting trust.
    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> BoundaryValue<U> {
        BoundaryValue { raw: f(self.raw) }
    }
}

impl BoundaryValue<u32> {
    /// Accept a length or count no larger than `bound`.
    pub fn verify_at_most(self, bound: u32, justification: &'static str) -> Result<u32, BoundaryError> {
        self.verify_with(justification, |n| {
            if n <= bound {
                Ok(n)
            } else {
                Err(format!("{n} exceeds bound {bound}"))
            }
        })
    }

    /// Accept a value inside `range`.
    pub fn verify_in(
        self,
        range: RangeInclusive<u32>,
        justification: &'static str,
    ) -> Result<u32, BoundaryError> {
        self.verify_with(justification, |n| {
            if range.contains(&n) {
                Ok(n)
            } else {
                Err(format!("{n} outside {}..={}", range.start(), range.end()))
            }
        })
    }

    /// Accept exactly `expected`.
    pub fn verify_eq(self, expected: u32, justification: &'static str) -> Result<u32, BoundaryError> {
        self.verify_in(expected..=expected, justification)
    }

    /// Accept a non-null pointer.
    pub fn verify_ptr(self, justification: &'static str) -> Result<GuestPtr, BoundaryError> {
        self.verify_with(justification, |addr| {
            if addr == 0 {
                Err("null pointer".to_owned())
            } else {
                Ok(GuestPtr(addr))
            }
        })
    }

    /// Accept an info flag answer: either `0` or exactly `flag`.
    pub fn verify_flag(self, flag: u32, justification: &'static str) -> Result<bool, BoundaryError> {
        self.verify_with(justification, |v| match v {
            0 => Ok(false),
            v if v == flag => Ok(true),
            v => Err(format!("{v:#x} is neither 0 nor {flag:#x}")),
        })
    }
}

impl BoundaryValue<Vec<u8>> {
    /// Accept a byte buffer whose length is exactly `len`.
    pub fn verify_len(self, len: usize, justification: &'static str) -> Result<Vec<u8>, BoundaryError> {
        self.verify_with(justification, |bytes| {
            if bytes.len() == len {
                Ok(bytes)
            } else {
                Err(format!("{} bytes where {len} were expected", bytes.len()))
            }
        })
    }
}

impl<T> fmt::Debug for BoundaryValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoundaryValue(<unverified>)")
    }
}

/// A value from the codec failed verification.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("boundary check failed ({justification}): {detail}")]
pub struct BoundaryError {
    /// The property that was being relied upon.
    pub justification: &'static str,
    /// What was wrong with the value.
    pub detail: String,
}

impl BoundaryError {
    pub(crate) fn new(justification: &'static str, detail: impl Into<String>) -> Self {
        Self {
            justification,
            detail: detail.into(),
        }
    }
}
