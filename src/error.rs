//! Error types.
//!
//! [`Error`] is the single outcome type of every decode and encode call.
//! [`Trap`] describes a fault inside the isolated domain and [`DomainError`]
//! a lifecycle misuse of the domain itself.

use std::path::PathBuf;

use crate::boundary::BoundaryError;
use crate::limits::LimitExceeded;

/// Errors from [`decode`](crate::decode) / [`encode`](crate::encode) and their
/// job-level counterparts.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The image file could not be opened or created.
    #[error("cannot open {path:?}: {source}")]
    FileOpen {
        /// Path that was being opened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The isolated domain is not available.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The codec refused to create its control or info structure.
    #[error("codec session could not be started: {0}")]
    SessionInit(String),

    /// The header declares a color type the pipeline cannot represent.
    #[error("unsupported color type {color_type}")]
    UnsupportedFormat {
        /// Raw color type from the image header.
        color_type: u8,
    },

    /// The stream ended early or the output sink rejected a write.
    #[error("row I/O failed: {0}")]
    RowIo(String),

    /// The codec reported an error through its own error path.
    #[error("codec error: {0}")]
    Codec(String),

    /// The host image handed to the encoder is inconsistent.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A value coming out of the domain failed verification.
    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    /// A configured resource limit was exceeded.
    #[error(transparent)]
    Limit(#[from] LimitExceeded),

    /// The codec faulted inside the domain.
    #[error("codec trapped: {0}")]
    Trap(#[from] Trap),
}

/// Outcome type of the decode pipeline.
pub type DecodeError = Error;

/// Outcome type of the encode pipeline.
pub type EncodeError = Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A fault raised while control was inside the isolated domain.
///
/// Every variant except [`Trap::Aborted`] and [`Trap::Reentered`] poisons the
/// domain: further invocations fail with [`Trap::Poisoned`] until the domain
/// is recreated.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Trap {
    /// The codec left through its own error path.
    #[error("codec aborted through its error handler")]
    Aborted,
    /// The codec panicked.
    #[error("codec crashed: {0}")]
    Crashed(String),
    /// An earlier fault left the domain unusable.
    #[error("domain is poisoned by an earlier fault")]
    Poisoned,
    /// The domain's linear memory cap was reached.
    #[error("domain memory exhausted ({requested} bytes requested)")]
    OutOfMemory {
        /// Size of the failed allocation.
        requested: u32,
    },
    /// An access fell outside linear memory or into the null page.
    #[error("memory fault at {addr:#x} (+{len})")]
    MemoryFault {
        /// Guest address of the access.
        addr: u32,
        /// Length of the access.
        len: u32,
    },
    /// A second entry into the domain while a call was in progress.
    #[error("domain re-entered during an active call")]
    Reentered,
    /// The codec called a callback slot that is not registered for that use.
    #[error("call through unregistered callback slot {0}")]
    BadCallback(u32),
    /// Release of an address that is not a live allocation.
    #[error("invalid release of {0:#x}")]
    InvalidFree(u32),
}

/// Misuse of the process-wide isolated domain.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DomainError {
    /// [`create_domain`](crate::create_domain) was called twice.
    #[error("isolated domain already created")]
    AlreadyCreated,
    /// The domain was used before creation or after destruction.
    #[error("isolated domain not created")]
    NotCreated,
    /// The domain was used again from a callback of a call that holds it.
    #[error("isolated domain busy on this thread")]
    Busy,
    /// The codec module could not be loaded.
    #[error("cannot load codec module {path:?}: {reason}")]
    ModuleLoad {
        /// Module path as given by the caller.
        path: PathBuf,
        /// Why loading failed.
        reason: String,
    },
}
