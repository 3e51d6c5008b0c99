//! Resource limits for decode and encode sessions.
//!
//! [`ResourceLimits`] caps what a single call may consume on the host side
//! and what the host is willing to accept from the codec. [`LimitExceeded`]
//! is returned when a check fails. Dimension checks run right after the
//! header is read, before any pixel buffer is allocated.

/// Resource limits for decode/encode calls.
///
/// All fields are optional; `None` means no limit for that resource.
/// The defaults ([`ResourceLimits::default`]) bound image size, the host
/// pixel buffer and the values that come out of the codec (chunk payloads,
/// embedded profiles). [`ResourceLimits::none`] lifts every cap.
///
/// ```
/// use pngbox::ResourceLimits;
///
/// let limits = ResourceLimits::default()
///     .with_max_pixels(100_000_000)
///     .with_max_file_size(64 * 1024 * 1024);
/// assert!(limits.check_dimensions(10_000, 10_000).is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResourceLimits {
    /// Maximum total pixels (width × height).
    pub max_pixels: Option<u64>,
    /// Maximum host pixel buffer size in bytes.
    pub max_memory_bytes: Option<u64>,
    /// Maximum image width in pixels.
    pub max_width: Option<u32>,
    /// Maximum image height in pixels.
    pub max_height: Option<u32>,
    /// Maximum number of bytes pulled from the input stream (decode only).
    pub max_file_size: Option<u64>,
    /// Maximum number of bytes pushed to the output sink (encode only).
    pub max_output_bytes: Option<u64>,
    /// Maximum payload of a single pass-through chunk.
    pub max_chunk_bytes: Option<u32>,
    /// Maximum size of an embedded ICC profile.
    pub max_icc_bytes: Option<u32>,
}

/// Pixel count cap applied unless overridden.
pub const DEFAULT_MAX_PIXELS: u64 = 100_000_000;

/// Host pixel buffer cap applied unless overridden.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// Payload cap applied to unknown chunks unless overridden.
pub const DEFAULT_MAX_CHUNK_BYTES: u32 = 8 * 1024 * 1024;

/// ICC profile cap applied unless overridden.
pub const DEFAULT_MAX_ICC_BYTES: u32 = 16 * 1024 * 1024;

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::none()
            .with_max_pixels(DEFAULT_MAX_PIXELS)
            .with_max_memory(DEFAULT_MAX_MEMORY_BYTES)
            .with_max_chunk_bytes(DEFAULT_MAX_CHUNK_BYTES)
            .with_max_icc_bytes(DEFAULT_MAX_ICC_BYTES)
    }
}

impl ResourceLimits {
    /// No limits (all fields `None`).
    pub fn none() -> Self {
        Self {
            max_pixels: None,
            max_memory_bytes: None,
            max_width: None,
            max_height: None,
            max_file_size: None,
            max_output_bytes: None,
            max_chunk_bytes: None,
            max_icc_bytes: None,
        }
    }

    /// Set maximum total pixels.
    pub fn with_max_pixels(mut self, max: u64) -> Self {
        self.max_pixels = Some(max);
        self
    }

    /// Set maximum host pixel buffer size in bytes.
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Set maximum image width in pixels.
    pub fn with_max_width(mut self, width: u32) -> Self {
        self.max_width = Some(width);
        self
    }

    /// Set maximum image height in pixels.
    pub fn with_max_height(mut self, height: u32) -> Self {
        self.max_height = Some(height);
        self
    }

    /// Set maximum input size in bytes.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    /// Set maximum encoded output size in bytes.
    pub fn with_max_output(mut self, bytes: u64) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Set maximum payload of a pass-through chunk.
    pub fn with_max_chunk_bytes(mut self, bytes: u32) -> Self {
        self.max_chunk_bytes = Some(bytes);
        self
    }

    /// Set maximum embedded ICC profile size.
    pub fn with_max_icc_bytes(mut self, bytes: u32) -> Self {
        self.max_icc_bytes = Some(bytes);
        self
    }

    /// Whether any limits are set.
    pub fn has_any(&self) -> bool {
        self.max_pixels.is_some()
            || self.max_memory_bytes.is_some()
            || self.max_width.is_some()
            || self.max_height.is_some()
            || self.max_file_size.is_some()
            || self.max_output_bytes.is_some()
            || self.max_chunk_bytes.is_some()
            || self.max_icc_bytes.is_some()
    }

    /// Check header dimensions against `max_width`, `max_height` and
    /// `max_pixels`.
    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<(), LimitExceeded> {
        within(width, self.max_width, |actual, max| LimitExceeded::Width { actual, max })?;
        within(height, self.max_height, |actual, max| LimitExceeded::Height { actual, max })?;
        let pixels = u64::from(width) * u64::from(height);
        within(pixels, self.max_pixels, |actual, max| LimitExceeded::Pixels { actual, max })
    }

    /// Check the host pixel buffer size against `max_memory_bytes`.
    pub fn check_memory(&self, bytes: u64) -> Result<(), LimitExceeded> {
        within(bytes, self.max_memory_bytes, |actual, max| LimitExceeded::Memory { actual, max })
    }

    /// Check the bytes pulled from the input so far.
    pub fn check_file_size(&self, bytes: u64) -> Result<(), LimitExceeded> {
        within(bytes, self.max_file_size, |actual, max| LimitExceeded::FileSize { actual, max })
    }

    /// Check the bytes pushed to the sink so far.
    pub fn check_output_size(&self, bytes: u64) -> Result<(), LimitExceeded> {
        within(bytes, self.max_output_bytes, |actual, max| LimitExceeded::OutputSize { actual, max })
    }

    pub fn check_chunk(&self, bytes: u32) -> Result<(), LimitExceeded> {
        within(bytes, self.max_chunk_bytes, |actual, max| LimitExceeded::Chunk { actual, max })
    }

    pub fn check_icc(&self, bytes: u32) -> Result<(), LimitExceeded> {
        within(bytes, self.max_icc_bytes, |actual, max| LimitExceeded::IccProfile { actual, max })
    }
}

fn within<T: PartialOrd + Copy>(
    actual: T,
    max: Option<T>,
    exceeded: impl FnOnce(T, T) -> LimitExceeded,
) -> Result<(), LimitExceeded> {
    match max {
        Some(max) if actual > max => Err(exceeded(actual, max)),
        _ => Ok(()),
    }
}

/// A resource limit was exceeded.
///
/// Each variant carries the actual value and the limit that was exceeded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LimitExceeded {
    /// Image width exceeded `max_width`.
    #[error("width {actual} exceeds limit {max}")]
    Width { actual: u32, max: u32 },
    /// Image height exceeded `max_height`.
    #[error("height {actual} exceeds limit {max}")]
    Height { actual: u32, max: u32 },
    /// Pixel count exceeded `max_pixels`.
    #[error("pixel count {actual} exceeds limit {max}")]
    Pixels { actual: u64, max: u64 },
    /// Host buffer exceeded `max_memory_bytes`.
    #[error("memory {actual} bytes exceeds limit {max}")]
    Memory { actual: u64, max: u64 },
    /// Input exceeded `max_file_size`.
    #[error("file size {actual} bytes exceeds limit {max}")]
    FileSize { actual: u64, max: u64 },
    /// Output exceeded `max_output_bytes`.
    #[error("output size {actual} bytes exceeds limit {max}")]
    OutputSize { actual: u64, max: u64 },
    /// A pass-through chunk exceeded `max_chunk_bytes`.
    #[error("chunk payload {actual} bytes exceeds limit {max}")]
    Chunk { actual: u32, max: u32 },
    /// An embedded profile exceeded `max_icc_bytes`.
    #[error("ICC profile {actual} bytes exceeds limit {max}")]
    IccProfile { actual: u32, max: u32 },
    /// The host could not reserve a buffer of this size.
    #[error("host allocation of {bytes} bytes failed")]
    Allocation { bytes: u64 },
}
