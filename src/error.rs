// error.rs — crate-wide error type and C status code mapping.
//
// One enum covers the whole failure taxonomy so the FFI layer can map any
// failure onto a stable integer status without inspecting module internals.
// Variants carry enough context to print a useful one-line diagnostic;
// `Display` is the only formatting surface.

use std::fmt;

/// Stable status codes for the C-linkage surface. `0` is success; every
/// error class gets its own non-zero code.
pub mod status {
    pub const OK: i32 = 0;
    pub const INVALID_ARGUMENT: i32 = 1;
    pub const DIMENSIONS_EXCEED_POOL: i32 = 2;
    pub const ALLOCATION_FAILED: i32 = 3;
    pub const TRANSFER_FAILED: i32 = 4;
    pub const INVALID_HANDLE: i32 = 5;
    pub const POOL_BUSY: i32 = 6;
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors from pool management and the filtering pipeline.
#[derive(Debug)]
pub enum Error {
    /// Caller passed a parameter that fails validation (zero dimension,
    /// even kernel, window larger than the image, length mismatch).
    /// Detected before any device interaction.
    InvalidArgument(String),
    /// Requested image exceeds the bounds the pool was created for.
    /// Rejected without touching the pool's entry table.
    PoolCapacityExceeded {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    /// Device allocation failed, either in the pool's growth path or in the
    /// unpooled path's direct allocation.
    OutOfMemory { requested: u64, limit: u64 },
    /// No Vulkan adapter found that passes the software-rasterizer filter.
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits).
    DeviceRequest(wgpu::RequestDeviceError),
    /// A host↔device copy or kernel launch failed. Kept distinct from
    /// allocation failure.
    Transfer(String),
    /// Operation invoked on a null or already-cleaned-up pool handle.
    InvalidHandle,
    /// Cleanup attempted while buffers are still checked out.
    PoolBusy { in_use: usize },
    /// A buffer was released twice, or a lease no longer matches its pool
    /// slot. Indicates a double-free bug upstream.
    DoubleRelease,
}

impl Error {
    /// Map onto the stable C status codes.
    ///
    /// `DoubleRelease` folds into the invalid-argument class: it is a caller
    /// protocol violation, not a device failure.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::DoubleRelease => status::INVALID_ARGUMENT,
            Error::PoolCapacityExceeded { .. } => status::DIMENSIONS_EXCEED_POOL,
            Error::OutOfMemory { .. } => status::ALLOCATION_FAILED,
            Error::NoSuitableAdapter | Error::DeviceRequest(_) | Error::Transfer(_) => {
                status::TRANSFER_FAILED
            }
            Error::InvalidHandle => status::INVALID_HANDLE,
            Error::PoolBusy { .. } => status::POOL_BUSY,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::PoolCapacityExceeded { width, height, max_width, max_height } => write!(
                f,
                "image {width}×{height} exceeds pool capacity {max_width}×{max_height}"
            ),
            Error::OutOfMemory { requested, limit } => write!(
                f,
                "device allocation of {requested} bytes failed (limit {limit})"
            ),
            Error::NoSuitableAdapter => write!(
                f,
                "no suitable Vulkan adapter found (only CPU/software renderers visible)"
            ),
            Error::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            Error::Transfer(msg) => write!(f, "device transfer/launch failed: {msg}"),
            Error::InvalidHandle => write!(f, "null or cleaned-up pool handle"),
            Error::PoolBusy { in_use } => write!(
                f,
                "pool cleanup refused: {in_use} buffer(s) still checked out"
            ),
            Error::DoubleRelease => write!(f, "buffer released twice (double-free upstream)"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}
