// ffi.rs — stable C-linkage surface.
//
// The four entry points preserve the original shared-library contract,
// names included. Internally the opaque `void*` pool handle is a
// `Box<PoolHandle>` carrying a magic tag; the raw-pointer world exists only
// in this file and is converted to owned types at the edge.
//
// The C contract has no device-context parameter, so this layer (and only
// this layer) keeps one lazily-initialized process-wide engine. The Rust
// API underneath stays explicit — library users can run any number of
// independent devices and pools.
//
// Argument validation runs before any device interaction: calls with bad
// dimensions or kernel sizes return their status codes even on machines
// with no GPU.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex};

use crate::error::status;
use crate::gpu::filter::MedianFilter;
use crate::gpu::pool::BufferPool;
use crate::median;

/// Status codes returned by every `c_int`-returning entry point.
pub const MEDIAN_POOL_OK: c_int = status::OK;
pub const MEDIAN_POOL_INVALID_ARGUMENT: c_int = status::INVALID_ARGUMENT;
pub const MEDIAN_POOL_DIMENSIONS_EXCEED_POOL: c_int = status::DIMENSIONS_EXCEED_POOL;
pub const MEDIAN_POOL_ALLOCATION_FAILED: c_int = status::ALLOCATION_FAILED;
pub const MEDIAN_POOL_TRANSFER_FAILED: c_int = status::TRANSFER_FAILED;
pub const MEDIAN_POOL_INVALID_HANDLE: c_int = status::INVALID_HANDLE;
pub const MEDIAN_POOL_POOL_BUSY: c_int = status::POOL_BUSY;

/// Tag checked on every handle dereference and zeroed on cleanup, so a
/// stale or garbage handle is caught where feasible instead of faulting.
const POOL_MAGIC: u64 = 0x4d45_4449_414e_5030; // "MEDIANP0"

struct PoolHandle {
    magic: u64,
    engine: Arc<MedianFilter>,
    pool: BufferPool,
}

static ENGINE: Mutex<Option<Arc<MedianFilter>>> = Mutex::new(None);

/// The process-wide engine for the C surface. Device bring-up happens on
/// first use and is cached only on success — a failed attempt (driver still
/// coming up, adapter briefly unavailable) is retried on the next call
/// rather than disabling the surface for the rest of the process.
fn engine() -> Option<Arc<MedianFilter>> {
    let mut slot = ENGINE.lock().unwrap();
    if let Some(engine) = slot.as_ref() {
        return Some(Arc::clone(engine));
    }
    match MedianFilter::new() {
        Ok(f) => {
            let engine = Arc::new(f);
            *slot = Some(Arc::clone(&engine));
            Some(engine)
        }
        Err(e) => {
            eprintln!("[median-pool] device initialization failed: {e}");
            None
        }
    }
}

/// Run `f`, converting its status and any panic into a status code.
/// Panics must not unwind across `extern "C"`.
fn guarded(f: impl FnOnce() -> c_int) -> c_int {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => code,
        Err(_) => {
            eprintln!("[median-pool] internal panic caught at FFI boundary");
            MEDIAN_POOL_TRANSFER_FAILED
        }
    }
}

/// Validate dimensions/kernel before any pointer or device is touched.
/// Returns the pixel count on success.
fn checked_request(width: c_int, height: c_int, kernel_size: c_int) -> Result<usize, c_int> {
    if width <= 0 || height <= 0 || kernel_size <= 0 {
        return Err(MEDIAN_POOL_INVALID_ARGUMENT);
    }
    let (w, h, k) = (width as u32, height as u32, kernel_size as u32);
    let pixels = w as usize * h as usize;
    median::validate(pixels, w, h, k, pixels).map_err(|e| e.status_code())?;
    Ok(pixels)
}

/// Create a buffer pool for images up to `max_width × max_height`.
///
/// Returns an opaque handle, or null if the bounds are not positive, the
/// device cannot be initialized, or the initial reservation fails. A
/// failed device bring-up is not sticky; a later call tries again.
#[no_mangle]
pub extern "C" fn cuda_init_buffer_pool(max_width: c_int, max_height: c_int) -> *mut c_void {
    if max_width <= 0 || max_height <= 0 {
        return ptr::null_mut();
    }
    let result = catch_unwind(|| {
        let engine = engine()?;
        match engine.create_pool(max_width as u32, max_height as u32) {
            Ok(pool) => Some(Box::into_raw(Box::new(PoolHandle {
                magic: POOL_MAGIC,
                engine,
                pool,
            })) as *mut c_void),
            Err(e) => {
                eprintln!("[median-pool] pool creation failed: {e}");
                None
            }
        }
    });
    match result {
        Ok(Some(handle)) => handle,
        _ => ptr::null_mut(),
    }
}

/// Free all pooled device memory and invalidate the handle.
///
/// If buffers are still checked out, returns the pool-busy status and
/// leaves the handle valid so the caller can release and retry.
///
/// # Safety
/// `pool` must be null or a handle from `cuda_init_buffer_pool` that has
/// not been cleaned up yet.
#[no_mangle]
pub unsafe extern "C" fn cuda_cleanup_buffer_pool(pool: *mut c_void) -> c_int {
    if pool.is_null() {
        return MEDIAN_POOL_INVALID_HANDLE;
    }
    guarded(|| {
        // Work through the raw pointer so no reference into the handle is
        // live when `Box::from_raw` reclaims it.
        let raw = pool as *mut PoolHandle;
        if (*raw).magic != POOL_MAGIC {
            return MEDIAN_POOL_INVALID_HANDLE;
        }
        match (*raw).pool.cleanup() {
            Ok(()) => {
                let mut handle = Box::from_raw(raw);
                handle.magic = 0;
                drop(handle);
                MEDIAN_POOL_OK
            }
            Err(e) => e.status_code(),
        }
    })
}

/// Median-filter `width*height` grayscale bytes from `src` into `dst`,
/// using device buffers leased from `pool`.
///
/// # Safety
/// `pool` must be a live handle from `cuda_init_buffer_pool`; `src` and
/// `dst` must point to `width*height` readable/writable bytes.
#[no_mangle]
pub unsafe extern "C" fn cuda_median_filter_with_pool(
    pool: *mut c_void,
    src: *const u8,
    width: c_int,
    height: c_int,
    kernel_size: c_int,
    dst: *mut u8,
) -> c_int {
    if pool.is_null() {
        return MEDIAN_POOL_INVALID_HANDLE;
    }
    if src.is_null() || dst.is_null() {
        return MEDIAN_POOL_INVALID_ARGUMENT;
    }
    let pixels = match checked_request(width, height, kernel_size) {
        Ok(n) => n,
        Err(code) => return code,
    };
    guarded(|| {
        let handle = &*(pool as *const PoolHandle);
        if handle.magic != POOL_MAGIC {
            return MEDIAN_POOL_INVALID_HANDLE;
        }
        let src = std::slice::from_raw_parts(src, pixels);
        let dst = std::slice::from_raw_parts_mut(dst, pixels);
        match handle.engine.filter_with_pool(
            &handle.pool,
            src,
            width as u32,
            height as u32,
            kernel_size as u32,
            dst,
        ) {
            Ok(()) => MEDIAN_POOL_OK,
            Err(e) => e.status_code(),
        }
    })
}

/// Median-filter without a pool: device buffers are allocated and freed
/// within this call.
///
/// # Safety
/// `src` and `dst` must point to `width*height` readable/writable bytes.
#[no_mangle]
pub unsafe extern "C" fn cuda_median_filter(
    src: *const u8,
    width: c_int,
    height: c_int,
    kernel_size: c_int,
    dst: *mut u8,
) -> c_int {
    if src.is_null() || dst.is_null() {
        return MEDIAN_POOL_INVALID_ARGUMENT;
    }
    let pixels = match checked_request(width, height, kernel_size) {
        Ok(n) => n,
        Err(code) => return code,
    };
    guarded(|| {
        let Some(engine) = engine() else {
            return MEDIAN_POOL_TRANSFER_FAILED;
        };
        let src = std::slice::from_raw_parts(src, pixels);
        let dst = std::slice::from_raw_parts_mut(dst, pixels);
        match engine.filter(src, width as u32, height as u32, kernel_size as u32, dst) {
            Ok(()) => MEDIAN_POOL_OK,
            Err(e) => e.status_code(),
        }
    })
}
