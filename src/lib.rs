// median-pool: pooled GPU median filtering for 8-bit grayscale images.
//
// Repeated median filtering of bounded-size frames (video denoising) spends
// most of its time allocating and freeing device memory if done naively.
// This crate keeps a pool of device buffers sized for a declared maximum
// frame and round-trips each request through it:
//
//   MedianFilter::new() ──► create_pool(max_w, max_h) once
//        │
//        └─ filter_with_pool(&pool, src, w, h, k, dst)   per frame
//           filter(src, w, h, k, dst)                    unpooled fallback
//
// A C-linkage surface (module `ffi`) preserves the original shared-library
// contract: cuda_init_buffer_pool / cuda_cleanup_buffer_pool /
// cuda_median_filter_with_pool / cuda_median_filter.

pub mod error;
pub mod ffi;
pub mod gpu;
pub mod median;

pub use error::{Error, Result};
pub use gpu::device::{GpuDevice, WorkgroupSize};
pub use gpu::filter::MedianFilter;
pub use gpu::pool::{BufferKind, BufferPool, Lease};
pub use median::median_filter as median_filter_cpu;
