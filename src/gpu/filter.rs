// gpu/filter.rs — end-to-end filter pipeline.
//
// `MedianFilter` orchestrates one request: validate → get device buffers
// (pool leases or one-shot allocations) → upload → dispatch → readback →
// unpack. Both entry points are synchronous; they return only once `dst` is
// fully populated, and `dst` is never touched on a failure path.
//
// The pooled and unpooled paths share `execute()` byte for byte, which is
// what makes "pooling must not change numeric results" hold by
// construction.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gpu::device::GpuDevice;
use crate::gpu::kernel::MedianKernel;
use crate::gpu::pool::{align_to, BufferKind, BufferPool, COPY_ALIGNMENT};
use crate::median;

/// GPU median filter engine. Create once (pipeline compilation happens
/// here), call per frame. Shareable across threads.
pub struct MedianFilter {
    gpu: Arc<GpuDevice>,
    kernel: MedianKernel,
}

impl MedianFilter {
    /// Create an engine on a fresh device context.
    pub fn new() -> Result<Self> {
        Ok(Self::with_device(Arc::new(GpuDevice::new()?)))
    }

    /// Create an engine on an existing device context.
    pub fn with_device(gpu: Arc<GpuDevice>) -> Self {
        let kernel = MedianKernel::new(&gpu);
        MedianFilter { gpu, kernel }
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    /// Build a pool on this engine's device for images up to
    /// `max_width × max_height`.
    pub fn create_pool(&self, max_width: u32, max_height: u32) -> Result<BufferPool> {
        BufferPool::new(Arc::clone(&self.gpu), max_width, max_height)
    }

    /// Median-filter `src` into `dst` using buffers leased from `pool`.
    ///
    /// The pool must have been created on this engine's device. Leases are
    /// returned on every path; the first error encountered wins.
    pub fn filter_with_pool(
        &self,
        pool: &BufferPool,
        src: &[u8],
        width: u32,
        height: u32,
        kernel_size: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        median::validate(src.len(), width, height, kernel_size, dst.len())?;
        pool.check_dimensions(width, height)?;
        if !Arc::ptr_eq(pool.gpu(), &self.gpu) {
            return Err(Error::InvalidArgument(
                "pool was created on a different device".into(),
            ));
        }

        let pixels = width as u64 * height as u64;
        let src_lease = pool.acquire(BufferKind::Storage, pixels)?;
        let dst_lease = match pool.acquire(BufferKind::Storage, pixels * 4) {
            Ok(l) => l,
            Err(e) => {
                let _ = pool.release(src_lease);
                return Err(e);
            }
        };
        let rb_lease = match pool.acquire(BufferKind::Readback, pixels * 4) {
            Ok(l) => l,
            Err(e) => {
                let _ = pool.release(src_lease);
                let _ = pool.release(dst_lease);
                return Err(e);
            }
        };

        let outcome = self.execute(
            src_lease.buffer(),
            dst_lease.buffer(),
            rb_lease.buffer(),
            src,
            width,
            height,
            kernel_size,
            dst,
        );

        let r_src = pool.release(src_lease);
        let r_dst = pool.release(dst_lease);
        let r_rb = pool.release(rb_lease);
        outcome?;
        r_src?;
        r_dst?;
        r_rb?;
        Ok(())
    }

    /// Median-filter `src` into `dst`, allocating and freeing this call's
    /// device buffers directly. Same pipeline, per-call allocation cost.
    pub fn filter(
        &self,
        src: &[u8],
        width: u32,
        height: u32,
        kernel_size: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        median::validate(src.len(), width, height, kernel_size, dst.len())?;

        let pixels = width as u64 * height as u64;
        let src_buf = self.gpu.create_byte_buffer(
            align_to(pixels, COPY_ALIGNMENT),
            BufferKind::Storage.usages(),
            "median src",
        )?;
        let dst_buf = self.gpu.create_byte_buffer(
            pixels * 4,
            BufferKind::Storage.usages(),
            "median dst",
        )?;
        let rb_buf = self.gpu.create_byte_buffer(
            pixels * 4,
            BufferKind::Readback.usages(),
            "median readback",
        )?;

        self.execute(&src_buf, &dst_buf, &rb_buf, src, width, height, kernel_size, dst)
    }

    /// The shared device round-trip. Parameters are pre-validated and the
    /// buffers have sufficient capacity (pool invariant / direct sizing).
    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        src_buf: &wgpu::Buffer,
        dst_buf: &wgpu::Buffer,
        rb_buf: &wgpu::Buffer,
        src: &[u8],
        width: u32,
        height: u32,
        kernel_size: u32,
        dst: &mut [u8],
    ) -> Result<()> {
        let pixels = src.len();
        let dst_bytes = pixels as u64 * 4;

        // Everything from upload to submit runs under a validation error
        // scope so copy/launch failures surface as Transfer instead of an
        // uncaptured-error hook. The scope stack is per device and shared
        // across threads; the guard keeps a concurrent request (or a pool
        // growth allocation) from popping this window's scope.
        let guard = self.gpu.scope_guard();
        self.gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        // Upload, padding the tail to wgpu's 4-byte write granularity.
        // Padding bytes share the last word with real pixels but are
        // masked off by the shader's per-pixel index bound.
        if pixels % COPY_ALIGNMENT as usize == 0 {
            self.gpu.queue.write_buffer(src_buf, 0, src);
        } else {
            let padded_len = align_to(pixels as u64, COPY_ALIGNMENT) as usize;
            let mut padded = vec![0u8; padded_len];
            padded[..pixels].copy_from_slice(src);
            self.gpu.queue.write_buffer(src_buf, 0, &padded);
        }

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("median filter"),
            });
        self.kernel
            .encode(&self.gpu, &mut encoder, src_buf, dst_buf, width, height, kernel_size);
        encoder.copy_buffer_to_buffer(dst_buf, 0, rb_buf, 0, dst_bytes);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let scope = self.gpu.device.pop_error_scope();
        drop(guard);

        // Blocking readback. The closure unpacks the word-per-pixel output
        // into a compact byte vector.
        let result = self.gpu.read_mapped(rb_buf, |mapped| {
            let words: &[u32] = bytemuck::cast_slice(&mapped[..dst_bytes as usize]);
            words.iter().map(|&w| w as u8).collect::<Vec<u8>>()
        })?;

        // Check the scope before touching dst: a failed launch must not
        // leave partial output.
        if let Some(e) = pollster::block_on(scope) {
            return Err(Error::Transfer(e.to_string()));
        }

        dst.copy_from_slice(&result);
        Ok(())
    }
}
