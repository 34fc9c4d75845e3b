// gpu/pool.rs — device buffer pool.
//
// Device-memory allocation costs orders of magnitude more than a kernel
// launch at the image sizes this crate targets, so the pool takes allocation
// off the per-call path: buffers are handed out against a byte size, marked
// in-use, and returned for reuse.
//
// POLICY
//   - Entry table behind a Mutex; acquire/release are safe from multiple
//     host threads filtering against the same pool.
//   - Best-fit: the smallest free entry whose capacity covers the request.
//   - Eager initial reservation sized for one max-dimension request
//     (source + destination + readback), then lazy exact-size growth up to
//     a per-kind entry cap.
//   - Cleanup refuses (PoolBusy) while any entry is checked out; it never
//     force-releases. A cleaned pool rejects all further operations.
//
// Two entry kinds exist because wgpu forbids MAP_READ on shader-visible
// storage buffers: `Storage` feeds the kernel, `Readback` stages the
// device→host copy. Host→device upload goes through Queue::write_buffer and
// needs no staging class.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::gpu::device::GpuDevice;

/// Most concurrent filter requests the growth policy budgets for. Each
/// request holds two storage entries (src + dst) and one readback entry.
const MAX_CONCURRENT_REQUESTS: usize = 8;

/// wgpu requires buffer sizes and copy sizes to be 4-byte aligned.
pub(crate) const COPY_ALIGNMENT: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// What a pooled buffer is for; determines its wgpu usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Shader-visible storage (kernel source/destination).
    Storage,
    /// Host-mappable staging for device→host readback.
    Readback,
}

impl BufferKind {
    pub(crate) fn usages(self) -> wgpu::BufferUsages {
        match self {
            BufferKind::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
            BufferKind::Readback => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        }
    }

    fn entry_cap(self) -> usize {
        match self {
            BufferKind::Storage => 2 * MAX_CONCURRENT_REQUESTS,
            BufferKind::Readback => MAX_CONCURRENT_REQUESTS,
        }
    }

    fn label(self) -> &'static str {
        match self {
            BufferKind::Storage => "BufferPool storage entry",
            BufferKind::Readback => "BufferPool readback entry",
        }
    }
}

struct Entry {
    buffer: Arc<wgpu::Buffer>,
    capacity: u64,
    kind: BufferKind,
    in_use: bool,
}

struct PoolInner {
    entries: Vec<Entry>,
    cleaned: bool,
    hits: u64,
    misses: u64,
}

/// A checked-out pool entry. Must be returned via [`BufferPool::release`];
/// the pool refuses cleanup while leases are outstanding.
pub struct Lease {
    buffer: Arc<wgpu::Buffer>,
    index: usize,
    capacity: u64,
    kind: BufferKind,
}

impl Lease {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }
}

/// Pool of reusable device buffers for images up to fixed maximum
/// dimensions.
pub struct BufferPool {
    gpu: Arc<GpuDevice>,
    max_width: u32,
    max_height: u32,
    inner: Mutex<PoolInner>,
}

/// Best-fit selection: smallest free capacity covering `required`.
/// `candidates` yields (entry index, capacity) for free entries of the
/// right kind. Pure so it is testable without a device.
fn best_fit(candidates: impl Iterator<Item = (usize, u64)>, required: u64) -> Option<usize> {
    candidates
        .filter(|&(_, cap)| cap >= required)
        .min_by_key(|&(_, cap)| cap)
        .map(|(i, _)| i)
}

impl BufferPool {
    /// Create a pool servicing images up to `max_width × max_height`.
    ///
    /// Eagerly reserves enough for one max-size request: a packed source
    /// buffer, a word-per-pixel destination buffer, and a matching readback
    /// buffer. Later requests that fit these never allocate.
    pub fn new(gpu: Arc<GpuDevice>, max_width: u32, max_height: u32) -> Result<Self> {
        if max_width == 0 || max_height == 0 {
            return Err(Error::InvalidArgument(format!(
                "pool bounds must be positive (got {max_width}×{max_height})"
            )));
        }

        let max_pixels = max_width as u64 * max_height as u64;
        let src_bytes = align_to(max_pixels, COPY_ALIGNMENT);
        let dst_bytes = max_pixels * 4;

        let mut entries = Vec::new();
        for (kind, capacity) in [
            (BufferKind::Storage, src_bytes),
            (BufferKind::Storage, dst_bytes),
            (BufferKind::Readback, dst_bytes),
        ] {
            let buffer = gpu.create_byte_buffer(capacity, kind.usages(), kind.label())?;
            entries.push(Entry { buffer: Arc::new(buffer), capacity, kind, in_use: false });
        }

        Ok(BufferPool {
            gpu,
            max_width,
            max_height,
            inner: Mutex::new(PoolInner { entries, cleaned: false, hits: 0, misses: 0 }),
        })
    }

    pub fn max_width(&self) -> u32 {
        self.max_width
    }

    pub fn max_height(&self) -> u32 {
        self.max_height
    }

    pub(crate) fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    /// Reject requests larger than the pool was created for, before the
    /// entry table is touched.
    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<()> {
        if width > self.max_width || height > self.max_height {
            return Err(Error::PoolCapacityExceeded {
                width,
                height,
                max_width: self.max_width,
                max_height: self.max_height,
            });
        }
        Ok(())
    }

    /// Check out a buffer of at least `bytes` capacity.
    ///
    /// Free entries are searched best-fit; on a miss a new exact-size entry
    /// is allocated while the kind is under its entry cap, otherwise the
    /// request fails as allocation failure.
    pub fn acquire(&self, kind: BufferKind, bytes: u64) -> Result<Lease> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("acquire of zero bytes".into()));
        }
        let bytes = align_to(bytes, COPY_ALIGNMENT);

        let mut inner = self.inner.lock().unwrap();
        if inner.cleaned {
            return Err(Error::InvalidHandle);
        }

        let found = best_fit(
            inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.kind == kind && !e.in_use)
                .map(|(i, e)| (i, e.capacity)),
            bytes,
        );
        if let Some(index) = found {
            let entry = &mut inner.entries[index];
            entry.in_use = true;
            let lease = Lease {
                buffer: Arc::clone(&entry.buffer),
                index,
                capacity: entry.capacity,
                kind,
            };
            inner.hits += 1;
            return Ok(lease);
        }

        let kind_count = inner.entries.iter().filter(|e| e.kind == kind).count();
        if kind_count >= kind.entry_cap() {
            let held: u64 = inner
                .entries
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| e.capacity)
                .sum();
            return Err(Error::OutOfMemory { requested: bytes, limit: held });
        }

        // Growth path. The device allocation happens under the lock; this
        // serializes concurrent growth, which is the safe ordering for a
        // table whose indices leases refer to.
        let buffer = self.gpu.create_byte_buffer(bytes, kind.usages(), kind.label())?;
        let index = inner.entries.len();
        inner.entries.push(Entry {
            buffer: Arc::new(buffer),
            capacity: bytes,
            kind,
            in_use: true,
        });
        inner.misses += 1;
        let entry = &inner.entries[index];
        Ok(Lease {
            buffer: Arc::clone(&entry.buffer),
            index,
            capacity: entry.capacity,
            kind,
        })
    }

    /// Return a lease. Releasing an entry that is already free, or a lease
    /// that no longer matches its slot, is a double-free bug upstream and
    /// reported as such — never a silent no-op.
    pub fn release(&self, lease: Lease) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cleaned {
            return Err(Error::InvalidHandle);
        }
        let entry = inner
            .entries
            .get_mut(lease.index)
            .ok_or(Error::DoubleRelease)?;
        if !entry.in_use || !Arc::ptr_eq(&entry.buffer, &lease.buffer) {
            return Err(Error::DoubleRelease);
        }
        entry.in_use = false;
        Ok(())
    }

    /// Free all entries and invalidate the pool.
    ///
    /// Fails with `PoolBusy` if any buffer is still checked out; the pool
    /// stays valid so the caller can release and retry. After success every
    /// further operation returns `InvalidHandle`.
    pub fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cleaned {
            return Err(Error::InvalidHandle);
        }
        let in_use = inner.entries.iter().filter(|e| e.in_use).count();
        if in_use > 0 {
            return Err(Error::PoolBusy { in_use });
        }
        // Dropping the entries releases the device memory.
        inner.entries.clear();
        inner.cleaned = true;
        Ok(())
    }

    /// Acquisitions served from an existing free entry.
    pub fn hits(&self) -> u64 {
        self.inner.lock().unwrap().hits
    }

    /// Acquisitions that had to allocate a new entry.
    pub fn misses(&self) -> u64 {
        self.inner.lock().unwrap().misses
    }

    /// Bytes currently held in free entries.
    pub fn free_bytes(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| !e.in_use)
            .map(|e| e.capacity)
            .sum()
    }

    /// Total entries currently allocated.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.lock() {
            let in_use = inner.entries.iter().filter(|e| e.in_use).count();
            if in_use > 0 {
                eprintln!(
                    "[median-pool] pool dropped with {in_use} buffer(s) still checked out"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- best_fit (pure, no GPU) -------------------------------------------

    #[test]
    fn test_best_fit_picks_smallest_sufficient() {
        let free = [(0usize, 4096u64), (1, 1024), (2, 2048)];
        assert_eq!(best_fit(free.iter().copied(), 1000), Some(1));
        assert_eq!(best_fit(free.iter().copied(), 1500), Some(2));
        assert_eq!(best_fit(free.iter().copied(), 4096), Some(0));
    }

    #[test]
    fn test_best_fit_none_when_all_too_small() {
        let free = [(0usize, 256u64), (1, 512)];
        assert_eq!(best_fit(free.iter().copied(), 1024), None);
    }

    #[test]
    fn test_best_fit_empty() {
        assert_eq!(best_fit(std::iter::empty(), 1), None);
    }

    #[test]
    fn test_align_to_copy_alignment() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(1, 4), 4);
        assert_eq!(align_to(4, 4), 4);
        assert_eq!(align_to(5, 4), 8);
        assert_eq!(align_to(99, 4), 100);
    }

    // ---- GPU tests (subprocess isolation, see gpu/device.rs) ---------------

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    fn test_pool(max_w: u32, max_h: u32) -> BufferPool {
        let gpu = Arc::new(GpuDevice::new().expect("need Vulkan GPU"));
        BufferPool::new(gpu, max_w, max_h).expect("pool creation")
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_eager_reservation_serves_max_request_without_growth() {
        let pool = test_pool(64, 64);
        assert_eq!(pool.entry_count(), 3);

        let src = pool.acquire(BufferKind::Storage, 64 * 64).unwrap();
        let dst = pool.acquire(BufferKind::Storage, 64 * 64 * 4).unwrap();
        let rb = pool.acquire(BufferKind::Readback, 64 * 64 * 4).unwrap();

        assert_eq!(pool.entry_count(), 3, "max-size request must not grow the pool");
        assert_eq!(pool.hits(), 3);
        assert_eq!(pool.misses(), 0);

        pool.release(src).unwrap();
        pool.release(dst).unwrap();
        pool.release(rb).unwrap();
        pool.cleanup().unwrap();
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_miss_then_hit() {
        let pool = test_pool(32, 32);

        // Both eager storage entries checked out; a third storage acquire
        // must grow.
        let a = pool.acquire(BufferKind::Storage, 256).unwrap();
        let b = pool.acquire(BufferKind::Storage, 256).unwrap();
        let c = pool.acquire(BufferKind::Storage, 256).unwrap();
        assert_eq!(pool.misses(), 1);

        pool.release(c).unwrap();
        let c2 = pool.acquire(BufferKind::Storage, 256).unwrap();
        assert_eq!(pool.misses(), 1, "re-acquire after release must hit");

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        pool.release(c2).unwrap();
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_double_release_is_error() {
        let pool = test_pool(16, 16);
        let a = pool.acquire(BufferKind::Storage, 64).unwrap();
        let twin = Lease {
            buffer: Arc::clone(&a.buffer),
            index: a.index,
            capacity: a.capacity,
            kind: a.kind,
        };
        pool.release(a).unwrap();
        assert!(matches!(pool.release(twin), Err(Error::DoubleRelease)));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_cleanup_refuses_while_busy() {
        let pool = test_pool(16, 16);
        let a = pool.acquire(BufferKind::Storage, 64).unwrap();
        assert!(matches!(pool.cleanup(), Err(Error::PoolBusy { in_use: 1 })));

        pool.release(a).unwrap();
        pool.cleanup().unwrap();

        // Everything after cleanup is an invalid-handle error.
        assert!(matches!(
            pool.acquire(BufferKind::Storage, 64),
            Err(Error::InvalidHandle)
        ));
        assert!(matches!(pool.cleanup(), Err(Error::InvalidHandle)));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_dimension_check() {
        let pool = test_pool(64, 48);
        pool.check_dimensions(64, 48).unwrap();
        pool.check_dimensions(1, 1).unwrap();
        assert!(matches!(
            pool.check_dimensions(65, 48),
            Err(Error::PoolCapacityExceeded { .. })
        ));
        assert!(matches!(
            pool.check_dimensions(64, 49),
            Err(Error::PoolCapacityExceeded { .. })
        ));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_growth_cap_reports_allocation_failure() {
        let pool = test_pool(8, 8);
        let mut leases = Vec::new();
        // Drain the storage kind to its entry cap.
        loop {
            match pool.acquire(BufferKind::Storage, 64) {
                Ok(l) => leases.push(l),
                Err(Error::OutOfMemory { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert!(leases.len() <= 64, "growth cap never reached");
        }
        for l in leases {
            pool.release(l).unwrap();
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_zero_bounds_rejected() {
        let gpu = Arc::new(GpuDevice::new().expect("need Vulkan GPU"));
        assert!(matches!(
            BufferPool::new(Arc::clone(&gpu), 0, 100),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BufferPool::new(gpu, 100, 0),
            Err(Error::InvalidArgument(_))
        ));
        println!("GPU_TEST_OK");
    }

    // ---- Outer wrappers ----------------------------------------------------

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_eager_reservation() {
        let out = run_gpu_test_in_subprocess(
            "gpu::pool::tests::inner_eager_reservation_serves_max_request_without_growth",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_miss_then_hit() {
        let out = run_gpu_test_in_subprocess("gpu::pool::tests::inner_miss_then_hit");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_double_release_is_error() {
        let out = run_gpu_test_in_subprocess("gpu::pool::tests::inner_double_release_is_error");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_cleanup_refuses_while_busy() {
        let out =
            run_gpu_test_in_subprocess("gpu::pool::tests::inner_cleanup_refuses_while_busy");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_dimension_check() {
        let out = run_gpu_test_in_subprocess("gpu::pool::tests::inner_dimension_check");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_growth_cap() {
        let out = run_gpu_test_in_subprocess(
            "gpu::pool::tests::inner_growth_cap_reports_allocation_failure",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_zero_bounds_rejected() {
        let out = run_gpu_test_in_subprocess("gpu::pool::tests::inner_zero_bounds_rejected");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
