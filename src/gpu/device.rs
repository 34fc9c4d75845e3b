// gpu/device.rs — wgpu device context.
//
// One `GpuDevice` is the explicitly-scoped device-runtime state: Vulkan
// instance, adapter, logical device, queue. Nothing here is process-global —
// a process can hold several independent `GpuDevice`s (and therefore several
// independent pools), which is what makes the pool layer testable.
//
// ADAPTER SELECTION: wgpu's default `request_adapter` heuristics can grab
// llvmpipe/softpipe where the software renderer appears as a valid Vulkan
// device. We enumerate explicitly and prefer real hardware, falling back to
// whatever exists only as a last resort (the adapter name is printed so you
// know what you got).
//
// `pollster::block_on` runs wgpu's async adapter/device API to completion on
// the current thread; for native Vulkan there is nothing to actually await.

use std::fmt;
use std::sync::{mpsc, Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Workgroup configuration for 2D compute dispatches.
///
/// Injected into the WGSL source via `{{WG_X}}`/`{{WG_Y}}` template
/// substitution at pipeline creation. 16×8 = 128 invocations aligns with
/// NVIDIA's 32-wide warps (4 warps) and AMD's 64-wide wavefronts (2 waves);
/// the 16-wide x dimension matches row-major image locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl Default for WorkgroupSize {
    fn default() -> Self {
        WorkgroupSize { x: 16, y: 8 }
    }
}

impl WorkgroupSize {
    /// Total invocations per workgroup.
    pub fn total(&self) -> u32 {
        self.x * self.y
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for diagnostics.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The GPU context: adapter, device, queue, workgroup configuration.
///
/// Expensive to create (Vulkan instance + device initialization); create
/// once and share via `Arc`.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue` — some Vulkan translation layers crash if the instance dies
/// while device-level objects still reference it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    max_storage_binding: u64,
    scope_lock: Mutex<()>,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a context on the first non-software Vulkan adapter found.
    ///
    /// # Errors
    /// `NoSuitableAdapter` if enumeration comes up empty, `DeviceRequest`
    /// if the logical device cannot be created.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self> {
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets wgpu enumerate
        // translation layers (e.g. dzn on WSL2) that declare themselves
        // non-conformant. Compute-only workloads don't rely on any
        // conformance-required rendering behaviour.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(Error::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let info = a.get_info();
            eprintln!(
                "[median-pool] Vulkan adapter: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        // Tier 1: anything that is not a software rasterizer.
        // Tier 2 (last resort): take whatever exists.
        let adapter = all_adapters
            .into_iter()
            .find(|a| a.get_info().device_type != wgpu::DeviceType::Cpu)
            .or_else(|| {
                instance
                    .enumerate_adapters(wgpu::Backends::VULKAN)
                    .into_iter()
                    .next()
            })
            .ok_or(Error::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let limits = wgpu::Limits::default();
        let max_storage_binding = limits.max_storage_buffer_binding_size as u64;

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("median-pool"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(Error::DeviceRequest)?;

        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            workgroup_size: WorkgroupSize::default(),
            max_storage_binding,
            scope_lock: Mutex::new(()),
            _instance: instance,
        })
    }

    /// Largest storage buffer this device will bind, in bytes.
    pub fn max_storage_binding(&self) -> u64 {
        self.max_storage_binding
    }

    /// Workgroup counts covering a `w × h` pixel grid, using ceiling
    /// division so every pixel is reached. The shader guards global IDs
    /// past the image edge.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        let dx = (w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
    }

    /// Take the device's error-scope lock.
    ///
    /// wgpu keeps one error-scope stack per device, shared by every thread.
    /// Interleaved push/pop windows from concurrent callers would pop each
    /// other's scopes and deliver errors to the wrong request, so every
    /// `push_error_scope` .. `pop_error_scope` pair on this device runs
    /// under this guard.
    pub(crate) fn scope_guard(&self) -> MutexGuard<'_, ()> {
        self.scope_lock.lock().unwrap()
    }

    /// Create a device buffer, reporting allocation failure as an error.
    ///
    /// wgpu surfaces out-of-memory through error scopes rather than a
    /// `Result`, so the creation is bracketed by an `OutOfMemory` scope and
    /// the scope is resolved before the buffer is handed out.
    pub fn create_byte_buffer(
        &self,
        size: u64,
        usage: wgpu::BufferUsages,
        label: &str,
    ) -> Result<wgpu::Buffer> {
        if size == 0 || size > self.max_storage_binding {
            return Err(Error::OutOfMemory {
                requested: size,
                limit: self.max_storage_binding,
            });
        }

        let guard = self.scope_guard();
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        let scope = self.device.pop_error_scope();
        drop(guard);
        self.device.poll(wgpu::Maintain::Poll);
        if pollster::block_on(scope).is_some() {
            return Err(Error::OutOfMemory {
                requested: size,
                limit: self.max_storage_binding,
            });
        }
        Ok(buffer)
    }

    /// Map a `MAP_READ` buffer and hand its contents to `f`.
    ///
    /// Blocking: polls the device until the map callback fires. Map
    /// failures surface as `Transfer`.
    pub fn read_mapped<T>(
        &self,
        buffer: &wgpu::Buffer,
        f: impl FnOnce(&[u8]) -> T,
    ) -> Result<T> {
        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::Transfer("readback map callback never fired".into()))?
            .map_err(|e| Error::Transfer(format!("readback map failed: {e}")))?;

        let mapped = slice.get_mapped_range();
        let out = f(&mapped);
        drop(mapped);
        buffer.unmap();
        Ok(out)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, workgroup: {} }}",
            self.adapter_info, self.workgroup_size
        )
    }
}
