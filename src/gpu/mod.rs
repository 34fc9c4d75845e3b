// gpu/mod.rs — device-side implementation.
//
// Layering, leaf first:
//
//   device — wgpu context (instance, adapter, device, queue)
//   pool   — reusable device buffers, best-fit acquire/release
//   kernel — the median compute pipelines (shaders/median.wgsl)
//   filter — per-request orchestration tying the three together
//
// The CPU implementation in crate::median stays the authoritative
// reference; the GPU kernel is validated against it pixel-for-pixel.

pub mod device;
pub mod filter;
pub mod kernel;
pub mod pool;
