// gpu/kernel.rs — compute pipelines for the median shader.
//
// One shader module, two entry points (see shaders/median.wgsl):
//
//   median_small — k ≤ SMALL_KERNEL_MAX, register-array partial selection
//   median_hist  — larger k, 256-bin histogram scan
//
// The strategy boundary matches the CPU reference in median.rs exactly, and
// both entry points compute the same value a full sort would — strategy
// choice is a performance decision, never a numeric one.
//
// The workgroup size is baked into the shader source via {{WG_X}}/{{WG_Y}}
// substitution at pipeline creation, so one `MedianKernel` is tied to the
// `GpuDevice` it was built for.

use wgpu::util::DeviceExt;

use crate::gpu::device::GpuDevice;
use crate::median::SMALL_KERNEL_MAX;

/// Uniform parameter block — must match WGSL `struct Params` exactly.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    width: u32,
    height: u32,
    kernel: u32,
    _pad: u32,
}

/// The on-device median computation: source buffer in, per-pixel median
/// words out. Create once per device; `encode` per request.
pub struct MedianKernel {
    small: wgpu::ComputePipeline,
    hist: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

impl MedianKernel {
    pub fn new(gpu: &GpuDevice) -> Self {
        let shader_template = include_str!("../shaders/median.wgsl");
        let shader_src = shader_template
            .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string());

        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("median.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("MedianKernel BGL"),
            entries: &[
                // 0 — packed source pixels (read-only storage)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 1 — word-per-pixel destination (storage read_write)
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 2 — params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout =
            gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("MedianKernel pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

        let make_pipeline = |entry_point: &str| {
            gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };

        MedianKernel {
            small: make_pipeline("median_small"),
            hist: make_pipeline("median_hist"),
            bgl,
        }
    }

    /// Record one median dispatch into `encoder`.
    ///
    /// `src` holds `width*height` pixels packed 4-per-word; `dst` receives
    /// one word per pixel. Buffers may be larger than required (pooled
    /// entries usually are) — the shader indexes only within the image.
    pub fn encode(
        &self,
        gpu: &GpuDevice,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        width: u32,
        height: u32,
        kernel_size: u32,
    ) {
        let params = Params { width, height, kernel: kernel_size, _pad: 0 };
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("MedianKernel params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("MedianKernel BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: src.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: dst.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
            ],
        });

        let pipeline = if kernel_size <= SMALL_KERNEL_MAX {
            &self.small
        } else {
            &self.hist
        };

        let (wg_x, wg_y) = gpu.dispatch_size(width, height);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("median"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(wg_x, wg_y, 1);
    }
}
