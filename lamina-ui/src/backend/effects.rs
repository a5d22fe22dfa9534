//! Canvas-effect processing for the wgpu backend.
//!
//! Blur effects run as compute passes over a visual's color/effect texture
//! pair, ping-ponging between the two. A gaussian blur is two directional
//! passes (horizontal then vertical); a directional blur is one pass along
//! its angle vector.

use crate::canvas::CanvasEffect;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurUniforms {
    radius: f32,
    _pad0: f32,
    direction: [f32; 2],
    width: u32,
    height: u32,
    _pad1: [u32; 2],
}

/// Compute-pipeline effect processor shared by all surfaces of one engine.
pub struct EffectProcessor {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl EffectProcessor {
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::include_wgsl!("shaders/blur.wgsl"));

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blur_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Blur Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Blur Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Self {
            pipeline,
            bind_group_layout,
        }
    }

    fn dispatch_pass(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::TextureView,
        dst: &wgpu::TextureView,
        size: (u32, u32),
        radius: f32,
        direction: [f32; 2],
    ) {
        let uniforms = BlurUniforms {
            radius,
            _pad0: 0.0,
            direction,
            width: size.0,
            height: size.1,
            _pad1: [0; 2],
        };
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Blur Uniform Buffer"),
            size: std::mem::size_of::<BlurUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blur_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(src),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(dst),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Blur Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(size.0.div_ceil(8), size.1.div_ceil(8), 1);
    }

    /// Runs `effects` in order over the color/effect texture pair; returns
    /// `true` when the final content ended up in the effect texture.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        color_view: &wgpu::TextureView,
        effect_view: &wgpu::TextureView,
        size: (u32, u32),
        effects: &[CanvasEffect],
    ) -> bool {
        let mut final_is_effect = false;
        for effect in effects {
            let (src, dst) = if final_is_effect {
                (effect_view, color_view)
            } else {
                (color_view, effect_view)
            };
            match *effect {
                CanvasEffect::GaussianBlur { radius } => {
                    // Horizontal into the spare texture, vertical back.
                    self.dispatch_pass(device, queue, encoder, src, dst, size, radius, [1.0, 0.0]);
                    self.dispatch_pass(device, queue, encoder, dst, src, size, radius, [0.0, 1.0]);
                    // Two passes land back in the source texture.
                }
                CanvasEffect::DirectionalBlur { radius, angle } => {
                    self.dispatch_pass(
                        device,
                        queue,
                        encoder,
                        src,
                        dst,
                        size,
                        radius,
                        [angle.cos(), angle.sin()],
                    );
                    final_is_effect = !final_is_effect;
                }
            }
        }
        final_is_effect
    }
}
