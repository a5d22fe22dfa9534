//! The wgpu reference backend.
//!
//! One [`GpuEngine`] per process owns the instance, device, queue and the
//! shared pipelines (color, textured, composite blit, blur compute). Each
//! visual owns its color/effect texture pair; root visuals additionally own
//! the swap chain configured from the view's opaque native handle
//! (a [`WgpuNativeSurface`] wrapping a `wgpu::SurfaceTarget`). The root's
//! present pass composites its own final texture and every child visual's
//! final texture — placed, transformed and alpha-blended — into the
//! acquired frame, then presents.
//!
//! Producer fences on bitmap textures are satisfied structurally: all work
//! runs on the engine's single queue, so producer submissions order before
//! the compositor's sampling submissions.

use std::sync::{Arc, Weak};
use std::time::Instant;

use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use wgpu::util::DeviceExt;

use crate::canvas::{CanvasEffect, GpuFence, GpuTexture};
use crate::client::{RenderTargetId, ViewRenderTarget};
use crate::geometry::{Color, Point};
use crate::layer::DropShadowParams;
use crate::telemetry::{CompletionHandler, SubmissionStatus, SubmissionTelemetry};

use super::effects::EffectProcessor;
use super::surface::{BackendError, GpuSurface, PaintSpec, PresentTicket, SurfaceBackend, SurfaceKind};
use super::tessellation::{Mesh, Vertex};

/// Opaque native handle accepted by the wgpu backend: the embedder wraps
/// its window (or any `wgpu::SurfaceTarget`) and passes the result as the
/// view render target's native handle.
pub struct WgpuNativeSurface {
    target: Mutex<Option<wgpu::SurfaceTarget<'static>>>,
}

impl WgpuNativeSurface {
    pub fn new(target: impl Into<wgpu::SurfaceTarget<'static>>) -> Arc<Self> {
        Arc::new(Self {
            target: Mutex::new(Some(target.into())),
        })
    }

    fn take(&self) -> Option<wgpu::SurfaceTarget<'static>> {
        self.target.lock().take()
    }
}

/// A GPU texture produced outside the compositor, wrapped for bitmap
/// commands.
pub struct WgpuExternalTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl WgpuExternalTexture {
    pub fn new(texture: wgpu::Texture) -> Arc<Self> {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Arc::new(Self { texture, view })
    }
}

impl GpuTexture for WgpuExternalTexture {
    fn dimensions(&self) -> (u32, u32) {
        (self.texture.width(), self.texture.height())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Producer fence for textures created on the engine's queue. Ordering is
/// structural (single queue), so the fence carries no GPU object.
pub struct WgpuQueueFence;

impl GpuFence for WgpuQueueFence {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlitParams {
    transform: [[f32; 4]; 4],
    tint: [f32; 4],
    flags: [f32; 4],
}

struct DrawPipelines {
    color: wgpu::RenderPipeline,
    textured: wgpu::RenderPipeline,
    texture_bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

struct BlitPipeline {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

/// Shared GPU state: instance, device, queue and pipelines.
pub struct GpuEngine {
    instance: wgpu::Instance,
    device: wgpu::Device,
    queue: wgpu::Queue,
    draw: DrawPipelines,
    // Swap-chain-format blit pipelines are derived per root surface from
    // this shader.
    blit_shader: wgpu::ShaderModule,
    effects: EffectProcessor,
}

const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

impl GpuEngine {
    pub fn new() -> Result<Arc<Self>, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| BackendError::GpuUnavailable(format!("no adapter: {e:?}")))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            label: None,
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::default(),
        }))
        .map_err(|e| BackendError::GpuUnavailable(format!("no device: {e:?}")))?;

        let draw = Self::build_draw_pipelines(&device);
        let blit_shader = device.create_shader_module(wgpu::include_wgsl!("shaders/blit.wgsl"));
        let effects = EffectProcessor::new(&device);

        Ok(Arc::new(Self {
            instance,
            device,
            queue,
            draw,
            blit_shader,
            effects,
        }))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Uploads raw RGBA8 pixels as an external texture (decoded images,
    /// rasterized glyph runs).
    pub fn upload_rgba(&self, width: u32, height: u32, pixels: &[u8]) -> Arc<WgpuExternalTexture> {
        let texture = self.device.create_texture_with_data(
            &self.queue,
            &wgpu::TextureDescriptor {
                label: Some("External RGBA Texture"),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: OFFSCREEN_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            pixels,
        );
        WgpuExternalTexture::new(texture)
    }

    fn build_draw_pipelines(device: &wgpu::Device) -> DrawPipelines {
        let shader = device.create_shader_module(wgpu::include_wgsl!("shaders/draw.wgsl"));

        let texture_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("draw_texture_bind_group_layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2, 2 => Float32x4],
        };

        let color_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Color Draw Pipeline Layout"),
            bind_group_layouts: &[],
            immediate_size: 0,
        });
        let textured_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Textured Draw Pipeline Layout"),
            bind_group_layouts: &[&texture_bind_group_layout],
            immediate_size: 0,
        });

        let make_pipeline = |layout: &wgpu::PipelineLayout, fragment: &str, label: &str| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: std::slice::from_ref(&vertex_layout),
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some(fragment),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: OFFSCREEN_FORMAT,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            })
        };

        let color = make_pipeline(&color_layout, "fs_color", "Color Draw Pipeline");
        let textured = make_pipeline(&textured_layout, "fs_texture", "Textured Draw Pipeline");

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Draw Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        DrawPipelines {
            color,
            textured,
            texture_bind_group_layout,
            sampler,
        }
    }

    fn build_blit_pipeline(
        device: &wgpu::Device,
        shader: &wgpu::ShaderModule,
        format: wgpu::TextureFormat,
    ) -> BlitPipeline {
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Blit Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        BlitPipeline {
            pipeline,
            bind_group_layout,
            sampler,
        }
    }
}

struct TextureBundle {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

fn make_offscreen(device: &wgpu::Device, width: u32, height: u32, label: &str) -> TextureBundle {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: OFFSCREEN_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    TextureBundle {
        _texture: texture,
        view,
    }
}

struct DrawCall {
    buffer: wgpu::Buffer,
    vertex_count: u32,
    bind_group: Option<wgpu::BindGroup>,
}

/// GPU state of one visual.
struct VisualState {
    backing: (u32, u32),
    position: Point,
    transform: Mat4,
    shadow: Option<DropShadowParams>,
    color: Option<TextureBundle>,
    effect: Option<TextureBundle>,
    final_is_effect: bool,
    clear_color: Color,
    draws: Vec<DrawCall>,
    effects: Vec<CanvasEffect>,
}

impl VisualState {
    fn new() -> Self {
        Self {
            backing: (1, 1),
            position: Point::ZERO,
            transform: Mat4::IDENTITY,
            shadow: None,
            color: None,
            effect: None,
            final_is_effect: false,
            clear_color: Color::TRANSPARENT,
            draws: Vec::new(),
            effects: Vec::new(),
        }
    }

    fn final_view(&self) -> Option<&wgpu::TextureView> {
        if self.final_is_effect {
            self.effect.as_ref().map(|b| &b.view)
        } else {
            self.color.as_ref().map(|b| &b.view)
        }
    }
}

struct SwapchainState {
    native: Option<Arc<WgpuNativeSurface>>,
    surface: Option<wgpu::Surface<'static>>,
    config: Option<wgpu::SurfaceConfiguration>,
    blit: Option<BlitPipeline>,
}

/// Composition registry of one render target's visual tree.
struct RootShared {
    swapchain: Mutex<SwapchainState>,
    children: Mutex<Vec<Weak<Mutex<VisualState>>>>,
}

/// The wgpu implementation of the surface factory.
pub struct WgpuBackend {
    engine: Arc<GpuEngine>,
    roots: FxHashMap<RenderTargetId, Arc<RootShared>>,
}

impl WgpuBackend {
    pub fn new(engine: Arc<GpuEngine>) -> Self {
        Self {
            engine,
            roots: FxHashMap::default(),
        }
    }

    pub fn engine(&self) -> &Arc<GpuEngine> {
        &self.engine
    }
}

impl SurfaceBackend for WgpuBackend {
    fn create_surface(
        &mut self,
        target: &ViewRenderTarget,
        kind: SurfaceKind,
        position: Point,
    ) -> Result<Box<dyn GpuSurface>, BackendError> {
        let state = Arc::new(Mutex::new(VisualState::new()));
        state.lock().position = position;
        match kind {
            SurfaceKind::Root => {
                let native = target
                    .native_handle()
                    .clone()
                    .downcast::<WgpuNativeSurface>()
                    .ok();
                if native.is_none() {
                    debug!("root surface without a wgpu native handle; rendering offscreen");
                }
                let root = Arc::new(RootShared {
                    swapchain: Mutex::new(SwapchainState {
                        native,
                        surface: None,
                        config: None,
                        blit: None,
                    }),
                    children: Mutex::new(Vec::new()),
                });
                self.roots.insert(target.id(), root.clone());
                Ok(Box::new(WgpuSurface {
                    engine: self.engine.clone(),
                    kind,
                    root,
                    state,
                }))
            }
            SurfaceKind::Child => {
                let root = self
                    .roots
                    .get(&target.id())
                    .cloned()
                    .ok_or(BackendError::MissingSurface)?;
                root.children.lock().push(Arc::downgrade(&state));
                Ok(Box::new(WgpuSurface {
                    engine: self.engine.clone(),
                    kind,
                    root,
                    state,
                }))
            }
        }
    }
}

/// One visual's surface in the wgpu backend.
pub struct WgpuSurface {
    engine: Arc<GpuEngine>,
    kind: SurfaceKind,
    root: Arc<RootShared>,
    state: Arc<Mutex<VisualState>>,
}

impl WgpuSurface {
    fn to_clip(backing: (u32, u32), v: &Vertex) -> Vertex {
        let (w, h) = (backing.0.max(1) as f32, backing.1.max(1) as f32);
        Vertex {
            position: [
                v.position[0] / w * 2.0 - 1.0,
                1.0 - v.position[1] / h * 2.0,
            ],
            uv: v.uv,
            color: v.color,
        }
    }

    fn gradient_ramp(&self, gradient: &crate::canvas::Gradient) -> wgpu::BindGroup {
        // 256x1 ramp sampled by the command's normalized UVs.
        const WIDTH: usize = 256;
        let mut pixels = vec![0u8; WIDTH * 4];
        let mut stops = gradient.stops.clone();
        stops.sort_by(|a, b| a.position.total_cmp(&b.position));
        for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
            let t = i as f32 / (WIDTH - 1) as f32;
            let color = sample_gradient(&stops, t);
            px[0] = (color.r.clamp(0.0, 1.0) * 255.0) as u8;
            px[1] = (color.g.clamp(0.0, 1.0) * 255.0) as u8;
            px[2] = (color.b.clamp(0.0, 1.0) * 255.0) as u8;
            px[3] = (color.a.clamp(0.0, 1.0) * 255.0) as u8;
        }
        let texture = self.engine.upload_rgba(WIDTH as u32, 1, &pixels);
        self.texture_bind_group(&texture.view)
    }

    fn texture_bind_group(&self, view: &wgpu::TextureView) -> wgpu::BindGroup {
        self.engine
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("draw_texture_bind_group"),
                layout: &self.engine.draw.texture_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.engine.draw.sampler),
                    },
                ],
            })
    }

    /// Encodes this visual's pre-effect pass (one clear, all draws) and the
    /// queued effect passes.
    fn encode_visual(&self, encoder: &mut wgpu::CommandEncoder, state: &mut VisualState) {
        let Some(color) = &state.color else { return };
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Pre-Effect Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &color.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: state.clear_color.r as f64,
                            g: state.clear_color.g as f64,
                            b: state.clear_color.b as f64,
                            a: state.clear_color.a as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            for call in &state.draws {
                if call.bind_group.is_some() {
                    pass.set_pipeline(&self.engine.draw.textured);
                    pass.set_bind_group(0, call.bind_group.as_ref(), &[]);
                } else {
                    pass.set_pipeline(&self.engine.draw.color);
                }
                pass.set_vertex_buffer(0, call.buffer.slice(..));
                pass.draw(0..call.vertex_count, 0..1);
            }
        }
        state.draws.clear();

        let effects = std::mem::take(&mut state.effects);
        state.final_is_effect = false;
        if !effects.is_empty()
            && let (Some(color), Some(effect)) = (&state.color, &state.effect)
        {
            state.final_is_effect = self.engine.effects.apply(
                &self.engine.device,
                &self.engine.queue,
                encoder,
                &color.view,
                &effect.view,
                state.backing,
                &effects,
            );
        }
    }

    /// Blits one visual's final texture into the presentation pass with its
    /// placement and transform.
    fn composite_visual(
        &self,
        pass: &mut wgpu::RenderPass<'_>,
        blit: &BlitPipeline,
        visual: &VisualState,
        position: Point,
        surface_size: (u32, u32),
    ) {
        let Some(view) = visual.final_view() else { return };
        let (sw, sh) = (surface_size.0.max(1) as f32, surface_size.1.max(1) as f32);
        let (vw, vh) = (visual.backing.0.max(1) as f32, visual.backing.1.max(1) as f32);

        // Unit quad → visual rect in pixels → visual transform → NDC.
        let quad_to_px = Mat4::from_translation(Vec3::new(position.x, position.y, 0.0))
            * Mat4::from_scale(Vec3::new(vw, vh, 1.0));
        let px_to_ndc = Mat4::from_translation(Vec3::new(-1.0, 1.0, 0.0))
            * Mat4::from_scale(Vec3::new(2.0 / sw, -2.0 / sh, 1.0));
        let matrix = px_to_ndc * visual.transform * quad_to_px;

        // A drop shadow composites first: the visual's alpha mask, offset
        // and tinted with the shadow color. Blur radii soften through the
        // shadow opacity (dedicated platform layers blur natively).
        if let Some(shadow) = &visual.shadow {
            let shadow_quad = Mat4::from_translation(Vec3::new(
                position.x + shadow.x_offset,
                position.y + shadow.y_offset,
                0.0,
            )) * Mat4::from_scale(Vec3::new(vw, vh, 1.0));
            let shadow_matrix = px_to_ndc * visual.transform * shadow_quad;
            let softness = 1.0 / (1.0 + shadow.blur.max(0.0) * 0.25);
            self.blit_with(
                pass,
                blit,
                view,
                BlitParams {
                    transform: shadow_matrix.to_cols_array_2d(),
                    tint: [
                        shadow.color.r,
                        shadow.color.g,
                        shadow.color.b,
                        (shadow.opacity * softness).clamp(0.0, 1.0),
                    ],
                    flags: [1.0, 0.0, 0.0, 0.0],
                },
            );
        }

        self.blit_with(
            pass,
            blit,
            view,
            BlitParams {
                transform: matrix.to_cols_array_2d(),
                tint: [1.0; 4],
                flags: [0.0; 4],
            },
        );
    }

    fn blit_with(
        &self,
        pass: &mut wgpu::RenderPass<'_>,
        blit: &BlitPipeline,
        view: &wgpu::TextureView,
        params: BlitParams,
    ) {
        let uniform = self
            .engine
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("blit_params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self
            .engine
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("blit_bind_group"),
                layout: &blit.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&blit.sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: uniform.as_entire_binding(),
                    },
                ],
            });
        pass.set_pipeline(&blit.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..6, 0..1);
    }

    fn finish_submission(&self, ticket: PresentTicket, on_complete: CompletionHandler) {
        let complete_at = Instant::now();
        self.engine.queue.on_submitted_work_done(move || {
            let now = Instant::now();
            on_complete(SubmissionTelemetry {
                lane_id: ticket.lane_id,
                packet_id: ticket.packet_id,
                submit_cpu: ticket.submit_cpu,
                complete_cpu: now,
                present_cpu: complete_at.max(ticket.submit_cpu),
                gpu_start_sec: 0.0,
                gpu_end_sec: 0.0,
                status: SubmissionStatus::Completed,
            });
        });
        let _ = self.engine.device.poll(wgpu::PollType::Poll);
    }
}

impl GpuSurface for WgpuSurface {
    fn rebuild(&mut self, backing_width: u32, backing_height: u32) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.backing = (backing_width, backing_height);
        state.color = Some(make_offscreen(
            &self.engine.device,
            backing_width,
            backing_height,
            "Visual Color Texture",
        ));
        state.effect = Some(make_offscreen(
            &self.engine.device,
            backing_width,
            backing_height,
            "Visual Effect Texture",
        ));
        state.final_is_effect = false;
        drop(state);

        if self.kind == SurfaceKind::Root {
            let mut swapchain = self.root.swapchain.lock();
            if swapchain.surface.is_none()
                && let Some(native) = swapchain.native.clone()
                && let Some(target) = native.take()
            {
                match self.engine.instance.create_surface(target) {
                    Ok(surface) => swapchain.surface = Some(surface),
                    Err(error) => {
                        warn!(?error, "swap chain surface creation failed");
                        return Err(BackendError::RebuildFailed);
                    }
                }
            }
            if let Some(surface) = &swapchain.surface {
                let format = swapchain
                    .config
                    .as_ref()
                    .map(|c| c.format)
                    .unwrap_or(OFFSCREEN_FORMAT);
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width: backing_width,
                    height: backing_height,
                    present_mode: wgpu::PresentMode::Fifo,
                    alpha_mode: wgpu::CompositeAlphaMode::Auto,
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&self.engine.device, &config);
                if swapchain.blit.is_none() {
                    swapchain.blit = Some(GpuEngine::build_blit_pipeline(
                        &self.engine.device,
                        &self.engine.blit_shader,
                        format,
                    ));
                }
                swapchain.config = Some(config);
            }
        }
        Ok(())
    }

    fn begin_frame(&mut self, background: Color) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.clear_color = background;
        state.draws.clear();
        state.effects.clear();
        Ok(())
    }

    fn draw_mesh(&mut self, mesh: &Mesh, paint: &PaintSpec) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let backing = state.backing;
        let vertices: Vec<Vertex> = mesh
            .vertices
            .iter()
            .map(|v| Self::to_clip(backing, v))
            .collect();
        let buffer = self
            .engine
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Visual Vertex Buffer"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let bind_group = match paint {
            PaintSpec::Solid => None,
            PaintSpec::Texture { texture, fence } => {
                // Producer ordering is structural on the shared queue.
                let _ = fence;
                let external = texture
                    .as_any()
                    .downcast_ref::<WgpuExternalTexture>()
                    .ok_or(BackendError::UnsupportedSurface)?;
                Some(self.texture_bind_group(&external.view))
            }
            PaintSpec::Gradient(gradient) => Some(self.gradient_ramp(gradient)),
        };
        state.draws.push(DrawCall {
            buffer,
            vertex_count: vertices.len() as u32,
            bind_group,
        });
        Ok(())
    }

    fn apply_effects(&mut self, effects: &[CanvasEffect]) -> Result<bool, BackendError> {
        // Deferred to the present encoder so effects run after the draws.
        self.state.lock().effects.extend_from_slice(effects);
        Ok(true)
    }

    fn present(
        &mut self,
        ticket: PresentTicket,
        on_complete: CompletionHandler,
    ) -> Result<(), BackendError> {
        let mut encoder = self
            .engine
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Visual Commit Encoder"),
            });

        {
            let mut state = self.state.lock();
            self.encode_visual(&mut encoder, &mut state);
        }

        if self.kind == SurfaceKind::Child {
            // Child visuals flush offscreen; the root's present composites
            // them.
            self.engine.queue.submit(Some(encoder.finish()));
            self.finish_submission(ticket, on_complete);
            return Ok(());
        }

        let swapchain = self.root.swapchain.lock();
        let (Some(surface), Some(blit)) = (&swapchain.surface, &swapchain.blit) else {
            // Headless root: nothing to flip, but the work still completes.
            self.engine.queue.submit(Some(encoder.finish()));
            self.finish_submission(ticket, on_complete);
            return Ok(());
        };

        let frame = surface.get_current_texture().map_err(|error| {
            warn!(?error, "swap chain frame acquisition failed");
            BackendError::RebuildFailed
        })?;
        let frame_view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let surface_size = self.state.lock().backing;
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Composite Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &frame_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            {
                // The root's texture fills the acquired frame; its window
                // placement belongs to the window, not the composite.
                let state = self.state.lock();
                self.composite_visual(&mut pass, blit, &state, Point::ZERO, surface_size);
            }
            for child in self.root.children.lock().iter() {
                if let Some(child_state) = child.upgrade() {
                    let child_state = child_state.lock();
                    let position = child_state.position;
                    self.composite_visual(&mut pass, blit, &child_state, position, surface_size);
                }
            }
        }

        self.engine.queue.submit(Some(encoder.finish()));
        self.finish_submission(ticket, on_complete);
        frame.present();
        Ok(())
    }

    fn set_position(&mut self, position: Point) {
        self.state.lock().position = position;
    }

    fn set_shadow(&mut self, params: &DropShadowParams) {
        self.state.lock().shadow = Some(*params);
    }

    fn set_transform(&mut self, matrix: Mat4) {
        self.state.lock().transform = matrix;
    }
}

fn sample_gradient(stops: &[crate::canvas::GradientStop], t: f32) -> Color {
    if stops.is_empty() {
        return Color::WHITE;
    }
    if t <= stops[0].position {
        return stops[0].color;
    }
    if let Some(last) = stops.last()
        && t >= last.position
    {
        return last.color;
    }
    for pair in stops.windows(2) {
        if t <= pair[1].position {
            let span = (pair[1].position - pair[0].position).max(f32::EPSILON);
            let local = (t - pair[0].position) / span;
            let a = pair[0].color;
            let b = pair[1].color;
            return Color::new(
                a.r + (b.r - a.r) * local,
                a.g + (b.g - a.g) * local,
                a.b + (b.b - a.b) * local,
                a.a + (b.a - a.a) * local,
            );
        }
    }
    stops.last().map(|s| s.color).unwrap_or(Color::WHITE)
}
