use std::collections::HashMap;

use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use log::info;
use wgpu::util::DeviceExt;
use wgpu::{
    vertex_attr_array, AddressMode, BindGroup, BindGroupDescriptor, BindGroupEntry,
    BindGroupLayout, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource,
    BindingType, BlendState, Buffer, BufferBindingType, BufferUsages, ColorTargetState,
    ColorWrites, CommandEncoder, CommandEncoderDescriptor, CompositeAlphaMode, DeviceDescriptor,
    Extent3d, FilterMode, FragmentState, IndexFormat, Instance, LoadOp, MultisampleState,
    Operations, Origin3d, PipelineLayoutDescriptor, PresentMode, PrimitiveState,
    RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor,
    RequestAdapterOptions, Sampler, SamplerBindingType, SamplerDescriptor, ShaderModuleDescriptor,
    ShaderSource, SurfaceConfiguration, TexelCopyBufferLayout, TexelCopyTextureInfo, Texture,
    TextureAspect, TextureDescriptor, TextureDimension, TextureFormat, TextureSampleType,
    TextureUsages, TextureView, TextureViewDescriptor, TextureViewDimension, VertexBufferLayout,
    VertexState,
};
use winit::window::Window;

use crate::error::LightingError;
use crate::render::backend::{
    CompositeParams, GeometryBatch, LightDraw, LightView, LightingBackend, LightingTarget,
    ScreenView, ShadowDraw,
};
use crate::render::material::BatchVertex;
use crate::render::sprite::{
    checked_rgba_len, TextureHandle, TextureKind, DEFAULT_COLOR_TEXEL, DEFAULT_NORMAL_TEXEL,
};

// Per-frame draw limits, one uniform slot each.
const MAX_OCCLUSION_DRAWS_PER_FRAME: usize = 4096;
const MAX_SHADOW_LIGHTS_PER_FRAME: usize = 256;
const MAX_LIGHTS_PER_FRAME: usize = 256;
const MAX_OBJECT_DRAWS_PER_FRAME: usize = 4096;

const OCCLUSION_FORMAT: TextureFormat = TextureFormat::R8Unorm;
const POLAR_FORMAT: TextureFormat = TextureFormat::R16Float;
const SCREEN_BUFFER_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// GPU texture backing one of the intermediate lighting targets.
pub struct RenderTexture {
    texture: Texture,
    view: TextureView,
    size: (u32, u32),
}

impl RenderTexture {
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    pub fn view(&self) -> &TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}

/// Offscreen color target the composite pass can draw into instead of the
/// swapchain. Uses the surface format.
pub struct OffscreenTarget {
    target: RenderTexture,
}

impl OffscreenTarget {
    pub fn texture(&self) -> &Texture {
        self.target.texture()
    }

    pub fn view(&self) -> &TextureView {
        self.target.view()
    }

    pub fn size(&self) -> (u32, u32) {
        self.target.size()
    }
}

struct TextureEntry {
    /// The underlying GPU texture. Must be kept alive for the view/sampler to be valid.
    #[allow(dead_code)]
    texture: Texture,
    view: TextureView,
    sampler: Sampler,
    size: (u32, u32),
}

/// Work recorded for the frame in flight.
struct FrameResources {
    encoder: CommandEncoder,
    surface_texture: Option<wgpu::SurfaceTexture>,
    surface_view: Option<TextureView>,
}

/// Dynamic-offset uniform buffer handing out one aligned slot per draw.
struct UniformArena {
    buffer: Buffer,
    bind_group_layout: BindGroupLayout,
    bind_group: BindGroup,
    stride: u64,
    slots: usize,
    cursor: usize,
    pass: &'static str,
}

impl UniformArena {
    fn new<T: Pod>(device: &wgpu::Device, pass: &'static str, slots: usize) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let size = std::mem::size_of::<T>() as u64;
        let stride = (size + alignment - 1) & !(alignment - 1);

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(pass),
            size: stride * slots as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some(pass),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: std::num::NonZeroU64::new(size),
                },
                count: None,
            }],
        });

        let bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some(pass),
            layout: &bind_group_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: std::num::NonZeroU64::new(size),
                }),
            }],
        });

        Self {
            buffer,
            bind_group_layout,
            bind_group,
            stride,
            slots,
            cursor: 0,
            pass,
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Write `value` into the next slot and return its dynamic offset.
    fn push<T: Pod>(&mut self, queue: &wgpu::Queue, value: &T) -> Result<u32, LightingError> {
        if self.cursor >= self.slots {
            return Err(LightingError::TooManyDraws {
                pass: self.pass,
                max: self.slots,
            });
        }
        let offset = self.cursor as u64 * self.stride;
        queue.write_buffer(&self.buffer, offset, bytemuck::bytes_of(value));
        self.cursor += 1;
        Ok(offset as u32)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct OcclusionUniforms {
    view_proj: [[f32; 4]; 4],
    tint: [f32; 4],
    /// x: flip_x, y: flip_y
    flip: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ShadowUniforms {
    view_proj: [[f32; 4]; 4],
    center: [f32; 2],
    half_extent: f32,
    range: f32,
    softness: f32,
    resolution: f32,
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LightUniforms {
    view_proj: [[f32; 4]; 4],
    center: [f32; 2],
    range: f32,
    intensity: f32,
    color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ObjectUniforms {
    view_proj: [[f32; 4]; 4],
    tint: [f32; 4],
    /// rgb: ambient term, w: direction sample distance in texels
    ambient: [f32; 4],
    /// is_lit, receives_shadows, flip_x, flip_y
    flags: [f32; 4],
    /// xy: output size in pixels
    output_size: [f32; 4],
}

/// Uploaded geometry of one batch.
struct BatchDraw {
    vertices: Buffer,
    indices: Buffer,
    index_count: u32,
    uniform_offset: u32,
    color_texture: TextureHandle,
    normal_texture: TextureHandle,
}

struct LightingPipelines {
    occlusion: RenderPipeline,
    polar: RenderPipeline,
    shadow: RenderPipeline,
    light: RenderPipeline,
    object: RenderPipeline,
    /// One filterable texture and its sampler.
    texture_layout: BindGroupLayout,
    /// Two filterable textures sharing a sampler.
    texture_pair_layout: BindGroupLayout,
}

/// wgpu implementation of the lighting passes, presenting to a window surface.
pub struct WgpuBackend<'window> {
    surface: wgpu::Surface<'window>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: SurfaceConfiguration,
    present_mode: PresentMode,
    pipelines: LightingPipelines,
    occlusion_uniforms: UniformArena,
    shadow_uniforms: UniformArena,
    light_uniforms: UniformArena,
    object_uniforms: UniformArena,
    screen_sampler: Sampler,
    polar_sampler: Sampler,
    textures: HashMap<TextureHandle, TextureEntry>,
    next_texture_id: u32,
    default_color: TextureHandle,
    default_normal: TextureHandle,
    occlusion: Option<RenderTexture>,
    polar: Option<RenderTexture>,
    light_map: Option<RenderTexture>,
    shadow_map: Option<RenderTexture>,
    occlusion_bind_groups: HashMap<TextureHandle, BindGroup>,
    material_bind_groups: HashMap<(TextureHandle, TextureHandle), BindGroup>,
    frame: Option<FrameResources>,
}

impl<'window> WgpuBackend<'window> {
    pub fn new(window: &'window Window, vsync: bool) -> Result<Self> {
        let instance = Instance::default();
        let surface = instance.create_surface(window)?;

        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))?;
        let adapter_info = adapter.get_info();
        info!(
            "Using adapter {} ({:?})",
            adapter_info.name, adapter_info.backend
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&DeviceDescriptor {
            label: Some("lumen2d-device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: Default::default(),
            memory_hints: Default::default(),
            trace: wgpu::Trace::Off,
        }))?;

        let size = window.inner_size();
        let capabilities = surface.get_capabilities(&adapter);
        let format = capabilities
            .formats
            .iter()
            .copied()
            .find(|format| format.is_srgb())
            .or_else(|| capabilities.formats.first().copied())
            .ok_or_else(|| anyhow!("Surface reports no supported formats"))?;

        let present_mode = choose_present_mode(&capabilities.present_modes, vsync);
        let alpha_mode = choose_alpha_mode(&capabilities.alpha_modes);

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let occlusion_uniforms = UniformArena::new::<OcclusionUniforms>(
            &device,
            "occlusion",
            MAX_OCCLUSION_DRAWS_PER_FRAME,
        );
        let shadow_uniforms =
            UniformArena::new::<ShadowUniforms>(&device, "shadow", MAX_SHADOW_LIGHTS_PER_FRAME);
        let light_uniforms =
            UniformArena::new::<LightUniforms>(&device, "light", MAX_LIGHTS_PER_FRAME);
        let object_uniforms =
            UniformArena::new::<ObjectUniforms>(&device, "object", MAX_OBJECT_DRAWS_PER_FRAME);

        let pipelines = create_pipelines(
            &device,
            format,
            [
                &occlusion_uniforms.bind_group_layout,
                &shadow_uniforms.bind_group_layout,
                &light_uniforms.bind_group_layout,
                &object_uniforms.bind_group_layout,
            ],
        );

        let screen_sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("screen-buffer-sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });
        // Angular slices wrap around at +-PI.
        let polar_sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("polar-distance-sampler"),
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let mut backend = Self {
            surface,
            device,
            queue,
            surface_config,
            present_mode,
            pipelines,
            occlusion_uniforms,
            shadow_uniforms,
            light_uniforms,
            object_uniforms,
            screen_sampler,
            polar_sampler,
            textures: HashMap::new(),
            next_texture_id: 1,
            default_color: TextureHandle(0),
            default_normal: TextureHandle(0),
            occlusion: None,
            polar: None,
            light_map: None,
            shadow_map: None,
            occlusion_bind_groups: HashMap::new(),
            material_bind_groups: HashMap::new(),
            frame: None,
        };
        backend.default_color = backend.create_texture(&DEFAULT_COLOR_TEXEL, 1, 1, TextureKind::Color)?;
        backend.default_normal =
            backend.create_texture(&DEFAULT_NORMAL_TEXEL, 1, 1, TextureKind::Normal)?;
        Ok(backend)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn surface_format(&self) -> TextureFormat {
        self.surface_config.format
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    /// Offscreen output in the surface format, usable as a `render` target.
    pub fn create_offscreen_target(&self, width: u32, height: u32) -> OffscreenTarget {
        OffscreenTarget {
            target: create_render_texture(
                &self.device,
                "offscreen-target",
                (width.max(1), height.max(1)),
                self.surface_config.format,
            ),
        }
    }

    fn acquire_surface_texture(&mut self) -> Result<wgpu::SurfaceTexture> {
        loop {
            match self.surface.get_current_texture() {
                Ok(surface_texture) => return Ok(surface_texture),
                Err(e) => match e {
                    wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => {
                        self.surface.configure(&self.device, &self.surface_config);
                        continue;
                    }
                    wgpu::SurfaceError::Timeout => {
                        continue;
                    }
                    wgpu::SurfaceError::OutOfMemory => {
                        return Err(anyhow!("Surface ran out of memory"));
                    }
                    wgpu::SurfaceError::Other => {
                        return Err(anyhow!("Surface error: Other"));
                    }
                },
            }
        }
    }

    fn ensure_occlusion_bind_group(&mut self, handle: TextureHandle) -> Result<()> {
        if self.occlusion_bind_groups.contains_key(&handle) {
            return Ok(());
        }
        let texture = self
            .textures
            .get(&handle)
            .ok_or(LightingError::UnknownTexture(handle.0))?;
        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("occlusion-texture-bind-group"),
            layout: &self.pipelines.texture_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&texture.view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(&texture.sampler),
                },
            ],
        });
        self.occlusion_bind_groups.insert(handle, bind_group);
        Ok(())
    }

    fn ensure_material_bind_group(
        &mut self,
        color: TextureHandle,
        normal: TextureHandle,
    ) -> Result<()> {
        if self.material_bind_groups.contains_key(&(color, normal)) {
            return Ok(());
        }
        let color_entry = self
            .textures
            .get(&color)
            .ok_or(LightingError::UnknownTexture(color.0))?;
        let normal_entry = self
            .textures
            .get(&normal)
            .ok_or(LightingError::UnknownTexture(normal.0))?;
        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("material-bind-group"),
            layout: &self.pipelines.texture_pair_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&color_entry.view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::TextureView(&normal_entry.view),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::Sampler(&color_entry.sampler),
                },
            ],
        });
        self.material_bind_groups.insert((color, normal), bind_group);
        Ok(())
    }

    fn upload_batch(&self, batch: &GeometryBatch, uniform_offset: u32) -> BatchDraw {
        let vertices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("batch-vertex-buffer"),
                contents: bytemuck::cast_slice(&batch.vertices),
                usage: BufferUsages::VERTEX,
            });
        let indices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("batch-index-buffer"),
                contents: bytemuck::cast_slice(&batch.indices),
                usage: BufferUsages::INDEX,
            });
        BatchDraw {
            vertices,
            indices,
            index_count: batch.indices.len() as u32,
            uniform_offset,
            color_texture: batch.color_texture,
            normal_texture: batch.normal_texture,
        }
    }
}

fn active_frame<'a>(
    frame: &'a mut Option<FrameResources>,
    pass: &'static str,
) -> Result<&'a mut FrameResources, LightingError> {
    frame.as_mut().ok_or(LightingError::NoActiveFrame { pass })
}

fn expect_frame(
    frame: &Option<FrameResources>,
    pass: &'static str,
) -> Result<(), LightingError> {
    match frame {
        Some(_) => Ok(()),
        None => Err(LightingError::NoActiveFrame { pass }),
    }
}

fn required(
    texture: &Option<RenderTexture>,
    target: LightingTarget,
) -> Result<&RenderTexture, LightingError> {
    texture
        .as_ref()
        .ok_or(LightingError::MissingFramebuffer { target })
}

fn flip_flags(batch: &GeometryBatch) -> [f32; 2] {
    [
        if batch.flip_x { 1.0 } else { 0.0 },
        if batch.flip_y { 1.0 } else { 0.0 },
    ]
}

fn color_attachment(view: &TextureView, load: LoadOp<wgpu::Color>) -> RenderPassColorAttachment<'_> {
    RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: Operations {
            load,
            store: wgpu::StoreOp::Store,
        },
        depth_slice: None,
    }
}

fn clear_pass(encoder: &mut CommandEncoder, label: &str, view: &TextureView, color: wgpu::Color) {
    let pass = encoder.begin_render_pass(&RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(color_attachment(view, LoadOp::Clear(color)))],
        depth_stencil_attachment: None,
        multiview_mask: None,
        occlusion_query_set: None,
        timestamp_writes: None,
    });
    drop(pass);
}

impl<'window> LightingBackend for WgpuBackend<'window> {
    type Target = OffscreenTarget;
    type Surface = RenderTexture;

    fn create_texture(
        &mut self,
        rgba: &[u8],
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> Result<TextureHandle> {
        checked_rgba_len(width, height, rgba.len())?;
        let bytes_per_row = width
            .checked_mul(4)
            .ok_or(LightingError::InvalidTextureData {
                width,
                height,
                len: rgba.len(),
            })?;

        let size = Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        // Color data is sRGB encoded; normal maps store linear vectors.
        let format = match kind {
            TextureKind::Color => TextureFormat::Rgba8UnormSrgb,
            TextureKind::Normal => TextureFormat::Rgba8Unorm,
        };

        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });

        self.queue.write_texture(
            TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            rgba,
            TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            size,
        );

        let view = texture.create_view(&TextureViewDescriptor::default());
        let sampler = self.device.create_sampler(&SamplerDescriptor {
            label: Some("sprite-sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let handle = TextureHandle(self.next_texture_id);
        self.next_texture_id += 1;
        self.textures.insert(
            handle,
            TextureEntry {
                texture,
                view,
                sampler,
                size: (width, height),
            },
        );

        Ok(handle)
    }

    fn default_texture(&self, kind: TextureKind) -> TextureHandle {
        match kind {
            TextureKind::Color => self.default_color,
            TextureKind::Normal => self.default_normal,
        }
    }

    fn texture_size(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&handle).map(|t| t.size)
    }

    fn release_texture(&mut self, handle: TextureHandle) {
        if handle == self.default_color || handle == self.default_normal {
            return;
        }
        if self.textures.remove(&handle).is_some() {
            self.occlusion_bind_groups.remove(&handle);
            self.material_bind_groups
                .retain(|&(color, normal), _| color != handle && normal != handle);
        }
    }

    fn resize_shadow_targets(&mut self, size: u32) -> Result<()> {
        self.occlusion = Some(create_render_texture(
            &self.device,
            "occlusion-texture",
            (size, size),
            OCCLUSION_FORMAT,
        ));
        self.polar = Some(create_render_texture(
            &self.device,
            "polar-distance-texture",
            (size, 1),
            POLAR_FORMAT,
        ));
        Ok(())
    }

    fn resize_screen_targets(
        &mut self,
        light_map: (u32, u32),
        shadow_map: (u32, u32),
    ) -> Result<()> {
        self.light_map = Some(create_render_texture(
            &self.device,
            "light-map-texture",
            light_map,
            SCREEN_BUFFER_FORMAT,
        ));
        self.shadow_map = Some(create_render_texture(
            &self.device,
            "shadow-map-texture",
            shadow_map,
            SCREEN_BUFFER_FORMAT,
        ));
        Ok(())
    }

    fn target_size(&self, target: LightingTarget) -> Option<(u32, u32)> {
        self.intermediate(target).map(RenderTexture::size)
    }

    fn intermediate(&self, target: LightingTarget) -> Option<&RenderTexture> {
        match target {
            LightingTarget::Occlusion => self.occlusion.as_ref(),
            LightingTarget::PolarDistance => self.polar.as_ref(),
            LightingTarget::LightMap => self.light_map.as_ref(),
            LightingTarget::ShadowMap => self.shadow_map.as_ref(),
        }
    }

    fn resize_output(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }

        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface_config.present_mode = self.present_mode;
        self.surface.configure(&self.device, &self.surface_config);
    }

    fn begin_frame(&mut self, target: Option<&OffscreenTarget>) -> Result<()> {
        // Reset uniform slots at the start of each frame
        self.occlusion_uniforms.reset();
        self.shadow_uniforms.reset();
        self.light_uniforms.reset();
        self.object_uniforms.reset();

        let (surface_texture, surface_view) = match target {
            Some(_) => (None, None),
            None => {
                let surface_texture = self.acquire_surface_texture()?;
                let view = surface_texture
                    .texture
                    .create_view(&TextureViewDescriptor::default());
                (Some(surface_texture), Some(view))
            }
        };

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });

        let light_map = required(&self.light_map, LightingTarget::LightMap)?;
        let shadow_map = required(&self.shadow_map, LightingTarget::ShadowMap)?;
        clear_pass(&mut encoder, "clear-light-map", &light_map.view, wgpu::Color::TRANSPARENT);
        clear_pass(&mut encoder, "clear-shadow-map", &shadow_map.view, wgpu::Color::TRANSPARENT);

        self.frame = Some(FrameResources {
            encoder,
            surface_texture,
            surface_view,
        });
        Ok(())
    }

    fn render_occlusion(&mut self, view: &LightView, batches: &[GeometryBatch]) -> Result<()> {
        expect_frame(&self.frame, "occlusion")?;
        let view_proj = view.view_projection().to_cols_array_2d();
        let mut draws = Vec::with_capacity(batches.len());
        for batch in batches {
            self.ensure_occlusion_bind_group(batch.color_texture)?;
            let flip = flip_flags(batch);
            let offset = self.occlusion_uniforms.push(
                &self.queue,
                &OcclusionUniforms {
                    view_proj,
                    tint: batch.material.tint,
                    flip: [flip[0], flip[1], 0.0, 0.0],
                },
            )?;
            draws.push(self.upload_batch(batch, offset));
        }

        let occlusion = required(&self.occlusion, LightingTarget::Occlusion)?;
        let frame = active_frame(&mut self.frame, "occlusion")?;
        let mut pass = frame.encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("occlusion-pass"),
            color_attachments: &[Some(color_attachment(
                &occlusion.view,
                LoadOp::Clear(wgpu::Color::TRANSPARENT),
            ))],
            depth_stencil_attachment: None,
            multiview_mask: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        pass.set_pipeline(&self.pipelines.occlusion);
        for draw in &draws {
            let bind_group = self
                .occlusion_bind_groups
                .get(&draw.color_texture)
                .ok_or_else(|| anyhow!("Bind group not found for texture handle"))?;
            pass.set_bind_group(0, &self.occlusion_uniforms.bind_group, &[draw.uniform_offset]);
            pass.set_bind_group(1, bind_group, &[]);
            pass.set_vertex_buffer(0, draw.vertices.slice(..));
            pass.set_index_buffer(draw.indices.slice(..), IndexFormat::Uint32);
            pass.draw_indexed(0..draw.index_count, 0, 0..1);
        }

        Ok(())
    }

    fn render_polar_distances(&mut self) -> Result<()> {
        expect_frame(&self.frame, "polar distance")?;
        let occlusion = required(&self.occlusion, LightingTarget::Occlusion)?;
        let polar = required(&self.polar, LightingTarget::PolarDistance)?;

        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("polar-distance-bind-group"),
            layout: &self.pipelines.texture_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&occlusion.view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(&self.screen_sampler),
                },
            ],
        });

        let frame = active_frame(&mut self.frame, "polar distance")?;
        let mut pass = frame.encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("polar-distance-pass"),
            color_attachments: &[Some(color_attachment(
                &polar.view,
                LoadOp::Clear(wgpu::Color::WHITE),
            ))],
            depth_stencil_attachment: None,
            multiview_mask: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipelines.polar);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1); // Fullscreen triangle

        Ok(())
    }

    fn render_shadow(&mut self, screen: &ScreenView, shadow: &ShadowDraw) -> Result<()> {
        expect_frame(&self.frame, "shadow")?;
        let offset = self.shadow_uniforms.push(
            &self.queue,
            &ShadowUniforms {
                view_proj: screen.view_projection().to_cols_array_2d(),
                center: [shadow.center.x, shadow.center.y],
                half_extent: shadow.extent * 0.5,
                range: shadow.range,
                softness: shadow.softness,
                resolution: shadow.resolution as f32,
                _pad: [0.0; 2],
            },
        )?;

        let polar = required(&self.polar, LightingTarget::PolarDistance)?;
        let shadow_map = required(&self.shadow_map, LightingTarget::ShadowMap)?;
        let polar_bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("shadow-polar-bind-group"),
            layout: &self.pipelines.texture_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&polar.view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(&self.polar_sampler),
                },
            ],
        });

        let frame = active_frame(&mut self.frame, "shadow")?;
        let mut pass = frame.encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("shadow-map-pass"),
            color_attachments: &[Some(color_attachment(&shadow_map.view, LoadOp::Load))],
            depth_stencil_attachment: None,
            multiview_mask: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipelines.shadow);
        pass.set_bind_group(0, &self.shadow_uniforms.bind_group, &[offset]);
        pass.set_bind_group(1, &polar_bind_group, &[]);
        pass.draw(0..6, 0..1); // Quad around the light

        Ok(())
    }

    fn render_light_map(&mut self, screen: &ScreenView, lights: &[LightDraw]) -> Result<()> {
        expect_frame(&self.frame, "light map")?;
        let view_proj = screen.view_projection().to_cols_array_2d();
        let mut offsets = Vec::with_capacity(lights.len());
        for light in lights {
            offsets.push(self.light_uniforms.push(
                &self.queue,
                &LightUniforms {
                    view_proj,
                    center: [light.center.x, light.center.y],
                    range: light.range,
                    intensity: light.intensity,
                    color: [light.color[0], light.color[1], light.color[2], 1.0],
                },
            )?);
        }

        let light_map = required(&self.light_map, LightingTarget::LightMap)?;
        let frame = active_frame(&mut self.frame, "light map")?;
        let mut pass = frame.encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("light-map-pass"),
            color_attachments: &[Some(color_attachment(&light_map.view, LoadOp::Load))],
            depth_stencil_attachment: None,
            multiview_mask: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipelines.light);
        for offset in offsets {
            pass.set_bind_group(0, &self.light_uniforms.bind_group, &[offset]);
            pass.draw(0..6, 0..1); // 6 vertices for quad
        }

        Ok(())
    }

    fn render_objects(
        &mut self,
        screen: &ScreenView,
        params: &CompositeParams,
        batches: &[GeometryBatch],
        target: Option<&OffscreenTarget>,
    ) -> Result<()> {
        expect_frame(&self.frame, "object")?;
        let output_size = match target {
            Some(target) => target.size(),
            None => self.surface_size(),
        };
        let view_proj = screen.view_projection().to_cols_array_2d();

        let mut draws = Vec::with_capacity(batches.len());
        for batch in batches {
            self.ensure_material_bind_group(batch.color_texture, batch.normal_texture)?;
            let material = &batch.material;
            let flip = flip_flags(batch);
            let offset = self.object_uniforms.push(
                &self.queue,
                &ObjectUniforms {
                    view_proj,
                    tint: material.tint,
                    ambient: [
                        params.ambient[0],
                        params.ambient[1],
                        params.ambient[2],
                        params.direction_sample_distance,
                    ],
                    flags: [
                        if material.is_lit { 1.0 } else { 0.0 },
                        if material.receives_shadows { 1.0 } else { 0.0 },
                        flip[0],
                        flip[1],
                    ],
                    output_size: [output_size.0 as f32, output_size.1 as f32, 0.0, 0.0],
                },
            )?;
            draws.push(self.upload_batch(batch, offset));
        }

        let light_map = required(&self.light_map, LightingTarget::LightMap)?;
        let shadow_map = required(&self.shadow_map, LightingTarget::ShadowMap)?;
        let screen_bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("screen-buffers-bind-group"),
            layout: &self.pipelines.texture_pair_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&light_map.view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::TextureView(&shadow_map.view),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::Sampler(&self.screen_sampler),
                },
            ],
        });

        let FrameResources {
            encoder,
            surface_view,
            ..
        } = active_frame(&mut self.frame, "object")?;
        let output_view = match target {
            Some(target) => target.view(),
            None => surface_view
                .as_ref()
                .ok_or_else(|| anyhow!("Surface texture not acquired for this frame"))?,
        };

        let [r, g, b, a] = params.clear_color.map(f64::from);
        let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("object-pass"),
            color_attachments: &[Some(color_attachment(
                output_view,
                LoadOp::Clear(wgpu::Color { r, g, b, a }),
            ))],
            depth_stencil_attachment: None,
            multiview_mask: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        pass.set_pipeline(&self.pipelines.object);
        pass.set_bind_group(2, &screen_bind_group, &[]);
        for draw in &draws {
            let material_bind_group = self
                .material_bind_groups
                .get(&(draw.color_texture, draw.normal_texture))
                .ok_or_else(|| anyhow!("Bind group not found for texture handle"))?;
            pass.set_bind_group(0, &self.object_uniforms.bind_group, &[draw.uniform_offset]);
            pass.set_bind_group(1, material_bind_group, &[]);
            pass.set_vertex_buffer(0, draw.vertices.slice(..));
            pass.set_index_buffer(draw.indices.slice(..), IndexFormat::Uint32);
            pass.draw_indexed(0..draw.index_count, 0, 0..1);
        }

        Ok(())
    }

    fn end_frame(&mut self, _target: Option<&OffscreenTarget>) -> Result<()> {
        let frame = self.frame.take().ok_or(LightingError::NoActiveFrame {
            pass: "end of frame",
        })?;
        self.queue.submit(Some(frame.encoder.finish()));

        if let Some(surface_texture) = frame.surface_texture {
            surface_texture.present();
        }
        Ok(())
    }

    fn abort_frame(&mut self) {
        // Dropping the encoder discards everything recorded so far; an
        // acquired surface texture is released without presenting.
        self.frame = None;
    }
}

fn create_render_texture(
    device: &wgpu::Device,
    label: &str,
    size: (u32, u32),
    format: TextureFormat,
) -> RenderTexture {
    let texture = device.create_texture(&TextureDescriptor {
        label: Some(label),
        size: Extent3d {
            width: size.0,
            height: size.1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: TextureDimension::D2,
        format,
        usage: TextureUsages::RENDER_ATTACHMENT
            | TextureUsages::TEXTURE_BINDING
            | TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&TextureViewDescriptor::default());
    RenderTexture {
        texture,
        view,
        size,
    }
}

fn texture_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable: true },
            view_dimension: TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: BindingType::Sampler(SamplerBindingType::Filtering),
        count: None,
    }
}

/// Additive blending for accumulating light and shadow factors.
const ADDITIVE: BlendState = BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Add,
    },
};

/// Overlapping occluders keep the strongest coverage.
const MAX_BLEND: BlendState = BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Max,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation: wgpu::BlendOperation::Max,
    },
};

struct PipelineDesc<'a> {
    label: &'a str,
    source: &'a str,
    bind_group_layouts: &'a [&'a BindGroupLayout],
    vertex_buffers: &'a [VertexBufferLayout<'a>],
    format: TextureFormat,
    blend: Option<BlendState>,
}

fn create_pipeline(device: &wgpu::Device, desc: PipelineDesc<'_>) -> RenderPipeline {
    let shader = device.create_shader_module(ShaderModuleDescriptor {
        label: Some(desc.label),
        source: ShaderSource::Wgsl(desc.source.into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some(desc.label),
        bind_group_layouts: desc.bind_group_layouts,
        immediate_size: 0,
    });

    device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some(desc.label),
        layout: Some(&pipeline_layout),
        vertex: VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            buffers: desc.vertex_buffers,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            targets: &[Some(ColorTargetState {
                format: desc.format,
                blend: desc.blend,
                write_mask: ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: None,
        multisample: MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

/// `uniform_layouts`: occlusion, shadow, light, object.
fn create_pipelines(
    device: &wgpu::Device,
    surface_format: TextureFormat,
    uniform_layouts: [&BindGroupLayout; 4],
) -> LightingPipelines {
    let [occlusion_uniforms, shadow_uniforms, light_uniforms, object_uniforms] = uniform_layouts;

    let texture_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("texture-bind-group-layout"),
        entries: &[texture_entry(0), sampler_entry(1)],
    });
    let texture_pair_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
        label: Some("texture-pair-bind-group-layout"),
        entries: &[texture_entry(0), texture_entry(1), sampler_entry(2)],
    });

    let batch_vertex_layout = VertexBufferLayout {
        array_stride: std::mem::size_of::<BatchVertex>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &vertex_attr_array![0 => Float32x2, 1 => Float32x2],
    };

    let occlusion = create_pipeline(
        device,
        PipelineDesc {
            label: "occlusion-pipeline",
            source: include_str!("shaders/occlusion.wgsl"),
            bind_group_layouts: &[occlusion_uniforms, &texture_layout],
            vertex_buffers: &[batch_vertex_layout.clone()],
            format: OCCLUSION_FORMAT,
            blend: Some(MAX_BLEND),
        },
    );
    let polar = create_pipeline(
        device,
        PipelineDesc {
            label: "polar-distance-pipeline",
            source: include_str!("shaders/polar_distance.wgsl"),
            bind_group_layouts: &[&texture_layout],
            vertex_buffers: &[],
            format: POLAR_FORMAT,
            blend: None,
        },
    );
    let shadow = create_pipeline(
        device,
        PipelineDesc {
            label: "shadow-map-pipeline",
            source: include_str!("shaders/shadow_map.wgsl"),
            bind_group_layouts: &[shadow_uniforms, &texture_layout],
            vertex_buffers: &[],
            format: SCREEN_BUFFER_FORMAT,
            blend: Some(ADDITIVE),
        },
    );
    let light = create_pipeline(
        device,
        PipelineDesc {
            label: "light-map-pipeline",
            source: include_str!("shaders/light_map.wgsl"),
            bind_group_layouts: &[light_uniforms],
            vertex_buffers: &[],
            format: SCREEN_BUFFER_FORMAT,
            blend: Some(ADDITIVE),
        },
    );
    let object = create_pipeline(
        device,
        PipelineDesc {
            label: "object-pipeline",
            source: include_str!("shaders/object.wgsl"),
            bind_group_layouts: &[object_uniforms, &texture_pair_layout, &texture_pair_layout],
            vertex_buffers: &[batch_vertex_layout],
            format: surface_format,
            blend: Some(BlendState::ALPHA_BLENDING),
        },
    );

    LightingPipelines {
        occlusion,
        polar,
        shadow,
        light,
        object,
        texture_layout,
        texture_pair_layout,
    }
}

fn choose_present_mode(modes: &[PresentMode], vsync: bool) -> PresentMode {
    if vsync {
        modes
            .iter()
            .copied()
            .find(|mode| matches!(mode, PresentMode::Fifo | PresentMode::FifoRelaxed))
            .unwrap_or(PresentMode::Fifo)
    } else {
        modes
            .iter()
            .copied()
            .find(|mode| matches!(mode, PresentMode::Immediate | PresentMode::Mailbox))
            .unwrap_or(PresentMode::Immediate)
    }
}

fn choose_alpha_mode(modes: &[CompositeAlphaMode]) -> CompositeAlphaMode {
    modes
        .iter()
        .copied()
        .find(|mode| matches!(mode, CompositeAlphaMode::Auto))
        .unwrap_or_else(|| modes.first().copied().unwrap_or(CompositeAlphaMode::Opaque))
}
