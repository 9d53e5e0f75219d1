// src/gpu/wgpu_backend.rs
//! wgpu implementation of the backend seam.
//!
//! The context records draws together with a snapshot of the bound state and
//! replays them into one render pass at [`WgpuContext::flush`]. Constant
//! buffers live in a per-frame uniform arena: every `write_discard` appends a
//! new 256-byte version and draws keep the offset that was current when they
//! were recorded, so rewriting the camera between two draws behaves like a
//! D3D11 discard map. Slot 0 of the arena stays zeroed for unbound slots.
//!
//! Dynamic vertex buffers are written through the queue and therefore hold
//! one version per frame: the last write before `flush` is what every draw
//! of that frame reads.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::num::{NonZeroU64, NonZeroUsize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use lru::LruCache;
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{
    AddressMode, Backend, BufferDesc, BufferKind, CompareFunction, CullMode, DepthStencilDesc, FillMode, FilterMode,
    IndexFormat, RasterizerDesc, RenderContext, RenderDevice, SamplerDesc, ShaderStage, VertexStream,
    MAX_CONSTANT_BUFFER_BYTES, MAX_CONSTANT_BUFFER_SLOTS, TEXTURE_SLOT_COUNT,
};
use crate::config::RenderConfig;
use crate::error::{Error, Result};
use crate::shader_reflect::{ShaderProgram, ShaderSource};
use crate::texture::{TextureData, TextureDimension, TextureFormat, TextureSlot};
use crate::vertex_layout::{StreamLayout, VertexBufferDescription};

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Mesh vertices and the per-instance stream.
const VERTEX_STREAM_SLOTS: usize = 2;
const SLOT_BYTES: u64 = MAX_CONSTANT_BUFFER_BYTES;
const CONSTANT_SLOTS: usize = MAX_CONSTANT_BUFFER_SLOTS as usize;
const CUBE_BINDING: u32 = TextureSlot::Cube as u32;
const SAMPLER_BINDING: u32 = TEXTURE_SLOT_COUNT as u32;

#[derive(Debug)]
pub struct WgpuBackend;

impl Backend for WgpuBackend {
    type Buffer = WgpuBuffer;
    type VertexShader = WgpuShader;
    type PixelShader = WgpuShader;
    type InputLayout = WgpuInputLayout;
    type TextureView = WgpuTextureView;
    type Sampler = WgpuSampler;
    type RasterizerState = RasterizerDesc;
    type DepthStencilState = DepthStencilDesc;

    type Device = WgpuDevice;
    type Context = WgpuContext;
}

// -----------------------------------------------------------------------------
// Handles
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct BufferInner {
    id: u64,
    label: String,
    kind: BufferKind,
    size: u64,
    /// `None` for constant buffers, which live in the uniform arena.
    gpu: Option<wgpu::Buffer>,
    /// Latest contents of a constant buffer.
    shadow: Mutex<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct WgpuBuffer(Arc<BufferInner>);

impl WgpuBuffer {
    #[inline]
    pub fn label(&self) -> &str {
        &self.0.label
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.0.size
    }
}

#[derive(Debug)]
struct ShaderInner {
    id: u64,
    name: String,
    stage: ShaderStage,
    entry_point: String,
    module: wgpu::ShaderModule,
}

#[derive(Debug, Clone)]
pub struct WgpuShader(Arc<ShaderInner>);

impl WgpuShader {
    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

#[derive(Debug)]
struct VertexStreamLayout {
    stride: u64,
    step_mode: wgpu::VertexStepMode,
    attributes: Vec<wgpu::VertexAttribute>,
}

#[derive(Debug)]
struct InputLayoutInner {
    id: u64,
    streams: Vec<VertexStreamLayout>,
}

#[derive(Debug, Clone)]
pub struct WgpuInputLayout(Arc<InputLayoutInner>);

#[derive(Debug)]
struct TextureViewInner {
    id: u64,
    dimension: TextureDimension,
    view: wgpu::TextureView,
}

#[derive(Debug, Clone)]
pub struct WgpuTextureView(Arc<TextureViewInner>);

#[derive(Debug)]
struct SamplerInner {
    id: u64,
    sampler: wgpu::Sampler,
}

#[derive(Debug, Clone)]
pub struct WgpuSampler(Arc<SamplerInner>);

// -----------------------------------------------------------------------------
// Conversions
// -----------------------------------------------------------------------------

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
        TextureFormat::Bc1RgbaUnormSrgb => wgpu::TextureFormat::Bc1RgbaUnormSrgb,
        TextureFormat::Bc3RgbaUnorm => wgpu::TextureFormat::Bc3RgbaUnorm,
        TextureFormat::Bc3RgbaUnormSrgb => wgpu::TextureFormat::Bc3RgbaUnormSrgb,
        TextureFormat::Bc7RgbaUnorm => wgpu::TextureFormat::Bc7RgbaUnorm,
        TextureFormat::Bc7RgbaUnormSrgb => wgpu::TextureFormat::Bc7RgbaUnormSrgb,
    }
}

fn vertex_format(components: u32) -> wgpu::VertexFormat {
    match components {
        1 => wgpu::VertexFormat::Float32,
        2 => wgpu::VertexFormat::Float32x2,
        3 => wgpu::VertexFormat::Float32x3,
        _ => wgpu::VertexFormat::Float32x4,
    }
}

fn compare_function(compare: CompareFunction) -> wgpu::CompareFunction {
    match compare {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn address_mode(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::Wrap => wgpu::AddressMode::Repeat,
        AddressMode::Clamp => wgpu::AddressMode::ClampToEdge,
        AddressMode::Mirror => wgpu::AddressMode::MirrorRepeat,
    }
}

fn filter_mode(filter: FilterMode) -> wgpu::FilterMode {
    match filter {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

fn primitive_state(raster: &RasterizerDesc) -> wgpu::PrimitiveState {
    wgpu::PrimitiveState {
        topology: wgpu::PrimitiveTopology::TriangleList,
        strip_index_format: None,
        front_face: if raster.front_counter_clockwise { wgpu::FrontFace::Ccw } else { wgpu::FrontFace::Cw },
        cull_mode: match raster.cull {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        },
        unclipped_depth: false,
        polygon_mode: match raster.fill {
            FillMode::Solid => wgpu::PolygonMode::Fill,
            FillMode::Wireframe => wgpu::PolygonMode::Line,
        },
        conservative: false,
    }
}

fn depth_stencil_state(depth: &DepthStencilDesc) -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: depth.depth_test && depth.depth_write,
        depth_compare: if depth.depth_test { compare_function(depth.compare) } else { wgpu::CompareFunction::Always },
        stencil: wgpu::StencilState::default(),
        bias: wgpu::DepthBiasState::default(),
    }
}

fn draw_range(what: &str, start: u32, count: u32) -> Result<Range<u32>> {
    let end = start
        .checked_add(count)
        .ok_or_else(|| Error::Gpu(format!("{what} range {start}+{count} overflows u32")))?;
    Ok(start..end)
}

fn stream_layout(stream: &StreamLayout, step_mode: wgpu::VertexStepMode) -> VertexStreamLayout {
    VertexStreamLayout {
        stride: stream.byte_size as u64,
        step_mode,
        attributes: stream
            .elements
            .iter()
            .map(|e| wgpu::VertexAttribute {
                format: vertex_format(e.components),
                offset: e.offset as u64,
                shader_location: e.location,
            })
            .collect(),
    }
}

// -----------------------------------------------------------------------------
// Device
// -----------------------------------------------------------------------------

struct Shared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    color_format: wgpu::TextureFormat,
    next_id: AtomicU64,
    lost: Arc<AtomicBool>,
    vs_constants_layout: wgpu::BindGroupLayout,
    ps_constants_layout: wgpu::BindGroupLayout,
    textures_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    white_2d: wgpu::TextureView,
    white_cube: wgpu::TextureView,
    fallback_sampler: wgpu::Sampler,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Resource creation on a wgpu device.
pub struct WgpuDevice {
    shared: Arc<Shared>,
}

impl fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("color_format", &self.shared.color_format)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

fn constants_layout(device: &wgpu::Device, label: &str, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayout {
    let entries: Vec<_> = (0..MAX_CONSTANT_BUFFER_SLOTS)
        .map(|binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: NonZeroU64::new(SLOT_BYTES),
            },
            count: None,
        })
        .collect();
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor { label: Some(label), entries: &entries })
}

fn textures_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let mut entries: Vec<_> = (0..TEXTURE_SLOT_COUNT as u32)
        .map(|binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: if binding == CUBE_BINDING {
                    wgpu::TextureViewDimension::Cube
                } else {
                    wgpu::TextureViewDimension::D2
                },
                multisampled: false,
            },
            count: None,
        })
        .collect();
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: SAMPLER_BINDING,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    });
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor { label: Some("textures"), entries: &entries })
}

fn white_texture(device: &wgpu::Device, queue: &wgpu::Queue, dimension: TextureDimension) -> wgpu::TextureView {
    let layers = match dimension {
        TextureDimension::D2 => 1,
        TextureDimension::Cube => 6,
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("fallback_white"),
        size: wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: layers },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let texels = vec![255u8; 4 * layers as usize];
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &texels,
        wgpu::ImageDataLayout { offset: 0, bytes_per_row: Some(4), rows_per_image: Some(1) },
        wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: layers },
    );
    texture.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(match dimension {
            TextureDimension::D2 => wgpu::TextureViewDimension::D2,
            TextureDimension::Cube => wgpu::TextureViewDimension::Cube,
        }),
        ..Default::default()
    })
}

impl WgpuDevice {
    /// Wrap a device whose frames render into `color_format` targets.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, color_format: wgpu::TextureFormat) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            error!("GPU device lost ({reason:?}): {message}");
            flag.store(true, Ordering::Release);
        });

        let vs_constants_layout = constants_layout(&device, "vs_constants", wgpu::ShaderStages::VERTEX);
        let ps_constants_layout = constants_layout(&device, "ps_constants", wgpu::ShaderStages::FRAGMENT);
        let textures_layout = textures_layout(&device);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("codex_pipeline_layout"),
            bind_group_layouts: &[&vs_constants_layout, &ps_constants_layout, &textures_layout],
            push_constant_ranges: &[],
        });
        let white_2d = white_texture(&device, &queue, TextureDimension::D2);
        let white_cube = white_texture(&device, &queue, TextureDimension::Cube);
        let fallback_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("fallback_sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Self {
            shared: Arc::new(Shared {
                device,
                queue,
                color_format,
                next_id: AtomicU64::new(1),
                lost,
                vs_constants_layout,
                ps_constants_layout,
                textures_layout,
                pipeline_layout,
                white_2d,
                white_cube,
                fallback_sampler,
            }),
        }
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.shared.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.shared.queue
    }

    #[inline]
    pub fn color_format(&self) -> wgpu::TextureFormat {
        self.shared.color_format
    }

    /// Set once the driver reports the device as lost.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    /// A render context recording onto this device.
    pub fn create_context(&self, config: &RenderConfig) -> Result<WgpuContext> {
        WgpuContext::new(self.shared.clone(), config)
    }

    /// Depth target matching the pipelines this device builds.
    pub fn create_depth_view(&self, width: u32, height: u32) -> wgpu::TextureView {
        let texture = self.shared.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth"),
            size: wgpu::Extent3d { width: width.max(1), height: height.max(1), depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    fn create_module(&self, program: &ShaderProgram, stage: ShaderStage) -> Result<WgpuShader> {
        if program.stage != stage {
            return Err(Error::shader(&program.name, format!("compiled for {:?}, used as {:?}", program.stage, stage)));
        }
        let source = match &program.source {
            ShaderSource::Wgsl(text) => wgpu::ShaderSource::Wgsl(Cow::Borrowed(text.as_str())),
            ShaderSource::SpirV(words) => wgpu::ShaderSource::SpirV(Cow::Borrowed(words.as_slice())),
        };
        let device = &self.shared.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor { label: Some(&program.name), source });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(Error::shader(&program.name, err));
        }
        Ok(WgpuShader(Arc::new(ShaderInner {
            id: self.shared.next_id(),
            name: program.name.clone(),
            stage,
            entry_point: program.entry_point.clone(),
            module,
        })))
    }
}

impl RenderDevice<WgpuBackend> for WgpuDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>, contents: Option<&[u8]>) -> Result<WgpuBuffer> {
        crate::ensure!(desc.size > 0, "buffer `{}` has zero size", desc.label);
        let initial = contents.unwrap_or(&[]);
        crate::ensure!(
            initial.len() as u64 <= desc.size,
            "buffer `{}`: {} initial bytes exceed its size of {}",
            desc.label,
            initial.len(),
            desc.size
        );

        let (gpu, shadow) = match desc.kind {
            BufferKind::Constant => {
                if desc.size > SLOT_BYTES {
                    return Err(Error::Gpu(format!(
                        "constant buffer `{}` is {} bytes, the limit is {SLOT_BYTES}",
                        desc.label, desc.size
                    )));
                }
                let mut shadow = initial.to_vec();
                shadow.resize(desc.size as usize, 0);
                (None, shadow)
            }
            kind => {
                let usage = match kind {
                    BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
                    BufferKind::Index => wgpu::BufferUsages::INDEX,
                    _ => wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                };
                let mut bytes = initial.to_vec();
                bytes.resize(desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
                let buffer = self.shared.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(desc.label),
                    contents: &bytes,
                    usage,
                });
                (Some(buffer), Vec::new())
            }
        };

        Ok(WgpuBuffer(Arc::new(BufferInner {
            id: self.shared.next_id(),
            label: desc.label.to_string(),
            kind: desc.kind,
            size: desc.size,
            gpu,
            shadow: Mutex::new(shadow),
        })))
    }

    fn create_vertex_shader(&self, program: &ShaderProgram) -> Result<WgpuShader> {
        self.create_module(program, ShaderStage::Vertex)
    }

    fn create_pixel_shader(&self, program: &ShaderProgram) -> Result<WgpuShader> {
        self.create_module(program, ShaderStage::Pixel)
    }

    fn create_input_layout(&self, shader: &WgpuShader, layout: &VertexBufferDescription) -> Result<WgpuInputLayout> {
        crate::ensure!(
            shader.0.stage == ShaderStage::Vertex,
            "input layout requested for pixel shader `{}`",
            shader.0.name
        );
        let mut streams = vec![stream_layout(&layout.per_vertex, wgpu::VertexStepMode::Vertex)];
        if let Some(instance) = &layout.per_instance {
            streams.push(stream_layout(instance, wgpu::VertexStepMode::Instance));
        }
        Ok(WgpuInputLayout(Arc::new(InputLayoutInner { id: self.shared.next_id(), streams })))
    }

    fn create_texture(&self, label: &str, data: &TextureData) -> Result<WgpuTextureView> {
        let features = self.shared.device.features();
        let format = texture_format(data.format);
        if format.is_compressed() && !features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC) {
            return Err(Error::Gpu(format!("`{label}`: adapter lacks BC texture compression")));
        }
        if data.format == TextureFormat::Rgba32Float && !features.contains(wgpu::Features::FLOAT32_FILTERABLE) {
            return Err(Error::Gpu(format!("`{label}`: RGBA32F textures are not filterable on this adapter")));
        }
        crate::ensure!(
            data.data.len() == data.expected_len(),
            "texture `{}`: {} bytes of data, expected {}",
            label,
            data.data.len(),
            data.expected_len()
        );

        let texture = self.shared.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width: data.width, height: data.height, depth_or_array_layers: data.layers },
            mip_level_count: data.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let block = data.format.block_dim();
        for layer in 0..data.layers {
            for level in 0..data.mip_levels {
                let (width, height) = data.level_extent(level);
                self.shared.queue.write_texture(
                    wgpu::ImageCopyTexture {
                        texture: &texture,
                        mip_level: level,
                        origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                        aspect: wgpu::TextureAspect::All,
                    },
                    &data.data[data.subresource(layer, level)],
                    wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(data.format.bytes_per_row(width)),
                        rows_per_image: Some(data.format.block_rows(height)),
                    },
                    // compressed copies cover whole blocks
                    wgpu::Extent3d {
                        width: width.next_multiple_of(block),
                        height: height.next_multiple_of(block),
                        depth_or_array_layers: 1,
                    },
                );
            }
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(label),
            dimension: Some(match data.dimension {
                TextureDimension::D2 => wgpu::TextureViewDimension::D2,
                TextureDimension::Cube => wgpu::TextureViewDimension::Cube,
            }),
            ..Default::default()
        });
        Ok(WgpuTextureView(Arc::new(TextureViewInner {
            id: self.shared.next_id(),
            dimension: data.dimension,
            view,
        })))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<WgpuSampler> {
        let filter = filter_mode(desc.filter);
        let anisotropy = if desc.filter == FilterMode::Linear { desc.max_anisotropy.clamp(1, 16) } else { 1 };
        let address = address_mode(desc.address);
        let sampler = self.shared.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: filter,
            anisotropy_clamp: anisotropy as u16,
            ..Default::default()
        });
        Ok(WgpuSampler(Arc::new(SamplerInner { id: self.shared.next_id(), sampler })))
    }

    fn create_rasterizer_state(&self, desc: &RasterizerDesc) -> Result<RasterizerDesc> {
        if desc.fill == FillMode::Wireframe && !self.shared.device.features().contains(wgpu::Features::POLYGON_MODE_LINE)
        {
            warn!("Wireframe fill is not supported by this adapter; drawing solid");
            return Ok(RasterizerDesc { fill: FillMode::Solid, ..*desc });
        }
        Ok(*desc)
    }

    fn create_depth_stencil_state(&self, desc: &DepthStencilDesc) -> Result<DepthStencilDesc> {
        Ok(*desc)
    }
}

// -----------------------------------------------------------------------------
// Context
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    vertex_shader: u64,
    pixel_shader: u64,
    input_layout: u64,
    raster: RasterizerDesc,
    depth: DepthStencilDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TextureKey {
    /// 0 selects the fallback texture.
    views: [u64; TEXTURE_SLOT_COUNT],
    sampler: u64,
}

#[derive(Default)]
struct BoundState {
    vertex_buffers: [Option<WgpuBuffer>; VERTEX_STREAM_SLOTS],
    index_buffer: Option<(WgpuBuffer, IndexFormat)>,
    input_layout: Option<WgpuInputLayout>,
    vertex_shader: Option<WgpuShader>,
    pixel_shader: Option<WgpuShader>,
    vs_constants: [Option<WgpuBuffer>; CONSTANT_SLOTS],
    ps_constants: [Option<WgpuBuffer>; CONSTANT_SLOTS],
    textures: [Option<WgpuTextureView>; TEXTURE_SLOT_COUNT],
    sampler: Option<WgpuSampler>,
    rasterizer: Option<RasterizerDesc>,
    depth_stencil: Option<DepthStencilDesc>,
}

struct RecordedDraw {
    key: PipelineKey,
    vertex_shader: WgpuShader,
    pixel_shader: WgpuShader,
    input_layout: WgpuInputLayout,
    vertex_buffers: [Option<WgpuBuffer>; VERTEX_STREAM_SLOTS],
    index_buffer: (WgpuBuffer, IndexFormat),
    vs_offsets: [u32; CONSTANT_SLOTS],
    ps_offsets: [u32; CONSTANT_SLOTS],
    textures: [Option<WgpuTextureView>; TEXTURE_SLOT_COUNT],
    sampler: Option<WgpuSampler>,
    indices: Range<u32>,
    base_vertex: i32,
    instances: Range<u32>,
}

/// Immediate-mode context that records a frame and replays it at `flush`.
pub struct WgpuContext {
    shared: Arc<Shared>,
    arena: wgpu::Buffer,
    arena_capacity: u64,
    staging: Vec<u8>,
    vs_constants_group: wgpu::BindGroup,
    ps_constants_group: wgpu::BindGroup,
    /// Arena offset of each constant buffer's version for this frame.
    constant_offsets: HashMap<u64, u32>,
    pipelines: HashMap<PipelineKey, Arc<wgpu::RenderPipeline>>,
    texture_groups: LruCache<TextureKey, Arc<wgpu::BindGroup>>,
    state: BoundState,
    draws: Vec<RecordedDraw>,
}

impl fmt::Debug for WgpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuContext")
            .field("arena_used", &self.staging.len())
            .field("arena_capacity", &self.arena_capacity)
            .field("pending_draws", &self.draws.len())
            .field("pipelines", &self.pipelines.len())
            .finish_non_exhaustive()
    }
}

fn constants_group(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    arena: &wgpu::Buffer,
) -> wgpu::BindGroup {
    let entries: Vec<_> = (0..MAX_CONSTANT_BUFFER_SLOTS)
        .map(|binding| wgpu::BindGroupEntry {
            binding,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: arena,
                offset: 0,
                size: NonZeroU64::new(SLOT_BYTES),
            }),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor { label: Some(label), layout, entries: &entries })
}

impl WgpuContext {
    fn new(shared: Arc<Shared>, config: &RenderConfig) -> Result<Self> {
        let max_binding = shared.device.limits().max_uniform_buffer_binding_size as u64;
        let capacity = config.uniform_arena_bytes.max(SLOT_BYTES * 16).next_multiple_of(SLOT_BYTES);
        crate::ensure!(
            SLOT_BYTES <= max_binding,
            "device uniform binding limit {} is below {}",
            max_binding,
            SLOT_BYTES
        );
        let arena = shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("uniform_arena"),
            size: capacity,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let vs_constants_group = constants_group(&shared.device, "vs_constants", &shared.vs_constants_layout, &arena);
        let ps_constants_group = constants_group(&shared.device, "ps_constants", &shared.ps_constants_layout, &arena);
        let cache = NonZeroUsize::new(config.bind_group_cache).unwrap_or(NonZeroUsize::MIN);
        debug!("Render context: {} KiB uniform arena, {} cached texture groups", capacity / 1024, cache);

        Ok(Self {
            shared,
            arena,
            arena_capacity: capacity,
            staging: vec![0; SLOT_BYTES as usize],
            vs_constants_group,
            ps_constants_group,
            constant_offsets: HashMap::new(),
            pipelines: HashMap::new(),
            texture_groups: LruCache::new(cache),
            state: BoundState::default(),
            draws: Vec::new(),
        })
    }

    /// Draws recorded since the last flush.
    #[inline]
    pub fn pending_draws(&self) -> usize {
        self.draws.len()
    }

    fn push_constants(&mut self, data: &[u8]) -> Result<u32> {
        let offset = self.staging.len() as u64;
        if offset + SLOT_BYTES > self.arena_capacity {
            return Err(Error::Gpu(format!(
                "uniform arena exhausted ({} bytes); raise render.uniform_arena_bytes",
                self.arena_capacity
            )));
        }
        self.staging.extend_from_slice(data);
        self.staging.resize((offset + SLOT_BYTES) as usize, 0);
        Ok(offset as u32)
    }

    /// Arena offset of `buffer`'s current contents, uploading its shadow copy
    /// if it was not written this frame.
    fn constant_offset(&mut self, buffer: &WgpuBuffer) -> Result<u32> {
        if let Some(&offset) = self.constant_offsets.get(&buffer.0.id) {
            return Ok(offset);
        }
        let shadow = buffer.0.shadow.lock().clone();
        let offset = self.push_constants(&shadow)?;
        self.constant_offsets.insert(buffer.0.id, offset);
        Ok(offset)
    }

    fn constant_offsets(&mut self, stage: ShaderStage) -> Result<[u32; CONSTANT_SLOTS]> {
        let bound = match stage {
            ShaderStage::Vertex => self.state.vs_constants.clone(),
            ShaderStage::Pixel => self.state.ps_constants.clone(),
        };
        let mut offsets = [0; CONSTANT_SLOTS];
        for (slot, buffer) in bound.iter().enumerate() {
            if let Some(buffer) = buffer {
                offsets[slot] = self.constant_offset(buffer)?;
            }
        }
        Ok(offsets)
    }

    fn record(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) -> Result<()> {
        let state = &self.state;
        let (Some(vertex_shader), Some(pixel_shader), Some(input_layout), Some(index_buffer)) = (
            state.vertex_shader.clone(),
            state.pixel_shader.clone(),
            state.input_layout.clone(),
            state.index_buffer.clone(),
        ) else {
            error!("Draw skipped: shaders, input layout and index buffer must all be bound");
            return Ok(());
        };
        let streams = input_layout.0.streams.len();
        if state.vertex_buffers.iter().take(streams).any(Option::is_none) {
            error!("Draw skipped: input layout expects {streams} vertex streams");
            return Ok(());
        }

        let key = PipelineKey {
            vertex_shader: vertex_shader.0.id,
            pixel_shader: pixel_shader.0.id,
            input_layout: input_layout.0.id,
            raster: state.rasterizer.unwrap_or_default(),
            depth: state.depth_stencil.unwrap_or_default(),
        };
        let vertex_buffers = state.vertex_buffers.clone();
        let textures = state.textures.clone();
        let sampler = state.sampler.clone();

        let vs_offsets = self.constant_offsets(ShaderStage::Vertex)?;
        let ps_offsets = self.constant_offsets(ShaderStage::Pixel)?;
        self.draws.push(RecordedDraw {
            key,
            vertex_shader,
            pixel_shader,
            input_layout,
            vertex_buffers,
            index_buffer,
            vs_offsets,
            ps_offsets,
            textures,
            sampler,
            indices,
            base_vertex,
            instances,
        });
        Ok(())
    }

    fn pipeline(&mut self, draw: &RecordedDraw) -> Arc<wgpu::RenderPipeline> {
        if let Some(pipeline) = self.pipelines.get(&draw.key) {
            return pipeline.clone();
        }
        let shared = &self.shared;
        let buffers: Vec<_> = draw
            .input_layout
            .0
            .streams
            .iter()
            .map(|s| wgpu::VertexBufferLayout {
                array_stride: s.stride,
                step_mode: s.step_mode,
                attributes: &s.attributes,
            })
            .collect();
        let label = format!("{}+{}", draw.vertex_shader.0.name, draw.pixel_shader.0.name);
        let pipeline = shared.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&label),
            layout: Some(&shared.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &draw.vertex_shader.0.module,
                entry_point: &draw.vertex_shader.0.entry_point,
                buffers: &buffers,
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &draw.pixel_shader.0.module,
                entry_point: &draw.pixel_shader.0.entry_point,
                targets: &[Some(wgpu::ColorTargetState {
                    format: shared.color_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: primitive_state(&draw.key.raster),
            depth_stencil: Some(depth_stencil_state(&draw.key.depth)),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        debug!("Pipeline `{label}` created ({} cached)", self.pipelines.len() + 1);
        let pipeline = Arc::new(pipeline);
        self.pipelines.insert(draw.key, pipeline.clone());
        pipeline
    }

    fn texture_group(&mut self, draw: &RecordedDraw) -> Arc<wgpu::BindGroup> {
        let mut key = TextureKey { views: [0; TEXTURE_SLOT_COUNT], sampler: 0 };
        for (slot, view) in draw.textures.iter().enumerate() {
            if let Some(view) = view {
                let expected = if slot as u32 == CUBE_BINDING { TextureDimension::Cube } else { TextureDimension::D2 };
                if view.0.dimension == expected {
                    key.views[slot] = view.0.id;
                }
            }
        }
        if let Some(sampler) = &draw.sampler {
            key.sampler = sampler.0.id;
        }
        if let Some(group) = self.texture_groups.get(&key) {
            return group.clone();
        }

        let shared = &self.shared;
        let mut entries = Vec::with_capacity(TEXTURE_SLOT_COUNT + 1);
        for (slot, view) in draw.textures.iter().enumerate() {
            let fallback = if slot as u32 == CUBE_BINDING { &shared.white_cube } else { &shared.white_2d };
            let view = match view {
                Some(v) if key.views[slot] != 0 => &v.0.view,
                _ => fallback,
            };
            entries.push(wgpu::BindGroupEntry { binding: slot as u32, resource: wgpu::BindingResource::TextureView(view) });
        }
        let sampler = draw.sampler.as_ref().map_or(&shared.fallback_sampler, |s| &s.0.sampler);
        entries.push(wgpu::BindGroupEntry { binding: SAMPLER_BINDING, resource: wgpu::BindingResource::Sampler(sampler) });

        let group = Arc::new(shared.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("textures"),
            layout: &shared.textures_layout,
            entries: &entries,
        }));
        self.texture_groups.put(key, group.clone());
        group
    }

    /// Replay every recorded draw into one render pass that clears `color`
    /// and `depth`, then reset the per-frame arena. Bound state persists.
    pub fn flush(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        color: &wgpu::TextureView,
        depth: &wgpu::TextureView,
        clear: wgpu::Color,
    ) -> usize {
        self.shared.queue.write_buffer(&self.arena, 0, &self.staging);

        let draws = std::mem::take(&mut self.draws);
        let prepared: Vec<_> = draws.iter().map(|d| (self.pipeline(d), self.texture_group(d))).collect();

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("main_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Clear(clear), store: wgpu::StoreOp::Store },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: depth,
                    depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for (draw, (pipeline, textures)) in draws.iter().zip(&prepared) {
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &self.vs_constants_group, &draw.vs_offsets);
                pass.set_bind_group(1, &self.ps_constants_group, &draw.ps_offsets);
                pass.set_bind_group(2, textures, &[]);
                for (slot, buffer) in draw.vertex_buffers.iter().enumerate() {
                    if let Some(gpu) = buffer.as_ref().and_then(|b| b.0.gpu.as_ref()) {
                        pass.set_vertex_buffer(slot as u32, gpu.slice(..));
                    }
                }
                let (index_buffer, format) = &draw.index_buffer;
                if let Some(gpu) = &index_buffer.0.gpu {
                    pass.set_index_buffer(gpu.slice(..), index_format(*format));
                }
                pass.draw_indexed(draw.indices.clone(), draw.base_vertex, draw.instances.clone());
            }
        }

        self.staging.truncate(SLOT_BYTES as usize);
        self.constant_offsets.clear();
        draws.len()
    }
}

impl RenderContext<WgpuBackend> for WgpuContext {
    fn write_discard(&mut self, buffer: &WgpuBuffer, data: &[u8]) -> Result<()> {
        let inner = &buffer.0;
        crate::ensure!(
            data.len() as u64 <= inner.size,
            "write of {} bytes into `{}` ({} bytes)",
            data.len(),
            inner.label,
            inner.size
        );
        match inner.kind {
            BufferKind::Constant => {
                let contents = {
                    let mut shadow = inner.shadow.lock();
                    shadow[..data.len()].copy_from_slice(data);
                    shadow.clone()
                };
                let offset = self.push_constants(&contents)?;
                self.constant_offsets.insert(inner.id, offset);
                Ok(())
            }
            BufferKind::DynamicVertex => {
                if let Some(gpu) = &inner.gpu {
                    let mut bytes = Cow::Borrowed(data);
                    if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
                        let mut padded = data.to_vec();
                        padded.resize((data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
                        bytes = Cow::Owned(padded);
                    }
                    self.shared.queue.write_buffer(gpu, 0, &bytes);
                }
                Ok(())
            }
            BufferKind::Vertex | BufferKind::Index => {
                Err(Error::Gpu(format!("buffer `{}` is immutable", inner.label)))
            }
        }
    }

    fn set_vertex_buffers(&mut self, start_slot: u32, streams: &[VertexStream<'_, WgpuBackend>]) {
        for (i, stream) in streams.iter().enumerate() {
            let slot = start_slot as usize + i;
            if slot >= VERTEX_STREAM_SLOTS {
                error!("Vertex stream slot {slot} out of range (max {})", VERTEX_STREAM_SLOTS - 1);
                continue;
            }
            if stream.offset != 0 {
                warn!("Vertex stream offsets are not supported; slot {slot} binds from the start");
            }
            self.state.vertex_buffers[slot] = Some(stream.buffer.clone());
        }
    }

    fn set_index_buffer(&mut self, buffer: &WgpuBuffer, format: IndexFormat) {
        if buffer.0.kind != BufferKind::Index {
            error!("`{}` bound as index buffer but is a {:?} buffer", buffer.0.label, buffer.0.kind);
            return;
        }
        self.state.index_buffer = Some((buffer.clone(), format));
    }

    fn set_input_layout(&mut self, layout: &WgpuInputLayout) {
        self.state.input_layout = Some(layout.clone());
    }

    fn set_vertex_shader(&mut self, shader: &WgpuShader) {
        self.state.vertex_shader = Some(shader.clone());
    }

    fn set_pixel_shader(&mut self, shader: &WgpuShader) {
        self.state.pixel_shader = Some(shader.clone());
    }

    fn set_constant_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: &WgpuBuffer) {
        if slot >= MAX_CONSTANT_BUFFER_SLOTS {
            error!("Constant buffer slot {slot} out of range (max {})", MAX_CONSTANT_BUFFER_SLOTS - 1);
            return;
        }
        if buffer.0.kind != BufferKind::Constant {
            error!("`{}` bound as constant buffer but is a {:?} buffer", buffer.0.label, buffer.0.kind);
            return;
        }
        let slots = match stage {
            ShaderStage::Vertex => &mut self.state.vs_constants,
            ShaderStage::Pixel => &mut self.state.ps_constants,
        };
        slots[slot as usize] = Some(buffer.clone());
    }

    fn set_shader_resources(&mut self, start_slot: u32, views: &[Option<WgpuTextureView>]) {
        for (i, view) in views.iter().enumerate() {
            let slot = start_slot as usize + i;
            if slot >= TEXTURE_SLOT_COUNT {
                error!("Texture slot {slot} out of range (max {})", TEXTURE_SLOT_COUNT - 1);
                continue;
            }
            self.state.textures[slot] = view.clone();
        }
    }

    fn set_sampler(&mut self, slot: u32, sampler: &WgpuSampler) {
        if slot != 0 {
            error!("Sampler slot {slot} out of range (max 0)");
            return;
        }
        self.state.sampler = Some(sampler.clone());
    }

    fn rasterizer_state(&self) -> Option<RasterizerDesc> {
        self.state.rasterizer
    }

    fn set_rasterizer_state(&mut self, state: Option<&RasterizerDesc>) {
        self.state.rasterizer = state.copied();
    }

    fn depth_stencil_state(&self) -> Option<DepthStencilDesc> {
        self.state.depth_stencil
    }

    fn set_depth_stencil_state(&mut self, state: Option<&DepthStencilDesc>) {
        self.state.depth_stencil = state.copied();
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        let recorded = draw_range("index", start_index, index_count)
            .and_then(|indices| self.record(indices, base_vertex, 0..1));
        if let Err(e) = recorded {
            error!("Draw dropped: {e}");
        }
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        let recorded = draw_range("index", start_index, index_count).and_then(|indices| {
            let instances = draw_range("instance", start_instance, instance_count)?;
            self.record(indices, base_vertex, instances)
        });
        if let Err(e) = recorded {
            error!("Draw dropped: {e}");
        }
    }
}
