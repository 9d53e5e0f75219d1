// src/gpu/mod.rs
//! # GPU backend seam
//!
//! The engine core never talks to a graphics API directly. It is generic over a
//! [`Backend`], which names the resource handle types, a [`RenderDevice`]
//! (resource creation) and a [`RenderContext`] (immediate-mode state binding
//! and draw submission).
//!
//! Two backends ship with the crate:
//!
//! * [`wgpu_backend::WgpuBackend`] renders for real. It records each draw with
//!   a snapshot of the bound state and replays the frame into one render pass.
//! * [`headless::HeadlessBackend`] keeps everything in CPU memory and logs
//!   every context call, so draw parameters, buffer contents and pipeline state
//!   can be inspected without a GPU.
//!
//! ## Binding table
//!
//! | Stage  | Kind            | Slot | Contents                          |
//! |--------|-----------------|------|-----------------------------------|
//! | Vertex | constant buffer | 0    | camera                            |
//! | Vertex | constant buffer | 1    | world matrix (non-instanced path) |
//! | Pixel  | constant buffer | 0    | lighting                          |
//! | Pixel  | constant buffer | 1    | material parameters               |
//! | Pixel  | texture         | 0..4 | diffuse, normal, specular, roughness, cube |
//! | Pixel  | sampler         | 0    | default sampler                   |
//!
//! Handles are reference counted: cloning shares the GPU object, dropping the
//! last clone releases it.

pub mod headless;
#[cfg(not(target_arch = "wasm32"))]
pub mod wgpu_backend;

use std::fmt::Debug;

use crate::error::Result;
use crate::shader_reflect::ShaderProgram;
use crate::texture::TextureData;
use crate::vertex_layout::VertexBufferDescription;

/// Constant buffer slots per stage.
pub const MAX_CONSTANT_BUFFER_SLOTS: u32 = 4;
/// Largest constant buffer a slot accepts (one uniform-arena slice).
pub const MAX_CONSTANT_BUFFER_BYTES: u64 = 256;
/// Texture slots visible to the pixel stage.
pub const TEXTURE_SLOT_COUNT: usize = 5;

pub const CAMERA_SLOT: u32 = 0;
pub const WORLD_SLOT: u32 = 1;
pub const LIGHTING_SLOT: u32 = 0;
pub const MATERIAL_SLOT: u32 = 1;
pub const DEFAULT_SAMPLER_SLOT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Immutable vertex data.
    Vertex,
    /// Immutable index data (`u32`).
    Index,
    /// Vertex data rewritten every frame with [`RenderContext::write_discard`].
    DynamicVertex,
    /// Small uniform block, at most [`MAX_CONSTANT_BUFFER_BYTES`].
    Constant,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub kind: BufferKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerDesc {
    pub cull: CullMode,
    pub fill: FillMode,
    pub front_counter_clockwise: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            cull: CullMode::Back,
            fill: FillMode::Solid,
            front_counter_clockwise: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareFunction,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare: CompareFunction::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Clamp,
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub address: AddressMode,
    pub filter: FilterMode,
    pub max_anisotropy: u16,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            address: AddressMode::Wrap,
            filter: FilterMode::Linear,
            max_anisotropy: 1,
        }
    }
}

/// One vertex buffer binding: buffer, per-element stride and start offset.
pub struct VertexStream<'a, B: Backend> {
    pub buffer: &'a B::Buffer,
    pub stride: u32,
    pub offset: u64,
}

impl<'a, B: Backend> VertexStream<'a, B> {
    pub fn new(buffer: &'a B::Buffer, stride: u32) -> Self {
        Self { buffer, stride, offset: 0 }
    }
}

/// A graphics API the engine can render through.
pub trait Backend: Sized + 'static {
    type Buffer: Clone + Debug;
    type VertexShader: Clone + Debug;
    type PixelShader: Clone + Debug;
    type InputLayout: Clone + Debug;
    type TextureView: Clone + Debug;
    type Sampler: Clone + Debug;
    type RasterizerState: Clone + Debug + PartialEq;
    type DepthStencilState: Clone + Debug + PartialEq;

    type Device: RenderDevice<Self>;
    type Context: RenderContext<Self>;
}

/// Resource creation.
pub trait RenderDevice<B: Backend> {
    /// Create a buffer, optionally with initial contents (`contents.len() <= desc.size`).
    fn create_buffer(&self, desc: &BufferDesc<'_>, contents: Option<&[u8]>) -> Result<B::Buffer>;

    fn create_vertex_shader(&self, program: &ShaderProgram) -> Result<B::VertexShader>;

    fn create_pixel_shader(&self, program: &ShaderProgram) -> Result<B::PixelShader>;

    /// Input layout matching `layout`, validated against the shader's signature.
    fn create_input_layout(
        &self,
        shader: &B::VertexShader,
        layout: &VertexBufferDescription,
    ) -> Result<B::InputLayout>;

    /// Upload a texture with its full mip chain.
    fn create_texture(&self, label: &str, data: &TextureData) -> Result<B::TextureView>;

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<B::Sampler>;

    fn create_rasterizer_state(&self, desc: &RasterizerDesc) -> Result<B::RasterizerState>;

    fn create_depth_stencil_state(&self, desc: &DepthStencilDesc) -> Result<B::DepthStencilState>;
}

/// Immediate-mode state binding and draw submission.
///
/// Bound state persists until rebound, like a D3D11 immediate context. `None`
/// for rasterizer or depth-stencil state means the backend default.
pub trait RenderContext<B: Backend> {
    /// Replace the whole contents of a dynamic or constant buffer.
    fn write_discard(&mut self, buffer: &B::Buffer, data: &[u8]) -> Result<()>;

    fn set_vertex_buffers(&mut self, start_slot: u32, streams: &[VertexStream<'_, B>]);

    fn set_index_buffer(&mut self, buffer: &B::Buffer, format: IndexFormat);

    fn set_input_layout(&mut self, layout: &B::InputLayout);

    fn set_vertex_shader(&mut self, shader: &B::VertexShader);

    fn set_pixel_shader(&mut self, shader: &B::PixelShader);

    fn set_constant_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: &B::Buffer);

    /// Bind pixel-stage texture views starting at `start_slot`; `None` unbinds.
    fn set_shader_resources(&mut self, start_slot: u32, views: &[Option<B::TextureView>]);

    fn set_sampler(&mut self, slot: u32, sampler: &B::Sampler);

    fn rasterizer_state(&self) -> Option<B::RasterizerState>;

    fn set_rasterizer_state(&mut self, state: Option<&B::RasterizerState>);

    fn depth_stencil_state(&self) -> Option<B::DepthStencilState>;

    fn set_depth_stencil_state(&mut self, state: Option<&B::DepthStencilState>);

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32);

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );
}

/// Saved pipeline state for a temporary override.
///
/// Only the kinds actually overridden are saved, and [`restore`](Self::restore)
/// puts exactly those back.
#[must_use = "call restore() after the draw"]
pub struct StateOverride<B: Backend> {
    raster: Option<Option<B::RasterizerState>>,
    depth: Option<Option<B::DepthStencilState>>,
}

impl<B: Backend> StateOverride<B> {
    pub fn apply(
        ctx: &mut B::Context,
        raster: Option<&B::RasterizerState>,
        depth: Option<&B::DepthStencilState>,
    ) -> Self {
        let saved_raster = raster.map(|state| {
            let previous = ctx.rasterizer_state();
            ctx.set_rasterizer_state(Some(state));
            previous
        });
        let saved_depth = depth.map(|state| {
            let previous = ctx.depth_stencil_state();
            ctx.set_depth_stencil_state(Some(state));
            previous
        });
        Self {
            raster: saved_raster,
            depth: saved_depth,
        }
    }

    pub fn restore(self, ctx: &mut B::Context) {
        if let Some(previous) = self.raster {
            ctx.set_rasterizer_state(previous.as_ref());
        }
        if let Some(previous) = self.depth {
            ctx.set_depth_stencil_state(previous.as_ref());
        }
    }
}
