// src/gpu/headless.rs
//! CPU-only backend.
//!
//! Buffers keep their bytes in memory, every context call is appended to a
//! command log and each draw captures a snapshot of the bound state. Nothing is
//! rasterised. Used by tests and by tools that only need to validate assets.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use super::{
    Backend, BufferDesc, BufferKind, DepthStencilDesc, IndexFormat, RasterizerDesc, RenderContext, RenderDevice,
    SamplerDesc, ShaderStage, VertexStream, MAX_CONSTANT_BUFFER_BYTES, MAX_CONSTANT_BUFFER_SLOTS, TEXTURE_SLOT_COUNT,
};
use crate::error::{Error, Result};
use crate::shader_reflect::ShaderProgram;
use crate::texture::{TextureData, TextureDimension, TextureFormat};
use crate::vertex_layout::{ReflectedInput, VertexBufferDescription};

#[derive(Debug)]
pub struct HeadlessBackend;

impl Backend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type VertexShader = HeadlessShader;
    type PixelShader = HeadlessShader;
    type InputLayout = HeadlessInputLayout;
    type TextureView = HeadlessTexture;
    type Sampler = HeadlessSampler;
    type RasterizerState = HeadlessRasterizerState;
    type DepthStencilState = HeadlessDepthStencilState;
    type Device = HeadlessDevice;
    type Context = HeadlessContext;
}

// -----------------------------------------------------------------------------
// Resources
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct BufferInner {
    id: u64,
    label: String,
    kind: BufferKind,
    data: Mutex<Vec<u8>>,
    live: Arc<AtomicUsize>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessBuffer(Arc<BufferInner>);

impl HeadlessBuffer {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn kind(&self) -> BufferKind {
        self.0.kind
    }

    pub fn size(&self) -> usize {
        self.0.data.lock().len()
    }

    /// Copy of the current contents.
    pub fn read(&self) -> Vec<u8> {
        self.0.data.lock().clone()
    }
}

impl PartialEq for HeadlessBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

#[derive(Debug)]
pub struct ShaderInfo {
    pub id: u64,
    pub name: String,
    pub stage: ShaderStage,
    pub entry_point: String,
    pub inputs: Vec<ReflectedInput>,
}

#[derive(Debug, Clone)]
pub struct HeadlessShader(Arc<ShaderInfo>);

impl HeadlessShader {
    pub fn info(&self) -> &ShaderInfo {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessInputLayout {
    id: u64,
    layout: Arc<VertexBufferDescription>,
}

impl HeadlessInputLayout {
    pub fn layout(&self) -> &VertexBufferDescription {
        &self.layout
    }
}

#[derive(Debug)]
pub struct TextureInfo {
    pub id: u64,
    pub label: String,
    pub format: TextureFormat,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
}

#[derive(Debug, Clone)]
pub struct HeadlessTexture(Arc<TextureInfo>);

impl HeadlessTexture {
    pub fn info(&self) -> &TextureInfo {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessSampler {
    id: u64,
    pub desc: SamplerDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessRasterizerState {
    id: u64,
    pub desc: RasterizerDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessDepthStencilState {
    id: u64,
    pub desc: DepthStencilDesc,
}

// -----------------------------------------------------------------------------
// Device
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct HeadlessDevice {
    next_id: AtomicU64,
    live_buffers: Arc<AtomicUsize>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Buffers still referenced by at least one handle.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }
}

impl RenderDevice<HeadlessBackend> for HeadlessDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>, contents: Option<&[u8]>) -> Result<HeadlessBuffer> {
        if desc.size == 0 {
            return Err(Error::Gpu(format!("buffer `{}` has zero size", desc.label)));
        }
        if desc.kind == BufferKind::Constant && desc.size > MAX_CONSTANT_BUFFER_BYTES {
            return Err(Error::Gpu(format!(
                "constant buffer `{}` is {} bytes, limit {}",
                desc.label, desc.size, MAX_CONSTANT_BUFFER_BYTES
            )));
        }
        let mut data = vec![0u8; desc.size as usize];
        if let Some(contents) = contents {
            if contents.len() > data.len() {
                return Err(Error::Gpu(format!("initial data overflows buffer `{}`", desc.label)));
            }
            data[..contents.len()].copy_from_slice(contents);
        }
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        Ok(HeadlessBuffer(Arc::new(BufferInner {
            id: self.alloc_id(),
            label: desc.label.to_string(),
            kind: desc.kind,
            data: Mutex::new(data),
            live: self.live_buffers.clone(),
        })))
    }

    fn create_vertex_shader(&self, program: &ShaderProgram) -> Result<HeadlessShader> {
        self.create_shader(program, ShaderStage::Vertex)
    }

    fn create_pixel_shader(&self, program: &ShaderProgram) -> Result<HeadlessShader> {
        self.create_shader(program, ShaderStage::Pixel)
    }

    fn create_input_layout(
        &self,
        shader: &HeadlessShader,
        layout: &VertexBufferDescription,
    ) -> Result<HeadlessInputLayout> {
        let streams = std::iter::once(&layout.per_vertex).chain(layout.per_instance.as_ref());
        for element in streams.flat_map(|s| s.elements.iter()) {
            if !shader.0.inputs.iter().any(|i| i.location == element.location) {
                return Err(Error::Gpu(format!(
                    "input layout element {} at location {} is not in the signature of `{}`",
                    element.semantic_name, element.location, shader.0.name
                )));
            }
        }
        Ok(HeadlessInputLayout {
            id: self.alloc_id(),
            layout: Arc::new(layout.clone()),
        })
    }

    fn create_texture(&self, label: &str, data: &TextureData) -> Result<HeadlessTexture> {
        if data.data.len() < data.expected_len() {
            return Err(Error::Gpu(format!(
                "texture `{label}` has {} bytes, needs {}",
                data.data.len(),
                data.expected_len()
            )));
        }
        Ok(HeadlessTexture(Arc::new(TextureInfo {
            id: self.alloc_id(),
            label: label.to_string(),
            format: data.format,
            dimension: data.dimension,
            width: data.width,
            height: data.height,
            layers: data.layers,
            mip_levels: data.mip_levels,
        })))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<HeadlessSampler> {
        Ok(HeadlessSampler { id: self.alloc_id(), desc: *desc })
    }

    fn create_rasterizer_state(&self, desc: &RasterizerDesc) -> Result<HeadlessRasterizerState> {
        Ok(HeadlessRasterizerState { id: self.alloc_id(), desc: *desc })
    }

    fn create_depth_stencil_state(&self, desc: &DepthStencilDesc) -> Result<HeadlessDepthStencilState> {
        Ok(HeadlessDepthStencilState { id: self.alloc_id(), desc: *desc })
    }
}

impl HeadlessDevice {
    fn create_shader(&self, program: &ShaderProgram, stage: ShaderStage) -> Result<HeadlessShader> {
        if program.stage != stage {
            return Err(Error::shader(
                &program.name,
                format!("compiled as {stage:?} but reflected as {:?}", program.stage),
            ));
        }
        Ok(HeadlessShader(Arc::new(ShaderInfo {
            id: self.alloc_id(),
            name: program.name.clone(),
            stage,
            entry_point: program.entry_point.clone(),
            inputs: program.inputs.clone(),
        })))
    }
}

// -----------------------------------------------------------------------------
// Context
// -----------------------------------------------------------------------------

/// State captured at a draw call.
#[derive(Debug, Clone)]
pub struct DrawCall {
    pub index_count: u32,
    /// `None` for a non-instanced draw.
    pub instance_count: Option<u32>,
    pub start_index: u32,
    pub base_vertex: i32,
    pub start_instance: u32,
    pub vertex_buffers: Vec<Option<(HeadlessBuffer, u32)>>,
    pub index_buffer: Option<HeadlessBuffer>,
    pub vertex_shader: Option<String>,
    pub pixel_shader: Option<String>,
    pub vs_constants: Vec<Option<Vec<u8>>>,
    pub ps_constants: Vec<Option<Vec<u8>>>,
    pub textures: Vec<Option<String>>,
    pub rasterizer: Option<RasterizerDesc>,
    pub depth_stencil: Option<DepthStencilDesc>,
}

#[derive(Debug, Clone)]
pub enum Command {
    WriteDiscard { buffer: u64, len: usize },
    SetVertexBuffers { start_slot: u32, buffers: Vec<(u64, u32)> },
    SetIndexBuffer { buffer: u64 },
    SetInputLayout { layout: u64 },
    SetVertexShader { name: String },
    SetPixelShader { name: String },
    SetConstantBuffer { stage: ShaderStage, slot: u32, buffer: u64 },
    SetShaderResources { start_slot: u32, count: usize },
    SetSampler { slot: u32, sampler: u64 },
    SetRasterizerState(Option<RasterizerDesc>),
    SetDepthStencilState(Option<DepthStencilDesc>),
    Draw(Box<DrawCall>),
}

#[derive(Debug, Default)]
pub struct HeadlessContext {
    commands: Vec<Command>,
    vertex_buffers: Vec<Option<(HeadlessBuffer, u32)>>,
    index_buffer: Option<HeadlessBuffer>,
    input_layout: Option<HeadlessInputLayout>,
    vertex_shader: Option<HeadlessShader>,
    pixel_shader: Option<HeadlessShader>,
    vs_constants: [Option<HeadlessBuffer>; MAX_CONSTANT_BUFFER_SLOTS as usize],
    ps_constants: [Option<HeadlessBuffer>; MAX_CONSTANT_BUFFER_SLOTS as usize],
    textures: [Option<HeadlessTexture>; TEXTURE_SLOT_COUNT],
    sampler: Option<HeadlessSampler>,
    rasterizer: Option<HeadlessRasterizerState>,
    depth_stencil: Option<HeadlessDepthStencilState>,
}

impl HeadlessContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn draws(&self) -> impl Iterator<Item = &DrawCall> {
        self.commands.iter().filter_map(|c| match c {
            Command::Draw(call) => Some(call.as_ref()),
            _ => None,
        })
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn input_layout(&self) -> Option<&HeadlessInputLayout> {
        self.input_layout.as_ref()
    }

    pub fn sampler_bound(&self) -> bool {
        self.sampler.is_some()
    }

    fn snapshot(
        &self,
        index_count: u32,
        instance_count: Option<u32>,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> DrawCall {
        let read_all = |slots: &[Option<HeadlessBuffer>]| -> Vec<Option<Vec<u8>>> {
            slots.iter().map(|b| b.as_ref().map(HeadlessBuffer::read)).collect()
        };
        DrawCall {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
            vertex_buffers: self.vertex_buffers.clone(),
            index_buffer: self.index_buffer.clone(),
            vertex_shader: self.vertex_shader.as_ref().map(|s| s.0.name.clone()),
            pixel_shader: self.pixel_shader.as_ref().map(|s| s.0.name.clone()),
            vs_constants: read_all(&self.vs_constants),
            ps_constants: read_all(&self.ps_constants),
            textures: self.textures.iter().map(|t| t.as_ref().map(|t| t.0.label.clone())).collect(),
            rasterizer: self.rasterizer.as_ref().map(|r| r.desc),
            depth_stencil: self.depth_stencil.as_ref().map(|d| d.desc),
        }
    }
}

impl RenderContext<HeadlessBackend> for HeadlessContext {
    fn write_discard(&mut self, buffer: &HeadlessBuffer, data: &[u8]) -> Result<()> {
        if matches!(buffer.kind(), BufferKind::Vertex | BufferKind::Index) {
            return Err(Error::Gpu(format!("buffer `{}` is immutable", buffer.label())));
        }
        let mut contents = buffer.0.data.lock();
        if data.len() > contents.len() {
            return Err(Error::Gpu(format!(
                "write of {} bytes overflows buffer `{}` ({} bytes)",
                data.len(),
                buffer.label(),
                contents.len()
            )));
        }
        contents[..data.len()].copy_from_slice(data);
        drop(contents);
        self.commands.push(Command::WriteDiscard { buffer: buffer.id(), len: data.len() });
        Ok(())
    }

    fn set_vertex_buffers(&mut self, start_slot: u32, streams: &[VertexStream<'_, HeadlessBackend>]) {
        let end = start_slot as usize + streams.len();
        if self.vertex_buffers.len() < end {
            self.vertex_buffers.resize(end, None);
        }
        for (i, stream) in streams.iter().enumerate() {
            self.vertex_buffers[start_slot as usize + i] = Some((stream.buffer.clone(), stream.stride));
        }
        self.commands.push(Command::SetVertexBuffers {
            start_slot,
            buffers: streams.iter().map(|s| (s.buffer.id(), s.stride)).collect(),
        });
    }

    fn set_index_buffer(&mut self, buffer: &HeadlessBuffer, format: IndexFormat) {
        debug_assert_eq!(format, IndexFormat::Uint32);
        self.index_buffer = Some(buffer.clone());
        self.commands.push(Command::SetIndexBuffer { buffer: buffer.id() });
    }

    fn set_input_layout(&mut self, layout: &HeadlessInputLayout) {
        self.input_layout = Some(layout.clone());
        self.commands.push(Command::SetInputLayout { layout: layout.id });
    }

    fn set_vertex_shader(&mut self, shader: &HeadlessShader) {
        self.vertex_shader = Some(shader.clone());
        self.commands.push(Command::SetVertexShader { name: shader.0.name.clone() });
    }

    fn set_pixel_shader(&mut self, shader: &HeadlessShader) {
        self.pixel_shader = Some(shader.clone());
        self.commands.push(Command::SetPixelShader { name: shader.0.name.clone() });
    }

    fn set_constant_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: &HeadlessBuffer) {
        let table = match stage {
            ShaderStage::Vertex => &mut self.vs_constants,
            ShaderStage::Pixel => &mut self.ps_constants,
        };
        let Some(entry) = table.get_mut(slot as usize) else {
            error!("constant buffer slot {slot} out of range");
            return;
        };
        *entry = Some(buffer.clone());
        self.commands.push(Command::SetConstantBuffer { stage, slot, buffer: buffer.id() });
    }

    fn set_shader_resources(&mut self, start_slot: u32, views: &[Option<HeadlessTexture>]) {
        for (i, view) in views.iter().enumerate() {
            match self.textures.get_mut(start_slot as usize + i) {
                Some(entry) => *entry = view.clone(),
                None => error!("texture slot {} out of range", start_slot as usize + i),
            }
        }
        self.commands.push(Command::SetShaderResources { start_slot, count: views.len() });
    }

    fn set_sampler(&mut self, slot: u32, sampler: &HeadlessSampler) {
        self.sampler = Some(sampler.clone());
        self.commands.push(Command::SetSampler { slot, sampler: sampler.id });
    }

    fn rasterizer_state(&self) -> Option<HeadlessRasterizerState> {
        self.rasterizer.clone()
    }

    fn set_rasterizer_state(&mut self, state: Option<&HeadlessRasterizerState>) {
        self.rasterizer = state.cloned();
        self.commands.push(Command::SetRasterizerState(state.map(|s| s.desc)));
    }

    fn depth_stencil_state(&self) -> Option<HeadlessDepthStencilState> {
        self.depth_stencil.clone()
    }

    fn set_depth_stencil_state(&mut self, state: Option<&HeadlessDepthStencilState>) {
        self.depth_stencil = state.cloned();
        self.commands.push(Command::SetDepthStencilState(state.map(|s| s.desc)));
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        let call = self.snapshot(index_count, None, start_index, base_vertex, 0);
        self.commands.push(Command::Draw(Box::new(call)));
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        let call = self.snapshot(index_count, Some(instance_count), start_index, base_vertex, start_instance);
        self.commands.push(Command::Draw(Box::new(call)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(kind: BufferKind, size: u64) -> BufferDesc<'static> {
        BufferDesc { label: "test", kind, size }
    }

    #[test]
    fn test_buffer_readback_and_discard() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let buffer = device.create_buffer(&desc(BufferKind::DynamicVertex, 8), None).unwrap();
        ctx.write_discard(&buffer, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.read(), vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(ctx.write_discard(&buffer, &[0; 9]).is_err());
    }

    #[test]
    fn test_immutable_buffers_reject_writes() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let buffer = device.create_buffer(&desc(BufferKind::Vertex, 4), Some(&[9, 9, 9, 9])).unwrap();
        assert!(ctx.write_discard(&buffer, &[0]).is_err());
        assert_eq!(buffer.read(), vec![9; 4]);
    }

    #[test]
    fn test_constant_buffers_are_capped() {
        let device = HeadlessDevice::new();
        assert!(device.create_buffer(&desc(BufferKind::Constant, 256), None).is_ok());
        assert!(device.create_buffer(&desc(BufferKind::Constant, 257), None).is_err());
    }

    #[test]
    fn test_live_buffer_count_follows_handles() {
        let device = HeadlessDevice::new();
        let a = device.create_buffer(&desc(BufferKind::Index, 4), None).unwrap();
        let b = a.clone();
        assert_eq!(device.live_buffers(), 1);
        drop(a);
        assert_eq!(device.live_buffers(), 1);
        drop(b);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_draw_snapshots_bound_state() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let cb = device.create_buffer(&desc(BufferKind::Constant, 16), None).unwrap();
        ctx.write_discard(&cb, &[7; 16]).unwrap();
        ctx.set_constant_buffer(ShaderStage::Pixel, 1, &cb);
        ctx.draw_indexed_instanced(36, 4, 0, 0, 0);
        ctx.write_discard(&cb, &[0; 16]).unwrap();

        let draw = ctx.draws().next().unwrap();
        assert_eq!(draw.index_count, 36);
        assert_eq!(draw.instance_count, Some(4));
        assert_eq!(draw.ps_constants[1].as_deref(), Some(&[7u8; 16][..]));
        assert!(draw.vs_constants.iter().all(Option::is_none));
    }
}
