// src/materials/mod.rs
//! Materials: a vertex/pixel shader pair, an optional texture set, optional
//! pipeline-state overrides and a small parameter block uploaded per draw.
//!
//! Shaders and textures are referenced by registry id, never owned. The
//! override state objects are owned by the material.

use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::gpu::{Backend, DepthStencilDesc, RasterizerDesc, RenderDevice};
use crate::hash::{ShaderId, TextureId};

/// Dense index of a material in the registry. Returned by
/// [`Codex::push_material`](crate::resource_manager::Codex::push_material).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

impl MaterialId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-draw parameter block, bound at pixel slot 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialParams {
    pub color_tint: [f32; 4],
    pub specular_power: f32,
    pub _pad: [f32; 3],
}

impl MaterialParams {
    pub fn new(color_tint: [f32; 4], specular_power: f32) -> Self {
        Self { color_tint, specular_power, _pad: [0.0; 3] }
    }
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self::new([1.0; 4], 32.0)
    }
}

/// Pipeline state a material swaps in for its own draws.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineOverrides {
    pub rasterizer: Option<RasterizerDesc>,
    pub depth_stencil: Option<DepthStencilDesc>,
}

impl PipelineOverrides {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rasterizer.is_none() && self.depth_stencil.is_none()
    }
}

/// Backend-independent material description.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDesc {
    pub name: String,
    pub vertex_shader: ShaderId,
    pub pixel_shader: ShaderId,
    pub textures: Option<TextureId>,
    pub params: MaterialParams,
    pub overrides: PipelineOverrides,
}

impl MaterialDesc {
    pub fn new(name: &str, vertex_shader: &str, pixel_shader: &str) -> Self {
        Self {
            name: name.to_string(),
            vertex_shader: ShaderId::from_name(vertex_shader),
            pixel_shader: ShaderId::from_name(pixel_shader),
            textures: None,
            params: MaterialParams::default(),
            overrides: PipelineOverrides::default(),
        }
    }

    pub fn with_textures(mut self, logical_name: &str) -> Self {
        self.textures = Some(TextureId::from_name(logical_name));
        self
    }

    pub fn with_params(mut self, params: MaterialParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_overrides(mut self, overrides: PipelineOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// A material with its override state objects created on a device.
#[derive(Debug)]
pub struct Material<B: Backend> {
    pub name: String,
    pub vertex_shader: ShaderId,
    pub pixel_shader: ShaderId,
    pub textures: Option<TextureId>,
    pub params: MaterialParams,
    pub rasterizer: Option<B::RasterizerState>,
    pub depth_stencil: Option<B::DepthStencilState>,
}

impl<B: Backend> Material<B> {
    pub fn new(device: &B::Device, desc: &MaterialDesc) -> Result<Self> {
        let rasterizer = desc
            .overrides
            .rasterizer
            .map(|r| device.create_rasterizer_state(&r))
            .transpose()?;
        let depth_stencil = desc
            .overrides
            .depth_stencil
            .map(|d| device.create_depth_stencil_state(&d))
            .transpose()?;
        Ok(Self {
            name: desc.name.clone(),
            vertex_shader: desc.vertex_shader,
            pixel_shader: desc.pixel_shader,
            textures: desc.textures,
            params: desc.params,
            rasterizer,
            depth_stencil,
        })
    }

    #[inline]
    pub fn has_overrides(&self) -> bool {
        self.rasterizer.is_some() || self.depth_stencil.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessBackend, HeadlessDevice};
    use crate::gpu::CullMode;

    #[test]
    fn test_params_block_is_32_bytes() {
        assert_eq!(std::mem::size_of::<MaterialParams>(), 32);
    }

    #[test]
    fn test_overrides_become_state_objects() {
        let device = HeadlessDevice::new();
        let desc = MaterialDesc::new("MI_Sky", "SkyVS.wgsl", "SkyPS.wgsl").with_overrides(PipelineOverrides {
            rasterizer: Some(RasterizerDesc { cull: CullMode::Front, ..Default::default() }),
            depth_stencil: None,
        });
        let material = Material::<HeadlessBackend>::new(&device, &desc).unwrap();
        assert!(material.has_overrides());
        assert_eq!(material.rasterizer.as_ref().map(|r| r.desc.cull), Some(CullMode::Front));
        assert!(material.depth_stencil.is_none());
        assert_eq!(material.vertex_shader, ShaderId::from_name("SkyVS.wgsl"));
    }
}
