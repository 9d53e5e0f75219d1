// src/skybox.rs
//! Sky renderer: the cube mesh drawn from the inside with a cube texture.
//!
//! Drawn last. The material carries front-face culling and a `LessEqual`
//! depth test without depth writes; the camera buffer must hold the
//! translation-free view-projection before [`SkyRenderer::draw`] runs.

use log::{debug, error};

use crate::constant_buffer::ConstantBuffer;
use crate::error::{Error, Result};
use crate::gpu::{Backend, CompareFunction, CullMode, DepthStencilDesc, RasterizerDesc, RenderContext};
use crate::hash::MeshId;
use crate::materials::{MaterialId, MaterialParams, PipelineOverrides};
use crate::renderer::{material_constants, DrawStats, ResolvedDraw};
use crate::resource_manager::Codex;
use crate::texture::TextureSlot;

/// Pipeline overrides every sky material uses.
pub fn sky_overrides() -> PipelineOverrides {
    PipelineOverrides {
        rasterizer: Some(RasterizerDesc { cull: CullMode::Front, ..Default::default() }),
        depth_stencil: Some(DepthStencilDesc {
            depth_test: true,
            depth_write: false,
            compare: CompareFunction::LessEqual,
        }),
    }
}

#[derive(Debug)]
pub struct SkyRenderer<B: Backend> {
    mesh: MeshId,
    material: MaterialId,
    material_constants: Option<ConstantBuffer<B, MaterialParams>>,
}

impl<B: Backend> SkyRenderer<B> {
    pub fn init(device: &B::Device, codex: &Codex<B>, mesh: MeshId, material: MaterialId) -> Result<Self> {
        let Some(record) = codex.material(material) else {
            return Err(Error::custom(format!("sky material {} is not registered", material.0)));
        };
        let has_cube = record
            .textures
            .and_then(|id| codex.texture(id))
            .is_some_and(|chord| chord.get(TextureSlot::Cube).is_some());
        if !has_cube {
            error!("Sky material `{}` has no cube texture; the sky will sample the fallback", record.name);
        }
        debug!("Sky renderer ready: mesh {mesh}, material `{}`", record.name);
        Ok(Self {
            mesh,
            material,
            material_constants: Some(material_constants(device)?),
        })
    }

    pub fn draw(&self, ctx: &mut B::Context, codex: &Codex<B>) -> Result<DrawStats> {
        let Some(material_constants) = &self.material_constants else {
            return Err(Error::DeviceLost);
        };
        let Some(draw) = ResolvedDraw::resolve(codex, self.mesh, self.material) else {
            return Ok(DrawStats::default());
        };

        draw.bind(ctx, material_constants, None)?;
        let saved = draw.apply_overrides(ctx);
        ctx.draw_indexed(draw.mesh.index_count, 0, 0);
        saved.restore(ctx);
        Ok(DrawStats { draw_calls: 1, instances: 1 })
    }

    pub fn on_device_lost(&mut self) {
        self.material_constants = None;
    }

    pub fn on_device_restored(&mut self, device: &B::Device) -> Result<()> {
        self.material_constants = Some(material_constants(device)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::gpu::headless::{HeadlessBackend, HeadlessContext, HeadlessDevice};
    use crate::gpu::RenderDevice;
    use crate::hash::ShaderId;
    use crate::materials::{Material, MaterialDesc};

    fn assets() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("assets")
    }

    fn sky_codex(device: &HeadlessDevice) -> (Codex<HeadlessBackend>, MeshId, MaterialId) {
        let mut codex = Codex::new();
        codex.load_shader_directory(&assets().join("shaders"), device).unwrap();
        codex.load_texture_directory(&assets().join("textures"), device).unwrap();
        let layout = codex.vertex_shader(ShaderId::from_name("SkyVS.wgsl")).unwrap().layout.clone();
        let mesh = codex.add_mesh_from_file(&assets().join("models/cube.obj"), &layout, device).unwrap();
        let desc = MaterialDesc::new("sky", "SkyVS.wgsl", "SkyPS.wgsl")
            .with_textures("Sky")
            .with_overrides(sky_overrides());
        let material = codex.push_material(Material::<HeadlessBackend>::new(device, &desc).unwrap());
        (codex, mesh, material)
    }

    #[test]
    fn test_sky_draw_uses_overrides_then_restores() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let (codex, mesh, material) = sky_codex(&device);

        let previous = device.create_rasterizer_state(&RasterizerDesc::default()).unwrap();
        ctx.set_rasterizer_state(Some(&previous));

        let sky = SkyRenderer::init(&device, &codex, mesh, material).unwrap();
        assert_eq!(sky.draw(&mut ctx, &codex).unwrap(), DrawStats { draw_calls: 1, instances: 1 });

        let call = ctx.draws().next().unwrap();
        assert_eq!(call.index_count, 36);
        assert_eq!(call.instance_count, None);
        assert_eq!(call.rasterizer.unwrap().cull, CullMode::Front);
        let depth = call.depth_stencil.unwrap();
        assert!(!depth.depth_write);
        assert_eq!(depth.compare, CompareFunction::LessEqual);
        assert!(call.textures[TextureSlot::Cube.index()].is_some());

        assert_eq!(ctx.rasterizer_state(), Some(previous));
        assert!(ctx.depth_stencil_state().is_none());
    }

    #[test]
    fn test_unknown_sky_material_is_an_error() {
        let device = HeadlessDevice::new();
        let (codex, mesh, _) = sky_codex(&device);
        assert!(SkyRenderer::init(&device, &codex, mesh, MaterialId(42)).is_err());
    }

    #[test]
    fn test_sky_survives_device_loss() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let (codex, mesh, material) = sky_codex(&device);
        let mut sky = SkyRenderer::init(&device, &codex, mesh, material).unwrap();
        sky.on_device_lost();
        assert!(sky.draw(&mut ctx, &codex).unwrap_err().is_device_lost());
        sky.on_device_restored(&device).unwrap();
        assert!(sky.draw(&mut ctx, &codex).is_ok());
    }
}
