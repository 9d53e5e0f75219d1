// src/engine.rs
//! Engine: owns the codex, the camera and lighting blocks, and both renderers.
//!
//! Load order is textures, shaders, meshes, materials, then renderers.
//! Teardown is the reverse: renderers first, the codex last.

use std::time::Instant;

use log::{debug, info, warn};

use crate::camera::{Camera, CameraBuffer};
use crate::components::{Entity, Transform};
use crate::config::{AssetPaths, EngineConfig};
use crate::context::{Context, OptionContext};
use crate::error::{Error, ResourceKind, Result};
use crate::gpu::Backend;
use crate::hash::{MeshId, ShaderId};
use crate::lighting::{Lighting, LightingBuffer};
use crate::materials::{Material, MaterialId};
use crate::renderer::{DrawStats, EntityHandle, EntityRenderer};
use crate::resource_manager::Codex;
use crate::scene::SceneDescription;
use crate::skybox::SkyRenderer;

#[derive(Debug)]
pub struct Engine<B: Backend> {
    assets: AssetPaths,
    scene: SceneDescription,
    codex: Codex<B>,
    camera: Camera,
    camera_buffer: CameraBuffer<B>,
    lighting: Lighting,
    lighting_buffer: LightingBuffer<B>,
    entities: EntityRenderer<B>,
    handles: Vec<EntityHandle>,
    sky: Option<SkyRenderer<B>>,
}

/// Populate a codex with everything `scene` needs, in dependency order.
pub fn load_codex<B: Backend>(device: &B::Device, assets: &AssetPaths, scene: &SceneDescription) -> Result<Codex<B>> {
    let started = Instant::now();
    let mut codex = Codex::new();

    let textures = codex.load_texture_directory(&assets.textures, device)?;
    let shaders = codex.load_shader_directory(&assets.shaders, device)?;
    debug!("Loaded {textures} textures and {shaders} shaders");

    for entry in &scene.meshes {
        let layout = codex
            .vertex_shader(ShaderId::from_name(&entry.vertex_shader))
            .with_context(|| format!("mesh `{}` uses unknown vertex shader `{}`", entry.file, entry.vertex_shader))?
            .layout
            .clone();
        codex
            .add_mesh_from_file(&assets.models.join(&entry.file), &layout, device)
            .with_context(|| format!("loading mesh `{}`", entry.file))?;
    }

    for desc in &scene.materials {
        let material = Material::new(device, desc).with_context(|| format!("creating material `{}`", desc.name))?;
        codex.push_material(material);
    }

    info!(
        "Codex loaded in {:.1} ms: {} meshes, {} vertex / {} pixel shaders, {} texture sets, {} materials",
        started.elapsed().as_secs_f64() * 1000.0,
        codex.mesh_count(),
        codex.vertex_shader_count(),
        codex.pixel_shader_count(),
        codex.texture_count(),
        codex.material_count()
    );
    Ok(codex)
}

fn lookup_material<B: Backend>(codex: &Codex<B>, name: &str) -> Result<MaterialId> {
    codex.material_id(name).ok_or_else(|| {
        Error::NotFound { kind: ResourceKind::Material, id: crate::hash::hash_str(name) }.context(format!("material `{name}`"))
    })
}

fn lookup_mesh<B: Backend>(codex: &Codex<B>, file: &str) -> Result<MeshId> {
    let id = MeshId::from_name(file);
    match codex.mesh(id) {
        Some(_) => Ok(id),
        None => Err(Error::NotFound { kind: ResourceKind::Mesh, id: id.raw() }.context(format!("mesh `{file}`"))),
    }
}

impl<B: Backend> Engine<B> {
    pub fn load(device: &B::Device, config: &EngineConfig, scene: SceneDescription) -> Result<Self> {
        info!("Loading scene: {} entities", scene.entities.len());
        let codex = load_codex(device, &config.assets, &scene)?;

        let aspect = config.window.width as f32 / config.window.height.max(1) as f32;
        let start = scene.camera;
        let camera = Camera::new(start.position, start.yaw, start.pitch, start.fovy, aspect);
        let camera_buffer = CameraBuffer::populate(device, &camera)?;
        let lighting = scene.lighting;
        let lighting_buffer = LightingBuffer::populate(device, &lighting)?;

        let mut entities = EntityRenderer::new();
        let mut handles = Vec::with_capacity(scene.entities.len());
        for entry in &scene.entities {
            let mesh = lookup_mesh(&codex, &entry.mesh)?;
            let material = lookup_material(&codex, &entry.material)?;
            let entity = Entity::new(entry.transform, mesh, material).spinning(entry.angular_velocity);
            let handle = if entry.instanced { entities.add(entity)? } else { entities.add_single(entity)? };
            handles.push(handle);
        }
        entities.init(device)?;

        let sky = match &scene.sky {
            Some(entry) => {
                let mesh = lookup_mesh(&codex, &entry.mesh)?;
                let material = lookup_material(&codex, &entry.material)?;
                Some(SkyRenderer::init(device, &codex, mesh, material)?)
            }
            None => None,
        };

        info!("Engine ready");
        Ok(Self {
            assets: config.assets.clone(),
            scene,
            codex,
            camera,
            camera_buffer,
            lighting,
            lighting_buffer,
            entities,
            handles,
            sky,
        })
    }

    #[inline]
    pub fn codex(&self) -> &Codex<B> {
        &self.codex
    }

    #[inline]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    #[inline]
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    #[inline]
    pub fn lighting_mut(&mut self) -> &mut Lighting {
        &mut self.lighting
    }

    #[inline]
    pub fn entities(&self) -> &EntityRenderer<B> {
        &self.entities
    }

    /// Transform of the `index`-th entity of the scene description.
    pub fn entity_transform_mut(&mut self, index: usize) -> Option<&mut Transform> {
        let handle = *self.handles.get(index)?;
        Some(self.entities.transform_mut(handle))
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.camera.set_aspect(width, height);
    }

    pub fn update(&mut self, dt: f32) {
        self.entities.update(dt);
    }

    /// Record one frame: shared constants, entity batches, then the sky.
    pub fn draw(&self, ctx: &mut B::Context) -> Result<DrawStats> {
        self.camera_buffer.upload(ctx, &self.camera)?;
        self.lighting_buffer.upload(ctx, &self.lighting, self.camera.position)?;

        self.entities.upload(ctx)?;
        let mut stats = self.entities.draw(ctx, &self.codex)?;

        if let Some(sky) = &self.sky {
            self.camera_buffer.upload_for_sky(ctx, &self.camera)?;
            stats += sky.draw(ctx, &self.codex)?;
        }
        Ok(stats)
    }

    /// Rebuild every GPU handle on `device` after a device loss. CPU state
    /// (camera, lighting, entity transforms) carries over.
    pub fn recover(&mut self, device: &B::Device) -> Result<()> {
        warn!("Recovering from device loss");
        self.entities.on_device_lost();
        if let Some(sky) = &mut self.sky {
            sky.on_device_lost();
        }

        let codex = load_codex(device, &self.assets, &self.scene).context("reloading codex")?;
        std::mem::replace(&mut self.codex, codex).shutdown();

        self.camera_buffer = CameraBuffer::populate(device, &self.camera)?;
        self.lighting_buffer = LightingBuffer::populate(device, &self.lighting)?;
        self.entities.on_device_restored(device)?;
        if let Some(sky) = &mut self.sky {
            sky.on_device_restored(device)?;
        }
        info!("Device resources restored");
        Ok(())
    }

    pub fn shutdown(self) {
        info!("Shutting down engine");
        self.entities.shutdown();
        drop(self.sky);
        self.codex.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use glam::Vec3;

    use super::*;
    use crate::gpu::headless::{HeadlessBackend, HeadlessContext, HeadlessDevice};
    use crate::gpu::{CullMode, CAMERA_SLOT};
    use crate::camera::CameraUniform;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.assets = config.assets.rooted_at(Path::new(env!("CARGO_MANIFEST_DIR")));
        config
    }

    #[test]
    fn test_demo_frame() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let mut engine = Engine::<HeadlessBackend>::load(&device, &config(), SceneDescription::lunar_demo()).unwrap();
        assert_eq!(engine.codex().material_count(), 4);
        assert_eq!(engine.entities().batches().len(), 2);

        engine.update(1.0 / 60.0);
        let stats = engine.draw(&mut ctx).unwrap();
        // two batches, two single draws, the sky
        assert_eq!(stats.draw_calls, 5);
        assert_eq!(stats.instances, 25 + 2 + 1);

        let draws: Vec<_> = ctx.draws().collect();
        let sky = draws.last().unwrap();
        assert_eq!(sky.pixel_shader.as_deref(), Some("SkyPS.wgsl"));
        assert_eq!(sky.rasterizer.unwrap().cull, CullMode::Front);

        // entities see the regular camera, the sky the translation-free one
        let first: CameraUniform = bytemuck::pod_read_unaligned(draws[0].vs_constants[CAMERA_SLOT as usize].as_ref().unwrap());
        let last: CameraUniform = bytemuck::pod_read_unaligned(sky.vs_constants[CAMERA_SLOT as usize].as_ref().unwrap());
        assert_eq!(last.view_proj, engine.camera().sky_view_proj().to_cols_array_2d());
        assert_ne!(first.view_proj, last.view_proj);
    }

    #[test]
    fn test_unknown_material_fails_load() {
        let device = HeadlessDevice::new();
        let mut scene = SceneDescription::lunar_demo();
        scene.entities[0].material = "missing".to_string();
        let err = Engine::<HeadlessBackend>::load(&device, &config(), scene).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_missing_asset_directory_fails_load() {
        let device = HeadlessDevice::new();
        let mut config = config();
        config.assets.shaders = config.assets.shaders.join("does-not-exist");
        let err = Engine::<HeadlessBackend>::load(&device, &config, SceneDescription::lunar_demo()).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_recover_keeps_entity_state() {
        let lost = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let mut engine = Engine::<HeadlessBackend>::load(&lost, &config(), SceneDescription::lunar_demo()).unwrap();
        engine.entity_transform_mut(0).unwrap().position = Vec3::new(7.0, 7.0, 7.0);
        engine.update(0.5);
        let before = engine.entities().batches()[0].world_matrices().to_vec();

        let fresh = HeadlessDevice::new();
        engine.recover(&fresh).unwrap();
        assert_eq!(lost.live_buffers(), 0);
        assert_eq!(engine.entities().batches()[0].world_matrices(), before.as_slice());
        assert_eq!(engine.draw(&mut ctx).unwrap().draw_calls, 5);
        engine.shutdown();
        assert_eq!(fresh.live_buffers(), 0);
    }
}
