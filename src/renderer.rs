// src/renderer.rs
//! Entity renderer.
//!
//! Entities sharing a (mesh, material) pair become one instanced batch, kept
//! in first-appearance order. Each frame runs three phases in order: update
//! (CPU world matrices), upload (write-discard every batch buffer), draw (one
//! instanced draw per batch, then the non-instanced entities one by one).

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use log::{debug, error, info};

use crate::components::Entity;
use crate::constant_buffer::{Bind, ConstantBuffer};
use crate::error::{Error, Result};
use crate::gpu::{
    Backend, IndexFormat, RenderContext, ShaderStage, StateOverride, VertexStream, DEFAULT_SAMPLER_SLOT,
    MATERIAL_SLOT, TEXTURE_SLOT_COUNT, WORLD_SLOT,
};
use crate::hash::MeshId;
use crate::instancing::{InstancedDrawContext, WORLD_MATRIX_BYTES};
use crate::materials::{Material, MaterialId, MaterialParams};
use crate::resource_manager::{Codex, Mesh, PixelShader, VertexShader};

/// Per-object constants for the non-instanced path.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct WorldUniform {
    pub world: [[f32; 4]; 4],
}

impl WorldUniform {
    pub fn new(world: Mat4) -> Self {
        Self { world: world.to_cols_array_2d() }
    }
}

/// What a draw pass submitted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrawStats {
    pub draw_calls: u32,
    pub instances: u32,
}

impl std::ops::AddAssign for DrawStats {
    fn add_assign(&mut self, rhs: Self) {
        self.draw_calls += rhs.draw_calls;
        self.instances += rhs.instances;
    }
}

/// Where an entity's matrix lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Instanced { batch: usize, instance: usize },
    Single(usize),
}

/// Handle returned by [`EntityRenderer::add`] and [`EntityRenderer::add_single`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(usize);

// ---------- Draw resolution shared with the sky renderer ----------

/// Every registry record one draw needs, looked up and cross-checked.
pub(crate) struct ResolvedDraw<'a, B: Backend> {
    pub mesh: &'a Mesh<B>,
    pub material: &'a Material<B>,
    pub vertex_shader: &'a VertexShader<B>,
    pub pixel_shader: &'a PixelShader<B>,
    textures: Option<&'a crate::resource_manager::ResourceBindChord<B>>,
}

impl<'a, B: Backend> ResolvedDraw<'a, B> {
    /// Look up a draw's records. Missing records are a load-time bug: they
    /// assert in debug builds and are logged and skipped in release.
    pub(crate) fn resolve(codex: &'a Codex<B>, mesh: MeshId, material: MaterialId) -> Option<Self> {
        let Some(mesh_record) = codex.mesh(mesh) else {
            debug_assert!(false, "draw references unknown mesh {mesh}");
            error!("Draw skipped: mesh {mesh} is not in the codex");
            return None;
        };
        let Some(material_record) = codex.material(material) else {
            debug_assert!(false, "draw references unknown material {}", material.0);
            error!("Draw skipped: material {} is not in the codex", material.0);
            return None;
        };
        let Some(vertex_shader) = codex.vertex_shader(material_record.vertex_shader) else {
            error!(
                "Draw skipped: material `{}` uses unknown vertex shader {}",
                material_record.name, material_record.vertex_shader
            );
            return None;
        };
        let Some(pixel_shader) = codex.pixel_shader(material_record.pixel_shader) else {
            error!(
                "Draw skipped: material `{}` uses unknown pixel shader {}",
                material_record.name, material_record.pixel_shader
            );
            return None;
        };
        if mesh_record.stride != vertex_shader.layout.byte_size() {
            error!(
                "Draw skipped: mesh {mesh} stride {} does not match `{}` layout stride {}",
                mesh_record.stride,
                vertex_shader.name,
                vertex_shader.layout.byte_size()
            );
            return None;
        }
        let textures = material_record.textures.and_then(|id| codex.texture(id));
        Some(Self {
            mesh: mesh_record,
            material: material_record,
            vertex_shader,
            pixel_shader,
            textures,
        })
    }

    /// Bind geometry, shaders, material constants, textures and sampler.
    /// `instances` becomes vertex stream 1 when present.
    pub(crate) fn bind(
        &self,
        ctx: &mut B::Context,
        material_constants: &ConstantBuffer<B, MaterialParams>,
        instances: Option<&B::Buffer>,
    ) -> Result<()> {
        match instances {
            Some(instance_buffer) => ctx.set_vertex_buffers(
                0,
                &[
                    VertexStream::new(&self.mesh.vertex_buffer, self.mesh.stride),
                    VertexStream::new(instance_buffer, WORLD_MATRIX_BYTES),
                ],
            ),
            None => ctx.set_vertex_buffers(0, &[VertexStream::new(&self.mesh.vertex_buffer, self.mesh.stride)]),
        }
        ctx.set_index_buffer(&self.mesh.index_buffer, IndexFormat::Uint32);
        ctx.set_input_layout(&self.vertex_shader.input_layout);
        ctx.set_vertex_shader(&self.vertex_shader.shader);
        ctx.set_pixel_shader(&self.pixel_shader.shader);

        material_constants.map_unmap(ctx, &self.material.params)?;
        match self.textures {
            Some(chord) => chord.bind(ctx),
            None => {
                let empty: [Option<B::TextureView>; TEXTURE_SLOT_COUNT] = std::array::from_fn(|_| None);
                ctx.set_shader_resources(0, &empty);
            }
        }
        if let Some(sampler) = &self.pixel_shader.sampler {
            ctx.set_sampler(DEFAULT_SAMPLER_SLOT, sampler);
        }
        Ok(())
    }

    /// Apply the material's pipeline overrides; hand the result back to
    /// [`StateOverride::restore`] once the draw is issued.
    pub(crate) fn apply_overrides(&self, ctx: &mut B::Context) -> StateOverride<B> {
        StateOverride::apply(ctx, self.material.rasterizer.as_ref(), self.material.depth_stencil.as_ref())
    }
}

pub(crate) fn material_constants<B: Backend>(device: &B::Device) -> Result<ConstantBuffer<B, MaterialParams>> {
    ConstantBuffer::populate(device, "material_params", ShaderStage::Pixel, MATERIAL_SLOT, &MaterialParams::default())
}

// ---------- Entity renderer ----------

#[derive(Debug)]
pub struct EntityRenderer<B: Backend> {
    entities: Vec<Entity>,
    placements: Vec<Placement>,
    batches: Vec<InstancedDrawContext<B>>,
    /// Entity indices of the non-instanced path, in insertion order.
    singles: Vec<usize>,
    single_worlds: Vec<Mat4>,
    material_constants: Option<ConstantBuffer<B, MaterialParams>>,
    world_constants: Option<ConstantBuffer<B, WorldUniform>>,
    initialized: bool,
}

impl<B: Backend> Default for EntityRenderer<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> EntityRenderer<B> {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            placements: Vec::new(),
            batches: Vec::new(),
            singles: Vec::new(),
            single_worlds: Vec::new(),
            material_constants: None,
            world_constants: None,
            initialized: false,
        }
    }

    /// Register an entity for instanced drawing. The set is fixed once
    /// [`init`](Self::init) has run.
    pub fn add(&mut self, entity: Entity) -> Result<EntityHandle> {
        self.push(entity, Placement::Instanced { batch: usize::MAX, instance: usize::MAX })
    }

    /// Register an entity drawn with its own non-instanced draw call.
    pub fn add_single(&mut self, entity: Entity) -> Result<EntityHandle> {
        let index = self.singles.len();
        let handle = self.push(entity, Placement::Single(index))?;
        self.singles.push(handle.0);
        self.single_worlds.push(entity.transform.world_matrix());
        Ok(handle)
    }

    fn push(&mut self, entity: Entity, placement: Placement) -> Result<EntityHandle> {
        if self.initialized {
            crate::bail!("entities cannot be added after the renderer is initialized");
        }
        self.entities.push(entity);
        self.placements.push(placement);
        Ok(EntityHandle(self.entities.len() - 1))
    }

    /// Group instanced entities by (mesh, material) and create every batch
    /// buffer plus the shared constant buffers.
    pub fn init(&mut self, device: &B::Device) -> Result<()> {
        if self.initialized {
            crate::bail!("entity renderer initialized twice");
        }

        let mut groups: Vec<((MeshId, MaterialId), Vec<usize>)> = Vec::new();
        for (index, placement) in self.placements.iter().enumerate() {
            if !matches!(placement, Placement::Instanced { .. }) {
                continue;
            }
            let key = (self.entities[index].mesh, self.entities[index].material);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(index),
                None => groups.push((key, vec![index])),
            }
        }

        self.batches.clear();
        for (batch, ((mesh, material), members)) in groups.into_iter().enumerate() {
            let mut context = InstancedDrawContext::new(device, mesh, material, members.len())?;
            for (instance, &entity) in members.iter().enumerate() {
                context.set_world(instance, self.entities[entity].transform.world_matrix());
                self.placements[entity] = Placement::Instanced { batch, instance };
            }
            debug!("Batch {batch}: mesh {mesh}, material {}, {} instances", material.0, members.len());
            self.batches.push(context);
        }

        self.create_constants(device)?;
        self.initialized = true;
        info!(
            "Entity renderer ready: {} entities, {} batches, {} single",
            self.entities.len(),
            self.batches.len(),
            self.singles.len()
        );
        Ok(())
    }

    fn create_constants(&mut self, device: &B::Device) -> Result<()> {
        self.material_constants = Some(material_constants(device)?);
        self.world_constants = Some(ConstantBuffer::populate(
            device,
            "object_world",
            ShaderStage::Vertex,
            WORLD_SLOT,
            &WorldUniform::new(Mat4::IDENTITY),
        )?);
        Ok(())
    }

    #[inline]
    pub fn entity(&self, handle: EntityHandle) -> &Entity {
        &self.entities[handle.0]
    }

    /// Mutable access for moving an entity. Its mesh and material are fixed.
    #[inline]
    pub fn transform_mut(&mut self, handle: EntityHandle) -> &mut crate::components::Transform {
        &mut self.entities[handle.0].transform
    }

    #[inline]
    pub fn batches(&self) -> &[InstancedDrawContext<B>] {
        &self.batches
    }

    #[inline]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Update phase: advance spins and recompute every world matrix.
    pub fn update(&mut self, dt: f32) {
        for (entity, placement) in self.entities.iter_mut().zip(&self.placements) {
            entity.transform.rotate_local(entity.angular_velocity, dt);
            let world = entity.transform.world_matrix();
            match *placement {
                Placement::Instanced { batch, instance } => {
                    if let Some(context) = self.batches.get_mut(batch) {
                        context.set_world(instance, world);
                    }
                }
                Placement::Single(index) => self.single_worlds[index] = world,
            }
        }
    }

    /// Upload phase: write-discard every batch buffer.
    pub fn upload(&self, ctx: &mut B::Context) -> Result<()> {
        for batch in &self.batches {
            batch.upload(ctx)?;
        }
        Ok(())
    }

    /// Draw phase. Batches first, in grouping order, then single entities.
    pub fn draw(&self, ctx: &mut B::Context, codex: &Codex<B>) -> Result<DrawStats> {
        let (Some(material_constants), Some(world_constants)) = (&self.material_constants, &self.world_constants)
        else {
            return Err(Error::DeviceLost);
        };
        let mut stats = DrawStats::default();

        for batch in &self.batches {
            let Some(draw) = ResolvedDraw::resolve(codex, batch.mesh(), batch.material()) else {
                continue;
            };
            if draw.vertex_shader.layout.instance_stride() != WORLD_MATRIX_BYTES {
                error!(
                    "Batch skipped: `{}` does not declare a {WORLD_MATRIX_BYTES}-byte instance stream",
                    draw.vertex_shader.name
                );
                continue;
            }
            let Some(instance_buffer) = batch.buffer() else {
                return Err(Error::DeviceLost);
            };

            draw.bind(ctx, material_constants, Some(instance_buffer))?;
            let saved = draw.apply_overrides(ctx);
            ctx.draw_indexed_instanced(draw.mesh.index_count, batch.instance_count(), 0, 0, 0);
            saved.restore(ctx);

            stats.draw_calls += 1;
            stats.instances += batch.instance_count();
        }

        for (index, &entity) in self.singles.iter().enumerate() {
            let entity = &self.entities[entity];
            let Some(draw) = ResolvedDraw::resolve(codex, entity.mesh, entity.material) else {
                continue;
            };
            if draw.vertex_shader.layout.is_instanced() {
                error!("Single draw skipped: `{}` expects an instance stream", draw.vertex_shader.name);
                continue;
            }

            draw.bind(ctx, material_constants, None)?;
            world_constants.map_unmap(ctx, &WorldUniform::new(self.single_worlds[index]))?;
            let saved = draw.apply_overrides(ctx);
            ctx.draw_indexed(draw.mesh.index_count, 0, 0);
            saved.restore(ctx);

            stats.draw_calls += 1;
            stats.instances += 1;
        }

        Ok(stats)
    }

    /// Drop every GPU buffer this renderer owns. CPU state is kept.
    pub fn on_device_lost(&mut self) {
        for batch in &mut self.batches {
            batch.release_gpu();
        }
        self.material_constants = None;
        self.world_constants = None;
    }

    /// Recreate GPU buffers on a new device. The next upload refills them.
    pub fn on_device_restored(&mut self, device: &B::Device) -> Result<()> {
        for batch in &mut self.batches {
            batch.restore_gpu(device)?;
        }
        self.create_constants(device)
    }

    pub fn shutdown(self) {
        debug!("Entity renderer shut down ({} batches)", self.batches.len());
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use glam::{Quat, Vec3};

    use super::*;
    use crate::components::Transform;
    use crate::gpu::headless::{HeadlessBackend, HeadlessContext, HeadlessDevice};
    use crate::gpu::{CompareFunction, CullMode, DepthStencilDesc, FillMode, RasterizerDesc, RenderDevice};
    use crate::hash::ShaderId;
    use crate::materials::{MaterialDesc, PipelineOverrides};

    type TestCodex = Codex<HeadlessBackend>;

    fn assets() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("assets")
    }

    fn lunar_codex(device: &HeadlessDevice, overrides: PipelineOverrides) -> (TestCodex, MeshId, MaterialId) {
        let mut codex = TestCodex::new();
        codex.load_shader_directory(&assets().join("shaders"), device).unwrap();
        codex.load_texture_directory(&assets().join("textures"), device).unwrap();
        let layout = codex.vertex_shader(ShaderId::from_name("InstancedVS.wgsl")).unwrap().layout.clone();
        let mesh = codex.add_mesh_from_file(&assets().join("models/cube.obj"), &layout, device).unwrap();
        let material = Material::<HeadlessBackend>::new(
            device,
            &MaterialDesc::new("lunar", "InstancedVS.wgsl", "LunarPS.wgsl")
                .with_textures("Lunar")
                .with_overrides(overrides),
        )
        .unwrap();
        let material = codex.push_material(material);
        (codex, mesh, material)
    }

    fn translations() -> [Vec3; 4] {
        [
            Vec3::new(-3.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
        ]
    }

    #[test]
    fn test_grouping_follows_first_appearance() {
        let device = HeadlessDevice::new();
        let a = MeshId::from_name("a.obj");
        let b = MeshId::from_name("b.obj");
        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        for mesh in [a, b, a, a, b] {
            renderer.add(Entity::new(Transform::IDENTITY, mesh, MaterialId(0))).unwrap();
        }
        renderer.add(Entity::new(Transform::IDENTITY, a, MaterialId(1))).unwrap();
        renderer.init(&device).unwrap();

        let batches = renderer.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!((batches[0].mesh(), batches[0].instance_count()), (a, 3));
        assert_eq!((batches[1].mesh(), batches[1].instance_count()), (b, 2));
        assert_eq!((batches[2].material(), batches[2].instance_count()), (MaterialId(1), 1));
        for batch in batches {
            assert_eq!(batch.buffer_size(), batch.instance_count() as u64 * 64);
        }
    }

    #[test]
    fn test_entities_are_fixed_after_init() {
        let device = HeadlessDevice::new();
        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        renderer.add(Entity::new(Transform::IDENTITY, MeshId::from_name("a.obj"), MaterialId(0))).unwrap();
        renderer.init(&device).unwrap();
        assert!(renderer.add(Entity::new(Transform::IDENTITY, MeshId::from_name("a.obj"), MaterialId(0))).is_err());
        assert!(renderer.init(&device).is_err());
    }

    #[test]
    fn test_update_and_upload_match_entity_order() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let mesh = MeshId::from_name("cube.obj");
        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        let handles: Vec<_> = translations()
            .iter()
            .map(|t| {
                let entity = Entity::new(Transform::from_position(*t), mesh, MaterialId(0))
                    .spinning(Vec3::new(0.0, 1.0, 0.0));
                renderer.add(entity).unwrap()
            })
            .collect();
        renderer.init(&device).unwrap();
        renderer.update(0.25);
        renderer.upload(&mut ctx).unwrap();

        let batch = &renderer.batches()[0];
        let readback = batch.buffer().unwrap().read();
        assert_eq!(readback.as_slice(), bytemuck::cast_slice::<_, u8>(batch.world_matrices()));
        for (i, handle) in handles.iter().enumerate() {
            let expected = renderer.entity(*handle).transform.world_matrix().to_cols_array_2d();
            assert_eq!(batch.world_matrices()[i], expected);
            assert!(renderer.entity(*handle).transform.rotation.angle_between(Quat::from_rotation_y(0.25)) < 1e-5);
        }
    }

    #[test]
    fn test_end_to_end_instanced_draw() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let (codex, mesh, material) = lunar_codex(&device, PipelineOverrides::default());

        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        for t in translations() {
            renderer.add(Entity::new(Transform::from_position(t), mesh, material)).unwrap();
        }
        renderer.init(&device).unwrap();
        renderer.update(0.0);
        renderer.upload(&mut ctx).unwrap();
        let stats = renderer.draw(&mut ctx, &codex).unwrap();
        assert_eq!(stats, DrawStats { draw_calls: 1, instances: 4 });

        let draws: Vec<_> = ctx.draws().collect();
        assert_eq!(draws.len(), 1);
        let call = draws[0];
        assert_eq!(call.index_count, 36);
        assert_eq!(call.instance_count, Some(4));
        assert_eq!(call.vertex_shader.as_deref(), Some("InstancedVS.wgsl"));
        assert_eq!(call.pixel_shader.as_deref(), Some("LunarPS.wgsl"));

        let (stream0, stride0) = call.vertex_buffers[0].clone().unwrap();
        assert_eq!(stride0, 32);
        assert_eq!(stream0.size() as u32, 24 * stride0);
        let (instances, stride1) = call.vertex_buffers[1].clone().unwrap();
        assert_eq!(stride1, 64);

        let data = instances.read();
        let worlds: &[[[f32; 4]; 4]] = bytemuck::cast_slice(&data);
        for (world, t) in worlds.iter().zip(translations()) {
            assert_eq!(world[3], [t.x, t.y, t.z, 1.0]);
        }

        let params: MaterialParams = bytemuck::pod_read_unaligned(call.ps_constants[MATERIAL_SLOT as usize].as_ref().unwrap());
        assert_eq!(params.specular_power, MaterialParams::default().specular_power);
        assert!(call.textures[0].is_some());
    }

    #[test]
    fn test_material_override_is_restored() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let no_cull = RasterizerDesc { cull: CullMode::None, ..Default::default() };
        let (codex, mesh, material) =
            lunar_codex(&device, PipelineOverrides { rasterizer: Some(no_cull), depth_stencil: None });

        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        renderer.add(Entity::new(Transform::IDENTITY, mesh, material)).unwrap();
        renderer.init(&device).unwrap();
        renderer.upload(&mut ctx).unwrap();
        renderer.draw(&mut ctx, &codex).unwrap();

        let call = ctx.draws().next().unwrap();
        assert_eq!(call.rasterizer, Some(no_cull));
        assert!(ctx.rasterizer_state().is_none());
        assert!(ctx.depth_stencil_state().is_none());
    }

    #[test]
    fn test_override_restores_previously_bound_states() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let overrides = PipelineOverrides {
            rasterizer: Some(RasterizerDesc { cull: CullMode::None, ..Default::default() }),
            depth_stencil: Some(DepthStencilDesc { depth_test: true, depth_write: false, compare: CompareFunction::LessEqual }),
        };
        let (mut codex, mesh, overridden) = lunar_codex(&device, overrides);
        let plain = codex.push_material(
            Material::<HeadlessBackend>::new(
                &device,
                &MaterialDesc::new("plain", "InstancedVS.wgsl", "LunarPS.wgsl").with_textures("Lunar"),
            )
            .unwrap(),
        );

        let raster = RasterizerDesc { cull: CullMode::Front, fill: FillMode::Solid, front_counter_clockwise: false };
        let depth = DepthStencilDesc { depth_test: true, depth_write: true, compare: CompareFunction::Greater };
        let prior_raster = device.create_rasterizer_state(&raster).unwrap();
        let prior_depth = device.create_depth_stencil_state(&depth).unwrap();
        ctx.set_rasterizer_state(Some(&prior_raster));
        ctx.set_depth_stencil_state(Some(&prior_depth));

        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        renderer.add(Entity::new(Transform::IDENTITY, mesh, overridden)).unwrap();
        renderer.add(Entity::new(Transform::from_position(Vec3::X), mesh, plain)).unwrap();
        renderer.init(&device).unwrap();
        renderer.upload(&mut ctx).unwrap();
        assert_eq!(renderer.draw(&mut ctx, &codex).unwrap().draw_calls, 2);

        let draws: Vec<_> = ctx.draws().collect();
        assert_eq!(draws[0].rasterizer, overrides.rasterizer);
        assert_eq!(draws[0].depth_stencil, overrides.depth_stencil);
        assert_eq!(draws[1].rasterizer, Some(raster));
        assert_eq!(draws[1].depth_stencil, Some(depth));
        assert_eq!(ctx.rasterizer_state(), Some(prior_raster));
        assert_eq!(ctx.depth_stencil_state(), Some(prior_depth));
    }

    #[test]
    fn test_single_entities_get_their_own_draw() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let (mut codex, _, _) = lunar_codex(&device, PipelineOverrides::default());
        let layout = codex.vertex_shader(ShaderId::from_name("SingleVS.wgsl")).unwrap().layout.clone();
        let imported = crate::mesh_import::ImportedMesh::load(&assets().join("models/cube.obj")).unwrap();
        let mesh = codex.add_mesh("cube_single", &imported, &layout, &device).unwrap();
        let material = codex.push_material(
            Material::<HeadlessBackend>::new(&device, &MaterialDesc::new("single", "SingleVS.wgsl", "LunarPS.wgsl"))
                .unwrap(),
        );

        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        renderer.add_single(Entity::new(Transform::from_position(Vec3::Y), mesh, material)).unwrap();
        renderer.add_single(Entity::new(Transform::from_position(Vec3::Z), mesh, material)).unwrap();
        renderer.init(&device).unwrap();
        renderer.update(0.0);
        let stats = renderer.draw(&mut ctx, &codex).unwrap();
        assert_eq!(stats, DrawStats { draw_calls: 2, instances: 2 });

        let draws: Vec<_> = ctx.draws().collect();
        assert!(draws.iter().all(|d| d.instance_count.is_none() && d.index_count == 36));
        let world: WorldUniform = bytemuck::pod_read_unaligned(draws[1].vs_constants[WORLD_SLOT as usize].as_ref().unwrap());
        assert_eq!(world.world[3], [0.0, 0.0, 1.0, 1.0]);
        // no textures on this material: slots are cleared
        assert!(draws[0].textures.iter().all(Option::is_none));
    }

    #[test]
    fn test_device_loss_round_trip() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let (codex, mesh, material) = lunar_codex(&device, PipelineOverrides::default());
        let mut renderer = EntityRenderer::<HeadlessBackend>::new();
        renderer.add(Entity::new(Transform::from_position(Vec3::X), mesh, material)).unwrap();
        renderer.init(&device).unwrap();

        renderer.on_device_lost();
        assert!(renderer.upload(&mut ctx).unwrap_err().is_device_lost());
        assert!(renderer.draw(&mut ctx, &codex).unwrap_err().is_device_lost());

        renderer.on_device_restored(&device).unwrap();
        renderer.update(0.0);
        renderer.upload(&mut ctx).unwrap();
        assert_eq!(renderer.draw(&mut ctx, &codex).unwrap().draw_calls, 1);
    }
}
