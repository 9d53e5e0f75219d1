// src/resource_manager.rs
//! The Codex: single owner of every GPU resource the engine draws with.
//! - Meshes, shaders and texture sets keyed by the FNV-1a hash of their name
//! - Materials in a dense list, addressed by [`MaterialId`]
//! - Populated once during load, read-only while frames run
//! - `shutdown(self)` is the single point of teardown

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::constant_buffer::Bind;
use crate::context::Context;
use crate::error::{Error, ResourceKind, Result};
use crate::gpu::{
    Backend, BufferDesc, BufferKind, RenderContext, RenderDevice, SamplerDesc, ShaderStage, TEXTURE_SLOT_COUNT,
};
use crate::hash::{MeshId, ShaderId, TextureId};
use crate::materials::{Material, MaterialId};
use crate::mesh_import::ImportedMesh;
use crate::shader_reflect::{stage_for_file_name, ShaderProgram};
use crate::texture::{split_texture_file_name, TextureData, TextureDimension, TextureSlot};
use crate::vertex_layout::VertexBufferDescription;

// ---------- Resource records ----------

/// Immutable GPU geometry.
#[derive(Debug)]
pub struct Mesh<B: Backend> {
    pub vertex_buffer: B::Buffer,
    pub index_buffer: B::Buffer,
    pub index_count: u32,
    pub vertex_count: u32,
    /// Bytes per vertex; equals the layout's `byte_size`.
    pub stride: u32,
}

#[derive(Debug)]
pub struct VertexShader<B: Backend> {
    pub name: String,
    pub shader: B::VertexShader,
    pub input_layout: B::InputLayout,
    pub layout: VertexBufferDescription,
}

#[derive(Debug)]
pub struct PixelShader<B: Backend> {
    pub name: String,
    pub shader: B::PixelShader,
    pub sampler: Option<B::Sampler>,
}

/// Texture views for one logical texture, indexed by [`TextureSlot`].
#[derive(Debug)]
pub struct ResourceBindChord<B: Backend> {
    pub views: [Option<B::TextureView>; TEXTURE_SLOT_COUNT],
}

impl<B: Backend> Default for ResourceBindChord<B> {
    fn default() -> Self {
        Self { views: std::array::from_fn(|_| None) }
    }
}

impl<B: Backend> ResourceBindChord<B> {
    /// Put `view` in `slot`, returning the view it replaced.
    pub fn insert(&mut self, slot: TextureSlot, view: B::TextureView) -> Option<B::TextureView> {
        self.views[slot.index()].replace(view)
    }

    #[inline]
    pub fn get(&self, slot: TextureSlot) -> Option<&B::TextureView> {
        self.views[slot.index()].as_ref()
    }

    pub fn filled_slots(&self) -> usize {
        self.views.iter().filter(|v| v.is_some()).count()
    }
}

impl<B: Backend> Bind<B> for ResourceBindChord<B> {
    fn bind(&self, ctx: &mut B::Context) {
        ctx.set_shader_resources(0, &self.views);
    }
}

// ---------- Registry ----------

#[derive(Debug)]
pub struct Codex<B: Backend> {
    vertex_shaders: HashMap<ShaderId, VertexShader<B>>,
    pixel_shaders: HashMap<ShaderId, PixelShader<B>>,
    meshes: HashMap<MeshId, Mesh<B>>,
    textures: HashMap<TextureId, ResourceBindChord<B>>,
    materials: Vec<Material<B>>,
    material_names: HashMap<String, MaterialId>,
}

impl<B: Backend> Default for Codex<B> {
    fn default() -> Self {
        Self {
            vertex_shaders: HashMap::new(),
            pixel_shaders: HashMap::new(),
            meshes: HashMap::new(),
            textures: HashMap::new(),
            materials: Vec::new(),
            material_names: HashMap::new(),
        }
    }
}

fn duplicate(kind: ResourceKind, id: u32, name: &str) -> Error {
    error!("Refusing duplicate {kind} `{name}` ({id:#010x}); keeping the first");
    Error::Duplicate { kind, id }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Regular files in `dir`, sorted so load order does not depend on the file system.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl<B: Backend> Codex<B> {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Meshes =====

    /// Import `path`, pack it for `layout` and register it under `hash(file name)`.
    ///
    /// The id is checked before the file is read; a duplicate leaves the
    /// registered mesh untouched.
    pub fn add_mesh_from_file(
        &mut self,
        path: &Path,
        layout: &VertexBufferDescription,
        device: &B::Device,
    ) -> Result<MeshId> {
        let name = file_name(path);
        let id = MeshId::from_name(&name);
        if self.meshes.contains_key(&id) {
            return Err(duplicate(ResourceKind::Mesh, id.raw(), &name));
        }
        let imported = ImportedMesh::load(path)?;
        self.add_mesh(&name, &imported, layout, device)
    }

    /// Register an already imported mesh under `hash(name)`.
    pub fn add_mesh(
        &mut self,
        name: &str,
        imported: &ImportedMesh,
        layout: &VertexBufferDescription,
        device: &B::Device,
    ) -> Result<MeshId> {
        let id = MeshId::from_name(name);
        if self.meshes.contains_key(&id) {
            return Err(duplicate(ResourceKind::Mesh, id.raw(), name));
        }
        crate::ensure!(!imported.indices.is_empty(), "mesh `{}` has no triangles", name);

        let vertices = imported.pack_vertices(&layout.per_vertex);
        let vertex_buffer = device.create_buffer(
            &BufferDesc { label: name, kind: BufferKind::Vertex, size: vertices.len() as u64 },
            Some(&vertices),
        )?;
        let indices: &[u8] = bytemuck::cast_slice(&imported.indices);
        let index_buffer = device.create_buffer(
            &BufferDesc { label: name, kind: BufferKind::Index, size: indices.len() as u64 },
            Some(indices),
        )?;

        let mesh = Mesh {
            vertex_buffer,
            index_buffer,
            index_count: imported.indices.len() as u32,
            vertex_count: imported.vertex_count() as u32,
            stride: layout.byte_size(),
        };
        debug!(
            "Mesh `{name}` ({id}): {} vertices x {} bytes, {} indices",
            mesh.vertex_count, mesh.stride, mesh.index_count
        );
        self.meshes.insert(id, mesh);
        Ok(id)
    }

    #[inline]
    pub fn mesh(&self, id: MeshId) -> Option<&Mesh<B>> {
        self.meshes.get(&id)
    }

    // ===== Shaders =====

    pub fn add_vertex_shader(&mut self, id: ShaderId, path: &Path, device: &B::Device) -> Result<()> {
        if self.vertex_shaders.contains_key(&id) {
            return Err(duplicate(ResourceKind::VertexShader, id.raw(), &file_name(path)));
        }
        let program = ShaderProgram::load(path, ShaderStage::Vertex)?;
        self.add_vertex_shader_program(id, &program, device)
    }

    /// Build the shader, derive its vertex layout from reflection and create the input layout.
    pub fn add_vertex_shader_program(&mut self, id: ShaderId, program: &ShaderProgram, device: &B::Device) -> Result<()> {
        if self.vertex_shaders.contains_key(&id) {
            return Err(duplicate(ResourceKind::VertexShader, id.raw(), &program.name));
        }
        let layout = VertexBufferDescription::from_reflection(&program.inputs)
            .with_context(|| format!("deriving vertex layout of `{}`", program.name))?;
        let shader = device.create_vertex_shader(program)?;
        let input_layout = device.create_input_layout(&shader, &layout)?;
        debug!(
            "Vertex shader `{}` ({id}): stride {} bytes, instance stride {} bytes",
            program.name,
            layout.byte_size(),
            layout.instance_stride()
        );
        self.vertex_shaders.insert(
            id,
            VertexShader { name: program.name.clone(), shader, input_layout, layout },
        );
        Ok(())
    }

    pub fn add_pixel_shader(&mut self, id: ShaderId, path: &Path, device: &B::Device) -> Result<()> {
        if self.pixel_shaders.contains_key(&id) {
            return Err(duplicate(ResourceKind::PixelShader, id.raw(), &file_name(path)));
        }
        let program = ShaderProgram::load(path, ShaderStage::Pixel)?;
        self.add_pixel_shader_program(id, &program, device)
    }

    /// Build the shader and give it the default linear-wrap sampler.
    pub fn add_pixel_shader_program(&mut self, id: ShaderId, program: &ShaderProgram, device: &B::Device) -> Result<()> {
        if self.pixel_shaders.contains_key(&id) {
            return Err(duplicate(ResourceKind::PixelShader, id.raw(), &program.name));
        }
        let shader = device.create_pixel_shader(program)?;
        let sampler = device.create_sampler(&SamplerDesc::default())?;
        debug!("Pixel shader `{}` ({id})", program.name);
        self.pixel_shaders.insert(
            id,
            PixelShader { name: program.name.clone(), shader, sampler: Some(sampler) },
        );
        Ok(())
    }

    #[inline]
    pub fn vertex_shader(&self, id: ShaderId) -> Option<&VertexShader<B>> {
        self.vertex_shaders.get(&id)
    }

    #[inline]
    pub fn pixel_shader(&self, id: ShaderId) -> Option<&PixelShader<B>> {
        self.pixel_shaders.get(&id)
    }

    /// Register every `*VS*` / `*PS*` file in `dir` under `hash(file name)`.
    /// Returns how many shaders were added.
    pub fn load_shader_directory(&mut self, dir: &Path, device: &B::Device) -> Result<usize> {
        let mut added = 0;
        for path in sorted_files(dir)? {
            let name = file_name(&path);
            let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
            let id = ShaderId::from_name(&name);
            match stage_for_file_name(&stem) {
                Some(ShaderStage::Vertex) => self.add_vertex_shader(id, &path, device)?,
                Some(ShaderStage::Pixel) => self.add_pixel_shader(id, &path, device)?,
                None => {
                    debug!("Skipping {name}: no VS/PS in its name");
                    continue;
                }
            }
            added += 1;
        }
        info!("Loaded {added} shaders from {}", dir.display());
        Ok(added)
    }

    // ===== Textures =====

    /// Put `view` into `slot` of texture set `id`, creating the set on first use.
    /// An occupied slot is overwritten and the previous view released.
    pub fn insert_texture(&mut self, id: TextureId, slot: TextureSlot, view: B::TextureView) {
        let chord = self.textures.entry(id).or_default();
        if chord.insert(slot, view).is_some() {
            debug!("Texture {id} slot {slot:?} replaced");
        }
    }

    #[inline]
    pub fn texture(&self, id: TextureId) -> Option<&ResourceBindChord<B>> {
        self.textures.get(&id)
    }

    /// Decode and upload every `<Name>_<Letter>.<ext>` file in `dir`.
    /// Unknown letters and files that break the naming rule are skipped with a warning.
    pub fn load_texture_directory(&mut self, dir: &Path, device: &B::Device) -> Result<usize> {
        let mut added = 0;
        for path in sorted_files(dir)? {
            let name = file_name(&path);
            let Some((logical, letter)) = split_texture_file_name(&path) else {
                warn!("Skipping texture {name}: expected <Name>_<Letter>.<ext>");
                continue;
            };
            let Some(slot) = TextureSlot::from_letter(letter) else {
                warn!("Skipping texture {name}: unknown role letter `{letter}`");
                continue;
            };
            let data = TextureData::load(&path)?;
            let is_cube = data.dimension == TextureDimension::Cube;
            if is_cube != (slot == TextureSlot::Cube) {
                warn!("Skipping texture {name}: {:?} image in {slot:?} slot", data.dimension);
                continue;
            }
            let view = device.create_texture(&name, &data)?;
            self.insert_texture(TextureId::from_name(&logical), slot, view);
            added += 1;
        }
        info!("Loaded {added} textures from {}", dir.display());
        Ok(added)
    }

    // ===== Materials =====

    /// Append a material; ids count up from 0 in push order. A non-empty name
    /// also becomes a lookup key for [`material_id`](Self::material_id).
    pub fn push_material(&mut self, material: Material<B>) -> MaterialId {
        let id = MaterialId(self.materials.len() as u32);
        if self.vertex_shader(material.vertex_shader).is_none() || self.pixel_shader(material.pixel_shader).is_none() {
            warn!("Material `{}` references a shader that is not loaded", material.name);
        }
        if !material.name.is_empty() {
            if let Some(previous) = self.material_names.insert(material.name.clone(), id) {
                warn!("Material name `{}` now points at {id:?} instead of {previous:?}", material.name);
            }
        }
        self.materials.push(material);
        id
    }

    #[inline]
    pub fn material(&self, id: MaterialId) -> Option<&Material<B>> {
        self.materials.get(id.index())
    }

    #[inline]
    pub fn material_id(&self, name: &str) -> Option<MaterialId> {
        self.material_names.get(name).copied()
    }

    // ===== Bookkeeping =====

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn vertex_shader_count(&self) -> usize {
        self.vertex_shaders.len()
    }

    pub fn pixel_shader_count(&self) -> usize {
        self.pixel_shaders.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Release every GPU handle. Materials go first since they reference the rest.
    pub fn shutdown(mut self) {
        info!(
            "Codex shutdown: {} materials, {} meshes, {} vertex shaders, {} pixel shaders, {} textures",
            self.materials.len(),
            self.meshes.len(),
            self.vertex_shaders.len(),
            self.pixel_shaders.len(),
            self.textures.len()
        );
        self.materials.clear();
        self.material_names.clear();
        self.meshes.clear();
        self.vertex_shaders.clear();
        self.pixel_shaders.clear();
        self.textures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessBackend, HeadlessContext, HeadlessDevice};
    use crate::materials::MaterialDesc;
    use crate::vertex_layout::ReflectedInput;

    type TestCodex = Codex<HeadlessBackend>;

    fn assets() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("assets")
    }

    fn mesh_layout() -> VertexBufferDescription {
        let inputs = [("position", 0b0111), ("normal", 0b0111), ("texcoord0", 0b0011)]
            .iter()
            .enumerate()
            .map(|(i, (n, m))| ReflectedInput::from_raw_name(n, i as u32, *m))
            .collect::<Vec<_>>();
        VertexBufferDescription::from_reflection(&inputs).unwrap()
    }

    #[test]
    fn test_mesh_round_trip() {
        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        let layout = mesh_layout();
        let id = codex
            .add_mesh_from_file(&assets().join("models/cube.obj"), &layout, &device)
            .unwrap();
        assert_eq!(id, MeshId::from_name("cube.obj"));

        let mesh = codex.mesh(MeshId::from_name("cube.obj")).unwrap();
        assert_eq!(mesh.index_count, 36);
        assert_eq!(mesh.stride, layout.byte_size());
        assert_eq!(mesh.vertex_buffer.size(), (mesh.vertex_count * mesh.stride) as usize);
        assert_eq!(mesh.index_buffer.size(), 36 * 4);
    }

    #[test]
    fn test_duplicate_mesh_keeps_first_entry() {
        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        let layout = mesh_layout();
        let path = assets().join("models/cube.obj");
        codex.add_mesh_from_file(&path, &layout, &device).unwrap();
        let first_vb = codex.mesh(MeshId::from_name("cube.obj")).unwrap().vertex_buffer.clone();

        let err = codex.add_mesh_from_file(&path, &layout, &device).unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(codex.mesh_count(), 1);
        let mesh = codex.mesh(MeshId::from_name("cube.obj")).unwrap();
        assert_eq!(mesh.vertex_buffer, first_vb);
        assert_eq!(mesh.index_count, 36);
    }

    #[test]
    fn test_missing_lookups_return_none() {
        let codex = TestCodex::new();
        assert!(codex.mesh(MeshId::from_name("nope.obj")).is_none());
        assert!(codex.vertex_shader(ShaderId::from_name("nopeVS.wgsl")).is_none());
        assert!(codex.texture(TextureId::from_name("nope")).is_none());
        assert!(codex.material(MaterialId(0)).is_none());
    }

    #[test]
    fn test_material_ids_count_up() {
        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        let names = ["MI_Lunar", "MI_Sky", "MI_Rock"];
        for (i, name) in names.iter().enumerate() {
            let material = Material::<HeadlessBackend>::new(&device, &MaterialDesc::new(name, "VS", "PS")).unwrap();
            assert_eq!(codex.push_material(material), MaterialId(i as u32));
        }
        for (i, name) in names.iter().enumerate() {
            assert_eq!(codex.material(MaterialId(i as u32)).unwrap().name, *name);
        }
        assert!(codex.material(MaterialId(names.len() as u32)).is_none());
        assert_eq!(codex.material_id("MI_Sky"), Some(MaterialId(1)));
        assert_eq!(codex.material_id("MI_Nope"), None);
    }

    #[test]
    fn test_insert_texture_overwrites_slot() {
        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        let id = TextureId::from_name("Lunar");
        let white = device.create_texture("white", &TextureData::solid([255; 4], TextureDimension::D2)).unwrap();
        let black = device.create_texture("black", &TextureData::solid([0, 0, 0, 255], TextureDimension::D2)).unwrap();

        codex.insert_texture(id, TextureSlot::Diffuse, white);
        codex.insert_texture(id, TextureSlot::Diffuse, black);
        let chord = codex.texture(id).unwrap();
        assert_eq!(chord.get(TextureSlot::Diffuse).unwrap().info().label, "black");
        assert_eq!(chord.filled_slots(), 1);

        let mut ctx = HeadlessContext::new();
        chord.bind(&mut ctx);
        ctx.draw_indexed(3, 0, 0);
        let draw = ctx.draws().next().unwrap();
        assert_eq!(draw.textures[0].as_deref(), Some("black"));
        assert!(draw.textures[1..].iter().all(Option::is_none));
    }

    #[test]
    fn test_shader_directory() {
        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        let added = codex.load_shader_directory(&assets().join("shaders"), &device).unwrap();
        assert_eq!(added, codex.vertex_shader_count() + codex.pixel_shader_count());

        let vs = codex.vertex_shader(ShaderId::from_name("InstancedVS.wgsl")).unwrap();
        assert_eq!(vs.layout.byte_size(), 32);
        assert_eq!(vs.layout.instance_stride(), 64);
        assert!(codex.pixel_shader(ShaderId::from_name("LunarPS.wgsl")).unwrap().sampler.is_some());
    }

    #[test]
    fn test_texture_directory_naming() {
        let dir = tempfile::tempdir().unwrap();
        let pixel = image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 100, 50, 255]));
        pixel.save(dir.path().join("Lunar_T.png")).unwrap();
        pixel.save(dir.path().join("Lunar_N.png")).unwrap();
        pixel.save(dir.path().join("Lunar_X.png")).unwrap();
        pixel.save(dir.path().join("notes.png")).unwrap();

        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        let added = codex.load_texture_directory(dir.path(), &device).unwrap();
        assert_eq!(added, 2);

        let chord = codex.texture(TextureId::from_name("Lunar")).unwrap();
        let diffuse = chord.get(TextureSlot::Diffuse).unwrap().info();
        assert_eq!(diffuse.mip_levels, 3);
        assert!(chord.get(TextureSlot::Normal).is_some());
        assert!(chord.get(TextureSlot::Roughness).is_none());
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        let err = codex.load_texture_directory(Path::new("/definitely/not/here"), &device).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_shutdown_releases_buffers() {
        let device = HeadlessDevice::new();
        let mut codex = TestCodex::new();
        codex
            .add_mesh_from_file(&assets().join("models/cube.obj"), &mesh_layout(), &device)
            .unwrap();
        assert_eq!(device.live_buffers(), 2);
        codex.shutdown();
        assert_eq!(device.live_buffers(), 0);
    }
}
