// src/scene.rs
//! Scene content: which meshes, materials and entities the engine loads.

use glam::{Quat, Vec3};

use crate::components::Transform;
use crate::gpu::{CullMode, FillMode, RasterizerDesc};
use crate::lighting::Lighting;
use crate::materials::{MaterialDesc, MaterialParams, PipelineOverrides};
use crate::skybox::sky_overrides;

/// A mesh file packed for the input layout of `vertex_shader`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshEntry {
    pub file: String,
    pub vertex_shader: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    /// Mesh file name.
    pub mesh: String,
    /// Material name.
    pub material: String,
    pub transform: Transform,
    pub angular_velocity: Vec3,
    /// Drawn through the instanced path; `false` uses one draw per entity.
    pub instanced: bool,
}

impl EntityEntry {
    pub fn instanced(mesh: &str, material: &str, transform: Transform) -> Self {
        Self {
            mesh: mesh.to_string(),
            material: material.to_string(),
            transform,
            angular_velocity: Vec3::ZERO,
            instanced: true,
        }
    }

    pub fn single(mesh: &str, material: &str, transform: Transform) -> Self {
        Self { instanced: false, ..Self::instanced(mesh, material, transform) }
    }

    pub fn spinning(mut self, angular_velocity: Vec3) -> Self {
        self.angular_velocity = angular_velocity;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkyEntry {
    pub mesh: String,
    pub material: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraStart {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fovy: f32,
}

/// Everything [`Engine::load`](crate::engine::Engine::load) registers.
///
/// Materials are pushed in list order, so their ids follow this order.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneDescription {
    pub meshes: Vec<MeshEntry>,
    pub materials: Vec<MaterialDesc>,
    pub entities: Vec<EntityEntry>,
    pub sky: Option<SkyEntry>,
    pub camera: CameraStart,
    pub lighting: Lighting,
}

impl SceneDescription {
    pub const CUBE: &'static str = "cube.obj";
    pub const LUNAR: &'static str = "lunar";
    pub const LUNAR_WIRE: &'static str = "lunar_wire";
    pub const PEDESTAL: &'static str = "pedestal";
    pub const SKY: &'static str = "sky";

    /// A grid of spinning lunar cubes, a few wireframe ones, a flat pedestal
    /// drawn without instancing, and a sky.
    pub fn lunar_demo() -> Self {
        let wireframe = PipelineOverrides {
            rasterizer: Some(RasterizerDesc { cull: CullMode::None, fill: FillMode::Wireframe, ..Default::default() }),
            depth_stencil: None,
        };
        let materials = vec![
            MaterialDesc::new(Self::LUNAR, "InstancedVS.wgsl", "LunarPS.wgsl").with_textures("Lunar"),
            MaterialDesc::new(Self::LUNAR_WIRE, "InstancedVS.wgsl", "LunarPS.wgsl")
                .with_params(MaterialParams::new([0.4, 0.9, 1.0, 1.0], 8.0))
                .with_overrides(wireframe),
            MaterialDesc::new(Self::PEDESTAL, "SingleVS.wgsl", "LunarPS.wgsl")
                .with_textures("Lunar")
                .with_params(MaterialParams::new([0.6, 0.6, 0.65, 1.0], 4.0)),
            MaterialDesc::new(Self::SKY, "SkyVS.wgsl", "SkyPS.wgsl")
                .with_textures("Sky")
                .with_overrides(sky_overrides()),
        ];

        let mut entities = Vec::new();
        for z in 0..5 {
            for x in 0..5 {
                let position = Vec3::new((x as f32 - 2.0) * 3.0, 1.5, (z as f32 - 2.0) * 3.0);
                let material = if (x + z) % 4 == 0 { Self::LUNAR_WIRE } else { Self::LUNAR };
                let spin = Vec3::new(0.0, 0.3 + 0.1 * x as f32, 0.1 * z as f32);
                entities.push(
                    EntityEntry::instanced(Self::CUBE, material, Transform::from_position(position)).spinning(spin),
                );
            }
        }
        entities.push(EntityEntry::single(
            Self::CUBE,
            Self::PEDESTAL,
            Transform::from_position(Vec3::new(0.0, -0.5, 0.0)).with_scale(Vec3::new(9.0, 0.25, 9.0)),
        ));
        entities.push(EntityEntry::single(
            Self::CUBE,
            Self::PEDESTAL,
            Transform::from_position(Vec3::new(0.0, 4.5, -9.0))
                .with_rotation(Quat::from_rotation_z(std::f32::consts::FRAC_PI_4)),
        ));

        Self {
            // The sky and single-draw shaders read the same per-vertex stream,
            // so one packing of the cube serves all of them.
            meshes: vec![MeshEntry { file: Self::CUBE.to_string(), vertex_shader: "InstancedVS.wgsl".to_string() }],
            materials,
            entities,
            sky: Some(SkyEntry { mesh: Self::CUBE.to_string(), material: Self::SKY.to_string() }),
            camera: CameraStart {
                position: Vec3::new(0.0, 6.0, 16.0),
                yaw: std::f32::consts::PI,
                pitch: -0.3,
                fovy: 60f32.to_radians(),
            },
            lighting: Lighting::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_references_are_consistent() {
        let scene = SceneDescription::lunar_demo();
        let materials: Vec<_> = scene.materials.iter().map(|m| m.name.as_str()).collect();
        let meshes: Vec<_> = scene.meshes.iter().map(|m| m.file.as_str()).collect();
        for entity in &scene.entities {
            assert!(materials.contains(&entity.material.as_str()), "{}", entity.material);
            assert!(meshes.contains(&entity.mesh.as_str()), "{}", entity.mesh);
        }
        let sky = scene.sky.as_ref().unwrap();
        assert!(materials.contains(&sky.material.as_str()));
    }

    #[test]
    fn test_demo_mixes_draw_paths() {
        let scene = SceneDescription::lunar_demo();
        assert_eq!(scene.entities.iter().filter(|e| e.instanced).count(), 25);
        assert_eq!(scene.entities.iter().filter(|e| !e.instanced).count(), 2);
    }
}
