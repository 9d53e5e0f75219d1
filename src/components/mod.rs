// src/components/mod.rs
//! Entity components: a transform plus the mesh and material it draws with.

use glam::{Mat4, Quat, Vec3};

use crate::hash::MeshId;
use crate::materials::MaterialId;

/// Position, rotation and scale; composed as scale, then rotation, then translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self { position, ..Self::IDENTITY }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    #[inline]
    pub fn world_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Spin around the local axes by `angular_velocity * dt` (radians).
    pub fn rotate_local(&mut self, angular_velocity: Vec3, dt: f32) {
        if angular_velocity != Vec3::ZERO {
            self.rotation = (self.rotation * Quat::from_scaled_axis(angular_velocity * dt)).normalize();
        }
    }
}

/// Something the entity renderer draws. CPU only; its world matrix is
/// recomputed every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entity {
    pub transform: Transform,
    pub mesh: MeshId,
    pub material: MaterialId,
    /// Radians per second around the local axes.
    pub angular_velocity: Vec3,
}

impl Entity {
    pub fn new(transform: Transform, mesh: MeshId, material: MaterialId) -> Self {
        Self {
            transform,
            mesh,
            material,
            angular_velocity: Vec3::ZERO,
        }
    }

    pub fn spinning(mut self, angular_velocity: Vec3) -> Self {
        self.angular_velocity = angular_velocity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_matrix_composes_srt() {
        let t = Transform::from_position(Vec3::new(1.0, 2.0, 3.0))
            .with_rotation(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2))
            .with_scale(Vec3::splat(2.0));
        let p = t.world_matrix().transform_point3(Vec3::X);
        // scale to (2,0,0), rotate to (0,0,-2), translate
        assert!((p - Vec3::new(1.0, 2.0, 1.0)).length() < 1e-5);
    }

    #[test]
    fn test_rotate_local_accumulates() {
        let mut t = Transform::IDENTITY;
        for _ in 0..4 {
            t.rotate_local(Vec3::new(0.0, std::f32::consts::FRAC_PI_2, 0.0), 0.5);
        }
        let expected = Quat::from_rotation_y(std::f32::consts::PI);
        assert!(t.rotation.angle_between(expected) < 1e-4);
        assert!((t.rotation.length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_static_entities_do_not_drift() {
        let mut t = Transform::from_position(Vec3::ONE);
        t.rotate_local(Vec3::ZERO, 10.0);
        assert_eq!(t, Transform::from_position(Vec3::ONE));
    }
}
