// src/lighting.rs
//! Ambient plus one directional light, uploaded with the camera position to
//! pixel slot 0.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::constant_buffer::ConstantBuffer;
use crate::error::Result;
use crate::gpu::{Backend, ShaderStage, LIGHTING_SLOT};

/// Ambient term plus one directional light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lighting {
    pub ambient: Vec3,
    /// Direction the light travels in (not towards the light).
    pub direction: Vec3,
    pub color: Vec3,
}

impl Default for Lighting {
    fn default() -> Self {
        Self {
            ambient: Vec3::splat(0.08),
            direction: Vec3::new(-0.4, -1.0, 0.3).normalize(),
            color: Vec3::new(1.0, 0.97, 0.9),
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct LightingUniform {
    pub ambient: [f32; 4],
    pub light_direction: [f32; 4],
    pub light_color: [f32; 4],
    pub camera_position: [f32; 4],
}

impl LightingUniform {
    pub fn new(lighting: &Lighting, camera_position: Vec3) -> Self {
        Self {
            ambient: lighting.ambient.extend(1.0).to_array(),
            light_direction: lighting.direction.normalize_or_zero().extend(0.0).to_array(),
            light_color: lighting.color.extend(1.0).to_array(),
            camera_position: camera_position.extend(1.0).to_array(),
        }
    }
}

/// Lighting constant buffer at pixel slot 0.
#[derive(Debug)]
pub struct LightingBuffer<B: Backend> {
    constants: ConstantBuffer<B, LightingUniform>,
}

impl<B: Backend> LightingBuffer<B> {
    pub fn populate(device: &B::Device, lighting: &Lighting) -> Result<Self> {
        let initial = LightingUniform::new(lighting, Vec3::ZERO);
        let constants = ConstantBuffer::populate(device, "lighting", ShaderStage::Pixel, LIGHTING_SLOT, &initial)?;
        Ok(Self { constants })
    }

    pub fn upload(&self, ctx: &mut B::Context, lighting: &Lighting, camera_position: Vec3) -> Result<()> {
        self.constants
            .map_unmap(ctx, &LightingUniform::new(lighting, camera_position))
    }
}
