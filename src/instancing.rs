// src/instancing.rs
//! One instanced draw batch: every entity sharing a mesh and material.
//!
//! The CPU array holds one column-major world matrix per instance, in entity
//! order. The dynamic GPU buffer has the identical layout and is rewritten in
//! full every frame.

use glam::Mat4;

use crate::error::Result;
use crate::gpu::{Backend, BufferDesc, BufferKind, RenderContext, RenderDevice};
use crate::hash::MeshId;
use crate::materials::MaterialId;

/// Bytes of one streamed world matrix (`float4x4`).
pub const WORLD_MATRIX_BYTES: u32 = std::mem::size_of::<[[f32; 4]; 4]>() as u32;

#[derive(Debug)]
pub struct InstancedDrawContext<B: Backend> {
    mesh: MeshId,
    material: MaterialId,
    world_matrices: Vec<[[f32; 4]; 4]>,
    /// `None` between device loss and restore.
    buffer: Option<B::Buffer>,
}

impl<B: Backend> InstancedDrawContext<B> {
    pub fn new(device: &B::Device, mesh: MeshId, material: MaterialId, instance_count: usize) -> Result<Self> {
        crate::ensure!(instance_count > 0, "instanced batch for mesh {} has no instances", mesh);
        let mut context = Self {
            mesh,
            material,
            world_matrices: vec![Mat4::IDENTITY.to_cols_array_2d(); instance_count],
            buffer: None,
        };
        context.create_buffer(device)?;
        Ok(context)
    }

    fn create_buffer(&mut self, device: &B::Device) -> Result<()> {
        let desc = BufferDesc {
            label: "instance_world_matrices",
            kind: BufferKind::DynamicVertex,
            size: self.buffer_size(),
        };
        self.buffer = Some(device.create_buffer(&desc, Some(bytemuck::cast_slice(&self.world_matrices)))?);
        Ok(())
    }

    #[inline]
    pub fn mesh(&self) -> MeshId {
        self.mesh
    }

    #[inline]
    pub fn material(&self) -> MaterialId {
        self.material
    }

    #[inline]
    pub fn instance_count(&self) -> u32 {
        self.world_matrices.len() as u32
    }

    /// GPU buffer size: `instance_count * size_of(float4x4)`.
    #[inline]
    pub fn buffer_size(&self) -> u64 {
        self.world_matrices.len() as u64 * WORLD_MATRIX_BYTES as u64
    }

    #[inline]
    pub fn world_matrices(&self) -> &[[[f32; 4]; 4]] {
        &self.world_matrices
    }

    #[inline]
    pub fn set_world(&mut self, instance: usize, world: Mat4) {
        self.world_matrices[instance] = world.to_cols_array_2d();
    }

    #[inline]
    pub fn buffer(&self) -> Option<&B::Buffer> {
        self.buffer.as_ref()
    }

    /// Write-discard the whole CPU array into the GPU buffer.
    pub fn upload(&self, ctx: &mut B::Context) -> Result<()> {
        match &self.buffer {
            Some(buffer) => ctx.write_discard(buffer, bytemuck::cast_slice(&self.world_matrices)),
            None => Err(crate::error::Error::DeviceLost),
        }
    }

    pub fn release_gpu(&mut self) {
        self.buffer = None;
    }

    pub fn restore_gpu(&mut self, device: &B::Device) -> Result<()> {
        self.create_buffer(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessBackend, HeadlessContext, HeadlessDevice};
    use glam::Vec3;

    #[test]
    fn test_sizes_agree() {
        let device = HeadlessDevice::new();
        let batch =
            InstancedDrawContext::<HeadlessBackend>::new(&device, MeshId::from_name("cube.obj"), MaterialId(0), 5).unwrap();
        assert_eq!(batch.world_matrices().len() as u32, batch.instance_count());
        assert_eq!(batch.buffer_size(), 5 * 64);
        assert_eq!(batch.buffer().unwrap().size() as u64, batch.buffer_size());
    }

    #[test]
    fn test_upload_matches_cpu_array() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let mut batch =
            InstancedDrawContext::<HeadlessBackend>::new(&device, MeshId::from_name("cube.obj"), MaterialId(0), 3).unwrap();
        for i in 0..3 {
            batch.set_world(i, Mat4::from_translation(Vec3::new(i as f32, -1.0, 4.0)));
        }
        batch.upload(&mut ctx).unwrap();
        let readback = batch.buffer().unwrap().read();
        assert_eq!(readback.as_slice(), bytemuck::cast_slice::<_, u8>(batch.world_matrices()));
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let device = HeadlessDevice::new();
        assert!(
            InstancedDrawContext::<HeadlessBackend>::new(&device, MeshId::from_name("cube.obj"), MaterialId(0), 0).is_err()
        );
    }

    #[test]
    fn test_upload_after_device_loss_fails() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let mut batch =
            InstancedDrawContext::<HeadlessBackend>::new(&device, MeshId::from_name("cube.obj"), MaterialId(0), 1).unwrap();
        batch.release_gpu();
        assert!(batch.upload(&mut ctx).unwrap_err().is_device_lost());
        batch.restore_gpu(&device).unwrap();
        assert!(batch.upload(&mut ctx).is_ok());
    }
}
