// src/constant_buffer.rs
//! Fixed-size parameter blocks uploaded to a shader stage at a known slot.
//!
//! `populate` allocates, `bind` attaches at the slot, `map_unmap` overwrites the
//! whole block and re-binds, `cleanup` releases. Anything that can be attached
//! to the pipeline implements [`Bind`].

use std::marker::PhantomData;
use std::mem::size_of;

use bytemuck::Pod;
use log::error;

use crate::error::{Error, Result};
use crate::gpu::{
    Backend, BufferDesc, BufferKind, RenderContext, RenderDevice, ShaderStage, MAX_CONSTANT_BUFFER_BYTES,
    MAX_CONSTANT_BUFFER_SLOTS,
};

/// Something that attaches itself to the pipeline at a fixed slot.
pub trait Bind<B: Backend> {
    fn bind(&self, ctx: &mut B::Context);
}

/// A GPU-visible copy of one `T`, bound at `slot` of `stage`.
#[derive(Debug)]
pub struct ConstantBuffer<B: Backend, T: Pod> {
    buffer: B::Buffer,
    stage: ShaderStage,
    slot: u32,
    _marker: PhantomData<T>,
}

impl<B: Backend, T: Pod> ConstantBuffer<B, T> {
    /// Allocate the buffer, filled with `initial`.
    pub fn populate(device: &B::Device, label: &str, stage: ShaderStage, slot: u32, initial: &T) -> Result<Self> {
        if slot >= MAX_CONSTANT_BUFFER_SLOTS {
            error!("constant buffer `{label}` asks for slot {slot}");
            return Err(Error::SlotOutOfRange { slot, max: MAX_CONSTANT_BUFFER_SLOTS - 1 });
        }
        let size = size_of::<T>() as u64;
        crate::ensure!(
            size > 0 && size <= MAX_CONSTANT_BUFFER_BYTES && size % 16 == 0,
            "constant buffer `{}` is {} bytes; must be a non-zero multiple of 16 up to {}",
            label,
            size,
            MAX_CONSTANT_BUFFER_BYTES
        );
        let desc = BufferDesc { label, kind: BufferKind::Constant, size };
        let buffer = device.create_buffer(&desc, Some(bytemuck::bytes_of(initial)))?;
        Ok(Self { buffer, stage, slot, _marker: PhantomData })
    }

    /// Overwrite the whole block and bind it.
    pub fn map_unmap(&self, ctx: &mut B::Context, value: &T) -> Result<()> {
        ctx.write_discard(&self.buffer, bytemuck::bytes_of(value))?;
        self.bind(ctx);
        Ok(())
    }

    #[inline]
    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Release the GPU buffer.
    pub fn cleanup(self) {}
}

impl<B: Backend, T: Pod> Bind<B> for ConstantBuffer<B, T> {
    fn bind(&self, ctx: &mut B::Context) {
        ctx.set_constant_buffer(self.stage, self.slot, &self.buffer);
    }
}
