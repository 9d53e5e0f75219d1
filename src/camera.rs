// src/camera.rs
//! Fly camera: view and projection math, the vertex-slot-0 camera block and
//! a controller that turns movement and look deltas into camera motion.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::constant_buffer::ConstantBuffer;
use crate::error::Result;
use crate::gpu::{Backend, ShaderStage, CAMERA_SLOT};

const MAX_PITCH: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

/// Perspective camera with position and Euler rotation (yaw, pitch).
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// yaw: rotation around Y axis (radians). pitch: rotation around X axis (radians).
    pub yaw: f32,
    pub pitch: f32,

    pub fovy: f32,
    pub aspect: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32, fovy_radians: f32, aspect: f32) -> Self {
        Self {
            position,
            yaw,
            pitch: pitch.clamp(-MAX_PITCH, MAX_PITCH),
            fovy: fovy_radians,
            aspect,
            znear: 0.1,
            zfar: 500.0,
        }
    }

    /// Unit view direction for the current yaw/pitch.
    pub fn forward(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw).normalize_or_zero()
    }

    /// Right-handed, Y up.
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y)
    }

    pub fn proj_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fovy, self.aspect, self.znear, self.zfar)
    }

    pub fn view_proj(&self) -> Mat4 {
        self.proj_matrix() * self.view_matrix()
    }

    /// View-projection with the view translation zeroed, so the sky stays centred on the eye.
    pub fn sky_view_proj(&self) -> Mat4 {
        let mut view = self.view_matrix();
        view.w_axis = Vec4::W;
        self.proj_matrix() * view
    }

    /// Update aspect ratio (call on resize). Zero-height windows keep the old aspect.
    pub fn set_aspect(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }
}

/// GPU camera block, vertex slot 0 (matches `Camera` in the WGSL shaders).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    /// Column-major 4x4 matrix
    pub view_proj: [[f32; 4]; 4],
    pub position: [f32; 4],
}

impl CameraUniform {
    pub fn new(view_proj: Mat4, position: Vec3) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            position: position.extend(1.0).to_array(),
        }
    }
}

/// The camera's constant buffer.
#[derive(Debug)]
pub struct CameraBuffer<B: Backend> {
    constants: ConstantBuffer<B, CameraUniform>,
}

impl<B: Backend> CameraBuffer<B> {
    pub fn populate(device: &B::Device, camera: &Camera) -> Result<Self> {
        let initial = CameraUniform::new(camera.view_proj(), camera.position);
        let constants = ConstantBuffer::populate(device, "camera", ShaderStage::Vertex, CAMERA_SLOT, &initial)?;
        Ok(Self { constants })
    }

    /// Write the regular view-projection and bind it.
    pub fn upload(&self, ctx: &mut B::Context, camera: &Camera) -> Result<()> {
        self.constants
            .map_unmap(ctx, &CameraUniform::new(camera.view_proj(), camera.position))
    }

    /// Write the translation-free view-projection used by the sky and bind it.
    pub fn upload_for_sky(&self, ctx: &mut B::Context, camera: &Camera) -> Result<()> {
        self.constants
            .map_unmap(ctx, &CameraUniform::new(camera.sky_view_proj(), camera.position))
    }

    pub fn buffer(&self) -> &B::Buffer {
        self.constants.buffer()
    }
}

/// Input-agnostic fly controller. Feed it `process_keyboard` / `process_mouse`
/// from the input layer, then `update_camera` once per frame.
#[derive(Debug, Clone, Default)]
pub struct CameraController {
    pub speed: f32,
    pub sensitivity: f32,

    // movement axes, -1.0..=1.0
    pub forward: f32,
    pub right: f32,
    pub up: f32,

    // accumulated look deltas
    yaw_delta: f32,
    pitch_delta: f32,
}

impl CameraController {
    pub fn new(speed: f32, sensitivity: f32) -> Self {
        Self { speed, sensitivity, ..Default::default() }
    }

    pub fn process_keyboard(&mut self, forward: f32, right: f32, up: f32) {
        self.forward = forward.clamp(-1.0, 1.0);
        self.right = right.clamp(-1.0, 1.0);
        self.up = up.clamp(-1.0, 1.0);
    }

    /// `dx`, `dy` are pointer deltas in pixels.
    pub fn process_mouse(&mut self, dx: f32, dy: f32) {
        self.yaw_delta -= dx * self.sensitivity;
        self.pitch_delta -= dy * self.sensitivity;
    }

    pub fn update_camera(&mut self, camera: &mut Camera, dt: f32) {
        camera.yaw += std::mem::take(&mut self.yaw_delta);
        camera.pitch = (camera.pitch + std::mem::take(&mut self.pitch_delta)).clamp(-MAX_PITCH, MAX_PITCH);

        let forward = camera.forward();
        let right = forward.cross(Vec3::Y).normalize_or_zero();
        let step = self.speed * dt;
        camera.position += forward * (self.forward * step) + right * (self.right * step) + Vec3::Y * (self.up * step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::{HeadlessBackend, HeadlessContext, HeadlessDevice};
    use crate::gpu::RenderContext;

    fn camera() -> Camera {
        Camera::new(Vec3::new(3.0, 2.0, -8.0), 0.0, 0.0, 60f32.to_radians(), 16.0 / 9.0)
    }

    #[test]
    fn test_sky_view_ignores_translation() {
        let mut a = camera();
        let mut b = camera();
        a.position = Vec3::ZERO;
        b.position = Vec3::new(100.0, -40.0, 7.0);
        assert!(a.sky_view_proj().abs_diff_eq(b.sky_view_proj(), 1e-5));
        assert!(!a.view_proj().abs_diff_eq(b.view_proj(), 1e-3));
    }

    #[test]
    fn test_controller_moves_along_forward_and_clamps_pitch() {
        let mut cam = camera();
        let mut controller = CameraController::new(2.0, 0.01);
        controller.process_keyboard(1.0, 0.0, 0.0);
        controller.update_camera(&mut cam, 0.5);
        assert!((cam.position - Vec3::new(3.0, 2.0, -7.0)).length() < 1e-5);

        controller.process_mouse(0.0, -10_000.0);
        controller.update_camera(&mut cam, 0.0);
        assert!(cam.pitch <= MAX_PITCH);
    }

    #[test]
    fn test_upload_binds_vertex_slot_zero() {
        let device = HeadlessDevice::new();
        let mut ctx = HeadlessContext::new();
        let cam = camera();
        let buffer = CameraBuffer::<HeadlessBackend>::populate(&device, &cam).unwrap();
        buffer.upload_for_sky(&mut ctx, &cam).unwrap();
        ctx.draw_indexed(36, 0, 0);

        let draw = ctx.draws().next().unwrap();
        let uniform: CameraUniform = bytemuck::pod_read_unaligned(draw.vs_constants[0].as_ref().unwrap());
        assert_eq!(uniform.view_proj, cam.sky_view_proj().to_cols_array_2d());
        assert_eq!(uniform.position, [3.0, 2.0, -8.0, 1.0]);
    }
}
