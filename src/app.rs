// src/app.rs
//! Window, surface and frame loop (winit 0.30 + wgpu 22).

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use log::{debug, error, info, warn};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{DeviceEvent, DeviceId, ElementState, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use crate::camera::CameraController;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::fps_counter::FpsCounter;
use crate::gpu::wgpu_backend::{WgpuBackend, WgpuContext, WgpuDevice};
use crate::scene::SceneDescription;

/// Optional features used when the adapter has them.
const WANTED_FEATURES: wgpu::Features = wgpu::Features::POLYGON_MODE_LINE
    .union(wgpu::Features::TEXTURE_COMPRESSION_BC)
    .union(wgpu::Features::FLOAT32_FILTERABLE);

struct Gpu {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    adapter: wgpu::Adapter,
    device: WgpuDevice,
    context: WgpuContext,
    depth: wgpu::TextureView,
}

fn request_device(adapter: &wgpu::Adapter, color_format: wgpu::TextureFormat) -> anyhow::Result<WgpuDevice> {
    let features = adapter.features() & WANTED_FEATURES;
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("codex_device"),
            required_features: features,
            required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    ))
    .context("requesting GPU device")?;
    debug!("Device features: {features:?}");
    Ok(WgpuDevice::new(device, queue, color_format))
}

impl Gpu {
    fn new(event_loop: &ActiveEventLoop, config: &EngineConfig) -> anyhow::Result<Self> {
        let attrs = Window::default_attributes()
            .with_title(config.window.title.clone())
            .with_inner_size(PhysicalSize::new(config.window.width, config.window.height));
        let window = Arc::new(event_loop.create_window(attrs).context("creating window")?);

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let surface = instance.create_surface(window.clone()).context("creating surface")?;
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow!("no GPU adapter can present to this window"))?;
        info!("Adapter: {:?}", adapter.get_info());

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| anyhow!("surface reports no formats"))?;
        let size = window.inner_size();
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if config.render.vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        let device = request_device(&adapter, format)?;
        surface.configure(device.device(), &surface_config);
        let context = device.create_context(&config.render)?;
        let depth = device.create_depth_view(surface_config.width, surface_config.height);

        Ok(Self { window, surface, surface_config, adapter, device, context, depth })
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(self.device.device(), &self.surface_config);
        self.depth = self.device.create_depth_view(width, height);
    }

    /// Replace the device after a loss; the surface and window stay.
    fn recreate_device(&mut self, config: &EngineConfig) -> anyhow::Result<()> {
        self.device = request_device(&self.adapter, self.surface_config.format)?;
        self.surface.configure(self.device.device(), &self.surface_config);
        self.context = self.device.create_context(&config.render)?;
        self.depth = self.device.create_depth_view(self.surface_config.width, self.surface_config.height);
        Ok(())
    }
}

struct CodexApp {
    config: EngineConfig,
    scene: Option<SceneDescription>,
    gpu: Option<Gpu>,
    engine: Option<Engine<WgpuBackend>>,
    controller: CameraController,
    held: HashSet<KeyCode>,
    looking: bool,
    fps: FpsCounter,
    fatal: Option<anyhow::Error>,
}

impl CodexApp {
    fn new(config: EngineConfig, scene: SceneDescription) -> Self {
        let fps = FpsCounter::new(config.render.fps_log_interval);
        Self {
            config,
            scene: Some(scene),
            gpu: None,
            engine: None,
            controller: CameraController::new(6.0, 0.003),
            held: HashSet::new(),
            looking: false,
            fps,
            fatal: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let gpu = Gpu::new(event_loop, &self.config)?;
        let scene = self.scene.take().ok_or_else(|| anyhow!("scene already loaded"))?;
        let mut engine = Engine::load(&gpu.device, &self.config, scene).context("loading scene")?;
        engine.resize(gpu.surface_config.width, gpu.surface_config.height);
        gpu.window.request_redraw();
        self.gpu = Some(gpu);
        self.engine = Some(engine);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.fatal = Some(err);
        event_loop.exit();
    }

    fn axis(&self, positive: KeyCode, negative: KeyCode) -> f32 {
        (self.held.contains(&positive) as i32 - self.held.contains(&negative) as i32) as f32
    }

    fn recover(&mut self) -> anyhow::Result<()> {
        let (Some(gpu), Some(engine)) = (self.gpu.as_mut(), self.engine.as_mut()) else {
            return Ok(());
        };
        gpu.recreate_device(&self.config)?;
        engine.recover(&gpu.device).context("restoring device resources")?;
        Ok(())
    }

    fn redraw(&mut self) -> anyhow::Result<()> {
        if self.gpu.as_ref().is_some_and(|g| g.device.is_lost()) {
            self.recover()?;
        }

        let dt = self.fps.tick().min(0.1);
        let (forward, right, up) = (
            self.axis(KeyCode::KeyW, KeyCode::KeyS),
            self.axis(KeyCode::KeyD, KeyCode::KeyA),
            self.axis(KeyCode::Space, KeyCode::ShiftLeft),
        );
        let clear = self.config.render.clear_color;
        let (Some(gpu), Some(engine)) = (self.gpu.as_mut(), self.engine.as_mut()) else {
            return Ok(());
        };

        self.controller.process_keyboard(forward, right, up);
        self.controller.update_camera(engine.camera_mut(), dt);
        engine.update(dt);

        let frame = match gpu.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                debug!("Surface lost or outdated, reconfiguring");
                let size = gpu.window.inner_size();
                gpu.resize(size.width, size.height);
                return Ok(());
            }
            Err(wgpu::SurfaceError::OutOfMemory) => return Err(anyhow!("surface out of memory")),
            Err(e) => {
                warn!("Skipping frame: {e}");
                return Ok(());
            }
        };
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let stats = engine.draw(&mut gpu.context).context("recording frame")?;
        let mut encoder = gpu
            .device
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("frame_encoder") });
        gpu.context.flush(
            &mut encoder,
            &view,
            &gpu.depth,
            wgpu::Color { r: clear[0], g: clear[1], b: clear[2], a: clear[3] },
        );
        gpu.device.queue().submit(Some(encoder.finish()));
        gpu.window.pre_present_notify();
        frame.present();

        self.fps.maybe_log(stats.draw_calls, stats.instances);
        Ok(())
    }
}

impl ApplicationHandler for CodexApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Poll);
        if self.gpu.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.gpu.as_ref().map(|g| g.window.id()) != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if let Some(gpu) = self.gpu.as_mut() {
                    gpu.resize(size.width, size.height);
                }
                if let Some(engine) = self.engine.as_mut() {
                    engine.resize(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput {
                event: KeyEvent { physical_key: PhysicalKey::Code(code), state, .. },
                ..
            } => match (code, state) {
                (KeyCode::Escape, ElementState::Pressed) => event_loop.exit(),
                (code, ElementState::Pressed) => {
                    self.held.insert(code);
                }
                (code, ElementState::Released) => {
                    self.held.remove(&code);
                }
            },
            WindowEvent::MouseInput { button: MouseButton::Right, state, .. } => {
                self.looking = state == ElementState::Pressed;
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e);
                }
            }
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            if self.looking {
                self.controller.process_mouse(dx as f32, dy as f32);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(gpu) = &self.gpu {
            gpu.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
    }
}

/// Open the window and run `scene` until the window closes. Load failures
/// end the loop and are returned.
pub fn run(config: EngineConfig, scene: SceneDescription) -> anyhow::Result<()> {
    let event_loop = EventLoop::new().context("creating event loop")?;
    let mut app = CodexApp::new(config, scene);
    event_loop.run_app(&mut app).context("event loop")?;
    match app.fatal.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
