// src/lib.rs
//! Codex engine: a small instanced renderer over a hash-keyed resource registry.
//!
//! Load once ([`Engine::load`]), then per frame `update(dt)` and `draw(ctx)`.
//! Everything GPU-facing goes through the [`gpu::Backend`] seam; the wgpu
//! backend drives the window, the headless backend drives the tests.

pub mod error;
pub mod context;
pub mod config;
pub mod hash;

pub mod gpu;
pub mod vertex_layout;
pub mod shader_reflect;
pub mod texture;
pub mod mesh_import;

pub mod constant_buffer;
pub mod materials;
pub mod resource_manager;
pub mod components;
pub mod instancing;
pub mod renderer;
pub mod skybox;
pub mod camera;
pub mod lighting;
pub mod scene;
pub mod engine;

pub mod fps_counter;
#[cfg(not(target_arch = "wasm32"))]
pub mod app;

pub use crate::context::{Context, OptionContext};
pub use crate::error::{Error, Result};

pub use crate::config::EngineConfig;
pub use crate::engine::Engine;
pub use crate::resource_manager::Codex;
pub use crate::scene::SceneDescription;

#[cfg(not(target_arch = "wasm32"))]
pub use crate::app::run;
