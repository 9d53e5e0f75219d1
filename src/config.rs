// src/config.rs
//! Engine configuration, read from `codex.json` next to the executable.
//!
//! Every field has a default, so a partial file (or no file) still yields a
//! usable config.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::Result;

pub const DEFAULT_CONFIG_FILE: &str = "codex.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetPaths {
    pub models: PathBuf,
    pub shaders: PathBuf,
    pub textures: PathBuf,
}

impl Default for AssetPaths {
    fn default() -> Self {
        Self {
            models: PathBuf::from("assets/models"),
            shaders: PathBuf::from("assets/shaders"),
            textures: PathBuf::from("assets/textures"),
        }
    }
}

impl AssetPaths {
    /// Resolve every directory against `root` (relative paths only).
    pub fn rooted_at(&self, root: &Path) -> Self {
        let join = |p: &PathBuf| if p.is_absolute() { p.clone() } else { root.join(p) };
        Self {
            models: join(&self.models),
            shaders: join(&self.shaders),
            textures: join(&self.textures),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Codex Engine".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub clear_color: [f64; 4],
    pub vsync: bool,
    /// Bytes reserved per frame for versioned constant-buffer contents.
    pub uniform_arena_bytes: u64,
    /// Texture bind groups kept alive between frames.
    pub bind_group_cache: usize,
    /// Seconds between frame-time log lines; 0 disables them.
    pub fps_log_interval: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync: true,
            uniform_arena_bytes: 4 * 1024 * 1024,
            bind_group_cache: 64,
            fps_log_interval: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub assets: AssetPaths,
    pub window: WindowConfig,
    pub render: RenderConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Ignoring config: {e}");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "window": { "width": 640 } }"#).unwrap();
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.assets, AssetPaths::default());
        assert!(config.render.vsync);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(EngineConfig::from_json_str("{ window: ").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(&dir.path().join("nope.json"));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_rooted_paths() {
        let paths = AssetPaths::default().rooted_at(Path::new("/game"));
        assert_eq!(paths.shaders, PathBuf::from("/game/assets/shaders"));
    }
}
