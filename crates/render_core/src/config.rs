//! Configuration system
//!
//! Render settings are plain serde structs with builder-style setters. They can
//! be read from and written to `.toml` or `.ron` files through [`Config`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match extension(path) {
            Some("toml") => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            Some("ron") => ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// Save configuration to file
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match extension(path) {
            Some("toml") => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            Some("ron") => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
            _ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };

        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Values are out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which [`GpuDevice`](crate::device::GpuDevice) implementation to create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Software timeline, no GPU required
    Headless,
    /// Vulkan with ray-tracing extensions
    Vulkan,
}

/// Order in which the headless display hands out back buffers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackBufferOrder {
    /// 0, 1, .., N-1, 0, ..
    RoundRobin,
    /// Repeats the given index sequence
    Sequence(Vec<usize>),
}

/// Settings for the headless backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    /// Simulated execution time per submitted batch
    pub latency_ms: u64,
    /// Back buffer rotation
    pub back_buffer_order: BackBufferOrder,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            back_buffer_order: BackBufferOrder::RoundRobin,
        }
    }
}

/// # Render Configuration
///
/// Everything `LightingEngine::initialize` needs besides the device itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Wait for vertical blank on present
    pub vsync: bool,
    /// Number of frame slots (and back buffers)
    pub frame_count: usize,
    /// Backend selection
    pub backend: BackendKind,
    /// Whether to enable Vulkan validation layers
    pub enable_validation: Option<bool>,
    /// Upper bound on any single fence wait
    pub fence_timeout_ms: u64,
    /// Directory holding compiled ray-tracing programs
    pub shader_dir: PathBuf,
    /// Wavefront OBJ model; the unit cube is used when unset
    pub model: Option<PathBuf>,
    /// Texture image; a generated checkerboard is used when unset
    pub texture: Option<PathBuf>,
    /// Headless backend settings
    pub headless: HeadlessConfig,
}

impl RenderConfig {
    /// Create a configuration with the given output size
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Set the number of frame slots
    pub fn with_frame_count(mut self, frames: usize) -> Self {
        self.frame_count = frames;
        self
    }

    /// Select the backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Enable or disable vsync
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the fence wait timeout
    pub fn with_fence_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.fence_timeout_ms = timeout_ms;
        self
    }

    /// Set the compiled shader directory
    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    /// Load the given OBJ model instead of the unit cube
    pub fn with_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.model = Some(path.into());
        self
    }

    /// Load the given texture instead of the checkerboard
    pub fn with_texture(mut self, path: impl Into<PathBuf>) -> Self {
        self.texture = Some(path.into());
        self
    }

    /// Set headless backend settings
    pub fn with_headless(mut self, headless: HeadlessConfig) -> Self {
        self.headless = headless;
        self
    }

    /// Validation layers on unless explicitly disabled in release builds
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Fence timeout as a duration
    pub const fn fence_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fence_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("Output size must be non-zero, got {}x{}", self.width, self.height));
        }

        if !(2..=4).contains(&self.frame_count) {
            return Err(format!("Frame count must be between 2 and 4, got {}", self.frame_count));
        }

        if self.fence_timeout_ms == 0 {
            return Err("Fence timeout must be greater than zero".to_string());
        }

        if let BackBufferOrder::Sequence(order) = &self.headless.back_buffer_order {
            if order.is_empty() {
                return Err("Back buffer sequence cannot be empty".to_string());
            }
            if let Some(bad) = order.iter().find(|&&index| index >= self.frame_count) {
                return Err(format!(
                    "Back buffer index {bad} out of range for {} frames",
                    self.frame_count
                ));
            }
        }

        Ok(())
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            vsync: false,
            frame_count: 3,
            backend: BackendKind::Headless,
            enable_validation: None,
            fence_timeout_ms: 5000,
            shader_dir: PathBuf::from("shaders"),
            model: None,
            texture: None,
            headless: HeadlessConfig::default(),
        }
    }
}

impl Config for RenderConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RenderConfig::default();
        assert_eq!(config.frame_count, 3);
        assert_eq!((config.width, config.height), (640, 360));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RenderConfig::default().with_frame_count(1).validate().is_err());
        assert!(RenderConfig::default().with_frame_count(5).validate().is_err());
        assert!(RenderConfig::new(0, 10).validate().is_err());
        assert!(RenderConfig::default().with_fence_timeout_ms(0).validate().is_err());

        let headless = HeadlessConfig {
            latency_ms: 0,
            back_buffer_order: BackBufferOrder::Sequence(vec![0, 3]),
        };
        assert!(RenderConfig::default().with_headless(headless).validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.toml");

        let config = RenderConfig::new(800, 600)
            .with_vsync(true)
            .with_model("models/quad.obj")
            .with_headless(HeadlessConfig {
                latency_ms: 2,
                back_buffer_order: BackBufferOrder::Sequence(vec![0, 2, 1]),
            });
        config.save_to_file(&path).unwrap();

        let loaded = RenderConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_ron_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.ron");

        let config = RenderConfig::default().with_backend(BackendKind::Vulkan).with_validation(false);
        config.save_to_file(&path).unwrap();

        let loaded = RenderConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!loaded.validation_enabled());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "width = 1280\nheight = 720\n").unwrap();

        let loaded = RenderConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.width, 1280);
        assert_eq!(loaded.frame_count, 3);
    }

    #[test]
    fn test_unsupported_extension() {
        let result = RenderConfig::load_from_file("render.yaml");
        assert!(matches!(result, Err(ConfigError::Io(_)) | Err(ConfigError::UnsupportedFormat(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(
            RenderConfig::load_from_file(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
