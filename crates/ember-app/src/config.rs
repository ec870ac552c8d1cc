//! Application configuration.

use std::path::{Path, PathBuf};

use ember_platform::WindowConfig;
use serde::Deserialize;
use thiserror::Error;

/// Upper bound on frame slots; more only adds latency.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Application configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Whether the user may resize the window.
    pub resizable: bool,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Clear color of the swapchain image, linear RGBA.
    pub clear_color: [f32; 4],
    /// Directory holding compiled SPIR-V shaders.
    pub shader_dir: PathBuf,
    /// Texture to display; None for a generated one.
    pub texture: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Ember".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
            vsync: true,
            validation: cfg!(debug_assertions),
            target_fps: None,
            frames_in_flight: 2,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            shader_dir: PathBuf::from("shaders"),
            texture: None,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| {
            tracing::error!("Config parse error: {e}");
            ConfigError::from(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| {
            tracing::error!("Failed to read config {}: {source}", path.display());
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "window size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "frames_in_flight must be between 1 and {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.target_fps == Some(0) {
            return Err(ConfigError::Invalid("target_fps must be positive".into()));
        }
        Ok(())
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Allow or forbid window resizing.
    pub fn with_resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    pub fn with_texture(mut self, path: impl Into<PathBuf>) -> Self {
        self.texture = Some(path.into());
        self
    }

    /// Window settings derived from this config.
    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            title: self.title.clone(),
            width: self.width,
            height: self.height,
            resizable: self.resizable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = AppConfig::from_toml_str(
            r#"
            title = "Quad"
            width = 800
            height = 600
            resizable = false
            vsync = false
            target_fps = 144
            frames_in_flight = 3
            clear_color = [1.0, 0.0, 0.0, 1.0]
            texture = "assets/crate.png"
            "#,
        )
        .unwrap();

        assert_eq!(config.title, "Quad");
        assert_eq!((config.width, config.height), (800, 600));
        assert!(!config.resizable);
        assert!(!config.vsync);
        assert_eq!(config.target_fps, Some(144));
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.texture, Some(PathBuf::from("assets/crate.png")));
        assert_eq!(config.shader_dir, PathBuf::from("shaders"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = AppConfig::from_toml_str("vsinc = true").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for source in [
            "width = 0",
            "frames_in_flight = 0",
            "frames_in_flight = 9",
            "target_fps = 0",
        ] {
            let err = AppConfig::from_toml_str(source).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{source}");
        }
    }

    #[test]
    fn missing_file_reports_path() {
        let err = AppConfig::load("definitely/not/here.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => assert_eq!(path, PathBuf::from("definitely/not/here.toml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn builder_sets_fields() {
        let config = AppConfig::new("Builder")
            .with_size(640, 480)
            .with_resizable(false)
            .with_vsync(false)
            .with_target_fps(30)
            .with_frames_in_flight(3)
            .with_texture("tex.png");

        assert_eq!(config.title, "Builder");
        assert_eq!(config.target_fps, Some(30));
        assert!(config.validate().is_ok());

        let window = config.window_config();
        assert_eq!((window.width, window.height), (640, 480));
        assert!(!window.resizable);
    }
}
