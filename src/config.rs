// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing file or a partial file is fine.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "frameloom".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred low-latency present mode. Falls back to FIFO_RELAXED when
    /// the surface does not offer it.
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Use a negative-height viewport for pipelines built by the demo
    pub flip_viewport_y: bool,
    /// Timeout for fence waits and image acquisition, in nanoseconds
    pub timeout_ns: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.13, 0.03, 0.11, 1.0],
            flip_viewport_y: false,
            timeout_ns: u64::MAX,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
        }
    }
}

/// SPIR-V paths for the demo pipeline
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Preferred present mode as a Vulkan enum
    pub fn preferred_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}
