// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every setting has a compiled-in default. config.toml only overrides them,
// so a missing file is the normal case rather than an error.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

/// Number of frames the CPU may queue ahead of the GPU.
pub const DEFAULT_MAX_FRAMES_IN_FLIGHT: usize = 2;
pub const DEFAULT_WINDOW_WIDTH: u32 = 800;
pub const DEFAULT_WINDOW_HEIGHT: u32 = 600;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub content: ContentConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan".to_string(),
            width: DEFAULT_WINDOW_WIDTH,
            height: DEFAULT_WINDOW_HEIGHT,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Present modes in order of preference, best first.
    pub present_modes: Vec<String>,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Upper bound for MSAA; the device limit may lower it further.
    pub msaa_samples: u32,
    pub sampler_anisotropy: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_modes: ["mailbox", "fifo", "fifo_relaxed", "immediate"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: DEFAULT_MAX_FRAMES_IN_FLIGHT,
            msaa_samples: 8,
            sampler_anisotropy: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
        }
    }
}

/// Asset file names, resolved against the content directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub texture: String,
    pub vertex_shader: String,
    pub fragment_shader: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            texture: "texture.png".to_string(),
            vertex_shader: "shader.vert.spv".to_string(),
            fragment_shader: "shader.frag.spv".to_string(),
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
        let mut config: Config = toml::from_str(content)?;
        config.graphics.max_frames_in_flight = config.graphics.max_frames_in_flight.max(1);
        config.graphics.msaa_samples = config.graphics.msaa_samples.max(1);
        Ok(config)
    }

    /// Present modes as Vulkan enums, in preference order.
    ///
    /// Unknown names are skipped with a warning.
    pub fn present_mode_priority(&self) -> Vec<vk::PresentModeKHR> {
        self.graphics
            .present_modes
            .iter()
            .filter_map(|name| {
                let mode = parse_present_mode(name);
                if mode.is_none() {
                    log::warn!("Unknown present mode '{}', ignoring", name);
                }
                mode
            })
            .collect()
    }
}

fn parse_present_mode(name: &str) -> Option<vk::PresentModeKHR> {
    match name.to_lowercase().as_str() {
        "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
        "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
        "fifo" => Some(vk::PresentModeKHR::FIFO),
        "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
        _ => None,
    }
}
