//! # Renderer Configuration
//!
//! Settings for the Vulkan presenter: application metadata, shader locations,
//! per-frame texture limits and how transient frame buffers are allocated.

use super::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directories searched, in order, when resolving shader file names
const SHADER_SEARCH_DIRS: [&str; 5] = [
    "target/shaders",
    "shaders",
    "resources/shaders",
    "crates/rust_compositor/resources/shaders",
    ".",
];

/// # Shader Configuration
///
/// Locations of the SPIR-V blobs used by the compositing pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// Path to the vertex shader SPIR-V file
    pub vertex_shader_path: PathBuf,
    /// Path to the fragment shader SPIR-V file
    pub fragment_shader_path: PathBuf,
}

impl ShaderConfig {
    /// Create a new shader configuration
    pub fn new(vertex_path: impl Into<PathBuf>, fragment_path: impl Into<PathBuf>) -> Self {
        Self {
            vertex_shader_path: vertex_path.into(),
            fragment_shader_path: fragment_path.into(),
        }
    }

    /// Create shader config with automatic path resolution
    ///
    /// Tries the usual build and resource directories so the demo can be
    /// started from the workspace root or from the crate directory.
    pub fn with_path_resolution(vertex_file: &str, fragment_file: &str) -> Self {
        Self {
            vertex_shader_path: resolve_shader(vertex_file),
            fragment_shader_path: resolve_shader(fragment_file),
        }
    }

    /// Validate that shader files exist
    pub fn validate(&self) -> Result<(), ConfigError> {
        for path in [&self.vertex_shader_path, &self.fragment_shader_path] {
            if !path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "shader not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::with_path_resolution("compositor.vert.spv", "compositor.frag.spv")
    }
}

fn resolve_shader(file: &str) -> PathBuf {
    SHADER_SEARCH_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(file))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| Path::new("target/shaders").join(file))
}

/// How the vertex, index and uniform buffers of a frame are backed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransientAllocation {
    /// One device memory allocation per buffer
    #[default]
    Dedicated,
    /// All three buffers share a single allocation at aligned offsets
    Packed,
}

/// Preferred presentation mode; FIFO is used when the preference is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PresentModePreference {
    /// Low-latency triple buffering
    #[default]
    Mailbox,
    /// Classic vsync, always available
    Fifo,
    /// No vsync, may tear
    Immediate,
}

/// # Vulkan Renderer Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Whether to enable Vulkan validation layers, `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Shader configuration
    pub shaders: ShaderConfig,
    /// Color written to the whole surface before views are drawn
    pub clear_color: [f32; 4],
    /// Size of the sampled-image array; views beyond it sample the default texture
    pub max_textures: u32,
    /// Backing strategy for per-frame transient buffers
    pub transient_allocation: TransientAllocation,
    /// Presentation mode to ask the surface for
    pub present_mode: PresentModePreference,
    /// Descriptor sets allocated from each descriptor pool before a new pool is made
    pub descriptor_sets_per_pool: u32,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            enable_validation: None,
            shaders: ShaderConfig::default(),
            clear_color: [0.8, 0.8, 0.8, 1.0],
            max_textures: 256,
            transient_allocation: TransientAllocation::default(),
            present_mode: PresentModePreference::default(),
            descriptor_sets_per_pool: 16,
        }
    }

    /// Set custom shader configuration
    #[must_use]
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Enable or disable validation layers
    #[must_use]
    pub const fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the size of the per-frame texture array
    #[must_use]
    pub const fn with_max_textures(mut self, max_textures: u32) -> Self {
        self.max_textures = max_textures;
        self
    }

    /// Choose how transient frame buffers are allocated
    #[must_use]
    pub const fn with_transient_allocation(mut self, strategy: TransientAllocation) -> Self {
        self.transient_allocation = strategy;
        self
    }

    /// Set the clear color
    #[must_use]
    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("application name cannot be empty".to_string()));
        }

        if self.max_textures == 0 {
            return Err(ConfigError::Invalid("max_textures must be at least 1".to_string()));
        }

        if self.descriptor_sets_per_pool == 0 {
            return Err(ConfigError::Invalid(
                "descriptor_sets_per_pool must be at least 1".to_string(),
            ));
        }

        if self.clear_color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(ConfigError::Invalid(format!(
                "clear color components must be within 0..=1, got {:?}",
                self.clear_color
            )));
        }

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Rust Compositor")
    }
}

impl Config for RendererConfig {}
impl Config for ShaderConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transient_allocation, TransientAllocation::Dedicated);
        assert_eq!(config.present_mode, PresentModePreference::Mailbox);
    }

    #[test]
    fn test_rejects_zero_textures() {
        let config = RendererConfig::default().with_max_textures(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_out_of_range_clear_color() {
        let config = RendererConfig::default().with_clear_color([1.5, 0.0, 0.0, 1.0]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_validation_overrides_build_type() {
        assert!(RendererConfig::default().with_validation(true).validation_enabled());
        assert!(!RendererConfig::default().with_validation(false).validation_enabled());
    }

    #[test]
    fn test_unresolved_shader_falls_back_to_build_dir() {
        let shaders = ShaderConfig::with_path_resolution("no_such.vert.spv", "no_such.frag.spv");
        assert_eq!(shaders.vertex_shader_path, Path::new("target/shaders/no_such.vert.spv"));
        assert!(shaders.validate().is_err());
    }
}
