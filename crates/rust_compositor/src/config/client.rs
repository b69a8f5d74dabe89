//! Window and top-level client configuration

use super::{Config, ConfigError, RendererConfig};
use serde::{Deserialize, Serialize};

/// Initial window settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Initial width in screen coordinates
    pub width: u32,
    /// Initial height in screen coordinates
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Rust Compositor".to_string(),
            width: 800,
            height: 600,
        }
    }
}

impl WindowConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "window must have a non-zero size, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Everything a compositor client reads at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Window settings
    pub window: WindowConfig,
    /// Renderer settings
    pub renderer: RendererConfig,
    /// Default `env_logger` filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            renderer: RendererConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate()?;
        self.renderer.validate()
    }
}

impl Config for WindowConfig {}
impl Config for ClientConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sized_window_is_rejected() {
        let mut config = ClientConfig::default();
        config.window.height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str("log_level = \"debug\"\n[window]\nwidth = 1024\n").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.renderer.max_textures, 256);
    }
}
