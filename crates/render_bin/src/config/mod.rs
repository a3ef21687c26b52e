//! Render-bin configuration files
//!
//! Files are TOML or RON, picked by extension. Whatever is loaded goes
//! through [`Config::validate`] first, so a bin is never built from a file
//! it would reject at construction.

use std::path::{Path, PathBuf};

pub use serde::{Deserialize, Serialize};

/// Environment variable naming the configuration file [`Config::from_env`] loads
pub const CONFIG_PATH_ENV: &str = "RENDER_BIN_CONFIG";

/// On-disk encoding of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.toml`
    Toml,
    /// `.ron`
    Ron,
}

impl ConfigFormat {
    /// Encoding implied by the extension of `path`
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnsupportedFormat`] for any other extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("ron") => Ok(Self::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Serializable configuration with a validation hook
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Reject values the render bin cannot run with
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending value.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Decode and validate `contents`; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    fn parse(contents: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
            ConfigFormat::Ron => ron::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Decode and validate TOML text
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, ConfigFormat::Toml)
    }

    /// Load and validate a `.toml` or `.ron` file
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnsupportedFormat`], [`ConfigError::Io`],
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&contents, format)?;
        log::info!("Loaded render bin configuration from {}", path.display());
        Ok(config)
    }

    /// The file named by [`CONFIG_PATH_ENV`], or defaults when it is unset
    ///
    /// # Errors
    ///
    /// Whatever [`Config::load_from_file`] reports for the named file.
    fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_from_file(PathBuf::from(path)),
            None => {
                log::debug!("{CONFIG_PATH_ENV} not set; using default render bin configuration");
                Ok(Self::default())
            }
        }
    }

    /// Validate, then write in the format the extension names
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`], [`ConfigError::UnsupportedFormat`],
    /// [`ConfigError::Serialize`] or [`ConfigError::Io`].
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        self.validate()?;
        let contents = match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?,
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
        };
        std::fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("Cannot access configuration file {}: {source}", .path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Malformed TOML or RON
    #[error("Parse error: {0}")]
    Parse(String),

    /// Encoding failed
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Neither `.toml` nor `.ron`
    #[error("Unsupported configuration format: {} (expected .toml or .ron)", .0.display())]
    UnsupportedFormat(PathBuf),

    /// A value is outside its allowed range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
