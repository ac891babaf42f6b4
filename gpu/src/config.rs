//! TOML configuration for `cinder.toml` and buffer manifests.
//!
//! ```toml
//! [driver]
//! backend = "dylib"            # "dylib", "wgpu" or "host"
//! library = "libcompute.so"
//! max-program-bytes = 16777216
//!
//! [host]
//! devices = 2
//! max-dispatch = [65535, 65535, 65535]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::buffer::{BufferDesc, BufferOptimization, BufferType};
use crate::driver::dylib::DEFAULT_MAX_PROGRAM_BYTES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "cannot read configuration: {}", msg),
            ConfigError::Parse(msg) => write!(f, "malformed configuration: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))
}

/// Which [`crate::driver::NativeDriver`] to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Native compute library loaded at runtime.
    Dylib,
    /// wgpu adapters (needs the `webgpu-backend` feature).
    Wgpu,
    /// In-memory driver without a GPU.
    #[default]
    Host,
}

/// `[driver]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DriverConfig {
    pub backend: Backend,
    /// Path of the native library (dylib backend only)
    pub library: Option<PathBuf>,
    /// Scratch size for saving compiled programs
    pub max_program_bytes: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            backend: Backend::default(),
            library: None,
            max_program_bytes: DEFAULT_MAX_PROGRAM_BYTES,
        }
    }
}

/// `[host]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HostConfig {
    pub devices: usize,
    pub max_dispatch: [u32; 3],
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            devices: 1,
            max_dispatch: [65535; 3],
        }
    }
}

/// Parsed `cinder.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub host: HostConfig,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.driver.max_program_bytes == 0 {
            return Err(ConfigError::Invalid("max-program-bytes must be positive".into()));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::parse(&read_file(path)?)?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }
}

/// One `[[buffer]]` table of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BufferSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: BufferType,
    pub custom_type: Option<String>,
    #[serde(default = "one")]
    pub count: usize,
    #[serde(default)]
    pub optimization: BufferOptimization,
    #[serde(default)]
    pub collection: bool,
    /// Element stride in bytes; required for custom types
    pub element_size: Option<usize>,
}

fn one() -> usize {
    1
}

impl BufferSpec {
    pub fn to_desc(&self) -> BufferDesc {
        BufferDesc {
            custom_type: self.custom_type.clone(),
            ..BufferDesc::new(self.name.clone(), self.ty, self.count)
        }
        .optimization(self.optimization)
        .collection(self.collection)
    }

    /// Explicit `element-size`, else the std430 stride of the built-in type.
    pub fn element_size(&self) -> Result<usize, ConfigError> {
        self.element_size
            .or_else(|| self.ty.std430_size())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "buffer '{}' has a custom type and needs element-size",
                    self.name
                ))
            })
    }
}

/// A list of buffers to declare, as read from a TOML manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BufferManifest {
    #[serde(rename = "buffer", default)]
    pub buffers: Vec<BufferSpec>,
}

impl BufferManifest {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&read_file(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.driver.backend, Backend::Host);
        assert_eq!(config.driver.max_program_bytes, DEFAULT_MAX_PROGRAM_BYTES);
        assert_eq!(config.host.devices, 1);
        assert_eq!(config.host.max_dispatch, [65535; 3]);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [driver]
            backend = "dylib"
            library = "/opt/gpu/libcompute.so"
            max-program-bytes = 4096

            [host]
            devices = 3
            max-dispatch = [64, 32, 16]
            "#,
        )
        .unwrap();
        assert_eq!(config.driver.backend, Backend::Dylib);
        assert_eq!(
            config.driver.library.as_deref(),
            Some(Path::new("/opt/gpu/libcompute.so"))
        );
        assert_eq!(config.driver.max_program_bytes, 4096);
        assert_eq!(config.host.devices, 3);
        assert_eq!(config.host.max_dispatch, [64, 32, 16]);
    }

    #[test]
    fn test_rejects_unknown_backend_and_zero_scratch() {
        assert!(matches!(
            Config::parse("[driver]\nbackend = \"cuda\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::parse("[driver]\nmax-program-bytes = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_buffer_manifest() {
        let manifest = BufferManifest::parse(
            r#"
            [[buffer]]
            name = "A"
            type = "float"
            count = 4
            optimization = "read-write"

            [[buffer]]
            name = "particles"
            type = "custom"
            custom-type = "Particle"
            collection = true
            element-size = 32
            "#,
        )
        .unwrap();

        assert_eq!(manifest.buffers.len(), 2);
        let a = &manifest.buffers[0];
        assert_eq!(a.element_size().unwrap(), 4);
        let desc = a.to_desc();
        assert_eq!(desc.count, 4);
        assert_eq!(desc.optimization, BufferOptimization::ReadWrite);

        let p = &manifest.buffers[1];
        assert_eq!(p.count, 1);
        assert_eq!(p.element_size().unwrap(), 32);
        let desc = p.to_desc();
        assert!(desc.is_array());
        assert_eq!(desc.custom_type.as_deref(), Some("Particle"));
    }

    #[test]
    fn test_custom_without_size_is_invalid() {
        let manifest = BufferManifest::parse(
            "[[buffer]]\nname = \"p\"\ntype = \"custom\"\ncustom-type = \"P\"\n",
        )
        .unwrap();
        assert!(matches!(
            manifest.buffers[0].element_size(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
