//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use bytesize::ByteSize;
use thiserror::Error;
use tracing::{debug, info};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use bucketfs::fs::KernelListCacheTtl;

fn bucketfs_data_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::cache_dir() {
        return Some(path.join("bucketfs"));
    }

    dirs::home_dir().map(|home| home.join(".cache").join("bucketfs"))
}

/// The bucket to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BucketConfig {
    /// The bucket name, as it appears in cache keys.
    pub name: String,

    /// The directory whose files are the bucket's objects.
    pub root: PathBuf,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            name: "local".to_owned(),
            root: dirs::home_dir().map_or_else(|| PathBuf::from("/tmp/bucketfs/bucket"), |h| {
                h.join("bucket")
            }),
        }
    }
}

/// The file cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileCacheConfig {
    /// The path to the cache directory.
    pub path: PathBuf,

    /// The maximum number of downloaded bytes kept on disk.
    pub max_size: ByteSize,

    /// How many bytes a download fetches per remote read.
    pub sequential_read_size: ByteSize,

    /// Reload the file info snapshot left by the previous run.
    pub restore_on_start: bool,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            path: bucketfs_data_dir()
                .map_or_else(|| PathBuf::from("/tmp/bucketfs/cache"), |d| d.join("files")),
            max_size: ByteSize::gib(1),
            sequential_read_size: ByteSize::mib(8),
            restore_on_start: true,
        }
    }
}

/// Directory listing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ListCacheConfig {
    /// How long the kernel may keep a directory listing: seconds, `0` to disable, negative for
    /// forever.
    #[serde(rename = "kernel-list-cache-ttl-secs")]
    pub kernel_list_cache_ttl: KernelListCacheTtl,

    /// Let directory operations run concurrently.
    pub parallel_dirops: bool,
}

impl Default for ListCacheConfig {
    fn default() -> Self {
        Self {
            kernel_list_cache_ttl: KernelListCacheTtl::Disabled,
            parallel_dirops: true,
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub bucket: BucketConfig,

    #[serde(default)]
    pub file_cache: FileCacheConfig,

    #[serde(default)]
    pub list_cache: ListCacheConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parent directory does not exist.")]
    NoParentDir,

    #[error("No suitable configuration path found.")]
    NoSuitableConfigPath,
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bucket.name.is_empty() {
            errors.push("Bucket name must not be empty.".to_owned());
        }
        if self.bucket.name.contains('/') {
            errors.push(format!(
                "Bucket name '{}' must not contain '/'.",
                self.bucket.name
            ));
        }

        let max_size = self.file_cache.max_size.as_u64();
        let read_size = self.file_cache.sequential_read_size.as_u64();
        if max_size == 0 {
            errors.push("File cache max-size must be positive.".to_owned());
        }
        if read_size == 0 {
            errors.push("File cache sequential-read-size must be positive.".to_owned());
        }
        if read_size > max_size {
            errors.push(format!(
                "File cache sequential-read-size ({}) exceeds max-size ({}).",
                self.file_cache.sequential_read_size, self.file_cache.max_size
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("bucketfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("bucketfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/bucketfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config or creates a default if none exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_create(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(res) = Self::load(external_config_path) {
            let config = res?;
            if let Err(validation_errors) = config.validate() {
                return Err(ConfigError::ValidationErrors(validation_errors));
            }
            debug!("Loaded configuration successfully.");
            return Ok(config);
        }

        let creation_path = Self::config_search_paths()
            .into_iter()
            .next()
            .ok_or(ConfigError::NoSuitableConfigPath)?;

        let config = Self::default();
        config.write_to_disk(&creation_path)?;
        info!(path = ?creation_path.display(), "Created configuration file.");
        Ok(config)
    }

    fn write_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::create_dir_all(path.parent().ok_or(ConfigError::NoParentDir)?)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}
