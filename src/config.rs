//! Process-wide settings, read from a YAML file at startup.

use std::path::{Path, PathBuf};

use log::{LevelFilter, debug, warn};
use serde::{Deserialize, Serialize};

use crate::blob;
use crate::error::ConfigError;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TRAILBLAZER_CONFIG";

/// Configuration file location relative to the home directory.
const DEFAULT_CONFIG: &str = ".trail/config.yaml";

/// Pipeline configuration.
///
/// Every key is optional in the file, missing keys take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Blob-store directory of the original uploads.
    pub data_root: String,
    /// Preview images.
    pub thumbnails: ThumbnailConfig,
    /// Plate-solver service.
    pub astrometry: AstrometryConfig,
    /// Log level of the command-line tools, e.g. `info` or `debug`.
    pub log_level: String,
    /// Filesystem root of the local blob store.
    pub blob_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: "upload/fits".to_string(),
            thumbnails: ThumbnailConfig::default(),
            astrometry: AstrometryConfig::default(),
            log_level: "info".to_string(),
            blob_root: PathBuf::from("."),
        }
    }
}

/// Settings of the preview images.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Blob-store directory of the small previews.
    pub small_root: String,
    /// Blob-store directory of the full-resolution previews.
    pub large_root: String,
    /// Width of the small previews in pixels.
    pub small_width: u32,
    /// JPEG quality, 1 to 100.
    pub jpeg_quality: u8,
    /// Downscaling factors of the large and small focal-plane mosaics.
    ///
    /// `None` uses the factors of each focal-plane layout.
    pub mosaic_scaling: Option<[usize; 2]>,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            small_root: "thumbnails/small".to_string(),
            large_root: "thumbnails/large".to_string(),
            small_width: 640,
            jpeg_quality: 30,
            mosaic_scaling: None,
        }
    }
}

/// Settings of the astrometry.net plate solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstrometryConfig {
    /// API key. Without one, images lacking a WCS cannot be processed.
    pub api_key: Option<String>,
    /// Base URL of the service.
    pub api_url: String,
    /// Time granted to one solve, in seconds.
    pub solve_timeout_secs: u64,
}

impl Default for AstrometryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://nova.astrometry.net".to_string(),
            solve_timeout_secs: 200,
        }
    }
}

impl Config {
    /// Parse and [`validate`](Config::validate()) a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the blob-store roots are relative paths without `..` components.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let roots = [
            ("data_root", &self.data_root),
            ("thumbnails.small_root", &self.thumbnails.small_root),
            ("thumbnails.large_root", &self.thumbnails.large_root),
        ];
        for (key, root) in roots {
            blob::validate(root).map_err(|_| ConfigError::InvalidRoot {
                key,
                path: root.clone(),
            })?;
        }
        Ok(())
    }

    /// Read the configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Load the configuration from `explicit`, else from the file named by
    /// [`CONFIG_ENV`], else from `~/.trail/config.yaml`.
    ///
    /// An explicitly requested file must exist. Otherwise a missing file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let Some(path) = resolve_path(explicit, env, home) else {
            warn!("No configuration file location known, using defaults.");
            return Ok(Self::default());
        };

        if explicit.is_none() && !path.exists() {
            debug!("{} does not exist, using defaults.", path.display());
            return Ok(Self::default());
        }
        debug!("Reading configuration from {}.", path.display());
        Self::from_file(&path)
    }

    /// The configured log level, `info` if it cannot be parsed.
    pub fn log_level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level {}, using info.", self.log_level);
            LevelFilter::Info
        })
    }
}

/// Pick the configuration file from an explicit path, the environment and the home directory.
pub fn resolve_path(
    explicit: Option<&Path>,
    env: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or(env)
        .or_else(|| home.map(|h| h.join(DEFAULT_CONFIG)))
}
