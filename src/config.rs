use std::fs;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::library::DEFAULT_TARGET_SIZE;
use crate::semantic::DEFAULT_MODEL;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Default number of numbered sample photos
const DEFAULT_SAMPLE_COUNT: usize = 10_000;
/// Default result count for the bundled samples
const DEFAULT_SAMPLE_LIMIT: usize = 3;
/// Default result count for a real library
const DEFAULT_DIRECTORY_LIMIT: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config is malformed: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryKind {
    #[default]
    Directory,
    Samples,
}

/// Where photos come from
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default)]
    pub kind: LibraryKind,

    /// Library root (or sample image directory). Defaults to `<base>/photos`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Number of numbered sample photos, only used by `samples`
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            kind: LibraryKind::default(),
            path: None,
            sample_count: DEFAULT_SAMPLE_COUNT,
        }
    }
}

fn default_sample_count() -> usize {
    DEFAULT_SAMPLE_COUNT
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Encoder pair name (e.g., "clip-vit-b-32")
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Timeout for model download and initialization in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Deadline for encoding a single photo, unbounded when unset
    #[serde(default)]
    pub encode_timeout_ms: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            encode_timeout_ms: None,
        }
    }
}

fn default_model_name() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Parallelism for feature extraction: "auto" or a positive integer
    #[serde(default = "default_embedding_parallelism")]
    pub embedding_parallelism: String,

    /// Side of the square image fed to the encoder
    #[serde(default = "default_target_size")]
    pub target_size: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            embedding_parallelism: default_embedding_parallelism(),
            target_size: DEFAULT_TARGET_SIZE,
        }
    }
}

fn default_embedding_parallelism() -> String {
    "auto".to_string()
}

fn default_target_size() -> u32 {
    DEFAULT_TARGET_SIZE
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results per search. Defaults depend on `library.kind`
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        // "auto" or positive integer
        if self.scan.embedding_parallelism != "auto" {
            match self.scan.embedding_parallelism.parse::<usize>() {
                Ok(n) if n > 0 => {}
                _ => {
                    return Err(ConfigError::Invalid {
                        field: "scan.embedding_parallelism",
                        message: format!(
                            "must be 'auto' or a positive integer, got '{}'",
                            self.scan.embedding_parallelism
                        ),
                    })
                }
            }
        }

        if self.scan.target_size == 0 {
            return Err(invalid("scan.target_size", "must be greater than 0"));
        }

        if self.model.download_timeout_secs == 0 {
            return Err(invalid("model.download_timeout_secs", "must be greater than 0"));
        }

        if self.model.encode_timeout_ms == Some(0) {
            return Err(invalid("model.encode_timeout_ms", "must be greater than 0"));
        }

        if self.model.name.trim().is_empty() {
            return Err(invalid("model.name", "must not be empty"));
        }

        if self.search.limit == Some(0) {
            return Err(invalid("search.limit", "must be greater than 0"));
        }

        if self.library.sample_count == 0 {
            return Err(invalid("library.sample_count", "must be greater than 0"));
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults when missing.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let config_path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !config_path.exists() {
            let config = Self {
                base_path: base_path.to_path_buf(),
                ..Default::default()
            };
            config.save()?;
            log::info!("created default config at {}", config_path.display());
            return Ok(config);
        }

        let config_str = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(&self)?;
        let io_err = |source| ConfigError::Io {
            path: self.base_path.join(CONFIG_FILE_NAME),
            source,
        };

        fs::create_dir_all(&self.base_path).map_err(io_err)?;

        let mut file = tempfile::NamedTempFile::new_in(&self.base_path).map_err(io_err)?;
        file.write_all(config_str.as_bytes()).map_err(io_err)?;
        file.persist(self.base_path.join(CONFIG_FILE_NAME))
            .map_err(|err| io_err(err.error))?;

        Ok(())
    }

    pub fn library_path(&self) -> PathBuf {
        self.library
            .path
            .clone()
            .unwrap_or_else(|| self.base_path.join("photos"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.base_path.join("features.sqlite3")
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.base_path.join("models")
    }

    pub fn parallelism(&self) -> usize {
        match self.scan.embedding_parallelism.parse::<NonZeroUsize>() {
            Ok(n) => n.get(),
            Err(_) => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }

    pub fn search_limit(&self) -> usize {
        self.search.limit.unwrap_or(match self.library.kind {
            LibraryKind::Samples => DEFAULT_SAMPLE_LIMIT,
            LibraryKind::Directory => DEFAULT_DIRECTORY_LIMIT,
        })
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.model.download_timeout_secs)
    }

    pub fn encode_timeout(&self) -> Option<Duration> {
        self.model.encode_timeout_ms.map(Duration::from_millis)
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}
