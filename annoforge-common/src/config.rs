//! Configuration loading and the local settings store
//!
//! One TOML file carries bootstrap settings (logging, worker limit, scan
//! depth, inference command) and the `[session]` table that acts as the
//! Local Settings Store (last model, default prompt type).
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `ANNOFORGE_CONFIG` environment variable
//! 3. Platform config directory: `<config_dir>/annoforge/annoforge.toml`
//! 4. `./annoforge.toml` (fallback when no config directory is known)
//!
//! A missing file is never fatal: a warning is logged and compiled defaults
//! are used.

use crate::atomic_file::write_atomic;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "ANNOFORGE_CONFIG";

/// Config file name inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "annoforge.toml";

/// Complete TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    /// Local Settings Store contents
    #[serde(default)]
    pub session: SessionDefaults,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Generation scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Number of concurrent generation workers
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,

    /// Extension of caption sidecar files (without the dot)
    #[serde(default = "default_caption_extension")]
    pub caption_extension: String,
}

impl GenerationConfig {
    /// Worker limit clamped to at least one worker
    pub fn effective_worker_limit(&self) -> usize {
        self.worker_limit.max(1)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            worker_limit: default_worker_limit(),
            caption_extension: default_caption_extension(),
        }
    }
}

/// Corpus scanning settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Directory depth to traverse (1 = only the corpus folder itself)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

/// External inference command settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Program to run for each inference call (None = not configured)
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments; `{image}`, `{prompt}` and `{model}` are substituted
    #[serde(default = "default_inference_args")]
    pub args: Vec<String>,

    /// Per-call deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: default_inference_args(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Values persisted between runs by the Local Settings Store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Identifier of the model used last
    #[serde(default)]
    pub last_model: Option<String>,

    /// Prompt type assigned to newly discovered images
    #[serde(default = "default_prompt_type")]
    pub default_prompt_type: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            last_model: None,
            default_prompt_type: default_prompt_type(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_limit() -> usize {
    2
}

fn default_caption_extension() -> String {
    "txt".to_string()
}

fn default_max_depth() -> usize {
    1
}

fn default_inference_args() -> Vec<String> {
    vec!["{prompt}".to_string(), "{image}".to_string()]
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_prompt_type() -> String {
    "detailed_description".to_string()
}

/// Resolve which config file to use
pub fn resolve_config_path(cli_arg: Option<&Path>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: Platform config directory, then working directory
    dirs::config_dir()
        .map(|d| d.join("annoforge").join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

/// Load configuration, falling back to defaults when the file is missing
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file not found at {}, using compiled defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content).map_err(|source| Error::TomlParse {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), "Loaded TOML config");
    Ok(config)
}

/// Write configuration crash-safely, creating the parent directory if needed
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let serialized = toml::to_string_pretty(config)?;
    write_atomic(path, serialized.as_bytes())?;
    Ok(())
}

/// Local Settings Store backed by the `[session]` table of the config file
///
/// A save rewrites only `[session]`: other tables and keys (including ones
/// this version does not know) are kept, comments and formatting are not.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load `{last_model, default_prompt_type}`
    pub fn load_defaults(&self) -> Result<SessionDefaults> {
        Ok(load_toml_config(&self.path)?.session)
    }

    /// Persist defaults; returns `false` when nothing changed and the file
    /// was left alone
    pub fn save_defaults(&self, defaults: &SessionDefaults) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let exists = self.path.exists();
        let mut table = if exists {
            self.read_table()?
        } else {
            toml::Table::new()
        };

        let current: SessionDefaults = match table.get("session").cloned() {
            Some(value) => value.try_into().map_err(|source| Error::TomlParse {
                path: self.path.clone(),
                source,
            })?,
            None => SessionDefaults::default(),
        };
        if current == *defaults && exists {
            debug!("Session defaults unchanged, skipping write");
            return Ok(false);
        }

        table.insert("session".to_string(), toml::Value::try_from(defaults)?);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_atomic(&self.path, toml::to_string_pretty(&table)?.as_bytes())?;
        info!(path = %self.path.display(), "Session defaults saved");
        Ok(true)
    }

    fn read_table(&self) -> Result<toml::Table> {
        let content = std::fs::read_to_string(&self.path)?;
        content.parse().map_err(|source| Error::TomlParse {
            path: self.path.clone(),
            source,
        })
    }
}
