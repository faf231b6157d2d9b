//! Core configuration.
//!
//! Values come from an optional TOML file, then `KVCHAT_*` environment
//! variables, then validation. The core never writes configuration back.

use kvchat_abstraction::{EngineParams, SamplingParams};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Context-size rounding unit.
pub const DEFAULT_ALIGNMENT: u32 = 256;

/// Tokens added on top of a document's count before sizing the context.
pub const DEFAULT_PADDING_TOKENS: u32 = 1000;

/// Smallest context ever allocated for ingestion.
pub const DEFAULT_MIN_CONTEXT: u32 = 2048;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "KVCHAT_";

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A key/value override could not be parsed.
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Raw value.
        value: String,
    },

    /// Invalid alignment (must be > 0).
    #[error("Invalid alignment: must be greater than 0")]
    InvalidAlignment,

    /// Invalid minimum context (must be > 0).
    #[error("Invalid minimum context: must be greater than 0")]
    InvalidMinContext,

    /// Invalid thread count (must be > 0).
    #[error("Invalid thread count: must be greater than 0")]
    InvalidThreads,

    /// Invalid batch size (must be > 0).
    #[error("Invalid batch size: must be greater than 0")]
    InvalidBatchSize,

    /// Invalid streaming interval (must be > 0).
    #[error("Invalid stream interval: must be greater than 0")]
    InvalidStreamEvery,

    /// Invalid temperature (must be within 0.0..=2.0).
    #[error("Invalid temperature {0}: must be between 0.0 and 2.0")]
    InvalidTemperature(f32),
}

/// Configuration for the cache lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    /// Directory holding state blobs and registry files.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Directory holding model weights.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Optional TOML file with custom model definitions.
    #[serde(default)]
    pub models_file: Option<PathBuf>,

    /// Model used when none is named explicitly.
    #[serde(default)]
    pub current_model_id: Option<String>,

    /// Engine worker threads.
    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Engine evaluation batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Layers offloaded to an accelerator.
    #[serde(default)]
    pub gpu_layers: u32,

    /// Context-size rounding unit (default: 256).
    #[serde(default = "default_alignment")]
    pub alignment: u32,

    /// Padding added to a document's token count (default: 1000).
    #[serde(default = "default_padding_tokens")]
    pub padding_tokens: u32,

    /// Minimum ingestion context (default: 2048).
    #[serde(default = "default_min_context")]
    pub min_context: u32,

    /// Per-turn generation budget (default: 1024).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature (default: 0.7).
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Tokens between streamed chunks (default: 8).
    #[serde(default = "default_stream_every")]
    pub stream_every: u32,

    /// Characters of the source document used as fallback context (default: 8000).
    #[serde(default = "default_fallback_excerpt_chars")]
    pub fallback_excerpt_chars: usize,

    /// History turns included in fallback prompts (default: 4).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Whether inference may load cached state.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn kvchat_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".kvchat")
}

fn default_store_dir() -> PathBuf {
    kvchat_home().join("kv_caches")
}

fn default_models_dir() -> PathBuf {
    kvchat_home().join("models")
}

fn default_threads() -> u32 {
    4
}

fn default_batch_size() -> u32 {
    512
}

fn default_alignment() -> u32 {
    DEFAULT_ALIGNMENT
}

fn default_padding_tokens() -> u32 {
    DEFAULT_PADDING_TOKENS
}

fn default_min_context() -> u32 {
    DEFAULT_MIN_CONTEXT
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_stream_every() -> u32 {
    8
}

fn default_fallback_excerpt_chars() -> usize {
    8000
}

fn default_history_limit() -> usize {
    4
}

fn default_use_cache() -> bool {
    true
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            models_dir: default_models_dir(),
            models_file: None,
            current_model_id: None,
            threads: default_threads(),
            batch_size: default_batch_size(),
            gpu_layers: 0,
            alignment: default_alignment(),
            padding_tokens: default_padding_tokens(),
            min_context: default_min_context(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            stream_every: default_stream_every(),
            fallback_excerpt_chars: default_fallback_excerpt_chars(),
            history_limit: default_history_limit(),
            use_cache: default_use_cache(),
        }
    }
}

/// Expands a leading `~` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }),
    }
}

impl CoreConfig {
    /// Loads configuration from `path` (defaults if absent), applies
    /// `KVCHAT_*` environment overrides, and validates.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed, an override
    /// is malformed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, std::env::vars())
    }

    /// Like [`CoreConfig::load`], with an explicit environment.
    ///
    /// # Errors
    /// See [`CoreConfig::load`].
    pub fn load_with_env(
        path: Option<&Path>,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
                debug!(path = %path.display(), "Loading configuration file");
                toml::from_str(&content)?
            }
            _ => Self::default(),
        };

        let overrides: HashMap<String, String> = env
            .into_iter()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        config.apply(&overrides)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from a flat key/value map.
    ///
    /// Keys are field names, case-insensitive, optionally prefixed with
    /// `KVCHAT_` (`store_dir`, `KVCHAT_THREADS`, ...). Unknown keys are ignored.
    ///
    /// # Errors
    /// Returns `ConfigError` if a value is malformed or validation fails.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply(map)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, map: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (raw_key, value) in map {
            let key = raw_key.strip_prefix(ENV_PREFIX).unwrap_or(raw_key).to_lowercase();
            match key.as_str() {
                "store_dir" => self.store_dir = PathBuf::from(value),
                "models_dir" => self.models_dir = PathBuf::from(value),
                "models_file" => self.models_file = Some(PathBuf::from(value)),
                "current_model_id" | "model" => self.current_model_id = Some(value.clone()),
                "threads" => self.threads = parse(raw_key, value)?,
                "batch_size" => self.batch_size = parse(raw_key, value)?,
                "gpu_layers" => self.gpu_layers = parse(raw_key, value)?,
                "alignment" => self.alignment = parse(raw_key, value)?,
                "padding_tokens" => self.padding_tokens = parse(raw_key, value)?,
                "min_context" => self.min_context = parse(raw_key, value)?,
                "max_tokens" => self.max_tokens = parse(raw_key, value)?,
                "temperature" => self.temperature = parse(raw_key, value)?,
                "stream_every" => self.stream_every = parse(raw_key, value)?,
                "fallback_excerpt_chars" => self.fallback_excerpt_chars = parse(raw_key, value)?,
                "history_limit" => self.history_limit = parse(raw_key, value)?,
                "use_cache" => self.use_cache = parse_bool(raw_key, value)?,
                _ => debug!(key = %raw_key, "Ignoring unknown configuration key"),
            }
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.store_dir = expand_home(&self.store_dir);
        self.models_dir = expand_home(&self.models_dir);
        self.models_file = self.models_file.as_deref().map(expand_home);
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alignment == 0 {
            return Err(ConfigError::InvalidAlignment);
        }
        if self.min_context == 0 {
            return Err(ConfigError::InvalidMinContext);
        }
        if self.threads == 0 {
            return Err(ConfigError::InvalidThreads);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.stream_every == 0 {
            return Err(ConfigError::InvalidStreamEvery);
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidTemperature(self.temperature));
        }
        Ok(())
    }

    /// Engine parameters for a given context size.
    #[must_use]
    pub fn engine_params(&self, context_size: u32) -> EngineParams {
        EngineParams {
            context_size,
            threads: self.threads,
            batch_size: self.batch_size,
            gpu_layers: self.gpu_layers,
        }
    }

    /// Default sampling parameters.
    #[must_use]
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams { temperature: self.temperature, max_tokens: self.max_tokens, seed: None }
    }

    /// Default config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        kvchat_home().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.alignment, 256);
        assert_eq!(config.padding_tokens, 1000);
        assert_eq!(config.min_context, 2048);
        assert_eq!(config.max_tokens, 1024);
        assert_eq!(config.stream_every, 8);
        assert_eq!(config.history_limit, 4);
        assert!(config.use_cache);
        assert!(config.store_dir.ends_with("kv_caches"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config =
            CoreConfig::load_with_env(Some(temp.path().join("none.toml").as_path()), Vec::new()).unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
store_dir = "/var/lib/kvchat"
threads = 8
alignment = 512
use_cache = false
"#,
        )
        .unwrap();

        let env = vec![
            ("KVCHAT_THREADS".to_string(), "2".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let config = CoreConfig::load_with_env(Some(path.as_path()), env).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/kvchat"));
        assert_eq!(config.threads, 2);
        assert_eq!(config.alignment, 512);
        assert!(!config.use_cache);
        assert_eq!(config.padding_tokens, 1000);
    }

    #[test]
    fn test_from_map() {
        let config = CoreConfig::from_map(&map(&[
            ("KVCHAT_MAX_TOKENS", "64"),
            ("temperature", "0"),
            ("Use_Cache", "no"),
            ("mystery", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.max_tokens, 64);
        assert!(config.temperature.abs() < f32::EPSILON);
        assert!(!config.use_cache);
    }

    #[test]
    fn test_from_map_rejects_bad_values() {
        let err = CoreConfig::from_map(&map(&[("threads", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = CoreConfig::from_map(&map(&[("alignment", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAlignment));

        let err = CoreConfig::from_map(&map(&[("temperature", "3.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTemperature(_)));

        let err = CoreConfig::from_map(&map(&[("use_cache", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_tilde_expansion() {
        let config = CoreConfig::from_map(&map(&[("store_dir", "~/caches")])).unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.store_dir, home.join("caches"));
        }
    }

    #[test]
    fn test_invalid_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "threads = [").unwrap();
        assert!(matches!(
            CoreConfig::load_with_env(Some(path.as_path()), Vec::new()),
            Err(ConfigError::TomlParse(_))
        ));
    }
}
