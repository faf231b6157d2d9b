//! Model catalog.
//!
//! Combines a built-in table of known models with user-defined models read
//! from a TOML file:
//!
//! ```toml
//! [[models]]
//! id = "handbook"
//! name = "Handbook corpus"
//! path = "/models/handbook.ngram"
//! context_window = 8192
//! kind = "ngram"
//! ```
//!
//! Model weights live in a models directory as `*.ngram` files unless an entry
//! names an explicit path.

use crate::EngineKind;
use kvchat_abstraction::ModelDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Context window assumed for models that do not declare one.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// File extension of model weights in the models directory.
pub const MODEL_EXTENSION: &str = "ngram";

/// Errors from catalog loading and persistence.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Reading or writing the custom model file failed.
    #[error("Failed to access {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The custom model file is not valid TOML.
    #[error("Failed to parse model catalog: {0}")]
    Parse(#[from] toml::de::Error),

    /// The catalog could not be serialized.
    #[error("Failed to serialize model catalog: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An entry is unusable.
    #[error("Invalid model entry: {0}")]
    Invalid(String),
}

/// A catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Model identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Explicit weights path. Overrides `filename`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Weights file name inside the models directory.
    #[serde(default)]
    pub filename: Option<String>,
    /// Maximum context window.
    #[serde(default)]
    pub context_window: Option<u32>,
    /// Engine backend.
    #[serde(default)]
    pub kind: EngineKind,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

impl CatalogEntry {
    /// Creates an entry pointing at an explicit weights file.
    #[must_use]
    pub fn custom(id: impl Into<String>, path: impl Into<PathBuf>, context_window: u32) -> Self {
        Self {
            id: id.into(),
            name: None,
            path: Some(path.into()),
            filename: None,
            context_window: Some(context_window),
            kind: EngineKind::Ngram,
            description: String::new(),
        }
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn filename_or_default(&self) -> String {
        self.filename.clone().unwrap_or_else(|| format!("{}.{MODEL_EXTENSION}", self.id))
    }
}

/// A model whose weights were found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableModel {
    /// Descriptor handed to engine loaders.
    pub descriptor: ModelDescriptor,
    /// Backend that loads it.
    pub kind: EngineKind,
    /// Display name.
    pub name: String,
    /// Weights size in bytes.
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<CatalogEntry>,
}

fn known_models() -> Vec<CatalogEntry> {
    let known = [
        ("tiny-ngram-4k", "Tiny n-gram 4K", 4096, "Small corpus model for quick experiments"),
        ("ngram-32k", "N-gram 32K", 32_768, "General corpus model with a 32K window"),
        ("ngram-128k", "N-gram 128K", 128_000, "Large-window corpus model for long documents"),
    ];
    known
        .into_iter()
        .map(|(id, name, window, description)| CatalogEntry {
            id: id.to_string(),
            name: Some(name.to_string()),
            path: None,
            filename: Some(format!("{id}.{MODEL_EXTENSION}")),
            context_window: Some(window),
            kind: EngineKind::Ngram,
            description: description.to_string(),
        })
        .collect()
}

/// Known and custom models, resolved against a models directory.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models_dir: PathBuf,
    custom_file: Option<PathBuf>,
    entries: BTreeMap<String, CatalogEntry>,
}

impl ModelCatalog {
    /// Loads the catalog. A missing custom file means no custom models.
    ///
    /// # Errors
    /// Returns an error if the custom file exists but cannot be read or parsed.
    pub fn load(
        models_dir: impl Into<PathBuf>,
        custom_file: Option<PathBuf>,
    ) -> Result<Self, CatalogError> {
        let mut entries: BTreeMap<String, CatalogEntry> =
            known_models().into_iter().map(|e| (e.id.clone(), e)).collect();

        if let Some(path) = custom_file.as_deref().filter(|p| p.exists()) {
            let content = std::fs::read_to_string(path)
                .map_err(|source| CatalogError::Io { path: path.to_path_buf(), source })?;
            let file: CatalogFile = toml::from_str(&content)?;
            info!(path = %path.display(), count = file.models.len(), "Loaded custom models");
            // Custom definitions take precedence over the built-in table.
            for entry in file.models {
                entries.insert(entry.id.clone(), entry);
            }
        }

        Ok(Self { models_dir: models_dir.into(), custom_file, entries })
    }

    /// Directory scanned for weights.
    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Every known entry, whether or not its weights are present.
    #[must_use]
    pub fn known(&self) -> Vec<CatalogEntry> {
        self.entries.values().cloned().collect()
    }

    fn weights_path(&self, entry: &CatalogEntry) -> PathBuf {
        entry.path.clone().unwrap_or_else(|| self.models_dir.join(entry.filename_or_default()))
    }

    fn available_from(&self, id: &str, entry: Option<&CatalogEntry>, path: PathBuf) -> Option<AvailableModel> {
        let size = std::fs::metadata(&path).ok().filter(std::fs::Metadata::is_file)?.len();
        let context_window =
            entry.and_then(|e| e.context_window).unwrap_or(DEFAULT_CONTEXT_WINDOW);
        Some(AvailableModel {
            descriptor: ModelDescriptor::new(id, path, context_window),
            kind: entry.map_or(EngineKind::Ngram, |e| e.kind),
            name: entry.map_or_else(|| id.to_string(), |e| e.display_name().to_string()),
            size,
        })
    }

    fn id_for_filename(&self, filename: &str) -> String {
        for entry in self.entries.values() {
            if entry.filename_or_default().eq_ignore_ascii_case(filename) {
                return entry.id.clone();
            }
        }
        Path::new(filename)
            .file_stem()
            .map_or_else(|| filename.to_lowercase(), |s| s.to_string_lossy().to_lowercase())
    }

    /// Models whose weights exist: catalog entries plus stray `*.ngram` files.
    #[must_use]
    pub fn available(&self) -> Vec<AvailableModel> {
        let mut found: BTreeMap<String, AvailableModel> = BTreeMap::new();

        for entry in self.entries.values() {
            if let Some(model) = self.available_from(&entry.id, Some(entry), self.weights_path(entry)) {
                found.insert(entry.id.clone(), model);
            }
        }

        match std::fs::read_dir(&self.models_dir) {
            Ok(dir) => {
                for item in dir.flatten() {
                    let path = item.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(MODEL_EXTENSION) {
                        continue;
                    }
                    let filename = item.file_name().to_string_lossy().into_owned();
                    let id = self.id_for_filename(&filename);
                    if found.contains_key(&id) {
                        continue;
                    }
                    if let Some(model) = self.available_from(&id, self.entries.get(&id), path) {
                        found.insert(id, model);
                    }
                }
            }
            Err(e) => {
                debug!(dir = %self.models_dir.display(), error = %e, "Models directory not readable");
            }
        }

        found.into_values().collect()
    }

    /// Resolves a model id to a loadable model.
    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<AvailableModel> {
        if let Some(entry) = self.entries.get(model_id) {
            return self.available_from(model_id, Some(entry), self.weights_path(entry));
        }
        let path = self.models_dir.join(format!("{model_id}.{MODEL_EXTENSION}"));
        self.available_from(model_id, None, path)
    }

    /// Resolves a model id to its descriptor.
    #[must_use]
    pub fn descriptor(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.get(model_id).map(|m| m.descriptor)
    }

    /// Adds or replaces a custom model and persists the custom file.
    ///
    /// # Errors
    /// Returns an error if the entry is invalid, no custom file is configured,
    /// or the file cannot be written.
    pub fn register_custom(&mut self, entry: CatalogEntry) -> Result<(), CatalogError> {
        if entry.id.trim().is_empty() {
            return Err(CatalogError::Invalid("model id must not be empty".to_string()));
        }
        if entry.context_window == Some(0) {
            return Err(CatalogError::Invalid(format!("{}: context window must be positive", entry.id)));
        }
        let Some(path) = self.custom_file.clone() else {
            return Err(CatalogError::Invalid("no custom model file configured".to_string()));
        };

        let mut file = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|source| CatalogError::Io { path: path.clone(), source })?;
            toml::from_str::<CatalogFile>(&content)?
        } else {
            CatalogFile::default()
        };
        file.models.retain(|m| m.id != entry.id);
        file.models.push(entry.clone());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| CatalogError::Io { path: parent.to_path_buf(), source })?;
        }
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&path, content).map_err(|source| CatalogError::Io { path: path.clone(), source })?;

        if self.entries.insert(entry.id.clone(), entry).is_some() {
            warn!(path = %path.display(), "Replaced existing model definition");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_models_without_weights_are_not_available() {
        let dir = TempDir::new().unwrap();
        let catalog = ModelCatalog::load(dir.path(), None).unwrap();
        assert!(catalog.known().len() >= 3);
        assert!(catalog.available().is_empty());
        assert!(catalog.get("ngram-32k").is_none());
    }

    #[test]
    fn test_known_model_resolves_when_weights_present() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tiny-ngram-4k.ngram"), "hello").unwrap();
        let catalog = ModelCatalog::load(dir.path(), None).unwrap();

        let model = catalog.get("tiny-ngram-4k").unwrap();
        assert_eq!(model.descriptor.context_window, 4096);
        assert_eq!(model.size, 5);
        assert_eq!(model.name, "Tiny n-gram 4K");
    }

    #[test]
    fn test_unknown_file_defaults_context_window() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("My-Corpus.ngram"), "text").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let catalog = ModelCatalog::load(dir.path(), None).unwrap();

        let available = catalog.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].descriptor.id, "my-corpus");
        assert_eq!(available[0].descriptor.context_window, DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn test_register_custom_persists() {
        let dir = TempDir::new().unwrap();
        let weights = dir.path().join("elsewhere.txt");
        std::fs::write(&weights, "corpus").unwrap();
        let custom_file = dir.path().join("config").join("models.toml");

        let mut catalog = ModelCatalog::load(dir.path(), Some(custom_file.clone())).unwrap();
        catalog.register_custom(CatalogEntry::custom("handbook", &weights, 8192)).unwrap();
        assert_eq!(catalog.descriptor("handbook").unwrap().path, weights);

        let reloaded = ModelCatalog::load(dir.path(), Some(custom_file)).unwrap();
        let model = reloaded.get("handbook").unwrap();
        assert_eq!(model.descriptor.context_window, 8192);
        assert_eq!(model.kind, EngineKind::Ngram);
    }

    #[test]
    fn test_register_custom_validation() {
        let dir = TempDir::new().unwrap();
        let mut catalog = ModelCatalog::load(dir.path(), None).unwrap();
        let err = catalog.register_custom(CatalogEntry::custom("x", "/x", 10)).unwrap_err();
        assert!(matches!(err, CatalogError::Invalid(_)));

        let mut catalog =
            ModelCatalog::load(dir.path(), Some(dir.path().join("m.toml"))).unwrap();
        assert!(catalog.register_custom(CatalogEntry::custom(" ", "/x", 10)).is_err());
        assert!(catalog.register_custom(CatalogEntry::custom("x", "/x", 0)).is_err());
    }

    #[test]
    fn test_custom_file_parse_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("models.toml");
        std::fs::write(&file, "[[models]]\nid = 3").unwrap();
        assert!(matches!(
            ModelCatalog::load(dir.path(), Some(file)),
            Err(CatalogError::Parse(_))
        ));
    }
}
