//! Per-request inference strategy selection.
//!
//! Selection is a pure function of the inputs so every branch can be tested
//! without engines or files.

use crate::events::CacheStatus;
use crate::store::CacheEntry;
use crate::warm::WarmSnapshot;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// How a turn will be generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Reuse the resident warm instance.
    TrueCacheWarm {
        /// Resident cache.
        cache: CacheEntry,
    },
    /// Load the model and cache state for this turn only.
    TrueCacheTemporary {
        /// Cache to load.
        cache: CacheEntry,
    },
    /// Prompt completion with an excerpt of the source document.
    FallbackWithContext {
        /// Document the excerpt is read from.
        document_path: PathBuf,
        /// Why no cache is used.
        reason: FallbackReason,
    },
    /// Prompt completion without document context.
    FallbackPlain {
        /// Why no cache is used.
        reason: FallbackReason,
    },
}

/// Why a turn runs without cached state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FallbackReason {
    /// Cache usage is switched off.
    CacheDisabled,
    /// No cache is selected and no master exists.
    NoCache,
    /// The chosen cache's blob is gone.
    MissingFile {
        /// Missing blob.
        path: PathBuf,
    },
    /// The cache belongs to another model.
    Incompatible {
        /// Model recorded for the cache.
        cache_model: String,
        /// Model in use.
        requested_model: String,
    },
    /// Restoring the state failed.
    LoadFailed {
        /// Failure description.
        message: String,
    },
}

impl Strategy {
    /// Short name used in logs and turn outcomes.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::TrueCacheWarm { .. } => "true_cache_warm",
            Self::TrueCacheTemporary { .. } => "true_cache_temporary",
            Self::FallbackWithContext { .. } => "fallback_with_context",
            Self::FallbackPlain { .. } => "fallback_plain",
        }
    }

    /// Whether the turn reuses saved state.
    #[must_use]
    pub fn is_true_kv(&self) -> bool {
        matches!(self, Self::TrueCacheWarm { .. } | Self::TrueCacheTemporary { .. })
    }

    /// Cache used, for true-KV strategies.
    #[must_use]
    pub fn cache(&self) -> Option<&CacheEntry> {
        match self {
            Self::TrueCacheWarm { cache } | Self::TrueCacheTemporary { cache } => Some(cache),
            _ => None,
        }
    }

    /// Status reported while the turn runs.
    #[must_use]
    pub fn status(&self) -> CacheStatus {
        match self {
            Self::TrueCacheWarm { .. } => CacheStatus::Warmed,
            Self::TrueCacheTemporary { .. } => CacheStatus::UsingTempCache,
            Self::FallbackWithContext { .. } | Self::FallbackPlain { .. } => CacheStatus::Fallback,
        }
    }

    /// Fallback strategy for `reason`, using `document` as context when known.
    #[must_use]
    pub fn fallback(document: Option<&Path>, reason: FallbackReason) -> Self {
        match document {
            Some(path) => Self::FallbackWithContext { document_path: path.to_path_buf(), reason },
            None => Self::FallbackPlain { reason },
        }
    }
}

/// A cache considered for a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCandidate {
    /// Registry entry.
    pub entry: CacheEntry,
    /// Whether the blob currently exists.
    pub file_exists: bool,
}

impl CacheCandidate {
    /// Candidate for `entry`, checking the blob on disk.
    #[must_use]
    pub fn inspect(entry: CacheEntry) -> Self {
        let file_exists = entry.storage_path.is_file();
        Self { entry, file_exists }
    }
}

/// Everything selection depends on.
#[derive(Debug, Clone)]
pub struct StrategyInput<'a> {
    /// Whether cached state may be loaded at all.
    pub use_cache: bool,
    /// Model that will generate.
    pub model_id: &'a str,
    /// Explicitly selected cache, if any.
    pub selected: Option<CacheCandidate>,
    /// Master cache, if any.
    pub master: Option<CacheCandidate>,
    /// Warm slot state.
    pub warm: &'a WarmSnapshot,
}

/// Selection result plus a warning worth surfacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Chosen strategy.
    pub strategy: Strategy,
    /// Set when the turn degraded for a reason the user should see.
    pub warning: Option<String>,
}

fn source_document(candidate: Option<&CacheCandidate>) -> Option<&Path> {
    candidate.and_then(|c| c.entry.source_document_path.as_deref())
}

/// Chooses how to generate one turn.
///
/// 1. Cache enabled and the selected (or master) cache is warm in this
///    model: warm instance.
/// 2. Cache enabled and the selected cache's blob exists: temporary load.
/// 3. Cache enabled, nothing selected, a master exists with its blob: the
///    master through a temporary load.
/// 4. Otherwise fallback, with the source document as context when known.
///
/// A cache produced by another model (or of unknown origin) is never
/// chosen for state loading; the turn falls back with a warning.
#[must_use]
pub fn select(input: &StrategyInput<'_>) -> Selection {
    let context = source_document(input.selected.as_ref()).or_else(|| {
        if input.selected.is_none() { source_document(input.master.as_ref()) } else { None }
    });

    if !input.use_cache {
        return Selection { strategy: Strategy::fallback(context, FallbackReason::CacheDisabled), warning: None };
    }

    let mut warning = None;
    let candidate = match &input.selected {
        Some(selected) if selected.file_exists => Some(selected),
        Some(selected) => {
            warning = Some(format!(
                "Selected cache file {} no longer exists; using the master cache if available",
                selected.entry.storage_path.display()
            ));
            input.master.as_ref().filter(|m| m.file_exists)
        }
        None => input.master.as_ref().filter(|m| m.file_exists),
    };

    let Some(candidate) = candidate else {
        let reason = match &input.selected {
            Some(selected) => FallbackReason::MissingFile { path: selected.entry.storage_path.clone() },
            None => FallbackReason::NoCache,
        };
        return Selection { strategy: Strategy::fallback(context, reason), warning };
    };

    let entry = &candidate.entry;
    if !entry.is_loadable_into(input.model_id) {
        let document = entry.source_document_path.as_deref().or(context);
        return Selection {
            strategy: Strategy::fallback(
                document,
                FallbackReason::Incompatible {
                    cache_model: entry.owning_model_id.clone(),
                    requested_model: input.model_id.to_string(),
                },
            ),
            warning: Some(format!(
                "Cache '{}' was created with model '{}' and cannot be used with '{}'; answering without it",
                entry.id, entry.owning_model_id, input.model_id
            )),
        };
    }

    let strategy = if input.warm.holds(&entry.storage_path, input.model_id) {
        Strategy::TrueCacheWarm { cache: entry.clone() }
    } else {
        Strategy::TrueCacheTemporary { cache: entry.clone() }
    };
    Selection { strategy, warning }
}
