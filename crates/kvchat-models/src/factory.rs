//! Engine factory keyed by backend kind.

use crate::{MockLoader, NgramLoader};
use kvchat_abstraction::EngineLoader;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};

/// Engine backend enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Offline byte-level n-gram engine.
    #[default]
    Ngram,
    /// Scripted mock engine for testing.
    Mock,
}

impl FromStr for EngineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ngram" | "n-gram" => Ok(Self::Ngram),
            "mock" => Ok(Self::Mock),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ngram => write!(f, "ngram"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Factory for creating engine loaders.
pub struct EngineFactory;

impl EngineFactory {
    /// Returns the loader for `kind`.
    #[must_use]
    pub fn loader(kind: EngineKind) -> Arc<dyn EngineLoader> {
        debug!(kind = %kind, "Creating engine loader");
        match kind {
            EngineKind::Ngram => Arc::new(NgramLoader),
            EngineKind::Mock => Arc::new(MockLoader::default()),
        }
    }

    /// Returns the loader for a backend named by string.
    ///
    /// # Errors
    /// Returns an error message if the backend name is unrecognized.
    pub fn loader_from_str(kind: &str) -> Result<Arc<dyn EngineLoader>, String> {
        let kind = EngineKind::from_str(kind).map_err(|()| {
            error!(kind = %kind, "Unrecognized engine kind");
            format!("Unrecognized engine kind: {}", kind)
        })?;
        Ok(Self::loader(kind))
    }
}
