//! Document ingestion: source document plus model in, registered cache out.
//!
//! [`IngestionPipeline::run`] is blocking. Callers run it on a background
//! worker; it reports through the event bus and returns a structured
//! [`IngestFailure`] naming the stage that failed.

use super::persist::persist_state;
use super::sizing::ContextSizing;
use super::tokens::{FitReport, document_id_from_path, estimate_file};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::store::{CacheEntry, CacheRegistration, CacheStore, DocumentRecord};
use chrono::Utc;
use kvchat_abstraction::{EngineLoader, LanguageEngine, ModelDescriptor};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pipeline step, reported with failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    /// Waiting for a background worker.
    Schedule,
    /// Checking the source document.
    Validate,
    /// Estimating tokens and sizing the context.
    Estimate,
    /// Loading the model.
    LoadModel,
    /// Tokenizing and evaluating the document.
    Evaluate,
    /// Writing the state blob.
    Persist,
    /// Recording the cache.
    Register,
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Schedule => "scheduling",
            Self::Validate => "validation",
            Self::Estimate => "token estimation",
            Self::LoadModel => "model loading",
            Self::Evaluate => "evaluation",
            Self::Persist => "state persistence",
            Self::Register => "registration",
        };
        f.write_str(label)
    }
}

/// Structured ingestion failure.
#[derive(Debug, Error)]
#[error("Ingestion of '{document_id}' failed during {stage}: {error}")]
pub struct IngestFailure {
    /// Document being ingested.
    pub document_id: String,
    /// Step that failed.
    pub stage: IngestStage,
    /// Cause.
    #[source]
    pub error: CoreError,
}

/// What to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    /// Source document.
    pub document_path: PathBuf,
    /// Explicit id; derived from the file name when absent.
    pub document_id: Option<String>,
    /// Flag the new cache as master.
    pub set_as_master: bool,
}

impl IngestRequest {
    /// Request for `document_path` with a derived id.
    #[must_use]
    pub fn new(document_path: impl Into<PathBuf>) -> Self {
        Self { document_path: document_path.into(), document_id: None, set_as_master: false }
    }

    /// Uses `document_id` instead of the derived id.
    #[must_use]
    pub fn with_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Flags the resulting cache as master.
    #[must_use]
    pub fn as_master(mut self, set_as_master: bool) -> Self {
        self.set_as_master = set_as_master;
        self
    }

    /// Id the cache will be stored under.
    #[must_use]
    pub fn resolved_id(&self) -> String {
        self.document_id.clone().unwrap_or_else(|| document_id_from_path(&self.document_path))
    }
}

/// Result of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Registered cache.
    pub entry: CacheEntry,
    /// Tokens evaluated.
    pub token_count: u64,
    /// Context allocated.
    pub context_size: u32,
    /// Blob size.
    pub size_bytes: u64,
}

/// Turns documents into registered caches.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    store: Arc<CacheStore>,
    config: CoreConfig,
    sizing: ContextSizing,
}

struct Progress<'a> {
    events: &'a EventBus,
    document_id: &'a str,
    last: Option<u8>,
}

impl Progress<'_> {
    fn report(&mut self, percent: u8) {
        let percent = percent.min(100);
        if self.last == Some(percent) {
            return;
        }
        self.last = Some(percent);
        self.events.emit(CoreEvent::IngestionProgress {
            document_id: self.document_id.to_string(),
            percent,
        });
    }
}

impl IngestionPipeline {
    /// Creates a pipeline writing into `store`.
    #[must_use]
    pub fn new(store: Arc<CacheStore>, config: CoreConfig) -> Self {
        let sizing = ContextSizing::from(&config);
        Self { store, config, sizing }
    }

    /// Context sizing in use.
    #[must_use]
    pub fn sizing(&self) -> ContextSizing {
        self.sizing
    }

    /// Ingests one document. Blocking.
    ///
    /// Emits progress, a token estimate and a completion event. On failure
    /// no blob is left in the store and the registry is unchanged.
    ///
    /// # Errors
    /// Returns an [`IngestFailure`] naming the failed stage.
    pub fn run(
        &self,
        request: &IngestRequest,
        model: &ModelDescriptor,
        loader: &dyn EngineLoader,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, IngestFailure> {
        let document_id = request.resolved_id();
        let events = self.store.events();
        let started = Instant::now();
        info!(
            document_id = %document_id,
            path = %request.document_path.display(),
            model_id = %model.id,
            "Starting ingestion"
        );

        let mut progress = Progress { events, document_id: &document_id, last: None };
        progress.report(0);

        match self.run_stages(request, &document_id, model, loader, cancel, &mut progress) {
            Ok(outcome) => {
                progress.report(100);
                info!(
                    document_id = %document_id,
                    cache_path = %outcome.entry.storage_path.display(),
                    tokens = outcome.token_count,
                    context_size = outcome.context_size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Ingestion finished"
                );
                events.emit(CoreEvent::IngestionComplete {
                    document_id,
                    success: true,
                    message: format!("KV cache created at {}", outcome.entry.storage_path.display()),
                });
                Ok(outcome)
            }
            Err((stage, error)) => {
                let failure = IngestFailure { document_id: document_id.clone(), stage, error };
                error!(document_id = %document_id, stage = %stage, error = %failure.error, "Ingestion failed");
                events.emit(CoreEvent::IngestionComplete {
                    document_id,
                    success: false,
                    message: failure.to_string(),
                });
                Err(failure)
            }
        }
    }

    fn load_engine(
        &self,
        model: &ModelDescriptor,
        loader: &dyn EngineLoader,
        context_size: u32,
    ) -> Result<Box<dyn LanguageEngine>, (IngestStage, CoreError)> {
        debug!(model_id = %model.id, context_size, loader = loader.name(), "Loading model for ingestion");
        loader
            .load(model, &self.config.engine_params(context_size))
            .map_err(|e| (IngestStage::LoadModel, e.into()))
    }

    fn run_stages(
        &self,
        request: &IngestRequest,
        document_id: &str,
        model: &ModelDescriptor,
        loader: &dyn EngineLoader,
        cancel: &CancellationToken,
        progress: &mut Progress<'_>,
    ) -> Result<IngestOutcome, (IngestStage, CoreError)> {
        let path = request.document_path.as_path();
        if !path.is_file() {
            return Err((IngestStage::Validate, CoreError::not_found("document", path)));
        }

        let estimate = estimate_file(path, None).map_err(|e| (IngestStage::Estimate, e))?;
        let fit = FitReport::classify(estimate.tokens, u64::from(model.context_window));
        self.store.events().emit(CoreEvent::TokenEstimationComplete {
            document_id: document_id.to_string(),
            tokens: estimate.tokens,
            fits_context: fit.fits,
        });
        let mut context_size = self.sizing.compute(estimate.tokens, model.context_window);
        debug!(document_id, tokens = estimate.tokens, fit = %fit.fit, context_size, "Sized context");
        progress.report(10);

        let mut engine = self.load_engine(model, loader, context_size)?;
        progress.report(20);

        let text = std::fs::read(path).map_err(|e| (IngestStage::Evaluate, e.into()))?;
        let tokens = engine.tokenize(&text).map_err(|e| (IngestStage::Evaluate, e.into()))?;
        let token_count = tokens.len() as u64;

        // The byte heuristic can undershoot; resize once from the exact count.
        if tokens.len() > engine.context_size() {
            let resized = self.sizing.compute(token_count, model.context_window);
            if resized > context_size {
                info!(document_id, from = context_size, to = resized, "Reloading model with a larger context");
                context_size = resized;
                engine = self.load_engine(model, loader, context_size)?;
            }
        }

        self.evaluate(engine.as_mut(), &tokens, cancel, progress)?;

        let destination = self.store.blob_path_for(document_id);
        let size_bytes = persist_state(engine.as_mut(), &destination)
            .map_err(|e| (IngestStage::Persist, e))?;
        drop(engine);
        progress.report(95);

        self.register(request, document_id, model, &destination, token_count, context_size)
            .map(|entry| IngestOutcome { entry, token_count, context_size, size_bytes })
    }

    fn evaluate(
        &self,
        engine: &mut dyn LanguageEngine,
        tokens: &[kvchat_abstraction::TokenId],
        cancel: &CancellationToken,
        progress: &mut Progress<'_>,
    ) -> Result<(), (IngestStage, CoreError)> {
        let batch = (self.config.batch_size as usize).max(1);
        let total = tokens.len().max(1);
        let mut done = 0usize;
        for chunk in tokens.chunks(batch) {
            if cancel.is_cancelled() {
                return Err((IngestStage::Evaluate, CoreError::Cancelled));
            }
            engine.eval(chunk).map_err(|e| (IngestStage::Evaluate, e.into()))?;
            done += chunk.len();
            progress.report(20 + (done * 70 / total) as u8);
        }
        Ok(())
    }

    fn register(
        &self,
        request: &IngestRequest,
        document_id: &str,
        model: &ModelDescriptor,
        destination: &Path,
        token_count: u64,
        context_size: u32,
    ) -> Result<CacheEntry, (IngestStage, CoreError)> {
        let registration = CacheRegistration {
            id: document_id.to_string(),
            storage_path: destination.to_path_buf(),
            model_id: model.id.clone(),
            token_count,
            context_window: u64::from(context_size),
            source_document_path: Some(request.document_path.clone()),
            is_master: false,
        };

        let record = DocumentRecord {
            document_id: document_id.to_string(),
            original_file_path: request.document_path.clone(),
            cache_path: destination.to_path_buf(),
            token_count,
            context_size: u64::from(context_size),
            model_id: model.id.clone(),
            created_at: Utc::now(),
            is_master: false,
        };
        if let Err(e) = self.store.documents().upsert(record) {
            warn!(document_id, error = %e, "Failed to update document registry");
        }

        let entry = match self.store.register(registration) {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(destination) {
                    warn!(cache_path = %destination.display(), error = %cleanup, "Failed to remove unregistered cache");
                }
                if let Err(cleanup) = self.store.documents().remove_by_cache_path(destination) {
                    warn!(document_id, error = %cleanup, "Failed to update document registry");
                }
                return Err((IngestStage::Register, e));
            }
        };

        if request.set_as_master {
            self.store
                .set_master(&entry.storage_path)
                .map_err(|e| (IngestStage::Register, e))?;
            return Ok(CacheEntry { is_master: true, ..entry });
        }
        Ok(entry)
    }
}
