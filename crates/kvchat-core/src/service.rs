//! Cache service facade.
//!
//! Bundles the store, warm instance, inference session, ingestion pipeline
//! and model catalog behind the operations a front-end calls. Long-running
//! work runs on background workers; outcomes are returned and also
//! published on the event bus.

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::ingest::{
    FitReport, IngestFailure, IngestOutcome, IngestRequest, IngestStage, IngestionPipeline,
    TokenEstimate, document_id_from_path, estimate_file,
};
use crate::session::{ActiveModel, HistoryFile, InferenceSession, TurnOptions, TurnOutcome};
use crate::store::fsutil::normalize_path;
use crate::store::{CacheEntry, CacheStore, PurgeAllReport, PurgeOutcome, ScanReport, StoreWatcher};
use crate::warm::{WarmInfo, WarmInstanceManager, WarmSnapshot};
use crate::worker::{WorkerPool, WorkerPoolConfig, run_blocking};
use kvchat_abstraction::ChatMessage;
use kvchat_models::{AvailableModel, CatalogEntry, DEFAULT_CONTEXT_WINDOW, EngineFactory, ModelCatalog};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the event channel.
pub const EVENT_CAPACITY: usize = 1024;

/// Token estimate for a document against the active model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentEstimate {
    /// Id the document would be cached under.
    pub document_id: String,
    /// Estimated tokens.
    pub estimate: TokenEstimate,
    /// Context window compared against.
    pub context_window: u32,
    /// Fit classification.
    pub fit: FitReport,
}

/// High-level entry point for cache lifecycle operations.
pub struct CacheService {
    config: CoreConfig,
    store: Arc<CacheStore>,
    warm: Arc<WarmInstanceManager>,
    session: InferenceSession,
    pipeline: IngestionPipeline,
    catalog: RwLock<ModelCatalog>,
    model: RwLock<Option<ActiveModel>>,
    workers: WorkerPool,
    watcher: Mutex<Option<StoreWatcher>>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("store_dir", &self.store.dir())
            .field("warm", &self.warm.snapshot())
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl CacheService {
    /// Opens the store, reconciles it with the directory and resolves the
    /// configured model if its weights are present. Must be called inside a
    /// tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the store directory
    /// cannot be created, or the custom model file cannot be parsed.
    pub fn open(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(CacheStore::open(&config.store_dir, EventBus::new(EVENT_CAPACITY))?);
        let report = store.scan_and_reconcile()?;
        debug!(added = report.added.len(), removed = report.removed.len(), "Startup reconcile");

        let catalog = ModelCatalog::load(&config.models_dir, config.models_file.clone())?;
        let warm = Arc::new(WarmInstanceManager::new(Arc::clone(&store), config.clone()));
        let session = InferenceSession::new(Arc::clone(&store), Arc::clone(&warm), config.clone());
        let pipeline = IngestionPipeline::new(Arc::clone(&store), config.clone());

        let model = config.current_model_id.as_deref().and_then(|id| match catalog.get(id) {
            Some(available) => Some(active_from(available)),
            None => {
                warn!(model_id = %id, "Configured model is not available");
                None
            }
        });

        info!(
            store_dir = %store.dir().display(),
            caches = store.list().len(),
            model_id = model.as_ref().map_or("none", ActiveModel::id),
            "Cache service ready"
        );

        Ok(Self {
            config,
            store,
            warm,
            session,
            pipeline,
            catalog: RwLock::new(catalog),
            model: RwLock::new(model),
            workers: WorkerPool::start(WorkerPoolConfig::default()),
            watcher: Mutex::new(None),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Conversation state.
    #[must_use]
    pub fn session(&self) -> &InferenceSession {
        &self.session
    }

    /// Subscribes to core events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.store.events().subscribe()
    }

    /// Models whose weights are present.
    #[must_use]
    pub fn available_models(&self) -> Vec<AvailableModel> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner).available()
    }

    /// Every catalog entry, whether or not its weights are present.
    #[must_use]
    pub fn known_models(&self) -> Vec<CatalogEntry> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner).known()
    }

    /// Active model, if one is set.
    #[must_use]
    pub fn active_model(&self) -> Option<ActiveModel> {
        self.model.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn require_model(&self) -> Result<ActiveModel> {
        self.active_model().ok_or_else(|| CoreError::NotFound("no model selected".to_string()))
    }

    /// Switches to a catalog model.
    ///
    /// # Errors
    /// `NotFound` if the model's weights are not present.
    pub async fn set_model(&self, model_id: &str) -> Result<ActiveModel> {
        let available = self
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        let model = active_from(available);
        self.set_active_model(model.clone()).await;
        Ok(model)
    }

    /// Switches to an explicit model and loader. A warm cache produced by
    /// another model is unloaded.
    pub async fn set_active_model(&self, model: ActiveModel) {
        let warm_model = self.warm.snapshot().model_id;
        if warm_model.as_deref().is_some_and(|id| id != model.id()) {
            info!(from = ?warm_model, to = %model.id(), "Model changed, unloading warm cache");
            self.warm.unload().await;
        }
        info!(model_id = %model.id(), loader = model.loader.name(), "Active model set");
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
    }

    /// Estimates a document's tokens against the active model's window, or
    /// the default window when no model is set. Emits
    /// `TokenEstimationComplete`.
    ///
    /// # Errors
    /// `NotFound` if the document does not exist.
    pub async fn estimate_document(&self, document_path: &Path) -> Result<DocumentEstimate> {
        let context_window = self.active_model().map_or(DEFAULT_CONTEXT_WINDOW, |m| m.descriptor.context_window);
        let path = document_path.to_path_buf();
        let estimate = run_blocking(move || estimate_file(&path, None)).await?;
        let fit = FitReport::classify(estimate.tokens, u64::from(context_window));
        let document_id = document_id_from_path(document_path);

        self.store.events().emit(CoreEvent::TokenEstimationComplete {
            document_id: document_id.clone(),
            tokens: estimate.tokens,
            fits_context: fit.fits,
        });
        debug!(document_id = %document_id, tokens = estimate.tokens, fit = %fit.fit, "Estimated document");
        Ok(DocumentEstimate { document_id, estimate, context_window, fit })
    }

    /// Ingests a document with the active model on the background queue.
    ///
    /// # Errors
    /// Returns an [`IngestFailure`] naming the failed stage. Queue rejection
    /// is reported with stage `Schedule`.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<IngestOutcome, IngestFailure> {
        let document_id = request.resolved_id();
        let scheduling_failure = |error: CoreError| {
            self.store.events().emit(CoreEvent::IngestionComplete {
                document_id: document_id.clone(),
                success: false,
                message: error.to_string(),
            });
            IngestFailure { document_id: document_id.clone(), stage: IngestStage::Schedule, error }
        };

        let model = self.require_model().map_err(|e| IngestFailure {
            document_id: document_id.clone(),
            stage: IngestStage::LoadModel,
            error: e,
        })?;
        let pipeline = self.pipeline.clone();
        let receiver = self
            .workers
            .submit(run_blocking(move || {
                Ok(pipeline.run(&request, &model.descriptor, &*model.loader, &cancel))
            }))
            .map_err(scheduling_failure)?;

        match receiver.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(scheduling_failure(e)),
            Err(_) => Err(scheduling_failure(CoreError::WorkerClosed("ingestion job dropped".to_string()))),
        }
    }

    /// Loads `cache_path` into the active model and keeps it resident.
    ///
    /// # Errors
    /// `NotFound` if no model is set or the cache is unknown,
    /// `Incompatible` for another model's cache, or the load error.
    pub async fn warm_up(&self, cache_path: &Path) -> Result<WarmInfo> {
        let model = self.require_model()?;
        self.warm.warm_up(cache_path, &model.descriptor, Arc::clone(&model.loader)).await
    }

    /// Discards the warm instance. Returns false if nothing was loaded.
    pub async fn unload(&self) -> bool {
        self.warm.unload().await
    }

    /// Resident `(model_id, cache_id)`, if any.
    #[must_use]
    pub fn current_warm(&self) -> Option<(String, String)> {
        self.warm.current()
    }

    /// Snapshot of the warm slot.
    #[must_use]
    pub fn warm_snapshot(&self) -> WarmSnapshot {
        self.warm.snapshot()
    }

    /// Selects the cache used for turns. `None` means "use the master
    /// cache". A different warm cache is unloaded.
    ///
    /// # Errors
    /// `NotFound` if the blob does not exist.
    pub async fn select_cache(&self, cache_path: Option<&Path>) -> Result<()> {
        let selected = match cache_path {
            Some(path) => {
                if !path.is_file() {
                    return Err(CoreError::not_found("cache file", path));
                }
                Some(normalize_path(path))
            }
            None => None,
        };

        let warm_cache = self.warm.snapshot().cache_path;
        if let (Some(warm), Some(new)) = (&warm_cache, &selected)
            && warm != new
        {
            info!(warm = %warm.display(), selected = %new.display(), "Selection changed, unloading warm cache");
            self.warm.unload().await;
        }
        self.session.set_selected_cache(selected);
        Ok(())
    }

    /// Selected cache, if any.
    #[must_use]
    pub fn selected_cache(&self) -> Option<PathBuf> {
        self.session.selected_cache()
    }

    /// Enables or disables state reuse for turns.
    pub fn set_use_cache(&self, enabled: bool) {
        info!(enabled, "Cache usage toggled");
        self.session.set_use_cache(enabled);
    }

    /// Answers `message` with the active model.
    ///
    /// # Errors
    /// `NotFound` if no model is set, or the turn's error.
    pub async fn ask(&self, message: &str, options: TurnOptions) -> Result<TurnOutcome> {
        let model = match self.require_model() {
            Ok(model) => model,
            Err(e) => {
                self.store.events().emit(CoreEvent::Error { message: e.to_string() });
                return Err(e);
            }
        };
        self.session.ask(message, &model, options).await
    }

    /// Conversation so far.
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.session.history()
    }

    /// Saves the conversation.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_history(&self, path: &Path) -> Result<()> {
        let model = self.active_model();
        self.session.save_history(path, model.as_ref().map(ActiveModel::id))
    }

    /// Restores a conversation.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_history(&self, path: &Path) -> Result<HistoryFile> {
        self.session.load_history(path)
    }

    /// Tracked caches, most recently used first.
    #[must_use]
    pub fn list(&self) -> Vec<CacheEntry> {
        self.store.list()
    }

    /// Entry for `cache_path`.
    #[must_use]
    pub fn get(&self, cache_path: &Path) -> Option<CacheEntry> {
        self.store.get(cache_path)
    }

    /// Resolves a cache by id or by path.
    #[must_use]
    pub fn resolve(&self, id_or_path: &str) -> Option<CacheEntry> {
        self.store.find_by_id(id_or_path).or_else(|| self.store.get(Path::new(id_or_path)))
    }

    /// Deletes a cache. The warm instance is unloaded first if it holds it.
    ///
    /// # Errors
    /// Returns an error if the blob exists but cannot be deleted.
    pub async fn purge(&self, cache_path: &Path) -> Result<PurgeOutcome> {
        let key = normalize_path(cache_path);
        if self.warm.snapshot().cache_path.as_deref() == Some(key.as_path()) {
            self.warm.unload().await;
        }
        if self.session.selected_cache().as_deref() == Some(key.as_path()) {
            self.session.set_selected_cache(None);
        }
        let store = Arc::clone(&self.store);
        run_blocking(move || store.purge(&key)).await
    }

    /// Deletes every cache, continuing past individual failures.
    pub async fn purge_all(&self) -> PurgeAllReport {
        self.warm.unload().await;
        self.session.set_selected_cache(None);
        let store = Arc::clone(&self.store);
        match run_blocking(move || Ok(store.purge_all())).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Purge worker failed");
                PurgeAllReport { failed: vec![(self.store.dir().to_path_buf(), e.to_string())], ..PurgeAllReport::default() }
            }
        }
    }

    /// Bytes used by tracked blobs.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.store.total_size()
    }

    /// Caches that do not fit `context_window`.
    #[must_use]
    pub fn compatibility_check(&self, context_window: u64) -> Vec<PathBuf> {
        self.store.compatibility_check(context_window)
    }

    /// Flags `cache_path` as the master cache.
    ///
    /// # Errors
    /// `NotFound` if the cache is untracked.
    pub fn set_master(&self, cache_path: &Path) -> Result<()> {
        self.store.set_master(cache_path)
    }

    /// The master cache, if any.
    #[must_use]
    pub fn master(&self) -> Option<CacheEntry> {
        self.store.master()
    }

    /// Reconciles the registry with the store directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be listed.
    pub async fn scan(&self) -> Result<ScanReport> {
        let store = Arc::clone(&self.store);
        run_blocking(move || {
            store.reload_external()?;
            store.scan_and_reconcile()
        })
        .await
    }

    /// Starts reconciling on external directory changes. A no-op if already
    /// watching.
    ///
    /// # Errors
    /// Returns an error if the platform watcher cannot be created.
    pub async fn start_watcher(&self, debounce: Duration) -> Result<()> {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_none() {
            *watcher = Some(StoreWatcher::start(Arc::clone(&self.store), debounce)?);
        }
        Ok(())
    }

    /// Stops the watcher, discards the warm instance and drains the workers.
    pub async fn shutdown(self) {
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.shutdown().await;
        }
        self.warm.unload().await;
        self.workers.shutdown().await;
        info!("Cache service stopped");
    }
}

fn active_from(available: AvailableModel) -> ActiveModel {
    ActiveModel::new(available.descriptor, EngineFactory::loader(available.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvchat_abstraction::ModelDescriptor;
    use kvchat_models::{MockBehavior, MockLoader};
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> CoreConfig {
        CoreConfig {
            store_dir: temp.path().join("caches"),
            models_dir: temp.path().join("models"),
            ..CoreConfig::default()
        }
    }

    fn mock_model(temp: &TempDir) -> ActiveModel {
        ActiveModel::new(
            ModelDescriptor::new("mock-4k", temp.path().join("mock.bin"), 4096),
            Arc::new(MockLoader::new(MockBehavior::with_response("It is blue."))),
        )
    }

    #[tokio::test]
    async fn test_open_without_model() {
        let temp = TempDir::new().unwrap();
        let service = CacheService::open(config(&temp)).unwrap();
        assert!(service.active_model().is_none());
        assert!(service.list().is_empty());

        let err = service.ask("hello", TurnOptions::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_model_unknown_is_not_found() {
        let temp = TempDir::new().unwrap();
        let service = CacheService::open(config(&temp)).unwrap();
        let err = service.set_model("tiny-ngram-4k").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_select_missing_cache_is_not_found() {
        let temp = TempDir::new().unwrap();
        let service = CacheService::open(config(&temp)).unwrap();
        let err = service.select_cache(Some(&temp.path().join("nope.kvcache"))).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(service.selected_cache().is_none());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_estimate_emits_event() {
        let temp = TempDir::new().unwrap();
        let service = CacheService::open(config(&temp)).unwrap();
        service.set_active_model(mock_model(&temp)).await;
        let mut rx = service.subscribe();

        let doc = temp.path().join("Notes.txt");
        std::fs::write(&doc, "a".repeat(4000)).unwrap();
        let estimate = service.estimate_document(&doc).await.unwrap();
        assert_eq!(estimate.document_id, "notes");
        assert_eq!(estimate.estimate.tokens, 1000);
        assert_eq!(estimate.context_window, 4096);
        assert!(estimate.fit.fits);

        let events = crate::events::drain(&mut rx);
        assert!(events.contains(&CoreEvent::TokenEstimationComplete {
            document_id: "notes".to_string(),
            tokens: 1000,
            fits_context: true,
        }));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_ingest_then_select_and_purge() {
        let temp = TempDir::new().unwrap();
        let service = CacheService::open(config(&temp)).unwrap();
        service.set_active_model(mock_model(&temp)).await;

        let doc = temp.path().join("report.md");
        std::fs::write(&doc, "The sky is blue. ".repeat(50)).unwrap();
        let outcome = service
            .ingest(IngestRequest::new(&doc).as_master(true), CancellationToken::new())
            .await
            .unwrap();
        let path = outcome.entry.storage_path.clone();
        assert!(path.is_file());
        assert_eq!(service.master().unwrap().storage_path, path);
        assert_eq!(service.resolve("report").unwrap().storage_path, path);

        service.select_cache(Some(&path)).await.unwrap();
        assert_eq!(service.selected_cache(), Some(path.clone()));

        assert_eq!(service.purge(&path).await.unwrap(), PurgeOutcome::Deleted);
        assert!(service.get(&path).is_none());
        assert!(service.selected_cache().is_none());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_ingest_without_model_fails_at_load_stage() {
        let temp = TempDir::new().unwrap();
        let service = CacheService::open(config(&temp)).unwrap();
        let doc = temp.path().join("doc.txt");
        std::fs::write(&doc, "text").unwrap();

        let failure = service.ingest(IngestRequest::new(&doc), CancellationToken::new()).await.unwrap_err();
        assert_eq!(failure.stage, IngestStage::LoadModel);
        assert_eq!(failure.document_id, "doc");
        service.shutdown().await;
    }
}
