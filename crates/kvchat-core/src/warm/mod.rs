//! Warm instance manager.
//!
//! Keeps one (model, cache) pair resident between turns. Every transition
//! holds one `tokio::sync::Mutex` for its whole duration, including the
//! blocking model and state load, so a second `warm_up` waits for the first
//! to finish instead of racing it. A read-only snapshot is updated while the
//! lock is held and can be inspected without waiting.

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::events::{CacheStatus, CoreEvent};
use crate::ingest::ContextSizing;
use crate::store::{CacheEntry, CacheStore, fsutil::normalize_path};
use kvchat_abstraction::{EngineLoader, EngineParams, LanguageEngine, ModelDescriptor};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of the warm slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmPhase {
    /// Nothing loaded.
    Empty,
    /// A model and state are being loaded.
    Loading,
    /// A model with cached state is resident.
    Ready,
    /// The resident instance is being discarded.
    Unloading,
    /// The last load failed. Resets to `Empty`.
    Error,
}

/// Point-in-time view of the warm slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmSnapshot {
    /// Current phase.
    pub phase: WarmPhase,
    /// Resident model when `Ready`, load target when `Loading`.
    pub model_id: Option<String>,
    /// Resident cache id when `Ready`, load target when `Loading`.
    pub cache_id: Option<String>,
    /// Resident cache path when `Ready`, load target when `Loading`.
    pub cache_path: Option<PathBuf>,
}

impl WarmSnapshot {
    fn empty() -> Self {
        Self { phase: WarmPhase::Empty, model_id: None, cache_id: None, cache_path: None }
    }

    /// Whether `cache_path` is resident in `model_id`.
    #[must_use]
    pub fn holds(&self, cache_path: &Path, model_id: &str) -> bool {
        self.phase == WarmPhase::Ready
            && self.cache_path.as_deref() == Some(cache_path)
            && self.model_id.as_deref() == Some(model_id)
    }
}

/// Report of a completed warm-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmInfo {
    /// Resident model.
    pub model_id: String,
    /// Resident cache id.
    pub cache_id: String,
    /// Resident cache path.
    pub cache_path: PathBuf,
    /// Time spent loading model and state. Zero when already warm.
    pub load_time: Duration,
    /// Tokens held by the restored state.
    pub token_count: u64,
    /// Blob size in bytes.
    pub file_size: u64,
}

#[derive(Default)]
struct WarmSlot {
    engine: Option<Box<dyn LanguageEngine>>,
    model: Option<ModelDescriptor>,
    cache: Option<CacheEntry>,
    info: Option<WarmInfo>,
    baseline: usize,
}

impl WarmSlot {
    fn clear(&mut self) -> bool {
        let had_engine = self.engine.take().is_some();
        self.model = None;
        self.cache = None;
        self.info = None;
        self.baseline = 0;
        had_engine
    }
}

/// Slot, snapshot and store shared with the tasks that run transitions.
struct Shared {
    store: Arc<CacheStore>,
    slot: Mutex<WarmSlot>,
    snapshot: RwLock<WarmSnapshot>,
}

impl Shared {
    fn snapshot(&self) -> WarmSnapshot {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish(&self, snapshot: WarmSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn set_phase(&self, phase: WarmPhase) {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner).phase = phase;
    }

    async fn load(
        &self,
        entry: CacheEntry,
        model: ModelDescriptor,
        loader: Arc<dyn EngineLoader>,
        params: EngineParams,
    ) -> Result<WarmInfo> {
        let mut slot = self.slot.lock().await;
        let events = self.store.events();

        if let Some(info) = slot.info.as_ref().filter(|_| {
            slot.engine.is_some()
                && slot.cache.as_ref().is_some_and(|c| c.storage_path == entry.storage_path)
                && slot.model.as_ref().is_some_and(|m| m.id == model.id)
        }) {
            debug!(cache_path = %entry.storage_path.display(), "Cache already warm");
            return Ok(WarmInfo { load_time: Duration::ZERO, ..info.clone() });
        }

        info!(cache_path = %entry.storage_path.display(), model_id = %model.id, "Warming up cache");
        self.publish(WarmSnapshot {
            phase: WarmPhase::Loading,
            model_id: Some(model.id.clone()),
            cache_id: Some(entry.id.clone()),
            cache_path: Some(entry.storage_path.clone()),
        });
        events.emit(CoreEvent::WarmUpStarted { cache_path: entry.storage_path.clone() });
        events.emit(CoreEvent::CacheStatusChanged { status: CacheStatus::Warming });

        let reusable = slot.engine.is_some()
            && slot.model.as_ref().is_some_and(|m| m.id == model.id)
            && slot.engine.as_ref().is_some_and(|e| e.context_size() >= params.context_size as usize);
        let previous = if reusable {
            slot.engine.take()
        } else {
            if slot.clear() {
                debug!("Unloaded previous warm instance");
                events.emit(CoreEvent::Unloaded);
            }
            None
        };
        slot.clear();

        let started = Instant::now();
        let descriptor = model.clone();
        let blob = entry.storage_path.clone();
        let loaded = tokio::task::spawn_blocking(move || -> Result<Box<dyn LanguageEngine>> {
            let mut engine = match previous {
                Some(mut engine) => {
                    engine.reset();
                    engine
                }
                None => loader.load(&descriptor, &params)?,
            };
            engine.load_state_from(&blob)?;
            Ok(engine)
        })
        .await
        .map_err(|e| CoreError::WorkerClosed(e.to_string()))
        .and_then(|result| result);

        match loaded {
            Ok(engine) => {
                let load_time = started.elapsed();
                let info = WarmInfo {
                    model_id: model.id.clone(),
                    cache_id: entry.id.clone(),
                    cache_path: entry.storage_path.clone(),
                    load_time,
                    token_count: engine.n_tokens() as u64,
                    file_size: std::fs::metadata(&entry.storage_path).map_or(entry.size_bytes, |m| m.len()),
                };
                slot.baseline = engine.n_tokens();
                slot.engine = Some(engine);
                slot.info = Some(info.clone());
                self.publish(WarmSnapshot {
                    phase: WarmPhase::Ready,
                    model_id: Some(model.id.clone()),
                    cache_id: Some(entry.id.clone()),
                    cache_path: Some(entry.storage_path.clone()),
                });
                slot.model = Some(model);
                slot.cache = Some(entry);

                info!(
                    cache_path = %info.cache_path.display(),
                    load_time_ms = load_time.as_millis() as u64,
                    tokens = info.token_count,
                    "Cache warmed up"
                );
                events.emit(CoreEvent::WarmedUp {
                    cache_path: info.cache_path.clone(),
                    load_time_ms: load_time.as_millis() as u64,
                    token_count: info.token_count,
                    file_size: info.file_size,
                });
                events.emit(CoreEvent::CacheStatusChanged { status: CacheStatus::Warmed });
                Ok(info)
            }
            Err(e) => {
                error!(cache_path = %entry.storage_path.display(), error = %e, "Warm-up failed");
                self.set_phase(WarmPhase::Error);
                events.emit(CoreEvent::CacheStatusChanged { status: CacheStatus::Error });
                events.emit(CoreEvent::Error { message: format!("Warm-up failed: {e}") });
                slot.clear();
                self.publish(WarmSnapshot::empty());
                Err(e)
            }
        }
    }

    async fn run<R, F>(&self, key: &Path, model_id: &str, f: F) -> Option<Result<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn LanguageEngine) -> Result<R> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        let resident = slot.cache.as_ref().is_some_and(|c| c.storage_path.as_path() == key)
            && slot.model.as_ref().is_some_and(|m| m.id == model_id);
        if !resident {
            return None;
        }
        let mut engine = slot.engine.take()?;
        let baseline = slot.baseline;

        let joined = tokio::task::spawn_blocking(move || {
            let result = f(engine.as_mut());
            let rewound = engine.rewind(baseline);
            (engine, result, rewound)
        })
        .await;

        match joined {
            Ok((engine, result, Ok(()))) => {
                slot.engine = Some(engine);
                Some(result)
            }
            Ok((_, result, Err(e))) => {
                warn!(error = %e, "Could not rewind warm instance, discarding it");
                slot.clear();
                self.publish(WarmSnapshot::empty());
                self.store.events().emit(CoreEvent::Unloaded);
                Some(result)
            }
            Err(e) => {
                error!(error = %e, "Warm engine task failed, discarding instance");
                slot.clear();
                self.publish(WarmSnapshot::empty());
                self.store.events().emit(CoreEvent::Unloaded);
                Some(Err(CoreError::WorkerClosed(e.to_string())))
            }
        }
    }
}

/// Owns the resident engine handle.
///
/// Transitions that move the engine out of the slot run on their own task and
/// always finish, so a caller that stops waiting never leaves the slot
/// without an engine while the snapshot still reports it.
pub struct WarmInstanceManager {
    config: CoreConfig,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WarmInstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmInstanceManager")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl WarmInstanceManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(store: Arc<CacheStore>, config: CoreConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                store,
                slot: Mutex::new(WarmSlot::default()),
                snapshot: RwLock::new(WarmSnapshot::empty()),
            }),
        }
    }

    /// Current snapshot. Never waits for an in-flight transition.
    #[must_use]
    pub fn snapshot(&self) -> WarmSnapshot {
        self.shared.snapshot()
    }

    /// Resident `(model_id, cache_id)`, or `None` when nothing is warm.
    #[must_use]
    pub fn current(&self) -> Option<(String, String)> {
        let snapshot = self.snapshot();
        match (snapshot.phase, snapshot.model_id, snapshot.cache_id) {
            (WarmPhase::Ready, Some(model), Some(cache)) => Some((model, cache)),
            _ => None,
        }
    }

    /// Whether `cache_path` is resident in `model_id`.
    #[must_use]
    pub fn is_warm_with(&self, cache_path: &Path, model_id: &str) -> bool {
        self.snapshot().holds(&normalize_path(cache_path), model_id)
    }

    fn inference_context(&self, entry: &CacheEntry, model: &ModelDescriptor) -> u32 {
        ContextSizing::from(&self.config).for_inference(
            entry.required_tokens(),
            entry.context_window_size,
            self.config.max_tokens,
            model.context_window,
        )
    }

    /// Makes `cache_path` resident in `model`.
    ///
    /// Loads the model unless it is already the resident one, then restores
    /// the cache's state. A no-op when the cache is already warm. Waits for
    /// any in-flight transition. The load finishes even if the returned
    /// future is dropped.
    ///
    /// # Errors
    /// `NotFound` if the cache is untracked or its blob is gone,
    /// `Incompatible` if it was produced by another model, or the load error.
    /// A failed load leaves the slot empty.
    pub async fn warm_up(
        &self,
        cache_path: &Path,
        model: &ModelDescriptor,
        loader: Arc<dyn EngineLoader>,
    ) -> Result<WarmInfo> {
        let entry = self
            .shared
            .store
            .get(cache_path)
            .ok_or_else(|| CoreError::not_found("cache", cache_path))?;
        if !entry.storage_path.is_file() {
            return Err(CoreError::not_found("cache file", &entry.storage_path));
        }
        if !entry.is_loadable_into(&model.id) {
            warn!(
                cache_path = %entry.storage_path.display(),
                cache_model = %entry.owning_model_id,
                requested_model = %model.id,
                "Refusing to warm cache produced by another model"
            );
            return Err(CoreError::Incompatible {
                cache_model: entry.owning_model_id.clone(),
                requested_model: model.id.clone(),
            });
        }

        let params = self.config.engine_params(self.inference_context(&entry, model));
        let shared = Arc::clone(&self.shared);
        let model = model.clone();
        tokio::spawn(async move { shared.load(entry, model, loader, params).await })
            .await
            .map_err(|e| CoreError::WorkerClosed(e.to_string()))?
    }

    /// Discards the resident instance. Returns whether anything was loaded.
    pub async fn unload(&self) -> bool {
        let mut slot = self.shared.slot.lock().await;
        if slot.engine.is_none() {
            return false;
        }
        self.shared.set_phase(WarmPhase::Unloading);
        let engine = slot.engine.take();
        slot.clear();
        self.shared.publish(WarmSnapshot::empty());
        info!("Warm instance unloaded");
        self.shared.store.events().emit(CoreEvent::Unloaded);
        self.shared.store.events().emit(CoreEvent::CacheStatusChanged { status: CacheStatus::Idle });
        // Dropping large engines can take a while.
        let _ = tokio::task::spawn_blocking(move || drop(engine)).await;
        true
    }

    /// Runs `f` against the resident engine if `cache_path` is warm in
    /// `model_id`, holding the transition lock for the duration. The engine
    /// is rewound to the cached state afterwards, so every call starts from
    /// the document alone. The engine is returned to the slot even if the
    /// returned future is dropped.
    ///
    /// Returns `None` without calling `f` when the cache is not resident.
    pub async fn with_warm_engine<R, F>(
        &self,
        cache_path: &Path,
        model_id: &str,
        f: F,
    ) -> Option<Result<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn LanguageEngine) -> Result<R> + Send + 'static,
    {
        let key = normalize_path(cache_path);
        let model_id = model_id.to_string();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.run(&key, &model_id, f).await })
            .await
            .unwrap_or_else(|e| Some(Err(CoreError::WorkerClosed(e.to_string()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, drain};
    use crate::store::CacheRegistration;
    use kvchat_abstraction::EngineError;
    use kvchat_models::{MockBehavior, MockLoader, MockStats};

    struct SlowLoader {
        inner: MockLoader,
        delay: Duration,
    }

    impl EngineLoader for SlowLoader {
        fn name(&self) -> &str {
            "slow"
        }

        fn load(
            &self,
            model: &ModelDescriptor,
            params: &EngineParams,
        ) -> std::result::Result<Box<dyn LanguageEngine>, EngineError> {
            std::thread::sleep(self.delay);
            self.inner.load(model, params)
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        store: Arc<CacheStore>,
        manager: WarmInstanceManager,
        loader: Arc<MockLoader>,
        model: ModelDescriptor,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(CacheStore::open(temp.path().join("caches"), EventBus::new(256)).unwrap());
        let manager = WarmInstanceManager::new(Arc::clone(&store), CoreConfig::default());
        let loader = Arc::new(MockLoader::new(MockBehavior::default()));
        let model = ModelDescriptor::new("model-a", temp.path().join("model-a.bin"), 8192);
        Fixture { _temp: temp, store, manager, loader, model }
    }

    fn add_cache(fx: &Fixture, id: &str, model_id: &str) -> PathBuf {
        let path = fx.store.blob_path_for(id);
        let state = serde_json::json!({ "model_id": model_id, "tokens": [104, 105] });
        std::fs::write(&path, state.to_string()).unwrap();
        fx.store
            .register(CacheRegistration {
                id: id.to_string(),
                storage_path: path.clone(),
                model_id: model_id.to_string(),
                token_count: 2,
                context_window: 2048,
                source_document_path: None,
                is_master: false,
            })
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_warm_up_and_noop() {
        let fx = fixture();
        let path = add_cache(&fx, "doc", "model-a");
        let mut rx = fx.store.events().subscribe();

        let info = fx.manager.warm_up(&path, &fx.model, fx.loader.clone()).await.unwrap();
        assert_eq!(info.token_count, 2);
        assert_eq!(fx.manager.current(), Some(("model-a".to_string(), "doc".to_string())));
        assert!(fx.manager.is_warm_with(&path, "model-a"));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, CoreEvent::WarmedUp { token_count: 2, .. })));

        let again = fx.manager.warm_up(&path, &fx.model, fx.loader.clone()).await.unwrap();
        assert_eq!(again.load_time, Duration::ZERO);
        assert_eq!(MockStats::get(&fx.loader.stats().loads), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_incompatible_cache_is_refused() {
        let fx = fixture();
        let path = add_cache(&fx, "doc", "model-b");
        let err = fx.manager.warm_up(&path, &fx.model, fx.loader.clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::Incompatible { .. }));
        assert_eq!(MockStats::get(&fx.loader.stats().state_loads), 0);
        assert_eq!(fx.manager.snapshot().phase, WarmPhase::Empty);
    }

    #[tokio::test]
    async fn test_failed_load_resets_to_empty() {
        let fx = fixture();
        let path = add_cache(&fx, "doc", "model-a");
        let loader = Arc::new(MockLoader::new(MockBehavior { fail_state_load: true, ..MockBehavior::default() }));
        let mut rx = fx.store.events().subscribe();

        assert!(fx.manager.warm_up(&path, &fx.model, loader).await.is_err());
        assert_eq!(fx.manager.snapshot(), WarmSnapshot::empty());
        assert!(drain(&mut rx).contains(&CoreEvent::CacheStatusChanged { status: CacheStatus::Error }));
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let fx = fixture();
        let path = add_cache(&fx, "doc", "model-a");
        fx.manager.warm_up(&path, &fx.model, fx.loader.clone()).await.unwrap();

        assert!(fx.manager.unload().await);
        assert!(!fx.manager.unload().await);
        assert_eq!(fx.manager.current(), None);
    }

    #[tokio::test]
    async fn test_warm_engine_is_rewound_after_use() {
        let fx = fixture();
        let path = add_cache(&fx, "doc", "model-a");
        fx.manager.warm_up(&path, &fx.model, fx.loader.clone()).await.unwrap();

        for _ in 0..2 {
            let seen = fx
                .manager
                .with_warm_engine(&path, "model-a", |engine| {
                    let before = engine.n_tokens();
                    engine.eval(&[1, 2, 3])?;
                    Ok(before)
                })
                .await
                .unwrap()
                .unwrap();
            assert_eq!(seen, 2);
        }

        let other = fx.store.blob_path_for("other");
        assert!(fx.manager.with_warm_engine(&other, "model-a", |_| Ok(())).await.is_none());
    }

    #[tokio::test]
    async fn test_switching_cache_reuses_model() {
        let fx = fixture();
        let first = add_cache(&fx, "first", "model-a");
        let second = add_cache(&fx, "second", "model-a");
        fx.manager.warm_up(&first, &fx.model, fx.loader.clone()).await.unwrap();
        fx.manager.warm_up(&second, &fx.model, fx.loader.clone()).await.unwrap();

        assert_eq!(fx.manager.current(), Some(("model-a".to_string(), "second".to_string())));
        assert_eq!(MockStats::get(&fx.loader.stats().loads), 1);
        assert_eq!(MockStats::get(&fx.loader.stats().state_loads), 2);
    }

    #[tokio::test]
    async fn test_abandoned_turn_returns_engine_to_slot() {
        let fx = fixture();
        let path = add_cache(&fx, "doc", "model-a");
        fx.manager.warm_up(&path, &fx.model, fx.loader.clone()).await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            fx.manager.with_warm_engine(&path, "model-a", |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        let tokens = fx.manager.with_warm_engine(&path, "model-a", |engine| Ok(engine.n_tokens())).await;
        assert_eq!(tokens.unwrap().unwrap(), 2);
        assert_eq!(fx.manager.current(), Some(("model-a".to_string(), "doc".to_string())));
    }

    #[tokio::test]
    async fn test_abandoned_warm_up_finishes_and_reports_target() {
        let fx = fixture();
        let first = add_cache(&fx, "first", "model-a");
        let second = add_cache(&fx, "second", "model-b");
        fx.manager.warm_up(&first, &fx.model, fx.loader.clone()).await.unwrap();

        let model_b = ModelDescriptor::new("model-b", fx._temp.path().join("model-b.bin"), 8192);
        let slow: Arc<dyn EngineLoader> = Arc::new(SlowLoader {
            inner: MockLoader::new(MockBehavior::default()),
            delay: Duration::from_millis(200),
        });

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), fx.manager.warm_up(&second, &model_b, Arc::clone(&slow)))
                .await;
        assert!(abandoned.is_err());

        let loading = fx.manager.snapshot();
        assert_eq!(loading.phase, WarmPhase::Loading);
        assert_eq!(loading.model_id.as_deref(), Some("model-b"));
        assert_eq!(loading.cache_id.as_deref(), Some("second"));
        assert_eq!(fx.manager.current(), None);

        let info = fx.manager.warm_up(&second, &model_b, slow).await.unwrap();
        assert_eq!(info.load_time, Duration::ZERO);
        assert_eq!(fx.manager.current(), Some(("model-b".to_string(), "second".to_string())));
        assert!(fx.manager.with_warm_engine(&second, "model-b", |_| Ok(())).await.unwrap().is_ok());
    }
}
