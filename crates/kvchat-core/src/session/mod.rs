//! Inference session.
//!
//! One [`InferenceSession`] per conversation. Each turn picks a
//! [`Strategy`], runs it on a blocking worker, streams chunks on the event
//! bus, and records cache usage only when saved state was actually reused.
//! Turns are serialized: a second `ask` waits for the first to finish.

pub mod generate;
pub mod history;
pub mod strategy;

pub use generate::{Generated, fallback_messages, fallback_system_prompt, question_prompt};
pub use history::HistoryFile;
pub use strategy::{CacheCandidate, FallbackReason, Selection, Strategy, StrategyInput, select};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::events::{CacheStatus, CoreEvent, EventBus};
use crate::ingest::ContextSizing;
use crate::ingest::tokens::heuristic_tokens;
use crate::store::CacheStore;
use crate::store::fsutil::normalize_path;
use crate::warm::WarmInstanceManager;
use crate::worker::run_blocking;
use chrono::Utc;
use generate::{generate_fallback, generate_from_state, read_excerpt};
use kvchat_abstraction::{ChatMessage, EngineLoader, ModelDescriptor, SamplingParams};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Strategy label reported when a cache failed to load mid-turn.
pub const DEGRADED_LABEL: &str = "fallback_after_load_failure";

/// The model answering turns, with the loader that instantiates it.
#[derive(Clone)]
pub struct ActiveModel {
    /// Model to load.
    pub descriptor: ModelDescriptor,
    /// Backend that loads it.
    pub loader: Arc<dyn EngineLoader>,
}

impl std::fmt::Debug for ActiveModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveModel")
            .field("descriptor", &self.descriptor)
            .field("loader", &self.loader.name())
            .finish()
    }
}

impl ActiveModel {
    /// Pairs a descriptor with its loader.
    #[must_use]
    pub fn new(descriptor: ModelDescriptor, loader: Arc<dyn EngineLoader>) -> Self {
        Self { descriptor, loader }
    }

    /// Model id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Per-turn overrides.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Token budget; the configured default when `None`.
    pub max_tokens: Option<u32>,
    /// Temperature; the configured default when `None`.
    pub temperature: Option<f32>,
    /// Sampling seed.
    pub seed: Option<u64>,
    /// Stops generation at the next sampling step when cancelled.
    pub cancel: CancellationToken,
}

/// Result of one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    /// Full response.
    pub text: String,
    /// Strategy that produced it.
    pub strategy: &'static str,
    /// Status the turn ran under.
    pub status: CacheStatus,
    /// Cache whose state was reused, if any.
    pub cache_path: Option<PathBuf>,
    /// Warning raised while choosing or running the strategy.
    pub warning: Option<String>,
    /// Tokens generated.
    pub tokens_generated: usize,
}

#[derive(Debug)]
struct SessionState {
    history: Vec<ChatMessage>,
    selected: Option<PathBuf>,
    use_cache: bool,
}

/// One conversation over the cache store.
#[derive(Debug)]
pub struct InferenceSession {
    store: Arc<CacheStore>,
    warm: Arc<WarmInstanceManager>,
    config: CoreConfig,
    turns: Semaphore,
    state: Mutex<SessionState>,
}

enum TurnRun {
    TrueKv(Generated),
    Degraded { generated: Generated, reason: String },
    Fallback(Generated),
}

fn chunk_emitter(events: &EventBus) -> impl FnMut(&str) + Send + 'static {
    let events = events.clone();
    move |text: &str| events.emit(CoreEvent::ResponseChunk { text: text.to_string() })
}

impl InferenceSession {
    /// Creates a session. Cache usage starts at the configured default.
    #[must_use]
    pub fn new(store: Arc<CacheStore>, warm: Arc<WarmInstanceManager>, config: CoreConfig) -> Self {
        let use_cache = config.use_cache;
        Self {
            store,
            warm,
            config,
            turns: Semaphore::new(1),
            state: Mutex::new(SessionState { history: Vec::new(), selected: None, use_cache }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Selected cache, if any.
    #[must_use]
    pub fn selected_cache(&self) -> Option<PathBuf> {
        self.lock().selected.clone()
    }

    /// Sets the selected cache without validation. `None` means "use the
    /// master cache".
    pub fn set_selected_cache(&self, cache_path: Option<PathBuf>) {
        self.lock().selected = cache_path.map(|p| normalize_path(&p));
    }

    /// Whether turns may reuse saved state.
    #[must_use]
    pub fn use_cache(&self) -> bool {
        self.lock().use_cache
    }

    /// Enables or disables state reuse.
    pub fn set_use_cache(&self, enabled: bool) {
        self.lock().use_cache = enabled;
    }

    /// Conversation so far.
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock().history.clone()
    }

    /// Forgets the conversation.
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Saves the conversation to `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_history(&self, path: &Path, model_id: Option<&str>) -> Result<()> {
        let (history, kv_cache) = {
            let state = self.lock();
            (state.history.clone(), state.selected.clone())
        };
        HistoryFile { history, model_id: model_id.map(str::to_string), kv_cache, timestamp: Utc::now() }
            .save(path)
    }

    /// Restores a conversation. The saved cache selection is restored only
    /// if its blob still exists.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_history(&self, path: &Path) -> Result<HistoryFile> {
        let file = HistoryFile::load(path)?;
        let mut state = self.lock();
        state.history.clone_from(&file.history);
        match file.kv_cache.as_deref() {
            Some(cache) if cache.is_file() => state.selected = Some(normalize_path(cache)),
            Some(cache) => debug!(cache_path = %cache.display(), "Saved cache no longer exists"),
            None => {}
        }
        Ok(file)
    }

    fn sampling(&self, options: &TurnOptions) -> SamplingParams {
        let defaults = self.config.sampling();
        SamplingParams {
            temperature: options.temperature.unwrap_or(defaults.temperature),
            max_tokens: options.max_tokens.unwrap_or(defaults.max_tokens),
            seed: options.seed,
        }
    }

    fn selection(&self, model_id: &str) -> Selection {
        let (selected, use_cache) = {
            let state = self.lock();
            (state.selected.clone(), state.use_cache)
        };
        let mut untracked = None;
        let selected = selected.and_then(|path| match self.store.get(&path) {
            Some(entry) => Some(CacheCandidate::inspect(entry)),
            None => {
                untracked = Some(path);
                None
            }
        });
        let master = self.store.master().map(CacheCandidate::inspect);
        let warm = self.warm.snapshot();

        let mut selection =
            select(&StrategyInput { use_cache, model_id, selected, master, warm: &warm });
        if let Some(path) = untracked.filter(|_| use_cache) {
            selection.warning.get_or_insert_with(|| {
                format!("Selected cache {} is not in the registry", path.display())
            });
        }
        selection
    }

    /// Answers `message`.
    ///
    /// Emits `ResponseStarted`, streamed `ResponseChunk`s and one
    /// `ResponseComplete`; failures are also published as `Error` events.
    ///
    /// # Errors
    /// `EmptyGeneration` if the model produced nothing, `Cancelled`, or the
    /// engine error. Incompatible or unloadable caches do not fail the turn;
    /// it degrades to fallback generation with a warning.
    pub async fn ask(&self, message: &str, model: &ActiveModel, options: TurnOptions) -> Result<TurnOutcome> {
        let _turn = self
            .turns
            .acquire()
            .await
            .map_err(|e| CoreError::WorkerClosed(e.to_string()))?;
        let events = self.store.events();
        events.emit(CoreEvent::ResponseStarted);

        let selection = self.selection(model.id());
        let strategy = selection.strategy;
        let mut warning = selection.warning;
        if let Some(message) = &warning {
            warn!(model_id = %model.id(), "{message}");
            events.emit(CoreEvent::Warning { message: message.clone() });
        }
        info!(strategy = strategy.label(), model_id = %model.id(), "Answering");
        let mut status = strategy.status();
        events.emit(CoreEvent::CacheStatusChanged { status });

        let params = self.sampling(&options);
        let result = match &strategy {
            Strategy::TrueCacheWarm { cache } => {
                match self.run_warm(&cache.storage_path, message, model, params, &options).await {
                    Some(result) => result.map(TurnRun::TrueKv),
                    None => {
                        debug!("Warm instance changed before the turn started, loading temporarily");
                        status = CacheStatus::UsingTempCache;
                        events.emit(CoreEvent::CacheStatusChanged { status });
                        self.run_temporary(cache, message, model, params, &options).await
                    }
                }
            }
            Strategy::TrueCacheTemporary { cache } => {
                self.run_temporary(cache, message, model, params, &options).await
            }
            Strategy::FallbackWithContext { document_path, .. } => {
                self.run_fallback(Some(document_path.clone()), message, model, params, &options).await
            }
            Strategy::FallbackPlain { .. } => {
                self.run_fallback(None, message, model, params, &options).await
            }
        };

        let mut label = strategy.label();
        let (generated, reused) = match result {
            Ok(TurnRun::TrueKv(generated)) => (generated, strategy.cache().map(|c| c.storage_path.clone())),
            Ok(TurnRun::Degraded { generated, reason }) => {
                status = CacheStatus::Fallback;
                label = DEGRADED_LABEL;
                warning = Some(reason);
                (generated, None)
            }
            Ok(TurnRun::Fallback(generated)) => (generated, None),
            Err(e) => {
                warn!(strategy = strategy.label(), error = %e, "Turn failed");
                events.emit(CoreEvent::ResponseComplete { text: String::new(), success: false });
                events.emit(CoreEvent::Error { message: e.to_string() });
                if !matches!(e, CoreError::EmptyGeneration | CoreError::Cancelled) {
                    events.emit(CoreEvent::CacheStatusChanged { status: CacheStatus::Error });
                }
                return Err(e);
            }
        };

        if let Some(path) = &reused {
            self.store.record_usage(path);
        }
        {
            let mut state = self.lock();
            state.history.push(ChatMessage::user(message));
            state.history.push(ChatMessage::assistant(generated.text.clone()));
        }
        events.emit(CoreEvent::ResponseComplete { text: generated.text.clone(), success: true });
        info!(
            strategy = label,
            tokens = generated.tokens,
            reused_cache = reused.is_some(),
            "Turn finished"
        );

        Ok(TurnOutcome {
            text: generated.text,
            strategy: label,
            status,
            cache_path: reused,
            warning,
            tokens_generated: generated.tokens,
        })
    }

    async fn run_warm(
        &self,
        cache_path: &Path,
        message: &str,
        model: &ActiveModel,
        params: SamplingParams,
        options: &TurnOptions,
    ) -> Option<Result<Generated>> {
        let message = message.to_string();
        let stream_every = self.config.stream_every as usize;
        let cancel = options.cancel.clone();
        let mut emit = chunk_emitter(self.store.events());
        self.warm
            .with_warm_engine(cache_path, model.id(), move |engine| {
                generate_from_state(engine, &message, &params, stream_every, &cancel, &mut emit)
            })
            .await
    }

    async fn run_temporary(
        &self,
        cache: &crate::store::CacheEntry,
        message: &str,
        model: &ActiveModel,
        params: SamplingParams,
        options: &TurnOptions,
    ) -> Result<TurnRun> {
        let context_size = ContextSizing::from(&self.config).for_inference(
            cache.required_tokens(),
            cache.context_window_size,
            params.max_tokens,
            model.descriptor.context_window,
        );
        let engine_params = self.config.engine_params(context_size);
        let descriptor = model.descriptor.clone();
        let loader = Arc::clone(&model.loader);
        let blob = cache.storage_path.clone();
        let document = cache.source_document_path.clone();
        let message = message.to_string();
        let history = self.history();
        let history_limit = self.config.history_limit;
        let excerpt_chars = self.config.fallback_excerpt_chars;
        let stream_every = self.config.stream_every as usize;
        let cancel = options.cancel.clone();
        let events = self.store.events().clone();
        let mut emit = chunk_emitter(&events);

        debug!(cache_path = %blob.display(), context_size, "Loading cache for a single turn");
        run_blocking(move || {
            let mut engine = descriptor_load(&*loader, &descriptor, &engine_params)?;
            match engine.load_state_from(&blob) {
                Ok(()) => {
                    let generated =
                        generate_from_state(engine.as_mut(), &message, &params, stream_every, &cancel, &mut emit)?;
                    Ok(TurnRun::TrueKv(generated))
                }
                Err(e) => {
                    let reason = format!("Could not load cache {}: {e}; answering without it", blob.display());
                    warn!(cache_path = %blob.display(), error = %e, "State load failed, falling back");
                    events.emit(CoreEvent::Warning { message: reason.clone() });
                    events.emit(CoreEvent::CacheStatusChanged { status: CacheStatus::Fallback });
                    engine.reset();
                    let excerpt = document.as_deref().and_then(|p| read_excerpt(p, excerpt_chars));
                    let messages = fallback_messages(excerpt.as_deref(), &history, history_limit, &message);
                    let generated = generate_fallback(engine.as_mut(), &messages, &params, &cancel, &mut emit)?;
                    Ok(TurnRun::Degraded { generated, reason })
                }
            }
        })
        .await
    }

    async fn run_fallback(
        &self,
        document: Option<PathBuf>,
        message: &str,
        model: &ActiveModel,
        params: SamplingParams,
        options: &TurnOptions,
    ) -> Result<TurnRun> {
        let excerpt = document.as_deref().and_then(|p| read_excerpt(p, self.config.fallback_excerpt_chars));
        let messages = fallback_messages(excerpt.as_deref(), &self.history(), self.config.history_limit, message);
        let prompt_bytes: usize = messages.iter().map(|m| m.content.len() + m.role.len() + 2).sum();
        let context_size = ContextSizing::from(&self.config).compute(
            heuristic_tokens(prompt_bytes as u64, "txt").saturating_add(u64::from(params.max_tokens)),
            model.descriptor.context_window,
        );
        let engine_params = self.config.engine_params(context_size);
        let descriptor = model.descriptor.clone();
        let loader = Arc::clone(&model.loader);
        let cancel = options.cancel.clone();
        let mut emit = chunk_emitter(self.store.events());

        debug!(context_size, with_document = excerpt.is_some(), "Fallback generation");
        run_blocking(move || {
            let mut engine = descriptor_load(&*loader, &descriptor, &engine_params)?;
            let generated = generate_fallback(engine.as_mut(), &messages, &params, &cancel, &mut emit)?;
            Ok(TurnRun::Fallback(generated))
        })
        .await
    }
}

fn descriptor_load(
    loader: &dyn EngineLoader,
    descriptor: &ModelDescriptor,
    params: &kvchat_abstraction::EngineParams,
) -> Result<Box<dyn kvchat_abstraction::LanguageEngine>> {
    debug!(model_id = %descriptor.id, loader = loader.name(), context_size = params.context_size, "Loading model for turn");
    Ok(loader.load(descriptor, params)?)
}
