//! Scripted engine for tests and demos.
//!
//! `MockEngine` replays a fixed response and lets callers inject the failure
//! modes real engine bindings exhibit: no structured state save, no
//! direct-to-path save, saves that silently produce nothing, state blobs
//! claiming another model, and load failures.

use kvchat_abstraction::{
    ChatMessage, EngineError, EngineLoader, EngineParams, LanguageEngine, ModelDescriptor,
    SamplingParams, TokenId,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// End-of-sequence token of the mock vocabulary.
pub const MOCK_EOS: TokenId = 256;

/// Configures how a `MockEngine` behaves.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Text produced by sampling and by chat completion.
    pub response: String,
    /// Whether `save_state` returns a blob.
    pub structured_save: bool,
    /// Whether `save_state_to` writes a file.
    pub path_save: bool,
    /// Saves "succeed" but produce no bytes.
    pub broken_save: bool,
    /// The loader refuses to load the model.
    pub fail_load: bool,
    /// `load_state` always fails.
    pub fail_state_load: bool,
    /// Saved blobs claim this model id instead of the engine's.
    pub state_model_override: Option<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            response: "Mock answer.".to_string(),
            structured_save: true,
            path_save: true,
            broken_save: false,
            fail_load: false,
            fail_state_load: false,
            state_model_override: None,
        }
    }
}

impl MockBehavior {
    /// Behavior that produces `response`.
    #[must_use]
    pub fn with_response(response: impl Into<String>) -> Self {
        Self { response: response.into(), ..Self::default() }
    }

    /// Behavior that generates nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::with_response("")
    }
}

/// Call counters shared by a loader and every engine it produced.
#[derive(Debug, Default)]
pub struct MockStats {
    /// Successful model loads.
    pub loads: AtomicUsize,
    /// Successful state restores.
    pub state_loads: AtomicUsize,
    /// `eval` calls.
    pub evals: AtomicUsize,
    /// `complete_chat` calls.
    pub chat_completions: AtomicUsize,
}

impl MockStats {
    /// Reads a counter.
    #[must_use]
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MockState {
    model_id: String,
    tokens: Vec<TokenId>,
}

/// Engine with scripted output.
#[derive(Debug)]
pub struct MockEngine {
    model_id: String,
    context_size: usize,
    behavior: MockBehavior,
    stats: Arc<MockStats>,
    tokens: Vec<TokenId>,
    cursor: usize,
    last_sampled: Option<TokenId>,
}

impl MockEngine {
    /// Creates a mock engine.
    #[must_use]
    pub fn new(
        model_id: impl Into<String>,
        context_size: usize,
        behavior: MockBehavior,
        stats: Arc<MockStats>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            context_size,
            behavior,
            stats,
            tokens: Vec::new(),
            cursor: 0,
            last_sampled: None,
        }
    }

    fn state_bytes(&self) -> Result<Vec<u8>, EngineError> {
        if self.behavior.broken_save {
            return Ok(Vec::new());
        }
        let state = MockState {
            model_id: self
                .behavior
                .state_model_override
                .clone()
                .unwrap_or_else(|| self.model_id.clone()),
            tokens: self.tokens.clone(),
        };
        serde_json::to_vec(&state).map_err(|e| EngineError::State(e.to_string()))
    }
}

impl LanguageEngine for MockEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn n_tokens(&self) -> usize {
        self.tokens.len()
    }

    fn tokenize(&self, text: &[u8]) -> Result<Vec<TokenId>, EngineError> {
        Ok(text.iter().map(|b| TokenId::from(*b)).collect())
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<Vec<u8>, EngineError> {
        Ok(tokens.iter().filter(|t| **t < MOCK_EOS).map(|t| *t as u8).collect())
    }

    fn eval(&mut self, tokens: &[TokenId]) -> Result<(), EngineError> {
        self.stats.evals.fetch_add(1, Ordering::SeqCst);
        let used = self.tokens.len() + tokens.len();
        if used > self.context_size {
            return Err(EngineError::ContextFull { used, capacity: self.context_size });
        }
        // Feeding back the token just sampled continues the scripted answer.
        let continues = tokens.len() == 1 && self.last_sampled == Some(tokens[0]);
        if !continues {
            self.cursor = 0;
        }
        self.last_sampled = None;
        self.tokens.extend_from_slice(tokens);
        Ok(())
    }

    fn sample(&mut self, _params: &SamplingParams) -> Result<TokenId, EngineError> {
        let token = self
            .behavior
            .response
            .as_bytes()
            .get(self.cursor)
            .map_or(MOCK_EOS, |b| TokenId::from(*b));
        self.cursor += 1;
        self.last_sampled = Some(token);
        Ok(token)
    }

    fn token_eos(&self) -> TokenId {
        MOCK_EOS
    }

    fn rewind(&mut self, n_tokens: usize) -> Result<(), EngineError> {
        if n_tokens > self.tokens.len() {
            return Err(EngineError::State("rewind past end of state".to_string()));
        }
        self.tokens.truncate(n_tokens);
        Ok(())
    }

    fn reset(&mut self) {
        self.tokens.clear();
        self.cursor = 0;
        self.last_sampled = None;
    }

    fn save_state(&mut self) -> Result<Vec<u8>, EngineError> {
        if !self.behavior.structured_save {
            return Err(EngineError::Unsupported("save_state".to_string()));
        }
        self.state_bytes()
    }

    fn save_state_to(&mut self, path: &Path) -> Result<(), EngineError> {
        if !self.behavior.path_save {
            return Err(EngineError::Unsupported("save_state_to".to_string()));
        }
        let bytes = self.state_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load_state(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        if self.behavior.fail_state_load {
            return Err(EngineError::State("scripted state load failure".to_string()));
        }
        let state: MockState =
            serde_json::from_slice(blob).map_err(|e| EngineError::State(e.to_string()))?;
        if state.model_id != self.model_id {
            return Err(EngineError::State(format!(
                "state belongs to model '{}'",
                state.model_id
            )));
        }
        self.tokens = state.tokens;
        self.cursor = 0;
        self.last_sampled = None;
        self.stats.state_loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn complete_chat(
        &mut self,
        messages: &[ChatMessage],
        _params: &SamplingParams,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError> {
        self.stats.chat_completions.fetch_add(1, Ordering::SeqCst);
        debug!(messages = messages.len(), "MockEngine completing chat");
        let response = self.behavior.response.clone();
        for word in response.split_inclusive(' ') {
            on_chunk(word);
        }
        Ok(response)
    }
}

/// Produces `MockEngine`s sharing one `MockStats`.
#[derive(Debug, Clone, Default)]
pub struct MockLoader {
    behavior: MockBehavior,
    stats: Arc<MockStats>,
}

impl MockLoader {
    /// Creates a loader with the given behavior.
    #[must_use]
    pub fn new(behavior: MockBehavior) -> Self {
        Self { behavior, stats: Arc::new(MockStats::default()) }
    }

    /// Counters for every engine this loader produced.
    #[must_use]
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl EngineLoader for MockLoader {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(
        &self,
        model: &ModelDescriptor,
        params: &EngineParams,
    ) -> Result<Box<dyn LanguageEngine>, EngineError> {
        if self.behavior.fail_load {
            return Err(EngineError::LoadFailed(format!("scripted failure for {}", model.id)));
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine::new(
            model.id.clone(),
            params.context_size as usize,
            self.behavior.clone(),
            Arc::clone(&self.stats),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(behavior: MockBehavior) -> MockEngine {
        MockEngine::new("mock-model", 128, behavior, Arc::new(MockStats::default()))
    }

    fn generate(engine: &mut MockEngine) -> String {
        let params = SamplingParams::default();
        let mut out = Vec::new();
        loop {
            let token = engine.sample(&params).unwrap();
            if token == engine.token_eos() {
                break;
            }
            engine.eval(&[token]).unwrap();
            out.push(token);
        }
        String::from_utf8(engine.detokenize(&out).unwrap()).unwrap()
    }

    #[test]
    fn test_sampling_replays_response() {
        let mut engine = engine(MockBehavior::with_response("hi there"));
        engine.eval(&[1, 2, 3]).unwrap();
        assert_eq!(generate(&mut engine), "hi there");

        // A fresh prompt restarts the script.
        engine.eval(&[9, 9]).unwrap();
        assert_eq!(generate(&mut engine), "hi there");
    }

    #[test]
    fn test_empty_behavior_samples_eos() {
        let mut engine = engine(MockBehavior::empty());
        assert_eq!(engine.sample(&SamplingParams::default()).unwrap(), MOCK_EOS);
    }

    #[test]
    fn test_save_variants() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("s.kvcache");

        let mut no_structured =
            engine(MockBehavior { structured_save: false, ..MockBehavior::default() });
        assert!(no_structured.save_state().unwrap_err().is_unsupported());
        no_structured.save_state_to(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        let mut no_path = engine(MockBehavior { path_save: false, ..MockBehavior::default() });
        assert!(no_path.save_state_to(&path).unwrap_err().is_unsupported());
        assert!(!no_path.save_state().unwrap().is_empty());

        let mut broken = engine(MockBehavior { broken_save: true, ..MockBehavior::default() });
        assert!(broken.save_state().unwrap().is_empty());
    }

    #[test]
    fn test_state_model_override_is_rejected_on_load() {
        let mut liar = engine(MockBehavior {
            state_model_override: Some("other-model".to_string()),
            ..MockBehavior::default()
        });
        let blob = liar.save_state().unwrap();
        let mut honest = engine(MockBehavior::default());
        assert!(honest.load_state(&blob).is_err());
    }

    #[test]
    fn test_loader_counts() {
        let loader = MockLoader::new(MockBehavior::default());
        let model = ModelDescriptor::new("mock-model", "/nowhere", 4096);
        let mut engine = loader.load(&model, &EngineParams::default()).unwrap();
        let blob = engine.save_state().unwrap();
        engine.load_state(&blob).unwrap();
        engine.complete_chat(&[ChatMessage::user("q")], &SamplingParams::default(), &mut |_| {}).unwrap();

        let stats = loader.stats();
        assert_eq!(MockStats::get(&stats.loads), 1);
        assert_eq!(MockStats::get(&stats.state_loads), 1);
        assert_eq!(MockStats::get(&stats.chat_completions), 1);

        let failing = MockLoader::new(MockBehavior { fail_load: true, ..MockBehavior::default() });
        assert!(failing.load(&model, &EngineParams::default()).is_err());
    }
}
