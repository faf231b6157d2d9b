//! Engine abstraction layer for kvchat.
//!
//! This crate defines the opaque "language model engine" capability that the
//! cache lifecycle manager drives: tokenize text, evaluate tokens into the
//! engine's internal attention state, sample the next token, and capture or
//! restore that state as an opaque blob.
//!
//! Engine calls are blocking and CPU/accelerator bound. Callers are expected
//! to run them on a blocking worker, never on a request-handling thread.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Identifier of a single token in an engine's vocabulary.
pub type TokenId = u32;

/// Represents an error raised by a language model engine.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    /// The model weights could not be found at the described location.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The model was found but could not be loaded.
    #[error("Model load error: {0}")]
    LoadFailed(String),

    /// Text could not be converted to tokens (or back).
    #[error("Tokenization error: {0}")]
    Tokenize(String),

    /// Token evaluation failed.
    #[error("Evaluation error: {0}")]
    Evaluate(String),

    /// Evaluating more tokens would overflow the allocated context.
    #[error("Context window exhausted: {used} of {capacity} tokens in use")]
    ContextFull {
        /// Tokens that would be held after the evaluation.
        used: usize,
        /// Allocated context size.
        capacity: usize,
    },

    /// Internal state could not be captured or restored.
    #[error("State error: {0}")]
    State(String),

    /// The engine binding does not offer this operation.
    #[error("Operation not supported by this engine: {0}")]
    Unsupported(String),

    /// High-level generation failed.
    #[error("Generation error: {0}")]
    Generation(String),

    /// I/O error while reading or writing engine files.
    #[error("I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Returns `true` if the engine simply lacks the requested operation.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Opaque description of a model: where its weights live and how large a
/// context it supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable model identifier. Cache state is only valid against this id.
    pub id: String,
    /// Path to the weights.
    pub path: PathBuf,
    /// Maximum context window the model supports, in tokens.
    pub context_window: u32,
}

impl ModelDescriptor {
    /// Creates a new descriptor.
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, context_window: u32) -> Self {
        Self { id: id.into(), path: path.into(), context_window }
    }
}

/// Runtime parameters used when instantiating an engine.
///
/// Everything except `context_size` is external configuration passed through
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineParams {
    /// Context window to allocate, in tokens.
    pub context_size: u32,
    /// Worker threads for evaluation.
    pub threads: u32,
    /// Tokens per evaluation batch.
    pub batch_size: u32,
    /// Layers offloaded to an accelerator (0 = CPU only).
    pub gpu_layers: u32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self { context_size: 2048, threads: 4, batch_size: 512, gpu_layers: 0 }
    }
}

impl EngineParams {
    /// Returns a copy with a different context size.
    #[must_use]
    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }
}

/// Parameters for controlling token sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature, between 0 and 2. Zero means greedy decoding.
    pub temperature: f32,
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Optional seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { temperature: 0.7, max_tokens: 1024, seed: None }
    }
}

/// Represents a message in a conversation with a chat model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender (e.g., "user", "assistant", "system").
    pub role: String,
    /// The content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// A loaded model instance holding mutable attention state.
///
/// Implementations are `Send` so a handle can move onto a blocking worker,
/// but they are not required to be `Sync`: exactly one caller may drive an
/// engine at a time.
pub trait LanguageEngine: Send {
    /// Returns the id of the model whose weights back this engine.
    fn model_id(&self) -> &str;

    /// Returns the allocated context size, in tokens.
    fn context_size(&self) -> usize;

    /// Returns the number of tokens currently held in the state.
    fn n_tokens(&self) -> usize;

    /// Converts raw text bytes into tokens.
    fn tokenize(&self, text: &[u8]) -> Result<Vec<TokenId>, EngineError>;

    /// Converts tokens back into raw text bytes.
    fn detokenize(&self, tokens: &[TokenId]) -> Result<Vec<u8>, EngineError>;

    /// Evaluates tokens, extending the internal state.
    fn eval(&mut self, tokens: &[TokenId]) -> Result<(), EngineError>;

    /// Samples one token given the current state. Does not evaluate it.
    fn sample(&mut self, params: &SamplingParams) -> Result<TokenId, EngineError>;

    /// Returns the end-of-sequence token.
    fn token_eos(&self) -> TokenId;

    /// Drops everything after the first `n_tokens` tokens of the state.
    fn rewind(&mut self, n_tokens: usize) -> Result<(), EngineError>;

    /// Clears the internal state.
    fn reset(&mut self);

    /// Captures the complete internal state and returns it to the caller.
    ///
    /// Bindings that can only write state to a file return
    /// [`EngineError::Unsupported`].
    fn save_state(&mut self) -> Result<Vec<u8>, EngineError>;

    /// Writes the complete internal state directly to `path`.
    fn save_state_to(&mut self, path: &Path) -> Result<(), EngineError> {
        let _ = path;
        Err(EngineError::Unsupported("save_state_to".to_string()))
    }

    /// Restores internal state from a blob previously produced by this model.
    fn load_state(&mut self, blob: &[u8]) -> Result<(), EngineError>;

    /// Restores internal state from a file written by either save variant.
    fn load_state_from(&mut self, path: &Path) -> Result<(), EngineError> {
        let blob = std::fs::read(path)?;
        self.load_state(&blob)
    }

    /// Runs prompt-based chat completion without reusing any saved state.
    ///
    /// `on_chunk` receives text as it is produced; the full text is returned.
    fn complete_chat(
        &mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError>;
}

/// Something that can instantiate engines for a model.
pub trait EngineLoader: Send + Sync {
    /// Short name of the backend (for logs).
    fn name(&self) -> &str;

    /// Loads the model described by `model` with the given runtime parameters.
    fn load(
        &self,
        model: &ModelDescriptor,
        params: &EngineParams,
    ) -> Result<Box<dyn LanguageEngine>, EngineError>;
}
