//! Byte-level n-gram engine.
//!
//! `NgramEngine` is a small, fully offline language engine. Its "weights" are a
//! plain-text corpus: every blank-line separated passage becomes a training
//! sequence terminated by the end-of-sequence token. Sampling predicts the next
//! byte from the longest matching suffix (up to order 3) over the corpus plus
//! every token evaluated into the current state, so priming the state with a
//! document genuinely changes what the engine says next.
//!
//! The evaluated token history is the engine's attention state. It serializes
//! to a checksummed JSON blob bound to the model id that produced it.

use kvchat_abstraction::{
    ChatMessage, EngineError, EngineLoader, EngineParams, LanguageEngine, ModelDescriptor,
    SamplingParams, TokenId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// End-of-sequence token. Byte values occupy 0..=255.
pub const EOS_TOKEN: TokenId = 256;

/// Longest suffix considered when predicting the next token.
const MAX_ORDER: usize = 3;

/// Number of tokens buffered before a chunk is streamed.
const CHUNK_TOKENS: usize = 8;

const STATE_FORMAT: &str = "kvchat-ngram-state/1";

#[derive(Debug, Serialize, Deserialize)]
struct StateBlob {
    format: String,
    model_id: String,
    context_size: usize,
    tokens: Vec<TokenId>,
    checksum: String,
}

fn checksum(tokens: &[TokenId]) -> String {
    let mut hasher = Sha256::new();
    for token in tokens {
        hasher.update(token.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// A loaded n-gram model plus its evaluated token state.
pub struct NgramEngine {
    model_id: String,
    context_size: usize,
    prior: Vec<TokenId>,
    tokens: Vec<TokenId>,
    rng: StdRng,
    seed: Option<u64>,
}

impl std::fmt::Debug for NgramEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NgramEngine")
            .field("model_id", &self.model_id)
            .field("context_size", &self.context_size)
            .field("prior_len", &self.prior.len())
            .field("n_tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

impl NgramEngine {
    /// Builds an engine from corpus text.
    #[must_use]
    pub fn from_corpus(model_id: impl Into<String>, corpus: &str, context_size: usize) -> Self {
        let mut prior = Vec::with_capacity(corpus.len());
        for passage in corpus.split("\n\n") {
            let passage = passage.trim();
            if passage.is_empty() {
                continue;
            }
            prior.extend(passage.bytes().map(TokenId::from));
            prior.push(EOS_TOKEN);
        }

        Self {
            model_id: model_id.into(),
            context_size,
            prior,
            tokens: Vec::new(),
            rng: StdRng::from_entropy(),
            seed: None,
        }
    }

    /// Tokens currently held in the state.
    #[must_use]
    pub fn state_tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    fn count_successors(seq: &[TokenId], pattern: &[TokenId], counts: &mut [u32]) {
        let k = pattern.len();
        for i in k..seq.len() {
            if &seq[i - k..i] == pattern {
                counts[seq[i] as usize] += 1;
            }
        }
    }

    fn successor_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; EOS_TOKEN as usize + 1];
        let max_order = MAX_ORDER.min(self.tokens.len());

        for order in (1..=max_order).rev() {
            let suffix = &self.tokens[self.tokens.len() - order..];
            Self::count_successors(&self.prior, suffix, &mut counts);
            Self::count_successors(&self.tokens, suffix, &mut counts);
            if counts.iter().any(|c| *c > 0) {
                return counts;
            }
        }

        // Unigram backoff. EOS is excluded so an unmatched context still speaks.
        for token in self.prior.iter().chain(self.tokens.iter()) {
            if *token != EOS_TOKEN {
                counts[*token as usize] += 1;
            }
        }
        counts
    }

    fn most_frequent(counts: &[u32]) -> TokenId {
        let mut best = 0usize;
        for (token, count) in counts.iter().enumerate() {
            if *count > counts[best] {
                best = token;
            }
        }
        best as TokenId
    }

    fn choose(&mut self, counts: &[u32], temperature: f32) -> TokenId {
        let Some(max) = counts.iter().copied().max().filter(|m| *m > 0) else {
            return EOS_TOKEN;
        };
        if temperature <= 0.0 {
            return Self::most_frequent(counts);
        }

        // Weights are relative to the top count so the leader stays at 1.0
        // and sharp temperatures cannot overflow.
        let exponent = 1.0 / f64::from(temperature);
        let top = f64::from(max);
        let weights: Vec<f64> = counts.iter().map(|c| (f64::from(*c) / top).powf(exponent)).collect();
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return Self::most_frequent(counts);
        }

        let mut roll = self.rng.gen_range(0.0..total);
        for (token, weight) in weights.iter().enumerate() {
            if *weight > 0.0 {
                if roll < *weight {
                    return token as TokenId;
                }
                roll -= weight;
            }
        }
        // Floating point leftovers land on the last candidate.
        weights.iter().rposition(|w| *w > 0.0).map_or(EOS_TOKEN, |t| t as TokenId)
    }

    fn render_prompt(messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str(&message.role);
            prompt.push_str(": ");
            prompt.push_str(&message.content);
            prompt.push('\n');
        }
        prompt.push_str("assistant: ");
        prompt
    }

    fn chat_on_scratch(
        &mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError> {
        let prompt = self.tokenize(Self::render_prompt(messages).as_bytes())?;
        let budget = (params.max_tokens as usize).min(self.context_size / 2);
        let keep = self.context_size.saturating_sub(budget);
        let start = prompt.len().saturating_sub(keep);
        self.eval(&prompt[start..])?;

        let mut output = Vec::new();
        let mut pending = Vec::new();
        for _ in 0..params.max_tokens {
            if self.tokens.len() >= self.context_size {
                break;
            }
            let token = self.sample(params)?;
            if token == EOS_TOKEN {
                break;
            }
            self.eval(&[token])?;
            output.push(token as u8);
            pending.push(token as u8);
            if pending.len() >= CHUNK_TOKENS {
                flush_utf8(&mut pending, on_chunk, false);
            }
        }
        flush_utf8(&mut pending, on_chunk, true);

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

/// Streams the longest valid UTF-8 prefix of `pending`, keeping a split
/// multi-byte sequence for the next flush unless `last` is set.
fn flush_utf8(pending: &mut Vec<u8>, on_chunk: &mut dyn FnMut(&str), last: bool) {
    if pending.is_empty() {
        return;
    }
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(_) if last => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            on_chunk(&text);
            return;
        }
        Err(e) => e.valid_up_to(),
    };
    if valid == 0 {
        return;
    }
    let rest = pending.split_off(valid);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    on_chunk(&text);
}

impl LanguageEngine for NgramEngine {
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
        tokens
            .iter()
            .filter(|t| **t != EOS_TOKEN)
            .map(|t| {
                u8::try_from(*t)
                    .map_err(|_| EngineError::Tokenize(format!("token {t} is outside the vocabulary")))
            })
            .collect()
    }

    fn eval(&mut self, tokens: &[TokenId]) -> Result<(), EngineError> {
        if let Some(bad) = tokens.iter().find(|t| **t > EOS_TOKEN) {
            return Err(EngineError::Evaluate(format!("token {bad} is outside the vocabulary")));
        }
        let used = self.tokens.len() + tokens.len();
        if used > self.context_size {
            return Err(EngineError::ContextFull { used, capacity: self.context_size });
        }
        self.tokens.extend_from_slice(tokens);
        Ok(())
    }

    fn sample(&mut self, params: &SamplingParams) -> Result<TokenId, EngineError> {
        if let Some(seed) = params.seed {
            if self.seed != Some(seed) {
                self.rng = StdRng::seed_from_u64(seed);
                self.seed = Some(seed);
            }
        }
        let counts = self.successor_counts();
        Ok(self.choose(&counts, params.temperature))
    }

    fn token_eos(&self) -> TokenId {
        EOS_TOKEN
    }

    fn rewind(&mut self, n_tokens: usize) -> Result<(), EngineError> {
        if n_tokens > self.tokens.len() {
            return Err(EngineError::State(format!(
                "cannot rewind to {n_tokens} tokens, only {} held",
                self.tokens.len()
            )));
        }
        self.tokens.truncate(n_tokens);
        Ok(())
    }

    fn reset(&mut self) {
        self.tokens.clear();
    }

    fn save_state(&mut self) -> Result<Vec<u8>, EngineError> {
        let blob = StateBlob {
            format: STATE_FORMAT.to_string(),
            model_id: self.model_id.clone(),
            context_size: self.context_size,
            tokens: self.tokens.clone(),
            checksum: checksum(&self.tokens),
        };
        serde_json::to_vec(&blob).map_err(|e| EngineError::State(e.to_string()))
    }

    fn save_state_to(&mut self, path: &Path) -> Result<(), EngineError> {
        let bytes = self.save_state()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load_state(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let state: StateBlob = serde_json::from_slice(blob)
            .map_err(|e| EngineError::State(format!("corrupt state blob: {e}")))?;

        if state.format != STATE_FORMAT {
            return Err(EngineError::State(format!("unknown state format '{}'", state.format)));
        }
        if state.model_id != self.model_id {
            return Err(EngineError::State(format!(
                "state was produced by model '{}', engine runs '{}'",
                state.model_id, self.model_id
            )));
        }
        if checksum(&state.tokens) != state.checksum {
            return Err(EngineError::State("state checksum mismatch".to_string()));
        }
        if state.tokens.len() > self.context_size {
            return Err(EngineError::ContextFull {
                used: state.tokens.len(),
                capacity: self.context_size,
            });
        }

        self.tokens = state.tokens;
        Ok(())
    }

    fn complete_chat(
        &mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError> {
        let saved = std::mem::take(&mut self.tokens);
        let result = self.chat_on_scratch(messages, params, on_chunk);
        self.tokens = saved;
        result
    }
}

/// Loads `NgramEngine`s from corpus files.
#[derive(Debug, Default, Clone, Copy)]
pub struct NgramLoader;

impl EngineLoader for NgramLoader {
    fn name(&self) -> &str {
        "ngram"
    }

    fn load(
        &self,
        model: &ModelDescriptor,
        params: &EngineParams,
    ) -> Result<Box<dyn LanguageEngine>, EngineError> {
        if !model.path.is_file() {
            return Err(EngineError::ModelNotFound(model.path.display().to_string()));
        }
        if params.context_size == 0 {
            return Err(EngineError::LoadFailed("context size must be positive".to_string()));
        }

        let corpus = std::fs::read(&model.path).map_err(|e| {
            EngineError::LoadFailed(format!("{}: {e}", model.path.display()))
        })?;
        let corpus = String::from_utf8_lossy(&corpus);

        debug!(
            model_id = %model.id,
            context_size = params.context_size,
            threads = params.threads,
            corpus_bytes = corpus.len(),
            "Loaded n-gram model"
        );

        Ok(Box::new(NgramEngine::from_corpus(
            model.id.clone(),
            &corpus,
            params.context_size as usize,
        )))
    }
}
