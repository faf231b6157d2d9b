//! Generation on top of restored state, and fallback prompt construction.

use crate::error::{CoreError, Result};
use kvchat_abstraction::{ChatMessage, LanguageEngine, SamplingParams, TokenId};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PLAIN_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Text appended to restored state for one question.
#[must_use]
pub fn question_prompt(message: &str) -> String {
    format!("\n\nQuestion: {message}\n\nAnswer: ")
}

/// Generated text and how many tokens produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    /// Decoded response.
    pub text: String,
    /// Tokens sampled, excluding end-of-sequence.
    pub tokens: usize,
}

/// Emits decoded text in pieces, never splitting a UTF-8 sequence.
struct ChunkStream<'a> {
    on_chunk: &'a mut dyn FnMut(&str),
    emitted: usize,
}

impl ChunkStream<'_> {
    fn push(&mut self, decoded: &[u8], last: bool) {
        let pending = &decoded[self.emitted.min(decoded.len())..];
        if pending.is_empty() {
            return;
        }
        let (text, consumed) = match std::str::from_utf8(pending) {
            Ok(text) => (text.to_string(), pending.len()),
            Err(_) if last => (String::from_utf8_lossy(pending).into_owned(), pending.len()),
            Err(e) => {
                let valid = e.valid_up_to();
                (String::from_utf8_lossy(&pending[..valid]).into_owned(), valid)
            }
        };
        if !text.is_empty() {
            (self.on_chunk)(&text);
        }
        self.emitted += consumed;
    }
}

/// Generates an answer to `message` by extending the engine's current state.
///
/// Evaluates the question prompt, then samples one token at a time, feeding
/// each back into the engine, until end-of-sequence, the token budget, or a
/// full context. Text is streamed every `stream_every` tokens. Cancellation
/// is checked before every sampling step.
///
/// # Errors
/// `EmptyGeneration` if nothing was produced from a non-zero budget,
/// `Cancelled` if `cancel` fired, or the engine error.
pub fn generate_from_state(
    engine: &mut dyn LanguageEngine,
    message: &str,
    params: &SamplingParams,
    stream_every: usize,
    cancel: &CancellationToken,
    on_chunk: &mut dyn FnMut(&str),
) -> Result<Generated> {
    let prompt = engine.tokenize(question_prompt(message).as_bytes())?;
    engine.eval(&prompt)?;

    let eos = engine.token_eos();
    let stream_every = stream_every.max(1);
    let mut stream = ChunkStream { on_chunk, emitted: 0 };
    let mut output: Vec<TokenId> = Vec::new();

    for _ in 0..params.max_tokens {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if engine.n_tokens() >= engine.context_size() {
            warn!(tokens = output.len(), "Context full, stopping generation");
            break;
        }
        let token = engine.sample(params)?;
        if token == eos {
            break;
        }
        engine.eval(&[token])?;
        output.push(token);
        if output.len() % stream_every == 0 {
            stream.push(&engine.detokenize(&output)?, false);
        }
    }

    let decoded = engine.detokenize(&output)?;
    stream.push(&decoded, true);
    let text = String::from_utf8_lossy(&decoded).into_owned();
    debug!(tokens = output.len(), chars = text.len(), "Generation finished");

    if params.max_tokens > 0 && text.trim().is_empty() {
        return Err(CoreError::EmptyGeneration);
    }
    Ok(Generated { text, tokens: output.len() })
}

/// Reads up to `max_chars` characters of `path`, replacing invalid UTF-8.
///
/// Returns `None` when the document is missing, unreadable or empty.
#[must_use]
pub fn read_excerpt(path: &Path, max_chars: usize) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let text: String = String::from_utf8_lossy(&bytes).chars().take(max_chars).collect();
            (!text.trim().is_empty()).then_some(text)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read source document for context");
            None
        }
    }
}

/// System prompt for fallback generation.
#[must_use]
pub fn fallback_system_prompt(excerpt: Option<&str>) -> String {
    match excerpt {
        Some(text) => format!(
            "Use the following text to answer the user's question:\n\
             --- TEXT START ---\n\
             {text}...\n\
             --- TEXT END ---\n\n\
             Answer based *only* on the text provided above."
        ),
        None => PLAIN_SYSTEM_PROMPT.to_string(),
    }
}

/// Messages for a fallback turn: system prompt, the last `history_limit`
/// history messages, then the new user message.
#[must_use]
pub fn fallback_messages(
    excerpt: Option<&str>,
    history: &[ChatMessage],
    history_limit: usize,
    message: &str,
) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(history_limit);
    let mut messages = Vec::with_capacity(history.len() - start + 2);
    messages.push(ChatMessage::system(fallback_system_prompt(excerpt)));
    messages.extend_from_slice(&history[start..]);
    messages.push(ChatMessage::user(message));
    messages
}

/// Prompt-completion generation without state reuse.
///
/// # Errors
/// `EmptyGeneration` if the completion is blank, or the engine error.
pub fn generate_fallback(
    engine: &mut dyn LanguageEngine,
    messages: &[ChatMessage],
    params: &SamplingParams,
    cancel: &CancellationToken,
    on_chunk: &mut dyn FnMut(&str),
) -> Result<Generated> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    let text = engine.complete_chat(messages, params, on_chunk)?;
    if params.max_tokens > 0 && text.trim().is_empty() {
        return Err(CoreError::EmptyGeneration);
    }
    let tokens = engine.tokenize(text.as_bytes()).map_or(0, |t| t.len());
    Ok(Generated { text, tokens })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvchat_models::{MockBehavior, MockEngine, MockStats, NgramEngine};
    use std::sync::Arc;

    fn mock(response: &str) -> MockEngine {
        MockEngine::new("m", 4096, MockBehavior::with_response(response), Arc::new(MockStats::default()))
    }

    fn params(max_tokens: u32) -> SamplingParams {
        SamplingParams { temperature: 0.0, max_tokens, seed: Some(1) }
    }

    #[test]
    fn test_streams_in_chunks() {
        let mut engine = mock("abcdefghij");
        let mut chunks = Vec::new();
        let out = generate_from_state(
            &mut engine,
            "q",
            &params(64),
            4,
            &CancellationToken::new(),
            &mut |c| chunks.push(c.to_string()),
        )
        .unwrap();
        assert_eq!(out.text, "abcdefghij");
        assert_eq!(out.tokens, 10);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_budget_limits_output() {
        let mut engine = mock("abcdefghij");
        let out =
            generate_from_state(&mut engine, "q", &params(3), 8, &CancellationToken::new(), &mut |_| {}).unwrap();
        assert_eq!(out.text, "abc");
    }

    #[test]
    fn test_empty_generation() {
        let mut engine = mock("");
        let err =
            generate_from_state(&mut engine, "q", &params(16), 8, &CancellationToken::new(), &mut |_| {})
                .unwrap_err();
        assert!(matches!(err, CoreError::EmptyGeneration));
    }

    #[test]
    fn test_cancellation() {
        let mut engine = mock("abc");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = generate_from_state(&mut engine, "q", &params(16), 8, &cancel, &mut |_| {}).unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[test]
    fn test_utf8_never_split_across_chunks() {
        let mut engine = mock("héé");
        let mut chunks = Vec::new();
        generate_from_state(
            &mut engine,
            "q",
            &params(16),
            2,
            &CancellationToken::new(),
            &mut |c| chunks.push(c.to_string()),
        )
        .unwrap();
        assert_eq!(chunks.concat(), "héé");
        assert!(chunks.iter().all(|c| !c.contains('\u{FFFD}')));
    }

    #[test]
    fn test_answers_from_document_state() {
        let corpus = "Question: what colour is the sky?\nAnswer: blue";
        let mut engine = NgramEngine::from_corpus("m", corpus, 4096);
        let doc = engine.tokenize(b"The sky report.").unwrap();
        engine.eval(&doc).unwrap();
        let out = generate_from_state(
            &mut engine,
            "what colour is the sky?",
            &params(8),
            8,
            &CancellationToken::new(),
            &mut |_| {},
        )
        .unwrap();
        assert!(out.text.starts_with("blue"));
    }

    #[test]
    fn test_fallback_messages() {
        let history: Vec<ChatMessage> = (0..6).map(|i| ChatMessage::user(format!("m{i}"))).collect();
        let messages = fallback_messages(Some("DOC"), &history, 4, "now");
        assert_eq!(messages.len(), 6);
        assert!(messages[0].content.contains("--- TEXT START ---\nDOC...\n--- TEXT END ---"));
        assert_eq!(messages[1].content, "m2");
        assert_eq!(messages[5], ChatMessage::user("now"));

        let plain = fallback_messages(None, &[], 4, "hi");
        assert_eq!(plain[0].content, "You are a helpful assistant.");
    }

    #[test]
    fn test_read_excerpt_limits_chars() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("doc.txt");
        std::fs::write(&path, "ééééé").unwrap();
        assert_eq!(read_excerpt(&path, 3).unwrap(), "ééé");
        assert!(read_excerpt(&temp.path().join("none.txt"), 3).is_none());
    }

    #[test]
    fn test_generate_fallback() {
        let mut engine = mock("fallback words");
        let mut streamed = String::new();
        let out = generate_fallback(
            &mut engine,
            &[ChatMessage::user("q")],
            &params(16),
            &CancellationToken::new(),
            &mut |c| streamed.push_str(c),
        )
        .unwrap();
        assert_eq!(out.text, "fallback words");
        assert_eq!(streamed, "fallback words");

        let mut empty = mock("");
        let err = generate_fallback(&mut empty, &[], &params(16), &CancellationToken::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, CoreError::EmptyGeneration));
    }
}
