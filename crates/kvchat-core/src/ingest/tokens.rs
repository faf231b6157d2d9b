//! Token estimation and document identity.
//!
//! Estimates only drive context sizing. When an engine is at hand its
//! tokenizer gives the exact count; otherwise a per-format bytes-per-token
//! average is used.

use crate::error::{CoreError, Result};
use kvchat_abstraction::LanguageEngine;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Files above this size are estimated from their size without being read.
pub const LARGE_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Average bytes per token when the format is unknown.
pub const DEFAULT_BYTES_PER_TOKEN: f64 = 4.0;

/// Average bytes per token for a file extension.
#[must_use]
pub fn bytes_per_token(extension: &str) -> f64 {
    match extension.to_ascii_lowercase().as_str() {
        "md" | "markdown" => 4.2,
        "html" | "htm" => 5.5,
        "pdf" => 6.0,
        "docx" => 5.0,
        _ => DEFAULT_BYTES_PER_TOKEN,
    }
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("")
}

/// Stable document id: lowercased file stem with every character outside
/// `[a-z0-9_]` replaced by `_`.
#[must_use]
pub fn document_id_from_path(path: &Path) -> String {
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_lowercase()).unwrap_or_default();
    if stem.is_empty() {
        return "document".to_string();
    }
    stem.chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' { c } else { '_' })
        .collect()
}

/// Heuristic token count for `len` bytes of a given format.
#[must_use]
pub fn heuristic_tokens(len: u64, extension: &str) -> u64 {
    (len as f64 / bytes_per_token(extension)) as u64
}

/// Token count for `text`: exact when an engine is supplied.
///
/// # Errors
/// Returns an error if the engine's tokenizer fails.
pub fn estimate_tokens(
    text: &[u8],
    extension: &str,
    engine: Option<&dyn LanguageEngine>,
) -> Result<u64> {
    match engine {
        Some(engine) => Ok(engine.tokenize(text)?.len() as u64),
        None => Ok(heuristic_tokens(text.len() as u64, extension)),
    }
}

/// How a document's token count was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenEstimate {
    /// Estimated tokens.
    pub tokens: u64,
    /// Whether the engine tokenizer produced the count.
    pub exact: bool,
    /// Document size in bytes.
    pub file_size: u64,
}

/// Estimates the tokens in the file at `path`.
///
/// # Errors
/// Returns `NotFound` if the file does not exist, or an I/O or engine error.
pub fn estimate_file(path: &Path, engine: Option<&dyn LanguageEngine>) -> Result<TokenEstimate> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(CoreError::not_found("document", path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoreError::not_found("document", path));
        }
        Err(e) => return Err(e.into()),
    };
    let extension = extension_of(path);
    let file_size = meta.len();

    if file_size > LARGE_FILE_BYTES {
        let tokens = heuristic_tokens(file_size, extension);
        debug!(path = %path.display(), file_size, tokens, "Estimated large document from size");
        return Ok(TokenEstimate { tokens, exact: false, file_size });
    }

    let bytes = std::fs::read(path)?;
    let tokens = estimate_tokens(&bytes, extension, engine)?;
    Ok(TokenEstimate { tokens, exact: engine.is_some(), file_size })
}

/// How a token count relates to a context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextFit {
    /// At most 90% of the window.
    Fits,
    /// Within the window but above 90%.
    Tight,
    /// Up to 20% over the window.
    Over,
    /// More than 20% over.
    TooLarge,
}

impl std::fmt::Display for ContextFit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Fits => "fits",
            Self::Tight => "tight",
            Self::Over => "over",
            Self::TooLarge => "too large",
        };
        f.write_str(label)
    }
}

/// Fit classification with the raw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitReport {
    /// Classification.
    pub fit: ContextFit,
    /// Tokens as a percentage of the window.
    pub percent: f64,
    /// Whether the tokens fit at all.
    pub fits: bool,
}

impl FitReport {
    /// Classifies `tokens` against `context_window`.
    #[must_use]
    pub fn classify(tokens: u64, context_window: u64) -> Self {
        if context_window == 0 {
            return Self { fit: ContextFit::TooLarge, percent: 0.0, fits: tokens == 0 };
        }
        let ratio = tokens as f64 / context_window as f64;
        let fit = if ratio <= 0.9 {
            ContextFit::Fits
        } else if ratio <= 1.0 {
            ContextFit::Tight
        } else if ratio <= 1.2 {
            ContextFit::Over
        } else {
            ContextFit::TooLarge
        };
        Self { fit, percent: ratio * 100.0, fits: tokens <= context_window }
    }
}
