//! Context-window sizing for ingestion.

use crate::config::{CoreConfig, DEFAULT_ALIGNMENT, DEFAULT_MIN_CONTEXT, DEFAULT_PADDING_TOKENS};

/// Computes the context allocated to hold a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSizing {
    /// Rounding unit.
    pub alignment: u32,
    /// Tokens added on top of the document.
    pub padding: u32,
    /// Lower bound.
    pub min_context: u32,
}

impl Default for ContextSizing {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            padding: DEFAULT_PADDING_TOKENS,
            min_context: DEFAULT_MIN_CONTEXT,
        }
    }
}

impl From<&CoreConfig> for ContextSizing {
    fn from(config: &CoreConfig) -> Self {
        Self {
            alignment: config.alignment.max(1),
            padding: config.padding_tokens,
            min_context: config.min_context,
        }
    }
}

impl ContextSizing {
    /// `clamp(tokens + padding, min_context, model_max)` rounded up to the
    /// alignment. Never exceeds `model_max`: when rounding up would overflow
    /// it, the largest aligned size below the maximum is used, or the
    /// maximum itself if that is smaller than one alignment unit.
    #[must_use]
    pub fn compute(&self, tokens: u64, model_max: u32) -> u32 {
        let model_max = u64::from(model_max);
        let alignment = u64::from(self.alignment.max(1));
        let wanted = tokens.saturating_add(u64::from(self.padding));
        let clamped = wanted.max(u64::from(self.min_context)).min(model_max);

        let aligned = clamped.div_ceil(alignment) * alignment;
        let size = if aligned <= model_max {
            aligned
        } else {
            match model_max / alignment * alignment {
                0 => model_max,
                down => down,
            }
        };
        size as u32
    }

    /// Context for answering from a cache holding `cached_tokens`, with room
    /// for `max_tokens` of output. Never smaller than the context the cache
    /// was produced with, capped at `model_max`.
    #[must_use]
    pub fn for_inference(&self, cached_tokens: u64, recorded_context: u64, max_tokens: u32, model_max: u32) -> u32 {
        let needed = cached_tokens.saturating_add(u64::from(max_tokens));
        let recorded = recorded_context.min(u64::from(model_max)) as u32;
        self.compute(needed, model_max).max(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_document_uses_minimum() {
        let sizing = ContextSizing::default();
        let ctx = sizing.compute(500, 4096);
        assert_eq!(ctx, 2048);
        assert_eq!(ctx % 256, 0);
    }

    #[test]
    fn test_rounds_up_to_alignment() {
        let sizing = ContextSizing::default();
        assert_eq!(sizing.compute(5000, 128_000), 6144);
        assert_eq!(sizing.compute(5144, 128_000), 6144);
        assert_eq!(sizing.compute(5145, 128_000), 6400);
    }

    #[test]
    fn test_never_exceeds_model_max() {
        let sizing = ContextSizing::default();
        assert_eq!(sizing.compute(100_000, 4096), 4096);
        assert_eq!(sizing.compute(100_000, 4000), 3840);
        assert_eq!(sizing.compute(10, 200), 200);
    }

    #[test]
    fn test_for_inference_leaves_room_for_output() {
        let sizing = ContextSizing::default();
        assert_eq!(sizing.for_inference(500, 2048, 1024, 4096), 2560);
        assert_eq!(sizing.for_inference(0, 8192, 16, 4096), 4096);
        assert_eq!(sizing.for_inference(100_000, 0, 1024, 32_768), 32_768);
    }

    #[test]
    fn test_from_config() {
        let config = CoreConfig { alignment: 512, padding_tokens: 0, min_context: 1024, ..CoreConfig::default() };
        let sizing = ContextSizing::from(&config);
        assert_eq!(sizing.compute(1500, 8192), 1536);
        assert_eq!(sizing.compute(10, 8192), 1024);
    }
}
