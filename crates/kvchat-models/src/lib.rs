//! Engine implementations for kvchat.
//!
//! This crate provides concrete implementations of the `LanguageEngine` trait
//! and the catalog used to find model weights on disk.
//!
//! # Supported Backends
//!
//! - **Ngram**: offline byte-level n-gram engine with real, serializable state
//! - **Mock**: scripted engine with injectable failures, for tests

pub mod catalog;
pub mod factory;
pub mod mock;
pub mod ngram;

pub use catalog::{AvailableModel, CatalogEntry, CatalogError, DEFAULT_CONTEXT_WINDOW, ModelCatalog};
pub use factory::{EngineFactory, EngineKind};
pub use mock::{MOCK_EOS, MockBehavior, MockEngine, MockLoader, MockStats};
pub use ngram::{EOS_TOKEN, NgramEngine, NgramLoader};
