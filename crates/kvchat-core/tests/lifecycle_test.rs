//! End-to-end cache lifecycle through the service facade: ingest, warm,
//! answer, and the fallback paths.

use kvchat_abstraction::ModelDescriptor;
use kvchat_core::events::drain;
use kvchat_core::session::DEGRADED_LABEL;
use kvchat_core::{
    ActiveModel, CacheService, CacheStatus, CoreConfig, CoreError, CoreEvent, IngestRequest,
    TurnOptions,
};
use kvchat_models::{MockBehavior, MockLoader, MockStats};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    temp: TempDir,
    service: CacheService,
    stats: Arc<MockStats>,
}

fn mock_model(temp: &TempDir, id: &str, behavior: MockBehavior) -> (ActiveModel, Arc<MockStats>) {
    let loader = MockLoader::new(behavior);
    let stats = loader.stats();
    let model = ActiveModel::new(ModelDescriptor::new(id, temp.path().join(format!("{id}.bin")), 4096), Arc::new(loader));
    (model, stats)
}

async fn harness(behavior: MockBehavior) -> Harness {
    let temp = TempDir::new().unwrap();
    let config = CoreConfig {
        store_dir: temp.path().join("caches"),
        models_dir: temp.path().join("models"),
        ..CoreConfig::default()
    };
    let service = CacheService::open(config).unwrap();
    let (model, stats) = mock_model(&temp, "model-a", behavior);
    service.set_active_model(model).await;
    Harness { temp, service, stats }
}

async fn ingest_doc(h: &Harness, name: &str) -> PathBuf {
    let doc = h.temp.path().join(name);
    std::fs::write(&doc, "The sky in this report is blue. ".repeat(60)).unwrap();
    let outcome = h.service.ingest(IngestRequest::new(&doc), CancellationToken::new()).await.unwrap();
    outcome.entry.storage_path
}

#[tokio::test]
async fn test_ingest_warm_and_answer_from_state() {
    let h = harness(MockBehavior::with_response("It is blue.")).await;
    let cache = ingest_doc(&h, "report.txt").await;

    let entry = h.service.get(&cache).unwrap();
    assert_eq!(entry.token_count, 1920);
    assert_eq!(entry.context_window_size, 2048);

    h.service.select_cache(Some(&cache)).await.unwrap();
    let info = h.service.warm_up(&cache).await.unwrap();
    assert_eq!(info.token_count, 1920);
    assert_eq!(h.service.current_warm(), Some(("model-a".to_string(), "report".to_string())));

    let mut rx = h.service.subscribe();
    let outcome = h.service.ask("What colour is the sky?", TurnOptions::default()).await.unwrap();
    assert_eq!(outcome.text, "It is blue.");
    assert_eq!(outcome.strategy, "true_cache_warm");
    assert_eq!(outcome.status, CacheStatus::Warmed);
    assert_eq!(outcome.cache_path.as_deref(), Some(cache.as_path()));
    assert_eq!(MockStats::get(&h.stats.chat_completions), 0);

    let entry = h.service.get(&cache).unwrap();
    assert_eq!(entry.usage_count, 1);
    assert!(entry.last_used_at.is_some());

    let events = drain(&mut rx);
    assert_eq!(events.first(), Some(&CoreEvent::ResponseStarted));
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::ResponseChunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "It is blue.");
    assert!(events.contains(&CoreEvent::ResponseComplete { text: "It is blue.".to_string(), success: true }));

    // The warm instance is rewound, so a second turn starts from the document.
    let again = h.service.ask("And the grass?", TurnOptions::default()).await.unwrap();
    assert_eq!(again.text, "It is blue.");
    assert_eq!(h.service.get(&cache).unwrap().usage_count, 2);
    assert_eq!(h.service.history().len(), 4);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_master_cache_answers_through_temporary_load() {
    let h = harness(MockBehavior::with_response("Blue.")).await;
    let cache = ingest_doc(&h, "report.txt").await;
    h.service.set_master(&cache).unwrap();
    let loads_before = MockStats::get(&h.stats.loads);

    let outcome = h.service.ask("Sky?", TurnOptions::default()).await.unwrap();
    assert_eq!(outcome.strategy, "true_cache_temporary");
    assert_eq!(outcome.status, CacheStatus::UsingTempCache);
    assert_eq!(MockStats::get(&h.stats.state_loads), 1);
    assert_eq!(MockStats::get(&h.stats.loads), loads_before + 1);
    assert_eq!(h.service.get(&cache).unwrap().usage_count, 1);
    assert!(h.service.current_warm().is_none());
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_cache_disabled_never_loads_state() {
    let h = harness(MockBehavior::with_response("Plain answer.")).await;
    let cache = ingest_doc(&h, "report.txt").await;
    h.service.select_cache(Some(&cache)).await.unwrap();
    h.service.set_use_cache(false);

    let outcome = h.service.ask("Sky?", TurnOptions::default()).await.unwrap();
    assert_eq!(outcome.text, "Plain answer.");
    assert_eq!(outcome.status, CacheStatus::Fallback);
    assert_eq!(outcome.strategy, "fallback_with_context");
    assert!(outcome.cache_path.is_none());
    assert_eq!(MockStats::get(&h.stats.state_loads), 0);
    assert_eq!(MockStats::get(&h.stats.chat_completions), 1);

    let entry = h.service.get(&cache).unwrap();
    assert_eq!(entry.usage_count, 0);
    assert!(entry.last_used_at.is_none());
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_cache_from_other_model_degrades_to_fallback() {
    let h = harness(MockBehavior::with_response("Answer.")).await;
    let cache = ingest_doc(&h, "report.txt").await;
    h.service.select_cache(Some(&cache)).await.unwrap();

    let (other, other_stats) = mock_model(&h.temp, "model-b", MockBehavior::with_response("From B."));
    h.service.set_active_model(other).await;

    let err = h.service.warm_up(&cache).await.unwrap_err();
    assert!(matches!(err, CoreError::Incompatible { .. }));
    assert!(h.service.current_warm().is_none());

    let mut rx = h.service.subscribe();
    let outcome = h.service.ask("Sky?", TurnOptions::default()).await.unwrap();
    assert_eq!(outcome.text, "From B.");
    assert_eq!(outcome.status, CacheStatus::Fallback);
    assert!(outcome.warning.as_deref().unwrap().contains("model-a"));
    assert_eq!(MockStats::get(&other_stats.state_loads), 0);
    assert_eq!(h.service.get(&cache).unwrap().usage_count, 0);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, CoreEvent::Warning { .. })));
    assert!(events.contains(&CoreEvent::CacheStatusChanged { status: CacheStatus::Fallback }));
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_switching_model_unloads_warm_cache() {
    let h = harness(MockBehavior::default()).await;
    let cache = ingest_doc(&h, "report.txt").await;
    h.service.warm_up(&cache).await.unwrap();
    assert!(h.service.current_warm().is_some());

    let (other, _) = mock_model(&h.temp, "model-b", MockBehavior::default());
    h.service.set_active_model(other).await;
    assert!(h.service.current_warm().is_none());
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_state_load_failure_falls_back_with_warning() {
    let h = harness(MockBehavior { fail_state_load: true, ..MockBehavior::with_response("Recovered.") }).await;
    let cache = ingest_doc(&h, "report.txt").await;
    h.service.select_cache(Some(&cache)).await.unwrap();

    let outcome = h.service.ask("Sky?", TurnOptions::default()).await.unwrap();
    assert_eq!(outcome.text, "Recovered.");
    assert_eq!(outcome.strategy, DEGRADED_LABEL);
    assert_eq!(outcome.status, CacheStatus::Fallback);
    assert!(outcome.warning.is_some());
    assert!(outcome.cache_path.is_none());
    assert_eq!(h.service.get(&cache).unwrap().usage_count, 0);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_empty_generation_is_distinct_failure() {
    let h = harness(MockBehavior::empty()).await;
    let mut rx = h.service.subscribe();

    let err = h.service.ask("Anything?", TurnOptions::default()).await.unwrap_err();
    assert!(matches!(err, CoreError::EmptyGeneration));
    assert_eq!(err.kind(), kvchat_core::ErrorKind::EmptyGeneration);
    assert!(h.service.history().is_empty());

    let events = drain(&mut rx);
    assert!(events.contains(&CoreEvent::ResponseComplete { text: String::new(), success: false }));
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_history_round_trip_restores_selection() {
    let h = harness(MockBehavior::with_response("Yes.")).await;
    let cache = ingest_doc(&h, "report.txt").await;
    h.service.select_cache(Some(&cache)).await.unwrap();
    h.service.ask("Is it blue?", TurnOptions::default()).await.unwrap();

    let history_path = h.temp.path().join("chat.json");
    h.service.save_history(&history_path).unwrap();

    h.service.session().clear_history();
    h.service.select_cache(None).await.unwrap();
    let file = h.service.load_history(&history_path).unwrap();
    assert_eq!(file.model_id.as_deref(), Some("model-a"));
    assert_eq!(h.service.history().len(), 2);
    assert_eq!(h.service.selected_cache(), Some(cache));
    h.service.shutdown().await;
}
