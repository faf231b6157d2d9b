//! Concurrent access to the warm slot and the registry.

use kvchat_abstraction::ModelDescriptor;
use kvchat_core::events::drain;
use kvchat_core::{
    CacheRegistration, CacheStore, CoreConfig, CoreEvent, EventBus, PurgeOutcome,
    WarmInstanceManager, WarmPhase,
};
use kvchat_models::{MockBehavior, MockLoader, MockStats};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn add_cache(store: &CacheStore, id: &str, model_id: &str) -> PathBuf {
    let path = store.blob_path_for(id);
    let state = serde_json::json!({ "model_id": model_id, "tokens": [104, 101, 108, 108, 111] });
    std::fs::write(&path, state.to_string()).unwrap();
    store
        .register(CacheRegistration {
            id: id.to_string(),
            storage_path: path.clone(),
            model_id: model_id.to_string(),
            token_count: 5,
            context_window: 2048,
            source_document_path: None,
            is_master: false,
        })
        .unwrap()
        .storage_path
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_warm_ups_leave_one_cache_resident() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(temp.path().join("caches"), EventBus::new(1024)).unwrap());
    let first = add_cache(&store, "first", "model-a");
    let second = add_cache(&store, "second", "model-a");

    let manager = Arc::new(WarmInstanceManager::new(Arc::clone(&store), CoreConfig::default()));
    let loader = Arc::new(MockLoader::new(MockBehavior::default()));
    let stats = loader.stats();
    let model = ModelDescriptor::new("model-a", temp.path().join("a.bin"), 8192);

    let tasks: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|path| {
            let manager = Arc::clone(&manager);
            let loader = Arc::clone(&loader);
            let model = model.clone();
            tokio::spawn(async move { manager.warm_up(&path, &model, loader).await })
        })
        .collect();

    // Every snapshot observed while the transitions run is self-consistent.
    for _ in 0..50 {
        let snapshot = manager.snapshot();
        match snapshot.phase {
            WarmPhase::Ready => {
                assert!(snapshot.cache_path.is_some());
                assert!(snapshot.model_id.is_some());
            }
            WarmPhase::Empty => assert!(snapshot.cache_path.is_none()),
            _ => {}
        }
        tokio::task::yield_now().await;
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.phase, WarmPhase::Ready);
    let resident = snapshot.cache_path.unwrap();
    assert!(resident == first || resident == second);
    assert_eq!(manager.current().map(|(model, _)| model), Some("model-a".to_string()));
    assert_eq!(MockStats::get(&stats.state_loads), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purges_delete_once() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(temp.path().join("caches"), EventBus::new(1024)).unwrap());
    let path = add_cache(&store, "doc", "model-a");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let path = path.clone();
            tokio::task::spawn_blocking(move || store.purge(&path))
        })
        .collect();

    let mut deleted = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() == PurgeOutcome::Deleted {
            deleted += 1;
        }
    }
    assert_eq!(deleted, 1);
    assert!(store.get(&path).is_none());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_purge_all_with_missing_blob_still_succeeds() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path().join("caches"), EventBus::new(1024)).unwrap();
    let a = add_cache(&store, "a", "model-a");
    let _b = add_cache(&store, "b", "model-a");
    let _c = add_cache(&store, "c", "model-a");
    std::fs::remove_file(&a).unwrap();
    let mut rx = store.events().subscribe();

    let report = store.purge_all();
    assert!(report.success());
    assert_eq!(report.deleted.len(), 2);
    assert_eq!(report.already_absent, vec![a]);
    assert!(store.list().is_empty());
    assert_eq!(store.total_size(), 0);

    let events = drain(&mut rx);
    assert!(events.iter().all(|e| !matches!(e, CoreEvent::CachePurged { success: false, .. })));
}

#[tokio::test]
async fn test_rescan_is_quiet_without_changes() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path().join("caches"), EventBus::new(1024)).unwrap();
    std::fs::write(store.blob_path_for("dropped_in"), b"{}").unwrap();

    let first = store.scan_and_reconcile().unwrap();
    assert_eq!(first.added.len(), 1);

    let mut rx = store.events().subscribe();
    let second = store.scan_and_reconcile().unwrap();
    assert!(!second.set_changed());
    assert!(!drain(&mut rx).contains(&CoreEvent::CacheListChanged));
    assert_eq!(store.list()[0].owning_model_id, kvchat_core::store::UNKNOWN_MODEL);
}
