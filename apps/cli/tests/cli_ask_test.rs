//! Integration tests for the ask and chat commands.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CORPUS: &str = "The lighthouse keeper wrote every evening.\n\nShips passed the rocks in the fog.\n";
const DOCUMENT: &str = "The lighthouse on the northern cape was painted red. The keeper climbed the tower each night.";

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::create_dir_all(dir.path().join("store")).unwrap();
        std::fs::write(dir.path().join("models").join("tiny-ngram-4k.ngram"), CORPUS).unwrap();
        std::fs::write(dir.path().join("cape.txt"), DOCUMENT).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("kvchat").unwrap();
        cmd.env("NO_COLOR", "1")
            .env_remove("KVCHAT_MODEL")
            .env_remove("KVCHAT_CURRENT_MODEL_ID")
            .env_remove("KVCHAT_MODELS_FILE")
            .env_remove("KVCHAT_USE_CACHE")
            .env("KVCHAT_STORE_DIR", self.path().join("store"))
            .env("KVCHAT_MODELS_DIR", self.path().join("models"))
            .arg("--config")
            .arg(self.path().join("config.toml"));
        cmd
    }

    fn ingest(&self) -> PathBuf {
        let output = self
            .cmd()
            .args(["--model", "tiny-ngram-4k", "ingest", "--json"])
            .arg(self.path().join("cape.txt"))
            .output()
            .unwrap();
        assert!(output.status.success(), "ingest failed: {}", String::from_utf8_lossy(&output.stderr));
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        PathBuf::from(value["cache_path"].as_str().unwrap())
    }

    fn ask_json(&self, extra: &[&str]) -> serde_json::Value {
        let output = self
            .cmd()
            .args(["--model", "tiny-ngram-4k", "ask", "--json", "--temperature", "0", "--max-tokens", "24"])
            .args(extra)
            .arg("What colour was the lighthouse?")
            .output()
            .unwrap();
        assert!(output.status.success(), "ask failed: {}", String::from_utf8_lossy(&output.stderr));
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

#[test]
fn test_ask_requires_model() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["ask", "Anything?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No model selected"));
}

#[test]
fn test_ask_requires_question() {
    let ws = Workspace::new();
    ws.cmd().args(["--model", "tiny-ngram-4k", "ask"]).assert().failure();
}

#[test]
fn test_ask_unknown_cache_fails() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["--model", "tiny-ngram-4k", "ask", "--cache", "nowhere", "Anything?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nowhere"));
}

#[test]
fn test_ask_from_selected_cache_uses_restored_state() {
    let ws = Workspace::new();
    let cache_path = ws.ingest();

    let outcome = ws.ask_json(&["--cache", "cape"]);
    assert_eq!(outcome["strategy"], "true_cache_temporary");
    assert!(!outcome["text"].as_str().unwrap().is_empty());
    assert!(outcome["tokens_generated"].as_u64().unwrap() > 0);
    assert_eq!(PathBuf::from(outcome["cache_path"].as_str().unwrap()), cache_path);

    let output = ws.cmd().args(["caches", "list", "--json"]).output().unwrap();
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries[0]["usage_count"], 1);
    assert!(!entries[0]["last_used_at"].is_null());
}

#[test]
fn test_ask_without_cache_does_not_touch_usage() {
    let ws = Workspace::new();
    ws.ingest();

    let outcome = ws.ask_json(&["--cache", "cape", "--no-cache"]);
    assert_eq!(outcome["strategy"], "fallback_with_context");
    assert!(outcome["cache_path"].is_null());

    let output = ws.cmd().args(["caches", "list", "--json"]).output().unwrap();
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries[0]["usage_count"], 0);
}

#[test]
fn test_ask_with_nothing_ingested_answers_plainly() {
    let ws = Workspace::new();
    let outcome = ws.ask_json(&[]);
    assert_eq!(outcome["strategy"], "fallback_plain");
}

#[test]
fn test_ask_saves_and_resumes_history() {
    let ws = Workspace::new();
    ws.ingest();
    let history = ws.path().join("history.json");

    ws.ask_json(&["--cache", "cape", "--history", history.to_str().unwrap()]);
    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&history).unwrap()).unwrap();
    assert_eq!(saved["history"].as_array().unwrap().len(), 2);
    assert_eq!(saved["history"][0]["role"], "user");
    assert!(saved["kv_cache"].as_str().unwrap().ends_with(".kvcache"));

    // The saved selection is restored without passing --cache again.
    let outcome = ws.ask_json(&["--history", history.to_str().unwrap()]);
    assert_eq!(outcome["strategy"], "true_cache_temporary");
    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&history).unwrap()).unwrap();
    assert_eq!(saved["history"].as_array().unwrap().len(), 4);
}

#[test]
fn test_chat_reads_questions_until_quit() {
    let ws = Workspace::new();
    ws.ingest();

    ws.cmd()
        .args(["--model", "tiny-ngram-4k", "chat", "--cache", "cape", "--temperature", "0", "--max-tokens", "16"])
        .write_stdin("Who climbed the tower?\n/clear\n/quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Conversation cleared."))
        .stderr(predicate::str::contains("true_cache_temporary"));
}
