//! Ingest command implementation.

use super::event_renderer::{self, RenderOptions};
use anyhow::Result;
use colored::Colorize;
use kvchat_core::{CacheService, IngestRequest, format_size};
use serde_json::json;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Execute the ingest command.
pub async fn execute(
    service: &CacheService,
    document: PathBuf,
    id: Option<String>,
    master: bool,
    json_output: bool,
) -> Result<()> {
    let mut request = IngestRequest::new(document).as_master(master);
    if let Some(id) = id {
        request = request.with_id(id);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let renderer = event_renderer::spawn(
        service.subscribe(),
        RenderOptions { stream_responses: false, progress: !json_output },
    );
    let result = service.ingest(request, cancel).await;
    renderer.finish().await;
    interrupt.abort();

    let outcome = result?;
    if json_output {
        let output = json!({
            "id": outcome.entry.id,
            "cache_path": outcome.entry.storage_path,
            "model_id": outcome.entry.owning_model_id,
            "token_count": outcome.token_count,
            "context_size": outcome.context_size,
            "size_bytes": outcome.size_bytes,
            "is_master": outcome.entry.is_master,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!("{}", "✓ KV cache created".green().bold());
    println!("  {}       {}", "Id:".bold(), outcome.entry.id.cyan());
    println!("  {}     {}", "Path:".bold(), outcome.entry.storage_path.display());
    println!("  {}   {}", "Tokens:".bold(), outcome.token_count);
    println!("  {}  {}", "Context:".bold(), outcome.context_size);
    println!("  {}     {}", "Size:".bold(), format_size(outcome.size_bytes));
    if outcome.entry.is_master {
        println!("  {}", "Master cache".yellow());
    }
    println!();
    Ok(())
}
