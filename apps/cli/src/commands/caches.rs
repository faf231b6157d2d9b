//! Caches command implementation.

use super::types::CachesCommand;
use anyhow::{Context, Result, anyhow, bail};
use colored::Colorize;
use comfy_table::{Cell, Color as ComfyColor, Table};
use kvchat_core::{CacheEntry, CacheService, PurgeOutcome, format_size};
use serde_json::json;

/// Execute the caches command.
pub async fn execute(service: &CacheService, command: CachesCommand) -> Result<()> {
    match command {
        CachesCommand::List { json } => list_caches(service, json),
        CachesCommand::Info { cache, json } => show_info(service, &cache, json),
        CachesCommand::Purge { cache } => purge(service, &cache).await,
        CachesCommand::PurgeAll { yes } => purge_all(service, yes).await,
        CachesCommand::Size { json } => show_size(service, json),
        CachesCommand::Check { window } => check(service, window),
        CachesCommand::Master { cache } => master(service, cache.as_deref()),
        CachesCommand::Scan => scan(service).await,
    }
}

fn resolve(service: &CacheService, cache: &str) -> Result<CacheEntry> {
    service.resolve(cache).ok_or_else(|| anyhow!("No tracked cache matches '{cache}'"))
}

fn list_caches(service: &CacheService, json_output: bool) -> Result<()> {
    let entries = service.list();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", "No caches found.".yellow());
        println!("  Create one with {}", "kvchat ingest <document>".cyan());
        return Ok(());
    }

    println!();
    println!("{}", format!("KV Caches ({} total)", entries.len()).bold().green());
    println!();

    let mut table = Table::new();
    table.set_header(vec!["ID", "Model", "Tokens", "Context", "Size", "Last Used", "Uses"]);
    for entry in &entries {
        let id = if entry.is_master {
            Cell::new(format!("{} *", entry.id)).fg(ComfyColor::Yellow)
        } else {
            Cell::new(&entry.id).fg(ComfyColor::Cyan)
        };
        let model = if entry.has_known_model() {
            Cell::new(&entry.owning_model_id)
        } else {
            Cell::new(&entry.owning_model_id).fg(ComfyColor::DarkGrey)
        };
        let last_used = entry
            .last_used_at
            .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        table.add_row(vec![
            id,
            model,
            Cell::new(entry.token_count),
            Cell::new(entry.context_window_size),
            Cell::new(format_size(entry.size_bytes)),
            Cell::new(last_used),
            Cell::new(entry.usage_count),
        ]);
    }
    println!("{table}");
    println!();
    println!("  {} {}", "Total:".bold(), format_size(service.total_size()));
    println!();
    Ok(())
}

fn show_info(service: &CacheService, cache: &str, json_output: bool) -> Result<()> {
    let entry = resolve(service, cache)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Cache: {}", entry.id).bold().cyan());
    println!();
    println!("  {}      {}", "Path:".bold(), entry.storage_path.display());
    if let Some(source) = &entry.source_document_path {
        println!("  {}    {}", "Source:".bold(), source.display());
    }
    println!("  {}     {}", "Model:".bold(), entry.owning_model_id);
    println!("  {}    {}", "Tokens:".bold(), entry.token_count);
    println!("  {}   {}", "Context:".bold(), entry.context_window_size);
    println!("  {}      {}", "Size:".bold(), format_size(entry.size_bytes));
    println!("  {}   {}", "Created:".bold(), entry.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(last_used) = entry.last_used_at {
        println!("  {} {}", "Last used:".bold(), last_used.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  {}      {}", "Uses:".bold(), entry.usage_count);
    if entry.is_master {
        println!("  {}", "Master cache".yellow());
    }
    println!();
    Ok(())
}

async fn purge(service: &CacheService, cache: &str) -> Result<()> {
    let entry = resolve(service, cache)?;
    let outcome = service
        .purge(&entry.storage_path)
        .await
        .with_context(|| format!("Failed to purge {}", entry.id))?;

    match outcome {
        PurgeOutcome::Deleted => {
            println!("{} {}", "✓ Purged".green(), entry.id.cyan());
        }
        PurgeOutcome::AlreadyAbsent => {
            println!("{} {} (blob was already gone)", "✓ Untracked".green(), entry.id.cyan());
        }
    }
    Ok(())
}

async fn purge_all(service: &CacheService, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to purge every cache without --yes");
    }

    let report = service.purge_all().await;
    println!(
        "{} {} deleted, {} already absent",
        "✓".green(),
        report.deleted.len(),
        report.already_absent.len()
    );
    for (path, reason) in &report.failed {
        eprintln!("{} {}: {reason}", "failed:".red().bold(), path.display());
    }
    if !report.success() {
        bail!("{} caches could not be purged", report.failed.len());
    }
    Ok(())
}

fn show_size(service: &CacheService, json_output: bool) -> Result<()> {
    let total = service.total_size();
    let count = service.list().len();

    if json_output {
        let output = json!({
            "caches": count,
            "total_bytes": total,
            "total": format_size(total),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} caches, {}", count, format_size(total).bold());
    Ok(())
}

fn check(service: &CacheService, window: Option<u64>) -> Result<()> {
    let window = match window {
        Some(window) => window,
        None => service
            .active_model()
            .map(|model| u64::from(model.descriptor.context_window))
            .context("No model selected. Pass --window or --model")?,
    };

    let incompatible = service.compatibility_check(window);
    if incompatible.is_empty() {
        println!("{} every cache fits a {window}-token context", "✓".green());
        return Ok(());
    }

    println!("{}", format!("{} caches exceed a {window}-token context:", incompatible.len()).yellow());
    for path in &incompatible {
        println!("  {}", path.display());
    }
    Ok(())
}

fn master(service: &CacheService, cache: Option<&str>) -> Result<()> {
    if let Some(cache) = cache {
        let entry = resolve(service, cache)?;
        service.set_master(&entry.storage_path)?;
        println!("{} {} is now the master cache", "✓".green(), entry.id.cyan());
        return Ok(());
    }

    match service.master() {
        Some(entry) => println!("{} ({})", entry.id.cyan(), entry.storage_path.display()),
        None => println!("{}", "No master cache set.".yellow()),
    }
    Ok(())
}

async fn scan(service: &CacheService) -> Result<()> {
    let report = service.scan().await?;
    println!(
        "{} {} added, {} removed, {} refreshed",
        "✓ Scan complete:".green(),
        report.added.len(),
        report.removed.len(),
        report.refreshed
    );
    for path in &report.added {
        println!("  {} {}", "+".green(), path.display());
    }
    for path in &report.removed {
        println!("  {} {}", "-".red(), path.display());
    }
    Ok(())
}
