//! Estimate command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use kvchat_core::{CacheService, ContextFit};
use std::path::Path;

/// Execute the estimate command.
pub async fn execute(service: &CacheService, document: &Path, json_output: bool) -> Result<()> {
    let estimate = service
        .estimate_document(document)
        .await
        .with_context(|| format!("Failed to estimate {}", document.display()))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    }

    let fit = match estimate.fit.fit {
        ContextFit::Fits => estimate.fit.fit.to_string().green(),
        ContextFit::Tight => estimate.fit.fit.to_string().yellow(),
        ContextFit::Over | ContextFit::TooLarge => estimate.fit.fit.to_string().red(),
    };
    let method = if estimate.estimate.exact { "exact" } else { "estimated" };

    println!();
    println!("  {}  {}", "Document:".bold(), estimate.document_id.cyan());
    println!("  {}    {} ({method})", "Tokens:".bold(), estimate.estimate.tokens);
    println!(
        "  {}   {:.1}% of {} tokens, {fit}",
        "Context:".bold(),
        estimate.fit.percent,
        estimate.context_window
    );
    println!();
    Ok(())
}
