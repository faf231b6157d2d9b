//! Models command implementation.

use super::types::ModelsCommand;
use anyhow::Result;
use colored::Colorize;
use comfy_table::{Cell, Color as ComfyColor, Table};
use kvchat_core::{CacheService, format_size};
use serde_json::json;

/// Execute the models command.
pub fn execute(service: &CacheService, command: ModelsCommand) -> Result<()> {
    match command {
        ModelsCommand::List { all, json } => list_models(service, all, json),
    }
}

fn list_models(service: &CacheService, all: bool, json_output: bool) -> Result<()> {
    let available = service.available_models();
    let active = service.active_model().map(|m| m.descriptor.id);

    if json_output {
        let mut rows: Vec<_> = available
            .iter()
            .map(|m| {
                json!({
                    "id": m.descriptor.id,
                    "name": m.name,
                    "kind": m.kind.to_string(),
                    "context_window": m.descriptor.context_window,
                    "path": m.descriptor.path,
                    "size": m.size,
                    "available": true,
                    "active": active.as_deref() == Some(m.descriptor.id.as_str()),
                })
            })
            .collect();
        if all {
            for entry in service.known_models() {
                if available.iter().any(|m| m.descriptor.id == entry.id) {
                    continue;
                }
                rows.push(json!({
                    "id": entry.id,
                    "name": entry.display_name(),
                    "kind": entry.kind.to_string(),
                    "context_window": entry.context_window,
                    "available": false,
                    "active": false,
                }));
            }
        }
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Models ({} available)", available.len()).bold().green());
    println!();

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Context", "Size", "Status"]);
    for model in &available {
        let is_active = active.as_deref() == Some(model.descriptor.id.as_str());
        table.add_row(vec![
            Cell::new(&model.descriptor.id).fg(ComfyColor::Cyan),
            Cell::new(&model.name),
            Cell::new(model.descriptor.context_window),
            Cell::new(format_size(model.size)),
            if is_active { Cell::new("active").fg(ComfyColor::Green) } else { Cell::new("ready") },
        ]);
    }
    if all {
        for entry in service.known_models() {
            if available.iter().any(|m| m.descriptor.id == entry.id) {
                continue;
            }
            table.add_row(vec![
                Cell::new(&entry.id).fg(ComfyColor::DarkGrey),
                Cell::new(entry.display_name()),
                Cell::new(entry.context_window.map_or_else(|| "-".to_string(), |w| w.to_string())),
                Cell::new("-"),
                Cell::new("not downloaded").fg(ComfyColor::Yellow),
            ]);
        }
    }
    println!("{table}");
    println!();

    if available.is_empty() {
        println!("{}", "No model weights found. Place model files in the models directory.".yellow());
    }
    Ok(())
}
