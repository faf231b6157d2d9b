//! Ask and chat command implementation.

use super::event_renderer::{self, RenderOptions};
use super::types::TurnArgs;
use anyhow::{Context, Result, anyhow, bail};
use colored::Colorize;
use kvchat_core::{CacheService, TurnOptions, TurnOutcome};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Execute the ask command.
pub async fn execute(service: &CacheService, args: TurnArgs) -> Result<()> {
    let message = args.message.join(" ");
    if message.trim().is_empty() {
        bail!("Nothing to ask. Pass a question after `ask`");
    }

    prepare(service, &args).await?;

    let render = RenderOptions { stream_responses: !args.json, progress: !args.json };
    let outcome = run_turn(service, &message, &args, render).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_footer(&outcome);
    }

    if let Some(path) = &args.history {
        service.save_history(path).with_context(|| format!("Failed to save history to {}", path.display()))?;
    }
    Ok(())
}

/// Execute the chat command.
pub async fn chat(service: &CacheService, args: TurnArgs) -> Result<()> {
    prepare(service, &args).await?;

    let model = service
        .active_model()
        .map_or_else(|| "no model".to_string(), |m| m.id().to_string());
    let cache = service
        .selected_cache()
        .or_else(|| service.master().map(|m| m.storage_path))
        .map_or_else(|| "none".to_string(), |p| p.display().to_string());

    println!();
    println!("{}", "kvchat".bold().green());
    println!("  {} {}", "Model:".bold(), model.cyan());
    println!("  {} {}", "Cache:".bold(), cache);
    println!("  {}", "Type /clear to reset the conversation, /quit to exit.".dimmed());
    println!();

    let render = RenderOptions { stream_responses: true, progress: true };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".cyan().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                service.session().clear_history();
                println!("{}", "Conversation cleared.".dimmed());
                continue;
            }
            _ => {}
        }

        match run_turn(service, line, &args, render).await {
            Ok(outcome) => print_footer(&outcome),
            Err(e) => eprintln!("{} {e:#}", "error:".red().bold()),
        }
        if let Some(path) = &args.history {
            service.save_history(path).with_context(|| format!("Failed to save history to {}", path.display()))?;
        }
    }
    Ok(())
}

async fn prepare(service: &CacheService, args: &TurnArgs) -> Result<()> {
    if service.active_model().is_none() {
        bail!("No model selected. Pass --model or set current_model_id in the config");
    }

    if let Some(path) = &args.history
        && path.exists()
    {
        let restored = service
            .load_history(path)
            .with_context(|| format!("Failed to load history from {}", path.display()))?;
        tracing::debug!(messages = restored.history.len(), "Resumed chat history");
    }

    if let Some(cache) = &args.cache {
        let entry = service.resolve(cache).ok_or_else(|| anyhow!("No tracked cache matches '{cache}'"))?;
        service.select_cache(Some(&entry.storage_path)).await?;
    }
    service.set_use_cache(!args.no_cache);

    if args.warm && !args.no_cache {
        let target = service.selected_cache().or_else(|| service.master().map(|m| m.storage_path));
        match target {
            Some(path) => {
                let renderer = event_renderer::spawn(
                    service.subscribe(),
                    RenderOptions { stream_responses: false, progress: !args.json },
                );
                let warmed = service.warm_up(&path).await;
                renderer.finish().await;
                warmed.with_context(|| format!("Failed to warm {}", path.display()))?;
            }
            None => eprintln!("{} no cache to warm", "warning:".yellow().bold()),
        }
    }
    Ok(())
}

async fn run_turn(
    service: &CacheService,
    message: &str,
    args: &TurnArgs,
    render: RenderOptions,
) -> Result<TurnOutcome> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let options = TurnOptions {
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        seed: None,
        cancel,
    };

    let renderer = event_renderer::spawn(service.subscribe(), render);
    let outcome = service.ask(message, options).await;
    renderer.finish().await;
    interrupt.abort();

    Ok(outcome?)
}

fn print_footer(outcome: &TurnOutcome) {
    let source = outcome
        .cache_path
        .as_ref()
        .map(|p| format!(" from {}", p.display()))
        .unwrap_or_default();
    eprintln!("{}", format!("[{}{source}, {} tokens]", outcome.strategy, outcome.tokens_generated).dimmed());
}
