//! Event stream renderer for core events.
//!
//! Subscribe before starting an operation, spawn the renderer, and stop it
//! once the operation returns:
//!
//! ```rust,ignore
//! let renderer = event_renderer::spawn(service.subscribe(), RenderOptions::default());
//! let outcome = service.ask(&message, options).await;
//! renderer.finish().await;
//! ```
//!
//! Streamed response text goes to stdout; everything else goes to stderr so
//! JSON output stays parseable.

use colored::Colorize;
use kvchat_core::{CacheStatus, CoreEvent};
use std::io::Write;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What to render.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Print response chunks as they arrive.
    pub stream_responses: bool,
    /// Print ingestion progress and status changes.
    pub progress: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { stream_responses: true, progress: true }
    }
}

/// Running renderer.
pub struct Renderer {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Renderer {
    /// Renders whatever is still queued, then stops.
    pub async fn finish(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Spawns a renderer for `rx`.
pub fn spawn(mut rx: broadcast::Receiver<CoreEvent>, options: RenderOptions) -> Renderer {
    let stop = CancellationToken::new();
    let token = stop.clone();
    let task = tokio::spawn(async move {
        let mut state = RenderState::default();
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => state.render(&event, options),
                    Err(RecvError::Lagged(skipped)) => {
                        eprintln!("{}", format!("({skipped} events skipped)").dimmed());
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
        loop {
            match rx.try_recv() {
                Ok(event) => state.render(&event, options),
                Err(TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        state.end_progress_line();
    });
    Renderer { stop, task }
}

#[derive(Default)]
struct RenderState {
    progress_open: bool,
    streaming: bool,
}

impl RenderState {
    fn end_progress_line(&mut self) {
        if self.progress_open {
            eprintln!();
            self.progress_open = false;
        }
    }

    fn render(&mut self, event: &CoreEvent, options: RenderOptions) {
        match event {
            CoreEvent::IngestionProgress { document_id, percent } if options.progress => {
                eprint!("\r  {} {document_id}: {percent:>3}%", "Ingesting".cyan());
                let _ = std::io::stderr().flush();
                self.progress_open = true;
                if *percent >= 100 {
                    self.end_progress_line();
                }
            }
            CoreEvent::TokenEstimationComplete { tokens, fits_context, .. } if options.progress => {
                self.end_progress_line();
                let fit = if *fits_context { "fits".green() } else { "does not fit".red() };
                eprintln!("  {} ~{tokens} tokens, {fit}", "Estimated".dimmed());
            }
            CoreEvent::WarmUpStarted { cache_path } if options.progress => {
                eprintln!("  {} {}", "Warming".cyan(), cache_path.display());
            }
            CoreEvent::WarmedUp { load_time_ms, token_count, .. } if options.progress => {
                eprintln!("  {} {token_count} tokens in {load_time_ms} ms", "Warmed".green());
            }
            CoreEvent::CacheStatusChanged { status } if options.progress => {
                let label = match status {
                    CacheStatus::Warmed | CacheStatus::UsingTempCache => status.to_string().green(),
                    CacheStatus::Fallback => status.to_string().yellow(),
                    CacheStatus::Error => status.to_string().red(),
                    CacheStatus::Idle | CacheStatus::Warming => status.to_string().dimmed(),
                };
                eprintln!("  {} {label}", "Cache:".dimmed());
            }
            CoreEvent::ResponseChunk { text } if options.stream_responses => {
                print!("{text}");
                let _ = std::io::stdout().flush();
                self.streaming = true;
            }
            CoreEvent::ResponseComplete { .. } if self.streaming => {
                println!();
                self.streaming = false;
            }
            CoreEvent::Warning { message } => {
                self.end_progress_line();
                eprintln!("{} {message}", "warning:".yellow().bold());
            }
            CoreEvent::Error { message } => {
                self.end_progress_line();
                eprintln!("{} {message}", "error:".red().bold());
            }
            _ => {}
        }
    }
}
