mod console;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::{unbounded, Receiver};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use companion_core::config::CompanionConfig;
use companion_core::engine::ConversationEngine;
use companion_core::events::EngineEvent;
use companion_core::history::write_export;
use companion_core::runtime::CompanionRuntime;

use console::{parse_command, render_event, Command, HELP};

const LOG_VIEW_CHARS: usize = 3000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion=debug,companion_core=debug")),
        )
        .init();

    tracing::info!("Companion starting...");

    let config = CompanionConfig::load();
    let (event_tx, event_rx) = unbounded();

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    rt.block_on(async move {
        let runtime = CompanionRuntime::bootstrap(config, event_tx)
            .context("failed to bootstrap companion runtime")?;
        run(runtime, event_rx).await
    })
}

async fn run(runtime: CompanionRuntime, event_rx: Receiver<EngineEvent>) -> Result<()> {
    let printer = tokio::spawn(print_events(runtime.engine.clone(), event_rx));

    runtime.start().await;
    println!("{}", HELP);

    let mut pending_image: Option<PathBuf> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                println!("{}", usage);
                continue;
            }
        };

        match command {
            Command::Say(text) => {
                let engine = runtime.engine.clone();
                let image = pending_image.take();
                tokio::spawn(async move {
                    if let Err(e) = engine.send_user_message(&text, image).await {
                        tracing::error!("Message rejected: {}", e);
                    }
                });
            }
            Command::Restart => runtime.engine.restart().await,
            Command::Clear => runtime.engine.clear().await,
            Command::Export(path) => {
                match write_export(&path, &runtime.engine.export_history()) {
                    Ok(count) => println!("Exported {} messages to {}", count, path.display()),
                    Err(e) => println!("Export failed: {:#}", e),
                }
            }
            Command::Import(path) => import_file(&runtime.engine, &path).await,
            Command::Character(name) => {
                runtime.engine.select_character(&name).await;
            }
            Command::Characters => {
                let current = runtime.engine.profile().id;
                for name in runtime.engine.list_characters() {
                    let marker = if name == current { "*" } else { " " };
                    println!("{} {}", marker, name);
                }
            }
            Command::Models => {
                let active = runtime.engine.model_name();
                for model in runtime.available_models().await {
                    let marker = if model == active { "*" } else { " " };
                    println!("{} {}", marker, model);
                }
            }
            Command::Prompt(text) => {
                runtime.engine.set_manual_prompt(&text).await;
            }
            Command::Temperature(value) => {
                let mut params = runtime.engine.params();
                params.temperature = value;
                runtime.engine.set_params(params);
                println!("Temperature set to {}", value);
            }
            Command::TopP(value) => {
                let mut params = runtime.engine.params();
                params.top_p = value;
                runtime.engine.set_params(params);
                println!("Top-p set to {}", value);
            }
            Command::Format(format) => {
                let mut params = runtime.engine.params();
                params.prompt_format = format;
                runtime.engine.set_params(params);
                println!("Prompt format set to {}", format.label());
            }
            Command::Settings => {
                let params = runtime.engine.params();
                println!(
                    "Model: {}\nTemperature: {}\nTop-p: {}\nPrompt format: {}",
                    runtime.engine.model_name(),
                    params.temperature,
                    params.top_p,
                    params.prompt_format.label()
                );
            }
            Command::Image(path) => {
                if path.is_file() {
                    println!("Image attached to next message: {}", path.display());
                    pending_image = Some(path);
                } else {
                    println!("No such file: {}", path.display());
                }
            }
            Command::Proactive(enabled) => runtime.engine.set_proactive_enabled(enabled).await,
            Command::Log => match runtime.chat_log.view_tail(LOG_VIEW_CHARS) {
                Ok(text) => println!("{}", text),
                Err(e) => println!("Could not read chat log: {:#}", e),
            },
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
        }
    }

    runtime.engine.shutdown().await;
    printer.abort();
    tracing::info!("Companion stopped");
    Ok(())
}

async fn import_file(engine: &ConversationEngine, path: &Path) {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            println!("System: Could not read {}: {}", path.display(), e);
            return;
        }
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        // Skips and failures are reported by the engine as notices.
        Ok(payload) => {
            if let Err(e) = engine.import_history(&payload).await {
                tracing::debug!("Import of {} rejected: {}", path.display(), e);
            }
        }
        Err(e) => println!("System: Invalid JSON format: {}", e),
    }
}

async fn print_events(engine: Arc<ConversationEngine>, event_rx: Receiver<EngineEvent>) {
    while let Ok(event) = event_rx.recv_async().await {
        let character = engine.profile().display_name;
        if let Some(line) = render_event(&event, &character) {
            println!("{}", line);
        }
    }
}
