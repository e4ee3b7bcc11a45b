//! Agent dashboard
//!
//! Runs one agent at a time, routes its events to the terminal, and swaps in
//! the coder agent on escalation.
//!
//! # Usage
//!
//! ```bash
//! agent-dashboard --agent worker
//! AGENT_DASHBOARD_MODEL=local-14b agent-dashboard --agent ./agents/worker --log-file dashboard.log
//! ```

use std::fs::File;
use std::io::BufRead;
use std::path::Path;
use std::sync::{Arc, Mutex};

use agent_dashboard::commands::route_line;
use agent_dashboard::{Cli, DashboardConfig, DirectoryLoader, Screen};
use anyhow::{Context, Result};
use clap::Parser;
use coordination::notify::ChannelNotifier;
use coordination::session::{LoopSignal, SessionCommand, SessionController, SessionDriver};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let mut config = DashboardConfig::load(cli.config.as_deref())?;
    config.apply_cli(&cli);
    info!(
        escalation_target = %config.escalation_target.display(),
        model = config.model.as_deref().unwrap_or("default"),
        guardian = ?config.guardian,
        "Agent dashboard starting"
    );

    let (notifier, mut notifications) = ChannelNotifier::new();
    let controller = SessionController::new(
        config.session_config(),
        Arc::new(DirectoryLoader::new()),
        Arc::new(notifier.clone()),
    );
    let signals = controller.signal_sender();

    if let Some(agent) = cli.agent.as_deref() {
        let path = config.resolve_agent(agent);
        signals
            .send(LoopSignal::Command(SessionCommand::LoadAgent(path)))
            .context("session loop closed before start")?;
    }
    spawn_interrupt_handler(signals.clone());
    spawn_input_reader(signals, config, notifier)?;

    let mut screen = Screen::new(std::io::stdout());
    let mut driver = SessionDriver::new(controller);
    driver
        .run(|controller| {
            while let Ok(notification) = notifications.try_recv() {
                if let Err(e) = screen.notify(&notification) {
                    warn!(error = %e, "failed to write notification");
                }
            }
            if let Err(e) = screen.refresh(controller) {
                warn!(error = %e, "failed to render");
            }
        })
        .await;

    info!("Agent dashboard stopped");
    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Ctrl+C shuts the session down cleanly.
fn spawn_interrupt_handler(signals: UnboundedSender<LoopSignal>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signals.send(LoopSignal::Command(SessionCommand::Shutdown));
        }
    });
}

/// Read stdin lines on a dedicated thread. End of input shuts down.
fn spawn_input_reader(
    signals: UnboundedSender<LoopSignal>,
    config: DashboardConfig,
    notifier: ChannelNotifier,
) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                };
                let Some(command) = route_line(&line, &config, &notifier) else {
                    // Wake the loop so any notification is shown now.
                    if signals.send(LoopSignal::Drain).is_err() {
                        return;
                    }
                    continue;
                };
                let quit = command == SessionCommand::Shutdown;
                if signals.send(LoopSignal::Command(command)).is_err() || quit {
                    return;
                }
            }
            let _ = signals.send(LoopSignal::Command(SessionCommand::Shutdown));
        })
        .context("Failed to spawn stdin reader")?;
    Ok(())
}
