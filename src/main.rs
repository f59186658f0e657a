// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod app;
mod cli;

use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

/// Exit code that asks the supervisor to respawn the node.
const EXIT_RESTART: i32 = 75;
/// Crash-loop circuit breaker: give up after this many rapid restarts…
const MAX_RAPID_RESTARTS: usize = 5;
/// …within this window.
const RESTART_WINDOW: Duration = Duration::from_secs(60);

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Some(Commands::ShowConfig) => {
            return match tinyclaw_config::load(cli.config.as_deref()) {
                Ok(config) => {
                    println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("loading config: {e:#}");
                    ExitCode::FAILURE
                }
            };
        }
        Some(Commands::Run) => return run_node(&cli),
        Some(Commands::Start) | None => {}
    }

    supervise(&cli)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Supervisor loop: respawn the node whenever it exits with [`EXIT_RESTART`],
/// with a circuit breaker against crash loops.
fn supervise(cli: &Cli) -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            error!("cannot locate own executable: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut restarts: Vec<Instant> = Vec::new();
    loop {
        let mut cmd = std::process::Command::new(&exe);
        cmd.arg("run");
        if let Some(config) = &cli.config {
            cmd.arg("--config").arg(config);
        }
        if cli.verbose {
            cmd.arg("--verbose");
        }

        let status = match cmd.status() {
            Ok(s) => s,
            Err(e) => {
                error!("spawning node: {e}");
                return ExitCode::FAILURE;
            }
        };

        match status.code() {
            Some(code) if code == EXIT_RESTART => {
                let now = Instant::now();
                restarts.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
                restarts.push(now);
                if restarts.len() > MAX_RAPID_RESTARTS {
                    error!(
                        "circuit breaker: {} restarts within {:?}, giving up",
                        restarts.len(),
                        RESTART_WINDOW
                    );
                    return ExitCode::FAILURE;
                }
                info!("node requested restart (exit {EXIT_RESTART}), respawning");
            }
            Some(0) => return ExitCode::SUCCESS,
            Some(code) => {
                warn!("node exited with code {code}");
                return ExitCode::from(code.clamp(0, 255) as u8);
            }
            None => {
                warn!("node terminated by signal");
                return ExitCode::FAILURE;
            }
        }
    }
}

fn run_node(cli: &Cli) -> ExitCode {
    let config = match tinyclaw_config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("loading config: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("starting async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(restart) if restart => ExitCode::from(EXIT_RESTART as u8),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run until shutdown. Returns `Ok(true)` when a restart was requested
/// (SIGHUP), `Ok(false)` on a clean stop (SIGINT/SIGTERM).
async fn serve(config: tinyclaw_config::Config) -> anyhow::Result<bool> {
    let mut app = app::build(&config).await?;
    app.scheduler.start()?;
    info!(
        "bootstrap secret (one-time, 1h): {}",
        app.state.auth.bootstrap_secret_for_display()
    );

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let server_state = app.state.clone();
    let server = tokio::spawn(async move { tinyclaw_node::run(server_state, &bind, port).await });

    let restart = wait_for_shutdown().await;

    // Orderly teardown: no new turns, cancel background work, drain jobs.
    app.queue.stop();
    if let Ok(cancelled) = app.runner.cancel_all() {
        if cancelled > 0 {
            info!(count = cancelled, "cancelled in-flight background tasks");
        }
    }
    app.scheduler.stop().await;
    server.abort();

    Ok(restart)
}

/// Block until SIGINT/SIGTERM (clean stop) or SIGHUP (restart request).
#[cfg(unix)]
async fn wait_for_shutdown() -> bool {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = signal(SignalKind::hangup()).expect("installing SIGHUP handler");
    let mut terminate = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        _ = terminate.recv() => false,
        _ = hangup.recv() => true,
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> bool {
    let _ = tokio::signal::ctrl_c().await;
    false
}
