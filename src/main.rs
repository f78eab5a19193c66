use std::io::IsTerminal;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use eframe::egui;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod activity;
mod ble;
mod breathing;
mod broadcast;
mod config;
mod display;
mod error;
mod listener;
mod measurement;
mod player;
mod scan;
mod session;
mod signal;
mod simulator;
mod sources;
mod stream;
mod widget;

use config::{Cli, Command, DisplayConfig};
use display::HrDisplayApp;
use listener::HrListener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Listen(config) => {
            let cancel = shutdown_token(seconds(config.timeout));
            let mut listener = HrListener::new(config, cancel).await?;
            listener.run().await
        }
        Command::Broadcast(config) => {
            let cancel = shutdown_token(seconds(config.timeout));
            broadcast::run(config, cancel).await
        }
        Command::Scan(config) => scan::run(config).await,
        Command::Simulate(config) => {
            let cancel = shutdown_token(None);
            simulator::transmit_fake_hr_data(config, cancel).await
        }
        Command::Display(config) => run_display(config),
    }
}

fn seconds(value: f64) -> Option<Duration> {
    (value > 0.0).then(|| Duration::from_secs_f64(value))
}

/// Cancelled on Ctrl-C, on SIGTERM, or once `timeout` has elapsed.
fn shutdown_token(timeout: Option<Duration>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let timed_out = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
            _ = terminated() => info!("Terminated, stopping"),
            _ = timed_out => info!("Timeout reached, stopping"),
        }
        token.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminated() {
    std::future::pending().await
}

fn run_display(config: DisplayConfig) -> Result<()> {
    let runtime = Handle::current();
    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Smart LED Heart Rate")
            .with_inner_size([980.0, 560.0])
            .with_min_inner_size([900.0, 520.0]),
        ..Default::default()
    };

    eframe::run_native(
        "hrlight",
        native_options,
        Box::new(|cc| Ok(Box::new(HrDisplayApp::new(cc, config, runtime)))),
    )
    .map_err(|e| anyhow::anyhow!("display failed: {e}"))
}
