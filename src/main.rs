use polyroute::backend::{Controller, ControllerOptions};
use polyroute::engine::SimulatorEngine;
use polyroute::settings::Settings;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt,
    prelude::*,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("polyroute starting up!");

    let path: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "polyroute.json".into())
        .into();
    let mut settings = match Settings::load(&path) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(error = %e, "could not load settings, using defaults");
            Settings::default()
        }
    };

    let engine = SimulatorEngine::new(settings.engine_config());

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "engine event"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    if settings.auto_start {
        let port = engine.start().await?;
        info!(port, protocol = %settings.protocol, "simulator listening");
    } else {
        info!("auto start disabled, waiting for ctrl-c");
    }

    // optionally mirror a remote router as well
    let mut controller = None;
    if !settings.controller_host.is_empty() {
        let mut opts = ControllerOptions::new(
            settings.controller_host.clone(),
            settings.controller_port,
        );
        opts.auto_reconnect = settings.auto_reconnect;
        opts.inputs = settings.inputs;
        opts.outputs = settings.outputs;
        opts.levels = settings.levels;
        let candidate = Controller::new(settings.protocol, opts);
        match candidate.connect().await {
            Ok(()) => {
                info!(
                    host = %settings.controller_host,
                    port = settings.controller_port,
                    "controller connected"
                );
                settings.remember_router(
                    settings.controller_host.clone(),
                    settings.controller_port,
                    settings.protocol,
                );
                controller = Some(candidate);
            }
            Err(e) => warn!(error = %e, "controller connection failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(controller) = controller {
        controller.disconnect().await;
    }
    engine.stop().await;
    settings.save(&path)?;
    Ok(())
}
