use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lightpaird::api;
use lightpaird::config::Config;
use lightpaird::config::LoggingConfig;
use lightpaird::engine::Engine;
use lightpaird::format_diagnostics;
use lightpaird::pairing::PairingRegistry;
use lightpaird::pairing::device::DeviceDirectory;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// How long startup waits, in total, for the devices of configured pairings
/// to be discovered before creating them anyway.
const DISCOVERY_WAIT: Duration = Duration::from_secs(10);

/// How long integrations get to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(version, about = "Pairs physical switches with smart lights")]
struct Args {
    /// Config files, merged in order. Later files may not redefine fields
    /// set by earlier ones.
    #[arg(short, long = "config", default_value = "lightpaird.toml")]
    configs: Vec<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(logging.level).into())
        .from_env_lossy();

    let mut overrides: Vec<_> = logging.overrides.iter().collect();
    overrides.sort();
    for (target, level) in overrides {
        match format!("{}={}", target, LevelFilter::from(*level)).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log override for '{}': {}", target, e),
        }
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, diagnostics) = Config::from_files(&args.configs)?;

    init_tracing(&config.logging);

    if !diagnostics.is_empty() {
        tracing::warn!("Config warnings:\n{}", format_diagnostics(&diagnostics));
    }
    tracing::info!(
        "lightpaird {} starting with {} pairing(s)",
        env!("CARGO_PKG_VERSION"),
        config.pairings.len()
    );

    let mut engine = Engine::new();
    engine.register_integrations_from_config(&config);
    let engine = Arc::new(engine);

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                tracing::error!("Engine stopped with error: {}", e);
            }
        })
    };

    let registry = Arc::new(PairingRegistry::new(
        engine.clone(),
        config.reachability.to_wait_policy(),
    ));

    let devices = config.pairing_devices();
    if !devices.is_empty() && !engine.wait_for_devices(&devices, DISCOVERY_WAIT).await {
        let missing: Vec<String> = devices
            .iter()
            .filter(|device| !engine.contains(device))
            .map(ToString::to_string)
            .collect();
        tracing::warn!(
            "devices not discovered within {:?}: {}",
            DISCOVERY_WAIT,
            missing.join(", ")
        );
    }

    for (id, form) in &config.pairings {
        match registry.create(id.clone(), form).await {
            Ok(entity) => tracing::info!(pairing = %id, "pairing '{}' ready", entity.name()),
            Err(e) => tracing::error!(pairing = %id, "failed to create pairing: {}", e),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let router = api::create_router(registry.clone());
    let api_task = tokio::spawn(api::serve(
        config.api.listen,
        config.api.port,
        router,
        shutdown_rx,
    ));

    tracing::info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    shutdown_tx.send(()).ok();
    registry.shutdown().await;
    engine.shutdown(SHUTDOWN_GRACE).await;
    engine_task.abort();

    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("HTTP API server failed: {}", e),
        Err(e) => tracing::error!("HTTP API task panicked: {}", e),
    }

    tracing::info!("lightpaird shutdown complete");

    Ok(())
}
