mod backoff;
mod cloud;
mod config;
mod credentials;
mod health;
mod ingress;
mod relay;
mod session;
mod telemetry;

use anyhow::Context;
use clap::Parser;
use cloud::CloudClient;
use credentials::CredentialStore;
use health::{HealthMonitor, Liveness};
use ingress::queue::IntakeQueue;
use ingress::Ingress;
use relay::RelayPipeline;
use session::mqtt::MqttSession;
use session::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "telemetry-relay")]
#[command(about = "Relays fleet telemetry from MQTT to the Twinzo localization API")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Missing or invalid configuration is fatal
    let config = config::Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("telemetry-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("MQTT: {:?}", config.mqtt);
    info!("Cloud: {:?}", config.cloud);
    if !config.ingress.transform.is_identity() {
        info!("Applying coordinate transform {:?}", config.ingress.transform);
    }

    let credentials = CredentialStore::from_config(&config);
    let cloud = Arc::new(
        CloudClient::new(&config.cloud, credentials.cloud_credentials())
            .context("Failed to build HTTP client")?,
    );
    let sessions = Arc::new(SessionManager::new(
        cloud.clone(),
        credentials.cloud_credentials().clone(),
        &config.cloud,
    ));

    // Authentication failures at startup are retried by the relay
    if config.cloud.dry_run {
        info!("Dry run: batches are logged instead of sent");
    } else if let Some(login) = credentials.cloud_credentials().shared_login() {
        if let Err(e) = sessions.session(login).await {
            warn!("Initial authentication failed: {}", e);
        }
    } else {
        info!("Per-device logins: sessions are opened as devices report");
    }

    let liveness = Arc::new(Liveness::default());
    let queue = Arc::new(IntakeQueue::new(
        config.ingress.queue_capacity,
        config.ingress.high_water_mark,
        config.ingress.overflow,
    ));
    let ingress = Arc::new(Ingress::new(
        &config.ingress,
        &config.mqtt.topic,
        queue.clone(),
        liveness.clone(),
    ));
    info!(
        "Decoding {:?} payloads from {}",
        ingress.schema(),
        config.mqtt.topic
    );

    let mqtt = MqttSession::new(&config.mqtt, credentials.broker_credentials());
    let pipeline = RelayPipeline::new(
        &config,
        cloud,
        sessions.clone(),
        queue.clone(),
        liveness.clone(),
    );
    let monitor = Arc::new(HealthMonitor::new(
        mqtt.state(),
        liveness,
        queue,
        ingress.stats(),
        pipeline.stats(),
        sessions,
        config.health.stale_threshold_ms,
    ));

    // Failing to bind the health endpoint is fatal
    let listener = tokio::net::TcpListener::bind(&config.health.bind)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", config.health.bind))?;
    info!("Health endpoint listening on {}", config.health.bind);

    let shutdown = CancellationToken::new();

    let server = axum::serve(listener, health::router(monitor))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Health endpoint failed: {}", e);
        }
    });
    let mqtt_task = tokio::spawn(mqtt.run(ingress, shutdown.clone()));
    let relay_task = tokio::spawn(pipeline.run(shutdown.clone()));

    info!("Relay running. Press Ctrl+C to stop.");
    wait_for_signal().await?;
    info!("Shutting down...");
    shutdown.cancel();

    // The pipeline bounds its own in-flight work by the shutdown deadline
    for (name, task) in [
        ("mqtt", mqtt_task),
        ("relay", relay_task),
        ("health", server_task),
    ] {
        if let Err(e) = task.await {
            error!("{} task panicked: {}", name, e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")
    }
}
