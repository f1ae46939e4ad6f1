//! pushgate - Matrix Push Gateway
//!
//! Accepts batched notification pokes from a home server on
//! `POST /_matrix/push/v1/notify` and fans them out to provider push
//! services (APNs, FCM, Web Push), reporting dead registrations back to
//! the caller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod crypto;
mod error;
mod metrics;
mod push;
mod server;
mod shutdown;

#[cfg(test)]
mod test_scenarios;

use config::{GatewayConfig, PushkinConfig};
use metrics::Metrics;
use push::http::ClientOptions;
use push::{
    ApnsPushkin, FcmPushkin, NotificationDispatcher, Pushkin, PushkinRegistry, WebPushPushkin,
};
use server::GatewayServer;
use shutdown::Shutdown;

/// pushgate - Matrix Push Gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/gateway.yaml", global = true)]
    config: String,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Validate the configuration and construct every pushkin, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    // Initialize logging
    init_logging(&config.log)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config,
        "Starting push gateway"
    );

    config.validate().context("Invalid configuration")?;

    let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);
    let client_options = ClientOptions::new(config.proxy.clone(), config.ca_file.clone());

    // Construct every configured pushkin; any failure aborts startup.
    let registry = build_registry(&config, &client_options, metrics.clone()).await?;

    if let Some(Command::CheckConfig) = args.command {
        println!(
            "Configuration OK: {} pushkin(s) configured",
            registry.len()
        );
        return Ok(());
    }

    let dispatcher = Arc::new(NotificationDispatcher::new(
        registry,
        metrics.clone(),
        Duration::from_secs(config.notify_timeout_secs),
    ));

    let server_metrics = config.metrics.enabled.then(|| metrics.as_ref().clone());
    let server = GatewayServer::new(config.http.clone(), dispatcher.clone(), server_metrics);

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.watch();
    let mut server_handle = tokio::spawn(async move { server.run(server_shutdown).await });

    info!("Push gateway running");

    tokio::select! {
        result = &mut server_handle => {
            result.context("API server task panicked")?
                .context("API server failed")?;
            anyhow::bail!("API server exited unexpectedly");
        }
        _ = shutdown.on_signal() => {}
    }

    info!("Initiating graceful shutdown");

    // Open requests get a bounded drain window, then the pushkins close.
    shutdown
        .drain(
            &dispatcher,
            server_handle,
            Duration::from_secs(config.shutdown_timeout_secs),
        )
        .await;

    info!("Push gateway stopped");
    Ok(())
}

/// Build the pushkin registry from the `apps` section.
async fn build_registry(
    config: &GatewayConfig,
    options: &ClientOptions,
    metrics: Arc<Metrics>,
) -> Result<PushkinRegistry> {
    let mut registry = PushkinRegistry::new();

    for (app_id, pushkin_config) in &config.apps {
        let pushkin = match pushkin_config {
            PushkinConfig::Apns(c) => Pushkin::Apns(
                ApnsPushkin::new(app_id.clone(), c.clone(), options, metrics.clone())
                    .await
                    .with_context(|| format!("Failed to set up APNs pushkin for '{app_id}'"))?,
            ),
            PushkinConfig::Gcm(c) => Pushkin::Gcm(
                FcmPushkin::new(app_id.clone(), c.clone(), options, metrics.clone())
                    .await
                    .with_context(|| format!("Failed to set up FCM pushkin for '{app_id}'"))?,
            ),
            PushkinConfig::Webpush(c) => Pushkin::WebPush(
                WebPushPushkin::new(app_id.clone(), c.clone(), options, metrics.clone())
                    .await
                    .with_context(|| {
                        format!("Failed to set up Web Push pushkin for '{app_id}'")
                    })?,
            ),
        };

        info!(app_id, kind = pushkin.kind(), "Pushkin initialized");
        registry.insert(app_id.clone(), pushkin);
    }

    Ok(registry)
}

/// Initialize the tracing subscriber based on configuration.
fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
        "off" => {
            // No logging
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }

    Ok(())
}
