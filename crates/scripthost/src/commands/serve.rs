//! `serve` command: run the supervisor behind the configured chat gateways.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use scripthost::config::Config;
use scripthost::gateway::{CommandAdapter, GatewayManager, GatewayMessageHandler};
use scripthost::process::{Supervisor, reaper};
use scripthost::workspace::Workspace;

pub async fn run(config_path: &str, uploads_dir_override: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let config_path_ref = Path::new(config_path);
    let mut dirs = config.resolve_dirs(config_path_ref);
    if let Some(dir) = uploads_dir_override {
        dirs.uploads_dir = dir.to_path_buf();
    }

    create_dir(&dirs.uploads_dir).await?;
    create_dir(&dirs.logs_dir).await?;
    info!(
        uploads_dir = %dirs.uploads_dir.display(),
        logs_dir = %dirs.logs_dir.display(),
        "Resolved directories"
    );

    let supervisor = Arc::new(Supervisor::new(
        Workspace::new(dirs.uploads_dir).with_max_extracted_bytes(config.bot.max_extracted_bytes),
        dirs.logs_dir,
        config.interpreters.clone(),
    ));
    let reaper_handle = reaper::spawn_reaper(
        Arc::clone(&supervisor),
        Duration::from_secs(config.supervisor.reap_interval_seconds),
    );
    if reaper_handle.is_none() {
        info!("Reaper disabled; exited scripts stay listed until stopped");
    }

    let adapter = Arc::new(CommandAdapter::new(
        Arc::clone(&supervisor),
        config.bot.clone(),
    ));
    let gateways = GatewayManager::new(Duration::from_secs(config.bot.handler_timeout_seconds));
    gateways
        .set_handler(Arc::new(GatewayMessageHandler::new(adapter)))
        .await;

    // Start Telegram gateway if configured
    #[cfg(feature = "gateway-telegram")]
    if let Some(ref telegram_config) = config.gateways.telegram
        && telegram_config.enabled
    {
        start_telegram_gateway(&gateways, telegram_config.clone(), config.bot.max_upload_bytes)
            .await;
    }

    if gateways.list().await.is_empty() {
        warn!("No gateways configured; scripts can only be managed once a gateway is enabled");
    }

    shutdown_signal().await;

    gateways.shutdown().await;
    if let Some(handle) = reaper_handle {
        handle.abort();
    }
    supervisor.shutdown();

    info!("Server stopped");
    Ok(())
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// Start the Telegram gateway in a background task.
#[cfg(feature = "gateway-telegram")]
async fn start_telegram_gateway(
    gateways: &GatewayManager,
    config: scripthost::config::TelegramGatewayConfig,
    max_upload_bytes: u64,
) {
    use scripthost::gateway::{TelegramConfig, TelegramGateway, capabilities};

    let (cmd_rx, evt_tx) = gateways
        .register(
            "telegram",
            vec![
                capabilities::EDIT.to_string(),
                capabilities::INLINE_KEYBOARD.to_string(),
                capabilities::REPLY_KEYBOARD.to_string(),
                capabilities::DOCUMENTS.to_string(),
            ],
        )
        .await;

    let limit = u32::try_from(max_upload_bytes).unwrap_or(u32::MAX);
    let gateway_config = TelegramConfig::new(&config.bot_token).with_max_download_bytes(limit);
    let gateway = TelegramGateway::new(gateway_config);

    tokio::spawn(async move {
        gateway.start(evt_tx, cmd_rx).await;
    });

    info!("Telegram gateway started");
}
