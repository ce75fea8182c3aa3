//! # Balance Server
//!
//! HTTP front end for batched Solana balance lookups.
//!
//! ## Usage
//!
//! ```bash
//! RPC_URL=https://api.mainnet-beta.solana.com API_KEYS=dev-key \
//!     cargo run --bin balance_server -- --port 8080
//! ```
//!
//! Stops gracefully on Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use solana_balance_gateway::{
    api::{create_router, AppState},
    api_keys::{ApiKeyStore, PgApiKeyStore, StaticApiKeyStore},
    balance_service::BalanceService,
    logging, metrics,
    panic_notifier::{install_panic_hook, PanicNotifier},
    settings::Settings,
    upstream::SolanaRpcClient,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "balance_server", about = "Batched Solana balance lookups over HTTP")]
struct Args {
    /// Configuration file (TOML). Missing files are ignored.
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Overrides `server.port` and `PORT`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // 1. Settings and logging
    let mut settings = Settings::load(&args.config).context("failed to load settings")?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    logging::init_logging(&settings.log);
    info!("Settings loaded (rpc={})", settings.rpc.url);

    // 2. Metrics
    if settings.metrics.enabled {
        metrics::install_exporter(settings.metrics.port)?;
    }

    // 3. Upstream + service
    let source = Arc::new(SolanaRpcClient::new(
        &settings.rpc.url,
        settings.call_timeout(),
        settings.rpc.qps_limit,
    )?);
    let service = Arc::new(BalanceService::from_settings(&settings, source)?);

    // 4. API keys
    let keys: Arc<dyn ApiKeyStore> = match &settings.auth.database_url {
        Some(url) => Arc::new(PgApiKeyStore::connect(url, &settings.auth.table).await?),
        None => {
            let store = StaticApiKeyStore::new(settings.auth.api_keys.iter().cloned());
            if store.is_empty() {
                warn!("No API keys configured; every request will be rejected");
            }
            Arc::new(store)
        }
    };

    // 5. Router
    let mut state = AppState::new(service, keys);
    if let Some(url) = &settings.notify.webhook_url {
        install_panic_hook();
        state = state.with_notifier(PanicNotifier::new(url.clone())?);
        info!("Panic reports go to the configured webhook");
    }
    let app = create_router(state, &settings);

    // 6. Serve
    let addr: SocketAddr = format!("{}:{}", settings.server.bind, settings.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", settings.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
