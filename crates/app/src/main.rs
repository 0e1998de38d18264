mod problem;
mod router;
mod sync;
mod tap;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use tracing::info;

use caf_sync_storage::Database;
use caf_sync_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let tap_hub = tap::TapHub::new();
    if config.environment.is_development() {
        tap_hub.spawn_mock_publisher();
    }

    let webhook_secret: Arc<[u8]> = Arc::from(config.webhook_secret.clone().into_boxed_slice());
    let state = router::AppState::new(metrics, tap_hub.clone(), database, webhook_secret);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
