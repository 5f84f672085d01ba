use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common_db::Store;
use sheet_bridge::config::AppConfig;
use sheet_bridge::http;
use sheet_bridge::session::SyncCoordinator;
use sheet_bridge::sheet::JsonSheetSource;
use sheet_bridge::built_info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!(
        version = built_info::PKG_VERSION,
        db = %config.db.db_path,
        sheet = %config.sheet_path,
        "Iniciando sheet-bridge"
    );

    let pool = common_db::init_db_pool(&config.db).await?;
    let store = Store::new(pool);
    let sheet = Arc::new(JsonSheetSource::new(&config.sheet_path));
    let coordinator = Arc::new(SyncCoordinator::new(store, sheet));

    let app = http::router(coordinator);

    info!("Escutando em {}", config.bind_addr);
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
