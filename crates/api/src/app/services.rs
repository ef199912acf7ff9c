use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use procura_infra::{
    AppConfig, InMemoryPurchaseStore, PostgresPurchaseStore, PurchaseService, PurchaseStore,
    ServiceConfig,
};

/// Pick the store from configuration: Postgres when a database URL is set,
/// in-memory otherwise.
pub async fn build_service(config: &AppConfig) -> anyhow::Result<PurchaseService> {
    let store: Arc<dyn PurchaseStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresPurchaseStore::new(pool).with_max_payload_bytes(config.max_batch_bytes);
            store
                .ensure_schema()
                .await
                .context("failed to prepare the purchases schema")?;
            tracing::info!("using Postgres purchase store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory purchase store");
            Arc::new(InMemoryPurchaseStore::new().with_max_payload_bytes(config.max_batch_bytes))
        }
    };

    Ok(PurchaseService::new(store, service_config(config)))
}

pub fn service_config(config: &AppConfig) -> ServiceConfig {
    ServiceConfig {
        export_max_rows: config.export_max_rows,
        batch_chunk_size: config.batch_chunk_size,
    }
}

/// In-memory service with default limits (tests, local experiments).
pub fn in_memory_service() -> PurchaseService {
    PurchaseService::new(Arc::new(InMemoryPurchaseStore::new()), ServiceConfig::default())
}
