//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use boatyard_billing::{
    BillingService, BillingStore, MemoryBillingStore, PgBillingStore, SandboxProcessor,
    SubscriptionCatalog,
};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: Option<PgPool>, config: Config) -> Self {
        let store: Arc<dyn BillingStore> = match pool {
            Some(pool) => {
                tracing::info!("Billing store: Postgres");
                Arc::new(PgBillingStore::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set; billing store is in-memory and volatile");
                Arc::new(MemoryBillingStore::new())
            }
        };

        let processor = Arc::new(SandboxProcessor::new(config.webhook_secret.clone()));
        let catalog = Arc::new(SubscriptionCatalog::standard());
        let billing = Arc::new(BillingService::new(processor, store, catalog));

        Self { config, billing }
    }
}
