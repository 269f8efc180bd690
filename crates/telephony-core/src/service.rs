//! Wiring of all telephony components over one store

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use dialtone_infra_common::RetryPolicy;

use crate::cache::CatalogCache;
use crate::carrier::{CarrierClient, HttpCarrierClient};
use crate::catalog::CatalogService;
use crate::config::TelephonyConfig;
use crate::dispatch::{HttpSinkFactory, NotificationDispatcher, SinkFactory};
use crate::error::Result;
use crate::history::CallHistoryService;
use crate::ingest::{default_ingest_retry, CallEventIngestor};
use crate::ledger::Ledger;
use crate::lifecycle::NumberLifecycleManager;
use crate::store::SqliteStore;

/// Shared handles to every component
#[derive(Clone)]
pub struct TelephonyService {
    pub config: Arc<TelephonyConfig>,
    pub store: Arc<SqliteStore>,
    pub cache: Arc<CatalogCache>,
    pub ledger: Arc<Ledger>,
    pub lifecycle: Arc<NumberLifecycleManager>,
    pub ingestor: Arc<CallEventIngestor>,
    pub history: Arc<CallHistoryService>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub catalog: Arc<CatalogService>,
}

impl TelephonyService {
    /// Open the configured database, apply the schema and use HTTP clients
    /// for the carrier and notification sinks
    pub async fn from_config(config: TelephonyConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SqliteStore::new(&config.database_url).await?);
        let carrier: Arc<dyn CarrierClient> = Arc::new(HttpCarrierClient::new(&config.carrier)?);
        let sinks: Arc<dyn SinkFactory> = Arc::new(HttpSinkFactory::new(config.dispatch.clone())?);
        Ok(Self::new(config, store, carrier, sinks, default_ingest_retry()))
    }

    /// Build on an already migrated store with the given collaborators
    pub fn new(
        config: TelephonyConfig,
        store: Arc<SqliteStore>,
        carrier: Arc<dyn CarrierClient>,
        sinks: Arc<dyn SinkFactory>,
        ingest_retry: RetryPolicy,
    ) -> Self {
        let cache = Arc::new(CatalogCache::new(store.clone(), store.clone()));
        let ledger = Arc::new(Ledger::new(store.clone(), config.billing.clone()));
        let lifecycle = Arc::new(NumberLifecycleManager::new(
            store.clone(),
            store.clone(),
            carrier,
            cache.clone(),
            config.carrier.timeout(),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            sinks,
            config.dispatch.retry_policy(),
        ));
        let ingestor = Arc::new(CallEventIngestor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ledger.clone(),
            cache.clone(),
            dispatcher.clone(),
            ingest_retry,
        ));
        let history = Arc::new(CallHistoryService::new(
            store.clone(),
            store.clone(),
            config.history.clone(),
        ));
        let catalog = Arc::new(CatalogService::new(store.clone(), cache.clone()));

        info!(
            rate_per_minute = config.billing.rate_per_minute,
            free_minutes = config.billing.free_minutes,
            allow_overage = config.billing.allow_overage,
            "Telephony service ready"
        );
        Self {
            config: Arc::new(config),
            store,
            cache,
            ledger,
            lifecycle,
            ingestor,
            history,
            dispatcher,
            catalog,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.config.reconcile.interval_secs.max(1))
    }
}
