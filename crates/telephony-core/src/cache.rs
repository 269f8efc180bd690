//! Read-mostly caches for tenant catalogs and line routing
//!
//! Entries are loaded through from the store and dropped only by explicit,
//! named [`Invalidation`] events. Balances are never cached here.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::store::{CatalogStore, NumberStore};
use crate::types::{NotificationChannel, NumberStatus, RoutingConfig, TenantId, UserFunction};

/// Configuration change that makes cached data stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// A channel or function of the tenant was created or changed
    Catalog { tenant_id: TenantId },
    /// Status or routing of one line changed
    Routing { tenant_id: TenantId, number: String },
}

/// Channels and functions of one tenant
#[derive(Debug, Clone, Default)]
pub struct TenantCatalog {
    pub channels: Vec<NotificationChannel>,
    pub functions: Vec<UserFunction>,
}

impl TenantCatalog {
    /// Resolve routing ids to catalog entries, dropping ids that are gone
    pub fn resolve(&self, routing: &RoutingConfig) -> (Vec<NotificationChannel>, Vec<UserFunction>) {
        let channels = routing
            .channel_ids
            .iter()
            .filter_map(|id| self.channels.iter().find(|c| &c.id == id).cloned())
            .collect();
        let functions = routing
            .function_ids
            .iter()
            .filter_map(|id| self.functions.iter().find(|f| &f.id == id).cloned())
            .collect();
        (channels, functions)
    }
}

/// Routing snapshot of a line as seen by the ingestion path
#[derive(Debug, Clone, PartialEq)]
pub struct LineRouting {
    pub status: NumberStatus,
    pub routing: Option<RoutingConfig>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

pub struct CatalogCache {
    catalogs: Arc<dyn CatalogStore>,
    numbers: Arc<dyn NumberStore>,
    tenants: DashMap<TenantId, Arc<TenantCatalog>>,
    lines: DashMap<(TenantId, String), Arc<LineRouting>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CatalogCache {
    pub fn new(catalogs: Arc<dyn CatalogStore>, numbers: Arc<dyn NumberStore>) -> Self {
        Self {
            catalogs,
            numbers,
            tenants: DashMap::new(),
            lines: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub async fn catalog(&self, tenant_id: TenantId) -> Result<Arc<TenantCatalog>> {
        if let Some(cached) = self.tenants.get(&tenant_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let catalog = Arc::new(TenantCatalog {
            channels: self.catalogs.list_channels(tenant_id).await?,
            functions: self.catalogs.list_functions(tenant_id).await?,
        });
        self.tenants.insert(tenant_id, catalog.clone());
        Ok(catalog)
    }

    /// Routing of `number` if it is currently held by `tenant_id`
    pub async fn line(&self, tenant_id: TenantId, number: &str) -> Result<Option<Arc<LineRouting>>> {
        let key = (tenant_id, number.to_string());
        if let Some(cached) = self.lines.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(cached.clone()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let Some(row) = self.numbers.get_number(number).await? else {
            return Ok(None);
        };
        if row.tenant_id != Some(tenant_id) {
            return Ok(None);
        }
        let line = Arc::new(LineRouting {
            status: row.status,
            routing: row.routing,
        });
        self.lines.insert(key, line.clone());
        Ok(Some(line))
    }

    pub fn invalidate(&self, event: Invalidation) {
        debug!(?event, "Cache invalidation");
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        match event {
            Invalidation::Catalog { tenant_id } => {
                self.tenants.remove(&tenant_id);
            }
            Invalidation::Routing { tenant_id, number } => {
                self.lines.remove(&(tenant_id, number));
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
