//! Server wrapper: HTTP API plus background reconciliation
//!
//! ```no_run
//! # async fn example() -> dialtone_telephony_core::Result<()> {
//! use dialtone_telephony_core::{TelephonyConfig, TelephonyServerBuilder};
//!
//! let mut server = TelephonyServerBuilder::new()
//!     .with_config(TelephonyConfig::default())
//!     .build()
//!     .await?;
//! server.start().await?;
//! // ...
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::create_router;
use crate::carrier::CarrierClient;
use crate::config::TelephonyConfig;
use crate::dispatch::SinkFactory;
use crate::error::{Result, TelephonyError};
use crate::ingest::default_ingest_retry;
use crate::lifecycle::Reconciler;
use crate::service::TelephonyService;
use crate::store::SqliteStore;

/// Runs the API listener and the reconciler over one [`TelephonyService`]
pub struct TelephonyServer {
    service: TelephonyService,
    shutdown_tx: watch::Sender<bool>,
    api_handle: Option<JoinHandle<()>>,
    reconciler_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TelephonyServer {
    pub fn new(service: TelephonyService) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            service,
            shutdown_tx,
            api_handle: None,
            reconciler_handle: None,
            local_addr: None,
        }
    }

    /// Bind the API listener and start background tasks
    pub async fn start(&mut self) -> Result<()> {
        if self.api_handle.is_some() {
            return Err(TelephonyError::invalid_transition("server already started"));
        }
        let _ = self.shutdown_tx.send(false);

        let bind = self.service.config.api_bind_address.clone();
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| TelephonyError::Config(format!("cannot bind {}: {}", bind, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TelephonyError::internal(format!("listener address: {}", e)))?;
        self.local_addr = Some(local_addr);

        let router = create_router(self.service.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.api_handle = Some(tokio::spawn(async move {
            let shutdown = async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "API server error");
            }
        }));
        info!(address = %local_addr, "Telephony API listening");

        if self.service.config.reconcile.enabled {
            self.reconciler_handle = Some(Reconciler::spawn(
                self.service.lifecycle.clone(),
                self.service.reconcile_interval(),
                self.shutdown_tx.subscribe(),
            ));
        }
        Ok(())
    }

    /// Stop accepting requests and wait for in-flight ones and the reconciler
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping telephony server");
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.reconciler_handle.take() {
            let _ = handle.await;
        }
        self.local_addr = None;
        info!("Telephony server stopped");
        Ok(())
    }

    /// Run until Ctrl-C, then shut down gracefully
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| TelephonyError::internal(format!("signal handler: {}", e)))?;
        self.stop().await
    }

    /// Address the API is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn service(&self) -> &TelephonyService {
        &self.service
    }
}

/// Builder for [`TelephonyServer`]
#[derive(Default)]
pub struct TelephonyServerBuilder {
    config: Option<TelephonyConfig>,
    carrier: Option<Arc<dyn CarrierClient>>,
    sinks: Option<Arc<dyn SinkFactory>>,
}

impl TelephonyServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: TelephonyConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom carrier client instead of the HTTP one
    pub fn with_carrier(mut self, carrier: Arc<dyn CarrierClient>) -> Self {
        self.carrier = Some(carrier);
        self
    }

    /// Use custom notification sinks instead of the HTTP ones
    pub fn with_sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub async fn build(self) -> Result<TelephonyServer> {
        let config = self
            .config
            .ok_or_else(|| TelephonyError::Config("configuration not provided".to_string()))?;

        let service = match (self.carrier, self.sinks) {
            (None, None) => TelephonyService::from_config(config).await?,
            (carrier, sinks) => {
                config.validate()?;
                let store = Arc::new(SqliteStore::new(&config.database_url).await?);
                let carrier: Arc<dyn CarrierClient> = match carrier {
                    Some(carrier) => carrier,
                    None => Arc::new(crate::carrier::HttpCarrierClient::new(&config.carrier)?),
                };
                let sinks: Arc<dyn SinkFactory> = match sinks {
                    Some(sinks) => sinks,
                    None => Arc::new(crate::dispatch::HttpSinkFactory::new(config.dispatch.clone())?),
                };
                TelephonyService::new(config, store, carrier, sinks, default_ingest_retry())
            }
        };
        Ok(TelephonyServer::new(service))
    }
}
