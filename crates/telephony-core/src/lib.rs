//! # Telephony-Core
//!
//! Phone line lifecycle and usage metering for hosted voice assistants.
//!
//! This crate provides:
//! - Connecting, disconnecting and routing tenant phone numbers through the carrier
//! - A prepaid balance ledger (free minutes, then funds) with idempotent deltas
//! - Ingestion of carrier call events with exactly-once billing per call
//! - Paginated call history in the tenant's timezone
//! - Post-call notifications to chat bots, SMS and user-defined functions
//! - A REST API for the dashboard and carrier webhooks
//!
//! ## Architecture
//!
//! Every component works against the storage traits in [`store`]; the
//! bundled [`SqliteStore`] implements all of them. [`TelephonyService`] wires
//! the components over one store and [`TelephonyServer`] exposes them over
//! HTTP with a background reconciler for lines stuck in a transient state.

pub mod api;
pub mod cache;
pub mod carrier;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod ingest;
pub mod ledger;
pub mod lifecycle;
pub mod server;
pub mod service;
pub mod store;
pub mod types;

pub use config::TelephonyConfig;
pub use error::{ErrorKind, Result, TelephonyError};
pub use server::{TelephonyServer, TelephonyServerBuilder};
pub use service::TelephonyService;
pub use store::SqliteStore;

/// Initialize the telephony service from configuration
pub async fn init(config: TelephonyConfig) -> Result<TelephonyService> {
    TelephonyService::from_config(config).await
}

/// Commonly used types
pub mod prelude {
    pub use crate::carrier::{CarrierClient, CarrierLineState, CarrierNumberResult, CarrierOutcome};
    pub use crate::dispatch::{
        DispatchReport, NotificationDispatcher, NotificationEvent, Sink, SinkError, SinkFactory,
        SinkStatus,
    };
    pub use crate::history::{CallHistoryService, HistoryPage, HistoryQuery, Period};
    pub use crate::ingest::{billed_minutes, CallEventIngestor, IngestOutcome};
    pub use crate::ledger::{AccountKey, BalanceView, Delta, Ledger, LedgerEntry, LedgerOutcome};
    pub use crate::lifecycle::{
        ConnectReport, ConnectStatus, DisconnectOutcome, NumberLifecycleManager,
    };
    pub use crate::types::*;
    pub use crate::{Result, TelephonyConfig, TelephonyError, TelephonyService};
}
