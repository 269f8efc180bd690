//! Persistence seams
//!
//! Components depend on these traits rather than on a concrete database.
//! [`SqliteStore`] implements all of them on top of sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::{LedgerAccount, LedgerEntry, NewLedgerEntry};
use crate::types::{
    CallRecord, CallStartedEvent, NewCallRecord, NotificationChannel, PhoneNumber, TenantId,
    UserFunction,
};

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Phone number rows
#[async_trait]
pub trait NumberStore: Send + Sync {
    async fn get_number(&self, number: &str) -> Result<Option<PhoneNumber>>;
    async fn upsert_number(&self, number: &PhoneNumber) -> Result<()>;
    async fn list_numbers(&self, tenant_id: TenantId) -> Result<Vec<PhoneNumber>>;
    /// All numbers in `Connecting` or `Disconnecting`
    async fn list_transient_numbers(&self) -> Result<Vec<PhoneNumber>>;
}

/// Balance accounts and their append-only entry log
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_account(&self, account_key: &str) -> Result<Option<LedgerAccount>>;
    async fn find_entry(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>>;

    /// Append `entry` and move the account to `next` in one transaction.
    ///
    /// `expected_version` is the version read before computing `next`
    /// (`None` when the account does not exist yet). Fails with
    /// `DuplicateEvent` when the idempotency key is taken and with `Conflict`
    /// when the account changed underneath.
    async fn commit_entry(
        &self,
        expected_version: Option<i64>,
        next: &LedgerAccount,
        entry: &NewLedgerEntry,
    ) -> Result<LedgerEntry>;

    async fn list_entries(&self, account_key: &str) -> Result<Vec<LedgerEntry>>;
}

/// Provisional state of a call between start and end events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCall {
    pub call_id: String,
    pub tenant_id: Option<TenantId>,
    pub caller: String,
    pub callee: String,
    pub started_at: DateTime<Utc>,
}

/// Filter for reading call records in history order
/// (`started_at` descending, `seq` descending)
#[derive(Debug, Clone)]
pub struct CallRecordFilter {
    pub tenant_id: TenantId,
    /// Inclusive lower bound on call start time
    pub since: Option<DateTime<Utc>>,
    /// Snapshot high-water mark; rows with a greater `seq` are invisible
    pub max_seq: i64,
    /// Keyset position: only rows strictly after it in history order
    pub after: Option<(DateTime<Utc>, i64)>,
    pub offset: u32,
    pub limit: u32,
}

/// Immutable call records plus provisional active calls
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Returns `None` when a record with the same call id already exists.
    /// A fresh insert also ends the active call and, when `notify` is set,
    /// queues the call's notification in the same transaction.
    async fn insert_call_record(&self, record: &NewCallRecord) -> Result<Option<CallRecord>>;
    async fn get_call_record(&self, call_id: &str) -> Result<Option<CallRecord>>;
    async fn max_seq(&self, tenant_id: TenantId) -> Result<i64>;
    async fn query_call_records(&self, filter: &CallRecordFilter) -> Result<Vec<CallRecord>>;
    /// Count ignoring `after`, `offset` and `limit`
    async fn count_call_records(&self, filter: &CallRecordFilter) -> Result<i64>;

    /// Returns `false` when the call was already known
    async fn insert_active_call(&self, call: &ActiveCall) -> Result<bool>;
    async fn get_active_call(&self, call_id: &str) -> Result<Option<ActiveCall>>;

    /// Whether the call's notification still has to be dispatched
    async fn notification_pending(&self, call_id: &str) -> Result<bool>;
    async fn clear_pending_notification(&self, call_id: &str) -> Result<()>;
}

/// Notification channels, user functions, assistants and tenant settings
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn insert_channel(&self, channel: &NotificationChannel) -> Result<()>;
    async fn get_channel(&self, id: &str) -> Result<Option<NotificationChannel>>;
    async fn list_channels(&self, tenant_id: TenantId) -> Result<Vec<NotificationChannel>>;
    async fn set_channel_active(&self, id: &str, active: bool) -> Result<bool>;

    async fn insert_function(&self, function: &UserFunction) -> Result<()>;
    async fn get_function(&self, id: &str) -> Result<Option<UserFunction>>;
    async fn list_functions(&self, tenant_id: TenantId) -> Result<Vec<UserFunction>>;

    async fn insert_assistant(&self, tenant_id: TenantId, id: &str, name: &str) -> Result<()>;
    async fn assistant_owner(&self, id: &str) -> Result<Option<TenantId>>;

    async fn tenant_timezone(&self, tenant_id: TenantId) -> Result<Option<String>>;
    async fn set_tenant_timezone(&self, tenant_id: TenantId, timezone: &str) -> Result<()>;
}

/// Ingestion event that could not be applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub kind: String,
    pub event_key: String,
    pub payload: serde_json::Value,
    pub last_error: String,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

/// Parking lot for billable events that failed to apply
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Parks an event; a second push for the same kind and key updates the
    /// existing letter and returns its id
    async fn push_dead_letter(
        &self,
        kind: &str,
        event_key: &str,
        payload: &serde_json::Value,
        error: &str,
    ) -> Result<i64>;
    /// Letters with the fewest attempts first, so repeat failures do not
    /// starve the rest of the queue
    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>>;
    async fn record_dead_letter_failure(&self, id: i64, error: &str) -> Result<()>;
    async fn delete_dead_letter(&self, id: i64) -> Result<()>;
}
