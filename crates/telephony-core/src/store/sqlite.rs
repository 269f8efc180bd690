//! SQLite-backed store using sqlx
//!
//! Timestamps are stored as integer milliseconds so that range filters and
//! keyset pagination compare numerically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ActiveCall, CallRecordFilter, CallRecordStore, CatalogStore, DeadLetter, DeadLetterStore,
    LedgerStore, NumberStore,
};
use crate::error::{Result, TelephonyError};
use crate::ledger::{EntryKind, LedgerAccount, LedgerEntry, NewLedgerEntry};
use crate::types::{
    CallDirection, CallRecord, CallStatus, E164, NewCallRecord, NotificationChannel, NumberStatus,
    PhoneNumber, RoutingConfig, TenantId, UserFunction,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS phone_numbers (
    number        TEXT PRIMARY KEY,
    tenant_id     INTEGER,
    status        TEXT NOT NULL,
    routing       TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_phone_numbers_tenant ON phone_numbers(tenant_id);
CREATE INDEX IF NOT EXISTS idx_phone_numbers_status ON phone_numbers(status);

CREATE TABLE IF NOT EXISTS ledger_accounts (
    account_key   TEXT PRIMARY KEY,
    tenant_id     INTEGER NOT NULL,
    funds         INTEGER NOT NULL,
    free_minutes  INTEGER NOT NULL,
    version       INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    account_key        TEXT NOT NULL,
    idempotency_key    TEXT NOT NULL UNIQUE,
    kind               TEXT NOT NULL,
    reason             TEXT NOT NULL,
    funds_delta        INTEGER NOT NULL,
    free_minutes_delta INTEGER NOT NULL,
    uncollected        INTEGER NOT NULL,
    funds_after        INTEGER NOT NULL,
    free_minutes_after INTEGER NOT NULL,
    created_at_ms      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_account ON ledger_entries(account_key, id);

CREATE TABLE IF NOT EXISTS call_records (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    call_id           TEXT NOT NULL UNIQUE,
    tenant_id         INTEGER NOT NULL,
    line_number       TEXT NOT NULL,
    caller            TEXT NOT NULL,
    callee            TEXT NOT NULL,
    direction         TEXT NOT NULL,
    status            TEXT NOT NULL,
    started_at_ms     INTEGER NOT NULL,
    duration_secs     INTEGER NOT NULL,
    billed_minutes    INTEGER NOT NULL,
    free_minutes_used INTEGER NOT NULL,
    rate_per_minute   INTEGER NOT NULL,
    cost              INTEGER NOT NULL,
    transcript        TEXT,
    assistant_id      TEXT,
    created_at_ms     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_call_records_history
    ON call_records(tenant_id, started_at_ms DESC, seq DESC);

CREATE TABLE IF NOT EXISTS pending_notifications (
    call_id       TEXT PRIMARY KEY,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS active_calls (
    call_id       TEXT PRIMARY KEY,
    tenant_id     INTEGER,
    caller        TEXT NOT NULL,
    callee        TEXT NOT NULL,
    started_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_channels (
    id            TEXT PRIMARY KEY,
    tenant_id     INTEGER NOT NULL,
    name          TEXT NOT NULL,
    target        TEXT NOT NULL,
    active        INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_channels_tenant ON notification_channels(tenant_id);

CREATE TABLE IF NOT EXISTS user_functions (
    id            TEXT PRIMARY KEY,
    tenant_id     INTEGER NOT NULL,
    name          TEXT NOT NULL,
    description   TEXT,
    parameters    TEXT NOT NULL,
    endpoint      TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_functions_tenant ON user_functions(tenant_id);

CREATE TABLE IF NOT EXISTS assistants (
    id        TEXT PRIMARY KEY,
    tenant_id INTEGER NOT NULL,
    name      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tenant_settings (
    tenant_id INTEGER PRIMARY KEY,
    timezone  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    kind          TEXT NOT NULL,
    event_key     TEXT NOT NULL,
    payload       TEXT NOT NULL,
    last_error    TEXT NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 1,
    created_at_ms INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_dead_letters_event ON dead_letters(kind, event_key);
"#;

/// sqlx store implementing every persistence trait
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and apply the schema.
    ///
    /// In-memory databases are pinned to a single, never-recycled connection
    /// since each SQLite memory connection is its own database.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("Telephony store ready at {}", database_url);
        Ok(store)
    }

    /// In-memory store, mostly for tests
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("Schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| TelephonyError::internal(format!("timestamp out of range: {}", ms)))
}

fn corrupt(column: &str, value: &str) -> TelephonyError {
    TelephonyError::internal(format!("unexpected value '{}' in column {}", value, column))
}

fn number_from_row(row: &SqliteRow) -> Result<PhoneNumber> {
    let number: String = row.try_get("number")?;
    let status: String = row.try_get("status")?;
    let routing: Option<String> = row.try_get("routing")?;
    Ok(PhoneNumber {
        number: E164::parse(&number)?,
        tenant_id: row.try_get("tenant_id")?,
        status: NumberStatus::from_str(&status).ok_or_else(|| corrupt("status", &status))?,
        routing: routing
            .map(|json| serde_json::from_str::<RoutingConfig>(&json))
            .transpose()?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
        updated_at: from_ms(row.try_get("updated_at_ms")?)?,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<LedgerAccount> {
    Ok(LedgerAccount {
        account_key: row.try_get("account_key")?,
        tenant_id: row.try_get("tenant_id")?,
        funds: row.try_get("funds")?,
        free_minutes: row.try_get("free_minutes")?,
        version: row.try_get("version")?,
        updated_at: from_ms(row.try_get("updated_at_ms")?)?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry> {
    let kind: String = row.try_get("kind")?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        account_key: row.try_get("account_key")?,
        idempotency_key: row.try_get("idempotency_key")?,
        kind: EntryKind::from_str(&kind).ok_or_else(|| corrupt("kind", &kind))?,
        reason: row.try_get("reason")?,
        funds_delta: row.try_get("funds_delta")?,
        free_minutes_delta: row.try_get("free_minutes_delta")?,
        uncollected: row.try_get("uncollected")?,
        funds_after: row.try_get("funds_after")?,
        free_minutes_after: row.try_get("free_minutes_after")?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
    })
}

fn call_record_from_row(row: &SqliteRow) -> Result<CallRecord> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    Ok(CallRecord {
        seq: row.try_get("seq")?,
        call_id: row.try_get("call_id")?,
        tenant_id: row.try_get("tenant_id")?,
        line_number: row.try_get("line_number")?,
        caller: row.try_get("caller")?,
        callee: row.try_get("callee")?,
        direction: CallDirection::from_str(&direction)
            .ok_or_else(|| corrupt("direction", &direction))?,
        status: CallStatus::from_str(&status).ok_or_else(|| corrupt("status", &status))?,
        started_at: from_ms(row.try_get("started_at_ms")?)?,
        duration_secs: row.try_get("duration_secs")?,
        billed_minutes: row.try_get("billed_minutes")?,
        free_minutes_used: row.try_get("free_minutes_used")?,
        rate_per_minute: row.try_get("rate_per_minute")?,
        cost: row.try_get("cost")?,
        transcript: row.try_get("transcript")?,
        assistant_id: row.try_get("assistant_id")?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
    })
}

fn channel_from_row(row: &SqliteRow) -> Result<NotificationChannel> {
    let target: String = row.try_get("target")?;
    Ok(NotificationChannel {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        target: serde_json::from_str(&target)?,
        active: row.try_get("active")?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
    })
}

fn function_from_row(row: &SqliteRow) -> Result<UserFunction> {
    let parameters: String = row.try_get("parameters")?;
    Ok(UserFunction {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        parameters: serde_json::from_str(&parameters)?,
        endpoint: row.try_get("endpoint")?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
    })
}

fn active_call_from_row(row: &SqliteRow) -> Result<ActiveCall> {
    Ok(ActiveCall {
        call_id: row.try_get("call_id")?,
        tenant_id: row.try_get("tenant_id")?,
        caller: row.try_get("caller")?,
        callee: row.try_get("callee")?,
        started_at: from_ms(row.try_get("started_at_ms")?)?,
    })
}

fn push_history_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &CallRecordFilter, keyset: bool) {
    qb.push(" WHERE tenant_id = ").push_bind(filter.tenant_id);
    qb.push(" AND seq <= ").push_bind(filter.max_seq);
    if let Some(since) = filter.since {
        qb.push(" AND started_at_ms >= ").push_bind(to_ms(since));
    }
    if keyset {
        if let Some((started_at, seq)) = filter.after {
            let ms = to_ms(started_at);
            qb.push(" AND (started_at_ms < ")
                .push_bind(ms)
                .push(" OR (started_at_ms = ")
                .push_bind(ms)
                .push(" AND seq < ")
                .push_bind(seq)
                .push("))");
        }
    }
}

#[async_trait]
impl NumberStore for SqliteStore {
    async fn get_number(&self, number: &str) -> Result<Option<PhoneNumber>> {
        let row = sqlx::query("SELECT * FROM phone_numbers WHERE number = ?")
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(number_from_row).transpose()
    }

    async fn upsert_number(&self, number: &PhoneNumber) -> Result<()> {
        let routing = number
            .routing
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO phone_numbers (number, tenant_id, status, routing, created_at_ms, updated_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(number) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                status = excluded.status,
                routing = excluded.routing,
                updated_at_ms = excluded.updated_at_ms",
        )
        .bind(number.number.as_str())
        .bind(number.tenant_id)
        .bind(number.status.as_str())
        .bind(routing)
        .bind(to_ms(number.created_at))
        .bind(to_ms(number.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_numbers(&self, tenant_id: TenantId) -> Result<Vec<PhoneNumber>> {
        let rows = sqlx::query("SELECT * FROM phone_numbers WHERE tenant_id = ? ORDER BY number")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(number_from_row).collect()
    }

    async fn list_transient_numbers(&self) -> Result<Vec<PhoneNumber>> {
        let rows = sqlx::query(
            "SELECT * FROM phone_numbers WHERE status IN ('connecting', 'disconnecting') ORDER BY number",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(number_from_row).collect()
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn get_account(&self, account_key: &str) -> Result<Option<LedgerAccount>> {
        let row = sqlx::query("SELECT * FROM ledger_accounts WHERE account_key = ?")
            .bind(account_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_entry(&self, idempotency_key: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query("SELECT * FROM ledger_entries WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn commit_entry(
        &self,
        expected_version: Option<i64>,
        next: &LedgerAccount,
        entry: &NewLedgerEntry,
    ) -> Result<LedgerEntry> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO ledger_entries (account_key, idempotency_key, kind, reason, funds_delta,
                free_minutes_delta, uncollected, funds_after, free_minutes_after, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(&entry.account_key)
        .bind(&entry.idempotency_key)
        .bind(entry.kind.as_str())
        .bind(&entry.reason)
        .bind(entry.funds_delta)
        .bind(entry.free_minutes_delta)
        .bind(entry.uncollected)
        .bind(entry.funds_after)
        .bind(entry.free_minutes_after)
        .bind(to_ms(now))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(TelephonyError::DuplicateEvent {
                key: entry.idempotency_key.clone(),
            });
        }
        let entry_id = inserted.last_insert_rowid();

        let moved = match expected_version {
            None => sqlx::query(
                "INSERT INTO ledger_accounts (account_key, tenant_id, funds, free_minutes, version, updated_at_ms)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(account_key) DO NOTHING",
            )
            .bind(&next.account_key)
            .bind(next.tenant_id)
            .bind(next.funds)
            .bind(next.free_minutes)
            .bind(next.version)
            .bind(to_ms(now))
            .execute(&mut *tx)
            .await?,
            Some(version) => sqlx::query(
                "UPDATE ledger_accounts
                 SET funds = ?, free_minutes = ?, version = ?, updated_at_ms = ?
                 WHERE account_key = ? AND version = ?",
            )
            .bind(next.funds)
            .bind(next.free_minutes)
            .bind(next.version)
            .bind(to_ms(now))
            .bind(&next.account_key)
            .bind(version)
            .execute(&mut *tx)
            .await?,
        };

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(TelephonyError::conflict(format!(
                "ledger account {} changed concurrently",
                next.account_key
            )));
        }

        tx.commit().await?;

        Ok(LedgerEntry {
            id: entry_id,
            account_key: entry.account_key.clone(),
            idempotency_key: entry.idempotency_key.clone(),
            kind: entry.kind,
            reason: entry.reason.clone(),
            funds_delta: entry.funds_delta,
            free_minutes_delta: entry.free_minutes_delta,
            uncollected: entry.uncollected,
            funds_after: entry.funds_after,
            free_minutes_after: entry.free_minutes_after,
            created_at: from_ms(to_ms(now))?,
        })
    }

    async fn list_entries(&self, account_key: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM ledger_entries WHERE account_key = ? ORDER BY id")
            .bind(account_key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl CallRecordStore for SqliteStore {
    async fn insert_call_record(&self, record: &NewCallRecord) -> Result<Option<CallRecord>> {
        let now = to_ms(Utc::now());
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO call_records (call_id, tenant_id, line_number, caller, callee, direction,
                status, started_at_ms, duration_secs, billed_minutes, free_minutes_used,
                rate_per_minute, cost, transcript, assistant_id, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(call_id) DO NOTHING",
        )
        .bind(&record.call_id)
        .bind(record.tenant_id)
        .bind(&record.line_number)
        .bind(&record.caller)
        .bind(&record.callee)
        .bind(record.direction.as_str())
        .bind(record.status.as_str())
        .bind(to_ms(record.started_at))
        .bind(record.duration_secs)
        .bind(record.billed_minutes)
        .bind(record.free_minutes_used)
        .bind(record.rate_per_minute)
        .bind(record.cost)
        .bind(&record.transcript)
        .bind(&record.assistant_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        if record.notify {
            sqlx::query("INSERT INTO pending_notifications (call_id, created_at_ms) VALUES (?, ?)")
                .bind(&record.call_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM active_calls WHERE call_id = ?")
            .bind(&record.call_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query("SELECT * FROM call_records WHERE call_id = ?")
            .bind(&record.call_id)
            .fetch_one(&mut *tx)
            .await?;
        let stored = call_record_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(stored))
    }

    async fn get_call_record(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let row = sqlx::query("SELECT * FROM call_records WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(call_record_from_row).transpose()
    }

    async fn max_seq(&self, tenant_id: TenantId) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM call_records WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    async fn query_call_records(&self, filter: &CallRecordFilter) -> Result<Vec<CallRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM call_records");
        push_history_filter(&mut qb, filter, true);
        qb.push(" ORDER BY started_at_ms DESC, seq DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(call_record_from_row).collect()
    }

    async fn count_call_records(&self, filter: &CallRecordFilter) -> Result<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM call_records");
        push_history_filter(&mut qb, filter, false);
        let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn insert_active_call(&self, call: &ActiveCall) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO active_calls (call_id, tenant_id, caller, callee, started_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(call_id) DO NOTHING",
        )
        .bind(&call.call_id)
        .bind(call.tenant_id)
        .bind(&call.caller)
        .bind(&call.callee)
        .bind(to_ms(call.started_at))
        .execute(&self.pool)
        .await?;
        Ok(inserted.rows_affected() > 0)
    }

    async fn get_active_call(&self, call_id: &str) -> Result<Option<ActiveCall>> {
        let row = sqlx::query("SELECT * FROM active_calls WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(active_call_from_row).transpose()
    }

    async fn notification_pending(&self, call_id: &str) -> Result<bool> {
        let pending: Option<String> =
            sqlx::query_scalar("SELECT call_id FROM pending_notifications WHERE call_id = ?")
                .bind(call_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(pending.is_some())
    }

    async fn clear_pending_notification(&self, call_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_notifications WHERE call_id = ?")
            .bind(call_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn insert_channel(&self, channel: &NotificationChannel) -> Result<()> {
        sqlx::query(
            "INSERT INTO notification_channels (id, tenant_id, name, target, active, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&channel.id)
        .bind(channel.tenant_id)
        .bind(&channel.name)
        .bind(serde_json::to_string(&channel.target)?)
        .bind(channel.active)
        .bind(to_ms(channel.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_channel(&self, id: &str) -> Result<Option<NotificationChannel>> {
        let row = sqlx::query("SELECT * FROM notification_channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(channel_from_row).transpose()
    }

    async fn list_channels(&self, tenant_id: TenantId) -> Result<Vec<NotificationChannel>> {
        let rows = sqlx::query(
            "SELECT * FROM notification_channels WHERE tenant_id = ? ORDER BY created_at_ms, id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(channel_from_row).collect()
    }

    async fn set_channel_active(&self, id: &str, active: bool) -> Result<bool> {
        let updated = sqlx::query("UPDATE notification_channels SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn insert_function(&self, function: &UserFunction) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_functions (id, tenant_id, name, description, parameters, endpoint, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&function.id)
        .bind(function.tenant_id)
        .bind(&function.name)
        .bind(&function.description)
        .bind(serde_json::to_string(&function.parameters)?)
        .bind(&function.endpoint)
        .bind(to_ms(function.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_function(&self, id: &str) -> Result<Option<UserFunction>> {
        let row = sqlx::query("SELECT * FROM user_functions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(function_from_row).transpose()
    }

    async fn list_functions(&self, tenant_id: TenantId) -> Result<Vec<UserFunction>> {
        let rows =
            sqlx::query("SELECT * FROM user_functions WHERE tenant_id = ? ORDER BY created_at_ms, id")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(function_from_row).collect()
    }

    async fn insert_assistant(&self, tenant_id: TenantId, id: &str, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO assistants (id, tenant_id, name) VALUES (?, ?, ?)")
            .bind(id)
            .bind(tenant_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assistant_owner(&self, id: &str) -> Result<Option<TenantId>> {
        let owner: Option<i64> = sqlx::query_scalar("SELECT tenant_id FROM assistants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }

    async fn tenant_timezone(&self, tenant_id: TenantId) -> Result<Option<String>> {
        let tz: Option<String> =
            sqlx::query_scalar("SELECT timezone FROM tenant_settings WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(tz)
    }

    async fn set_tenant_timezone(&self, tenant_id: TenantId, timezone: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenant_settings (tenant_id, timezone) VALUES (?, ?)
             ON CONFLICT(tenant_id) DO UPDATE SET timezone = excluded.timezone",
        )
        .bind(tenant_id)
        .bind(timezone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for SqliteStore {
    async fn push_dead_letter(
        &self,
        kind: &str,
        event_key: &str,
        payload: &serde_json::Value,
        error: &str,
    ) -> Result<i64> {
        // A redelivered failing event bumps its existing letter
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO dead_letters (kind, event_key, payload, last_error, attempts, created_at_ms)
             VALUES (?, ?, ?, ?, 1, ?)
             ON CONFLICT(kind, event_key) DO UPDATE SET
                payload = excluded.payload,
                last_error = excluded.last_error,
                attempts = dead_letters.attempts + 1
             RETURNING id",
        )
        .bind(kind)
        .bind(event_key)
        .bind(serde_json::to_string(payload)?)
        .bind(error)
        .bind(to_ms(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY attempts, id LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<DeadLetter> {
                let payload: String = row.try_get("payload")?;
                Ok(DeadLetter {
                    id: row.try_get("id")?,
                    kind: row.try_get("kind")?,
                    event_key: row.try_get("event_key")?,
                    payload: serde_json::from_str(&payload)?,
                    last_error: row.try_get("last_error")?,
                    attempts: row.try_get("attempts")?,
                    created_at: from_ms(row.try_get("created_at_ms")?)?,
                })
            })
            .collect()
    }

    async fn record_dead_letter_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE dead_letters SET attempts = attempts + 1, last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_dead_letter(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(call_id: &str, tenant_id: TenantId, started_ms: i64) -> NewCallRecord {
        NewCallRecord {
            call_id: call_id.to_string(),
            tenant_id,
            line_number: "+70001112233".into(),
            caller: "+79990001122".into(),
            callee: "+70001112233".into(),
            direction: CallDirection::Inbound,
            status: CallStatus::Answered,
            started_at: from_ms(started_ms).unwrap(),
            duration_secs: 30,
            billed_minutes: 1,
            free_minutes_used: 1,
            rate_per_minute: 500,
            cost: 0,
            transcript: None,
            assistant_id: None,
            notify: false,
        }
    }

    #[tokio::test]
    async fn call_record_insert_is_idempotent_on_call_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let first = store.insert_call_record(&record("c-1", 5, 1_000)).await.unwrap();
        assert!(first.is_some());
        let second = store.insert_call_record(&record("c-1", 5, 1_000)).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.max_seq(5).await.unwrap(), first.unwrap().seq);
    }

    #[tokio::test]
    async fn record_insert_queues_notification_and_ends_active_call() {
        let store = SqliteStore::in_memory().await.unwrap();
        let started = from_ms(1_000).unwrap();
        store
            .insert_active_call(&ActiveCall {
                call_id: "c-1".into(),
                tenant_id: Some(5),
                caller: "+79990001122".into(),
                callee: "+70001112233".into(),
                started_at: started,
            })
            .await
            .unwrap();

        let mut new_record = record("c-1", 5, 1_000);
        new_record.notify = true;
        store.insert_call_record(&new_record).await.unwrap().unwrap();

        assert!(store.get_active_call("c-1").await.unwrap().is_none());
        assert!(store.notification_pending("c-1").await.unwrap());
        store.clear_pending_notification("c-1").await.unwrap();
        assert!(!store.notification_pending("c-1").await.unwrap());

        // A conflicting insert queues nothing
        store.insert_call_record(&new_record).await.unwrap();
        assert!(!store.notification_pending("c-1").await.unwrap());
    }

    #[tokio::test]
    async fn redelivered_dead_letter_is_bumped_not_duplicated() {
        let store = SqliteStore::in_memory().await.unwrap();
        let payload = serde_json::json!({ "call_id": "poison" });
        let first = store.push_dead_letter("call_ended", "poison", &payload, "boom").await.unwrap();
        let again = store.push_dead_letter("call_ended", "poison", &payload, "boom again").await.unwrap();
        store.push_dead_letter("call_ended", "good", &payload, "not yet").await.unwrap();
        assert_eq!(first, again);

        let letters = store.list_dead_letters(10).await.unwrap();
        let keys: Vec<&str> = letters.iter().map(|l| l.event_key.as_str()).collect();
        // Fewest attempts first
        assert_eq!(keys, vec!["good", "poison"]);
        assert_eq!(letters[1].attempts, 2);
        assert_eq!(letters[1].last_error, "boom again");
    }

    #[tokio::test]
    async fn keyset_filter_orders_by_time_then_seq() {
        let store = SqliteStore::in_memory().await.unwrap();
        for (id, ms) in [("a", 3_000), ("b", 2_000), ("c", 2_000), ("d", 1_000)] {
            store.insert_call_record(&record(id, 5, ms)).await.unwrap();
        }
        let mut filter = CallRecordFilter {
            tenant_id: 5,
            since: None,
            max_seq: store.max_seq(5).await.unwrap(),
            after: None,
            offset: 0,
            limit: 10,
        };
        let all: Vec<String> = store
            .query_call_records(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.call_id)
            .collect();
        assert_eq!(all, vec!["a", "c", "b", "d"]);

        let c = store.get_call_record("c").await.unwrap().unwrap();
        filter.after = Some((c.started_at, c.seq));
        let rest: Vec<String> = store
            .query_call_records(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.call_id)
            .collect();
        assert_eq!(rest, vec!["b", "d"]);
        assert_eq!(store.count_call_records(&filter).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let account = LedgerAccount {
            account_key: "tenant:5".into(),
            tenant_id: 5,
            funds: 100,
            free_minutes: 0,
            version: 1,
            updated_at: Utc::now(),
        };
        let entry = NewLedgerEntry {
            account_key: "tenant:5".into(),
            idempotency_key: "topup:1".into(),
            kind: EntryKind::Adjustment,
            reason: "top-up".into(),
            funds_delta: 100,
            free_minutes_delta: 0,
            uncollected: 0,
            funds_after: 100,
            free_minutes_after: 0,
        };
        store.commit_entry(None, &account, &entry).await.unwrap();
        let err = store.commit_entry(Some(1), &account, &entry).await.unwrap_err();
        assert!(matches!(err, TelephonyError::DuplicateEvent { .. }));
        assert_eq!(store.list_entries("tenant:5").await.unwrap().len(), 1);
    }
}
