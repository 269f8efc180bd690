//! # Balance Ledger
//!
//! Authoritative prepaid balance per account. An account holds funds (minor
//! currency units) and free minutes. Every change is an append-only
//! [`LedgerEntry`] keyed by an idempotency key, so the current account state
//! is always the sum of its entries and can be replayed with
//! [`Ledger::audit`].
//!
//! ## Policy
//!
//! - Metered usage draws free minutes first, then charges funds at the rate.
//! - With `allow_overage` metering may push funds below the floor
//!   (post-paid). Without it the charge is capped at the floor and the rest
//!   is recorded as `uncollected` on the entry.
//! - Only [`Delta::Debit`] is a checked (pre-authorization) delta and fails
//!   with `InsufficientFunds`.
//! - Available minutes are never negative.
//!
//! Deltas for one account are serialized with a per-key lock; the store
//! additionally rejects stale writes through an account version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use dialtone_infra_common::{KeyedLocks, LogContext};

use crate::config::{BalanceScope, BillingConfig};
use crate::error::{Result, TelephonyError};
use crate::store::LedgerStore;
use crate::types::{Money, TenantId};

const MAX_COMMIT_RETRIES: usize = 3;

/// Balance row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub account_key: String,
    pub tenant_id: TenantId,
    pub funds: Money,
    pub free_minutes: i64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// What an entry did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Account opened with the configured free-minute grant
    Open,
    Usage,
    Adjustment,
    FreeMinutes,
    Debit,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Open => "open",
            EntryKind::Usage => "usage",
            EntryKind::Adjustment => "adjustment",
            EntryKind::FreeMinutes => "free_minutes",
            EntryKind::Debit => "debit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(EntryKind::Open),
            "usage" => Some(EntryKind::Usage),
            "adjustment" => Some(EntryKind::Adjustment),
            "free_minutes" => Some(EntryKind::FreeMinutes),
            "debit" => Some(EntryKind::Debit),
            _ => None,
        }
    }
}

/// Entry to append
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub account_key: String,
    pub idempotency_key: String,
    pub kind: EntryKind,
    pub reason: String,
    pub funds_delta: Money,
    pub free_minutes_delta: i64,
    /// Part of a usage charge that could not be collected without overage
    pub uncollected: Money,
    pub funds_after: Money,
    pub free_minutes_after: i64,
}

/// Committed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_key: String,
    pub idempotency_key: String,
    pub kind: EntryKind,
    pub reason: String,
    pub funds_delta: Money,
    pub free_minutes_delta: i64,
    pub uncollected: Money,
    pub funds_after: Money,
    pub free_minutes_after: i64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Free minutes consumed by a usage entry
    pub fn free_minutes_used(&self) -> i64 {
        (-self.free_minutes_delta).max(0)
    }

    /// Amount billed by a usage entry, collected or not
    pub fn charged(&self) -> Money {
        (-self.funds_delta).max(0) + self.uncollected
    }
}

/// A requested balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// Metered call minutes at `rate` per minute
    Usage { minutes: i64, rate: Money },
    /// Manual funds change: top-up (positive) or correction
    Adjustment { amount: Money },
    /// Grant (or revoke) free minutes
    FreeMinutes { minutes: i64 },
    /// Checked debit that must be covered down to the floor
    Debit { amount: Money },
}

impl Delta {
    fn kind(&self) -> EntryKind {
        match self {
            Delta::Usage { .. } => EntryKind::Usage,
            Delta::Adjustment { .. } => EntryKind::Adjustment,
            Delta::FreeMinutes { .. } => EntryKind::FreeMinutes,
            Delta::Debit { .. } => EntryKind::Debit,
        }
    }
}

/// Identifies the balance account a delta applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub tenant_id: TenantId,
    pub key: String,
}

impl AccountKey {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            key: format!("tenant:{}", tenant_id),
        }
    }

    pub fn number(tenant_id: TenantId, number: &str) -> Self {
        Self {
            tenant_id,
            key: format!("number:{}", number),
        }
    }
}

/// Result of [`Ledger::apply_delta`]
#[derive(Debug, Clone)]
pub struct LedgerOutcome {
    pub entry: LedgerEntry,
    /// The idempotency key had already been applied; nothing changed
    pub duplicate: bool,
}

/// Read view of an account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceView {
    pub account_key: String,
    pub tenant_id: TenantId,
    pub funds: Money,
    pub free_minutes: i64,
    pub available_minutes: i64,
    pub rate_per_minute: Money,
    pub allow_overage: bool,
    pub updated_at: DateTime<Utc>,
}

/// Replay check of an account against its entry log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerAudit {
    pub account_key: String,
    pub entries: usize,
    pub stored_funds: Money,
    pub replayed_funds: Money,
    pub stored_free_minutes: i64,
    pub replayed_free_minutes: i64,
    pub total_uncollected: Money,
    pub consistent: bool,
}

/// Funds above the floor, never negative
fn spendable(funds: Money, policy: &BillingConfig) -> Money {
    funds.saturating_sub(policy.balance_floor).max(0)
}

/// Minutes the account can still talk: free minutes plus what funds cover
pub fn available_minutes(account: &LedgerAccount, policy: &BillingConfig) -> i64 {
    let paid = spendable(account.funds, policy) / policy.rate_per_minute.max(1);
    account.free_minutes.max(0).saturating_add(paid)
}

fn out_of_range(what: &str) -> TelephonyError {
    TelephonyError::validation(format!("{} is out of range", what))
}

/// Pure balance arithmetic for one delta
fn compute_entry(
    account: &LedgerAccount,
    delta: Delta,
    policy: &BillingConfig,
    reason: &str,
    idempotency_key: &str,
) -> Result<NewLedgerEntry> {
    let (funds_delta, free_minutes_delta, uncollected) = match delta {
        Delta::Usage { minutes, rate } => {
            if minutes < 0 || rate < 0 {
                return Err(TelephonyError::validation("usage minutes and rate must not be negative"));
            }
            let free_used = minutes.min(account.free_minutes.max(0));
            let cost = (minutes - free_used)
                .checked_mul(rate)
                .ok_or_else(|| out_of_range("usage cost"))?;
            if policy.allow_overage {
                (-cost, -free_used, 0)
            } else {
                let collected = cost.min(spendable(account.funds, policy));
                (-collected, -free_used, cost - collected)
            }
        }
        Delta::Adjustment { amount } => (amount, 0, 0),
        Delta::FreeMinutes { minutes } => {
            let after = account
                .free_minutes
                .checked_add(minutes)
                .ok_or_else(|| out_of_range("free minutes"))?;
            if after < 0 {
                return Err(TelephonyError::validation(format!(
                    "cannot revoke {} free minutes, only {} left",
                    minutes.unsigned_abs(), account.free_minutes
                )));
            }
            (0, minutes, 0)
        }
        Delta::Debit { amount } => {
            if amount <= 0 {
                return Err(TelephonyError::validation("debit amount must be positive"));
            }
            let available = spendable(account.funds, policy);
            if amount > available {
                return Err(TelephonyError::InsufficientFunds {
                    requested: amount,
                    available,
                });
            }
            (-amount, 0, 0)
        }
    };

    Ok(NewLedgerEntry {
        account_key: account.account_key.clone(),
        idempotency_key: idempotency_key.to_string(),
        kind: delta.kind(),
        reason: reason.to_string(),
        funds_delta,
        free_minutes_delta,
        uncollected,
        funds_after: account
            .funds
            .checked_add(funds_delta)
            .ok_or_else(|| out_of_range("balance"))?,
        free_minutes_after: account
            .free_minutes
            .checked_add(free_minutes_delta)
            .ok_or_else(|| out_of_range("free minutes"))?,
    })
}

/// Transactional balance ledger
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    locks: KeyedLocks,
    policy: BillingConfig,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, policy: BillingConfig) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &BillingConfig {
        &self.policy
    }

    /// Account a call on `number` is charged to, per the configured scope
    pub fn account_for(&self, tenant_id: TenantId, number: &str) -> AccountKey {
        match self.policy.scope {
            BalanceScope::Tenant => AccountKey::tenant(tenant_id),
            BalanceScope::Number => AccountKey::number(tenant_id, number),
        }
    }

    /// Atomically apply `delta`. Re-applying an idempotency key returns the
    /// original entry with `duplicate = true`.
    pub async fn apply_delta(
        &self,
        account: &AccountKey,
        delta: Delta,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<LedgerOutcome> {
        let span = LogContext::with_operation("ledger", "apply_delta")
            .with_field("account", &account.key)
            .with_field("idempotency_key", idempotency_key)
            .span(tracing::Level::DEBUG);
        self.apply_locked(account, delta, reason, idempotency_key)
            .instrument(span)
            .await
    }

    async fn apply_locked(
        &self,
        account: &AccountKey,
        delta: Delta,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<LedgerOutcome> {
        let _guard = self.locks.lock(&account.key).await;

        if let Some(existing) = self.store.find_entry(idempotency_key).await? {
            info!(idempotency_key, "Duplicate ledger delta ignored");
            return Ok(LedgerOutcome {
                entry: existing,
                duplicate: true,
            });
        }

        for attempt in 1..=MAX_COMMIT_RETRIES {
            let current = self.load_or_open(account).await?;
            let entry = compute_entry(&current, delta, &self.policy, reason, idempotency_key)?;
            let next = LedgerAccount {
                funds: entry.funds_after,
                free_minutes: entry.free_minutes_after,
                version: current.version + 1,
                updated_at: Utc::now(),
                ..current.clone()
            };

            match self.store.commit_entry(Some(current.version), &next, &entry).await {
                Ok(committed) => {
                    debug!(
                        funds_after = committed.funds_after,
                        free_minutes_after = committed.free_minutes_after,
                        "Ledger delta applied"
                    );
                    if committed.uncollected > 0 {
                        warn!(
                            uncollected = committed.uncollected,
                            "Usage exceeded balance, remainder left uncollected"
                        );
                    }
                    return Ok(LedgerOutcome {
                        entry: committed,
                        duplicate: false,
                    });
                }
                Err(TelephonyError::DuplicateEvent { key }) => {
                    info!(idempotency_key = %key, "Duplicate ledger delta ignored");
                    let existing = self
                        .store
                        .find_entry(&key)
                        .await?
                        .ok_or_else(|| TelephonyError::internal("duplicate entry vanished"))?;
                    return Ok(LedgerOutcome {
                        entry: existing,
                        duplicate: true,
                    });
                }
                Err(TelephonyError::Conflict { message }) if attempt < MAX_COMMIT_RETRIES => {
                    debug!(attempt, %message, "Ledger account moved, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TelephonyError::conflict(format!(
            "ledger account {} kept changing during commit",
            account.key
        )))
    }

    /// Fail with `InsufficientFunds` unless `minutes` can be covered now
    pub async fn authorize_minutes(&self, account: &AccountKey, minutes: i64) -> Result<()> {
        let view = self.balance(account).await?;
        if view.available_minutes < minutes {
            return Err(TelephonyError::InsufficientFunds {
                requested: minutes,
                available: view.available_minutes,
            });
        }
        Ok(())
    }

    /// Current balance, read from the store (never cached)
    pub async fn balance(&self, account: &AccountKey) -> Result<BalanceView> {
        let current = match self.store.get_account(&account.key).await? {
            Some(current) => current,
            None => self.unopened(account),
        };
        Ok(BalanceView {
            available_minutes: available_minutes(&current, &self.policy),
            account_key: current.account_key,
            tenant_id: current.tenant_id,
            funds: current.funds,
            free_minutes: current.free_minutes,
            rate_per_minute: self.policy.rate_per_minute,
            allow_overage: self.policy.allow_overage,
            updated_at: current.updated_at,
        })
    }

    pub async fn available_minutes(&self, account: &AccountKey) -> Result<i64> {
        Ok(self.balance(account).await?.available_minutes)
    }

    pub async fn entries(&self, account: &AccountKey) -> Result<Vec<LedgerEntry>> {
        self.store.list_entries(&account.key).await
    }

    /// Recompute the account from its entries and compare
    pub async fn audit(&self, account: &AccountKey) -> Result<LedgerAudit> {
        let entries = self.store.list_entries(&account.key).await?;
        let stored = self
            .store
            .get_account(&account.key)
            .await?
            .ok_or_else(|| TelephonyError::not_found(format!("ledger account {}", account.key)))?;

        let replayed_funds: Money = entries.iter().map(|e| e.funds_delta).sum();
        let replayed_free_minutes: i64 = entries.iter().map(|e| e.free_minutes_delta).sum();
        let total_uncollected: Money = entries.iter().map(|e| e.uncollected).sum();
        let consistent =
            replayed_funds == stored.funds && replayed_free_minutes == stored.free_minutes;
        if !consistent {
            warn!(account = %account.key, "Ledger replay does not match stored account");
        }

        Ok(LedgerAudit {
            account_key: account.key.clone(),
            entries: entries.len(),
            stored_funds: stored.funds,
            replayed_funds,
            stored_free_minutes: stored.free_minutes,
            replayed_free_minutes,
            total_uncollected,
            consistent,
        })
    }

    /// What an account looks like right before it is opened
    fn unopened(&self, account: &AccountKey) -> LedgerAccount {
        LedgerAccount {
            account_key: account.key.clone(),
            tenant_id: account.tenant_id,
            funds: 0,
            free_minutes: self.policy.free_minutes,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Load the account, opening it with the free-minute grant on first use.
    /// Caller holds the account lock.
    async fn load_or_open(&self, account: &AccountKey) -> Result<LedgerAccount> {
        if let Some(current) = self.store.get_account(&account.key).await? {
            return Ok(current);
        }

        let opened = LedgerAccount {
            version: 1,
            ..self.unopened(account)
        };
        let entry = NewLedgerEntry {
            account_key: account.key.clone(),
            idempotency_key: format!("open:{}", account.key),
            kind: EntryKind::Open,
            reason: "account opened".to_string(),
            funds_delta: 0,
            free_minutes_delta: opened.free_minutes,
            uncollected: 0,
            funds_after: 0,
            free_minutes_after: opened.free_minutes,
        };

        match self.store.commit_entry(None, &opened, &entry).await {
            Ok(_) => {
                info!(account = %account.key, free_minutes = opened.free_minutes, "Ledger account opened");
                Ok(opened)
            }
            // Opened by another writer in the meantime
            Err(TelephonyError::DuplicateEvent { .. }) | Err(TelephonyError::Conflict { .. }) => self
                .store
                .get_account(&account.key)
                .await?
                .ok_or_else(|| TelephonyError::internal("ledger account open raced and vanished")),
            Err(e) => Err(e),
        }
    }
}
