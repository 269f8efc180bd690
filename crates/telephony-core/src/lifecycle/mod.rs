//! # Number Lifecycle Manager
//!
//! State machine per phone number:
//!
//! ```text
//! Available ──connect──▶ Connecting ──carrier ok──▶ Connected
//!     ▲                      │                          │
//!     └──── carrier failed ──┘                      disconnect
//!                                                       ▼
//! Disconnected ◀──carrier ok── Disconnecting ◀──────────┘
//! ```
//!
//! `Available` and `Disconnected` are idle; a disconnected number can be
//! connected again. Carrier calls run under a timeout while the per-number
//! locks are held. A timed-out call leaves the number in its transient state
//! for [`reconcile`] to settle; nothing is assumed successful without carrier
//! confirmation.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use dialtone_infra_common::{KeyedLocks, LogContext};

use crate::cache::{CatalogCache, Invalidation};
use crate::carrier::{CarrierClient, CarrierOutcome};
use crate::error::{Result, TelephonyError};
use crate::store::{CatalogStore, NumberStore};
use crate::types::{NumberStatus, PhoneNumber, RoutingConfig, TenantId, E164};

pub mod reconcile;

pub use reconcile::Reconciler;

const MAX_PROMPT_LEN: usize = 4000;

/// Outcome for one number of a connect batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectStatus {
    /// Newly connected
    Connected,
    /// Was already connected to this tenant; nothing changed
    AlreadyConnected,
    /// Carrier did not confirm in time; left `Connecting` for reconciliation
    Pending,
    /// Carrier refused; rolled back to the previous idle state
    Failed { reason: String },
    /// Held by another tenant
    Conflict,
    /// Not a valid E.164 number
    Invalid { reason: String },
}

impl ConnectStatus {
    pub fn message(&self) -> String {
        match self {
            ConnectStatus::Connected => "connected".to_string(),
            ConnectStatus::AlreadyConnected => "already connected".to_string(),
            ConnectStatus::Pending => "awaiting carrier confirmation".to_string(),
            ConnectStatus::Failed { reason } => format!("failed: {}", reason),
            ConnectStatus::Conflict => "owned by another tenant".to_string(),
            ConnectStatus::Invalid { reason } => reason.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConnectStatus::Connected | ConnectStatus::AlreadyConnected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NumberResult {
    pub number: String,
    #[serde(flatten)]
    pub status: ConnectStatus,
    pub message: String,
}

impl NumberResult {
    fn new(number: impl Into<String>, status: ConnectStatus) -> Self {
        let message = status.message();
        Self {
            number: number.into(),
            status,
            message,
        }
    }
}

/// Per-number results of [`NumberLifecycleManager::connect`], in request order
#[derive(Debug, Clone, Serialize)]
pub struct ConnectReport {
    pub results: Vec<NumberResult>,
}

impl ConnectReport {
    pub fn status_of(&self, number: &str) -> Option<&ConnectStatus> {
        self.results
            .iter()
            .find(|r| r.number == number)
            .map(|r| &r.status)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status.is_success())
    }

    /// Some numbers succeeded and some did not
    pub fn is_partial(&self) -> bool {
        let ok = self.results.iter().filter(|r| r.status.is_success()).count();
        ok > 0 && ok < self.results.len()
    }

    /// Summary for the dashboard, e.g. "partially done: 1 connected, 1 owned by another tenant"
    pub fn summary(&self) -> String {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for result in &self.results {
            let label = match &result.status {
                ConnectStatus::Failed { .. } => "failed".to_string(),
                ConnectStatus::Invalid { .. } => "invalid".to_string(),
                other => other.message(),
            };
            *counts.entry(label).or_default() += 1;
        }
        let parts: Vec<String> = counts
            .iter()
            .map(|(label, n)| format!("{} {}", n, label))
            .collect();

        if self.results.iter().all(|r| r.status == ConnectStatus::AlreadyConnected) {
            "already connected".to_string()
        } else if self.all_succeeded() {
            format!("done: {}", parts.join(", "))
        } else if self.is_partial() {
            format!("partially done: {}", parts.join(", "))
        } else {
            format!("not done: {}", parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectOutcome {
    Disconnected,
    AlreadyDisconnected,
    /// Carrier did not confirm in time; left `Disconnecting` for reconciliation
    Pending,
}

impl DisconnectOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            DisconnectOutcome::Disconnected => "disconnected",
            DisconnectOutcome::AlreadyDisconnected => "already disconnected",
            DisconnectOutcome::Pending => "awaiting carrier confirmation",
        }
    }
}

pub(crate) fn number_lock_key(number: &str) -> String {
    format!("number:{}", number)
}

/// Owns every phone number state transition
pub struct NumberLifecycleManager {
    numbers: Arc<dyn NumberStore>,
    catalog: Arc<dyn CatalogStore>,
    carrier: Arc<dyn CarrierClient>,
    cache: Arc<CatalogCache>,
    locks: KeyedLocks,
    carrier_timeout: Duration,
}

impl NumberLifecycleManager {
    pub fn new(
        numbers: Arc<dyn NumberStore>,
        catalog: Arc<dyn CatalogStore>,
        carrier: Arc<dyn CarrierClient>,
        cache: Arc<CatalogCache>,
        carrier_timeout: Duration,
    ) -> Self {
        Self {
            numbers,
            catalog,
            carrier,
            cache,
            locks: KeyedLocks::new(),
            carrier_timeout,
        }
    }

    /// Connect a batch of numbers to `tenant_id`.
    ///
    /// Idempotent per number. Numbers are locked in sorted order and all
    /// connectable ones go to the carrier in a single request.
    pub async fn connect(&self, tenant_id: TenantId, requested: &[String]) -> Result<ConnectReport> {
        if requested.is_empty() {
            return Err(TelephonyError::validation("no numbers to connect"));
        }
        let span = LogContext::with_operation("lifecycle", "connect")
            .with_field("tenant_id", tenant_id)
            .with_field("count", requested.len())
            .span(tracing::Level::INFO);
        self.connect_batch(tenant_id, requested).instrument(span).await
    }

    async fn connect_batch(&self, tenant_id: TenantId, requested: &[String]) -> Result<ConnectReport> {
        let mut outcomes: BTreeMap<String, ConnectStatus> = BTreeMap::new();
        let mut order: Vec<String> = Vec::with_capacity(requested.len());
        let mut valid: BTreeSet<E164> = BTreeSet::new();
        for raw in requested {
            match E164::parse(raw) {
                Ok(number) => {
                    order.push(number.to_string());
                    valid.insert(number);
                }
                Err(e) => {
                    order.push(raw.clone());
                    outcomes.insert(raw.clone(), ConnectStatus::Invalid { reason: e.to_string() });
                }
            }
        }

        let _guards = self
            .locks
            .lock_many(valid.iter().map(|n| number_lock_key(n.as_str())))
            .await;

        // Rows moved to Connecting, with the state to roll back to
        let mut pending: Vec<(PhoneNumber, PhoneNumber)> = Vec::new();
        for number in &valid {
            let current = self
                .numbers
                .get_number(number.as_str())
                .await?
                .unwrap_or_else(|| PhoneNumber::new(number.clone()));

            if current.is_held_by_other(tenant_id) {
                outcomes.insert(number.to_string(), ConnectStatus::Conflict);
                continue;
            }
            match current.status {
                NumberStatus::Connected => {
                    outcomes.insert(number.to_string(), ConnectStatus::AlreadyConnected);
                }
                NumberStatus::Connecting => {
                    outcomes.insert(number.to_string(), ConnectStatus::Pending);
                }
                NumberStatus::Disconnecting => {
                    outcomes.insert(
                        number.to_string(),
                        ConnectStatus::Failed { reason: "disconnect still in progress".into() },
                    );
                }
                NumberStatus::Available | NumberStatus::Disconnected => {
                    let mut next = current.clone();
                    next.tenant_id = Some(tenant_id);
                    next.status = NumberStatus::Connecting;
                    next.routing = None;
                    next.updated_at = Utc::now();
                    self.numbers.upsert_number(&next).await?;
                    pending.push((current, next));
                }
            }
        }

        if !pending.is_empty() {
            let batch: Vec<E164> = pending.iter().map(|(_, next)| next.number.clone()).collect();
            let call = self.carrier.connect_numbers(tenant_id, &batch);
            match tokio::time::timeout(self.carrier_timeout, call).await {
                Ok(Ok(results)) => {
                    let by_number: BTreeMap<String, CarrierOutcome> = results
                        .into_iter()
                        .map(|r| (r.number, r.outcome))
                        .collect();
                    for (previous, mut next) in pending {
                        let key = next.number.to_string();
                        let status = match by_number.get(&key) {
                            Some(CarrierOutcome::Connected) | Some(CarrierOutcome::AlreadyConnected) => {
                                next.status = NumberStatus::Connected;
                                next.updated_at = Utc::now();
                                self.numbers.upsert_number(&next).await?;
                                info!(number = %key, tenant_id, "Number connected");
                                ConnectStatus::Connected
                            }
                            Some(CarrierOutcome::Failed { reason }) => {
                                self.numbers.upsert_number(&previous).await?;
                                warn!(number = %key, tenant_id, %reason, "Carrier refused number");
                                ConnectStatus::Failed { reason: reason.clone() }
                            }
                            None => {
                                warn!(number = %key, "Carrier omitted number from batch answer");
                                ConnectStatus::Pending
                            }
                        };
                        outcomes.insert(key, status);
                    }
                }
                Ok(Err(TelephonyError::UpstreamTimeout { .. })) | Err(_) => {
                    warn!(tenant_id, count = pending.len(), "Carrier connect timed out, leaving numbers connecting");
                    for (_, next) in pending {
                        outcomes.insert(next.number.to_string(), ConnectStatus::Pending);
                    }
                }
                Ok(Err(e)) => {
                    warn!(tenant_id, error = %e, "Carrier connect failed, rolling back");
                    for (previous, next) in pending {
                        self.numbers.upsert_number(&previous).await?;
                        outcomes.insert(
                            next.number.to_string(),
                            ConnectStatus::Failed { reason: e.to_string() },
                        );
                    }
                }
            }
        }

        for number in &valid {
            self.cache.invalidate(Invalidation::Routing {
                tenant_id,
                number: number.to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        let results = order
            .into_iter()
            .filter(|n| seen.insert(n.clone()))
            .filter_map(|n| {
                let status = outcomes.remove(&n)?;
                Some(NumberResult::new(n, status))
            })
            .collect();
        let report = ConnectReport { results };
        debug!(summary = %report.summary(), "Connect finished");
        Ok(report)
    }

    /// Disconnect `number` from `tenant_id`. Calling it again once the
    /// number is disconnected reports `AlreadyDisconnected`.
    pub async fn disconnect(&self, tenant_id: TenantId, number: &str) -> Result<DisconnectOutcome> {
        let number = E164::parse(number)?;
        let _guard = self.locks.lock(&number_lock_key(number.as_str())).await;

        let mut row = self
            .numbers
            .get_number(number.as_str())
            .await?
            .ok_or_else(|| TelephonyError::not_found(format!("number {}", number)))?;
        if row.tenant_id != Some(tenant_id) {
            return Err(TelephonyError::unauthorized(format!(
                "number {} does not belong to tenant {}",
                number, tenant_id
            )));
        }

        match row.status {
            NumberStatus::Disconnected | NumberStatus::Available => {
                return Ok(DisconnectOutcome::AlreadyDisconnected)
            }
            NumberStatus::Disconnecting => return Ok(DisconnectOutcome::Pending),
            NumberStatus::Connecting => {
                return Err(TelephonyError::invalid_transition(format!(
                    "number {} is still connecting",
                    number
                )))
            }
            NumberStatus::Connected => {}
        }

        row.status = NumberStatus::Disconnecting;
        row.updated_at = Utc::now();
        self.numbers.upsert_number(&row).await?;

        let call = self.carrier.disconnect_number(tenant_id, &number);
        let outcome = match tokio::time::timeout(self.carrier_timeout, call).await {
            Ok(Ok(())) => {
                row.status = NumberStatus::Disconnected;
                row.routing = None;
                row.updated_at = Utc::now();
                self.numbers.upsert_number(&row).await?;
                info!(number = %number, tenant_id, "Number disconnected");
                Ok(DisconnectOutcome::Disconnected)
            }
            Ok(Err(TelephonyError::UpstreamTimeout { .. })) | Err(_) => {
                warn!(number = %number, tenant_id, "Carrier disconnect timed out, leaving number disconnecting");
                Ok(DisconnectOutcome::Pending)
            }
            Ok(Err(e)) => {
                row.status = NumberStatus::Connected;
                row.updated_at = Utc::now();
                self.numbers.upsert_number(&row).await?;
                warn!(number = %number, tenant_id, error = %e, "Carrier disconnect failed, still connected");
                Err(e)
            }
        };

        self.cache.invalidate(Invalidation::Routing {
            tenant_id,
            number: number.to_string(),
        });
        outcome
    }

    /// Replace the routing of a connected number
    pub async fn set_routing(
        &self,
        tenant_id: TenantId,
        number: &str,
        routing: RoutingConfig,
    ) -> Result<PhoneNumber> {
        let number = E164::parse(number)?;
        let _guard = self.locks.lock(&number_lock_key(number.as_str())).await;

        let mut row = self
            .numbers
            .get_number(number.as_str())
            .await?
            .ok_or_else(|| TelephonyError::not_found(format!("number {}", number)))?;
        if row.tenant_id != Some(tenant_id) {
            return Err(TelephonyError::unauthorized(format!(
                "number {} does not belong to tenant {}",
                number, tenant_id
            )));
        }
        if row.status != NumberStatus::Connected {
            return Err(TelephonyError::invalid_transition(format!(
                "routing can only be set on a connected number, {} is {}",
                number,
                row.status.as_str()
            )));
        }

        let routing = self.validate_routing(tenant_id, routing).await?;
        row.routing = Some(routing);
        row.updated_at = Utc::now();
        self.numbers.upsert_number(&row).await?;
        self.cache.invalidate(Invalidation::Routing {
            tenant_id,
            number: number.to_string(),
        });
        info!(number = %number, tenant_id, "Routing updated");
        Ok(row)
    }

    /// Numbers of a tenant; transient rows are re-checked against the carrier first
    pub async fn list_numbers(&self, tenant_id: TenantId) -> Result<Vec<PhoneNumber>> {
        let rows = self.numbers.list_numbers(tenant_id).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if row.status.is_transient() {
                match self.reconcile(&row.number).await {
                    Ok(Some(settled)) if settled.tenant_id == Some(tenant_id) => out.push(settled),
                    Ok(Some(_)) | Ok(None) => {}
                    Err(e) => {
                        debug!(number = %row.number, error = %e, "Reconcile on read failed");
                        out.push(row);
                    }
                }
            } else {
                out.push(row);
            }
        }
        Ok(out)
    }

    pub async fn get_number(&self, tenant_id: TenantId, number: &str) -> Result<PhoneNumber> {
        let number = E164::parse(number)?;
        let row = self
            .numbers
            .get_number(number.as_str())
            .await?
            .ok_or_else(|| TelephonyError::not_found(format!("number {}", number)))?;
        if row.tenant_id != Some(tenant_id) {
            return Err(TelephonyError::unauthorized(format!(
                "number {} does not belong to tenant {}",
                number, tenant_id
            )));
        }
        Ok(row)
    }

    /// Settle a transient number against carrier truth. Returns the row as it
    /// is afterwards, which is unchanged when the carrier cannot tell yet.
    pub async fn reconcile(&self, number: &E164) -> Result<Option<PhoneNumber>> {
        let _guard = self.locks.lock(&number_lock_key(number.as_str())).await;
        let Some(mut row) = self.numbers.get_number(number.as_str()).await? else {
            return Ok(None);
        };
        if !row.status.is_transient() {
            return Ok(Some(row));
        }

        let state = match tokio::time::timeout(self.carrier_timeout, self.carrier.line_state(number)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TelephonyError::UpstreamTimeout {
                    operation: "carrier line state".into(),
                    millis: self.carrier_timeout.as_millis() as u64,
                })
            }
        };
        let previous = row.status;
        reconcile::settle(&mut row, state);
        if row.status != previous {
            row.updated_at = Utc::now();
            self.numbers.upsert_number(&row).await?;
            if let Some(tenant_id) = row.tenant_id {
                self.cache.invalidate(Invalidation::Routing {
                    tenant_id,
                    number: number.to_string(),
                });
            }
            info!(number = %number, from = previous.as_str(), to = row.status.as_str(), "Number reconciled");
        }
        Ok(Some(row))
    }

    /// Reconcile every transient number; returns how many changed state
    pub async fn reconcile_pending(&self) -> Result<usize> {
        let transient = self.numbers.list_transient_numbers().await?;
        let mut settled = 0;
        for row in transient {
            match self.reconcile(&row.number).await {
                Ok(Some(after)) if after.status != row.status => settled += 1,
                Ok(_) => {}
                Err(e) => debug!(number = %row.number, error = %e, "Reconcile failed, will retry"),
            }
        }
        Ok(settled)
    }

    async fn validate_routing(&self, tenant_id: TenantId, mut routing: RoutingConfig) -> Result<RoutingConfig> {
        if let Some(prompt) = &routing.prompt {
            if prompt.chars().count() > MAX_PROMPT_LEN {
                return Err(TelephonyError::validation(format!(
                    "prompt is longer than {} characters",
                    MAX_PROMPT_LEN
                )));
            }
        }
        dedup_in_place(&mut routing.channel_ids);
        dedup_in_place(&mut routing.function_ids);

        if let Some(assistant_id) = &routing.assistant_id {
            match self.catalog.assistant_owner(assistant_id).await? {
                None => return Err(TelephonyError::not_found(format!("assistant {}", assistant_id))),
                Some(owner) if owner != tenant_id => {
                    return Err(TelephonyError::unauthorized(format!(
                        "assistant {} belongs to another tenant",
                        assistant_id
                    )))
                }
                Some(_) => {}
            }
        }
        for id in &routing.channel_ids {
            let channel = self
                .catalog
                .get_channel(id)
                .await?
                .ok_or_else(|| TelephonyError::not_found(format!("channel {}", id)))?;
            if channel.tenant_id != tenant_id {
                return Err(TelephonyError::unauthorized(format!(
                    "channel {} belongs to another tenant",
                    id
                )));
            }
        }
        for id in &routing.function_ids {
            let function = self
                .catalog
                .get_function(id)
                .await?
                .ok_or_else(|| TelephonyError::not_found(format!("function {}", id)))?;
            if function.tenant_id != tenant_id {
                return Err(TelephonyError::unauthorized(format!(
                    "function {} belongs to another tenant",
                    id
                )));
            }
        }
        Ok(routing)
    }
}

fn dedup_in_place(ids: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(statuses: Vec<ConnectStatus>) -> ConnectReport {
        ConnectReport {
            results: statuses
                .into_iter()
                .enumerate()
                .map(|(i, s)| NumberResult::new(format!("+7000111220{}", i), s))
                .collect(),
        }
    }

    #[test]
    fn summary_distinguishes_done_already_and_partial() {
        assert_eq!(
            report(vec![ConnectStatus::AlreadyConnected]).summary(),
            "already connected"
        );
        let partial = report(vec![
            ConnectStatus::Connected,
            ConnectStatus::AlreadyConnected,
            ConnectStatus::Conflict,
        ]);
        assert!(partial.is_partial());
        assert_eq!(
            partial.summary(),
            "partially done: 1 already connected, 1 connected, 1 owned by another tenant"
        );
        assert!(!report(vec![ConnectStatus::Conflict]).is_partial());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut ids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        dedup_in_place(&mut ids);
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }
}
