//! # Call Event Ingestor
//!
//! Turns carrier call events into ledger deltas and immutable call records.
//!
//! Carrier delivery is at-least-once, so everything here is idempotent on
//! the call id: the usage delta uses the idempotency key `call:<id>` and the
//! record insert is unique on the call id. A failed event is retried and,
//! once retries run out, parked in the dead-letter store for
//! [`CallEventIngestor::replay_dead_letters`].
//!
//! Billing rounds the duration up to whole minutes; a 0 s call bills nothing.
//!
//! Notifications are queued with the record and cleared once dispatched, so
//! an attempt that fails after the insert, or a replayed dead letter, still
//! notifies the line's sinks.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

use dialtone_infra_common::{
    retry_with_policy, AttemptError, AttemptFailure, KeyedLocks, LogContext, RetryOutcome,
    RetryPolicy,
};

use crate::cache::CatalogCache;
use crate::dispatch::{DispatchReport, NotificationDispatcher, NotificationEvent};
use crate::error::{Result, TelephonyError};
use crate::ledger::{Delta, Ledger, LedgerOutcome};
use crate::store::{ActiveCall, CallRecordStore, DeadLetterStore, NumberStore};
use crate::types::{
    CallDirection, CallEndedEvent, CallRecord, CallStartedEvent, CallStatus, Money,
    NewCallRecord, NotificationChannel, NumberStatus, TenantId, UserFunction,
};

const CALL_ENDED_KIND: &str = "call_ended";

/// Longest call duration accepted from the carrier (one week)
pub const MAX_CALL_DURATION_SECS: i64 = 7 * 24 * 60 * 60;

/// Whole minutes billed for a call, rounding up
pub fn billed_minutes(duration_secs: i64) -> i64 {
    if duration_secs <= 0 {
        0
    } else {
        duration_secs / 60 + i64::from(duration_secs % 60 != 0)
    }
}

/// Retry used for ledger and record writes of one event
pub fn default_ingest_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        attempt_timeout: Duration::from_secs(10),
        total_budget: Duration::from_secs(30),
        jitter: true,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub record: CallRecord,
    /// The call had already been ingested; nothing was charged
    pub duplicate: bool,
    /// Present when the line's routing had sinks to notify
    pub dispatch: Option<DispatchReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    /// Replayed calls whose notification went out to the line's sinks
    pub notified: usize,
}

pub struct CallEventIngestor {
    numbers: Arc<dyn NumberStore>,
    records: Arc<dyn CallRecordStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    ledger: Arc<Ledger>,
    cache: Arc<CatalogCache>,
    dispatcher: Arc<NotificationDispatcher>,
    locks: KeyedLocks,
    retry: RetryPolicy,
}

impl CallEventIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        numbers: Arc<dyn NumberStore>,
        records: Arc<dyn CallRecordStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        ledger: Arc<Ledger>,
        cache: Arc<CatalogCache>,
        dispatcher: Arc<NotificationDispatcher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            numbers,
            records,
            dead_letters,
            ledger,
            cache,
            dispatcher,
            locks: KeyedLocks::new(),
            retry,
        }
    }

    /// Remember a call in progress. Returns `false` for a redelivered event.
    pub async fn on_call_started(&self, event: &CallStartedEvent) -> Result<bool> {
        if event.call_id.trim().is_empty() {
            return Err(TelephonyError::validation("call_id is required"));
        }
        let line = match event.direction {
            CallDirection::Inbound => &event.callee,
            CallDirection::Outbound => &event.caller,
        };
        let tenant_id = self.numbers.get_number(line).await?.and_then(|n| n.tenant_id);
        let inserted = self
            .records
            .insert_active_call(&ActiveCall {
                call_id: event.call_id.clone(),
                tenant_id,
                caller: event.caller.clone(),
                callee: event.callee.clone(),
                started_at: event.timestamp,
            })
            .await?;
        if inserted {
            debug!(call_id = %event.call_id, ?tenant_id, "Call started");
        } else {
            info!(call_id = %event.call_id, "Duplicate call-started event ignored");
        }
        Ok(inserted)
    }

    /// Bill and record a finished call, then notify the line's sinks
    pub async fn on_call_ended(&self, event: &CallEndedEvent) -> Result<IngestOutcome> {
        if event.call_id.trim().is_empty() {
            return Err(TelephonyError::validation("call_id is required"));
        }
        if event.duration_secs < 0 {
            return Err(TelephonyError::validation("duration_secs must not be negative"));
        }
        if event.duration_secs > MAX_CALL_DURATION_SECS {
            return Err(TelephonyError::validation(format!(
                "duration_secs {} exceeds the {} s limit",
                event.duration_secs, MAX_CALL_DURATION_SECS
            )));
        }
        let span = LogContext::with_operation("ingest", "call_ended")
            .with_field("call_id", &event.call_id)
            .span(tracing::Level::INFO);
        self.ingest_with_retry(event).instrument(span).await
    }

    async fn ingest_with_retry(&self, event: &CallEndedEvent) -> Result<IngestOutcome> {
        let wrote = AtomicBool::new(false);
        let wrote = &wrote;
        let outcome = retry_with_policy(&self.retry, |attempt| async move {
            if attempt > 1 {
                debug!(attempt, "Retrying call-ended event");
            }
            self.ingest(event, wrote).await.map_err(|e| {
                if e.is_transient() {
                    AttemptError::Retryable(e)
                } else {
                    AttemptError::Permanent(e)
                }
            })
        })
        .await;

        let (err, attempts) = match outcome {
            RetryOutcome::Succeeded { value, .. } => {
                return Ok(self.notify(value).await);
            }
            RetryOutcome::Rejected { error, attempts } => (error, attempts),
            RetryOutcome::Exhausted { last, attempts } => match last {
                AttemptFailure::Error(e) => (e, attempts),
                AttemptFailure::TimedOut => (
                    TelephonyError::UpstreamTimeout {
                        operation: "call-ended ingestion".into(),
                        millis: self.retry.attempt_timeout.as_millis() as u64,
                    },
                    attempts,
                ),
            },
        };

        if !matches!(err, TelephonyError::Validation { .. }) {
            let payload = serde_json::to_value(event)?;
            let id = self
                .dead_letters
                .push_dead_letter(CALL_ENDED_KIND, &event.call_id, &payload, &err.to_string())
                .await?;
            error!(call_id = %event.call_id, dead_letter = id, attempts, error = %err, "Call-ended event dead-lettered");
        }
        Err(err)
    }

    /// One attempt: charge and record under the call lock. `wrote` is set
    /// once this delivery has issued the record insert, so a retry that
    /// finds the record is not reported as a duplicate.
    async fn ingest(&self, event: &CallEndedEvent, wrote: &AtomicBool) -> Result<Ingested> {
        let _guard = self.locks.lock(&format!("call:{}", event.call_id)).await;

        if let Some(existing) = self.records.get_call_record(&event.call_id).await? {
            let duplicate = !wrote.load(Ordering::SeqCst);
            if duplicate {
                info!(call_id = %event.call_id, "Duplicate call-ended event ignored");
            }
            return Ok(Ingested {
                record: existing,
                duplicate,
            });
        }

        let line = event.line_number();
        let row = self.numbers.get_number(line).await?;
        // The owner at call start wins over the current owner
        let started_by = self
            .records
            .get_active_call(&event.call_id)
            .await?
            .and_then(|c| c.tenant_id);
        let tenant_id = started_by
            .or_else(|| row.as_ref().and_then(|r| r.tenant_id))
            .ok_or_else(|| TelephonyError::not_found(format!("tenant for line {}", line)))?;
        let connected = row
            .as_ref()
            .is_some_and(|r| r.status == NumberStatus::Connected && r.tenant_id == Some(tenant_id));
        let assistant_id = row
            .as_ref()
            .and_then(|r| r.routing.as_ref())
            .and_then(|r| r.assistant_id.clone());

        let status = match (event.status, event.duration_secs) {
            (CallStatus::Answered, 0) => CallStatus::Missed,
            (status, _) => status,
        };
        let minutes = billed_minutes(event.duration_secs);
        let rate = self.ledger.policy().rate_per_minute;

        let (free_minutes_used, cost) = if minutes > 0 {
            let account = self.ledger.account_for(tenant_id, line);
            let LedgerOutcome { entry, duplicate } = self
                .ledger
                .apply_delta(
                    &account,
                    Delta::Usage { minutes, rate },
                    &format!("call {}", event.call_id),
                    &format!("call:{}", event.call_id),
                )
                .await?;
            if duplicate {
                // Charged by an earlier attempt whose record insert failed
                debug!(call_id = %event.call_id, "Usage already on the ledger");
            }
            (entry.free_minutes_used(), entry.charged())
        } else {
            (0, 0)
        };

        let new_record = NewCallRecord {
            call_id: event.call_id.clone(),
            tenant_id,
            line_number: line.to_string(),
            caller: event.caller.clone(),
            callee: event.callee.clone(),
            direction: event.direction,
            status,
            started_at: event.timestamp,
            duration_secs: event.duration_secs,
            billed_minutes: minutes,
            free_minutes_used,
            rate_per_minute: rate,
            cost,
            transcript: event.transcript.clone(),
            assistant_id,
            notify: connected,
        };
        wrote.store(true, Ordering::SeqCst);
        let ingested = match self.records.insert_call_record(&new_record).await? {
            Some(record) => {
                info!(
                    call_id = %record.call_id,
                    tenant_id,
                    billed_minutes = minutes,
                    free_minutes_used,
                    cost,
                    "Call recorded"
                );
                Ingested {
                    record,
                    duplicate: false,
                }
            }
            None => {
                let existing = self
                    .records
                    .get_call_record(&event.call_id)
                    .await?
                    .ok_or_else(|| TelephonyError::internal("call record vanished after conflict"))?;
                Ingested {
                    record: existing,
                    duplicate: true,
                }
            }
        };
        Ok(ingested)
    }

    /// Dispatch a queued notification. Sink trouble never fails ingestion.
    async fn notify(&self, ingested: Ingested) -> IngestOutcome {
        let Ingested { record, duplicate } = ingested;
        let dispatch = match self.dispatch_pending(&record).await {
            Ok(report) => report,
            Err(e) => {
                // Stays queued; the next delivery of this call tries again
                warn!(call_id = %record.call_id, error = %e, "Notification not dispatched");
                None
            }
        };
        IngestOutcome {
            record,
            duplicate,
            dispatch,
        }
    }

    async fn dispatch_pending(&self, record: &CallRecord) -> Result<Option<DispatchReport>> {
        let _guard = self.locks.lock(&format!("notify:{}", record.call_id)).await;
        if !self.records.notification_pending(&record.call_id).await? {
            return Ok(None);
        }
        let report = match self.route(record).await? {
            Some((channels, functions)) => {
                let event = NotificationEvent::from_record(record);
                Some(self.dispatcher.dispatch(&event, &channels, &functions).await)
            }
            None => None,
        };
        self.records.clear_pending_notification(&record.call_id).await?;
        Ok(report)
    }

    async fn route(
        &self,
        record: &CallRecord,
    ) -> Result<Option<(Vec<NotificationChannel>, Vec<UserFunction>)>> {
        let Some(line) = self.cache.line(record.tenant_id, &record.line_number).await? else {
            return Ok(None);
        };
        if line.status != NumberStatus::Connected {
            return Ok(None);
        }
        let Some(routing) = line.routing.as_ref().filter(|r| r.has_sinks()) else {
            return Ok(None);
        };
        let catalog = self.cache.catalog(record.tenant_id).await?;
        Ok(Some(catalog.resolve(routing)))
    }

    /// Credit a call back without touching its record
    pub async fn compensate(
        &self,
        tenant_id: TenantId,
        call_id: &str,
        amount: Money,
        reason: &str,
    ) -> Result<LedgerOutcome> {
        if amount <= 0 {
            return Err(TelephonyError::validation("compensation amount must be positive"));
        }
        let record = self
            .records
            .get_call_record(call_id)
            .await?
            .ok_or_else(|| TelephonyError::not_found(format!("call {}", call_id)))?;
        if record.tenant_id != tenant_id {
            return Err(TelephonyError::unauthorized(format!(
                "call {} does not belong to tenant {}",
                call_id, tenant_id
            )));
        }
        let account = self.ledger.account_for(tenant_id, &record.line_number);
        let outcome = self
            .ledger
            .apply_delta(
                &account,
                Delta::Adjustment { amount },
                reason,
                &format!("compensation:{}", call_id),
            )
            .await?;
        if !outcome.duplicate {
            info!(call_id, tenant_id, amount, "Call compensated");
        }
        Ok(outcome)
    }

    /// Re-drive parked events; successes are removed from the dead-letter store
    pub async fn replay_dead_letters(&self, limit: u32) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        for letter in self.dead_letters.list_dead_letters(limit).await? {
            let result = match letter.kind.as_str() {
                CALL_ENDED_KIND => match serde_json::from_value::<CallEndedEvent>(letter.payload.clone()) {
                    Ok(event) => self.ingest(&event, &AtomicBool::new(false)).await,
                    Err(e) => Err(TelephonyError::from(e)),
                },
                other => Err(TelephonyError::internal(format!("unknown dead letter kind '{}'", other))),
            };
            match result {
                Ok(ingested) => {
                    self.dead_letters.delete_dead_letter(letter.id).await?;
                    info!(dead_letter = letter.id, call_id = %ingested.record.call_id, "Dead letter replayed");
                    report.replayed += 1;
                    if self.notify(ingested).await.dispatch.is_some() {
                        report.notified += 1;
                    }
                }
                Err(e) => {
                    self.dead_letters
                        .record_dead_letter_failure(letter.id, &e.to_string())
                        .await?;
                    warn!(dead_letter = letter.id, error = %e, "Dead letter replay failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

struct Ingested {
    record: CallRecord,
    duplicate: bool,
}
