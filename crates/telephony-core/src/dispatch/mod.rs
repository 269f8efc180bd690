//! # Notification Dispatcher
//!
//! Fans a call event out to notification channels and user functions. Sinks
//! are delivered concurrently and independently: each one runs under its own
//! [`RetryPolicy`] and ends up with a [`SinkStatus`] in the returned
//! [`DispatchReport`]. Sink failures never fail the dispatch itself.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use dialtone_infra_common::{retry_with_policy, AttemptError, AttemptFailure, RetryOutcome, RetryPolicy};

use crate::types::{
    CallDirection, CallRecord, CallStatus, Money, NotificationChannel, TenantId, UserFunction,
};

pub mod format;
pub mod sinks;

pub use sinks::{HttpSinkFactory, Sink, SinkError, SinkFactory};

/// Call-completed notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub tenant_id: TenantId,
    pub call_id: String,
    pub line_number: String,
    pub caller: String,
    pub callee: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub duration_secs: i64,
    pub billed_minutes: i64,
    pub cost: Money,
    pub started_at: DateTime<Utc>,
    pub transcript: Option<String>,
    pub assistant_id: Option<String>,
}

impl NotificationEvent {
    pub fn from_record(record: &CallRecord) -> Self {
        Self {
            tenant_id: record.tenant_id,
            call_id: record.call_id.clone(),
            line_number: record.line_number.clone(),
            caller: record.caller.clone(),
            callee: record.callee.clone(),
            direction: record.direction,
            status: record.status,
            duration_secs: record.duration_secs,
            billed_minutes: record.billed_minutes,
            cost: record.cost,
            started_at: record.started_at,
            transcript: record.transcript.clone(),
            assistant_id: record.assistant_id.clone(),
        }
    }

    /// JSON arguments handed to user functions
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "event": "call_completed",
            "tenant_id": self.tenant_id,
            "call_id": self.call_id,
            "line_number": self.line_number,
            "caller": self.caller,
            "callee": self.callee,
            "direction": self.direction,
            "status": self.status,
            "duration_secs": self.duration_secs,
            "billed_minutes": self.billed_minutes,
            "cost": self.cost,
            "started_at": self.started_at.to_rfc3339(),
            "transcript": self.transcript,
            "assistant_id": self.assistant_id,
        })
    }
}

/// Final delivery state of one sink for one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SinkStatus {
    Delivered { attempts: u32 },
    /// Retries or budget exhausted
    Failed { attempts: u32, reason: String },
    /// Sink refused the payload; not retried
    Rejected { reason: String },
    /// Channel is inactive
    Skipped,
}

impl SinkStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SinkStatus::Delivered { .. })
    }
}

/// Per-sink statuses keyed by channel or function id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub statuses: BTreeMap<String, SinkStatus>,
}

impl DispatchReport {
    pub fn get(&self, sink_id: &str) -> Option<&SinkStatus> {
        self.statuses.get(sink_id)
    }

    pub fn delivered(&self) -> usize {
        self.statuses.values().filter(|s| s.is_success()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

pub struct NotificationDispatcher {
    factory: Arc<dyn SinkFactory>,
    policy: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(factory: Arc<dyn SinkFactory>, policy: RetryPolicy) -> Self {
        Self { factory, policy }
    }

    /// Deliver `event` to every sink; always returns a status per sink
    pub async fn dispatch(
        &self,
        event: &NotificationEvent,
        channels: &[NotificationChannel],
        functions: &[UserFunction],
    ) -> DispatchReport {
        let mut statuses = BTreeMap::new();
        let mut targets: Vec<(String, Arc<dyn Sink>)> = Vec::new();

        for channel in channels {
            if channel.active {
                targets.push((channel.id.clone(), self.factory.channel_sink(channel)));
            } else {
                debug!(sink = %channel.id, "Channel inactive, skipped");
                statuses.insert(channel.id.clone(), SinkStatus::Skipped);
            }
        }
        for function in functions {
            targets.push((function.id.clone(), self.factory.function_sink(function)));
        }

        let deliveries = targets.into_iter().map(|(id, sink)| async move {
            let status = self.deliver_one(&id, sink.as_ref(), event).await;
            (id, status)
        });
        statuses.extend(join_all(deliveries).await);

        info!(
            call_id = %event.call_id,
            sinks = statuses.len(),
            delivered = statuses.values().filter(|s| s.is_success()).count(),
            "Dispatch finished"
        );
        DispatchReport { statuses }
    }

    async fn deliver_one(&self, id: &str, sink: &dyn Sink, event: &NotificationEvent) -> SinkStatus {
        let outcome = retry_with_policy(&self.policy, |attempt| async move {
            debug!(sink = %id, kind = sink.kind(), attempt, "Delivering notification");
            sink.deliver(event).await.map_err(|e| {
                if e.retryable {
                    AttemptError::Retryable(e)
                } else {
                    AttemptError::Permanent(e)
                }
            })
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => SinkStatus::Delivered { attempts },
            RetryOutcome::Rejected { error, .. } => {
                warn!(sink = %id, kind = sink.kind(), reason = %error, "Notification rejected");
                SinkStatus::Rejected { reason: error.reason }
            }
            RetryOutcome::Exhausted { last, attempts } => {
                let reason = match last {
                    AttemptFailure::Error(e) => e.reason,
                    AttemptFailure::TimedOut => "timed out".to_string(),
                };
                warn!(sink = %id, kind = sink.kind(), attempts, %reason, "Notification failed after retries");
                SinkStatus::Failed { attempts, reason }
            }
        }
    }
}
