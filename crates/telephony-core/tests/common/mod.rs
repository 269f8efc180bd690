//! Shared helpers for telephony-core integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use dialtone_infra_common::RetryPolicy;
use dialtone_telephony_core::carrier::{
    CarrierClient, CarrierLineState, CarrierNumberResult, CarrierOutcome,
};
use dialtone_telephony_core::dispatch::{NotificationEvent, Sink, SinkError, SinkFactory};
use dialtone_telephony_core::types::{
    CallDirection, CallEndedEvent, CallStatus, NotificationChannel, TenantId, UserFunction, E164,
};
use dialtone_telephony_core::{Result, SqliteStore, TelephonyConfig, TelephonyService};

/// Carrier double with scripted answers
#[derive(Default)]
pub struct MockCarrier {
    refused: Mutex<HashMap<String, String>>,
    line_states: Mutex<HashMap<String, CarrierLineState>>,
    hang: AtomicBool,
    pub connect_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
}

impl MockCarrier {
    /// Refuse `number` on the next connect requests
    pub fn refuse(&self, number: &str, reason: &str) {
        self.refused.lock().insert(number.to_string(), reason.to_string());
    }

    /// Never answer until switched back
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_line_state(&self, number: &str, state: CarrierLineState) {
        self.line_states.lock().insert(number.to_string(), state);
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }
}

#[async_trait]
impl CarrierClient for MockCarrier {
    async fn connect_numbers(
        &self,
        _tenant_id: TenantId,
        numbers: &[E164],
    ) -> Result<Vec<CarrierNumberResult>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        let refused = self.refused.lock().clone();
        Ok(numbers
            .iter()
            .map(|n| CarrierNumberResult {
                number: n.to_string(),
                outcome: match refused.get(n.as_str()) {
                    Some(reason) => CarrierOutcome::Failed {
                        reason: reason.clone(),
                    },
                    None => CarrierOutcome::Connected,
                },
            })
            .collect())
    }

    async fn disconnect_number(&self, _tenant_id: TenantId, _number: &E164) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        Ok(())
    }

    async fn line_state(&self, number: &E164) -> Result<CarrierLineState> {
        Ok(self
            .line_states
            .lock()
            .get(number.as_str())
            .copied()
            .unwrap_or(CarrierLineState::Unknown))
    }
}

/// How a scripted sink answers
#[derive(Debug, Clone)]
pub enum Behaviour {
    Succeed,
    /// Never answers; every attempt hits the per-attempt timeout
    Hang,
    Reject(String),
    /// Fails retryably this many times, then succeeds
    Flaky(usize),
}

/// Sink factory keyed by channel/function id, counting attempts and deliveries
#[derive(Default)]
pub struct ScriptedSinks {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    attempts: Arc<Mutex<HashMap<String, usize>>>,
    delivered: Arc<Mutex<HashMap<String, Vec<NotificationEvent>>>>,
}

impl ScriptedSinks {
    pub fn script(&self, sink_id: &str, behaviour: Behaviour) {
        self.behaviours.lock().insert(sink_id.to_string(), behaviour);
    }

    pub fn attempts(&self, sink_id: &str) -> usize {
        self.attempts.lock().get(sink_id).copied().unwrap_or(0)
    }

    pub fn delivered(&self, sink_id: &str) -> Vec<NotificationEvent> {
        self.delivered.lock().get(sink_id).cloned().unwrap_or_default()
    }

    fn sink(&self, id: &str) -> Arc<dyn Sink> {
        let behaviour = self
            .behaviours
            .lock()
            .get(id)
            .cloned()
            .unwrap_or(Behaviour::Succeed);
        Arc::new(ScriptedSink {
            id: id.to_string(),
            behaviour,
            attempts: self.attempts.clone(),
            delivered: self.delivered.clone(),
        })
    }
}

impl SinkFactory for ScriptedSinks {
    fn channel_sink(&self, channel: &NotificationChannel) -> Arc<dyn Sink> {
        self.sink(&channel.id)
    }

    fn function_sink(&self, function: &UserFunction) -> Arc<dyn Sink> {
        self.sink(&function.id)
    }
}

struct ScriptedSink {
    id: String,
    behaviour: Behaviour,
    attempts: Arc<Mutex<HashMap<String, usize>>>,
    delivered: Arc<Mutex<HashMap<String, Vec<NotificationEvent>>>>,
}

#[async_trait]
impl Sink for ScriptedSink {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn deliver(&self, event: &NotificationEvent) -> std::result::Result<(), SinkError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(self.id.clone()).or_default();
            *n += 1;
            *n
        };
        match &self.behaviour {
            Behaviour::Succeed => {}
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Behaviour::Reject(reason) => return Err(SinkError::rejected(reason.clone())),
            Behaviour::Flaky(failures) if attempt <= *failures => {
                return Err(SinkError::retryable("temporarily unavailable"));
            }
            Behaviour::Flaky(_) => {}
        }
        self.delivered
            .lock()
            .entry(self.id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        attempt_timeout: Duration::from_millis(100),
        total_budget: Duration::from_secs(2),
        jitter: false,
    }
}

/// Ingestion writes queue on per-call locks; give each attempt room
pub fn ingest_retry() -> RetryPolicy {
    RetryPolicy {
        attempt_timeout: Duration::from_secs(5),
        total_budget: Duration::from_secs(20),
        ..fast_retry()
    }
}

pub struct Harness {
    pub service: TelephonyService,
    pub carrier: Arc<MockCarrier>,
    pub sinks: Arc<ScriptedSinks>,
    _dir: TempDir,
}

pub fn test_config() -> TelephonyConfig {
    let mut config = TelephonyConfig::default();
    config.carrier.timeout_ms = 200;
    config.reconcile.enabled = false;
    config.dispatch.max_attempts = 3;
    config.dispatch.initial_backoff_ms = 5;
    config.dispatch.max_backoff_ms = 20;
    config.dispatch.attempt_timeout_ms = 100;
    config.dispatch.total_budget_ms = 2000;
    config
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

/// Service over a file-backed SQLite database in a temp dir
pub async fn harness_with(mut config: TelephonyConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("telephony.db");
    config.database_url = format!("sqlite://{}?mode=rwc", db_path.display());

    let store = Arc::new(SqliteStore::new(&config.database_url).await.unwrap());
    let carrier = Arc::new(MockCarrier::default());
    let sinks = Arc::new(ScriptedSinks::default());
    let service = TelephonyService::new(config, store, carrier.clone(), sinks.clone(), ingest_retry());
    Harness {
        service,
        carrier,
        sinks,
        _dir: dir,
    }
}

impl Harness {
    /// Connect `number` to `tenant_id` and assert it went through
    pub async fn connect(&self, tenant_id: TenantId, number: &str) {
        let report = self
            .service
            .lifecycle
            .connect(tenant_id, &[number.to_string()])
            .await
            .unwrap();
        assert!(report.all_succeeded(), "connect failed: {}", report.summary());
    }
}

pub fn call_ended(call_id: &str, line: &str, duration_secs: i64, started_at: DateTime<Utc>) -> CallEndedEvent {
    CallEndedEvent {
        call_id: call_id.to_string(),
        caller: "+79990001122".to_string(),
        callee: line.to_string(),
        direction: CallDirection::Inbound,
        duration_secs,
        timestamp: started_at,
        status: CallStatus::Answered,
        transcript: Some("Hello, I would like to book a table".to_string()),
    }
}
