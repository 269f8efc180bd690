//! Core types for telephony-core

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

use crate::error::{Result, TelephonyError};

/// Tenant (account/organization) identifier
pub type TenantId = i64;

/// Money in minor currency units (1.00 = 100)
pub type Money = i64;

static E164_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\+[1-9][0-9]{7,14}$").expect("static E.164 pattern is valid")
});

/// Phone number in E.164 form, e.g. `+70001112233`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct E164(String);

impl E164 {
    /// Parse and normalize. Spaces, dashes and parentheses are stripped.
    pub fn parse(raw: &str) -> Result<Self> {
        let cleaned: String = raw
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
            .collect();
        if E164_REGEX.is_match(&cleaned) {
            Ok(Self(cleaned))
        } else {
            Err(TelephonyError::validation(format!(
                "'{}' is not an E.164 phone number",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for E164 {
    type Error = TelephonyError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<E164> for String {
    fn from(value: E164) -> Self {
        value.0
    }
}

/// Lifecycle state of a phone number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberStatus {
    Available,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl NumberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumberStatus::Available => "available",
            NumberStatus::Connecting => "connecting",
            NumberStatus::Connected => "connected",
            NumberStatus::Disconnecting => "disconnecting",
            NumberStatus::Disconnected => "disconnected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" => Some(NumberStatus::Available),
            "connecting" => Some(NumberStatus::Connecting),
            "connected" => Some(NumberStatus::Connected),
            "disconnecting" => Some(NumberStatus::Disconnecting),
            "disconnected" => Some(NumberStatus::Disconnected),
            _ => None,
        }
    }

    /// `Connecting` and `Disconnecting` await carrier confirmation
    pub fn is_transient(&self) -> bool {
        matches!(self, NumberStatus::Connecting | NumberStatus::Disconnecting)
    }

    /// Stable states in which nobody holds the line
    pub fn is_idle(&self) -> bool {
        matches!(self, NumberStatus::Available | NumberStatus::Disconnected)
    }
}

/// Inbound-call automation attached to a connected number
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub function_ids: Vec<String>,
    /// Free-text prompt/task handed to the assistant
    pub prompt: Option<String>,
}

impl RoutingConfig {
    pub fn has_sinks(&self) -> bool {
        !self.channel_ids.is_empty() || !self.function_ids.is_empty()
    }
}

/// Phone number row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub number: E164,
    /// Current owner; kept as last owner after disconnection for history
    pub tenant_id: Option<TenantId>,
    pub status: NumberStatus,
    pub routing: Option<RoutingConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhoneNumber {
    pub fn new(number: E164) -> Self {
        let now = Utc::now();
        Self {
            number,
            tenant_id: None,
            status: NumberStatus::Available,
            routing: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Owned means held by the tenant in a non-idle state
    pub fn is_held_by_other(&self, tenant_id: TenantId) -> bool {
        !self.status.is_idle() && self.tenant_id.is_some_and(|t| t != tenant_id)
    }
}

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(CallDirection::Inbound),
            "outbound" => Some(CallDirection::Outbound),
            _ => None,
        }
    }
}

/// Final status of a call as reported by the carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Answered,
    Missed,
    Busy,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Answered => "answered",
            CallStatus::Missed => "missed",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "answered" => Some(CallStatus::Answered),
            "missed" | "no_answer" => Some(CallStatus::Missed),
            "busy" => Some(CallStatus::Busy),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }
}

/// Carrier webhook: call started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStartedEvent {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub direction: CallDirection,
    pub timestamp: DateTime<Utc>,
}

/// Carrier webhook: call ended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEndedEvent {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub direction: CallDirection,
    pub duration_secs: i64,
    /// Call start time
    pub timestamp: DateTime<Utc>,
    pub status: CallStatus,
    #[serde(default)]
    pub transcript: Option<String>,
}

impl CallEndedEvent {
    /// The tenant-side line: callee for inbound calls, caller for outbound
    pub fn line_number(&self) -> &str {
        match self.direction {
            CallDirection::Inbound => &self.callee,
            CallDirection::Outbound => &self.caller,
        }
    }
}

/// Immutable record of a completed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Insertion sequence; the tie-break for ordering and the snapshot mark
    pub seq: i64,
    pub call_id: String,
    pub tenant_id: TenantId,
    pub line_number: String,
    pub caller: String,
    pub callee: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub billed_minutes: i64,
    pub free_minutes_used: i64,
    pub rate_per_minute: Money,
    pub cost: Money,
    pub transcript: Option<String>,
    pub assistant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Record to append; `seq` and `created_at` are assigned by the store
#[derive(Debug, Clone)]
pub struct NewCallRecord {
    pub call_id: String,
    pub tenant_id: TenantId,
    pub line_number: String,
    pub caller: String,
    pub callee: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub billed_minutes: i64,
    pub free_minutes_used: i64,
    pub rate_per_minute: Money,
    pub cost: Money,
    pub transcript: Option<String>,
    pub assistant_id: Option<String>,
    /// Queue a notification for the line's sinks with the record
    pub notify: bool,
}

/// Chat-bot provider behind a notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatProvider {
    Telegram,
    Vk,
}

/// Where a notification channel delivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelTarget {
    ChatBot {
        provider: ChatProvider,
        chat_id: String,
        bot_token: String,
    },
    Sms {
        number: String,
    },
}

impl ChannelTarget {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelTarget::ChatBot { provider: ChatProvider::Telegram, .. } => "telegram",
            ChannelTarget::ChatBot { provider: ChatProvider::Vk, .. } => "vk",
            ChannelTarget::Sms { .. } => "sms",
        }
    }
}

/// Tenant-scoped notification sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub tenant_id: TenantId,
    pub name: String,
    pub target: ChannelTarget,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Tenant-defined callable with a JSON Schema for its arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFunction {
    pub id: String,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema the call payload must satisfy
    pub parameters: serde_json::Value,
    /// HTTP endpoint invoked with the validated payload
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

/// Request to create a notification channel
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateChannelRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub target: ChannelTarget,
}

/// Request to create a user function
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateFunctionRequest {
    pub name: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
    #[validate(length(min = 8, max = 2048))]
    pub endpoint: String,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e164_normalizes_separators() {
        let number = E164::parse("+7 (000) 111-22-33").unwrap();
        assert_eq!(number.as_str(), "+70001112233");
    }

    #[test]
    fn e164_rejects_garbage() {
        assert!(E164::parse("89001112233").is_err());
        assert!(E164::parse("+0123456789").is_err());
        assert!(E164::parse("+7abc").is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            NumberStatus::Available,
            NumberStatus::Connecting,
            NumberStatus::Connected,
            NumberStatus::Disconnecting,
            NumberStatus::Disconnected,
        ] {
            assert_eq!(NumberStatus::from_str(status.as_str()), Some(status));
        }
        assert!(NumberStatus::Connecting.is_transient());
        assert!(NumberStatus::Disconnected.is_idle());
    }

    #[test]
    fn line_number_follows_direction() {
        let mut event = CallEndedEvent {
            call_id: "c1".into(),
            caller: "+79990001122".into(),
            callee: "+70001112233".into(),
            direction: CallDirection::Inbound,
            duration_secs: 10,
            timestamp: Utc::now(),
            status: CallStatus::Answered,
            transcript: None,
        };
        assert_eq!(event.line_number(), "+70001112233");
        event.direction = CallDirection::Outbound;
        assert_eq!(event.line_number(), "+79990001122");
    }

    #[test]
    fn channel_target_tagged_json() {
        let target: ChannelTarget = serde_json::from_value(serde_json::json!({
            "type": "chat_bot",
            "provider": "telegram",
            "chat_id": "42",
            "bot_token": "t"
        }))
        .unwrap();
        assert_eq!(target.type_name(), "telegram");
    }
}
