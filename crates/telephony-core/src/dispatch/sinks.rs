//! HTTP notification sinks
//!
//! Every sink classifies its failures: [`SinkError::retryable`] decides
//! whether the dispatcher tries again.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::config::DispatchConfig;
use crate::types::{ChannelTarget, ChatProvider, NotificationChannel, UserFunction};

use super::{format, NotificationEvent};

#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct SinkError {
    pub reason: String,
    pub retryable: bool,
}

impl SinkError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// One external delivery target
#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError>;
}

/// Builds sinks for catalog entries
pub trait SinkFactory: Send + Sync {
    fn channel_sink(&self, channel: &NotificationChannel) -> Arc<dyn Sink>;
    fn function_sink(&self, function: &UserFunction) -> Arc<dyn Sink>;
}

fn from_reqwest(err: reqwest::Error) -> SinkError {
    // Connection problems and timeouts are worth another attempt
    SinkError::retryable(err.to_string())
}

/// 5xx and 429 are retried, other non-2xx answers are final
async fn classify(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let reason = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(SinkError::retryable(reason))
    } else {
        Err(SinkError::rejected(reason))
    }
}

pub struct TelegramSink {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[async_trait]
impl Sink for TelegramSink {
    fn kind(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let endpoint = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        );
        let response = self
            .http
            .post(endpoint)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": format::chat_message(event),
                "disable_web_page_preview": true
            }))
            .send()
            .await
            .map_err(from_reqwest)?;
        let body: Value = classify(response)
            .await?
            .json()
            .await
            .map_err(|e| SinkError::retryable(format!("telegram response: {}", e)))?;
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(SinkError::rejected(format!(
                "telegram refused: {}",
                body.get("description").and_then(Value::as_str).unwrap_or("unknown")
            )))
        }
    }
}

pub struct VkSink {
    channel_id: String,
    http: reqwest::Client,
    api_base: String,
    api_version: String,
    access_token: String,
    peer_id: String,
}

/// VK error codes worth retrying: too many requests, flood control, internal
const VK_RETRYABLE_CODES: [i64; 3] = [6, 9, 10];

impl VkSink {
    /// VK drops a resent message carrying the same `random_id`, so the id
    /// stays fixed for a call on a channel across every attempt.
    fn random_id(&self, call_id: &str) -> i32 {
        let mut hasher = Sha256::new();
        hasher.update(call_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.channel_id.as_bytes());
        let digest = hasher.finalize();
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (prefix & 0x7fff_ffff) as i32
    }
}

#[async_trait]
impl Sink for VkSink {
    fn kind(&self) -> &'static str {
        "vk"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let endpoint = format!("{}/messages.send", self.api_base.trim_end_matches('/'));
        let random_id = self.random_id(&event.call_id);
        let params = [
            ("peer_id", self.peer_id.clone()),
            ("message", format::chat_message(event)),
            ("random_id", random_id.to_string()),
            ("access_token", self.access_token.clone()),
            ("v", self.api_version.clone()),
        ];
        let response = self
            .http
            .post(endpoint)
            .form(&params)
            .send()
            .await
            .map_err(from_reqwest)?;
        let body: Value = classify(response)
            .await?
            .json()
            .await
            .map_err(|e| SinkError::retryable(format!("vk response: {}", e)))?;
        match body.get("error") {
            None => Ok(()),
            Some(error) => {
                let code = error.get("error_code").and_then(Value::as_i64).unwrap_or(0);
                let message = error
                    .get("error_msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let reason = format!("vk error {}: {}", code, message);
                if VK_RETRYABLE_CODES.contains(&code) {
                    Err(SinkError::retryable(reason))
                } else {
                    Err(SinkError::rejected(reason))
                }
            }
        }
    }
}

pub struct SmsSink {
    http: reqwest::Client,
    gateway_url: String,
    api_key: Option<String>,
    number: String,
}

#[async_trait]
impl Sink for SmsSink {
    fn kind(&self) -> &'static str {
        "sms"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let mut request = self.http.post(&self.gateway_url).json(&json!({
            "number": self.number,
            "text": format::sms_message(event),
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(from_reqwest)?;
        classify(response).await?;
        Ok(())
    }
}

/// User function invoked over HTTP once the payload matches its schema
pub struct FunctionSink {
    http: reqwest::Client,
    function: UserFunction,
    validator: Result<jsonschema::Validator, String>,
}

impl FunctionSink {
    pub fn new(http: reqwest::Client, function: UserFunction) -> Self {
        let validator = jsonschema::validator_for(&function.parameters)
            .map_err(|e| format!("invalid JSON schema for '{}': {}", function.name, e));
        Self {
            http,
            function,
            validator,
        }
    }

    /// Check `arguments` against the declared parameter schema
    pub fn validate(&self, arguments: &Value) -> Result<(), SinkError> {
        let validator = self.validator.as_ref().map_err(|e| SinkError::rejected(e.clone()))?;
        let problems: Vec<String> = validator.iter_errors(arguments).map(|e| e.to_string()).collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SinkError::rejected(format!(
                "payload does not match schema of '{}': {}",
                self.function.name,
                problems.join("; ")
            )))
        }
    }
}

#[async_trait]
impl Sink for FunctionSink {
    fn kind(&self) -> &'static str {
        "function"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let arguments = event.payload();
        self.validate(&arguments)?;
        let response = self
            .http
            .post(&self.function.endpoint)
            .json(&json!({
                "function": self.function.name,
                "arguments": arguments,
            }))
            .send()
            .await
            .map_err(from_reqwest)?;
        classify(response).await?;
        Ok(())
    }
}

/// Production sinks over a shared HTTP client
pub struct HttpSinkFactory {
    http: reqwest::Client,
    config: DispatchConfig,
}

impl HttpSinkFactory {
    pub fn new(config: DispatchConfig) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.attempt_timeout_ms))
            .build()
            .map_err(|e| crate::error::TelephonyError::Config(format!("sink client: {}", e)))?;
        Ok(Self { http, config })
    }
}

impl SinkFactory for HttpSinkFactory {
    fn channel_sink(&self, channel: &NotificationChannel) -> Arc<dyn Sink> {
        match &channel.target {
            ChannelTarget::ChatBot {
                provider: ChatProvider::Telegram,
                chat_id,
                bot_token,
            } => Arc::new(TelegramSink {
                http: self.http.clone(),
                api_base: self.config.telegram_api_base.clone(),
                bot_token: bot_token.clone(),
                chat_id: chat_id.clone(),
            }),
            ChannelTarget::ChatBot {
                provider: ChatProvider::Vk,
                chat_id,
                bot_token,
            } => Arc::new(VkSink {
                channel_id: channel.id.clone(),
                http: self.http.clone(),
                api_base: self.config.vk_api_base.clone(),
                api_version: self.config.vk_api_version.clone(),
                access_token: bot_token.clone(),
                peer_id: chat_id.clone(),
            }),
            ChannelTarget::Sms { number } => Arc::new(SmsSink {
                http: self.http.clone(),
                gateway_url: self.config.sms_gateway_url.clone(),
                api_key: self.config.sms_api_key.clone(),
                number: number.clone(),
            }),
        }
    }

    fn function_sink(&self, function: &UserFunction) -> Arc<dyn Sink> {
        Arc::new(FunctionSink::new(self.http.clone(), function.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallDirection, CallStatus};
    use chrono::Utc;
    use httpmock::prelude::*;

    fn event() -> NotificationEvent {
        NotificationEvent {
            tenant_id: 5,
            call_id: "call-1".into(),
            line_number: "+70001112233".into(),
            caller: "+79990001122".into(),
            callee: "+70001112233".into(),
            direction: CallDirection::Inbound,
            status: CallStatus::Answered,
            duration_secs: 125,
            billed_minutes: 3,
            cost: 0,
            started_at: Utc::now(),
            transcript: None,
            assistant_id: None,
        }
    }

    fn function(parameters: Value, endpoint: String) -> UserFunction {
        UserFunction {
            id: "fn-1".into(),
            tenant_id: 5,
            name: "crm_log".into(),
            description: None,
            parameters,
            endpoint,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn telegram_posts_send_message() {
        let server = MockServer::start();
        let sent = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendMessage")
                .body_includes("\"chat_id\":\"42\"");
            then.status(200).json_body(json!({"ok": true, "result": {"message_id": 1}}));
        });

        let sink = TelegramSink {
            http: reqwest::Client::new(),
            api_base: server.base_url(),
            bot_token: "test-token".into(),
            chat_id: "42".into(),
        };
        sink.deliver(&event()).await.unwrap();
        sent.assert_calls(1);
    }

    #[tokio::test]
    async fn vk_flood_control_is_retryable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/messages.send");
            then.status(200)
                .json_body(json!({"error": {"error_code": 9, "error_msg": "Flood control"}}));
        });

        let sink = vk_sink(server.base_url(), "ch-vk");
        let err = sink.deliver(&event()).await.unwrap_err();
        assert!(err.retryable);
    }

    fn vk_sink(api_base: String, channel_id: &str) -> VkSink {
        VkSink {
            channel_id: channel_id.into(),
            http: reqwest::Client::new(),
            api_base,
            api_version: "5.199".into(),
            access_token: "vk-token".into(),
            peer_id: "2000000001".into(),
        }
    }

    #[tokio::test]
    async fn vk_resend_reuses_random_id() {
        let sink = vk_sink("http://unused".into(), "ch-vk");
        let expected = sink.random_id("call-1");
        assert!(expected >= 0);
        assert_eq!(sink.random_id("call-1"), expected);
        assert_ne!(sink.random_id("call-2"), expected);
        assert_ne!(vk_sink("http://unused".into(), "ch-other").random_id("call-1"), expected);

        let server = MockServer::start();
        let same_id = server.mock(|when, then| {
            when.method(POST)
                .path("/messages.send")
                .form_urlencoded_tuple("random_id", expected.to_string());
            then.status(200)
                .json_body(json!({"error": {"error_code": 6, "error_msg": "Too many requests"}}));
        });
        let sink = vk_sink(server.base_url(), "ch-vk");
        for _ in 0..3 {
            let err = sink.deliver(&event()).await.unwrap_err();
            assert!(err.retryable);
        }
        same_id.assert_calls(3);
    }

    #[tokio::test]
    async fn sms_client_error_is_final() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/send");
            then.status(400).body("bad number");
        });

        let sink = SmsSink {
            http: reqwest::Client::new(),
            gateway_url: format!("{}/send", server.base_url()),
            api_key: None,
            number: "+79990001122".into(),
        };
        let err = sink.deliver(&event()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.reason.contains("400"));
    }

    #[tokio::test]
    async fn function_payload_is_rejected_before_invocation() {
        let server = MockServer::start();
        let invoked = server.mock(|when, then| {
            when.method(POST).path("/hook");
            then.status(200);
        });

        let schema = json!({
            "type": "object",
            "required": ["order_id"],
            "properties": {"order_id": {"type": "string"}}
        });
        let sink = FunctionSink::new(
            reqwest::Client::new(),
            function(schema, format!("{}/hook", server.base_url())),
        );
        let err = sink.deliver(&event()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(err.reason.contains("order_id"));
        invoked.assert_calls(0);
    }

    #[tokio::test]
    async fn function_invoked_with_valid_payload() {
        let server = MockServer::start();
        let invoked = server.mock(|when, then| {
            when.method(POST)
                .path("/hook")
                .body_includes("\"function\":\"crm_log\"");
            then.status(200);
        });

        let schema = json!({
            "type": "object",
            "required": ["call_id", "duration_secs"],
            "properties": {
                "call_id": {"type": "string"},
                "duration_secs": {"type": "integer", "minimum": 0}
            }
        });
        let sink = FunctionSink::new(
            reqwest::Client::new(),
            function(schema, format!("{}/hook", server.base_url())),
        );
        sink.deliver(&event()).await.unwrap();
        invoked.assert_calls(1);
    }
}
