//! Carrier provisioning API
//!
//! [`CarrierClient`] is the seam between the lifecycle manager and the
//! external telephony provider. [`HttpCarrierClient`] talks to it over JSON.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::CarrierConfig;
use crate::error::{Result, TelephonyError};
use crate::types::{TenantId, E164};

/// Per-number answer to a connect batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CarrierOutcome {
    Connected,
    AlreadyConnected,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierNumberResult {
    pub number: String,
    #[serde(flatten)]
    pub outcome: CarrierOutcome,
}

/// Line state as the carrier sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarrierLineState {
    Connected,
    Disconnected,
    /// Carrier has not settled the last request yet
    Unknown,
}

#[async_trait]
pub trait CarrierClient: Send + Sync {
    /// Provision a batch of numbers for `tenant_id` in one request
    async fn connect_numbers(
        &self,
        tenant_id: TenantId,
        numbers: &[E164],
    ) -> Result<Vec<CarrierNumberResult>>;

    async fn disconnect_number(&self, tenant_id: TenantId, number: &E164) -> Result<()>;

    /// Authoritative state, used to settle `Connecting`/`Disconnecting`
    async fn line_state(&self, number: &E164) -> Result<CarrierLineState>;
}

#[derive(Serialize)]
struct ConnectBody<'a> {
    tenant_id: TenantId,
    numbers: Vec<&'a str>,
}

#[derive(Deserialize)]
struct ConnectResponse {
    results: Vec<CarrierNumberResult>,
}

#[derive(Serialize)]
struct DisconnectBody {
    tenant_id: TenantId,
}

#[derive(Deserialize)]
struct LineStateResponse {
    state: CarrierLineState,
}

/// JSON-over-HTTP carrier client
#[derive(Clone)]
pub struct HttpCarrierClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCarrierClient {
    pub fn new(config: &CarrierConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| TelephonyError::Config(format!("carrier client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn map_error(&self, operation: &str, err: reqwest::Error) -> TelephonyError {
        if err.is_timeout() {
            TelephonyError::UpstreamTimeout {
                operation: operation.to_string(),
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            TelephonyError::upstream(format!("{}: {}", operation, err))
        }
    }

    async fn check(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TelephonyError::upstream(format!(
            "{} returned {}: {}",
            operation, status, body
        )))
    }
}

#[async_trait]
impl CarrierClient for HttpCarrierClient {
    async fn connect_numbers(
        &self,
        tenant_id: TenantId,
        numbers: &[E164],
    ) -> Result<Vec<CarrierNumberResult>> {
        debug!(tenant_id, count = numbers.len(), "Carrier connect batch");
        let body = ConnectBody {
            tenant_id,
            numbers: numbers.iter().map(E164::as_str).collect(),
        };
        let response = self
            .request(reqwest::Method::POST, "/numbers/connect")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error("carrier connect", e))?;
        let parsed: ConnectResponse = Self::check("carrier connect", response)
            .await?
            .json()
            .await
            .map_err(|e| self.map_error("carrier connect", e))?;
        Ok(parsed.results)
    }

    async fn disconnect_number(&self, tenant_id: TenantId, number: &E164) -> Result<()> {
        debug!(tenant_id, number = %number, "Carrier disconnect");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/numbers/{}/disconnect", number.as_str()),
            )
            .json(&DisconnectBody { tenant_id })
            .send()
            .await
            .map_err(|e| self.map_error("carrier disconnect", e))?;
        Self::check("carrier disconnect", response).await?;
        Ok(())
    }

    async fn line_state(&self, number: &E164) -> Result<CarrierLineState> {
        let response = self
            .request(reqwest::Method::GET, &format!("/numbers/{}", number.as_str()))
            .send()
            .await
            .map_err(|e| self.map_error("carrier line state", e))?;
        let parsed: LineStateResponse = Self::check("carrier line state", response)
            .await?
            .json()
            .await
            .map_err(|e| self.map_error("carrier line state", e))?;
        Ok(parsed.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> HttpCarrierClient {
        HttpCarrierClient::new(&CarrierConfig {
            base_url: server.base_url(),
            api_key: Some("carrier-key".into()),
            timeout_ms: 1000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn connect_batch_parses_per_number_results() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/numbers/connect")
                .header("authorization", "Bearer carrier-key")
                .json_body(json!({"tenant_id": 5, "numbers": ["+70001112233", "+70001112244"]}));
            then.status(200).json_body(json!({
                "results": [
                    {"number": "+70001112233", "status": "connected"},
                    {"number": "+70001112244", "status": "failed", "reason": "not in pool"}
                ]
            }));
        });

        let numbers = vec![
            E164::parse("+70001112233").unwrap(),
            E164::parse("+70001112244").unwrap(),
        ];
        let results = client(&server).connect_numbers(5, &numbers).await.unwrap();

        mock.assert();
        assert_eq!(results[0].outcome, CarrierOutcome::Connected);
        assert_eq!(
            results[1].outcome,
            CarrierOutcome::Failed { reason: "not in pool".into() }
        );
    }

    #[tokio::test]
    async fn server_error_is_upstream() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/numbers/+70001112233");
            then.status(503).body("maintenance");
        });

        let err = client(&server)
            .line_state(&E164::parse("+70001112233").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TelephonyError::Upstream { .. }));
    }
}
