//! Request-scoped credentials
//!
//! Dashboard requests carry `Authorization: Bearer <token>`; the token
//! resolves to exactly one tenant for the lifetime of that request. Carrier
//! webhooks carry the shared secret in `X-Webhook-Secret`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::header::AUTHORIZATION;

use crate::types::TenantId;

use super::error::ApiError;
use super::AppState;

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Tenant the current request acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
}

#[async_trait]
impl FromRequestParts<AppState> for TenantContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthenticated)?;
        let tenant_id = state
            .service
            .config
            .auth
            .tokens
            .get(token)
            .copied()
            .ok_or(ApiError::Unauthenticated)?;
        Ok(TenantContext { tenant_id })
    }
}

/// Proof that the request came from the carrier
#[derive(Debug, Clone, Copy)]
pub struct CarrierWebhook;

#[async_trait]
impl FromRequestParts<AppState> for CarrierWebhook {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.service.config.auth.webhook_secret.as_deref() else {
            // No secret configured: webhooks are open (local development)
            return Ok(CarrierWebhook);
        };
        let provided = parts
            .headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthenticated)?;
        if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            Ok(CarrierWebhook)
        } else {
            Err(ApiError::Unauthenticated)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
