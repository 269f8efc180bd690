//! Tenant catalog management: notification channels, user functions,
//! assistants and tenant settings

use chrono::Utc;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::cache::{CatalogCache, Invalidation};
use crate::error::{Result, TelephonyError};
use crate::store::CatalogStore;
use crate::types::{
    new_id, ChannelTarget, CreateChannelRequest, CreateFunctionRequest, NotificationChannel,
    TenantId, UserFunction, E164,
};

static FUNCTION_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("static function name pattern is valid")
});

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterAssistantRequest {
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
}

pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    cache: Arc<CatalogCache>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn CatalogStore>, cache: Arc<CatalogCache>) -> Self {
        Self { store, cache }
    }

    pub async fn create_channel(
        &self,
        tenant_id: TenantId,
        request: CreateChannelRequest,
    ) -> Result<NotificationChannel> {
        request.validate()?;
        let target = match request.target {
            ChannelTarget::ChatBot {
                provider,
                chat_id,
                bot_token,
            } => {
                if chat_id.trim().is_empty() || bot_token.trim().is_empty() {
                    return Err(TelephonyError::validation(
                        "chat bot channels need a chat_id and a bot_token",
                    ));
                }
                ChannelTarget::ChatBot {
                    provider,
                    chat_id: chat_id.trim().to_string(),
                    bot_token: bot_token.trim().to_string(),
                }
            }
            ChannelTarget::Sms { number } => ChannelTarget::Sms {
                number: E164::parse(&number)?.to_string(),
            },
        };

        let channel = NotificationChannel {
            id: new_id(),
            tenant_id,
            name: request.name.trim().to_string(),
            target,
            active: true,
            created_at: Utc::now(),
        };
        self.store.insert_channel(&channel).await?;
        self.cache.invalidate(Invalidation::Catalog { tenant_id });
        info!(tenant_id, channel = %channel.id, kind = channel.target.type_name(), "Channel created");
        Ok(channel)
    }

    pub async fn list_channels(&self, tenant_id: TenantId) -> Result<Vec<NotificationChannel>> {
        self.store.list_channels(tenant_id).await
    }

    pub async fn set_channel_active(
        &self,
        tenant_id: TenantId,
        channel_id: &str,
        active: bool,
    ) -> Result<NotificationChannel> {
        let mut channel = self
            .store
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| TelephonyError::not_found(format!("channel {}", channel_id)))?;
        if channel.tenant_id != tenant_id {
            return Err(TelephonyError::unauthorized(format!(
                "channel {} belongs to another tenant",
                channel_id
            )));
        }
        self.store.set_channel_active(channel_id, active).await?;
        channel.active = active;
        self.cache.invalidate(Invalidation::Catalog { tenant_id });
        info!(tenant_id, channel = channel_id, active, "Channel updated");
        Ok(channel)
    }

    pub async fn create_function(
        &self,
        tenant_id: TenantId,
        request: CreateFunctionRequest,
    ) -> Result<UserFunction> {
        request.validate()?;
        if !FUNCTION_NAME.is_match(&request.name) {
            return Err(TelephonyError::validation(format!(
                "function name '{}' must be an identifier",
                request.name
            )));
        }
        if !(request.endpoint.starts_with("http://") || request.endpoint.starts_with("https://")) {
            return Err(TelephonyError::validation("function endpoint must be an http(s) URL"));
        }
        jsonschema::validator_for(&request.parameters).map_err(|e| {
            TelephonyError::validation(format!("invalid JSON schema for '{}': {}", request.name, e))
        })?;

        let function = UserFunction {
            id: new_id(),
            tenant_id,
            name: request.name,
            description: request.description,
            parameters: request.parameters,
            endpoint: request.endpoint,
            created_at: Utc::now(),
        };
        self.store.insert_function(&function).await?;
        self.cache.invalidate(Invalidation::Catalog { tenant_id });
        info!(tenant_id, function = %function.id, name = %function.name, "Function created");
        Ok(function)
    }

    pub async fn list_functions(&self, tenant_id: TenantId) -> Result<Vec<UserFunction>> {
        self.store.list_functions(tenant_id).await
    }

    pub async fn register_assistant(
        &self,
        tenant_id: TenantId,
        request: RegisterAssistantRequest,
    ) -> Result<()> {
        request.validate()?;
        match self.store.assistant_owner(&request.id).await? {
            Some(owner) if owner == tenant_id => Ok(()),
            Some(_) => Err(TelephonyError::conflict(format!(
                "assistant {} is registered by another tenant",
                request.id
            ))),
            None => {
                self.store
                    .insert_assistant(tenant_id, &request.id, &request.name)
                    .await?;
                info!(tenant_id, assistant = %request.id, "Assistant registered");
                Ok(())
            }
        }
    }

    pub async fn set_timezone(&self, tenant_id: TenantId, timezone: &str) -> Result<()> {
        timezone
            .parse::<Tz>()
            .map_err(|_| TelephonyError::validation(format!("unknown timezone '{}'", timezone)))?;
        self.store.set_tenant_timezone(tenant_id, timezone).await
    }
}
