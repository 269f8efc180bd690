//! REST API for the dashboard and carrier webhooks
//!
//! Dashboard routes act for the tenant resolved from the request's bearer
//! token. Errors are returned as `{ "kind", "message" }` with a status code
//! derived from the error kind.

use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use validator::Validate;

use crate::catalog::RegisterAssistantRequest;
use crate::config::BalanceScope;
use crate::error::TelephonyError;
use crate::history::{HistoryPage, HistoryQuery};
use crate::ingest::{IngestOutcome, ReplayReport};
use crate::ledger::{AccountKey, BalanceView, LedgerEntry};
use crate::lifecycle::{ConnectReport, DisconnectOutcome};
use crate::service::TelephonyService;
use crate::types::{
    CallEndedEvent, CallStartedEvent, CreateChannelRequest, CreateFunctionRequest, Money,
    NotificationChannel, PhoneNumber, RoutingConfig, UserFunction,
};

pub mod auth;
pub mod error;
pub mod security_headers;

pub use auth::{CarrierWebhook, TenantContext};
pub use error::ApiError;

use security_headers::security_headers_middleware;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub service: TelephonyService,
}

/// Create the REST API router
pub fn create_router(service: TelephonyService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/numbers", get(list_numbers))
        .route("/numbers/connect", post(connect_numbers))
        .route("/numbers/:number", get(get_number))
        .route("/numbers/:number/disconnect", post(disconnect_number))
        .route("/numbers/:number/routing", put(set_routing))
        .route("/balance", get(get_balance))
        .route("/balance/entries", get(list_balance_entries))
        .route("/calls", get(list_calls))
        .route("/calls/:call_id/compensate", post(compensate_call))
        .route("/channels", get(list_channels).post(create_channel))
        .route("/channels/:id/active", put(set_channel_active))
        .route("/functions", get(list_functions).post(create_function))
        .route("/assistants", post(register_assistant))
        .route("/settings/timezone", put(set_timezone))
        .route("/webhooks/call-started", post(call_started))
        .route("/webhooks/call-ended", post(call_ended))
        .route("/webhooks/dead-letters/replay", post(replay_dead_letters))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// Numbers

#[derive(Debug, Deserialize, Validate)]
pub struct ConnectRequest {
    #[validate(length(min = 1, max = 100))]
    pub numbers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub summary: String,
    #[serde(flatten)]
    pub report: ConnectReport,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub number: String,
    pub outcome: DisconnectOutcome,
    pub message: String,
}

async fn list_numbers(State(state): State<AppState>, ctx: TenantContext) -> ApiResult<Vec<PhoneNumber>> {
    Ok(Json(state.service.lifecycle.list_numbers(ctx.tenant_id).await?))
}

async fn get_number(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(number): Path<String>,
) -> ApiResult<PhoneNumber> {
    Ok(Json(state.service.lifecycle.get_number(ctx.tenant_id, &number).await?))
}

async fn connect_numbers(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<ConnectResponse> {
    request.validate()?;
    let report = state
        .service
        .lifecycle
        .connect(ctx.tenant_id, &request.numbers)
        .await?;
    Ok(Json(ConnectResponse {
        summary: report.summary(),
        report,
    }))
}

async fn disconnect_number(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(number): Path<String>,
) -> ApiResult<DisconnectResponse> {
    let outcome = state.service.lifecycle.disconnect(ctx.tenant_id, &number).await?;
    Ok(Json(DisconnectResponse {
        number,
        outcome,
        message: outcome.message().to_string(),
    }))
}

async fn set_routing(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(number): Path<String>,
    Json(routing): Json<RoutingConfig>,
) -> ApiResult<PhoneNumber> {
    Ok(Json(
        state
            .service
            .lifecycle
            .set_routing(ctx.tenant_id, &number, routing)
            .await?,
    ))
}

// Balance

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    /// Required when balances are kept per number
    pub number: Option<String>,
}

async fn account_for(state: &AppState, ctx: TenantContext, query: &BalanceQuery) -> Result<AccountKey, ApiError> {
    let service = &state.service;
    match (service.config.billing.scope, &query.number) {
        (BalanceScope::Tenant, _) => Ok(AccountKey::tenant(ctx.tenant_id)),
        (BalanceScope::Number, Some(number)) => {
            let row = service.lifecycle.get_number(ctx.tenant_id, number).await?;
            Ok(AccountKey::number(ctx.tenant_id, row.number.as_str()))
        }
        (BalanceScope::Number, None) => Err(TelephonyError::validation(
            "balances are kept per number; pass ?number=",
        )
        .into()),
    }
}

async fn get_balance(
    State(state): State<AppState>,
    ctx: TenantContext,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<BalanceView> {
    let account = account_for(&state, ctx, &query).await?;
    Ok(Json(state.service.ledger.balance(&account).await?))
}

async fn list_balance_entries(
    State(state): State<AppState>,
    ctx: TenantContext,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<Vec<LedgerEntry>> {
    let account = account_for(&state, ctx, &query).await?;
    Ok(Json(state.service.ledger.entries(&account).await?))
}

// Calls

async fn list_calls(
    State(state): State<AppState>,
    ctx: TenantContext,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryPage> {
    Ok(Json(state.service.history.list(ctx.tenant_id, &query).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompensateRequest {
    #[validate(range(min = 1))]
    pub amount: Money,
    #[validate(length(min = 1, max = 200))]
    pub reason: String,
}

async fn compensate_call(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(call_id): Path<String>,
    Json(request): Json<CompensateRequest>,
) -> ApiResult<LedgerEntry> {
    request.validate()?;
    let outcome = state
        .service
        .ingestor
        .compensate(ctx.tenant_id, &call_id, request.amount, &request.reason)
        .await?;
    Ok(Json(outcome.entry))
}

// Catalog

async fn list_channels(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> ApiResult<Vec<NotificationChannel>> {
    Ok(Json(state.service.catalog.list_channels(ctx.tenant_id).await?))
}

async fn create_channel(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<CreateChannelRequest>,
) -> ApiResult<NotificationChannel> {
    Ok(Json(state.service.catalog.create_channel(ctx.tenant_id, request).await?))
}

#[derive(Debug, Deserialize)]
pub struct ChannelActiveRequest {
    pub active: bool,
}

async fn set_channel_active(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
    Json(request): Json<ChannelActiveRequest>,
) -> ApiResult<NotificationChannel> {
    Ok(Json(
        state
            .service
            .catalog
            .set_channel_active(ctx.tenant_id, &id, request.active)
            .await?,
    ))
}

async fn list_functions(State(state): State<AppState>, ctx: TenantContext) -> ApiResult<Vec<UserFunction>> {
    Ok(Json(state.service.catalog.list_functions(ctx.tenant_id).await?))
}

async fn create_function(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<CreateFunctionRequest>,
) -> ApiResult<UserFunction> {
    Ok(Json(state.service.catalog.create_function(ctx.tenant_id, request).await?))
}

async fn register_assistant(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<RegisterAssistantRequest>,
) -> ApiResult<Value> {
    let id = request.id.clone();
    state.service.catalog.register_assistant(ctx.tenant_id, request).await?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct TimezoneRequest {
    pub timezone: String,
}

async fn set_timezone(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<TimezoneRequest>,
) -> ApiResult<Value> {
    state
        .service
        .catalog
        .set_timezone(ctx.tenant_id, &request.timezone)
        .await?;
    Ok(Json(json!({ "timezone": request.timezone })))
}

// Carrier webhooks

async fn call_started(
    State(state): State<AppState>,
    _carrier: CarrierWebhook,
    Json(event): Json<CallStartedEvent>,
) -> ApiResult<Value> {
    let accepted = state.service.ingestor.on_call_started(&event).await?;
    Ok(Json(json!({ "call_id": event.call_id, "duplicate": !accepted })))
}

async fn call_ended(
    State(state): State<AppState>,
    _carrier: CarrierWebhook,
    Json(event): Json<CallEndedEvent>,
) -> ApiResult<IngestOutcome> {
    Ok(Json(state.service.ingestor.on_call_ended(&event).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub limit: Option<u32>,
}

async fn replay_dead_letters(
    State(state): State<AppState>,
    _carrier: CarrierWebhook,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<ReplayReport> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(state.service.ingestor.replay_dead_letters(limit).await?))
}
