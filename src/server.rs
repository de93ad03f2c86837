use crate::{
    config::{AppConfig, AuthConfig},
    error::UsageError,
    pricing::PriceBook,
    provider::Provider,
    storage::{NewUsageRecord, Scope, Storage, UsageRecord},
    tiers::{SubscriptionStatus, Subscriptions},
    usage::{
        AllProvidersUsage, TimeRange, TrendPoint, UsageAggregator, UsageFilter, UsageReport,
    },
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{collections::HashMap, net::SocketAddr, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

#[derive(Clone)]
struct ApiState {
    aggregator: UsageAggregator,
    subscriptions: Subscriptions,
    price_book: PriceBook,
    storage: Storage,
    tokens: HashMap<String, Identity>,
}

#[derive(Debug, Clone)]
struct Identity {
    user_id: String,
    organization_id: String,
}

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal {
        message: &'static str,
        source: UsageError,
    },
}

impl ApiError {
    fn internal(message: &'static str, source: UsageError) -> Self {
        ApiError::Internal { message, source }
    }
}

impl From<UsageError> for ApiError {
    fn from(err: UsageError) -> Self {
        match err {
            UsageError::InvalidFilter(message) => ApiError::BadRequest(message),
            err @ UsageError::Store(_) => ApiError::internal("Failed to fetch usage data", err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            // Store failures are logged with detail and answered generically.
            ApiError::Internal { message, source } => {
                tracing::error!(error = %source, "usage request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

pub async fn spawn(config: Arc<AppConfig>, storage: Storage) -> Result<ServerHandle> {
    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| "failed to parse listen_addr")?;

    let aggregator = UsageAggregator::new(storage.clone(), &config.aggregation);
    let subscriptions = Subscriptions::from_config(aggregator.clone(), &config.auth);
    let price_book = PriceBook::from_config(&config.pricing);
    tracing::info!(
        currency = price_book.currency(),
        models = config.pricing.models.len(),
        "price book loaded"
    );
    let tokens = token_registry(&config.auth);
    if tokens.is_empty() {
        tracing::warn!("no api tokens configured, every request will be rejected");
    }

    let state = Arc::new(ApiState {
        aggregator,
        subscriptions,
        price_book,
        storage,
        tokens,
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| "failed to bind api listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %addr, "usage api listener started");

    Ok(ServerHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}

impl ServerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/usage", get(usage_stats).post(record_usage))
        .route("/api/usage/all", get(all_usage))
        .route("/api/usage/trend", get(usage_trend))
        .route("/api/usage/recent", get(recent_usage))
        .route("/api/subscription/status", get(subscription_status))
        .route("/api/:provider/usage", get(provider_usage))
        .with_state(state)
}

fn token_registry(auth: &AuthConfig) -> HashMap<String, Identity> {
    auth.tokens
        .iter()
        .map(|token| {
            (
                token.token.clone(),
                Identity {
                    user_id: token.user_id.clone(),
                    organization_id: token.organization_id.clone(),
                },
            )
        })
        .collect()
}

fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match token.and_then(|token| state.tokens.get(token)) {
        Some(identity) => Ok(identity.clone()),
        None => Err(ApiError::Unauthorized),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageQuery {
    date_range: Option<String>,
    provider: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentQuery {
    limit: Option<usize>,
    provider: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<usize>,
    date_range: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderQueryKind {
    Stats,
    Recent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageReportBody {
    provider: String,
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default = "default_success")]
    success: bool,
}

fn default_success() -> bool {
    true
}

fn parse_filter(query: &UsageQuery) -> Result<UsageFilter, ApiError> {
    let provider = match query.provider.as_deref() {
        Some(raw) => Some(Provider::from_str(raw).map_err(UsageError::from)?),
        None => None,
    };
    let range = parse_range(
        query.date_range.as_deref(),
        query.start.as_deref(),
        query.end.as_deref(),
    )?;
    Ok(UsageFilter { provider, range })
}

fn parse_range(
    date_range: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<TimeRange, ApiError> {
    match date_range {
        None => Ok(TimeRange::default()),
        Some(token) if token.eq_ignore_ascii_case("custom") => {
            let start = parse_timestamp("start", start)?;
            let end = parse_timestamp("end", end)?;
            Ok(TimeRange::custom(start, end)?)
        }
        Some(token) => Ok(token.parse::<TimeRange>()?),
    }
}

fn parse_timestamp(name: &str, value: Option<&str>) -> Result<DateTime<Utc>, ApiError> {
    let raw = value.ok_or_else(|| {
        ApiError::BadRequest(format!(
            "custom range requires both start and end, missing {name}"
        ))
    })?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|err| ApiError::BadRequest(format!("invalid {name} timestamp: {err}")))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_query_kind(raw: Option<&str>) -> Result<ProviderQueryKind, ApiError> {
    match raw {
        None => Ok(ProviderQueryKind::Stats),
        Some(token) if token.eq_ignore_ascii_case("stats") => Ok(ProviderQueryKind::Stats),
        Some(token) if token.eq_ignore_ascii_case("recent") => Ok(ProviderQueryKind::Recent),
        Some(_) => Err(ApiError::BadRequest("Invalid type parameter".to_string())),
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn usage_stats(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageReport>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let filter = parse_filter(&query)?;
    let scope = Scope::User(identity.user_id);
    Ok(Json(state.aggregator.usage_stats(&scope, &filter).await?))
}

async fn record_usage(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<UsageReportBody>,
) -> Result<(StatusCode, Json<UsageRecord>), ApiError> {
    let identity = authenticate(&state, &headers)?;
    let provider = Provider::from_str(&body.provider).map_err(UsageError::from)?;
    // Costs come from the price book at write time, never from the caller.
    let breakdown = state
        .price_book
        .breakdown(provider, &body.model, body.input_tokens, body.output_tokens);

    let record = NewUsageRecord {
        user_id: identity.user_id,
        organization_id: identity.organization_id,
        provider,
        model: body.model,
        input_tokens: body.input_tokens,
        output_tokens: body.output_tokens,
        total_tokens: body.input_tokens + body.output_tokens,
        input_cost: breakdown.input_cost,
        output_cost: breakdown.output_cost,
        cost: breakdown.total_cost,
        latency_ms: body.latency_ms,
        success: body.success,
        timestamp: Utc::now(),
    };

    let stored = state
        .storage
        .insert_record(record)
        .await
        .map_err(|err| ApiError::internal("Failed to record usage", err))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn all_usage(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<AllProvidersUsage>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let range = parse_range(
        query.date_range.as_deref(),
        query.start.as_deref(),
        query.end.as_deref(),
    )?;
    let scope = Scope::User(identity.user_id);
    Ok(Json(
        state.aggregator.all_providers_usage(&scope, range).await?,
    ))
}

async fn usage_trend(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<TrendPoint>>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let filter = parse_filter(&query)?;
    let scope = Scope::User(identity.user_id);
    Ok(Json(state.aggregator.usage_trend(&scope, &filter).await?))
}

async fn recent_usage(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<UsageRecord>>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let provider = match query.provider.as_deref() {
        Some(raw) => Some(Provider::from_str(raw).map_err(UsageError::from)?),
        None => None,
    };
    let scope = Scope::User(identity.user_id);
    Ok(Json(
        state
            .aggregator
            .recent_usage(&scope, query.limit, provider)
            .await?,
    ))
}

/// Organization-wide view of one provider. `type=stats` answers the full
/// rollup with top users, `type=recent` the newest records.
async fn provider_usage(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Response, ApiError> {
    let identity = authenticate(&state, &headers)?;
    let provider = Provider::from_str(&provider).map_err(UsageError::from)?;
    let scope = Scope::Organization(identity.organization_id);

    match parse_query_kind(query.kind.as_deref())? {
        ProviderQueryKind::Stats => {
            let range = parse_range(
                query.date_range.as_deref(),
                query.start.as_deref(),
                query.end.as_deref(),
            )?;
            let stats = state
                .aggregator
                .provider_stats(&scope, provider, range)
                .await?;
            Ok(Json(stats).into_response())
        }
        ProviderQueryKind::Recent => {
            let records = state
                .aggregator
                .recent_usage(&scope, query.limit, Some(provider))
                .await?;
            Ok(Json(records).into_response())
        }
    }
}

async fn subscription_status(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<SubscriptionStatus>, ApiError> {
    let identity = authenticate(&state, &headers)?;
    tracing::debug!(
        user = %identity.user_id,
        plan = %state.subscriptions.plan(&identity.user_id),
        "subscription status requested"
    );
    Ok(Json(
        state.subscriptions.subscription(&identity.user_id).await?,
    ))
}
