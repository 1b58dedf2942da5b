//! Axum JSON API over the MOF read façade.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Datelike, NaiveDate, Utc};
use mof_analytics::{
    threshold_eras, ContractStats, QueryService, RoundNumberCluster, SearchPage, SplitCluster, SupplierGrowth,
    ThresholdCluster, ThresholdEra, DEFAULT_TOP_N,
};
use mof_core::stats::{BoroughScorecard, BoroughStats};
use mof_core::{Contract, DateRange, IngestionRun};
use mof_storage::{AreaAttribute, RecordTable, SearchSort, Store, StoreError};
use mof_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const CRATE_NAME: &str = "mof-web";
pub const DEFAULT_PORT: u16 = 8000;
const DEFAULT_RUN_LIMIT: i64 = 20;
const MAX_RUN_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
}

impl AppState {
    pub fn new(service: QueryService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store read failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/permits/stats", get(borough_stats_handler))
        .route("/api/permits/scorecards", get(scorecards_handler))
        .route("/api/contracts/stats", get(contract_stats_handler))
        .route("/api/contracts/search", get(search_handler))
        .route("/api/contracts/{id}", get(contract_handler))
        .route("/api/forensics/eras", get(eras_handler))
        .route("/api/forensics/thresholds", get(thresholds_handler))
        .route("/api/forensics/splits", get(splits_handler))
        .route("/api/forensics/round-numbers", get(round_numbers_handler))
        .route("/api/forensics/growth", get(growth_handler))
        .route("/api/runs", get(runs_handler))
        .route("/api/areas/{slug}/population", get(population_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("MOF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let config = SyncConfig::from_env();
    let store = Store::connect(&config.database_url).await?;
    let state = AppState::new(QueryService::new(store));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, database = %config.database_url, "serving MOF API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn current_year() -> i32 {
    Utc::now().year()
}

#[derive(Debug, Default, Deserialize)]
struct YearParams {
    year: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct RangeParams {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    year: Option<i32>,
    top: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    year: Option<i32>,
    q: Option<String>,
    page: Option<u32>,
    sort: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RunsParams {
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct PopulationParams {
    as_of: Option<NaiveDate>,
}

/// Explicit `from`/`to` wins; otherwise the calendar year (current by default).
fn resolve_range(from: Option<NaiveDate>, to: Option<NaiveDate>, year: Option<i32>) -> Result<DateRange, ApiError> {
    match (from, to) {
        (Some(from), Some(to)) => Ok(DateRange::new(from, to)),
        (None, None) => {
            let year = year.unwrap_or_else(current_year);
            DateRange::calendar_year(year).ok_or_else(|| ApiError::BadRequest(format!("invalid year {year}")))
        }
        _ => Err(ApiError::BadRequest("from and to must be given together".to_string())),
    }
}

impl RangeParams {
    fn range(&self) -> Result<DateRange, ApiError> {
        resolve_range(self.from, self.to, self.year)
    }

    fn top_n(&self) -> usize {
        self.top.filter(|n| *n > 0).unwrap_or(DEFAULT_TOP_N)
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    permits: i64,
    contracts: i64,
}

async fn health_handler(State(state): State<AppState>) -> ApiResult<Health> {
    let store = state.service.store();
    Ok(Json(Health {
        status: "ok",
        permits: store.count_rows(RecordTable::Permits).await?,
        contracts: store.count_rows(RecordTable::Contracts).await?,
    }))
}

async fn borough_stats_handler(
    State(state): State<AppState>,
    Query(params): Query<YearParams>,
) -> ApiResult<Vec<BoroughStats>> {
    let year = params.year.unwrap_or_else(current_year);
    Ok(Json(state.service.request().borough_stats(year).await?))
}

async fn scorecards_handler(
    State(state): State<AppState>,
    Query(params): Query<YearParams>,
) -> ApiResult<Vec<BoroughScorecard>> {
    let year = params.year.unwrap_or_else(current_year);
    Ok(Json(state.service.request().borough_scorecards(year).await?))
}

async fn contract_stats_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<ContractStats> {
    let range = params.range()?;
    Ok(Json(state.service.request().contract_stats(&range).await?))
}

async fn search_handler(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult<SearchPage> {
    let range = resolve_range(params.from, params.to, params.year)?;
    let sort = match params.sort.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse::<SearchSort>().map_err(ApiError::BadRequest)?,
        None => SearchSort::default(),
    };
    let page = params.page.unwrap_or(1);
    let query = params.q.unwrap_or_default();
    Ok(Json(state.service.request().search(&range, &query, page, sort).await?))
}

async fn contract_handler(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Contract> {
    state
        .service
        .store()
        .contract(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("contract {id}")))
}

async fn eras_handler() -> Json<&'static [ThresholdEra]> {
    Json(threshold_eras())
}

async fn thresholds_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Vec<ThresholdCluster>> {
    let range = params.range()?;
    Ok(Json(state.service.request().threshold_clustering(&range).await?))
}

async fn splits_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Vec<SplitCluster>> {
    let range = params.range()?;
    Ok(Json(state.service.request().split_detection(&range, params.top_n()).await?))
}

async fn round_numbers_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Vec<RoundNumberCluster>> {
    let range = params.range()?;
    Ok(Json(state.service.request().round_numbers(&range).await?))
}

async fn growth_handler(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Vec<SupplierGrowth>> {
    let range = params.range()?;
    Ok(Json(state.service.request().growth(&range, params.top_n()).await?))
}

async fn runs_handler(State(state): State<AppState>, Query(params): Query<RunsParams>) -> ApiResult<Vec<IngestionRun>> {
    let limit = params.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    Ok(Json(state.service.request().recent_runs(limit).await?))
}

async fn population_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<PopulationParams>,
) -> ApiResult<AreaAttribute> {
    let as_of = params.as_of.unwrap_or_else(|| Utc::now().date_naive());
    state
        .service
        .request()
        .area_population(&slug, as_of)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no population for {slug} as of {as_of}")))
}
