// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Download scheduling, task status, discovery, and cascading deletes.

use crate::routes::data::parse_time;
use crate::state::AppState;
use crate::ApiError;
use axum::extract::{Path as UrlPath, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use core_types::task::TaskState;
use core_types::{DataKind, SeriesIdentity};
use ingest::IngestRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ingest/download", post(download))
        .route("/ingest/bulk-download", post(bulk_download))
        .route("/ingest/status", get(status))
        .route("/ingest/tasks", delete(clear_tasks))
        .route(
            "/ingest/exchanges/:exchange/markets/:market/history",
            delete(delete_history),
        )
        .route("/ingest/exchanges", get(list_exchanges))
        .route("/ingest/exchanges/:exchange/markets", get(list_markets))
        .route("/ingest/exchanges/:exchange/symbols", get(list_symbols))
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub exchange: String,
    pub symbol: String,
    pub market: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub full_history: bool,
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_data_type() -> String {
    "raw".to_string()
}

#[derive(Debug, Serialize)]
struct TaskStatusResponse {
    task_id: String,
    status: String,
    message: String,
}

fn is_derivative_market(market: &str) -> bool {
    let market = market.to_lowercase();
    ["future", "swap", "linear", "inverse", "derivative"]
        .iter()
        .any(|kind| market.contains(kind))
}

fn schedule_download(state: &Arc<AppState>, request: DownloadRequest) -> Result<String, ApiError> {
    match request.data_type.as_str() {
        "raw" | "funding" | "both" => {}
        other => {
            return Err(ApiError::Validation(format!(
                "data_type must be raw, funding, or both, not {other:?}"
            )))
        }
    }
    let start = match &request.start_date {
        Some(raw) => Some(parse_time(raw)?),
        None => None,
    };
    let identity = SeriesIdentity::new(&request.exchange, &request.market, &request.symbol);
    let pipeline = Arc::new(state.pipeline(&request.exchange)?);

    let data_type = request.data_type.clone();
    let key = state
        .supervisor
        .enqueue(&identity, &data_type, move |handle, cancel| {
            let pipeline = pipeline;
            let request = request;
            let identity = SeriesIdentity::new(&request.exchange, &request.market, &request.symbol);
            async move {
                let mut total_rows = 0u64;
                if matches!(request.data_type.as_str(), "raw" | "both") {
                    let progress_handle = handle.clone();
                    let stats = pipeline
                        .ingest(
                            &IngestRequest {
                                identity: identity.clone(),
                                kind: DataKind::Raw,
                                period: request.timeframe.clone(),
                                start: if request.full_history { None } else { start },
                                full_history: request.full_history,
                            },
                            &cancel,
                            &move |msg: &str| progress_handle.set_message(msg),
                        )
                        .await?;
                    total_rows += stats.rows_written;
                }
                if matches!(request.data_type.as_str(), "funding" | "both")
                    && is_derivative_market(&request.market)
                {
                    handle.set_message("Fetching funding rates...");
                    let progress_handle = handle.clone();
                    let stats = pipeline
                        .ingest(
                            &IngestRequest {
                                identity: identity.clone(),
                                kind: DataKind::Funding,
                                period: "funding".to_string(),
                                start: start.or(Some(0)),
                                full_history: false,
                            },
                            &cancel,
                            &move |msg: &str| progress_handle.set_message(msg),
                        )
                        .await?;
                    total_rows += stats.rows_written;
                }

                if matches!(request.data_type.as_str(), "raw" | "both") {
                    handle.set_message("Verifying integrity...");
                    let report = pipeline.verify_integrity(
                        &identity,
                        &DataKind::Raw,
                        &request.timeframe,
                    )?;
                    if report.gap_count > 0 || report.overlap_count > 0 {
                        return Ok(format!(
                            "Finished: {} rows; found {} gaps, {} overlaps",
                            total_rows, report.gap_count, report.overlap_count
                        ));
                    }
                }
                Ok(format!("Finished (Verified): {total_rows} rows"))
            }
        })?;
    Ok(key)
}

async fn download(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let symbol = request.symbol.clone();
    let exchange = request.exchange.clone();
    let task_id = schedule_download(&state, request)?;
    Ok(Json(TaskStatusResponse {
        task_id,
        status: "pending".to_string(),
        message: format!("Queued download for {symbol} from {exchange}"),
    }))
}

#[derive(Debug, Deserialize)]
struct BulkDownloadRequest {
    exchange: String,
    market: String,
    symbols: Vec<String>,
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default = "default_data_type")]
    data_type: String,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    full_history: bool,
}

async fn bulk_download(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkDownloadRequest>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let mut queued = 0usize;
    for symbol in &request.symbols {
        let single = DownloadRequest {
            exchange: request.exchange.clone(),
            symbol: symbol.clone(),
            market: request.market.clone(),
            timeframe: request.timeframe.clone(),
            data_type: request.data_type.clone(),
            start_date: request.start_date.clone(),
            full_history: request.full_history,
        };
        match schedule_download(&state, single) {
            Ok(_) => queued += 1,
            // A symbol already in flight is skipped, not fatal.
            Err(ApiError::Conflict(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(Json(TaskStatusResponse {
        task_id: "bulk_dl".to_string(),
        status: "pending".to_string(),
        message: format!("Queued {queued} downloads from {}", request.exchange),
    }))
}

async fn status(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, TaskState>> {
    Json(state.supervisor.status())
}

async fn clear_tasks(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cleared = state.supervisor.clear_finished();
    Json(json!({ "cleared": cleared }))
}

#[derive(Debug, Deserialize)]
struct DeleteHistoryQuery {
    symbol: String,
    data_type: Option<String>,
}

async fn delete_history(
    State(state): State<Arc<AppState>>,
    UrlPath((exchange, market)): UrlPath<(String, String)>,
    Query(query): Query<DeleteHistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let identity = SeriesIdentity::new(&exchange, &market, &query.symbol);
    let kind = query.data_type.as_deref().map(DataKind::from_str);
    let deleted = state.writer.delete(&identity, kind.as_ref(), None)?;
    Ok(Json(json!({
        "status": "success",
        "deleted_entries": deleted,
        "message": format!("Deleted {deleted} entries for {}", query.symbol),
    })))
}

async fn list_exchanges(State(_state): State<Arc<AppState>>) -> Json<Value> {
    let exchanges: Vec<Value> = exchange_connector::list_exchanges()
        .into_iter()
        .map(|id| json!({ "id": id, "name": capitalize(id) }))
        .collect();
    Json(json!({ "exchanges": exchanges }))
}

async fn list_markets(
    State(state): State<Arc<AppState>>,
    UrlPath(exchange): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let connector = state.connector(&exchange)?;
    let markets: Vec<Value> = connector
        .markets()
        .into_iter()
        .map(|id| json!({ "id": id, "name": capitalize(&id) }))
        .collect();
    Ok(Json(json!({ "markets": markets })))
}

#[derive(Debug, Deserialize)]
struct SymbolsQuery {
    #[serde(default = "default_market")]
    market: String,
}

fn default_market() -> String {
    "spot".to_string()
}

async fn list_symbols(
    State(state): State<Arc<AppState>>,
    UrlPath(exchange): UrlPath<String>,
    Query(query): Query<SymbolsQuery>,
) -> Result<Json<Value>, ApiError> {
    let connector = state.connector(&exchange)?;
    let symbols = connector.list_symbols(&query.market).await?;
    Ok(Json(json!({ "symbols": symbols })))
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
