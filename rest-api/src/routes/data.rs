// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Catalog listing, range reads, dataset preview/export, and deletes.

use crate::state::AppState;
use crate::ApiError;
use axum::extract::{Path as UrlPath, Query, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use core_types::{Column, Frame, SeriesIdentity};
use manifest::{resolve_path, EntryFilter, ManifestEntry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/list", get(list_entries))
        .route("/read", get(read_range))
        .route("/datasets", get(list_datasets))
        .route("/datasets/:id/preview", get(preview_dataset))
        .route("/datasets/:id/export", get(export_dataset))
        .route("/datasets/:id", delete(delete_dataset))
        .route("/export/:exchange/:symbol", get(export_aggregated))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    exchange: Option<String>,
    market: Option<String>,
    symbol: Option<String>,
    data_type: Option<String>,
}

impl ListQuery {
    fn filter(&self) -> EntryFilter {
        EntryFilter {
            exchange: self.exchange.clone(),
            market: self.market.clone(),
            symbol: self.symbol.clone(),
            data_type: self.data_type.clone(),
            ..EntryFilter::default()
        }
    }
}

async fn list_entries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ManifestEntry>>, ApiError> {
    Ok(Json(state.manifest.find(&query.filter())?))
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    exchange: String,
    symbol: String,
    market: Option<String>,
    #[serde(default = "default_data_type")]
    data_type: String,
    period: Option<String>,
    start: String,
    end: String,
}

fn default_data_type() -> String {
    "raw".to_string()
}

async fn read_range(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<Value>, ApiError> {
    let t0 = parse_time(&query.start)?;
    let t1 = parse_time(&query.end)?;
    let identity = SeriesIdentity::new(
        &query.exchange,
        query.market.as_deref().unwrap_or(""),
        &query.symbol,
    );
    let mut frame = Frame::new();
    if query.market.is_some() {
        frame = state.reader.read_concat(
            &identity,
            &query.data_type,
            query.period.as_deref(),
            t0,
            t1,
            None,
        )?;
    } else {
        // No market given: search every market this exchange stores.
        let mut filter = EntryFilter::default();
        filter.exchange = Some(identity.exchange.clone());
        filter.symbol = Some(identity.symbol.clone());
        filter.data_type = Some(query.data_type.clone());
        let mut markets: Vec<String> = state
            .manifest
            .find(&filter)?
            .into_iter()
            .map(|e| e.market)
            .collect();
        markets.sort();
        markets.dedup();
        for market in markets {
            let identity =
                SeriesIdentity::new(&query.exchange, &market, &query.symbol);
            let part = state.reader.read_concat(
                &identity,
                &query.data_type,
                query.period.as_deref(),
                t0,
                t1,
                None,
            )?;
            if frame.is_empty() {
                frame = part;
            } else {
                frame
                    .concat(&part)
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
            }
        }
        frame.sort_dedup_by_ts();
    }
    let (columns, rows) = frame_rows(&frame);
    Ok(Json(json!({ "columns": columns, "rows": rows })))
}

#[derive(Debug, Deserialize)]
struct DatasetQuery {
    exchange: Option<String>,
    market: Option<String>,
    symbol: Option<String>,
    data_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
struct Dataset {
    id: String,
    exchange: String,
    symbol: String,
    market: String,
    timeframe: Option<String>,
    data_type: String,
    file_path: String,
    file_size_bytes: i64,
    last_modified: String,
    time_from: Option<String>,
    time_to: Option<String>,
}

async fn list_datasets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DatasetQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = EntryFilter {
        exchange: query.exchange.clone(),
        market: query.market.clone(),
        symbol: query.symbol.clone(),
        data_type: query.data_type.clone(),
        ..EntryFilter::default()
    };
    let entries = state.manifest.find(&filter)?;
    let total = entries.len();
    let datasets: Vec<Dataset> = entries
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .map(|entry| dataset_view(&state, entry))
        .collect();
    Ok(Json(json!({ "datasets": datasets, "total": total })))
}

fn dataset_view(state: &AppState, entry: ManifestEntry) -> Dataset {
    let path = resolve_path(&state.config.data_root, &entry.path);
    Dataset {
        id: entry.id.to_string(),
        exchange: entry.exchange,
        symbol: entry.symbol,
        market: entry.market,
        timeframe: entry.period,
        data_type: entry.data_type,
        file_path: path.to_string_lossy().to_string(),
        file_size_bytes: entry.file_size,
        last_modified: entry.last_modified,
        time_from: entry.time_from.map(iso_ms),
        time_to: entry.time_to.map(iso_ms),
    }
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    #[serde(default = "default_preview_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_preview_limit() -> usize {
    100
}

async fn preview_dataset(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<Value>, ApiError> {
    let entry = state.manifest.get(id)?;
    let path = resolve_path(&state.config.data_root, &entry.path);
    if !path.exists() {
        return Err(ApiError::NotFound(format!(
            "file not found: {}",
            path.display()
        )));
    }
    let frame = storage::codec::read_parquet(&path, None)?;
    let total_rows = frame.len();
    let lo = query.offset.min(total_rows);
    let hi = (query.offset + query.limit).min(total_rows);
    let window = slice_frame(&frame, lo, hi);
    let (columns, rows) = frame_rows(&window);
    Ok(Json(json!({
        "columns": columns,
        "rows": rows,
        "total_rows": total_rows,
        "metadata": {
            "timeframe": entry.period,
            "symbol": entry.symbol,
            "data_type": entry.data_type,
        },
    })))
}

async fn export_dataset(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Json<Value>, ApiError> {
    let entry = state.manifest.get(id)?;
    let path = resolve_path(&state.config.data_root, &entry.path);
    if !path.exists() {
        return Err(ApiError::NotFound(format!(
            "file not found: {}",
            path.display()
        )));
    }
    let frame = storage::codec::read_parquet(&path, None)?;
    write_ticker_export(&state, &entry.exchange, &entry.market, &entry.symbol, &frame)
        .map(Json)
}

async fn delete_dataset(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Json<Value>, ApiError> {
    let entry = state.manifest.delete_by_id(id)?;
    let path = resolve_path(&state.config.data_root, &entry.path);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(Json(json!({ "status": "success" })))
}

#[derive(Debug, Deserialize)]
struct AggregatedQuery {
    market: Option<String>,
}

/// Concatenate every 1m raw partition for the symbol and write the legacy
/// `dl_<SYMBOL>_<EXCHANGE>_<MARKET>.csv.txt` export file.
async fn export_aggregated(
    State(state): State<Arc<AppState>>,
    UrlPath((exchange, symbol)): UrlPath<(String, String)>,
    Query(query): Query<AggregatedQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut filter = EntryFilter::default();
    filter.exchange = Some(exchange.clone());
    filter.symbol = Some(symbol.clone());
    filter.data_type = Some("raw".to_string());
    filter.period = Some("1m".to_string());
    filter.market = query.market.clone();
    let entries = state.manifest.find(&filter)?;
    let Some(first) = entries.first() else {
        return Err(ApiError::NotFound(format!(
            "no 1m raw data found for {symbol} on {exchange}"
        )));
    };
    let market = first.market.clone();
    let identity = SeriesIdentity::new(&exchange, &market, &symbol);
    let frame = state
        .reader
        .read_concat(&identity, "raw", Some("1m"), 0, i64::MAX, None)?;
    if frame.is_empty() {
        return Err(ApiError::NotFound(format!(
            "no rows stored for {symbol} on {exchange}"
        )));
    }
    write_ticker_export(&state, &identity.exchange, &market, &identity.symbol, &frame).map(Json)
}

/// CSV export in the downstream research format:
/// `<TICKER>,<PER>,<DATE>,<TIME>,<OPEN>,<HIGH>,<LOW>,<CLOSE>,<VOL>`.
fn write_ticker_export(
    state: &AppState,
    exchange: &str,
    market: &str,
    symbol: &str,
    frame: &Frame,
) -> Result<Value, ApiError> {
    let f64_column = |name: &str| -> Result<&Vec<Option<f64>>, ApiError> {
        match frame.column(name) {
            Some(Column::F64(values)) => Ok(values),
            _ => Err(ApiError::BadRequest(format!(
                "dataset has no numeric {name} column"
            ))),
        }
    };
    let open = f64_column("open")?;
    let high = f64_column("high")?;
    let low = f64_column("low")?;
    let close = f64_column("close")?;
    let volume = f64_column("volume")?;

    let clean_symbol = symbol.replace('_', "");
    let export_dir = state.config.export_dir.join(exchange).join(market);
    std::fs::create_dir_all(&export_dir)?;
    let filename = format!("dl_{clean_symbol}_{exchange}_{market}.csv.txt");
    let export_path = export_dir.join(&filename);

    let mut body =
        String::from("<TICKER>,<PER>,<DATE>,<TIME>,<OPEN>,<HIGH>,<LOW>,<CLOSE>,<VOL>\n");
    for (i, &ts) in frame.ts().iter().enumerate() {
        let dt = DateTime::from_timestamp_millis(ts)
            .ok_or_else(|| ApiError::Internal(format!("timestamp {ts} out of range")))?;
        body.push_str(&format!(
            "{},1,{},{},{},{},{},{},{}\n",
            clean_symbol,
            dt.format("%Y%m%d"),
            dt.format("%H%M%S"),
            fmt_cell(open.get(i)),
            fmt_cell(high.get(i)),
            fmt_cell(low.get(i)),
            fmt_cell(close.get(i)),
            fmt_cell(volume.get(i)),
        ));
    }
    std::fs::write(&export_path, body)?;
    Ok(json!({
        "status": "success",
        "filename": filename,
        "path": export_path.to_string_lossy(),
        "rows_exported": frame.len(),
    }))
}

fn fmt_cell(value: Option<&Option<f64>>) -> String {
    match value.copied().flatten() {
        Some(v) => format!("{v}"),
        None => String::new(),
    }
}

/// Accepts epoch milliseconds, `YYYY-MM-DD`, or RFC 3339.
pub fn parse_time(raw: &str) -> Result<i64, ApiError> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit() || c == '-') {
        if let Ok(ms) = raw.parse::<i64>() {
            return Ok(ms);
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            let dt = date
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc();
            return Ok(dt.timestamp_millis());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    Err(ApiError::Validation(format!(
        "cannot parse timestamp {raw:?}; use epoch ms, YYYY-MM-DD, or RFC 3339"
    )))
}

pub fn iso_ms(ts: i64) -> String {
    DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Rows `[t0, t1)` of a frame by position.
fn slice_frame(frame: &Frame, t0: usize, t1: usize) -> Frame {
    let mut out = Frame::from_ts(frame.ts()[t0..t1].to_vec());
    for (name, column) in frame.columns() {
        let sliced = match column {
            Column::F64(values) => Column::F64(values[t0..t1].to_vec()),
            Column::I64(values) => Column::I64(values[t0..t1].to_vec()),
            Column::Str(values) => Column::Str(values[t0..t1].to_vec()),
        };
        out = out
            .with_column(name, sliced)
            .expect("slice keeps column lengths aligned");
    }
    out
}

/// Column-major frame to row-major JSON.
pub fn frame_rows(frame: &Frame) -> (Vec<String>, Vec<Value>) {
    let mut columns = vec!["ts".to_string()];
    columns.extend(frame.column_names().iter().map(|s| s.to_string()));
    let rows = frame
        .ts()
        .iter()
        .enumerate()
        .map(|(i, &ts)| {
            let mut row = serde_json::Map::new();
            row.insert("ts".to_string(), json!(ts));
            for (name, column) in frame.columns() {
                let value = match column {
                    Column::F64(values) => json!(values[i]),
                    Column::I64(values) => json!(values[i]),
                    Column::Str(values) => json!(values[i]),
                };
                row.insert(name.to_string(), value);
            }
            Value::Object(row)
        })
        .collect();
    (columns, rows)
}
