// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Feature-store endpoints: multipart upload, listing, download, delete.

use crate::state::AppState;
use crate::ApiError;
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use core_types::SeriesIdentity;
use manifest::{resolve_path, EntryFilter, ManifestEntry};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/features/upload", post(upload_feature))
        .route("/features", get(list_features))
        .route("/features/sets", get(list_sets))
        .route("/features/:id", get(get_feature))
        .route("/features/:id/download", get(download_feature))
        .route("/features/:id", delete(delete_feature))
}

async fn upload_feature(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(axum::http::StatusCode, Json<ManifestEntry>), ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut fields: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    while let Some(part) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = part.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = part
                .file_name()
                .map(|f| f.to_string())
                .ok_or_else(|| ApiError::Validation("file part needs a filename".into()))?;
            let bytes = part
                .bytes()
                .await
                .map_err(|err| ApiError::BadRequest(err.to_string()))?;
            file = Some((file_name, bytes.to_vec()));
        } else {
            let value = part
                .text()
                .await
                .map_err(|err| ApiError::BadRequest(err.to_string()))?;
            fields.insert(name, value);
        }
    }

    let (file_name, bytes) =
        file.ok_or_else(|| ApiError::Validation("missing file part".into()))?;
    let required = |key: &str| -> Result<String, ApiError> {
        fields
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::Validation(format!("missing field {key}")))
    };
    let identity = SeriesIdentity::new(
        &required("exchange")?,
        &required("market")?,
        &required("symbol")?,
    );
    let feature_set = required("feature_set")?;
    let version = fields
        .get("version")
        .cloned()
        .unwrap_or_else(|| "1.0.0".to_string());

    let entry = state
        .features
        .upload_bytes(&bytes, &file_name, &identity, &feature_set, &version)?;
    Ok((axum::http::StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
struct FeatureQuery {
    exchange: Option<String>,
    market: Option<String>,
    symbol: Option<String>,
    feature_set: Option<String>,
}

async fn list_features(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeatureQuery>,
) -> Result<Json<Vec<ManifestEntry>>, ApiError> {
    let filter = EntryFilter {
        exchange: query.exchange.clone(),
        market: query.market.clone(),
        symbol: query.symbol.clone(),
        data_type: query.feature_set.clone(),
        ..EntryFilter::default()
    };
    let mut entries = state.manifest.find(&filter)?;
    if query.feature_set.is_none() {
        entries.retain(|e| e.data_type != "raw" && e.data_type != "funding");
    }
    Ok(Json(entries))
}

async fn list_sets(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({ "feature_sets": state.manifest.feature_sets()? })))
}

async fn get_feature(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Json<ManifestEntry>, ApiError> {
    Ok(Json(state.manifest.get(id)?))
}

async fn download_feature(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state.manifest.get(id)?;
    let path = resolve_path(&state.config.data_root, &entry.path);
    if !path.exists() {
        return Err(ApiError::NotFound(format!(
            "file not found: {}",
            path.display()
        )));
    }
    let bytes = std::fs::read(&path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("feature_{id}"));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

async fn delete_feature(
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
