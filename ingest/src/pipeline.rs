// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! One ingestion job: resolve the start cursor, page through exchange
//! history, hand each batch to the writer, and watch continuity.
//!
//! Resume is manifest-driven: the next run of the same series starts at
//! `max(time_to) + 1`, and the writer's merge makes re-fetched rows
//! harmless, so a crashed or re-run job converges to the same on-disk
//! state as a single clean run.

use crate::IngestError;
use chrono::Utc;
use core_types::identity::period_ms;
use core_types::{DataKind, Frame, SeriesIdentity};
use exchange_connector::Connector;
use log::{info, warn};
use manifest::Manifest;
use std::sync::Arc;
use storage::{PartitionReader, PartitionWriter};
use tokio_util::sync::CancellationToken;

/// Consecutive empty pages tolerated inside the historical range before the
/// series is considered exhausted; each one jumps the cursor forward a page.
const MAX_EMPTY_JUMPS: u32 = 10;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub identity: SeriesIdentity,
    pub kind: DataKind,
    pub period: String,
    /// Explicit start (ms). Required when the manifest has no prior data
    /// and `full_history` is off.
    pub start: Option<i64>,
    /// Probe the listing date and download everything.
    pub full_history: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub rows_written: u64,
    pub batches: u64,
    pub partitions: u64,
    pub t_start: i64,
    pub t_end: i64,
}

/// Gap/overlap census over a stored series, computed from raw partition
/// timestamps before dedup.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub row_count: usize,
    pub gap_count: usize,
    pub overlap_count: usize,
    pub interval_ms: Option<i64>,
}

pub struct IngestPipeline {
    connector: Arc<Connector>,
    writer: Arc<PartitionWriter>,
    reader: Arc<PartitionReader>,
    manifest: Arc<Manifest>,
    page_limit: usize,
}

impl IngestPipeline {
    pub fn new(
        connector: Arc<Connector>,
        writer: Arc<PartitionWriter>,
        reader: Arc<PartitionReader>,
        manifest: Arc<Manifest>,
        page_limit: usize,
    ) -> Self {
        Self {
            connector,
            writer,
            reader,
            manifest,
            page_limit: page_limit.max(1),
        }
    }

    /// Run one job to completion. `progress` receives human-readable status
    /// lines for the task registry; cancellation is observed between
    /// batches, never inside a partition write.
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &CancellationToken,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<IngestStats, IngestError> {
        let identity = &request.identity;
        let period = request.period.to_lowercase();
        let step = period_ms(&period);

        let t_start = self.resolve_start(request, &period).await?;
        let t_end = Utc::now().timestamp_millis();
        let limit = self.page_limit.min(self.connector.max_page());
        info!(
            "ingest {} kind={} period={} from {} to {}",
            identity,
            request.kind,
            period,
            t_start,
            t_end
        );

        let mut stats = IngestStats {
            t_start,
            t_end,
            ..IngestStats::default()
        };
        let mut t_cursor = t_start;
        let mut prev_last_ts: Option<i64> = None;
        let mut consecutive_empty = 0u32;

        while t_cursor < t_end {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let batch = self.fetch_page(request, &period, t_cursor, limit).await?;

            if batch.is_empty() {
                // A hole inside the range (delisting window, venue outage):
                // jump one page forward before giving up on the series.
                let jump = match (&request.kind, step) {
                    (DataKind::Raw, Some(step)) => step.saturating_mul(limit as i64),
                    _ => break,
                };
                consecutive_empty += 1;
                if consecutive_empty > MAX_EMPTY_JUMPS || t_cursor.saturating_add(jump) >= t_end {
                    break;
                }
                warn!(
                    "{}: empty page at {}, jumping {}ms forward ({}/{})",
                    identity, t_cursor, jump, consecutive_empty, MAX_EMPTY_JUMPS
                );
                t_cursor += jump;
                continue;
            }
            consecutive_empty = 0;

            let (batch_first, batch_last) = batch
                .time_bounds()
                .expect("non-empty batch has time bounds");
            if batch_last < t_cursor || (batch_last == t_cursor && stats.batches > 0) {
                // Nothing newer than the cursor; bail rather than loop on
                // the same page.
                warn!("{}: no forward progress at {}", identity, t_cursor);
                break;
            }

            if let (Some(step), Some(prev_last)) = (step, prev_last_ts) {
                let expected = prev_last + step;
                if batch_first > expected {
                    warn!(
                        "{}: gap of {}ms between {} and {}",
                        identity,
                        batch_first - expected,
                        prev_last,
                        batch_first
                    );
                } else if batch_first < expected {
                    warn!(
                        "{}: overlap between {} and {}",
                        identity, prev_last, batch_first
                    );
                }
            }
            prev_last_ts = Some(batch_last);

            let results =
                self.writer
                    .write(&batch, identity, &request.kind, &period)?;
            stats.batches += 1;
            stats.rows_written += batch.len() as u64;
            stats.partitions += results.len() as u64;
            t_cursor = batch_last + 1;

            progress(&format!(
                "Fetched {} rows; cursor={}",
                stats.rows_written,
                chrono::DateTime::from_timestamp_millis(t_cursor)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| t_cursor.to_string())
            ));
        }

        info!(
            "ingest {} finished: {} rows in {} batches over {} partition writes",
            identity, stats.rows_written, stats.batches, stats.partitions
        );
        Ok(stats)
    }

    async fn resolve_start(
        &self,
        request: &IngestRequest,
        period: &str,
    ) -> Result<i64, IngestError> {
        let identity = &request.identity;
        if request.full_history {
            // Probing always speaks the candle endpoint; funding history
            // starts wherever candles start.
            let probe_period = match request.kind {
                DataKind::Raw => period,
                _ => "1m",
            };
            let listed = self
                .connector
                .probe_listing_date(&identity.market, &identity.symbol, probe_period)
                .await?;
            return listed.ok_or(IngestError::NoData);
        }
        let period_filter = match request.kind {
            DataKind::Raw => Some(period),
            _ => None,
        };
        if let Some(time_to) =
            self.manifest
                .max_time_to(identity, request.kind.as_str(), period_filter)?
        {
            info!("{}: resuming from {}", identity, time_to + 1);
            return Ok(time_to + 1);
        }
        request.start.ok_or(IngestError::MissingStart)
    }

    async fn fetch_page(
        &self,
        request: &IngestRequest,
        period: &str,
        since: i64,
        limit: usize,
    ) -> Result<Frame, IngestError> {
        let identity = &request.identity;
        let frame = match request.kind {
            DataKind::Raw => {
                self.connector
                    .fetch_ohlcv(&identity.market, &identity.symbol, period, since, limit)
                    .await?
            }
            _ => {
                self.connector
                    .fetch_funding(&identity.market, &identity.symbol, since, limit)
                    .await?
            }
        };
        Ok(frame)
    }

    /// Post-ingest census: read every stored timestamp for the series and
    /// count gaps (delta above the dominant interval) and overlaps
    /// (non-positive delta across partition seams).
    pub fn verify_integrity(
        &self,
        identity: &SeriesIdentity,
        kind: &DataKind,
        period: &str,
    ) -> Result<IntegrityReport, IngestError> {
        let frames = self.reader.read(
            identity,
            kind.as_str(),
            Some(period),
            0,
            i64::MAX,
            Some(&[]),
        )?;
        let ts: Vec<i64> = frames.iter().flat_map(|f| f.ts().iter().copied()).collect();
        if ts.len() < 2 {
            return Ok(IntegrityReport {
                row_count: ts.len(),
                ..IntegrityReport::default()
            });
        }
        let deltas: Vec<i64> = ts.windows(2).map(|w| w[1] - w[0]).collect();
        let interval = mode(&deltas);
        Ok(IntegrityReport {
            row_count: ts.len(),
            gap_count: deltas.iter().filter(|&&d| d > interval).count(),
            overlap_count: deltas.iter().filter(|&&d| d <= 0).count(),
            interval_ms: Some(interval),
        })
    }
}

fn mode(deltas: &[i64]) -> i64 {
    let mut counts = std::collections::HashMap::new();
    for &d in deltas {
        *counts.entry(d).or_insert(0u32) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(value, count)| (count, std::cmp::Reverse(value)))
        .map(|(value, _)| value)
        .unwrap_or(0)
}
