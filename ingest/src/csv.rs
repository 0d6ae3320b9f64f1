// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Streaming CSV ingestion.
//!
//! Files stream through in bounded chunks; each chunk goes through the
//! partition writer, so the on-disk result is indistinguishable from an
//! API-sourced ingest. A header row must carry `ts`; headerless files are
//! accepted when they match the fixed six-column candle layout.

use crate::IngestError;
use core_types::{Column, DataKind, Frame, SeriesIdentity};
use log::info;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use storage::PartitionWriter;

pub const DEFAULT_CHUNK_ROWS: usize = 250_000;
const CANDLE_COLUMNS: [&str; 6] = ["ts", "open", "high", "low", "close", "volume"];

#[derive(Debug, Clone, Default)]
pub struct CsvStats {
    pub rows: u64,
    pub chunks: u64,
    pub partitions: u64,
}

pub struct CsvIngestor {
    writer: Arc<PartitionWriter>,
}

/// Per-column accumulator. The cell type is decided by the first non-empty
/// value seen in the file and must hold for every later row.
enum ColumnBuilder {
    Unknown(usize),
    F64(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
}

impl ColumnBuilder {
    fn push(&mut self, raw: &str, column: &str) -> Result<(), IngestError> {
        let raw = raw.trim();
        match self {
            ColumnBuilder::Unknown(nulls) => {
                if raw.is_empty() {
                    *nulls += 1;
                    return Ok(());
                }
                let nulls = *nulls;
                *self = match raw.parse::<f64>() {
                    Ok(value) => {
                        let mut values = vec![None; nulls];
                        values.push(Some(value));
                        ColumnBuilder::F64(values)
                    }
                    Err(_) => {
                        let mut values = vec![None; nulls];
                        values.push(Some(raw.to_string()));
                        ColumnBuilder::Str(values)
                    }
                };
                Ok(())
            }
            ColumnBuilder::F64(values) => {
                if raw.is_empty() {
                    values.push(None);
                    return Ok(());
                }
                let value = raw.parse::<f64>().map_err(|_| {
                    IngestError::SchemaMismatch(format!(
                        "column {column} is numeric but holds {raw:?}"
                    ))
                })?;
                values.push(Some(value));
                Ok(())
            }
            ColumnBuilder::Str(values) => {
                values.push((!raw.is_empty()).then(|| raw.to_string()));
                Ok(())
            }
        }
    }

    fn drain(&mut self, len: usize) -> Column {
        match self {
            // A column that stayed empty for the whole chunk.
            ColumnBuilder::Unknown(nulls) => {
                *nulls = 0;
                Column::F64(vec![None; len])
            }
            ColumnBuilder::F64(values) => Column::F64(std::mem::take(values)),
            ColumnBuilder::Str(values) => Column::Str(std::mem::take(values)),
        }
    }
}

impl CsvIngestor {
    pub fn new(writer: Arc<PartitionWriter>) -> Self {
        Self { writer }
    }

    pub fn ingest(
        &self,
        path: &Path,
        identity: &SeriesIdentity,
        kind: &DataKind,
        period: &str,
        chunk_rows: usize,
    ) -> Result<CsvStats, IngestError> {
        let chunk_rows = chunk_rows.max(1);
        let columns = resolve_columns(path)?;
        let has_headers = columns.header_row;
        let names = columns.names;
        let ts_index = names
            .iter()
            .position(|n| n == "ts")
            .expect("resolve_columns guarantees a ts column");

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(has_headers)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut stats = CsvStats::default();
        let mut ts: Vec<i64> = Vec::new();
        let mut builders: BTreeMap<String, ColumnBuilder> = names
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != ts_index)
            .map(|(_, n)| (n.clone(), ColumnBuilder::Unknown(0)))
            .collect();

        for record in reader.records() {
            let record = record?;
            let raw_ts = record.get(ts_index).unwrap_or("");
            let parsed = raw_ts
                .trim()
                .parse::<f64>()
                .map_err(|_| {
                    IngestError::SchemaMismatch(format!("non-numeric ts value {raw_ts:?}"))
                })?;
            ts.push(parsed as i64);
            for (index, name) in names.iter().enumerate() {
                if index == ts_index {
                    continue;
                }
                let cell = record.get(index).unwrap_or("");
                builders
                    .get_mut(name)
                    .expect("builder per column")
                    .push(cell, name)?;
            }
            if ts.len() >= chunk_rows {
                self.flush_chunk(&mut ts, &mut builders, identity, kind, period, &mut stats)?;
            }
        }
        if !ts.is_empty() {
            self.flush_chunk(&mut ts, &mut builders, identity, kind, period, &mut stats)?;
        }
        info!(
            "csv ingest {:?} -> {}: {} rows in {} chunks",
            path, identity, stats.rows, stats.chunks
        );
        Ok(stats)
    }

    fn flush_chunk(
        &self,
        ts: &mut Vec<i64>,
        builders: &mut BTreeMap<String, ColumnBuilder>,
        identity: &SeriesIdentity,
        kind: &DataKind,
        period: &str,
        stats: &mut CsvStats,
    ) -> Result<(), IngestError> {
        let len = ts.len();
        let mut frame = Frame::from_ts(std::mem::take(ts));
        for (name, builder) in builders.iter_mut() {
            frame = frame.with_column(name, builder.drain(len))?;
        }
        let results = self.writer.write(&frame, identity, kind, period)?;
        stats.rows += len as u64;
        stats.chunks += 1;
        stats.partitions += results.len() as u64;
        Ok(())
    }
}

struct ResolvedColumns {
    names: Vec<String>,
    header_row: bool,
}

/// Sniff the first row. A header containing `ts` wins; otherwise a fully
/// numeric six-column row is taken as a headerless candle file.
fn resolve_columns(path: &Path) -> Result<ResolvedColumns, IngestError> {
    let mut sniffer = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut first = csv::StringRecord::new();
    if !sniffer.read_record(&mut first)? {
        return Err(IngestError::SchemaMismatch("csv file is empty".to_string()));
    }
    let fields: Vec<String> = first.iter().map(|f| f.to_lowercase()).collect();
    if fields.iter().any(|f| f == "ts") {
        return Ok(ResolvedColumns {
            names: fields,
            header_row: true,
        });
    }
    let all_numeric = first.iter().all(|f| f.trim().parse::<f64>().is_ok());
    if first.len() == CANDLE_COLUMNS.len() && all_numeric {
        return Ok(ResolvedColumns {
            names: CANDLE_COLUMNS.iter().map(|s| s.to_string()).collect(),
            header_row: false,
        });
    }
    Err(IngestError::SchemaMismatch(format!(
        "csv has no ts column and {} columns do not match the candle layout",
        first.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::config::CompressionCodec;
    use manifest::{EntryFilter, Manifest};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Manifest>, CsvIngestor) {
        let dir = TempDir::new().unwrap();
        let manifest = Arc::new(Manifest::open(&dir.path().join("manifest.db")).unwrap());
        let writer = Arc::new(PartitionWriter::new(
            dir.path(),
            CompressionCodec::Snappy,
            Arc::clone(&manifest),
        ));
        (dir, manifest, CsvIngestor::new(writer))
    }

    fn identity() -> SeriesIdentity {
        SeriesIdentity::new("binance", "spot", "BTCUSDT")
    }

    #[test]
    fn ingests_headered_csv_in_chunks() {
        let (dir, manifest, ingestor) = setup();
        let csv_path = dir.path().join("in.csv");
        let mut body = String::from("ts,open,high,low,close,volume\n");
        for i in 0..10 {
            body.push_str(&format!("{},1,2,0.5,1.5,{}\n", i * 60_000, i));
        }
        std::fs::write(&csv_path, body).unwrap();

        let stats = ingestor
            .ingest(&csv_path, &identity(), &DataKind::Raw, "1m", 4)
            .unwrap();
        assert_eq!(stats.rows, 10);
        assert_eq!(stats.chunks, 3);

        let rows = manifest.find(&EntryFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_count, 10);
    }

    #[test]
    fn headerless_six_column_file_uses_candle_layout() {
        let (dir, manifest, ingestor) = setup();
        let csv_path = dir.path().join("in.csv");
        std::fs::write(&csv_path, "0,1,2,0.5,1.5,10\n60000,2,3,1.5,2.5,20\n").unwrap();

        let stats = ingestor
            .ingest(
                &csv_path,
                &identity(),
                &DataKind::Raw,
                "1m",
                DEFAULT_CHUNK_ROWS,
            )
            .unwrap();
        assert_eq!(stats.rows, 2);

        let rows = manifest.find(&EntryFilter::default()).unwrap();
        assert_eq!(rows[0].row_count, 2);
    }

    #[test]
    fn missing_ts_and_wrong_width_is_rejected() {
        let (dir, _manifest, ingestor) = setup();
        let csv_path = dir.path().join("in.csv");
        std::fs::write(&csv_path, "time,price\n1,2\n").unwrap();

        let err = ingestor
            .ingest(
                &csv_path,
                &identity(),
                &DataKind::Raw,
                "1m",
                DEFAULT_CHUNK_ROWS,
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch(_)));
    }

    #[test]
    fn string_columns_survive_the_trip() {
        let (dir, _manifest, ingestor) = setup();
        let csv_path = dir.path().join("in.csv");
        std::fs::write(
            &csv_path,
            "ts,funding_rate,source\n0,0.0001,predicted\n60000,0.0002,settled\n",
        )
        .unwrap();

        let stats = ingestor
            .ingest(
                &csv_path,
                &identity(),
                &DataKind::Funding,
                "funding",
                DEFAULT_CHUNK_ROWS,
            )
            .unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.partitions, 1);
    }
}
