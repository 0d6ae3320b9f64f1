// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Frame ↔ Arrow conversion and Parquet file encode/decode.
//!
//! The dynamic column model stays at the crate boundary; Arrow types never
//! leave this module.

use crate::StorageError;
use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use core_types::config::CompressionCodec;
use core_types::{Column, Frame};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

pub const TS_COLUMN: &str = "ts";

pub fn frame_to_record_batch(frame: &Frame) -> Result<RecordBatch, StorageError> {
    let mut fields = vec![Field::new(TS_COLUMN, DataType::Int64, false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(frame.ts().to_vec()))];
    for (name, column) in frame.columns() {
        let (field, array): (Field, ArrayRef) = match column {
            Column::F64(values) => (
                Field::new(name, DataType::Float64, true),
                Arc::new(Float64Array::from(values.clone())),
            ),
            Column::I64(values) => (
                Field::new(name, DataType::Int64, true),
                Arc::new(Int64Array::from(values.clone())),
            ),
            Column::Str(values) => (
                Field::new(name, DataType::Utf8, true),
                Arc::new(StringArray::from(values.clone())),
            ),
        };
        fields.push(field);
        arrays.push(array);
    }
    let schema: SchemaRef = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}

pub fn record_batch_to_frame(batch: &RecordBatch) -> Result<Frame, StorageError> {
    let ts_index = batch
        .schema()
        .index_of(TS_COLUMN)
        .map_err(|_| StorageError::SchemaMismatch("ts column missing".to_string()))?;
    let ts = batch
        .column(ts_index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StorageError::SchemaMismatch("ts must be int64".to_string()))?;
    if ts.null_count() > 0 {
        return Err(StorageError::SchemaMismatch(
            "ts contains nulls".to_string(),
        ));
    }
    let mut frame = Frame::from_ts(ts.values().to_vec());
    for (index, field) in batch.schema().fields().iter().enumerate() {
        if index == ts_index {
            continue;
        }
        let array = batch.column(index);
        let column = match field.data_type() {
            DataType::Float64 => {
                let values = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .expect("float64 field downcast");
                Column::F64(
                    (0..values.len())
                        .map(|i| (!values.is_null(i)).then(|| values.value(i)))
                        .collect(),
                )
            }
            DataType::Int64 => {
                let values = array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("int64 field downcast");
                Column::I64(
                    (0..values.len())
                        .map(|i| (!values.is_null(i)).then(|| values.value(i)))
                        .collect(),
                )
            }
            DataType::Utf8 => {
                let values = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .expect("utf8 field downcast");
                Column::Str(
                    (0..values.len())
                        .map(|i| (!values.is_null(i)).then(|| values.value(i).to_string()))
                        .collect(),
                )
            }
            other => {
                return Err(StorageError::SchemaMismatch(format!(
                    "unsupported column type {other} for {}",
                    field.name()
                )))
            }
        };
        frame = frame.with_column(field.name(), column)?;
    }
    Ok(frame)
}

/// Encode a frame into `path`. Compression settings are fixed per codec so
/// identical frames produce identical bytes.
pub fn write_parquet(
    path: &Path,
    frame: &Frame,
    codec: CompressionCodec,
) -> Result<(), StorageError> {
    let batch = frame_to_record_batch(frame)?;
    let compression = match codec {
        CompressionCodec::Snappy => Compression::SNAPPY,
        CompressionCodec::Zstd => Compression::ZSTD(Default::default()),
    };
    let props = WriterProperties::builder()
        .set_compression(compression)
        .build();
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Decode `path` into a frame, optionally projecting to a subset of columns
/// (`ts` is always included). Unknown names are ignored.
pub fn read_parquet(path: &Path, columns: Option<&[&str]>) -> Result<Frame, StorageError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = match columns {
        Some(names) => {
            let available = builder.schema().clone();
            let keep: Vec<&str> = available
                .fields()
                .iter()
                .map(|f| f.name().as_str())
                .filter(|name| *name == TS_COLUMN || names.contains(name))
                .collect();
            let parquet_schema = builder.parquet_schema();
            let indices = (0..parquet_schema.num_columns())
                .filter(|&i| keep.contains(&parquet_schema.column(i).name()))
                .collect::<Vec<_>>();
            let mask = ProjectionMask::leaves(parquet_schema, indices);
            builder.with_projection(mask).build()?
        }
        None => builder.build()?,
    };
    let mut frame = Frame::new();
    for batch in reader {
        let decoded = record_batch_to_frame(&batch?)?;
        if frame.is_empty() {
            frame = decoded;
        } else {
            frame.concat(&decoded)?;
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Candle;
    use tempfile::TempDir;

    fn sample_frame() -> Frame {
        Frame::from_candles(&[
            Candle {
                ts: 0,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
            },
            Candle {
                ts: 60_000,
                open: 1.5,
                high: 3.0,
                low: 1.0,
                close: 2.0,
                volume: 20.0,
            },
        ])
    }

    #[test]
    fn round_trips_through_parquet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.parquet");
        let frame = sample_frame();
        write_parquet(&path, &frame, CompressionCodec::Snappy).unwrap();
        let back = read_parquet(&path, None).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn projection_keeps_ts_and_requested_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.parquet");
        write_parquet(&path, &sample_frame(), CompressionCodec::Snappy).unwrap();
        let projected = read_parquet(&path, Some(&["close", "no_such_column"])).unwrap();
        assert_eq!(projected.column_names(), vec!["close"]);
        assert_eq!(projected.ts(), &[0, 60_000]);
    }

    #[test]
    fn identical_frames_encode_to_identical_bytes() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.parquet");
        let b = dir.path().join("b.parquet");
        write_parquet(&a, &sample_frame(), CompressionCodec::Snappy).unwrap();
        write_parquet(&b, &sample_frame(), CompressionCodec::Snappy).unwrap();
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }
}
