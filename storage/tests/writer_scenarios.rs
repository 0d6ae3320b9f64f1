//! End-to-end scenarios for the partition writer and reader against a real
//! temp directory and manifest.

use core_types::config::CompressionCodec;
use core_types::frame::MS_PER_DAY;
use core_types::{Column, DataKind, Frame, SeriesIdentity};
use manifest::{EntryFilter, Manifest};
use std::sync::Arc;
use storage::{sha256_file, PartitionReader, PartitionWriter, StorageError};
use tempfile::TempDir;

fn setup() -> (TempDir, Arc<Manifest>, PartitionWriter) {
    let dir = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::open(&dir.path().join("manifest.db")).unwrap());
    let writer = PartitionWriter::new(
        dir.path(),
        CompressionCodec::Snappy,
        Arc::clone(&manifest),
    );
    (dir, manifest, writer)
}

fn identity() -> SeriesIdentity {
    SeriesIdentity::new("BINANCE", "SPOT", "BTCUSDT")
}

fn frame(ts: &[i64], close: &[f64]) -> Frame {
    Frame::from_ts(ts.to_vec())
        .with_column(
            "close",
            Column::F64(close.iter().map(|&v| Some(v)).collect()),
        )
        .unwrap()
}

#[test]
fn basic_merge_dedups_and_resorts() {
    let (_dir, manifest, writer) = setup();
    let identity = identity();

    writer
        .write(
            &frame(&[0, 60_000, 120_000], &[1.0, 2.0, 3.0]),
            &identity,
            &DataKind::Raw,
            "1m",
        )
        .unwrap();
    let results = writer
        .write(
            &frame(&[60_000, 180_000], &[9.0, 4.0]),
            &identity,
            &DataKind::Raw,
            "1m",
        )
        .unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.row_count, 4);
    assert_eq!(result.time_from, 0);
    assert_eq!(result.time_to, 180_000);

    let rows = manifest.find(&EntryFilter::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_count, 4);
    assert_eq!(rows[0].time_from, Some(0));
    assert_eq!(rows[0].time_to, Some(180_000));

    let merged = storage::codec::read_parquet(&result.path, None).unwrap();
    assert_eq!(merged.ts(), &[0, 60_000, 120_000, 180_000]);
    let Column::F64(close) = merged.column("close").unwrap() else {
        panic!("close column type changed");
    };
    assert_eq!(close, &vec![Some(1.0), Some(9.0), Some(3.0), Some(4.0)]);
}

#[test]
fn day_boundary_record_splits_into_two_partitions() {
    let (_dir, _manifest, writer) = setup();
    let results = writer
        .write(
            &frame(&[86_399_000, 86_400_000], &[1.0, 2.0]),
            &identity(),
            &DataKind::Raw,
            "1m",
        )
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].day, 0);
    assert_eq!(results[0].row_count, 1);
    assert_eq!(results[1].day, 1);
    assert_eq!(results[1].row_count, 1);
    assert!(results[0].path.to_string_lossy().contains("1970/01/01"));
    assert!(results[1].path.to_string_lossy().contains("1970/01/02"));
}

#[test]
fn rewriting_the_same_batch_is_byte_idempotent() {
    let (_dir, manifest, writer) = setup();
    let identity = identity();
    let batch = frame(&[0, 60_000], &[1.0, 2.0]);

    let first = writer
        .write(&batch, &identity, &DataKind::Raw, "1m")
        .unwrap();
    let first_bytes = std::fs::read(&first[0].path).unwrap();
    let first_checksum = first[0].checksum.clone();

    let second = writer
        .write(&batch, &identity, &DataKind::Raw, "1m")
        .unwrap();
    let second_bytes = std::fs::read(&second[0].path).unwrap();

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first_checksum, second[0].checksum);
    assert_eq!(manifest.find(&EntryFilter::default()).unwrap().len(), 1);
}

#[test]
fn split_writes_equal_one_combined_write() {
    let (_dir, _manifest, writer) = setup();
    let identity = identity();

    let combined = frame(&[0, 60_000, 120_000], &[1.0, 2.0, 3.0]);
    let combined_checksum = writer
        .write(&combined, &identity, &DataKind::Raw, "1m")
        .unwrap()[0]
        .checksum
        .clone();

    let (_dir2, _manifest2, writer2) = setup();
    writer2
        .write(&frame(&[0, 60_000], &[1.0, 2.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    let results = writer2
        .write(&frame(&[120_000], &[3.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();

    assert_eq!(results[0].checksum, combined_checksum);
}

#[test]
fn stale_temp_file_is_cleaned_on_next_write() {
    let (_dir, _manifest, writer) = setup();
    let identity = identity();
    let results = writer
        .write(&frame(&[0], &[1.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    let partition = results[0].path.clone();

    // Simulate a crash between temp write and rename.
    let stale = partition.with_file_name(format!(
        "{}.tmp.deadbeef",
        partition.file_name().unwrap().to_string_lossy()
    ));
    std::fs::write(&stale, b"partial").unwrap();

    writer
        .write(&frame(&[60_000], &[2.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    assert!(!stale.exists());
    assert!(partition.exists());
}

#[test]
fn corrupt_existing_partition_is_quarantined() {
    let (_dir, _manifest, writer) = setup();
    let identity = identity();
    let results = writer
        .write(&frame(&[0], &[1.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    let partition = results[0].path.clone();

    std::fs::write(&partition, b"this is not parquet").unwrap();

    let rewrite = writer
        .write(&frame(&[60_000], &[2.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    assert_eq!(rewrite[0].row_count, 1, "corrupt data starts a fresh partition");

    let parent = partition.parent().unwrap();
    let quarantined = std::fs::read_dir(parent)
        .unwrap()
        .flatten()
        .any(|e| e.file_name().to_string_lossy().contains(".corrupt."));
    assert!(quarantined);
}

#[test]
fn schema_union_backfills_nulls_both_ways() {
    let (_dir, _manifest, writer) = setup();
    let identity = identity();

    writer
        .write(&frame(&[0], &[1.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    let extended = Frame::from_ts(vec![60_000])
        .with_column("close", Column::F64(vec![Some(2.0)]))
        .unwrap()
        .with_column("trades", Column::I64(vec![Some(42)]))
        .unwrap();
    let results = writer
        .write(&extended, &identity, &DataKind::Raw, "1m")
        .unwrap();

    let merged = storage::codec::read_parquet(&results[0].path, None).unwrap();
    let Column::I64(trades) = merged.column("trades").unwrap() else {
        panic!("trades column missing after union");
    };
    assert_eq!(trades, &vec![None, Some(42)]);
}

#[test]
fn manifest_row_matches_file_on_disk() {
    let (dir, manifest, writer) = setup();
    writer
        .write(
            &frame(&[0, 60_000], &[1.0, 2.0]),
            &identity(),
            &DataKind::Raw,
            "1m",
        )
        .unwrap();

    for row in manifest.find(&EntryFilter::default()).unwrap() {
        let path = manifest::resolve_path(dir.path(), &row.path);
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len() as i64, row.file_size);
        assert_eq!(sha256_file(&path).unwrap(), row.checksum);
        let frame = storage::codec::read_parquet(&path, None).unwrap();
        assert_eq!(frame.len() as i64, row.row_count);
        let (lo, hi) = frame.time_bounds().unwrap();
        assert_eq!(Some(lo), row.time_from);
        assert_eq!(Some(hi), row.time_to);
        assert!(frame.ts().windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn delete_removes_files_and_rows() {
    let (_dir, manifest, writer) = setup();
    let identity = identity();
    let results = writer
        .write(
            &frame(&[0, MS_PER_DAY], &[1.0, 2.0]),
            &identity,
            &DataKind::Raw,
            "1m",
        )
        .unwrap();
    assert_eq!(results.len(), 2);

    let removed = writer
        .delete(&identity, Some(&DataKind::Raw), Some("1m"))
        .unwrap();
    assert_eq!(removed, 2);
    assert!(results.iter().all(|r| !r.path.exists()));
    assert!(manifest.find(&EntryFilter::default()).unwrap().is_empty());
}

#[test]
fn write_ts_conflict_is_schema_mismatch() {
    let (_dir, _manifest, writer) = setup();
    let identity = identity();
    writer
        .write(&frame(&[0], &[1.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    let conflicting = Frame::from_ts(vec![1])
        .with_column("close", Column::Str(vec![Some("oops".into())]))
        .unwrap();
    let err = writer
        .write(&conflicting, &identity, &DataKind::Raw, "1m")
        .unwrap_err();
    assert!(matches!(err, StorageError::Frame(_)));
}

#[test]
fn reader_prunes_and_filters_half_open_range() {
    let (dir, manifest, writer) = setup();
    let identity = identity();
    // Three days with a hole on day 1.
    writer
        .write(
            &frame(&[1_000, 2 * MS_PER_DAY + 1_000], &[1.0, 3.0]),
            &identity,
            &DataKind::Raw,
            "1m",
        )
        .unwrap();

    let reader = PartitionReader::new(dir.path(), Arc::clone(&manifest));
    let frames = reader
        .read(&identity, "raw", Some("1m"), 0, 3 * MS_PER_DAY, None)
        .unwrap();
    assert_eq!(frames.len(), 2, "missing middle day is not an error");

    let concat = reader
        .read_concat(&identity, "raw", Some("1m"), 0, 3 * MS_PER_DAY, None)
        .unwrap();
    assert_eq!(concat.ts(), &[1_000, 2 * MS_PER_DAY + 1_000]);

    // Inverted and empty ranges return nothing.
    assert!(reader
        .read(&identity, "raw", Some("1m"), 10, 5, None)
        .unwrap()
        .is_empty());
    // Upper bound is exclusive.
    let clipped = reader
        .read_concat(&identity, "raw", Some("1m"), 0, 1_000, None)
        .unwrap();
    assert!(clipped.is_empty());
}

#[test]
fn reader_skips_files_missing_on_disk() {
    let (dir, manifest, writer) = setup();
    let identity = identity();
    let results = writer
        .write(&frame(&[1_000], &[1.0]), &identity, &DataKind::Raw, "1m")
        .unwrap();
    std::fs::remove_file(&results[0].path).unwrap();

    let reader = PartitionReader::new(dir.path(), Arc::clone(&manifest));
    let frames = reader
        .read(&identity, "raw", Some("1m"), 0, MS_PER_DAY, None)
        .unwrap();
    assert!(frames.is_empty());

    let report = manifest.reconcile(dir.path()).unwrap();
    assert_eq!(report.dead_links.len(), 1);
}
