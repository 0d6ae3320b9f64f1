// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Atomic, idempotent per-day partition writes.
//!
//! Each write merges into the existing partition (dedup by `ts`, last
//! arrival wins, re-sort), lands through a temp file with fsync + rename,
//! and upserts the manifest row. Merge + dedup + sort is deterministic and
//! the codec settings are fixed, so re-running an identical write produces
//! byte-identical files and the manifest updates in place.

use crate::codec;
use crate::layout;
use crate::StorageError;
use core_types::config::CompressionCodec;
use core_types::{DataKind, Frame, SeriesIdentity};
use log::{error, info, warn};
use manifest::{rel_path_string, EntryFilter, Manifest, NewEntry};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct WriteResult {
    pub path: PathBuf,
    pub rel_path: String,
    pub day: i64,
    pub row_count: usize,
    pub time_from: i64,
    pub time_to: i64,
    pub checksum: String,
}

pub struct PartitionWriter {
    root: PathBuf,
    compression: CompressionCodec,
    manifest: Arc<Manifest>,
    // Advisory per-path locks serialize writers inside this process;
    // cross-process safety comes from the atomic rename.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PartitionWriter {
    pub fn new(
        root: impl Into<PathBuf>,
        compression: CompressionCodec,
        manifest: Arc<Manifest>,
    ) -> Self {
        Self {
            root: root.into(),
            compression,
            manifest,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition `frame` by UTC day and upsert one file per day, in
    /// ascending day order. `ts` must be present (it always is on a
    /// well-formed frame) and each day bucket is non-empty by construction.
    pub fn write(
        &self,
        frame: &Frame,
        identity: &SeriesIdentity,
        kind: &DataKind,
        period: &str,
    ) -> Result<Vec<WriteResult>, StorageError> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for (day, day_frame) in frame.partition_by_day() {
            results.push(self.write_partition(day, &day_frame, identity, kind, period)?);
        }
        Ok(results)
    }

    fn write_partition(
        &self,
        day: i64,
        incoming: &Frame,
        identity: &SeriesIdentity,
        kind: &DataKind,
        period: &str,
    ) -> Result<WriteResult, StorageError> {
        let rel = layout::partition_rel_path(identity, kind, period, day);
        let target = self.root.join(&rel);
        let lock = self.lock_for(&target);
        let _guard = lock.lock();

        let parent = target
            .parent()
            .expect("partition path always has a parent");
        std::fs::create_dir_all(parent)?;
        self.remove_stale_temps(&target);

        let mut merged = match self.read_existing(&target)? {
            Some(existing) => {
                let mut merged = existing;
                merged.concat(incoming)?;
                merged
            }
            None => incoming.clone(),
        };
        merged.sort_dedup_by_ts();

        let temp = temp_path(&target);
        if let Err(err) = self.write_and_rename(&temp, &target, &merged) {
            let _ = std::fs::remove_file(&temp);
            return Err(err);
        }

        let checksum = sha256_file(&target)?;
        let file_size = std::fs::metadata(&target)?.len() as i64;
        let (time_from, time_to) = merged
            .time_bounds()
            .expect("merged partition is never empty");
        let rel_str = rel_path_string(&rel);
        self.manifest.upsert(&NewEntry {
            identity: identity.clone(),
            data_type: kind.as_str().to_string(),
            period: Some(period.to_lowercase()),
            path: rel_str.clone(),
            time_from: Some(time_from),
            time_to: Some(time_to),
            row_count: merged.len() as i64,
            file_size,
            checksum: checksum.clone(),
            version: None,
        })?;

        self.verify_partition(&target, &rel_str, merged.len())?;

        Ok(WriteResult {
            path: target,
            rel_path: rel_str,
            day,
            row_count: merged.len(),
            time_from,
            time_to,
            checksum,
        })
    }

    /// Remove matching partition files and their manifest rows. Returns the
    /// number of rows removed; missing files are tolerated.
    pub fn delete(
        &self,
        identity: &SeriesIdentity,
        kind: Option<&DataKind>,
        period: Option<&str>,
    ) -> Result<usize, StorageError> {
        let mut filter = EntryFilter::for_identity(identity);
        filter.data_type = kind.map(|k| k.as_str().to_string());
        filter.period = period.map(|p| p.to_lowercase());
        let removed = self.manifest.delete_by(&filter)?;
        for entry in &removed {
            let path = manifest::resolve_path(&self.root, &entry.path);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(
            "deleted {} partition(s) for {} kind={:?} period={:?}",
            removed.len(),
            identity,
            kind.map(DataKind::as_str),
            period
        );
        Ok(removed.len())
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// A crash between temp write and rename leaves a `*.tmp.*` sibling;
    /// clear it before the next write to this partition.
    fn remove_stale_temps(&self, target: &Path) {
        let Some(parent) = target.parent() else {
            return;
        };
        let Some(file_name) = target.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let prefix = format!("{file_name}.tmp.");
        let Ok(entries) = std::fs::read_dir(parent) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) {
                warn!("removing stale temp file {:?}", entry.path());
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    /// Read the existing partition if present. An unreadable file is moved
    /// aside to `P.corrupt.<ts>` and the partition treated as empty.
    fn read_existing(&self, target: &Path) -> Result<Option<Frame>, StorageError> {
        if !target.exists() {
            return Ok(None);
        }
        match codec::read_parquet(target, None) {
            Ok(frame) => Ok(Some(frame)),
            Err(StorageError::Io(err)) => Err(err.into()),
            Err(err) => {
                let quarantine = quarantine_path(target);
                error!(
                    "existing partition {:?} unreadable ({}); quarantining to {:?}",
                    target, err, quarantine
                );
                std::fs::rename(target, &quarantine)
                    .map_err(|_| StorageError::CorruptExisting(target.to_path_buf()))?;
                Ok(None)
            }
        }
    }

    fn write_and_rename(
        &self,
        temp: &Path,
        target: &Path,
        frame: &Frame,
    ) -> Result<(), StorageError> {
        codec::write_parquet(temp, frame, self.compression)?;
        File::open(temp)?.sync_all()?;
        if let Some(parent) = target.parent() {
            File::open(parent)?.sync_all()?;
        }
        std::fs::rename(temp, target)?;
        Ok(())
    }

    /// Post-condition check: the file on disk decodes to the expected row
    /// count with strictly increasing timestamps. On failure the partition
    /// and its manifest row are removed so the store never exposes a bad
    /// file.
    fn verify_partition(
        &self,
        target: &Path,
        rel: &str,
        expected_rows: usize,
    ) -> Result<(), StorageError> {
        let failure = match codec::read_parquet(target, None) {
            Ok(frame) => {
                if frame.len() != expected_rows {
                    Some(format!(
                        "{rel}: wrote {expected_rows} rows, file holds {}",
                        frame.len()
                    ))
                } else if frame.ts().windows(2).any(|w| w[0] >= w[1]) {
                    Some(format!("{rel}: timestamps are not strictly increasing"))
                } else {
                    None
                }
            }
            Err(err) => Some(format!("{rel}: reopen failed: {err}")),
        };
        let Some(reason) = failure else {
            return Ok(());
        };
        error!("integrity check failed for {:?}: {}", target, reason);
        let _ = std::fs::remove_file(target);
        self.manifest.delete_by_path(rel)?;
        Err(StorageError::DataIntegrity(reason))
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("partition.parquet");
    target.with_file_name(format!(
        "{file_name}.tmp.{}",
        uuid::Uuid::new_v4().simple()
    ))
}

fn quarantine_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("partition.parquet");
    target.with_file_name(format!(
        "{file_name}.corrupt.{}",
        chrono::Utc::now().timestamp_millis()
    ))
}

pub fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
