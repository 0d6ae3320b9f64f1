// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Range queries over the partition store.
//!
//! The manifest prunes partitions before any file is opened; projection is
//! pushed into the Parquet decoder; rows are post-filtered to the half-open
//! `[t0, t1)` window. Results come back in ascending `time_from` order with
//! rows already sorted inside each frame.

use crate::codec;
use crate::StorageError;
use core_types::{Frame, SeriesIdentity};
use log::warn;
use manifest::{resolve_path, EntryFilter, Manifest};
use std::path::PathBuf;
use std::sync::Arc;

pub struct PartitionReader {
    root: PathBuf,
    manifest: Arc<Manifest>,
}

impl PartitionReader {
    pub fn new(root: impl Into<PathBuf>, manifest: Arc<Manifest>) -> Self {
        Self {
            root: root.into(),
            manifest,
        }
    }

    /// Frames intersecting `[t0, t1)` for one series, ascending. An empty
    /// range or a series with no partitions yields an empty vector, not an
    /// error. Files in the manifest but missing on disk are logged and
    /// skipped; reconcile will surface them later.
    pub fn read(
        &self,
        identity: &SeriesIdentity,
        data_type: &str,
        period: Option<&str>,
        t0: i64,
        t1: i64,
        columns: Option<&[&str]>,
    ) -> Result<Vec<Frame>, StorageError> {
        if t0 >= t1 {
            return Ok(Vec::new());
        }
        let mut filter = EntryFilter::for_identity(identity);
        filter.data_type = Some(data_type.to_string());
        filter.period = period.map(|p| p.to_lowercase());
        filter.overlaps = Some((t0, t1 - 1));

        let mut frames = Vec::new();
        for entry in self.manifest.find(&filter)? {
            let path = resolve_path(&self.root, &entry.path);
            if !path.exists() {
                warn!("manifest row {} has no file at {:?}; skipping", entry.id, path);
                continue;
            }
            let frame = codec::read_parquet(&path, columns)?;
            let frame = frame.filter_range(t0, t1);
            if !frame.is_empty() {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// All matching rows concatenated into one frame in `ts` order.
    pub fn read_concat(
        &self,
        identity: &SeriesIdentity,
        data_type: &str,
        period: Option<&str>,
        t0: i64,
        t1: i64,
        columns: Option<&[&str]>,
    ) -> Result<Frame, StorageError> {
        let mut out = Frame::new();
        for frame in self.read(identity, data_type, period, t0, t1, columns)? {
            if out.is_empty() {
                out = frame;
            } else {
                out.concat(&frame)?;
            }
        }
        out.sort_dedup_by_ts();
        Ok(out)
    }
}
