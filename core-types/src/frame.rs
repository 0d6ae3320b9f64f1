// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Column-oriented record batches with a required `ts` key column.
//!
//! A [`Frame`] carries `ts: i64` (milliseconds since epoch, UTC) plus a
//! dynamic map of optional typed columns. Merge, dedup and sort are
//! deterministic so repeated writes of the same rows produce identical
//! bytes downstream.

use std::collections::BTreeMap;
use thiserror::Error;

pub const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column {name} has {len} rows, frame has {expected}")]
    LengthMismatch {
        name: String,
        len: usize,
        expected: usize,
    },
    #[error("column {0} changed type between batches")]
    TypeConflict(String),
    #[error("required column {0} is missing")]
    MissingColumn(String),
}

/// One dynamically typed column. Cells are optional so a schema union can
/// backfill missing values with nulls.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    F64(Vec<Option<f64>>),
    I64(Vec<Option<i64>>),
    Str(Vec<Option<String>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::F64(v) => v.len(),
            Column::I64(v) => v.len(),
            Column::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn nulls_like(&self, len: usize) -> Column {
        match self {
            Column::F64(_) => Column::F64(vec![None; len]),
            Column::I64(_) => Column::I64(vec![None; len]),
            Column::Str(_) => Column::Str(vec![None; len]),
        }
    }

    fn append(&mut self, other: &Column) -> Result<(), ()> {
        match (self, other) {
            (Column::F64(a), Column::F64(b)) => a.extend(b.iter().cloned()),
            (Column::I64(a), Column::I64(b)) => a.extend(b.iter().cloned()),
            (Column::Str(a), Column::Str(b)) => a.extend(b.iter().cloned()),
            _ => return Err(()),
        }
        Ok(())
    }

    fn append_nulls(&mut self, count: usize) {
        match self {
            Column::F64(v) => v.extend(std::iter::repeat(None).take(count)),
            Column::I64(v) => v.extend(std::iter::repeat(None).take(count)),
            Column::Str(v) => v.extend(std::iter::repeat(None).take(count)),
        }
    }

    fn take(&self, indices: &[usize]) -> Column {
        match self {
            Column::F64(v) => Column::F64(indices.iter().map(|&i| v[i]).collect()),
            Column::I64(v) => Column::I64(indices.iter().map(|&i| v[i]).collect()),
            Column::Str(v) => Column::Str(indices.iter().map(|&i| v[i].clone()).collect()),
        }
    }
}

/// One OHLCV candle as delivered by exchange adapters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    ts: Vec<i64>,
    columns: BTreeMap<String, Column>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from a `ts` vector; extra columns attach via
    /// [`Frame::with_column`].
    pub fn from_ts(ts: Vec<i64>) -> Self {
        Self {
            ts,
            columns: BTreeMap::new(),
        }
    }

    pub fn from_candles(candles: &[Candle]) -> Self {
        let mut frame = Frame::from_ts(candles.iter().map(|c| c.ts).collect());
        let take = |f: fn(&Candle) -> f64| -> Column {
            Column::F64(candles.iter().map(|c| Some(f(c))).collect())
        };
        frame.columns.insert("open".into(), take(|c| c.open));
        frame.columns.insert("high".into(), take(|c| c.high));
        frame.columns.insert("low".into(), take(|c| c.low));
        frame.columns.insert("close".into(), take(|c| c.close));
        frame.columns.insert("volume".into(), take(|c| c.volume));
        frame
    }

    pub fn with_column(mut self, name: &str, column: Column) -> Result<Self, FrameError> {
        if column.len() != self.ts.len() {
            return Err(FrameError::LengthMismatch {
                name: name.to_string(),
                len: column.len(),
                expected: self.ts.len(),
            });
        }
        self.columns.insert(name.to_string(), column);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    pub fn ts(&self) -> &[i64] {
        &self.ts
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Column names in deterministic (lexicographic) order, `ts` excluded.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let min = self.ts.iter().min()?;
        let max = self.ts.iter().max()?;
        Some((*min, *max))
    }

    /// Append `other` onto `self`, taking the union of both schemas and
    /// backfilling cells absent on either side with nulls. `ts` types are
    /// fixed; any other column that changes type is rejected.
    pub fn concat(&mut self, other: &Frame) -> Result<(), FrameError> {
        let own_len = self.ts.len();
        self.ts.extend_from_slice(&other.ts);
        for (name, column) in &mut self.columns {
            match other.columns.get(name) {
                Some(theirs) => column
                    .append(theirs)
                    .map_err(|_| FrameError::TypeConflict(name.clone()))?,
                None => column.append_nulls(other.ts.len()),
            }
        }
        for (name, theirs) in &other.columns {
            if !self.columns.contains_key(name) {
                let mut column = theirs.nulls_like(own_len);
                column
                    .append(theirs)
                    .map_err(|_| FrameError::TypeConflict(name.clone()))?;
                self.columns.insert(name.clone(), column);
            }
        }
        Ok(())
    }

    /// Sort ascending by `ts` and drop duplicate timestamps keeping the row
    /// that arrived last. The sort is stable, so "last by arrival order"
    /// survives the reorder; the result is deterministic for a given input
    /// sequence.
    pub fn sort_dedup_by_ts(&mut self) {
        let mut order: Vec<usize> = (0..self.ts.len()).collect();
        order.sort_by_key(|&i| self.ts[i]);
        let mut keep = Vec::with_capacity(order.len());
        for (pos, &i) in order.iter().enumerate() {
            let is_last_of_ts = order
                .get(pos + 1)
                .map_or(true, |&next| self.ts[next] != self.ts[i]);
            if is_last_of_ts {
                keep.push(i);
            }
        }
        self.select_rows(&keep);
    }

    /// Split into per-UTC-day frames keyed by `floor(ts / MS_PER_DAY)`.
    /// A record exactly on the boundary belongs to the new day.
    pub fn partition_by_day(&self) -> BTreeMap<i64, Frame> {
        let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, ts) in self.ts.iter().enumerate() {
            buckets.entry(ts.div_euclid(MS_PER_DAY)).or_default().push(i);
        }
        buckets
            .into_iter()
            .map(|(day, indices)| (day, self.take_rows(&indices)))
            .collect()
    }

    /// Rows with `ts` in the half-open interval `[t0, t1)`.
    pub fn filter_range(&self, t0: i64, t1: i64) -> Frame {
        let indices: Vec<usize> = self
            .ts
            .iter()
            .enumerate()
            .filter(|(_, &ts)| ts >= t0 && ts < t1)
            .map(|(i, _)| i)
            .collect();
        self.take_rows(&indices)
    }

    /// Keep only the named columns (plus `ts`, which is always present).
    /// Unknown names are ignored.
    pub fn select(&self, names: &[&str]) -> Frame {
        let columns = self
            .columns
            .iter()
            .filter(|(name, _)| names.contains(&name.as_str()))
            .map(|(name, col)| (name.clone(), col.clone()))
            .collect();
        Frame {
            ts: self.ts.clone(),
            columns,
        }
    }

    fn take_rows(&self, indices: &[usize]) -> Frame {
        Frame {
            ts: indices.iter().map(|&i| self.ts[i]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.take(indices)))
                .collect(),
        }
    }

    fn select_rows(&mut self, indices: &[usize]) {
        *self = self.take_rows(indices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: &[i64], close: &[f64]) -> Frame {
        Frame::from_ts(ts.to_vec())
            .with_column("close", Column::F64(close.iter().map(|&v| Some(v)).collect()))
            .unwrap()
    }

    #[test]
    fn concat_then_dedup_keeps_latest_arrival() {
        let mut base = frame(&[0, 60_000, 120_000], &[1.0, 2.0, 3.0]);
        let update = frame(&[60_000, 180_000], &[9.0, 4.0]);
        base.concat(&update).unwrap();
        base.sort_dedup_by_ts();

        assert_eq!(base.ts(), &[0, 60_000, 120_000, 180_000]);
        let Column::F64(close) = base.column("close").unwrap() else {
            panic!("close should stay f64");
        };
        assert_eq!(
            close,
            &vec![Some(1.0), Some(9.0), Some(3.0), Some(4.0)]
        );
    }

    #[test]
    fn concat_unions_schema_with_nulls() {
        let mut base = frame(&[0], &[1.0]);
        let other = Frame::from_ts(vec![1])
            .with_column("funding_rate", Column::F64(vec![Some(0.01)]))
            .unwrap();
        base.concat(&other).unwrap();

        let Column::F64(close) = base.column("close").unwrap() else {
            panic!();
        };
        assert_eq!(close, &vec![Some(1.0), None]);
        let Column::F64(rate) = base.column("funding_rate").unwrap() else {
            panic!();
        };
        assert_eq!(rate, &vec![None, Some(0.01)]);
    }

    #[test]
    fn concat_rejects_type_conflicts() {
        let mut base = frame(&[0], &[1.0]);
        let other = Frame::from_ts(vec![1])
            .with_column("close", Column::Str(vec![Some("x".into())]))
            .unwrap();
        assert!(matches!(
            base.concat(&other),
            Err(FrameError::TypeConflict(name)) if name == "close"
        ));
    }

    #[test]
    fn boundary_record_lands_in_new_day() {
        let f = frame(&[86_399_000, 86_400_000], &[1.0, 2.0]);
        let days = f.partition_by_day();
        assert_eq!(days.len(), 2);
        assert_eq!(days[&0].ts(), &[86_399_000]);
        assert_eq!(days[&1].ts(), &[86_400_000]);
    }

    #[test]
    fn multi_day_batch_splits_without_empty_partitions() {
        let ts: Vec<i64> = (0..3).map(|d| d * MS_PER_DAY + 1_000).collect();
        let f = Frame::from_ts(ts);
        let days = f.partition_by_day();
        assert_eq!(days.len(), 3);
        assert!(days.values().all(|f| f.len() == 1));
    }

    #[test]
    fn filter_range_is_half_open() {
        let f = frame(&[0, 10, 20], &[1.0, 2.0, 3.0]);
        assert_eq!(f.filter_range(0, 20).ts(), &[0, 10]);
        assert_eq!(f.filter_range(21, 20).len(), 0);
    }

    #[test]
    fn sort_dedup_is_idempotent() {
        let mut a = frame(&[5, 1, 5, 3], &[1.0, 2.0, 3.0, 4.0]);
        a.sort_dedup_by_ts();
        let snapshot = a.clone();
        a.sort_dedup_by_ts();
        assert_eq!(a, snapshot);
        assert_eq!(a.ts(), &[1, 3, 5]);
    }
}
