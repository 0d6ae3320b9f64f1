// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Deterministic mapping from series coordinates to partition paths.
//!
//! The layout is the single place partitioning is decided; writer and
//! reader both call it. It is a pure function with an inverse:
//! `EXCHANGE/MARKET/SYMBOL/type/period/YYYY/MM/DD/SYMBOL_period_YYYYMMDD.parquet`.

use chrono::{DateTime, Datelike, NaiveDate};
use core_types::frame::MS_PER_DAY;
use core_types::{DataKind, SeriesIdentity};
use std::path::{Path, PathBuf};

/// Relative partition path for one UTC day (`day = floor(ts / 86_400_000)`).
pub fn partition_rel_path(
    identity: &SeriesIdentity,
    kind: &DataKind,
    period: &str,
    day: i64,
) -> PathBuf {
    let date = day_to_date(day);
    let period = period.to_lowercase();
    let kind = kind.as_str().to_lowercase();
    let mut path = PathBuf::new();
    path.push(&identity.exchange);
    path.push(&identity.market);
    path.push(&identity.symbol);
    path.push(&kind);
    path.push(&period);
    path.push(format!("{:04}", date.year()));
    path.push(format!("{:02}", date.month()));
    path.push(format!("{:02}", date.day()));
    path.push(format!(
        "{}_{}_{}.parquet",
        identity.symbol,
        period,
        date.format("%Y%m%d")
    ));
    path
}

pub fn day_to_date(day: i64) -> NaiveDate {
    DateTime::from_timestamp_millis(day * MS_PER_DAY)
        .expect("day index out of chrono range")
        .date_naive()
}

/// Identity parsed back out of a relative partition path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub identity: SeriesIdentity,
    pub data_type: String,
    pub period: String,
    pub date: NaiveDate,
}

/// Inverse of [`partition_rel_path`]; `None` for paths that do not follow
/// the layout (temp files, quarantined files, foreign data).
pub fn parse_rel_path(path: &Path) -> Option<ParsedPath> {
    let parts: Vec<&str> = path
        .iter()
        .map(|c| c.to_str())
        .collect::<Option<Vec<_>>>()?;
    let [exchange, market, symbol, data_type, period, year, month, day, file] = parts[..] else {
        return None;
    };
    let date = NaiveDate::from_ymd_opt(
        year.parse().ok()?,
        month.parse().ok()?,
        day.parse().ok()?,
    )?;
    let expected = format!("{}_{}_{}.parquet", symbol, period, date.format("%Y%m%d"));
    if file != expected {
        return None;
    }
    Some(ParsedPath {
        identity: SeriesIdentity::new(exchange, market, symbol),
        data_type: data_type.to_string(),
        period: period.to_string(),
        date,
    })
}
