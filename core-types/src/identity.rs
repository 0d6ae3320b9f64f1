// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Series identity and normalization rules shared by paths, manifest rows,
//! and queries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalize an identity component: upper-case, with `/`, `:` and spaces
/// replaced by `_` so the value is safe in file paths on every platform.
pub fn normalize(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .replace(['/', ':', ' '], "_")
}

/// The `(exchange, market, symbol)` tuple naming one data series.
///
/// Components are normalized at construction; two identities built from
/// `"btc/usdt"` and `"BTC_USDT"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesIdentity {
    pub exchange: String,
    pub market: String,
    pub symbol: String,
}

impl SeriesIdentity {
    pub fn new(exchange: &str, market: &str, symbol: &str) -> Self {
        Self {
            exchange: normalize(exchange),
            market: normalize(market),
            symbol: normalize(symbol),
        }
    }

    /// Registry key used by the task supervisor: lower-cased
    /// `exchange:market:symbol:data_type`.
    pub fn task_key(&self, data_type: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.exchange.to_lowercase(),
            self.market.to_lowercase(),
            self.symbol.to_lowercase(),
            data_type.to_lowercase()
        )
    }
}

impl fmt::Display for SeriesIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exchange, self.market, self.symbol)
    }
}

/// What a stored series contains. Features carry the user-supplied
/// feature-set name so the manifest can filter on it directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Raw,
    Funding,
    Feature(String),
}

impl DataKind {
    pub fn as_str(&self) -> &str {
        match self {
            DataKind::Raw => "raw",
            DataKind::Funding => "funding",
            DataKind::Feature(set) => set.as_str(),
        }
    }

    pub fn from_str(kind: &str) -> Self {
        match kind {
            "raw" => DataKind::Raw,
            "funding" => DataKind::Funding,
            other => DataKind::Feature(other.to_string()),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a candle period like `1m`, `15m`, `4h`, `1d` into milliseconds.
pub fn period_ms(period: &str) -> Option<i64> {
    let period = period.trim().to_lowercase();
    if period.len() < 2 {
        return None;
    }
    let (count, unit) = period.split_at(period.len() - 1);
    let count: i64 = count.parse().ok()?;
    if count <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        _ => return None,
    };
    Some(count * unit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_uppercases_and_replaces_separators() {
        assert_eq!(normalize("btc/usdt"), "BTC_USDT");
        assert_eq!(normalize("BTC/USDT:USDT"), "BTC_USDT_USDT");
        assert_eq!(normalize(" eth usd "), "ETH_USD");
    }

    #[test]
    fn identities_compare_after_normalization() {
        let a = SeriesIdentity::new("binance", "spot", "btc/usdt");
        let b = SeriesIdentity::new("BINANCE", "SPOT", "BTC_USDT");
        assert_eq!(a, b);
        assert_eq!(a.task_key("raw"), "binance:spot:btc_usdt:raw");
    }

    #[test]
    fn period_ms_parses_common_periods() {
        assert_eq!(period_ms("1m"), Some(60_000));
        assert_eq!(period_ms("15m"), Some(900_000));
        assert_eq!(period_ms("4h"), Some(14_400_000));
        assert_eq!(period_ms("1d"), Some(86_400_000));
        assert_eq!(period_ms("tick"), None);
        assert_eq!(period_ms("0m"), None);
    }
}
