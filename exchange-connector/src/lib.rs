// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Normalized adapters over heterogeneous exchange HTTP APIs.
//!
//! An [`ExchangeApi`] implementation issues single raw requests; the
//! [`Connector`] wraps one with the rate-limit policy (fixed sleeps on
//! HTTP 429, immediate propagation of HTTP 418 bans), transient-failure
//! budgets, and a cached listing-date probe.

pub mod binance;
pub mod bybit;

use async_trait::async_trait;
use core_types::retry::RetryPolicy;
use core_types::{Candle, Frame, FrameError, SeriesIdentity};
use log::{info, warn};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("rate limited by exchange")]
    RateLimited { retry_after: Option<Duration> },
    #[error("banned by exchange (HTTP 418)")]
    Banned,
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(String),
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectorError::Timeout
        } else {
            ConnectorError::Http(err.to_string())
        }
    }
}

impl ConnectorError {
    /// Worth another attempt inside the fetch budget. Rate limits have
    /// their own sleep rule; bans and input errors never retry.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::Timeout | ConnectorError::Http(_) | ConnectorError::InvalidResponse(_)
        )
    }
}

/// Raw per-request view of one exchange API. Implementations do no retrying
/// themselves; they translate HTTP outcomes into [`ConnectorError`]
/// variants and rows into the canonical shapes.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    fn id(&self) -> &'static str;

    /// Market types this exchange serves (`spot`, `future`, ...).
    fn markets(&self) -> Vec<String>;

    /// Active symbols for one market, exchange-native spelling.
    async fn list_symbols(&self, market: &str) -> Result<Vec<String>, ConnectorError>;

    /// At most `limit` candles with `ts >= since_ms`, ascending.
    async fn fetch_ohlcv(
        &self,
        market: &str,
        symbol: &str,
        period: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, ConnectorError>;

    /// Funding-rate history with `ts >= since_ms`, ascending. Extra
    /// exchange-specific columns ride along in the frame.
    async fn fetch_funding(
        &self,
        market: &str,
        symbol: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Frame, ConnectorError>;

    /// Exchange-enforced page-size ceiling.
    fn max_page(&self) -> usize {
        1000
    }
}

/// Exchanges with a registered adapter.
pub fn list_exchanges() -> Vec<&'static str> {
    vec!["binance", "bybit"]
}

/// Build a connector for a registered exchange.
pub fn connector_for(
    exchange: &str,
    http_timeout: Duration,
) -> Result<Connector, ConnectorError> {
    let client = reqwest::Client::builder()
        .user_agent("mdlake/0.3")
        .timeout(http_timeout)
        .build()
        .map_err(|err| ConnectorError::Http(err.to_string()))?;
    let api: Arc<dyn ExchangeApi> = match exchange.to_lowercase().as_str() {
        "binance" => Arc::new(binance::BinanceApi::new(client)),
        "bybit" => Arc::new(bybit::BybitApi::new(client)),
        other => return Err(ConnectorError::UnknownExchange(other.to_string())),
    };
    Ok(Connector::new(api))
}

const RETRY_AFTER_CAP: Duration = Duration::from_secs(30);
const MAX_FETCH_RETRIES: u32 = 5;
const MAX_PROBE_RETRIES: u32 = 3;
const PROBE_CACHE_SIZE: usize = 256;

pub struct Connector {
    api: Arc<dyn ExchangeApi>,
    retry: RetryPolicy,
    probe_cache: Mutex<LruCache<String, i64>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(api: Arc<dyn ExchangeApi>) -> Self {
        Self {
            api,
            retry: RetryPolicy::default_http(),
            probe_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(PROBE_CACHE_SIZE).expect("cache size is nonzero"),
            )),
        }
    }

    pub fn exchange(&self) -> &'static str {
        self.api.id()
    }

    pub fn markets(&self) -> Vec<String> {
        self.api.markets()
    }

    pub fn max_page(&self) -> usize {
        self.api.max_page()
    }

    /// Discovery is cheap and idempotent; plain jittered backoff covers it.
    pub async fn list_symbols(&self, market: &str) -> Result<Vec<String>, ConnectorError> {
        let api = Arc::clone(&self.api);
        let market = market.to_string();
        self.retry
            .run(|_| {
                let api = Arc::clone(&api);
                let market = market.clone();
                async move { api.list_symbols(&market).await }
            })
            .await
    }

    /// One page of candles under the fetch budget: up to five consecutive
    /// rate-limit sleeps, then `RateLimited`; bans propagate immediately.
    pub async fn fetch_ohlcv(
        &self,
        market: &str,
        symbol: &str,
        period: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Frame, ConnectorError> {
        let candles = self
            .with_budget(MAX_FETCH_RETRIES, || {
                self.api.fetch_ohlcv(market, symbol, period, since_ms, limit)
            })
            .await?;
        Ok(Frame::from_candles(&candles))
    }

    pub async fn fetch_funding(
        &self,
        market: &str,
        symbol: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Frame, ConnectorError> {
        self.with_budget(MAX_FETCH_RETRIES, || {
            self.api.fetch_funding(market, symbol, since_ms, limit)
        })
        .await
    }

    /// Earliest timestamp the exchange will return for a symbol, cached per
    /// identity. `None` means the exchange has no data for it at all.
    pub async fn probe_listing_date(
        &self,
        market: &str,
        symbol: &str,
        period: &str,
    ) -> Result<Option<i64>, ConnectorError> {
        let identity = SeriesIdentity::new(self.api.id(), market, symbol);
        let cache_key = format!("{identity}:{period}");
        if let Some(&ts) = self.probe_cache.lock().get(&cache_key) {
            return Ok(Some(ts));
        }

        let probe = |since: i64| {
            self.with_budget(MAX_PROBE_RETRIES, move || {
                self.api.fetch_ohlcv(market, symbol, period, since, 1)
            })
        };

        // Most exchanges answer `since=0` with the earliest candle.
        let listed = match probe(0).await?.first() {
            Some(candle) => Some(candle.ts),
            None => self.probe_backward(market, symbol, period).await?,
        };
        if let Some(ts) = listed {
            info!("listing date for {}@{}: {}", identity, period, ts);
            self.probe_cache.lock().put(cache_key, ts);
        }
        Ok(listed)
    }

    /// Some venues return nothing for a `since` far before listing. Step
    /// back from now doubling the span until a window comes up empty, then
    /// binary-search the boundary for the earliest non-empty answer.
    async fn probe_backward(
        &self,
        market: &str,
        symbol: &str,
        period: &str,
    ) -> Result<Option<i64>, ConnectorError> {
        const DAY_MS: i64 = 86_400_000;
        let now = chrono::Utc::now().timestamp_millis();
        let probe = |since: i64| {
            self.with_budget(MAX_PROBE_RETRIES, move || {
                self.api.fetch_ohlcv(market, symbol, period, since, 1)
            })
        };

        let mut span = DAY_MS;
        let mut best: Option<i64> = None;
        let mut non_empty_at = now;
        loop {
            let since = (now - span).max(0);
            match probe(since).await?.first() {
                Some(candle) => {
                    best = Some(candle.ts);
                    non_empty_at = since;
                    if since == 0 {
                        return Ok(best);
                    }
                    span = span.saturating_mul(2);
                }
                None => {
                    if best.is_none() {
                        // Nothing found even in the most recent window.
                        return Ok(None);
                    }
                    let mut lo = since;
                    let mut hi = non_empty_at;
                    while hi - lo > DAY_MS {
                        let mid = lo + (hi - lo) / 2;
                        match probe(mid).await?.first() {
                            Some(candle) => {
                                best = Some(candle.ts);
                                hi = mid;
                            }
                            None => lo = mid,
                        }
                    }
                    return Ok(best);
                }
            }
        }
    }

    async fn with_budget<T, F, Fut>(&self, budget: u32, mut op: F) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ConnectorError>>,
    {
        let mut consecutive = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(ConnectorError::RateLimited { retry_after }) => {
                    consecutive += 1;
                    if consecutive > budget {
                        warn!(
                            "{}: giving up after {} consecutive rate limits",
                            self.api.id(),
                            consecutive - 1
                        );
                        return Err(ConnectorError::RateLimited { retry_after: None });
                    }
                    let pause = retry_after.unwrap_or(RETRY_AFTER_CAP).min(RETRY_AFTER_CAP);
                    warn!(
                        "{}: rate limited, sleeping {:?} (attempt {}/{})",
                        self.api.id(),
                        pause,
                        consecutive,
                        budget
                    );
                    sleep(pause).await;
                }
                Err(err) if err.is_transient() => {
                    consecutive += 1;
                    if consecutive > budget {
                        return Err(err);
                    }
                    warn!(
                        "{}: transient failure ({}), retrying (attempt {}/{})",
                        self.api.id(),
                        err,
                        consecutive,
                        budget
                    );
                    sleep(Duration::from_secs(1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Identity symbols carry `_` separators; exchange REST APIs want the bare
/// concatenated form (`BTC_USDT` → `BTCUSDT`).
pub fn api_symbol(symbol: &str) -> String {
    symbol.to_uppercase().replace('_', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted fake: a fixed number of 429s, then candles from a listing
    /// date onward, optionally balking at `since` far before listing.
    struct FakeApi {
        rate_limits_before_success: u32,
        calls: AtomicU32,
        listing_ms: i64,
        balk_before_ms: Option<i64>,
        step_ms: i64,
    }

    impl FakeApi {
        fn new(listing_ms: i64) -> Self {
            Self {
                rate_limits_before_success: 0,
                calls: AtomicU32::new(0),
                listing_ms,
                balk_before_ms: None,
                step_ms: 60_000,
            }
        }

        fn candles_from(&self, since: i64, limit: usize) -> Vec<Candle> {
            let now = chrono::Utc::now().timestamp_millis();
            let mut ts = self.listing_ms.max(since);
            // Align up to the candle grid.
            let rem = ts.rem_euclid(self.step_ms);
            if rem != 0 {
                ts += self.step_ms - rem;
            }
            let mut out = Vec::new();
            while out.len() < limit && ts <= now {
                out.push(Candle {
                    ts,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 0.0,
                });
                ts += self.step_ms;
            }
            out
        }
    }

    #[async_trait]
    impl ExchangeApi for FakeApi {
        fn id(&self) -> &'static str {
            "fake"
        }

        fn markets(&self) -> Vec<String> {
            vec!["spot".to_string()]
        }

        async fn list_symbols(&self, _market: &str) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["BTCUSDT".to_string()])
        }

        async fn fetch_ohlcv(
            &self,
            _market: &str,
            _symbol: &str,
            _period: &str,
            since_ms: i64,
            limit: usize,
        ) -> Result<Vec<Candle>, ConnectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.rate_limits_before_success {
                return Err(ConnectorError::RateLimited {
                    retry_after: Some(Duration::from_secs(30)),
                });
            }
            if let Some(balk) = self.balk_before_ms {
                if since_ms < balk {
                    return Ok(Vec::new());
                }
            }
            Ok(self.candles_from(since_ms, limit))
        }

        async fn fetch_funding(
            &self,
            _market: &str,
            _symbol: &str,
            _since_ms: i64,
            _limit: usize,
        ) -> Result<Frame, ConnectorError> {
            Ok(Frame::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_rate_limits_then_success_waits_out_the_backoff() {
        let mut api = FakeApi::new(0);
        api.rate_limits_before_success = 5;
        let connector = Connector::new(Arc::new(api));

        let started = tokio::time::Instant::now();
        let frame = connector
            .fetch_ohlcv("spot", "BTCUSDT", "1m", 0, 10)
            .await
            .unwrap();
        assert_eq!(frame.len(), 10);
        assert!(
            started.elapsed() >= Duration::from_secs(150),
            "five 30s sleeps expected, elapsed {:?}",
            started.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_rate_limit_exhausts_the_budget() {
        let mut api = FakeApi::new(0);
        api.rate_limits_before_success = 6;
        let connector = Connector::new(Arc::new(api));

        let err = connector
            .fetch_ohlcv("spot", "BTCUSDT", "1m", 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn ban_propagates_without_retry() {
        struct BannedApi {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ExchangeApi for BannedApi {
            fn id(&self) -> &'static str {
                "fake"
            }
            fn markets(&self) -> Vec<String> {
                vec![]
            }
            async fn list_symbols(&self, _m: &str) -> Result<Vec<String>, ConnectorError> {
                Ok(vec![])
            }
            async fn fetch_ohlcv(
                &self,
                _m: &str,
                _s: &str,
                _p: &str,
                _since: i64,
                _limit: usize,
            ) -> Result<Vec<Candle>, ConnectorError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectorError::Banned)
            }
            async fn fetch_funding(
                &self,
                _m: &str,
                _s: &str,
                _since: i64,
                _limit: usize,
            ) -> Result<Frame, ConnectorError> {
                Err(ConnectorError::Banned)
            }
        }

        let api = Arc::new(BannedApi {
            calls: AtomicU32::new(0),
        });
        let connector = Connector::new(Arc::clone(&api) as Arc<dyn ExchangeApi>);
        let err = connector
            .fetch_ohlcv("spot", "BTCUSDT", "1m", 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Banned));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn probe_finds_listing_from_zero_and_caches() {
        let listing = 1_500_000_000_000;
        let api = Arc::new(FakeApi::new(listing));
        let connector = Connector::new(Arc::clone(&api) as Arc<dyn ExchangeApi>);

        let first = connector
            .probe_listing_date("spot", "BTCUSDT", "1m")
            .await
            .unwrap();
        assert_eq!(first, Some(listing));

        let calls_after_first = api.calls.load(Ordering::SeqCst);
        let second = connector
            .probe_listing_date("spot", "BTCUSDT", "1m")
            .await
            .unwrap();
        assert_eq!(second, Some(listing));
        assert_eq!(api.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn probe_backward_converges_on_balking_exchanges() {
        let now = chrono::Utc::now().timestamp_millis();
        let listing = now - 100 * 86_400_000;
        let mut api = FakeApi::new(listing);
        // Refuse anything more than ten days before listing.
        api.balk_before_ms = Some(listing - 10 * 86_400_000);
        let connector = Connector::new(Arc::new(api));

        let found = connector
            .probe_listing_date("spot", "BTCUSDT", "1m")
            .await
            .unwrap()
            .expect("listing date should be found");
        // The candle grid aligns the exact value; it must be within one
        // candle of the listing date.
        assert!((found - listing).abs() <= 60_000);
    }

    #[tokio::test]
    async fn unknown_exchange_is_rejected() {
        let err = connector_for("ftx", Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, ConnectorError::UnknownExchange(_)));
    }
}
