// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Binance adapter: spot klines via `api.binance.com`, USD-M perpetual
//! klines and funding history via `fapi.binance.com`.

use crate::{api_symbol, ConnectorError, ExchangeApi};
use async_trait::async_trait;
use core_types::{Candle, Column, Frame};
use log::debug;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const SPOT_BASE: &str = "https://api.binance.com";
const FUTURES_BASE: &str = "https://fapi.binance.com";
const MAX_PAGE: usize = 1000;

pub struct BinanceApi {
    client: Client,
}

impl BinanceApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn kline_url(&self, market: &str, symbol: &str, period: &str, since_ms: i64, limit: usize)
        -> Result<Url, ConnectorError>
    {
        let (base, path) = match market.to_lowercase().as_str() {
            "spot" => (SPOT_BASE, "/api/v3/klines"),
            "future" | "futures" | "swap" | "linear" => (FUTURES_BASE, "/fapi/v1/klines"),
            other => {
                return Err(ConnectorError::InvalidResponse(format!(
                    "binance has no market type {other}"
                )))
            }
        };
        let mut url = Url::parse(base).expect("static base url");
        url.set_path(path);
        url.query_pairs_mut()
            .append_pair("symbol", &api_symbol(symbol))
            .append_pair("interval", &period.to_lowercase())
            .append_pair("startTime", &since_ms.to_string())
            .append_pair("limit", &limit.min(MAX_PAGE).to_string());
        Ok(url)
    }

    async fn get_checked(&self, url: Url) -> Result<Response, ConnectorError> {
        debug!("GET {url}");
        let response = self.client.get(url).send().await?;
        check_status(response).await
    }
}

/// Map Binance HTTP outcomes onto the error taxonomy before any body parse.
async fn check_status(response: Response) -> Result<Response, ConnectorError> {
    let status = response.status();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(ConnectorError::RateLimited { retry_after })
        }
        StatusCode::IM_A_TEAPOT => Err(ConnectorError::Banned),
        status if status.is_client_error() => {
            let body = response.text().await.unwrap_or_default();
            // Binance signals an unknown symbol with code -1121.
            if body.contains("-1121") {
                Err(ConnectorError::UnknownSymbol(body))
            } else {
                Err(ConnectorError::Http(format!("{status}: {body}")))
            }
        }
        status if status.is_server_error() => {
            Err(ConnectorError::Http(format!("server error {status}")))
        }
        _ => Ok(response),
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FundingRow {
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "markPrice", default)]
    mark_price: Option<String>,
}

#[async_trait]
impl ExchangeApi for BinanceApi {
    fn id(&self) -> &'static str {
        "binance"
    }

    fn markets(&self) -> Vec<String> {
        vec!["spot".to_string(), "future".to_string()]
    }

    async fn list_symbols(&self, market: &str) -> Result<Vec<String>, ConnectorError> {
        let url = match market.to_lowercase().as_str() {
            "spot" => format!("{SPOT_BASE}/api/v3/exchangeInfo"),
            _ => format!("{FUTURES_BASE}/fapi/v1/exchangeInfo"),
        };
        let url = Url::parse(&url).expect("static discovery url");
        let info: ExchangeInfo = self.get_checked(url).await?.json().await?;
        let mut symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.status.as_deref().unwrap_or("TRADING") == "TRADING")
            .map(|s| s.symbol.to_uppercase())
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn fetch_ohlcv(
        &self,
        market: &str,
        symbol: &str,
        period: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, ConnectorError> {
        let url = self.kline_url(market, symbol, period, since_ms, limit)?;
        let rows: Vec<Vec<Value>> = self.get_checked(url).await?.json().await?;
        rows.iter().map(parse_kline).collect()
    }

    async fn fetch_funding(
        &self,
        _market: &str,
        symbol: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Frame, ConnectorError> {
        let mut url = Url::parse(FUTURES_BASE).expect("static base url");
        url.set_path("/fapi/v1/fundingRate");
        url.query_pairs_mut()
            .append_pair("symbol", &api_symbol(symbol))
            .append_pair("startTime", &since_ms.to_string())
            .append_pair("limit", &limit.min(MAX_PAGE).to_string());
        let rows: Vec<FundingRow> = self.get_checked(url).await?.json().await?;
        funding_frame(&rows)
    }

    fn max_page(&self) -> usize {
        MAX_PAGE
    }
}

/// Klines arrive as positional arrays:
/// `[openTime, open, high, low, close, volume, closeTime, ...]` with
/// numeric fields encoded as strings.
fn parse_kline(row: &Vec<Value>) -> Result<Candle, ConnectorError> {
    if row.len() < 6 {
        return Err(ConnectorError::InvalidResponse(format!(
            "kline row has {} fields",
            row.len()
        )));
    }
    let ts = row[0]
        .as_i64()
        .ok_or_else(|| ConnectorError::InvalidResponse("open time is not an integer".into()))?;
    let field = |index: usize| -> Result<f64, ConnectorError> {
        match &row[index] {
            Value::String(s) => s.parse().map_err(|_| {
                ConnectorError::InvalidResponse(format!("non-numeric kline field {s:?}"))
            }),
            Value::Number(n) => n.as_f64().ok_or_else(|| {
                ConnectorError::InvalidResponse("kline field out of f64 range".into())
            }),
            other => Err(ConnectorError::InvalidResponse(format!(
                "unexpected kline field {other}"
            ))),
        }
    };
    Ok(Candle {
        ts,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}

fn funding_frame(rows: &[FundingRow]) -> Result<Frame, ConnectorError> {
    let mut sorted: Vec<&FundingRow> = rows.iter().collect();
    sorted.sort_by_key(|r| r.funding_time);
    let rate = sorted
        .iter()
        .map(|r| {
            r.funding_rate.parse::<f64>().map(Some).map_err(|_| {
                ConnectorError::InvalidResponse(format!(
                    "non-numeric funding rate {:?}",
                    r.funding_rate
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mark = sorted
        .iter()
        .map(|r| r.mark_price.as_ref().and_then(|m| m.parse::<f64>().ok()))
        .collect();
    let frame = Frame::from_ts(sorted.iter().map(|r| r.funding_time).collect())
        .with_column("funding_rate", Column::F64(rate))?
        .with_column("mark_price", Column::F64(mark))?;
    Ok(frame)
}
