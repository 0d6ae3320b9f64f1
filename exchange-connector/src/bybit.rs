// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Bybit v5 adapter. Kline and funding history arrive newest-first and are
//! reversed into the canonical ascending order.

use crate::{api_symbol, ConnectorError, ExchangeApi};
use async_trait::async_trait;
use core_types::{Candle, Column, Frame};
use log::debug;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

const BASE: &str = "https://api.bybit.com";
const MAX_PAGE: usize = 1000;

pub struct BybitApi {
    client: Client,
}

impl BybitApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn category(market: &str) -> Result<&'static str, ConnectorError> {
        match market.to_lowercase().as_str() {
            "spot" => Ok("spot"),
            "future" | "futures" | "swap" | "linear" => Ok("linear"),
            other => Err(ConnectorError::InvalidResponse(format!(
                "bybit has no market type {other}"
            ))),
        }
    }

    /// Bybit spells intervals in minutes (`1`, `60`) or letters (`D`, `W`).
    fn interval(period: &str) -> Result<String, ConnectorError> {
        let period = period.to_lowercase();
        let Some(value) = core_types::identity::period_ms(&period) else {
            return Err(ConnectorError::InvalidResponse(format!(
                "unsupported period {period}"
            )));
        };
        Ok(match value {
            86_400_000 => "D".to_string(),
            604_800_000 => "W".to_string(),
            ms if ms % 60_000 == 0 => (ms / 60_000).to_string(),
            _ => {
                return Err(ConnectorError::InvalidResponse(format!(
                    "bybit cannot serve period {period}"
                )))
            }
        })
    }

    async fn get_checked(&self, url: Url) -> Result<Response, ConnectorError> {
        debug!("GET {url}");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(ConnectorError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            }),
            StatusCode::IM_A_TEAPOT => Err(ConnectorError::Banned),
            status if status.is_client_error() || status.is_server_error() => {
                Err(ConnectorError::Http(format!("bybit error {status}")))
            }
            _ => Ok(response),
        }
    }
}

#[derive(Debug, Deserialize)]
struct V5Response<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

impl<T> V5Response<T> {
    fn into_result(self) -> Result<T, ConnectorError> {
        if self.ret_code != 0 {
            // 10006 is Bybit's request-rate code.
            if self.ret_code == 10006 {
                return Err(ConnectorError::RateLimited {
                    retry_after: Some(Duration::from_secs(30)),
                });
            }
            return Err(ConnectorError::InvalidResponse(format!(
                "bybit retCode {}: {}",
                self.ret_code, self.ret_msg
            )));
        }
        self.result
            .ok_or_else(|| ConnectorError::InvalidResponse("missing result".into()))
    }
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
    list: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FundingResult {
    list: Vec<FundingRow>,
}

#[derive(Debug, Deserialize)]
struct FundingRow {
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "fundingRateTimestamp")]
    funding_ts: String,
}

#[async_trait]
impl ExchangeApi for BybitApi {
    fn id(&self) -> &'static str {
        "bybit"
    }

    fn markets(&self) -> Vec<String> {
        vec!["spot".to_string(), "future".to_string()]
    }

    async fn list_symbols(&self, market: &str) -> Result<Vec<String>, ConnectorError> {
        let mut url = Url::parse(BASE).expect("static base url");
        url.set_path("/v5/market/instruments-info");
        url.query_pairs_mut()
            .append_pair("category", Self::category(market)?);
        let body: V5Response<InstrumentsResult> = self.get_checked(url).await?.json().await?;
        let mut symbols: Vec<String> = body
            .into_result()?
            .list
            .into_iter()
            .filter(|i| i.status.as_deref().unwrap_or("Trading") == "Trading")
            .map(|i| i.symbol.to_uppercase())
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
        let mut url = Url::parse(BASE).expect("static base url");
        url.set_path("/v5/market/kline");
        url.query_pairs_mut()
            .append_pair("category", Self::category(market)?)
            .append_pair("symbol", &api_symbol(symbol))
            .append_pair("interval", &Self::interval(period)?)
            .append_pair("start", &since_ms.to_string())
            .append_pair("limit", &limit.min(MAX_PAGE).to_string());
        let body: V5Response<KlineResult> = self.get_checked(url).await?.json().await?;
        let mut candles = body
            .into_result()?
            .list
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>, _>>()?;
        candles.sort_by_key(|c| c.ts);
        Ok(candles)
    }

    async fn fetch_funding(
        &self,
        _market: &str,
        symbol: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Frame, ConnectorError> {
        let mut url = Url::parse(BASE).expect("static base url");
        url.set_path("/v5/market/funding/history");
        url.query_pairs_mut()
            .append_pair("category", "linear")
            .append_pair("symbol", &api_symbol(symbol))
            .append_pair("startTime", &since_ms.to_string())
            .append_pair("limit", &limit.min(200).to_string());
        let body: V5Response<FundingResult> = self.get_checked(url).await?.json().await?;
        let mut rows = body.into_result()?.list;
        rows.reverse();

        let ts = rows
            .iter()
            .map(|r| {
                r.funding_ts.parse::<i64>().map_err(|_| {
                    ConnectorError::InvalidResponse(format!(
                        "non-numeric funding timestamp {:?}",
                        r.funding_ts
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let rate = rows
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
        Ok(Frame::from_ts(ts).with_column("funding_rate", Column::F64(rate))?)
    }

    fn max_page(&self) -> usize {
        MAX_PAGE
    }
}

fn parse_kline(row: &[String]) -> Result<Candle, ConnectorError> {
    if row.len() < 6 {
        return Err(ConnectorError::InvalidResponse(format!(
            "kline row has {} fields",
            row.len()
        )));
    }
    let number = |index: usize| -> Result<f64, ConnectorError> {
        row[index].parse().map_err(|_| {
            ConnectorError::InvalidResponse(format!("non-numeric kline field {:?}", row[index]))
        })
    };
    Ok(Candle {
        ts: row[0].parse().map_err(|_| {
            ConnectorError::InvalidResponse(format!("non-numeric start time {:?}", row[0]))
        })?,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_mapping_covers_minutes_hours_days() {
        assert_eq!(BybitApi::interval("1m").unwrap(), "1");
        assert_eq!(BybitApi::interval("15m").unwrap(), "15");
        assert_eq!(BybitApi::interval("1h").unwrap(), "60");
        assert_eq!(BybitApi::interval("1d").unwrap(), "D");
        assert!(BybitApi::interval("tick").is_err());
    }

    #[test]
    fn klines_parse_and_sort_ascending() {
        let rows: Vec<Vec<String>> = vec![
            vec!["120000", "2", "2", "2", "2", "1"],
            vec!["60000", "1", "1", "1", "1", "1"],
        ]
        .into_iter()
        .map(|r| r.into_iter().map(String::from).collect())
        .collect();
        let mut candles: Vec<Candle> = rows.iter().map(|r| parse_kline(r).unwrap()).collect();
        candles.sort_by_key(|c| c.ts);
        assert_eq!(candles[0].ts, 60_000);
        assert_eq!(candles[1].ts, 120_000);
    }
}
