//! Yahoo Finance client (v8 chart endpoint, no authentication)

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::provider::PriceSeriesProvider;
use crate::types::PricePoint;

const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Yahoo Finance daily price client
#[derive(Clone)]
pub struct YahooClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

impl YahooClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent(USER_AGENT)
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Daily bars for `symbol` between `from` and `to` (inclusive), ascending
    pub async fn get_daily_bars(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<PricePoint>> {
        let period1 = from
            .and_hms_opt(0, 0, 0)
            .context("invalid start date")?
            .and_utc()
            .timestamp();
        let period2 = to
            .and_hms_opt(23, 59, 59)
            .context("invalid end date")?
            .and_utc()
            .timestamp();
        let url = format!(
            "{}/v8/finance/chart/{symbol}?period1={period1}&period2={period2}&interval=1d&includeAdjustedClose=true",
            self.base_url
        );

        debug!(symbol, %from, %to, "Fetching daily bars from Yahoo");
        let response = self.client.get(&url).send().await?;

        // Unknown symbols come back as 404 with a chart.error body
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Yahoo API error {}: {}", status, body);
        }

        let body: ChartResponse = response.json().await?;
        let bars = parse_chart(symbol, body)?;
        debug!(symbol, count = bars.len(), "Fetched Yahoo bars");
        Ok(bars)
    }
}

fn parse_chart(symbol: &str, body: ChartResponse) -> Result<Vec<PricePoint>> {
    let Some(data) = body.chart.result.and_then(|r| r.into_iter().next()) else {
        return match body.chart.error {
            Some(err) if err.code == "Not Found" => Ok(Vec::new()),
            Some(err) => anyhow::bail!("Yahoo chart error {}: {}", err.code, err.description),
            None => Ok(Vec::new()),
        };
    };

    let timestamps = data.timestamp.unwrap_or_default();
    let Some(quote) = data.indicators.quote.into_iter().next() else {
        return Ok(Vec::new());
    };
    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose)
        .unwrap_or_default();

    let at = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(ts, 0).map(|dt| dt.date_naive()) else {
            continue;
        };
        let close = at(&quote.close, i);
        // Holidays come back as all-null rows
        if close.is_none() && at(&quote.open, i).is_none() {
            continue;
        }
        bars.push(PricePoint {
            symbol: symbol.to_string(),
            date,
            open: at(&quote.open, i),
            high: at(&quote.high, i),
            low: at(&quote.low, i),
            close,
            adj_close: at(&adj_closes, i).or(close),
            volume: at(&quote.volume, i),
            dividend: 0.0,
            split_ratio: 1.0,
        });
    }

    bars.sort_by_key(|b| b.date);
    Ok(bars)
}

#[async_trait]
impl PriceSeriesProvider for YahooClient {
    fn name(&self) -> &str {
        "yahoo"
    }

    async fn get_historical_series(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<PricePoint>> {
        self.get_daily_bars(symbol, from, to).await
    }
}
