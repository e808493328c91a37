//! Financial Modeling Prep client (historical-price-full endpoint)

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::provider::PriceSeriesProvider;
use crate::types::PricePoint;

const DEFAULT_BASE_URL: &str = "https://financialmodelingprep.com/api/v3";
/// At most 10 requests per second
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// FMP daily price client (API key required)
pub struct FmpClient {
    client: Client,
    base_url: String,
    api_key: String,
    last_request: Mutex<Option<Instant>>,
}

/// Response of /historical-price-full/{symbol}. `historical` is absent for unknown symbols.
#[derive(Debug, Deserialize)]
struct HistoricalResponse {
    #[serde(default)]
    historical: Vec<RawBar>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBar {
    date: NaiveDate,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    adj_close: Option<f64>,
    volume: Option<f64>,
}

impl FmpClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            last_request: Mutex::new(None),
        })
    }

    /// Space requests at least `MIN_REQUEST_INTERVAL` apart
    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Daily bars for `symbol` between `from` and `to` (inclusive), ascending
    pub async fn get_daily_bars(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<PricePoint>> {
        self.rate_limit().await;

        let url = format!("{}/historical-price-full/{}", self.base_url, symbol);
        debug!(symbol, %from, %to, "Fetching daily bars from FMP");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("from", from.to_string()),
                ("to", to.to_string()),
                ("apikey", self.api_key.clone()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("FMP API error {}: {}", status, body);
        }

        let body: HistoricalResponse = response.json().await?;
        let bars = into_price_points(symbol, body);
        debug!(symbol, count = bars.len(), "Fetched FMP bars");
        Ok(bars)
    }
}

fn into_price_points(symbol: &str, body: HistoricalResponse) -> Vec<PricePoint> {
    let mut bars: Vec<PricePoint> = body
        .historical
        .into_iter()
        .map(|raw| PricePoint {
            symbol: symbol.to_string(),
            date: raw.date,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            adj_close: raw.adj_close.or(raw.close),
            volume: raw.volume,
            dividend: 0.0,
            split_ratio: 1.0,
        })
        .collect();
    // FMP answers newest first
    bars.sort_by_key(|b| b.date);
    bars
}

#[async_trait]
impl PriceSeriesProvider for FmpClient {
    fn name(&self) -> &str {
        "fmp"
    }

    async fn get_historical_series(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<PricePoint>> {
        self.get_daily_bars(symbol, from, to).await
    }
}
