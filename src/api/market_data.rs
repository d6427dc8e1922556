//! Market data providers: Yahoo chart API and an in-memory provider.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{PortfolioError, PortfolioResult};
use crate::models::Bar;

use super::types::ChartResponse;

const CHART_API_BASE: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; paper-allocator/0.1)";

/// Source of daily bars and current prices.
///
/// Failures are reported as `DataUnavailable`; callers hold the ticker.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Daily bars covering the last `lookback_days` calendar days, oldest first.
    async fn get_history(&self, ticker: &str, lookback_days: u32) -> PortfolioResult<Vec<Bar>>;

    async fn get_current_price(&self, ticker: &str) -> PortfolioResult<Decimal>;
}

/// Fetch current prices for many tickers; failures are logged and left out.
pub async fn fetch_prices(
    provider: &dyn MarketDataProvider,
    tickers: &[String],
) -> HashMap<String, Decimal> {
    let results = futures::future::join_all(tickers.iter().map(|t| async move {
        (t.clone(), provider.get_current_price(t).await)
    }))
    .await;

    let mut prices = HashMap::new();
    for (ticker, result) in results {
        match result {
            Ok(price) => {
                prices.insert(ticker, price);
            }
            Err(e) => warn!(ticker = %ticker, error = %e, "Price unavailable, holding"),
        }
    }
    prices
}

// ============== Yahoo chart API ==============

/// Client for the public Yahoo Finance chart endpoint.
pub struct YahooClient {
    client: Client,
    base_url: String,
    max_elapsed: Duration,
}

impl YahooClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(CHART_API_BASE.to_string(), timeout)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            max_elapsed: timeout * 2,
        })
    }

    async fn fetch_chart(&self, ticker: &str, query: &str) -> PortfolioResult<ChartResponse> {
        let url = format!("{}/{}?{}", self.base_url, ticker, query);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        let url = url.as_str();
        backoff::future::retry(policy, || async move {
            debug!(url = %url, "Fetching chart");

            let response = self.client.get(url).send().await.map_err(|e| {
                warn!(ticker = %ticker, error = %e, "Chart request failed, retrying");
                backoff::Error::transient(PortfolioError::data_unavailable(ticker, e))
            })?;

            let status = response.status();
            if !status.is_success() {
                let err = PortfolioError::data_unavailable(ticker, format!("HTTP {}", status));
                return Err(if is_retryable(status) {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                });
            }

            response.json::<ChartResponse>().await.map_err(|e| {
                backoff::Error::permanent(PortfolioError::data_unavailable(
                    ticker,
                    format!("malformed chart response: {}", e),
                ))
            })
        })
        .await
    }

    async fn fetch_result(
        &self,
        ticker: &str,
        query: &str,
    ) -> PortfolioResult<super::types::ChartResult> {
        let response = self.fetch_chart(ticker, query).await?;

        if let Some(error) = response.chart.error {
            return Err(PortfolioError::data_unavailable(
                ticker,
                format!("{}: {}", error.code, error.description),
            ));
        }

        response
            .chart
            .result
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| PortfolioError::data_unavailable(ticker, "empty chart result"))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl MarketDataProvider for YahooClient {
    async fn get_history(&self, ticker: &str, lookback_days: u32) -> PortfolioResult<Vec<Bar>> {
        let end = Utc::now().timestamp();
        let start = end - i64::from(lookback_days) * 86_400;
        let query = format!("period1={}&period2={}&interval=1d", start, end);

        let bars = self.fetch_result(ticker, &query).await?.bars();
        if bars.is_empty() {
            return Err(PortfolioError::data_unavailable(ticker, "no bars in range"));
        }

        debug!(ticker = %ticker, bars = bars.len(), "Fetched history");
        Ok(bars)
    }

    async fn get_current_price(&self, ticker: &str) -> PortfolioResult<Decimal> {
        let result = self.fetch_result(ticker, "range=1d&interval=1d").await?;

        result
            .market_price()
            .or_else(|| result.bars().last().map(|b| b.close))
            .ok_or_else(|| PortfolioError::data_unavailable(ticker, "no price in response"))
    }
}

// ============== In-memory ==============

/// Provider backed by preloaded bars, for tests and offline backtests.
///
/// The current price of a ticker is its override if set, otherwise the
/// close of its latest bar on or before `as_of`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketData {
    bars: HashMap<String, Vec<Bar>>,
    overrides: HashMap<String, Decimal>,
    as_of: Option<NaiveDate>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"TICKER": [bar, ...], ...}` from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read market data file {}", path.display()))?;
        let parsed: BTreeMap<String, Vec<Bar>> =
            serde_json::from_str(&raw).context("Failed to parse market data file")?;

        let mut data = Self::new();
        for (ticker, bars) in parsed {
            data.insert_bars(&ticker, bars);
        }
        Ok(data)
    }

    pub fn insert_bars(&mut self, ticker: &str, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.date);
        self.bars.insert(ticker.to_uppercase(), bars);
    }

    #[cfg(test)]
    pub fn set_price(&mut self, ticker: &str, price: Decimal) {
        self.overrides.insert(ticker.to_uppercase(), price);
    }

    /// Hide bars after `date`.
    #[cfg(test)]
    pub fn set_as_of(&mut self, date: Option<NaiveDate>) {
        self.as_of = date;
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.bars.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    /// All bars for a ticker up to the `as_of` date.
    pub fn bars(&self, ticker: &str) -> &[Bar] {
        let bars = self.bars.get(ticker).map(|b| b.as_slice()).unwrap_or(&[]);
        match self.as_of {
            Some(date) => {
                let end = bars.partition_point(|b| b.date <= date);
                &bars[..end]
            }
            None => bars,
        }
    }
}

#[async_trait]
impl MarketDataProvider for InMemoryMarketData {
    async fn get_history(&self, ticker: &str, lookback_days: u32) -> PortfolioResult<Vec<Bar>> {
        let bars = self.bars(ticker);
        let Some(last) = bars.last() else {
            return Err(PortfolioError::data_unavailable(ticker, "no bars loaded"));
        };

        let start = last.date - chrono::Duration::days(i64::from(lookback_days));
        Ok(bars.iter().filter(|b| b.date > start).cloned().collect())
    }

    async fn get_current_price(&self, ticker: &str) -> PortfolioResult<Decimal> {
        if let Some(price) = self.overrides.get(ticker) {
            return Ok(*price);
        }
        self.bars(ticker)
            .last()
            .map(|b| b.close)
            .ok_or_else(|| PortfolioError::data_unavailable(ticker, "no bars loaded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(day: u32, close: Decimal) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0,
        }
    }

    fn provider() -> InMemoryMarketData {
        let mut data = InMemoryMarketData::new();
        data.insert_bars("spy", vec![bar(3, dec!(102)), bar(1, dec!(100)), bar(2, dec!(101))]);
        data
    }

    #[tokio::test]
    async fn test_in_memory_prices() {
        let mut data = provider();
        assert_eq!(data.get_current_price("SPY").await.unwrap(), dec!(102));

        data.set_as_of(NaiveDate::from_ymd_opt(2024, 3, 2));
        assert_eq!(data.get_current_price("SPY").await.unwrap(), dec!(101));

        data.set_price("SPY", dec!(99));
        assert_eq!(data.get_current_price("SPY").await.unwrap(), dec!(99));

        assert!(matches!(
            data.get_current_price("QQQ").await,
            Err(PortfolioError::DataUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_history_window() {
        let data = provider();
        let bars = data.get_history("SPY", 1).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, dec!(102));

        let bars = data.get_history("SPY", 30).await.unwrap();
        assert_eq!(bars.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_prices_skips_failures() {
        let data = provider();
        let tickers = vec!["SPY".to_string(), "QQQ".to_string()];
        let prices = fetch_prices(&data, &tickers).await;
        assert_eq!(prices.len(), 1);
        assert_eq!(prices["SPY"], dec!(102));
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }
}
