//! Response types for the Yahoo chart API.

use chrono::{TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::Bar;

/// Top-level response from `/v8/finance/chart/{symbol}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartResponse {
    pub chart: ChartEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartEnvelope {
    #[serde(default)]
    pub result: Option<Vec<ChartResult>>,
    #[serde(default)]
    pub error: Option<ChartError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartError {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartResult {
    pub meta: ChartMeta,
    #[serde(default)]
    pub timestamp: Vec<i64>,
    pub indicators: ChartIndicators,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    pub symbol: String,
    #[serde(default)]
    pub regular_market_price: Option<f64>,
    #[serde(default)]
    pub chart_previous_close: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartIndicators {
    #[serde(default)]
    pub quote: Vec<ChartQuote>,
}

/// Column-oriented OHLCV; any cell may be null on holidays or halts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChartQuote {
    #[serde(default)]
    pub open: Vec<Option<f64>>,
    #[serde(default)]
    pub high: Vec<Option<f64>>,
    #[serde(default)]
    pub low: Vec<Option<f64>>,
    #[serde(default)]
    pub close: Vec<Option<f64>>,
    #[serde(default)]
    pub volume: Vec<Option<u64>>,
}

impl ChartResult {
    /// Daily bars, oldest first, skipping rows without a close.
    pub fn bars(&self) -> Vec<Bar> {
        let Some(quote) = self.indicators.quote.first() else {
            return Vec::new();
        };

        self.timestamp
            .iter()
            .enumerate()
            .filter_map(|(i, ts)| {
                let close = to_price(cell(&quote.close, i)?)?;
                let date = Utc.timestamp_opt(*ts, 0).single()?.date_naive();
                Some(Bar {
                    date,
                    open: cell(&quote.open, i).and_then(to_price).unwrap_or(close),
                    high: cell(&quote.high, i).and_then(to_price).unwrap_or(close),
                    low: cell(&quote.low, i).and_then(to_price).unwrap_or(close),
                    close,
                    volume: quote.volume.get(i).copied().flatten().unwrap_or(0),
                })
            })
            .collect()
    }

    pub fn market_price(&self) -> Option<Decimal> {
        self.meta.regular_market_price.and_then(to_price)
    }
}

fn cell(column: &[Option<f64>], i: usize) -> Option<f64> {
    column.get(i).copied().flatten()
}

/// Quote prices to 4 decimal places; non-positive values are dropped.
pub fn to_price(value: f64) -> Option<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Decimal::from_f64(value).map(|d| d.round_dp(4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_chart() {
        let raw = r#"{
            "chart": {
                "result": [{
                    "meta": {"symbol": "SPY", "regularMarketPrice": 512.3456789},
                    "timestamp": [1704205800, 1704292200, 1704378600],
                    "indicators": {"quote": [{
                        "open":   [472.16, null, 470.0],
                        "high":   [473.67, null, 471.1],
                        "low":    [470.49, null, 468.2],
                        "close":  [472.65, null, 469.15],
                        "volume": [123405000, null, 99000000]
                    }]}
                }],
                "error": null
            }
        }"#;

        let response: ChartResponse = serde_json::from_str(raw).unwrap();
        let result = &response.chart.result.unwrap()[0];
        let bars = result.bars();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(472.65));
        assert_eq!(bars[1].volume, 99_000_000);
        assert!(bars[0].date < bars[1].date);
        assert_eq!(result.market_price(), Some(dec!(512.3457)));
    }

    #[test]
    fn test_to_price_rejects_garbage() {
        assert_eq!(to_price(0.0), None);
        assert_eq!(to_price(-1.0), None);
        assert_eq!(to_price(f64::NAN), None);
    }
}
