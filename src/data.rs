use crate::config::{INTRADAY_BARS_PER_DAY, TRADING_DAYS};
use crate::error::MarketError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Represents a single candlestick data point (OHLCV).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Unix seconds at the start of the bar.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn date(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.time, 0).single()
    }

    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.low > 0.0
            && self.volume >= 0.0
    }
}

/// One price sample in an instrument's rolling history.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub time: i64,
    pub price: f64,
}

/// Chart timeframes supported by the candle backfill.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1D")]
    OneDay,
    #[serde(rename = "1W")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
    #[serde(rename = "3M")]
    ThreeMonths,
    #[serde(rename = "1Y")]
    OneYear,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::OneDay,
        Timeframe::OneWeek,
        Timeframe::OneMonth,
        Timeframe::ThreeMonths,
        Timeframe::OneYear,
    ];

    /// Default number of candles drawn for a chart of this timeframe.
    pub fn point_count(&self) -> usize {
        match self {
            Timeframe::OneDay => 78,
            Timeframe::OneWeek => 35,
            Timeframe::OneMonth => 22,
            Timeframe::ThreeMonths => 66,
            Timeframe::OneYear => 52,
        }
    }

    /// Length of one bar, in trading days.
    pub fn step_days(&self) -> f64 {
        match self {
            Timeframe::OneDay => 1.0 / INTRADAY_BARS_PER_DAY,
            // 5 sessions x 7 hourly bars
            Timeframe::OneWeek => 1.0 / 7.0,
            Timeframe::OneMonth | Timeframe::ThreeMonths => 1.0,
            Timeframe::OneYear => 5.0,
        }
    }

    /// Length of one bar, in years.
    pub fn dt(&self) -> f64 {
        self.step_days() / TRADING_DAYS
    }

    /// Wall-clock spacing between consecutive candle timestamps.
    pub fn spacing_secs(&self) -> i64 {
        match self {
            Timeframe::OneDay => 5 * 60,
            Timeframe::OneWeek => 60 * 60,
            Timeframe::OneMonth | Timeframe::ThreeMonths => 24 * 60 * 60,
            Timeframe::OneYear => 7 * 24 * 60 * 60,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneDay => "1D",
            Timeframe::OneWeek => "1W",
            Timeframe::OneMonth => "1M",
            Timeframe::ThreeMonths => "3M",
            Timeframe::OneYear => "1Y",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "1D" => Ok(Timeframe::OneDay),
            "1W" => Ok(Timeframe::OneWeek),
            "1M" => Ok(Timeframe::OneMonth),
            "3M" => Ok(Timeframe::ThreeMonths),
            "1Y" => Ok(Timeframe::OneYear),
            _ => Err(MarketError::UnknownTimeframe(s.to_string())),
        }
    }
}

/// Holds a candle series for a specific symbol.
#[derive(Clone, Debug, Serialize)]
pub struct StockData {
    pub symbol: String,
    pub history: Vec<Candle>,
}

impl StockData {
    pub fn new(symbol: &str, history: Vec<Candle>) -> Self {
        Self {
            symbol: symbol.to_string(),
            history,
        }
    }

    pub fn log_returns(&self) -> Vec<f64> {
        self.history
            .windows(2)
            .map(|w| (w[1].close / w[0].close).ln())
            .collect()
    }

    /// Mean and sample standard deviation of log returns.
    pub fn stats(&self) -> (f64, f64) {
        mean_and_std(&self.log_returns())
    }
}

/// Simple returns between consecutive prices; non-positive prices are skipped.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    if n < 2.0 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}
