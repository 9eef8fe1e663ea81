//! User-chosen analysis inputs: parameters relayed to the backend, timeframes,
//! history ranges and refresh presets.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

/// Lowest drop threshold (percent) the backend is ever asked to use.
pub const MIN_DROP_THRESHOLD: f64 = 3.0;

/// Parameters for live pattern detection.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisParameters {
    pub max_green_candles: u32,
    pub min_consecutive_candles: u32,
    /// Percent.
    pub significant_drop_threshold: f64,
}

impl Default for AnalysisParameters {
    fn default() -> Self {
        Self {
            max_green_candles: 2,
            min_consecutive_candles: 5,
            significant_drop_threshold: 5.0,
        }
    }
}

impl AnalysisParameters {
    /// Drop threshold actually sent, floored at [`MIN_DROP_THRESHOLD`].
    pub fn effective_drop_threshold(&self) -> f64 {
        if self.significant_drop_threshold.is_finite() {
            self.significant_drop_threshold.max(MIN_DROP_THRESHOLD)
        } else {
            MIN_DROP_THRESHOLD
        }
    }

    /// Adopt the candle count and drop of a historical pattern.
    pub fn apply_pattern(&mut self, pattern: &PatternStatistic) {
        if pattern.candle_count > 0 {
            self.min_consecutive_candles = pattern.candle_count;
        }
        self.significant_drop_threshold = pattern.drop_percent;
    }
}

/// Candle interval supported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
pub enum TimeFrame {
    #[display("1m")]
    #[serde(rename = "1m")]
    Minute1,
    #[display("3m")]
    #[serde(rename = "3m")]
    Minute3,
    #[display("5m")]
    #[serde(rename = "5m")]
    Minute5,
    #[display("15m")]
    #[serde(rename = "15m")]
    Minute15,
    #[display("30m")]
    #[serde(rename = "30m")]
    Minute30,
    #[display("1h")]
    #[serde(rename = "1h")]
    Hour1,
    #[display("2h")]
    #[serde(rename = "2h")]
    Hour2,
    #[display("4h")]
    #[serde(rename = "4h")]
    Hour4,
    #[display("6h")]
    #[serde(rename = "6h")]
    Hour6,
    #[display("8h")]
    #[serde(rename = "8h")]
    Hour8,
    #[display("12h")]
    #[serde(rename = "12h")]
    Hour12,
    #[default]
    #[display("1d")]
    #[serde(rename = "1d")]
    Day1,
    #[display("3d")]
    #[serde(rename = "3d")]
    Day3,
    #[display("1w")]
    #[serde(rename = "1w")]
    Week1,
    #[display("1M")]
    #[serde(rename = "1M")]
    Month1,
}

impl TimeFrame {
    pub const ALL: [TimeFrame; 15] = [
        TimeFrame::Minute1,
        TimeFrame::Minute3,
        TimeFrame::Minute5,
        TimeFrame::Minute15,
        TimeFrame::Minute30,
        TimeFrame::Hour1,
        TimeFrame::Hour2,
        TimeFrame::Hour4,
        TimeFrame::Hour6,
        TimeFrame::Hour8,
        TimeFrame::Hour12,
        TimeFrame::Day1,
        TimeFrame::Day3,
        TimeFrame::Week1,
        TimeFrame::Month1,
    ];

    /// Bucket length. A month is taken as 30 days.
    pub fn duration(&self) -> Duration {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        const DAY: u64 = 24 * HOUR;
        let secs = match self {
            TimeFrame::Minute1 => MINUTE,
            TimeFrame::Minute3 => 3 * MINUTE,
            TimeFrame::Minute5 => 5 * MINUTE,
            TimeFrame::Minute15 => 15 * MINUTE,
            TimeFrame::Minute30 => 30 * MINUTE,
            TimeFrame::Hour1 => HOUR,
            TimeFrame::Hour2 => 2 * HOUR,
            TimeFrame::Hour4 => 4 * HOUR,
            TimeFrame::Hour6 => 6 * HOUR,
            TimeFrame::Hour8 => 8 * HOUR,
            TimeFrame::Hour12 => 12 * HOUR,
            TimeFrame::Day1 => DAY,
            TimeFrame::Day3 => 3 * DAY,
            TimeFrame::Week1 => 7 * DAY,
            TimeFrame::Month1 => 30 * DAY,
        };
        Duration::from_secs(secs)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeFrame::Minute1 => "1 Minute",
            TimeFrame::Minute3 => "3 Minutes",
            TimeFrame::Minute5 => "5 Minutes",
            TimeFrame::Minute15 => "15 Minutes",
            TimeFrame::Minute30 => "30 Minutes",
            TimeFrame::Hour1 => "1 Hour",
            TimeFrame::Hour2 => "2 Hours",
            TimeFrame::Hour4 => "4 Hours",
            TimeFrame::Hour6 => "6 Hours",
            TimeFrame::Hour8 => "8 Hours",
            TimeFrame::Hour12 => "12 Hours",
            TimeFrame::Day1 => "1 Day",
            TimeFrame::Day3 => "3 Days",
            TimeFrame::Week1 => "1 Week",
            TimeFrame::Month1 => "1 Month",
        }
    }
}

impl FromStr for TimeFrame {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" (month) and "1m" (minute) differ only by case
        TimeFrame::ALL
            .into_iter()
            .find(|tf| tf.to_string() == s.trim())
            .ok_or_else(|| format!("unsupported time frame: {s}"))
    }
}

/// History window loaded when a chart is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub days: u32,
}

impl TimeRange {
    pub const PRESETS: [TimeRange; 6] = [
        TimeRange { days: 14 },
        TimeRange { days: 30 },
        TimeRange { days: 60 },
        TimeRange { days: 90 },
        TimeRange { days: 180 },
        TimeRange { days: 365 },
    ];

    pub fn new(days: u32) -> Self {
        Self { days: days.max(1) }
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.days))
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self { days: 30 }
    }
}

impl FromStr for TimeRange {
    type Err = String;

    /// Accepts `"30d"` or `"30"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_end_matches('d')
            .parse::<u32>()
            .map(TimeRange::new)
            .map_err(|e| format!("invalid time range {s}: {e}"))
    }
}

/// Polling refresh interval presets.
pub const REFRESH_PRESETS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Default polling refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Request config for `patternstatistics`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStatisticsConfig {
    pub history_months: u32,
    pub min_candle_count: u32,
    pub max_candle_count: u32,
    pub min_drop_threshold: f64,
    pub recovery_period: u32,
    pub top_results_count: u32,
}

impl Default for PatternStatisticsConfig {
    fn default() -> Self {
        Self {
            history_months: 6,
            min_candle_count: 3,
            max_candle_count: 12,
            min_drop_threshold: 0.0,
            recovery_period: 10,
            top_results_count: 20,
        }
    }
}

/// One row of the `patternstatistics` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStatistic {
    #[serde(default, deserialize_with = "crate::signal::de_count")]
    pub candle_count: u32,
    #[serde(default, deserialize_with = "crate::signal::de_percent")]
    pub drop_percent: f64,
    #[serde(default, deserialize_with = "crate::signal::de_percent")]
    pub average_reversal_percent: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
