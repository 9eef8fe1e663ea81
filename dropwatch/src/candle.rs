//! OHLC candle types and the lenient wire decoding used at every ingestion boundary.

use crate::error::CandleError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One OHLC price bar for a fixed time bucket.
///
/// `time` is the deduplication key inside a [`CandleStore`](crate::store::CandleStore).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub time: DateTime<Utc>,
}

impl Candle {
    /// Merge a candle for the same time bucket into this one.
    ///
    /// `open` is kept, `close` is taken from `incoming`, the range widens.
    pub fn merge(&mut self, incoming: &Candle) {
        self.high = self.high.max(incoming.high);
        self.low = self.low.min(incoming.low);
        self.close = incoming.close;
    }

    /// Epoch milliseconds of the bucket start, as used by chart x-axes.
    pub fn time_millis(&self) -> i64 {
        self.time.timestamp_millis()
    }
}

/// Timestamp as the backend may send it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CandleTime {
    Millis(i64),
    Float(f64),
    Text(String),
}

impl CandleTime {
    /// Resolve to a UTC instant.
    ///
    /// Text accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.f]` (read as UTC)
    /// and a bare `YYYY-MM-DD` (midnight UTC).
    pub fn to_utc(&self) -> Result<DateTime<Utc>, CandleError> {
        match self {
            CandleTime::Millis(ms) => DateTime::from_timestamp_millis(*ms)
                .ok_or_else(|| CandleError::Timestamp(ms.to_string())),
            CandleTime::Float(ms) => {
                if !ms.is_finite() || ms.abs() > i64::MAX as f64 {
                    return Err(CandleError::Timestamp(ms.to_string()));
                }
                DateTime::from_timestamp_millis(ms.trunc() as i64)
                    .ok_or_else(|| CandleError::Timestamp(ms.to_string()))
            }
            CandleTime::Text(text) => parse_time_text(text.trim())
                .ok_or_else(|| CandleError::Timestamp(text.clone())),
        }
    }
}

fn parse_time_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Some(time.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Candle exactly as received, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawCandle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub time: Option<CandleTime>,
}

impl TryFrom<RawCandle> for Candle {
    type Error = CandleError;

    fn try_from(raw: RawCandle) -> Result<Self, Self::Error> {
        for (field, value) in [
            ("open", raw.open),
            ("high", raw.high),
            ("low", raw.low),
            ("close", raw.close),
        ] {
            if !value.is_finite() {
                return Err(CandleError::NonFinite { field, value });
            }
        }

        let time = raw
            .time
            .as_ref()
            .ok_or_else(|| CandleError::Timestamp("missing".to_string()))?
            .to_utc()?;

        Ok(Candle::new(raw.open, raw.high, raw.low, raw.close, time))
    }
}

/// Decode a batch of loosely-typed candles, dropping (and logging) invalid items.
///
/// A malformed item never aborts the batch.
pub fn parse_batch(values: Vec<serde_json::Value>) -> Vec<Candle> {
    values.into_iter().filter_map(parse_value).collect()
}

/// Decode one loosely-typed candle, logging and discarding it if invalid.
pub fn parse_value(value: serde_json::Value) -> Option<Candle> {
    let raw = match serde_json::from_value::<RawCandle>(value.clone()) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(%error, candle = %value, "Invalid candle data");
            return None;
        }
    };

    match Candle::try_from(raw) {
        Ok(candle) => Some(candle),
        Err(error) => {
            warn!(%error, candle = %value, "Invalid candle data");
            None
        }
    }
}

#[cfg(test)]
pub(crate) fn candle(time_ms: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle::new(
        open,
        high,
        low,
        close,
        DateTime::from_timestamp_millis(time_ms).unwrap(),
    )
}
