//! Typed analysis messages delivered by the hub's `ReceiveSignal` invocation.
//!
//! The backend is loose with numbers: percentages arrive either as numbers or
//! as `"12.5%"` strings, and counts sometimes as floats. Everything is
//! normalised here so downstream code only ever sees `f64`/`u32`.

use crate::candle::CandleTime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Message envelope, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Full historical snapshot for the subscribed symbol/timeframe.
    Init(InitMessage),
    /// Streaming candle tick(s).
    ChartUpdate(ChartUpdateMessage),
    /// Selling pressure detected.
    Signal(PressureSignal),
    /// A reversal has started after a qualifying drop.
    ReversalSignal(ReversalSignal),
    /// Progress of an in-flight reversal.
    ReversalUpdate(ReversalUpdate),
    /// Terminal state of a reversal.
    ReversalComplete(ReversalComplete),
    /// Backend-side analysis failure, fatal for the live session.
    Error(ErrorMessage),
}

impl SignalMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Init(_) => "Init",
            SignalMessage::ChartUpdate(_) => "ChartUpdate",
            SignalMessage::Signal(_) => "Signal",
            SignalMessage::ReversalSignal(_) => "ReversalSignal",
            SignalMessage::ReversalUpdate(_) => "ReversalUpdate",
            SignalMessage::ReversalComplete(_) => "ReversalComplete",
            SignalMessage::Error(_) => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    #[serde(default)]
    pub time: Option<CandleTime>,
    #[serde(default)]
    pub candles: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartUpdateMessage {
    #[serde(default)]
    pub time: Option<CandleTime>,
    #[serde(default)]
    pub candle: Option<serde_json::Value>,
    #[serde(default)]
    pub candles: Vec<serde_json::Value>,
}

impl ChartUpdateMessage {
    /// Every candle carried by this update, single or batched.
    pub fn into_candle_values(self) -> Vec<serde_json::Value> {
        let mut values = self.candles;
        values.extend(self.candle);
        values
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureSignal {
    #[serde(default)]
    pub time: Option<CandleTime>,
    #[serde(default, deserialize_with = "de_percent")]
    pub price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub drop_percent: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub consecutive_candles: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalSignal {
    #[serde(default)]
    pub time: Option<CandleTime>,
    #[serde(default, deserialize_with = "de_percent")]
    pub start_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub lowest_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub current_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub drop_percent: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub reversal_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalUpdate {
    #[serde(default)]
    pub time: Option<CandleTime>,
    #[serde(default, deserialize_with = "de_percent")]
    pub start_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub lowest_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub current_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub reversal_percent: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub candles_since_reversal: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalComplete {
    #[serde(default)]
    pub time: Option<CandleTime>,
    #[serde(default, deserialize_with = "de_percent")]
    pub start_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub lowest_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub final_price: f64,
    #[serde(default, deserialize_with = "de_percent")]
    pub reversal_percent: f64,
    #[serde(default, deserialize_with = "de_count")]
    pub candles_since_reversal: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(default)]
    pub time: Option<CandleTime>,
    #[serde(default)]
    pub message: String,
}

/// Resolve an optional wire timestamp, ignoring unparsable values.
pub fn resolve_time(time: Option<&CandleTime>) -> Option<DateTime<Utc>> {
    time.and_then(|t| t.to_utc().ok())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Number(f64),
    Text(String),
}

/// Parse a percent-like value: `"12.5%"` → `12.5`, `12.5` → `12.5`, `"abc"` → `0`.
pub fn parse_percent(text: &str) -> f64 {
    text.trim()
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

/// Deserialize a number or a (possibly `%`-suffixed) numeric string; `null` → `0`.
pub fn de_percent<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Number(value)) => value,
        Some(Lenient::Text(text)) => parse_percent(&text),
        None => 0.0,
    })
}

/// Deserialize a count that may arrive as an integer, a float or a string.
pub fn de_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = de_percent(deserializer)?;
    if value.is_finite() && value > 0.0 {
        Ok(value.round().min(u32::MAX as f64) as u32)
    } else {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_percent_normalisation() {
        struct TestCase {
            input: serde_json::Value,
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: percent-suffixed string
                input: json!({"type": "ReversalUpdate", "reversalPercent": "12.5%"}),
                expected: 12.5,
            },
            TestCase {
                // TC1: plain number
                input: json!({"type": "ReversalUpdate", "reversalPercent": 12.5}),
                expected: 12.5,
            },
            TestCase {
                // TC2: missing
                input: json!({"type": "ReversalUpdate"}),
                expected: 0.0,
            },
            TestCase {
                // TC3: explicit null
                input: json!({"type": "ReversalUpdate", "reversalPercent": null}),
                expected: 0.0,
            },
            TestCase {
                // TC4: padded string without suffix
                input: json!({"type": "ReversalUpdate", "reversalPercent": " 7.25 "}),
                expected: 7.25,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = match serde_json::from_value::<SignalMessage>(test.input).unwrap() {
                SignalMessage::ReversalUpdate(update) => update.reversal_percent,
                other => panic!("TC{} decoded unexpected {}", index, other.kind()),
            };
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("12.5%"), 12.5);
        assert_eq!(parse_percent("-3%"), -3.0);
        assert_eq!(parse_percent("n/a"), 0.0);
    }

    #[test]
    fn test_decode_every_message_kind() {
        let messages = vec![
            json!({"type": "Init", "candles": [{"open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0, "time": 0}]}),
            json!({"type": "ChartUpdate", "candle": {"open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0, "time": 0}}),
            json!({"type": "Signal", "time": "2024-01-02T00:00:00Z", "price": 10.0, "dropPercent": "6%", "consecutiveCandles": 4}),
            json!({"type": "ReversalSignal", "startPrice": 10.0, "lowestPrice": 8.0}),
            json!({"type": "ReversalUpdate", "startPrice": 10.0, "lowestPrice": 8.0, "candlesSinceReversal": 2.0}),
            json!({"type": "ReversalComplete", "startPrice": 10.0, "lowestPrice": 8.0, "finalPrice": "9.5"}),
            json!({"type": "Error", "message": "analysis failed"}),
        ];
        let expected = [
            "Init",
            "ChartUpdate",
            "Signal",
            "ReversalSignal",
            "ReversalUpdate",
            "ReversalComplete",
            "Error",
        ];

        for (index, (message, kind)) in messages.into_iter().zip(expected).enumerate() {
            let decoded = serde_json::from_value::<SignalMessage>(message).unwrap();
            assert_eq!(decoded.kind(), kind, "TC{} failed", index);
        }
    }

    #[test]
    fn test_chart_update_collects_single_and_batched_candles() {
        let update: ChartUpdateMessage = serde_json::from_value(json!({
            "candle": {"time": 3},
            "candles": [{"time": 1}, {"time": 2}],
        }))
        .unwrap();

        assert_eq!(update.into_candle_values().len(), 3);
    }

    #[test]
    fn test_count_accepts_float_and_string() {
        let signal: PressureSignal =
            serde_json::from_value(json!({"consecutiveCandles": "5", "dropPercent": 10})).unwrap();
        assert_eq!(signal.consecutive_candles, 5);
        assert_eq!(signal.drop_percent, 10.0);
    }
}
