//! REST client for the analysis backend.

use crate::{
    candle::{self, Candle},
    error::DropwatchError,
    params::{AnalysisParameters, PatternStatistic, PatternStatisticsConfig, TimeFrame},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};
use url::Url;

/// REST client configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, including the `/api` prefix
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ApiConfig {
    /// Create a new configuration with custom base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Response of `stopliveanalysis`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct StopResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SymbolTimeFrame<'a> {
    symbol: &'a str,
    time_frame: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatternStatisticsRequest<'a> {
    symbol: &'a str,
    time_frame: String,
    config: PatternStatisticsConfig,
}

/// The backend operations a [`Session`](crate::session::Session) depends on.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Candles for `[start, end]`; invalid items are dropped.
    async fn fetch_candles(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, DropwatchError>;

    /// Ask the backend to begin streaming analysis for `symbol`.
    async fn start_live_analysis(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
        params: &AnalysisParameters,
    ) -> Result<serde_json::Value, DropwatchError>;

    /// Ask the backend to stop streaming analysis for `symbol`.
    async fn stop_live_analysis(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
    ) -> Result<StopResponse, DropwatchError>;
}

/// `reqwest` implementation of the backend REST surface.
#[derive(Debug, Clone)]
pub struct AnalysisApi {
    client: reqwest::Client,
    config: ApiConfig,
}

impl AnalysisApi {
    pub fn new(config: ApiConfig) -> Result<Self, DropwatchError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, DropwatchError> {
        let base = self.config.base_url.trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/{endpoint}"))?)
    }

    async fn get_json<T, Q>(&self, endpoint: &'static str, query: &Q) -> Result<T, DropwatchError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = self.endpoint_url(endpoint)?;
        debug!(%url, "GET");
        let response = self.client.get(url).query(query).send().await?;
        Self::decode(endpoint, response).await
    }

    async fn post_json<T, B>(&self, endpoint: &'static str, body: &B) -> Result<T, DropwatchError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint_url(endpoint)?;
        debug!(%url, "POST");
        let response = self.client.post(url).json(body).send().await?;
        Self::decode(endpoint, response).await
    }

    async fn decode<T>(endpoint: &'static str, response: reqwest::Response) -> Result<T, DropwatchError>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            error!(endpoint, %status, "Backend request failed");
            return Err(DropwatchError::Status { endpoint, status });
        }
        Ok(response.json::<T>().await?)
    }

    /// All USDT-quoted symbols known to the backend.
    pub async fn fetch_usdt_pairs(&self) -> Result<Vec<String>, DropwatchError> {
        let no_query: [(&str, &str); 0] = [];
        let pairs: Vec<String> = self.get_json("fetchusdtpairs", &no_query).await?;
        info!(count = pairs.len(), "Fetched USDT pairs");
        Ok(pairs)
    }

    /// Roughly six months of history for `symbol`.
    pub async fn fetch_six_months(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
    ) -> Result<Vec<Candle>, DropwatchError> {
        let values: Vec<serde_json::Value> = self
            .get_json(
                "fetch6monthsdata",
                &[("symbol", symbol.to_string()), ("timeFrame", time_frame.to_string())],
            )
            .await?;
        Ok(candle::parse_batch(values))
    }

    /// One-shot server-side analysis; the result shape is backend defined.
    pub async fn auto_analyze(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
    ) -> Result<serde_json::Value, DropwatchError> {
        let result: serde_json::Value = self
            .get_json(
                "autoanalyze",
                &[("symbol", symbol.to_string()), ("timeFrame", time_frame.to_string())],
            )
            .await?;
        debug!(%symbol, %time_frame, "Automated analysis finished");
        Ok(result)
    }

    /// Historical drop/reversal statistics, best patterns first.
    pub async fn pattern_statistics(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
        config: PatternStatisticsConfig,
    ) -> Result<Vec<PatternStatistic>, DropwatchError> {
        let request = PatternStatisticsRequest {
            symbol,
            time_frame: time_frame.to_string(),
            config,
        };
        let statistics: Vec<PatternStatistic> =
            self.post_json("patternstatistics", &request).await?;
        info!(%symbol, %time_frame, count = statistics.len(), "Fetched pattern statistics");
        Ok(statistics)
    }
}

/// Dates are sent to the backend without a time component.
pub fn standardize_date(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d").to_string()
}

#[async_trait]
impl AnalysisBackend for AnalysisApi {
    async fn fetch_candles(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, DropwatchError> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("timeFrame", time_frame.to_string()),
            ("startDate", standardize_date(&start)),
        ];
        if let Some(end) = end {
            query.push(("endDate", standardize_date(&end)));
        }

        let values: Vec<serde_json::Value> =
            self.get_json("fetchcandlestickdata", &query).await?;
        let received = values.len();
        let candles = candle::parse_batch(values);
        debug!(
            %symbol,
            %time_frame,
            received,
            valid = candles.len(),
            "Received candlesticks"
        );
        Ok(candles)
    }

    async fn start_live_analysis(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
        params: &AnalysisParameters,
    ) -> Result<serde_json::Value, DropwatchError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("timeFrame", time_frame.to_string()),
            ("maxGreenCandles", params.max_green_candles.to_string()),
            ("minConsecutiveCandles", params.min_consecutive_candles.to_string()),
            ("dropThreshold", params.effective_drop_threshold().to_string()),
        ];
        let ack: serde_json::Value = self.get_json("streamlivedata", &query).await?;
        info!(%symbol, %time_frame, "Live analysis started");
        Ok(ack)
    }

    async fn stop_live_analysis(
        &self,
        symbol: &str,
        time_frame: TimeFrame,
    ) -> Result<StopResponse, DropwatchError> {
        let body = SymbolTimeFrame {
            symbol,
            time_frame: time_frame.to_string(),
        };
        let response: StopResponse = self.post_json("stopliveanalysis", &body).await?;
        info!(%symbol, %time_frame, success = response.success, reply = %response.message, "Stop analysis response");
        Ok(response)
    }
}
