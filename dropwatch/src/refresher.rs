//! Interval polling of the latest candles while live push is inactive.

use crate::{api::AnalysisBackend, candle::Candle, error::DropwatchError, params::TimeFrame};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

/// Width, in hours, of the window re-fetched on every tick.
pub const POLL_WINDOW_HOURS: i64 = 24;

/// Outcome of one polling tick, tagged with the run that produced it.
#[derive(Debug)]
pub struct PollResult {
    pub generation: u64,
    pub result: Result<Vec<Candle>, DropwatchError>,
}

/// Polls `fetchcandlestickdata` for the most recent window on a fixed interval.
#[derive(Clone)]
pub struct PollingRefresher {
    backend: Arc<dyn AnalysisBackend>,
    symbol: String,
    time_frame: TimeFrame,
    interval: Duration,
}

impl PollingRefresher {
    pub fn new(
        backend: Arc<dyn AnalysisBackend>,
        symbol: impl Into<String>,
        time_frame: TimeFrame,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            symbol: symbol.into(),
            time_frame,
            // A zero period would panic inside tokio's interval
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling; every result is posted to `events` tagged with `generation`.
    ///
    /// The first fetch happens one interval after spawning.
    pub fn spawn<E>(self, generation: u64, events: mpsc::Sender<E>) -> RefresherHandle
    where
        E: From<PollResult> + Send + 'static,
    {
        let interval = self.interval;
        info!(
            symbol = %self.symbol,
            time_frame = %self.time_frame,
            interval_ms = interval.as_millis() as u64,
            generation,
            "Starting polling refresher"
        );
        let task = tokio::spawn(self.run(generation, events));
        RefresherHandle {
            generation,
            interval,
            task,
        }
    }

    async fn run<E>(self, generation: u64, events: mpsc::Sender<E>)
    where
        E: From<PollResult> + Send + 'static,
    {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let start = Utc::now() - chrono::Duration::hours(POLL_WINDOW_HOURS);
            let result = self
                .backend
                .fetch_candles(&self.symbol, self.time_frame, start, None)
                .await;
            debug!(generation, ok = result.is_ok(), "Polling tick finished");

            if events.send(E::from(PollResult { generation, result })).await.is_err() {
                debug!(generation, "Session queue closed, stopping refresher");
                break;
            }
        }
    }
}

/// Running refresher. Dropping it stops the task.
#[derive(Debug)]
pub struct RefresherHandle {
    generation: u64,
    interval: Duration,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling immediately, including any fetch in flight.
    pub fn abort(self) {
        debug!(generation = self.generation, "Stopping polling refresher");
        self.task.abort();
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{api::StopResponse, candle::candle, params::AnalysisParameters};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    /// In-memory backend: serves a queue of candle batches, records calls.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub batches: Mutex<Vec<Result<Vec<Candle>, DropwatchError>>>,
        pub fetches: AtomicUsize,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        pub fail_start: bool,
    }

    impl FakeBackend {
        pub fn with_batches(batches: Vec<Result<Vec<Candle>, DropwatchError>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                ..Default::default()
            }
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisBackend for FakeBackend {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            _time_frame: TimeFrame,
            _start: DateTime<Utc>,
            _end: Option<DateTime<Utc>>,
        ) -> Result<Vec<Candle>, DropwatchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                batches.remove(0)
            }
        }

        async fn start_live_analysis(
            &self,
            _symbol: &str,
            _time_frame: TimeFrame,
            _params: &AnalysisParameters,
        ) -> Result<serde_json::Value, DropwatchError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(DropwatchError::Status {
                    endpoint: "streamlivedata",
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                });
            }
            Ok(serde_json::json!({"message": "started"}))
        }

        async fn stop_live_analysis(
            &self,
            _symbol: &str,
            _time_frame: TimeFrame,
        ) -> Result<StopResponse, DropwatchError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(StopResponse {
                success: true,
                message: "stopped".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval_with_generation() {
        let backend = Arc::new(FakeBackend::with_batches(vec![Ok(vec![candle(
            60_000, 1.0, 2.0, 0.5, 1.5,
        )])]));
        let (tx, mut rx) = mpsc::channel::<PollResult>(8);

        let handle = PollingRefresher::new(backend.clone(), "SOLUSDT", TimeFrame::Minute1, Duration::from_secs(2))
            .spawn(7, tx);

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(backend.fetch_count(), 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.generation, 7);
        assert_eq!(first.result.unwrap().len(), 1);

        let second = rx.recv().await.unwrap();
        assert!(second.result.unwrap().is_empty());
        assert_eq!(backend.fetch_count(), 2);
        assert_eq!(handle.generation(), 7);
        assert_eq!(handle.interval(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_before_next_tick() {
        let backend = Arc::new(FakeBackend::default());
        let (tx, mut rx) = mpsc::channel::<PollResult>(8);

        let handle = PollingRefresher::new(backend.clone(), "SOLUSDT", TimeFrame::Minute1, Duration::from_secs(1))
            .spawn(1, tx);
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.abort();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(backend.fetch_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_posted_not_fatal() {
        let backend = Arc::new(FakeBackend::with_batches(vec![
            Err(DropwatchError::ChannelClosed("test")),
            Ok(Vec::new()),
        ]));
        let (tx, mut rx) = mpsc::channel::<PollResult>(8);

        let _handle = PollingRefresher::new(backend, "SOLUSDT", TimeFrame::Minute1, Duration::from_secs(1))
            .spawn(3, tx);

        assert!(rx.recv().await.unwrap().result.is_err());
        assert!(rx.recv().await.unwrap().result.is_ok());
    }
}
