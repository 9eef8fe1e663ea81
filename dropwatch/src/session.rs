//! One symbol/timeframe view: candle buffer, signal log, polling refresher and
//! live push connection, all owned by a single task.
//!
//! Everything that can change session state arrives as an event on one queue:
//! commands from the [`SessionHandle`], polling results from the refresher and
//! hub events from the push connection. Events are handled strictly one at a
//! time, so no two handlers ever touch the candle store concurrently.
//!
//! Background tasks tag their events with the generation they were started
//! in. Results from a refresher that has since been replaced, or from a live
//! connection that has since been stopped, are discarded.

use crate::{
    api::AnalysisBackend,
    candle::{self, Candle},
    error::DropwatchError,
    hub::{ConnectionStatus, HubConnector, HubEvent, HubHandle, Subscription},
    params::{AnalysisParameters, TimeFrame, TimeRange, DEFAULT_REFRESH_INTERVAL},
    refresher::{PollResult, PollingRefresher, RefresherHandle},
    signal::SignalMessage,
    signal_log::{IngestOutcome, LogEntry, SignalLog, DEFAULT_LOG_CAPACITY},
    store::{CandleStore, ReconcileSummary, DEFAULT_CANDLE_CAPACITY},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub symbol: String,
    pub time_frame: TimeFrame,
    /// History window loaded on start and on [`SessionCommand::LoadHistory`]
    pub time_range: TimeRange,
    pub refresh_interval: Duration,
    pub candle_capacity: usize,
    pub log_capacity: usize,
    /// Size of the event queue and of the update channel
    pub queue_size: usize,
    /// How long a hub connection gets to close cleanly
    pub hub_shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            time_frame: TimeFrame::default(),
            time_range: TimeRange::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            candle_capacity: DEFAULT_CANDLE_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            queue_size: 1000,
            hub_shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    pub fn with_time_frame(mut self, time_frame: TimeFrame) -> Self {
        self.time_frame = time_frame;
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = time_range;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_candle_capacity(mut self, capacity: usize) -> Self {
        self.candle_capacity = capacity;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }
}

/// Requests accepted by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Stop polling and start server-driven analysis with these parameters.
    StartLive(AnalysisParameters),
    /// Stop live analysis and resume polling.
    StopLive,
    /// Change the polling interval, restarting the refresher if it runs.
    SetRefreshInterval(Duration),
    /// Re-fetch the configured history window and replace the candle buffer.
    LoadHistory,
    Shutdown,
}

/// What a renderer needs to know after each handled event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Snapshot of the candle buffer after a change.
    CandlesChanged {
        candles: Vec<Candle>,
        summary: ReconcileSummary,
    },
    /// The signal log changed; `entry` is the affected entry if still logged.
    SignalLogged {
        outcome: IngestOutcome,
        entry: Option<LogEntry>,
    },
    LiveStarted {
        symbol: String,
        time_frame: TimeFrame,
    },
    /// Live analysis ended; `reason` is set when the backend ended it.
    LiveStopped { reason: Option<String> },
    Status(ConnectionStatus),
    /// Non-fatal problem worth showing to the user.
    Notice(String),
}

#[derive(Debug)]
enum SessionEvent {
    Command(SessionCommand),
    Poll(PollResult),
    Hub { generation: u64, event: HubEvent },
}

impl From<PollResult> for SessionEvent {
    fn from(poll: PollResult) -> Self {
        SessionEvent::Poll(poll)
    }
}

struct Channels {
    events: mpsc::Sender<SessionEvent>,
    updates: mpsc::Sender<SessionUpdate>,
}

impl Channels {
    async fn notify(&self, update: SessionUpdate) {
        if self.updates.send(update).await.is_err() {
            debug!("Update receiver dropped");
        }
    }
}

struct LiveState {
    generation: u64,
    subscription: Subscription,
    hub: HubHandle,
    forwarder: JoinHandle<()>,
}

/// State of one chart view.
pub struct Session {
    config: SessionConfig,
    backend: Arc<dyn AnalysisBackend>,
    connector: Arc<dyn HubConnector>,
    store: CandleStore,
    log: SignalLog,
    refresher: Option<RefresherHandle>,
    refresh_generation: u64,
    live: Option<LiveState>,
    live_generation: u64,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn AnalysisBackend>,
        connector: Arc<dyn HubConnector>,
    ) -> Self {
        Self {
            store: CandleStore::new(config.candle_capacity),
            log: SignalLog::new(config.log_capacity),
            config,
            backend,
            connector,
            refresher: None,
            refresh_generation: 0,
            live: None,
            live_generation: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &CandleStore {
        &self.store
    }

    pub fn signal_log(&self) -> &SignalLog {
        &self.log
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn is_polling(&self) -> bool {
        self.refresher.is_some()
    }

    /// Run the session on its own task.
    ///
    /// The session loads its history window, starts polling and then handles
    /// events until shut down.
    pub fn spawn(self) -> (SessionHandle, mpsc::Receiver<SessionUpdate>) {
        let size = self.config.queue_size.max(1);
        let (events, events_rx) = mpsc::channel(size);
        let (updates, updates_rx) = mpsc::channel(size);

        let channels = Channels {
            events: events.clone(),
            updates,
        };
        let task = tokio::spawn(self.run(events_rx, channels));

        (
            SessionHandle {
                events,
                task: Some(task),
            },
            updates_rx,
        )
    }

    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>, channels: Channels) -> Self {
        info!(symbol = %self.config.symbol, time_frame = %self.config.time_frame, "Session started");

        self.load_history(&channels).await;
        self.start_refresher(&channels);

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Command(SessionCommand::Shutdown) => break,
                SessionEvent::Command(command) => self.handle_command(command, &channels).await,
                SessionEvent::Poll(poll) => self.handle_poll(poll, &channels).await,
                SessionEvent::Hub { generation, event } => {
                    self.handle_hub(generation, event, &channels).await
                }
            }
        }

        self.stop_refresher();
        self.stop_live(None, false, &channels).await;
        info!(symbol = %self.config.symbol, "Session shut down");
        self
    }

    async fn handle_command(&mut self, command: SessionCommand, channels: &Channels) {
        debug!(?command, "Handling session command");
        match command {
            SessionCommand::StartLive(params) => self.start_live(params, channels).await,
            SessionCommand::StopLive => {
                if self.live.is_none() {
                    channels
                        .notify(SessionUpdate::Notice("Live analysis is not running".to_string()))
                        .await;
                    return;
                }
                self.stop_live(None, true, channels).await
            }
            SessionCommand::SetRefreshInterval(interval) => {
                info!(interval_ms = interval.as_millis() as u64, "Refresh interval changed");
                self.config.refresh_interval = interval;
                if self.refresher.is_some() {
                    self.start_refresher(channels);
                }
            }
            SessionCommand::LoadHistory => self.load_history(channels).await,
            SessionCommand::Shutdown => {}
        }
    }

    async fn load_history(&mut self, channels: &Channels) {
        let start = Utc::now() - self.config.time_range.as_chrono();
        match self
            .backend
            .fetch_candles(&self.config.symbol, self.config.time_frame, start, None)
            .await
        {
            Ok(candles) => {
                let summary = self.store.replace(candles);
                info!(
                    symbol = %self.config.symbol,
                    days = self.config.time_range.days,
                    candles = self.store.len(),
                    "Loaded history"
                );
                self.notify_candles(summary, channels).await;
            }
            Err(e) => {
                warn!(symbol = %self.config.symbol, error = %e, "Failed to load history");
                channels.notify(SessionUpdate::Notice(e.to_string())).await;
            }
        }
    }

    /// (Re)start polling. No-op while live.
    fn start_refresher(&mut self, channels: &Channels) {
        if self.live.is_some() {
            return;
        }
        self.stop_refresher();
        self.refresh_generation += 1;
        let refresher = PollingRefresher::new(
            self.backend.clone(),
            self.config.symbol.clone(),
            self.config.time_frame,
            self.config.refresh_interval,
        );
        self.refresher = Some(refresher.spawn(self.refresh_generation, channels.events.clone()));
    }

    fn stop_refresher(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
    }

    async fn handle_poll(&mut self, poll: PollResult, channels: &Channels) {
        let current = self.refresher.as_ref().map(RefresherHandle::generation);
        if self.live.is_some() || current != Some(poll.generation) {
            debug!(generation = poll.generation, ?current, "Discarding stale poll result");
            return;
        }

        match poll.result {
            Ok(candles) => {
                let mut fresh: Vec<Candle> = candles
                    .into_iter()
                    .filter(|candle| !self.store.contains_time(&candle.time))
                    .collect();
                if fresh.is_empty() {
                    return;
                }
                fresh.sort_by_key(|candle| candle.time);
                let summary = self.store.reconcile(fresh);
                self.notify_candles(summary, channels).await;
            }
            Err(e) => {
                warn!(error = %e, "Polling refresh failed");
                channels.notify(SessionUpdate::Notice(e.to_string())).await;
            }
        }
    }

    async fn start_live(&mut self, params: AnalysisParameters, channels: &Channels) {
        if self.live.is_some() {
            channels
                .notify(SessionUpdate::Notice("Live analysis is already running".to_string()))
                .await;
            return;
        }

        // Polling must be gone before the next tick can fire
        self.stop_refresher();

        let symbol = self.config.symbol.clone();
        let time_frame = self.config.time_frame;
        if let Err(e) = self
            .backend
            .start_live_analysis(&symbol, time_frame, &params)
            .await
        {
            error!(%symbol, %time_frame, error = %e, "Failed to start live analysis");
            channels.notify(SessionUpdate::Notice(e.to_string())).await;
            self.start_refresher(channels);
            return;
        }

        self.live_generation += 1;
        let generation = self.live_generation;
        let (hub, mut hub_events) = self.connector.connect();

        let events = channels.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = hub_events.recv().await {
                if events
                    .send(SessionEvent::Hub { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let subscription = Subscription::new(symbol.clone(), time_frame);
        if let Err(e) = hub.subscribe(subscription.clone()) {
            warn!(error = %e, "Failed to queue subscription");
        }

        info!(
            %symbol,
            %time_frame,
            max_green_candles = params.max_green_candles,
            min_consecutive_candles = params.min_consecutive_candles,
            drop_threshold = params.effective_drop_threshold(),
            "Live analysis started"
        );
        self.live = Some(LiveState {
            generation,
            subscription,
            hub,
            forwarder,
        });
        channels
            .notify(SessionUpdate::LiveStarted { symbol, time_frame })
            .await;
    }

    /// Tear down live analysis: unsubscribe, close the hub, tell the backend,
    /// then optionally resume polling.
    async fn stop_live(&mut self, reason: Option<String>, resume: bool, channels: &Channels) {
        let Some(live) = self.live.take() else {
            return;
        };
        self.live_generation += 1;
        self.log.clear_active();

        if let Err(e) = live.hub.unsubscribe(live.subscription.clone()) {
            debug!(error = %e, "Hub already gone when unsubscribing");
        }
        live.forwarder.abort();
        live.hub.shutdown(self.config.hub_shutdown_grace).await;

        let symbol = &live.subscription.symbol;
        let time_frame = live.subscription.time_frame;
        match self.backend.stop_live_analysis(symbol, time_frame).await {
            Ok(response) if !response.success => {
                warn!(%symbol, reply = %response.message, "Backend refused to stop analysis");
                channels.notify(SessionUpdate::Notice(response.message)).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%symbol, error = %e, "Failed to stop live analysis");
                channels.notify(SessionUpdate::Notice(e.to_string())).await;
            }
        }

        info!(%symbol, %time_frame, ?reason, "Live analysis stopped");
        if resume {
            self.start_refresher(channels);
        }
        channels.notify(SessionUpdate::LiveStopped { reason }).await;
    }

    async fn handle_hub(&mut self, generation: u64, event: HubEvent, channels: &Channels) {
        if self.live.as_ref().map(|live| live.generation) != Some(generation) {
            debug!(generation, "Discarding hub event from a stopped connection");
            return;
        }

        match event {
            HubEvent::Status(status) => channels.notify(SessionUpdate::Status(status)).await,
            // The hub keeps retrying either way; a refused reconnect is only reported
            HubEvent::ServerClosed {
                error,
                allow_reconnect,
            } => {
                let notice = match (error, allow_reconnect) {
                    (Some(error), true) => format!("Hub closed: {error}"),
                    (Some(error), false) => {
                        format!("Hub closed: {error} (server asked clients not to reconnect)")
                    }
                    (None, false) => {
                        "Hub closed (server asked clients not to reconnect)".to_string()
                    }
                    (None, true) => return,
                };
                warn!(%notice, "Hub closed by server");
                channels.notify(SessionUpdate::Notice(notice)).await
            }
            HubEvent::Signal(message) => self.handle_signal(message, channels).await,
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage, channels: &Channels) {
        match message {
            SignalMessage::Init(init) => {
                let candles = candle::parse_batch(init.candles);
                if candles.is_empty() {
                    debug!("Ignoring empty Init snapshot");
                    return;
                }
                let summary = self.store.replace(candles);
                self.notify_candles(summary, channels).await;
            }
            SignalMessage::ChartUpdate(update) => {
                let mut summary = ReconcileSummary::default();
                for candle in candle::parse_batch(update.into_candle_values()) {
                    let tick = self.store.append_or_merge_latest(candle);
                    summary.merged += tick.merged;
                    summary.inserted += tick.inserted;
                    summary.evicted += tick.evicted;
                }
                if summary.changed() {
                    self.notify_candles(summary, channels).await;
                }
            }
            message => match self.log.ingest(message) {
                Ok(IngestOutcome::Ignored) => {}
                Ok(outcome) => {
                    let entry = match outcome {
                        IngestOutcome::Prepended { id }
                        | IngestOutcome::UpdatedInPlace { id }
                        | IngestOutcome::Completed { id, .. } => self.log.get(id).cloned(),
                        IngestOutcome::Ignored => None,
                    };
                    channels
                        .notify(SessionUpdate::SignalLogged { outcome, entry })
                        .await;
                }
                Err(e) if e.is_session_fatal() => {
                    error!(error = %e, "Live analysis failed");
                    let reason = match e {
                        DropwatchError::Backend(message) => message,
                        other => other.to_string(),
                    };
                    self.stop_live(Some(reason), true, channels).await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to ingest signal");
                    channels.notify(SessionUpdate::Notice(e.to_string())).await;
                }
            },
        }
    }

    async fn notify_candles(&self, summary: ReconcileSummary, channels: &Channels) {
        debug!(?summary, len = self.store.len(), "Candle store changed");
        channels
            .notify(SessionUpdate::CandlesChanged {
                candles: self.store.to_vec(),
                summary,
            })
            .await;
    }
}

/// Owner side of a running [`Session`]. Dropping it aborts the session task,
/// which tears down its refresher and hub connection.
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    task: Option<JoinHandle<Session>>,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<(), DropwatchError> {
        self.events
            .send(SessionEvent::Command(command))
            .await
            .map_err(|_| DropwatchError::ChannelClosed("session"))
    }

    pub async fn start_live(&self, params: AnalysisParameters) -> Result<(), DropwatchError> {
        self.send(SessionCommand::StartLive(params)).await
    }

    pub async fn stop_live(&self) -> Result<(), DropwatchError> {
        self.send(SessionCommand::StopLive).await
    }

    pub async fn set_refresh_interval(&self, interval: Duration) -> Result<(), DropwatchError> {
        self.send(SessionCommand::SetRefreshInterval(interval)).await
    }

    pub async fn load_history(&self) -> Result<(), DropwatchError> {
        self.send(SessionCommand::LoadHistory).await
    }

    /// Stop the session and hand back its final state.
    pub async fn shutdown(mut self) -> Result<Session, DropwatchError> {
        self.send(SessionCommand::Shutdown).await?;
        let task = self
            .task
            .take()
            .ok_or(DropwatchError::ChannelClosed("session"))?;
        task.await.map_err(|e| {
            error!(error = %e, "Session task failed");
            DropwatchError::ChannelClosed("session")
        })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        candle::candle,
        hub::HubCommand,
        refresher::tests::FakeBackend,
        signal::ChartUpdateMessage,
    };
    use serde_json::json;
    use std::sync::{atomic::Ordering, Mutex};

    type FakeConnection = (mpsc::Sender<HubEvent>, mpsc::UnboundedReceiver<HubCommand>);

    /// Hands out detached hub handles and keeps the far ends for the test.
    #[derive(Default)]
    struct FakeConnector {
        connections: Mutex<Vec<FakeConnection>>,
    }

    impl FakeConnector {
        fn take(&self) -> FakeConnection {
            self.connections.lock().unwrap().remove(0)
        }
    }

    impl HubConnector for FakeConnector {
        fn connect(&self) -> (HubHandle, mpsc::Receiver<HubEvent>) {
            let (handle, commands) = HubHandle::detached();
            let (event_tx, event_rx) = mpsc::channel(16);
            self.connections.lock().unwrap().push((event_tx, commands));
            (handle, event_rx)
        }
    }

    fn spawn_session(
        backend: &Arc<FakeBackend>,
        connector: &Arc<FakeConnector>,
    ) -> (SessionHandle, mpsc::Receiver<SessionUpdate>) {
        let config = SessionConfig::new("SOLUSDT")
            .with_time_frame(TimeFrame::Minute1)
            .with_refresh_interval(Duration::from_secs(10));
        Session::new(config, backend.clone(), connector.clone()).spawn()
    }

    async fn wait_for<F>(updates: &mut mpsc::Receiver<SessionUpdate>, predicate: F) -> SessionUpdate
    where
        F: Fn(&SessionUpdate) -> bool,
    {
        let wait = async {
            loop {
                let update = updates.recv().await.expect("session ended");
                if predicate(&update) {
                    return update;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(600), wait)
            .await
            .expect("update never arrived")
    }

    /// Everything the session emitted up to and including the first match.
    async fn collect_until<F>(
        updates: &mut mpsc::Receiver<SessionUpdate>,
        predicate: F,
    ) -> Vec<SessionUpdate>
    where
        F: Fn(&SessionUpdate) -> bool,
    {
        let mut seen = Vec::new();
        let wait = async {
            loop {
                let update = updates.recv().await.expect("session ended");
                let done = predicate(&update);
                seen.push(update);
                if done {
                    return;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(600), wait)
            .await
            .expect("update never arrived");
        seen
    }

    fn signal(value: serde_json::Value) -> HubEvent {
        HubEvent::Signal(serde_json::from_value(value).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_fills_store_and_polling_adds_only_new_candles() {
        let backend = Arc::new(FakeBackend::with_batches(vec![
            Ok(vec![candle(200, 2.0, 3.0, 1.5, 2.5), candle(100, 1.0, 2.0, 0.5, 1.5)]),
            Ok(vec![candle(200, 9.0, 9.0, 9.0, 9.0), candle(300, 3.0, 4.0, 2.5, 3.5)]),
        ]));
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        let loaded = wait_for(&mut updates, |u| matches!(u, SessionUpdate::CandlesChanged { .. })).await;
        let SessionUpdate::CandlesChanged { candles, .. } = loaded else { unreachable!() };
        assert_eq!(candles.len(), 2);
        assert!(candles[0].time < candles[1].time);

        let polled = wait_for(&mut updates, |u| matches!(u, SessionUpdate::CandlesChanged { .. })).await;
        let SessionUpdate::CandlesChanged { candles, summary } = polled else { unreachable!() };
        assert_eq!(summary.inserted, 1);
        assert_eq!(candles.len(), 3);
        // Existing bucket is left alone by polling
        assert_eq!(candles[1].close, 2.5);

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.store().len(), 3);
        assert!(!session.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_results_from_old_refresher_or_while_live_are_discarded() {
        let backend = Arc::new(FakeBackend::with_batches(vec![Ok(vec![candle(
            100, 1.0, 2.0, 0.5, 1.5,
        )])]));
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::CandlesChanged { .. })).await;

        // The running refresher is generation 1; generation 0 is long gone
        for result in [
            Ok(vec![candle(500, 5.0, 6.0, 4.5, 5.5)]),
            Err(DropwatchError::Backend("late failure".to_string())),
        ] {
            handle
                .events
                .send(SessionEvent::Poll(PollResult { generation: 0, result }))
                .await
                .unwrap();
        }

        handle.start_live(AnalysisParameters::default()).await.unwrap();
        let seen = collect_until(&mut updates, |u| matches!(u, SessionUpdate::LiveStarted { .. })).await;
        assert!(
            !seen
                .iter()
                .any(|u| matches!(u, SessionUpdate::CandlesChanged { .. } | SessionUpdate::Notice(_))),
            "stale poll leaked: {seen:?}"
        );

        // Even the last refresher's generation is ignored once live
        handle
            .events
            .send(SessionEvent::Poll(PollResult {
                generation: 1,
                result: Ok(vec![candle(600, 6.0, 7.0, 5.5, 6.5)]),
            }))
            .await
            .unwrap();

        handle.stop_live().await.unwrap();
        let seen = collect_until(&mut updates, |u| matches!(u, SessionUpdate::LiveStopped { .. })).await;
        assert!(
            !seen.iter().any(|u| matches!(u, SessionUpdate::CandlesChanged { .. })),
            "poll applied while live: {seen:?}"
        );

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.store().len(), 1);
        assert_eq!(session.store().to_vec()[0].close, 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_live_stops_refresher_before_next_tick() {
        let backend = Arc::new(FakeBackend::default());
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        handle.start_live(AnalysisParameters::default()).await.unwrap();
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::LiveStarted { .. })).await;

        tokio::time::sleep(Duration::from_secs(35)).await;
        // Only the initial history load hit the backend
        assert_eq!(backend.fetch_count(), 1);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);

        let (_events, mut commands) = connector.take();
        assert_eq!(
            commands.recv().await,
            Some(HubCommand::Subscribe(Subscription::new("SOLUSDT", TimeFrame::Minute1)))
        );

        let session = handle.shutdown().await.unwrap();
        assert!(!session.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_tick_merges_into_latest_candle() {
        let backend = Arc::new(FakeBackend::with_batches(vec![Ok(vec![
            candle(100, 1.0, 2.0, 0.5, 1.5),
            candle(200, 2.0, 3.0, 1.5, 2.5),
        ])]));
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        handle.start_live(AnalysisParameters::default()).await.unwrap();
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::LiveStarted { .. })).await;
        let (events, _commands) = connector.take();

        let tick = ChartUpdateMessage {
            candle: Some(json!({"open": 7.0, "high": 4.0, "low": 1.8, "close": 3.2, "time": 200})),
            ..Default::default()
        };
        events
            .send(HubEvent::Signal(SignalMessage::ChartUpdate(tick)))
            .await
            .unwrap();

        let update = wait_for(&mut updates, |u| matches!(u, SessionUpdate::CandlesChanged { summary, .. } if summary.merged == 1)).await;
        let SessionUpdate::CandlesChanged { candles, .. } = update else { unreachable!() };
        assert_eq!(candles.len(), 2);
        let latest = &candles[1];
        assert_eq!(latest.high, 4.0);
        assert_eq!(latest.low, 1.5);
        assert_eq!(latest.open, 2.0);
        assert_eq!(latest.close, 3.2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reversal_lifecycle_through_hub() {
        let backend = Arc::new(FakeBackend::default());
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        handle.start_live(AnalysisParameters::default()).await.unwrap();
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::LiveStarted { .. })).await;
        let (events, _commands) = connector.take();

        events
            .send(signal(json!({"type": "ReversalSignal", "startPrice": 10, "lowestPrice": 8})))
            .await
            .unwrap();
        let started = wait_for(&mut updates, |u| matches!(u, SessionUpdate::SignalLogged { .. })).await;
        assert!(matches!(
            started,
            SessionUpdate::SignalLogged { outcome: IngestOutcome::Prepended { .. }, .. }
        ));

        events
            .send(signal(json!({"type": "ReversalUpdate", "startPrice": 10, "lowestPrice": 8, "reversalPercent": "5%"})))
            .await
            .unwrap();
        let updated = wait_for(&mut updates, |u| matches!(u, SessionUpdate::SignalLogged { .. })).await;
        let SessionUpdate::SignalLogged { outcome, entry } = updated else { unreachable!() };
        assert!(matches!(outcome, IngestOutcome::UpdatedInPlace { .. }));
        assert_eq!(entry.and_then(|e| e.reversal_percent()), Some(5.0));

        events
            .send(signal(json!({"type": "ReversalComplete", "startPrice": 10, "lowestPrice": 8})))
            .await
            .unwrap();
        let completed = wait_for(&mut updates, |u| matches!(u, SessionUpdate::SignalLogged { .. })).await;
        assert!(matches!(
            completed,
            SessionUpdate::SignalLogged { outcome: IngestOutcome::Completed { was_active: true, .. }, .. }
        ));

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.signal_log().len(), 2);
        assert_eq!(session.signal_log().active_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_signal_stops_live_and_resumes_polling() {
        let backend = Arc::new(FakeBackend::default());
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        handle.start_live(AnalysisParameters::default()).await.unwrap();
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::LiveStarted { .. })).await;
        let (events, mut commands) = connector.take();

        events
            .send(signal(json!({"type": "ReversalSignal", "startPrice": 10, "lowestPrice": 8, "currentPrice": 8.5})))
            .await
            .unwrap();
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::SignalLogged { .. })).await;

        events
            .send(signal(json!({"type": "Error", "message": "symbol delisted"})))
            .await
            .unwrap();
        let stopped = wait_for(&mut updates, |u| matches!(u, SessionUpdate::LiveStopped { .. })).await;
        assert_eq!(
            stopped,
            SessionUpdate::LiveStopped { reason: Some("symbol delisted".to_string()) }
        );
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);

        let subscription = Subscription::new("SOLUSDT", TimeFrame::Minute1);
        assert_eq!(commands.recv().await, Some(HubCommand::Subscribe(subscription.clone())));
        assert_eq!(commands.recv().await, Some(HubCommand::Unsubscribe(subscription)));
        assert_eq!(commands.recv().await, Some(HubCommand::Shutdown));

        // Events from the stopped connection are dropped
        let _ = events
            .send(signal(json!({"type": "Signal", "price": 9, "dropPercent": 6, "consecutiveCandles": 3})))
            .await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(backend.fetch_count(), 2);

        let session = handle.shutdown().await.unwrap();
        // The reversal stays in the log but is no longer tracked as in flight
        assert_eq!(session.signal_log().len(), 1);
        assert_eq!(session.signal_log().active_len(), 0);
        assert!(!session.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_is_reported_as_notice() {
        let backend = Arc::new(FakeBackend::default());
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        handle.start_live(AnalysisParameters::default()).await.unwrap();
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::LiveStarted { .. })).await;
        let (events, _commands) = connector.take();

        struct TestCase {
            error: Option<&'static str>,
            allow_reconnect: bool,
            expected: Option<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: plain close with a reason
                error: Some("restarting"),
                allow_reconnect: true,
                expected: Some("Hub closed: restarting"),
            },
            TestCase {
                // TC1: close without a reason is silent
                error: None,
                allow_reconnect: true,
                expected: None,
            },
            TestCase {
                // TC2: server refuses reconnects
                error: Some("maintenance"),
                allow_reconnect: false,
                expected: Some("Hub closed: maintenance (server asked clients not to reconnect)"),
            },
            TestCase {
                // TC3: refused reconnect without a reason
                error: None,
                allow_reconnect: false,
                expected: Some("Hub closed (server asked clients not to reconnect)"),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            events
                .send(HubEvent::ServerClosed {
                    error: test.error.map(str::to_string),
                    allow_reconnect: test.allow_reconnect,
                })
                .await
                .unwrap();
            // A status behind each close marks where its output ends
            events
                .send(HubEvent::Status(ConnectionStatus::Reconnecting))
                .await
                .unwrap();

            let seen = collect_until(&mut updates, |u| matches!(u, SessionUpdate::Status(_))).await;
            let notice = seen.iter().find_map(|u| match u {
                SessionUpdate::Notice(notice) => Some(notice.as_str()),
                _ => None,
            });
            assert_eq!(notice, test.expected, "TC{} failed", index);
        }

        let session = handle.shutdown().await.unwrap();
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert!(!session.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_completes_once_update_receiver_is_dropped() {
        let backend = Arc::new(FakeBackend::with_batches(vec![Ok(vec![candle(
            100, 1.0, 2.0, 0.5, 1.5,
        )])]));
        let connector = Arc::new(FakeConnector::default());
        let config = SessionConfig::new("SOLUSDT")
            .with_time_frame(TimeFrame::Minute1)
            .with_queue_size(1);
        let (handle, updates) = Session::new(config, backend.clone(), connector.clone()).spawn();

        // The history update fills the queue, so LiveStarted has nowhere to go
        handle.start_live(AnalysisParameters::default()).await.unwrap();
        tokio::task::yield_now().await;

        drop(updates);
        let session = tokio::time::timeout(Duration::from_secs(600), handle.shutdown())
            .await
            .expect("session blocked on a full update queue")
            .unwrap();
        assert_eq!(session.store().len(), 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_keeps_polling() {
        let backend = Arc::new(FakeBackend {
            fail_start: true,
            ..Default::default()
        });
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        handle.start_live(AnalysisParameters::default()).await.unwrap();
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::Notice(_))).await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(backend.fetch_count(), 2);
        assert!(connector.connections.lock().unwrap().is_empty());

        let session = handle.shutdown().await.unwrap();
        assert!(!session.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_live_when_idle_is_a_notice() {
        let backend = Arc::new(FakeBackend::default());
        let connector = Arc::new(FakeConnector::default());
        let (handle, mut updates) = spawn_session(&backend, &connector);

        handle.stop_live().await.unwrap();
        let notice = wait_for(&mut updates, |u| matches!(u, SessionUpdate::Notice(_))).await;
        assert_eq!(notice, SessionUpdate::Notice("Live analysis is not running".to_string()));
        assert_eq!(backend.stops.load(Ordering::SeqCst), 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_interval_change_restarts_polling() {
        let backend = Arc::new(FakeBackend::default());
        let connector = Arc::new(FakeConnector::default());
        let (handle, _updates) = spawn_session(&backend, &connector);

        handle.set_refresh_interval(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        // One history load plus five one-second ticks
        assert_eq!(backend.fetch_count(), 6);

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.config().refresh_interval, Duration::from_secs(1));
    }
}
