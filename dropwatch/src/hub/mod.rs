/// Push channel to the analysis hub
///
/// Provides automatic reconnection with backoff, keep-alive pings, a read-idle
/// timeout and typed dispatch of `ReceiveSignal` messages. Subscriptions are
/// tracked client side, so subscribing twice sends once and every tracked
/// subscription is replayed after a reconnect.
pub mod protocol;

use crate::{
    error::{DropwatchError, ProtocolError},
    params::TimeFrame,
    signal::SignalMessage,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use indexmap::IndexSet;
use protocol::HubMessage;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout, timeout_at, Instant},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

/// Hub client configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Hub WebSocket URL
    pub url: String,
    /// First delay after a disconnect
    pub reconnect_delay: Duration,
    /// Backoff ceiling
    pub max_reconnect_delay: Duration,
    /// Keep-alive ping interval
    pub ping_interval: Duration,
    /// Reconnect if nothing is read for this long
    pub read_timeout: Duration,
    /// Maximum channel buffer size for events
    pub channel_buffer_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/analysisHub".to_string(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            channel_buffer_size: 1000,
        }
    }
}

impl HubConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set initial reconnect delay and backoff ceiling
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }

    /// Set ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set read-idle timeout
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Set channel buffer size
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    /// Delay before reconnect attempt `n + 1`, given the delay used for attempt `n`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_reconnect_delay)
    }
}

/// Connection status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Analysis stream the client is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub symbol: String,
    pub time_frame: TimeFrame,
}

impl Subscription {
    pub fn new(symbol: impl Into<String>, time_frame: TimeFrame) -> Self {
        Self {
            symbol: symbol.into(),
            time_frame,
        }
    }

    fn arguments(&self) -> [Value; 2] {
        [json!(self.symbol), json!(self.time_frame.to_string())]
    }
}

/// Everything the hub client reports.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Status(ConnectionStatus),
    Signal(SignalMessage),
    /// The server closed the hub session. The client reconnects regardless of
    /// `allow_reconnect`; giving up is left to the owner of the handle.
    ServerClosed {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

/// Requests from the owner of a [`HubHandle`] to the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum HubCommand {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Shutdown,
}

/// Owner side of a running hub connection. Dropping it stops the connection task.
#[derive(Debug)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    task: Option<JoinHandle<()>>,
}

impl HubHandle {
    /// A handle with no connection task behind it; commands land in the returned receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<HubCommand>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands,
                task: None,
            },
            command_rx,
        )
    }

    pub fn subscribe(&self, subscription: Subscription) -> Result<(), DropwatchError> {
        self.send(HubCommand::Subscribe(subscription))
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> Result<(), DropwatchError> {
        self.send(HubCommand::Unsubscribe(subscription))
    }

    fn send(&self, command: HubCommand) -> Result<(), DropwatchError> {
        self.commands
            .send(command)
            .map_err(|_| DropwatchError::ChannelClosed("hub command"))
    }

    /// Close the connection gracefully, aborting it if it does not finish in time.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.commands.send(HubCommand::Shutdown);
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if timeout(grace, task).await.is_err() {
                warn!("Hub task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Something that can open a push channel. Implemented by [`HubConfig`].
pub trait HubConnector: Send + Sync {
    fn connect(&self) -> (HubHandle, mpsc::Receiver<HubEvent>);
}

impl HubConnector for HubConfig {
    fn connect(&self) -> (HubHandle, mpsc::Receiver<HubEvent>) {
        HubClient::with_config(self.clone()).start()
    }
}

/// Hub client for analysis signals
pub struct HubClient {
    config: HubConfig,
}

impl HubClient {
    /// Create a new hub client with default configuration
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub client with custom configuration
    pub fn with_config(config: HubConfig) -> Self {
        Self { config }
    }

    /// Start the connection task
    ///
    /// Returns the command handle and a receiver for hub events
    pub fn start(self) -> (HubHandle, mpsc::Receiver<HubEvent>) {
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_buffer_size.max(1));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_hub_loop(self.config, command_rx, event_tx));

        (
            HubHandle {
                commands,
                task: Some(task),
            },
            event_rx,
        )
    }
}

impl Default for HubClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a single connection ended.
#[derive(Debug)]
enum ConnectionEnd {
    Shutdown,
    ReceiverDropped,
    Lost(DropwatchError),
}

fn closed(reason: impl Into<String>) -> DropwatchError {
    DropwatchError::from(ProtocolError::Closed(reason.into()))
}

/// Main hub connection loop with auto-reconnect
async fn run_hub_loop(
    config: HubConfig,
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
    event_tx: mpsc::Sender<HubEvent>,
) {
    info!("Starting hub client for {}", config.url);

    let mut subscriptions = IndexSet::new();
    let mut delay = config.reconnect_delay;

    loop {
        // Notify about reconnection attempt
        if event_tx
            .send(HubEvent::Status(ConnectionStatus::Reconnecting))
            .await
            .is_err()
        {
            return;
        }

        match connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("Connected to hub at {}", config.url);
                let end = run_connection(
                    &config,
                    ws_stream,
                    &mut commands,
                    &mut subscriptions,
                    &event_tx,
                    &mut delay,
                )
                .await;
                match end {
                    ConnectionEnd::Shutdown => {
                        info!("Hub client shut down");
                        let _ = event_tx
                            .send(HubEvent::Status(ConnectionStatus::Disconnected))
                            .await;
                        return;
                    }
                    ConnectionEnd::ReceiverDropped => {
                        warn!("Event receiver dropped, stopping hub client");
                        return;
                    }
                    ConnectionEnd::Lost(e) => {
                        warn!(error = %e, severity = ?e.severity(), "Hub connection lost, will reconnect...");
                    }
                }
            }
            Err(e) => {
                let e = DropwatchError::from(e);
                error!(url = %config.url, error = %e, severity = ?e.severity(), "Failed to connect to hub");
            }
        }

        // Notify disconnection
        if event_tx
            .send(HubEvent::Status(ConnectionStatus::Disconnected))
            .await
            .is_err()
        {
            return;
        }

        // Wait before reconnecting, still tracking subscription changes
        debug!("Waiting {:?} before reconnecting...", delay);
        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                command = commands.recv() => match command {
                    None | Some(HubCommand::Shutdown) => {
                        info!("Hub client shut down while disconnected");
                        return;
                    }
                    Some(HubCommand::Subscribe(subscription)) => {
                        subscriptions.insert(subscription);
                    }
                    Some(HubCommand::Unsubscribe(subscription)) => {
                        subscriptions.shift_remove(&subscription);
                    }
                },
            }
        }
        delay = config.next_delay(delay);
    }
}

/// Drive one connected socket until it ends.
async fn run_connection(
    config: &HubConfig,
    ws_stream: WsStream,
    commands: &mut mpsc::UnboundedReceiver<HubCommand>,
    subscriptions: &mut IndexSet<Subscription>,
    event_tx: &mpsc::Sender<HubEvent>,
    delay: &mut Duration,
) -> ConnectionEnd {
    let (mut write, mut read) = ws_stream.split();

    if let Err(e) = write.send(Message::text(protocol::handshake_request())).await {
        return ConnectionEnd::Lost(e.into());
    }

    // Handshake: the first record answers it, anything after it is regular traffic
    let deadline = Instant::now() + config.read_timeout;
    let leftover = loop {
        match timeout_at(deadline, read.next()).await {
            Err(_) => {
                return ConnectionEnd::Lost(DropwatchError::Socket("handshake timed out".to_string()));
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                return ConnectionEnd::Lost(closed("during handshake"));
            }
            Ok(Some(Err(e))) => return ConnectionEnd::Lost(e.into()),
            Ok(Some(Ok(Message::Text(text)))) => {
                let mut records = protocol::split_records(text.as_str());
                let Some(first) = records.next() else {
                    continue;
                };
                if let Err(e) = protocol::parse_handshake_response(first) {
                    return ConnectionEnd::Lost(e.into());
                }
                break records.map(str::to_string).collect::<Vec<_>>();
            }
            Ok(Some(Ok(_))) => {}
        }
    };

    debug!("Hub handshake complete");
    *delay = config.reconnect_delay;
    if event_tx
        .send(HubEvent::Status(ConnectionStatus::Connected))
        .await
        .is_err()
    {
        return ConnectionEnd::ReceiverDropped;
    }

    // Replay subscriptions made before or during the outage
    for subscription in subscriptions.iter() {
        if let Err(e) = send_invocation(&mut write, protocol::SUBSCRIBE, subscription).await {
            return ConnectionEnd::Lost(e);
        }
    }

    for record in leftover {
        if let Some(end) = dispatch_record(&record, event_tx).await {
            return end;
        }
    }

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;
    let idle = sleep(config.read_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if write.send(Message::text(protocol::encode_ping())).await.is_err() {
                    debug!("Failed to send ping, connection likely dead");
                    return ConnectionEnd::Lost(DropwatchError::Socket("ping failed".to_string()));
                }
            }
            _ = &mut idle => {
                warn!(
                    timeout_secs = config.read_timeout.as_secs(),
                    "Hub read timeout - no data received, triggering reconnection"
                );
                return ConnectionEnd::Lost(DropwatchError::Socket("read timeout".to_string()));
            }
            command = commands.recv() => match command {
                None | Some(HubCommand::Shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
                Some(HubCommand::Subscribe(subscription)) => {
                    if subscriptions.contains(&subscription) {
                        debug!(symbol = %subscription.symbol, time_frame = %subscription.time_frame, "Already subscribed");
                        continue;
                    }
                    if let Err(e) = send_invocation(&mut write, protocol::SUBSCRIBE, &subscription).await {
                        subscriptions.insert(subscription);
                        return ConnectionEnd::Lost(e);
                    }
                    info!(symbol = %subscription.symbol, time_frame = %subscription.time_frame, "Subscribed to analysis");
                    subscriptions.insert(subscription);
                }
                Some(HubCommand::Unsubscribe(subscription)) => {
                    if !subscriptions.shift_remove(&subscription) {
                        debug!(symbol = %subscription.symbol, time_frame = %subscription.time_frame, "Not subscribed");
                        continue;
                    }
                    if let Err(e) = send_invocation(&mut write, protocol::UNSUBSCRIBE, &subscription).await {
                        return ConnectionEnd::Lost(e);
                    }
                    info!(symbol = %subscription.symbol, time_frame = %subscription.time_frame, "Unsubscribed from analysis");
                }
            },
            message = read.next() => {
                idle.as_mut().reset(Instant::now() + config.read_timeout);
                match message {
                    Some(Ok(Message::Text(text))) => {
                        for record in protocol::split_records(text.as_str()) {
                            if let Some(end) = dispatch_record(record, event_tx).await {
                                return end;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Server closed connection");
                        return ConnectionEnd::Lost(closed("by server"));
                    }
                    Some(Ok(_)) => {
                        // Heartbeat and binary frames
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return ConnectionEnd::Lost(e.into());
                    }
                    None => return ConnectionEnd::Lost(closed("stream ended")),
                }
            }
        }
    }
}

async fn send_invocation(
    write: &mut WsWrite,
    target: &str,
    subscription: &Subscription,
) -> Result<(), DropwatchError> {
    let record = protocol::encode_invocation(target, &subscription.arguments());
    write.send(Message::text(record)).await?;
    Ok(())
}

/// Forward one record. Returns how the connection ends, if it does.
async fn dispatch_record(record: &str, event_tx: &mpsc::Sender<HubEvent>) -> Option<ConnectionEnd> {
    let event = match protocol::decode_record(record) {
        Ok(HubMessage::Invocation { target, arguments }) if target == protocol::RECEIVE_SIGNAL => {
            match decode_signal(arguments) {
                Ok(signal) => HubEvent::Signal(signal),
                Err(e) => {
                    let preview: String = record.chars().take(200).collect();
                    debug!("Failed to parse signal: {} - {}", e, preview);
                    return None;
                }
            }
        }
        Ok(HubMessage::Invocation { target, .. }) => {
            debug!(%target, "Ignoring invocation for unknown hub method");
            return None;
        }
        Ok(HubMessage::Ping) | Ok(HubMessage::Other(_)) => return None,
        Ok(HubMessage::Close { error, allow_reconnect }) => {
            warn!(?error, allow_reconnect, "Hub close record received");
            let reason = error.clone().unwrap_or_else(|| "close record".to_string());
            let event = HubEvent::ServerClosed {
                error,
                allow_reconnect,
            };
            if event_tx.send(event).await.is_err() {
                return Some(ConnectionEnd::ReceiverDropped);
            }
            return Some(ConnectionEnd::Lost(closed(reason)));
        }
        Err(e) => {
            debug!("Failed to parse hub record: {}", e);
            return None;
        }
    };

    if event_tx.send(event).await.is_err() {
        return Some(ConnectionEnd::ReceiverDropped);
    }
    None
}

/// `ReceiveSignal(message)`: the message is an object, or that object as a JSON string.
pub fn decode_signal(arguments: Vec<Value>) -> Result<SignalMessage, DropwatchError> {
    let argument = arguments
        .into_iter()
        .next()
        .ok_or_else(|| DropwatchError::from(ProtocolError::Malformed(
            "ReceiveSignal without arguments".to_string(),
        )))?;

    let signal = match argument {
        Value::String(text) => serde_json::from_str(&text)?,
        other => serde_json::from_value(other)?,
    };
    Ok(signal)
}
