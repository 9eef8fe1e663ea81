//! Bounded newest-first log of analysis signals plus the set of in-flight reversals.
//!
//! A reversal is identified by its `(startPrice, lowestPrice)` pair. While it is
//! active, updates rewrite its log entry in place instead of adding new ones, so
//! duplicate or repeated pushes never grow the log.

use crate::{
    error::DropwatchError,
    signal::{
        resolve_time, PressureSignal, ReversalComplete, ReversalSignal, ReversalUpdate,
        SignalMessage,
    },
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

/// Default number of entries kept in the log.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

/// Identity of an in-flight reversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReversalKey {
    start_price: u64,
    lowest_price: u64,
}

impl ReversalKey {
    pub fn new(start_price: f64, lowest_price: f64) -> Self {
        Self {
            start_price: key_bits(start_price),
            lowest_price: key_bits(lowest_price),
        }
    }

    pub fn start_price(&self) -> f64 {
        f64::from_bits(self.start_price)
    }

    pub fn lowest_price(&self) -> f64 {
        f64::from_bits(self.lowest_price)
    }
}

fn key_bits(value: f64) -> u64 {
    // -0.0 and 0.0 must hash alike
    if value == 0.0 {
        0.0_f64.to_bits()
    } else {
        value.to_bits()
    }
}

impl fmt::Display for ReversalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.start_price(), self.lowest_price())
    }
}

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `dropPercent / consecutiveCandles × 10`, one decimal.
pub fn pressure_intensity(drop_percent: f64, consecutive_candles: u32) -> f64 {
    if consecutive_candles == 0 {
        return 0.0;
    }
    round1(drop_percent / f64::from(consecutive_candles) * 10.0)
}

/// `reversalPercent / candlesSinceReversal`, two decimals.
pub fn recovery_speed(reversal_percent: f64, candles_since_reversal: u32) -> f64 {
    if candles_since_reversal == 0 {
        return 0.0;
    }
    round2(reversal_percent / f64::from(candles_since_reversal))
}

/// Display payload of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LogEntryKind {
    #[serde(rename_all = "camelCase")]
    Pressure {
        price: f64,
        drop_percent: f64,
        consecutive_candles: u32,
        intensity: f64,
    },
    #[serde(rename_all = "camelCase")]
    ReversalStarted {
        start_price: f64,
        lowest_price: f64,
        current_price: f64,
        drop_percent: f64,
        reversal_percent: f64,
    },
    #[serde(rename_all = "camelCase")]
    ReversalProgress {
        start_price: f64,
        lowest_price: f64,
        current_price: f64,
        reversal_percent: f64,
        candles_since_reversal: u32,
        recovery_speed: f64,
    },
    #[serde(rename_all = "camelCase")]
    ReversalCompleted {
        start_price: f64,
        lowest_price: f64,
        final_price: f64,
        reversal_percent: f64,
        candles_since_reversal: u32,
        recovery_speed: f64,
    },
}

/// One line of the signal log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LogEntryKind,
}

impl LogEntry {
    /// Price the chart should pin this entry to.
    pub fn price(&self) -> f64 {
        match &self.kind {
            LogEntryKind::Pressure { price, .. } => *price,
            LogEntryKind::ReversalStarted { lowest_price, .. } => *lowest_price,
            LogEntryKind::ReversalProgress { current_price, .. } => *current_price,
            LogEntryKind::ReversalCompleted { final_price, .. } => *final_price,
        }
    }

    /// Reversal percent carried by the entry, if it is reversal related.
    pub fn reversal_percent(&self) -> Option<f64> {
        match &self.kind {
            LogEntryKind::Pressure { .. } => None,
            LogEntryKind::ReversalStarted { reversal_percent, .. }
            | LogEntryKind::ReversalProgress { reversal_percent, .. }
            | LogEntryKind::ReversalCompleted { reversal_percent, .. } => Some(*reversal_percent),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LogEntryKind::Pressure {
                price,
                drop_percent,
                consecutive_candles,
                intensity,
            } => write!(
                f,
                "Pressure at {price}: -{drop_percent:.2}% over {consecutive_candles} candles (intensity {intensity:.1})"
            ),
            LogEntryKind::ReversalStarted {
                start_price,
                lowest_price,
                drop_percent,
                reversal_percent,
                ..
            } => write!(
                f,
                "Reversal started {start_price}→{lowest_price} after -{drop_percent:.2}% (+{reversal_percent:.2}%)"
            ),
            LogEntryKind::ReversalProgress {
                current_price,
                reversal_percent,
                candles_since_reversal,
                recovery_speed,
                ..
            } => write!(
                f,
                "Reversal at {current_price}: +{reversal_percent:.2}% in {candles_since_reversal} candles ({recovery_speed:.2}%/candle)"
            ),
            LogEntryKind::ReversalCompleted {
                final_price,
                reversal_percent,
                candles_since_reversal,
                ..
            } => write!(
                f,
                "Reversal complete at {final_price}: +{reversal_percent:.2}% in {candles_since_reversal} candles"
            ),
        }
    }
}

/// State of a reversal that has started but not completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveReversal {
    pub key: ReversalKey,
    pub entry_id: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub current_price: f64,
    pub reversal_percent: f64,
    pub candles_since_reversal: u32,
    pub recovery_speed: f64,
}

/// Point annotation for a chart renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartAnnotation {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub label: String,
}

/// Result of [`SignalLog::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new entry was added at the head of the log.
    Prepended { id: u64 },
    /// An active reversal (and its entry, if still logged) was rewritten.
    UpdatedInPlace { id: u64 },
    /// A reversal finished; its terminal summary was prepended.
    Completed { id: u64, was_active: bool },
    /// Not a signal-log message.
    Ignored,
}

/// Bounded newest-first signal log.
#[derive(Debug, Clone)]
pub struct SignalLog {
    entries: VecDeque<LogEntry>,
    active: IndexMap<ReversalKey, ActiveReversal>,
    capacity: usize,
    next_id: u64,
}

impl SignalLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            active: IndexMap::new(),
            capacity,
            next_id: 0,
        }
    }

    /// Route a message into the log.
    ///
    /// `Error` messages are returned as [`DropwatchError::Backend`]; candle
    /// messages are [`IngestOutcome::Ignored`].
    pub fn ingest(&mut self, message: SignalMessage) -> Result<IngestOutcome, DropwatchError> {
        let outcome = match message {
            SignalMessage::Signal(signal) => self.ingest_pressure(signal),
            SignalMessage::ReversalSignal(signal) => self.ingest_reversal_signal(signal),
            SignalMessage::ReversalUpdate(update) => self.ingest_reversal_update(update),
            SignalMessage::ReversalComplete(complete) => self.ingest_reversal_complete(complete),
            SignalMessage::Error(error) => return Err(DropwatchError::Backend(error.message)),
            SignalMessage::Init(_) | SignalMessage::ChartUpdate(_) => IngestOutcome::Ignored,
        };
        Ok(outcome)
    }

    fn ingest_pressure(&mut self, signal: PressureSignal) -> IngestOutcome {
        let kind = LogEntryKind::Pressure {
            price: signal.price,
            drop_percent: signal.drop_percent,
            consecutive_candles: signal.consecutive_candles,
            intensity: pressure_intensity(signal.drop_percent, signal.consecutive_candles),
        };
        let id = self.prepend(resolve_time(signal.time.as_ref()), kind);
        IngestOutcome::Prepended { id }
    }

    fn ingest_reversal_signal(&mut self, signal: ReversalSignal) -> IngestOutcome {
        let key = ReversalKey::new(signal.start_price, signal.lowest_price);
        let time = resolve_time(signal.time.as_ref());
        let kind = LogEntryKind::ReversalStarted {
            start_price: signal.start_price,
            lowest_price: signal.lowest_price,
            current_price: signal.current_price,
            drop_percent: signal.drop_percent,
            reversal_percent: signal.reversal_percent,
        };

        // Replayed start for a reversal we already track
        if let Some(active) = self.active.get_mut(&key) {
            active.current_price = signal.current_price;
            active.reversal_percent = signal.reversal_percent;
            let id = active.entry_id;
            self.rewrite_entry(id, time, kind);
            debug!(%key, "Duplicate ReversalSignal merged into active reversal");
            return IngestOutcome::UpdatedInPlace { id };
        }

        let id = self.prepend(time, kind);
        self.track(ActiveReversal {
            key,
            entry_id: id,
            started_at: time,
            current_price: signal.current_price,
            reversal_percent: signal.reversal_percent,
            candles_since_reversal: 0,
            recovery_speed: 0.0,
        });
        IngestOutcome::Prepended { id }
    }

    fn ingest_reversal_update(&mut self, update: ReversalUpdate) -> IngestOutcome {
        let key = ReversalKey::new(update.start_price, update.lowest_price);
        let time = resolve_time(update.time.as_ref());
        let speed = recovery_speed(update.reversal_percent, update.candles_since_reversal);
        let kind = LogEntryKind::ReversalProgress {
            start_price: update.start_price,
            lowest_price: update.lowest_price,
            current_price: update.current_price,
            reversal_percent: update.reversal_percent,
            candles_since_reversal: update.candles_since_reversal,
            recovery_speed: speed,
        };

        if let Some(active) = self.active.get_mut(&key) {
            active.current_price = update.current_price;
            active.reversal_percent = update.reversal_percent;
            active.candles_since_reversal = update.candles_since_reversal;
            active.recovery_speed = speed;
            let id = active.entry_id;
            self.rewrite_entry(id, time, kind);
            return IngestOutcome::UpdatedInPlace { id };
        }

        // Joined mid-reversal: log it and track it from here on
        let id = self.prepend(time, kind);
        self.track(ActiveReversal {
            key,
            entry_id: id,
            started_at: time,
            current_price: update.current_price,
            reversal_percent: update.reversal_percent,
            candles_since_reversal: update.candles_since_reversal,
            recovery_speed: speed,
        });
        IngestOutcome::Prepended { id }
    }

    fn ingest_reversal_complete(&mut self, complete: ReversalComplete) -> IngestOutcome {
        let key = ReversalKey::new(complete.start_price, complete.lowest_price);
        let was_active = self.active.shift_remove(&key).is_some();
        let kind = LogEntryKind::ReversalCompleted {
            start_price: complete.start_price,
            lowest_price: complete.lowest_price,
            final_price: complete.final_price,
            reversal_percent: complete.reversal_percent,
            candles_since_reversal: complete.candles_since_reversal,
            recovery_speed: recovery_speed(
                complete.reversal_percent,
                complete.candles_since_reversal,
            ),
        };
        let id = self.prepend(resolve_time(complete.time.as_ref()), kind);
        IngestOutcome::Completed { id, was_active }
    }

    /// Start tracking a reversal. The active set holds at most `capacity`
    /// reversals; the longest-tracked one is forgotten first.
    fn track(&mut self, reversal: ActiveReversal) {
        self.active.insert(reversal.key, reversal);
        while self.active.len() > self.capacity {
            if let Some((key, _)) = self.active.shift_remove_index(0) {
                debug!(%key, "Active reversal limit reached, forgetting oldest");
            }
        }
    }

    fn prepend(&mut self, time: Option<DateTime<Utc>>, kind: LogEntryKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_front(LogEntry {
            id,
            time,
            received_at: Utc::now(),
            kind,
        });
        self.entries.truncate(self.capacity);
        id
    }

    /// Rewrite a logged entry in place. The entry may already have been evicted.
    fn rewrite_entry(&mut self, id: u64, time: Option<DateTime<Utc>>, kind: LogEntryKind) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.kind = kind;
            if time.is_some() {
                entry.time = time;
            }
            entry.received_at = Utc::now();
        }
    }

    /// Entries, newest first.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: u64) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Active reversals in the order they started.
    pub fn active_reversals(&self) -> impl Iterator<Item = &ActiveReversal> {
        self.active.values()
    }

    pub fn active(&self, key: &ReversalKey) -> Option<&ActiveReversal> {
        self.active.get(key)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chart annotations for every timed entry, oldest first.
    pub fn annotations(&self) -> Vec<ChartAnnotation> {
        self.entries
            .iter()
            .rev()
            .filter_map(|entry| {
                let label = match entry.reversal_percent() {
                    Some(percent) => format!("Signal: {percent:.2}%"),
                    None => "Signal: N/A".to_string(),
                };
                entry.time.map(|time| ChartAnnotation {
                    time,
                    price: entry.price(),
                    label,
                })
            })
            .collect()
    }

    /// Forget in-flight reversals but keep the log, e.g. when live analysis ends.
    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    /// Forget everything, e.g. when the symbol or timeframe changes.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.active.clear();
    }
}

impl Default for SignalLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
