//! Bounded, time-ordered candle buffer.
//!
//! Candles are keyed by `time`: a candle for an existing bucket is merged into
//! it, anything else is inserted in ascending order. Once the buffer is over
//! capacity the oldest candles are evicted first.

use crate::candle::Candle;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Default number of candles kept per symbol/timeframe.
pub const DEFAULT_CANDLE_CAPACITY: usize = 1000;

/// What a reconciliation did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub merged: usize,
    pub inserted: usize,
    pub evicted: usize,
}

impl ReconcileSummary {
    /// True if the store content changed.
    pub fn changed(&self) -> bool {
        self.merged + self.inserted > 0
    }
}

/// Ordered, deduplicated, bounded sequence of candles.
#[derive(Debug, Clone)]
pub struct CandleStore {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Merge a batch of candles into the store.
    ///
    /// The batch may be unordered relative to itself or to the stored tail.
    pub fn reconcile<I>(&mut self, candles: I) -> ReconcileSummary
    where
        I: IntoIterator<Item = Candle>,
    {
        let mut summary = ReconcileSummary::default();
        for candle in candles {
            if self.upsert(candle) {
                summary.merged += 1;
            } else {
                summary.inserted += 1;
            }
        }
        summary.evicted = self.enforce_capacity();
        summary
    }

    /// Replace the whole content with a snapshot.
    pub fn replace<I>(&mut self, candles: I) -> ReconcileSummary
    where
        I: IntoIterator<Item = Candle>,
    {
        self.candles.clear();
        self.reconcile(candles)
    }

    /// Streaming-tick variant: merge into the last candle when the bucket matches.
    pub fn append_or_merge_latest(&mut self, candle: Candle) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        match self.candles.back().map(|last| last.time) {
            Some(last_time) if last_time == candle.time => {
                if let Some(last) = self.candles.back_mut() {
                    last.merge(&candle);
                }
                summary.merged = 1;
            }
            Some(last_time) if last_time > candle.time => {
                // Late tick for an older bucket
                if self.upsert(candle) {
                    summary.merged = 1;
                } else {
                    summary.inserted = 1;
                }
            }
            _ => {
                self.candles.push_back(candle);
                summary.inserted = 1;
            }
        }
        summary.evicted = self.enforce_capacity();
        summary
    }

    /// Returns true when the candle was merged into an existing bucket.
    fn upsert(&mut self, candle: Candle) -> bool {
        match self.candles.binary_search_by(|c| c.time.cmp(&candle.time)) {
            Ok(index) => {
                self.candles[index].merge(&candle);
                true
            }
            Err(index) => {
                self.candles.insert(index, candle);
                false
            }
        }
    }

    fn enforce_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn contains_time(&self, time: &DateTime<Utc>) -> bool {
        self.candles
            .binary_search_by(|c| c.time.cmp(time))
            .is_ok()
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new(DEFAULT_CANDLE_CAPACITY)
    }
}
