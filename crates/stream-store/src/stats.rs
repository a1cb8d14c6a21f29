//! Stats and metrics aggregation.
//!
//! Nothing here is stored independently of the stream state: every report is
//! derived on demand from FIFO depth, the inflight set and the rolling
//! counters below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use wire_protocol_types::Envelope;

/// Event counts inside a trailing window, bucketed by time.
///
/// Memory is bounded by the number of buckets in the window rather than the
/// event rate. Buckets are one second wide (narrower for sub-second windows),
/// so counts are accurate to one bucket.
#[derive(Debug)]
pub(crate) struct RateWindow {
    window: Duration,
    width: Duration,
    base: Option<Instant>,
    /// (bucket index since `base`, events in that bucket), oldest first.
    buckets: VecDeque<(u64, u64)>,
}

impl RateWindow {
    pub(crate) fn new(window: Duration) -> Self {
        let width = window
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(1));
        Self {
            window,
            width,
            base: None,
            buckets: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, now: Instant) {
        let base = *self.base.get_or_insert(now);
        self.trim(now);

        let index = self.bucket_of(now.saturating_duration_since(base));
        match self.buckets.back_mut() {
            Some((last, count)) if *last == index => *count += 1,
            _ => self.buckets.push_back((index, 1)),
        }
    }

    /// Events observed within the window ending at `now`.
    pub(crate) fn count(&mut self, now: Instant) -> u64 {
        self.trim(now);
        self.buckets.iter().map(|(_, count)| count).sum()
    }

    fn bucket_of(&self, elapsed: Duration) -> u64 {
        (elapsed.as_nanos() / self.width.as_nanos()) as u64
    }

    fn trim(&mut self, now: Instant) {
        let Some(base) = self.base else {
            return;
        };
        let Some(cutoff) = now.saturating_duration_since(base).checked_sub(self.window) else {
            return;
        };
        let cutoff = cutoff.as_nanos();
        let width = self.width.as_nanos();
        while self
            .buckets
            .front()
            .is_some_and(|(index, _)| u128::from(*index) * width <= cutoff)
        {
            self.buckets.pop_front();
        }
    }
}

/// Bounded rolling sample of delivery latencies.
#[derive(Debug)]
pub(crate) struct LatencySampler {
    capacity: usize,
    samples: VecDeque<Duration>,
}

impl LatencySampler {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    /// Nearest-rank percentile in milliseconds.
    pub(crate) fn percentile_ms(&self, pct: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = rank.clamp(1, sorted.len()) - 1;
        Some(sorted[index].as_micros() as f64 / 1000.0)
    }
}

/// Derived per-stream statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    /// Envelopes waiting in the pending FIFO.
    pub depth: usize,
    /// Envelopes delivered and not yet settled.
    pub inflight: usize,
    /// Enqueues within the observation window.
    pub rate_in: u64,
    /// Deliveries within the observation window.
    pub rate_out: u64,
    /// Median delivery latency (ms).
    pub lat_p50: Option<f64>,
    /// 95th percentile delivery latency (ms).
    pub lat_p95: Option<f64>,
    /// Most recent enqueue or delivery.
    pub last_ts: Option<DateTime<Utc>>,
    /// Envelopes dropped after exhausting redeliveries.
    pub dead_lettered: u64,
    /// Sessions currently subscribed.
    pub consumers: usize,
}

/// One stream entry in a metrics report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub id: String,
    pub stats: StreamStats,
}

/// Sums across every stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub streams: usize,
    pub depth: usize,
    pub inflight: usize,
    pub rate_in: u64,
    pub rate_out: u64,
}

/// Aggregate stats across all streams, sorted by stream name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub streams: Vec<StreamMetrics>,
    pub totals: Totals,
}

impl MetricsReport {
    pub(crate) fn from_streams(streams: Vec<StreamMetrics>) -> Self {
        let totals = streams.iter().fold(
            Totals {
                streams: streams.len(),
                ..Default::default()
            },
            |mut acc, entry| {
                acc.depth += entry.stats.depth;
                acc.inflight += entry.stats.inflight;
                acc.rate_in += entry.stats.rate_in;
                acc.rate_out += entry.stats.rate_out;
                acc
            },
        );
        Self { streams, totals }
    }
}

/// Debug dump of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub stream: String,
    pub depth: usize,
    pub inflight: usize,
    /// Pending envelopes, head first.
    pub pending: Vec<Envelope>,
    /// IDs of inflight envelopes, in delivery order.
    pub inflight_ids: Vec<String>,
}
