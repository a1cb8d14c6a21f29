//! Broker policy knobs for the stream store.

use std::time::Duration;

/// Default observation window for `rateIn`/`rateOut`.
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(60);

/// Default number of latency samples kept per stream.
pub const DEFAULT_LATENCY_SAMPLES: usize = 1024;

const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Delivery, redelivery and backpressure policy.
///
/// Every hardening knob is optional and off by default, which yields the
/// minimal protocol: unbounded FIFOs, immediate head-of-queue redelivery and
/// no retry ceiling.
///
/// # Backoff Calculation
///
/// When `redelivery_backoff` is set, a requeued envelope becomes eligible
/// again after `base * 2^(attempt - 1)`, capped at `redelivery_backoff_max`.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// Reject enqueues once a stream holds this many pending envelopes.
    pub max_stream_depth: Option<usize>,
    /// Requeue inflight envelopes that stay unacknowledged this long.
    pub ack_timeout: Option<Duration>,
    /// Dead-letter an envelope after this many requeues.
    pub max_redeliveries: Option<u32>,
    /// Base delay before a requeued envelope may be redelivered.
    pub redelivery_backoff: Option<Duration>,
    /// Cap on the exponential redelivery delay.
    pub redelivery_backoff_max: Duration,
    /// Window over which `rateIn`/`rateOut` are counted.
    pub stats_window: Duration,
    /// Rolling sample size for latency percentiles.
    pub latency_samples: usize,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            max_stream_depth: None,
            ack_timeout: None,
            max_redeliveries: None,
            redelivery_backoff: None,
            redelivery_backoff_max: DEFAULT_BACKOFF_MAX,
            stats_window: DEFAULT_STATS_WINDOW,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
        }
    }
}

impl StorePolicy {
    /// Delay before an envelope requeued for the `attempt`-th time may go out again.
    pub fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        let base = self.redelivery_backoff?;
        if attempt == 0 {
            return None;
        }

        let exponent = (attempt - 1).min(31);
        let delay = base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.redelivery_backoff_max);
        Some(delay.min(self.redelivery_backoff_max))
    }

    /// Whether an envelope requeued `attempt` times has exhausted its retries.
    pub fn exceeds_redeliveries(&self, attempt: u32) -> bool {
        self.max_redeliveries.is_some_and(|max| attempt > max)
    }
}
