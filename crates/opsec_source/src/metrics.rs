//! Throughput and latency accounting for the source.
//!
//! The poll loop and the record parser report [`MetricsEvent`]s to a [`MetricsSink`]. The bundled
//! [`SourceMetrics`] keeps one meter per outcome (count plus mean, 1-minute and 15-minute rates)
//! and a histogram of parse durations. Exporting a [`MetricsSnapshot`] is left to the caller.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tdigests::TDigest;
use tracing::warn;

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const PENDING_SAMPLES: usize = 128;

/// A countable occurrence reported by the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricsEvent {
    /// A record reached the delivery sink.
    SuccessCount,
    /// A line could not be turned into a JSON record.
    ParseErrorCount,
    /// The delivery sink rejected a record.
    DeliveryErrorCount,
    /// Wall-clock time spent parsing one line.
    ProcessingDuration(Duration),
}

/// Receiver of [`MetricsEvent`]s. Implementations must tolerate concurrent callers.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, event: MetricsEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricsEvent) {}
}

fn lock_recovering<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("recovering poisoned {what} lock");
            poisoned.into_inner()
        }
    }
}

/// Exponentially-weighted moving average sampled every [`TICK_INTERVAL`].
#[derive(Debug, Clone)]
struct Ewma {
    alpha: f64,
    rate: f64,
    uncounted: u64,
    initialized: bool,
}

impl Ewma {
    fn over_minutes(minutes: f64) -> Self {
        let alpha = 1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0 / minutes).exp();
        Self {
            alpha,
            rate: 0.0,
            uncounted: 0,
            initialized: false,
        }
    }

    fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_INTERVAL.as_secs_f64();
        self.uncounted = 0;
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }
}

#[derive(Debug)]
struct MeterRates {
    one_minute: Ewma,
    fifteen_minutes: Ewma,
    last_tick: Instant,
}

/// Event counter with mean and exponentially-weighted rates, in events per second.
#[derive(Debug)]
pub struct Meter {
    count: AtomicU64,
    started: Instant,
    rates: Mutex<MeterRates>,
}

impl Meter {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    fn started_at(started: Instant) -> Self {
        Self {
            count: AtomicU64::new(0),
            started,
            rates: Mutex::new(MeterRates {
                one_minute: Ewma::over_minutes(1.0),
                fifteen_minutes: Ewma::over_minutes(15.0),
                last_tick: started,
            }),
        }
    }

    pub fn mark(&self) {
        self.mark_at(Instant::now());
    }

    fn mark_at(&self, now: Instant) {
        let mut rates = self.ticked(now);
        self.count.fetch_add(1, Ordering::Relaxed);
        rates.one_minute.uncounted += 1;
        rates.fifteen_minutes.uncounted += 1;
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn ticked(&self, now: Instant) -> MutexGuard<'_, MeterRates> {
        let mut rates = lock_recovering(&self.rates, "meter");
        while now.saturating_duration_since(rates.last_tick) >= TICK_INTERVAL {
            rates.one_minute.tick();
            rates.fifteen_minutes.tick();
            rates.last_tick += TICK_INTERVAL;
        }
        rates
    }

    fn snapshot_at(&self, now: Instant) -> MeterSnapshot {
        let rates = self.ticked(now);
        let count = self.count();
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let mean_rate = if count == 0 || elapsed <= 0.0 {
            0.0
        } else {
            count as f64 / elapsed
        };
        MeterSnapshot {
            count,
            mean_rate,
            one_minute_rate: rates.one_minute.rate,
            fifteen_minute_rate: rates.fifteen_minutes.rate,
        }
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct HistogramState {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
    pending: Vec<f64>,
    digest: Option<TDigest>,
}

impl HistogramState {
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = TDigest::from_values(std::mem::take(&mut self.pending));
        self.digest = Some(match self.digest.take() {
            Some(existing) => existing.merge(&batch),
            None => batch,
        });
    }
}

/// Distribution of samples: exact min/max/mean/stddev, t-digest estimated percentiles.
pub struct Histogram {
    state: Mutex<HistogramState>,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HistogramState::default()),
        }
    }

    pub fn update(&self, value: f64) {
        let mut state = lock_recovering(&self.state, "histogram");
        state.count += 1;
        if state.count == 1 {
            state.min = value;
            state.max = value;
        } else {
            state.min = state.min.min(value);
            state.max = state.max.max(value);
        }
        let delta = value - state.mean;
        state.mean += delta / state.count as f64;
        state.m2 += delta * (value - state.mean);

        state.pending.push(value);
        if state.pending.len() >= PENDING_SAMPLES {
            state.flush();
        }
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut state = lock_recovering(&self.state, "histogram");
        if state.count == 0 {
            return HistogramSnapshot::default();
        }
        state.flush();
        let (p95, p99) = state
            .digest
            .as_ref()
            .map(|digest| (digest.estimate_quantile(0.95), digest.estimate_quantile(0.99)))
            .unwrap_or_default();
        let std_dev = if state.count > 1 {
            (state.m2 / (state.count - 1) as f64).sqrt()
        } else {
            0.0
        };
        HistogramSnapshot {
            count: state.count,
            min: state.min,
            max: state.max,
            mean: state.mean,
            std_dev,
            p95,
            p99,
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Histogram")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeterSnapshot {
    pub count: u64,
    pub mean_rate: f64,
    pub one_minute_rate: f64,
    pub fifteen_minute_rate: f64,
}

/// Durations are in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub delivery_ok: MeterSnapshot,
    pub process_error: MeterSnapshot,
    pub delivery_error: MeterSnapshot,
    pub process_time: HistogramSnapshot,
}

/// The metrics kept for one running source.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    delivery_ok: Meter,
    process_error: Meter,
    delivery_error: Meter,
    process_time: Histogram,
}

impl SourceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivery_ok(&self) -> u64 {
        self.delivery_ok.count()
    }

    pub fn process_error(&self) -> u64 {
        self.process_error.count()
    }

    pub fn delivery_error(&self) -> u64 {
        self.delivery_error.count()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        MetricsSnapshot {
            delivery_ok: self.delivery_ok.snapshot_at(now),
            process_error: self.process_error.snapshot_at(now),
            delivery_error: self.delivery_error.snapshot_at(now),
            process_time: self.process_time.snapshot(),
        }
    }
}

impl MetricsSink for SourceMetrics {
    fn record(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::SuccessCount => self.delivery_ok.mark(),
            MetricsEvent::ParseErrorCount => self.process_error.mark(),
            MetricsEvent::DeliveryErrorCount => self.delivery_error.mark(),
            MetricsEvent::ProcessingDuration(elapsed) => {
                self.process_time.update(elapsed.as_secs_f64() * 1000.0)
            }
        }
    }
}
