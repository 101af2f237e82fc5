use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::{error, info, trace};

use crate::{
    config::SourceConfig,
    lifecycle::{LifecycleState, LogGrabberProcess, DEFAULT_DRAIN_GRACE},
    metrics::{MetricsEvent, MetricsSink, SourceMetrics},
    queue::{line_queue, LineReceiver, LineSender},
    reader::{ErrorLogSink, TracingErrorLog},
    record, DeliveryError, OpsecError,
};

/// Backoff intervals an exited log grabber gets to close its stdout.
const DRAIN_GRACE_BACKOFFS: u32 = 5;

/// One JSON record ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    body: Vec<u8>,
}

impl Event {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    /// UTF-8 JSON object bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Downstream consumer of records.
pub trait EventSink: Send {
    fn deliver(&mut self, event: Event) -> Result<(), DeliveryError>;
}

impl<F> EventSink for F
where
    F: FnMut(Event) -> Result<(), DeliveryError> + Send,
{
    fn deliver(&mut self, event: Event) -> Result<(), DeliveryError> {
        self(event)
    }
}

/// Outcome of a single [`OpsecSource::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// A record was delivered; more may be waiting.
    Ready,
    /// Nothing to deliver right now.
    Backoff,
}

#[derive(Clone)]
pub struct OpsecSourceBuilder {
    config: SourceConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    error_sink: Option<Arc<dyn ErrorLogSink>>,
}

impl OpsecSourceBuilder {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            metrics: None,
            error_sink: None,
        }
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.config.binary = binary.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.config.backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorLogSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Validates the configuration directory and assembles the source. Nothing is spawned yet.
    pub fn build(self, sink: impl EventSink + 'static) -> Result<OpsecSource, OpsecError> {
        let config_dir = self.config.validate()?;
        let backoff = self.config.backoff();
        let (queue_tx, queue) = line_queue();
        Ok(OpsecSource {
            process: LogGrabberProcess::new(self.config.binary, self.config.args, config_dir)
                .with_drain_grace(
                    backoff
                        .saturating_mul(DRAIN_GRACE_BACKOFFS)
                        .max(DEFAULT_DRAIN_GRACE),
                ),
            queue_tx: Some(queue_tx),
            queue,
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(SourceMetrics::new())),
            error_sink: self.error_sink.unwrap_or_else(|| Arc::new(TracingErrorLog)),
            sink: Box::new(sink),
            backoff,
        })
    }
}

/// Pollable source turning fw1-loggrabber output into JSON [`Event`]s.
///
/// `start` spawns the log grabber, whose stdout lines are buffered in an unbounded queue.
/// Each `process` call delivers at most one of them. Once the queue is empty and the log grabber
/// has died on its own, `process` fails with [`OpsecError::UnexpectedTermination`].
pub struct OpsecSource {
    process: LogGrabberProcess,
    queue_tx: Option<LineSender>,
    queue: LineReceiver,
    metrics: Arc<dyn MetricsSink>,
    error_sink: Arc<dyn ErrorLogSink>,
    sink: Box<dyn EventSink>,
    backoff: Duration,
}

impl OpsecSource {
    pub fn builder(config: SourceConfig) -> OpsecSourceBuilder {
        OpsecSourceBuilder::new(config)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.process.state()
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn log_grabber(&self) -> &LogGrabberProcess {
        &self.process
    }

    /// Spawns the log grabber. Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), OpsecError> {
        let Some(queue_tx) = self.queue_tx.as_ref() else {
            return Err(OpsecError::AlreadyStarted);
        };
        self.process
            .start(queue_tx.clone(), Arc::clone(&self.error_sink))?;
        // Only the stdout reader may hold a sender from now on.
        self.queue_tx = None;
        info!(pid = ?self.process.id(), "opsec source started");
        Ok(())
    }

    /// Kills the log grabber and waits for it to exit.
    pub async fn stop(&mut self) -> Result<(), OpsecError> {
        self.process.stop().await
    }

    /// Delivers the next queued line, or checks the log grabber's health when there is none.
    ///
    /// A blank line is consumed without producing an [`Event`] and reported as
    /// [`PollStatus::Backoff`]. No health check runs on that call.
    pub fn process(&mut self) -> Result<PollStatus, OpsecError> {
        if self.process.state() == LifecycleState::NotStarted {
            return Err(OpsecError::NotStarted);
        }

        if let Some(line) = self.queue.try_pop() {
            return self.deliver(line);
        }

        if let Err(err) = self.process.check_terminated() {
            // Output may have landed between the dequeue and the exit check.
            if let Some(line) = self.queue.try_pop() {
                return self.deliver(line);
            }
            error!("{err}");
            return Err(err);
        }
        Ok(PollStatus::Backoff)
    }

    fn deliver(&mut self, line: String) -> Result<PollStatus, OpsecError> {
        if line.is_empty() {
            trace!("skipping blank loggrabber line");
            return Ok(PollStatus::Backoff);
        }

        let body = match record::encode_record(Some(line.as_str()), &*self.metrics) {
            Ok(body) => body,
            Err(source) => {
                self.metrics.record(MetricsEvent::ParseErrorCount);
                error!(line = %line, "cannot process message: {source}");
                return Err(OpsecError::Serialize { line, source });
            }
        };

        match self.sink.deliver(Event::new(body)) {
            Ok(()) => {
                self.metrics.record(MetricsEvent::SuccessCount);
                Ok(PollStatus::Ready)
            }
            Err(source) => {
                self.metrics.record(MetricsEvent::DeliveryErrorCount);
                error!(line = %line, "cannot deliver message: {source}");
                Err(OpsecError::Delivery { line, source })
            }
        }
    }
}

impl std::fmt::Debug for OpsecSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsecSource")
            .field("process", &self.process)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
