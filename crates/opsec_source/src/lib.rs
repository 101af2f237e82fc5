#![forbid(unsafe_code)]
//! Event source for Check Point firewall logs fetched over OPSEC LEA by `fw1-loggrabber`.
//!
//! The source spawns `fw1-loggrabber`, buffers its stdout lines in an unbounded queue and turns
//! each `key=value|key=value` line into a JSON object, one per [`OpsecSource::process`] call:
//!
//! ```text
//! time=17Apr2015  8:10:16|action=accept|orig=localhost|i/f_dir=inbound
//! {"action":"accept","i/f_dir":"inbound","orig":"localhost","time":"17Apr2015  8:10:16"}
//! ```
//!
//! The configuration directory must hold `lea.conf` and `fw1-loggrabber.conf`. If the log
//! grabber dies, lines it already printed are still delivered before the source reports the
//! failure.

mod config;
mod error;
mod lifecycle;
mod metrics;
mod process;
mod queue;
mod reader;
mod record;
mod source;

pub use config::{
    SourceConfig, ValidatedConfigDir, DEFAULT_BINARY, LEA_CONF_FILENAME, LOGGRABBER_CONFIG_PATH,
    LOGGRABBER_CONF_FILENAME, LOGGRABBER_TEMP_PATH,
};
pub use error::{DeliveryError, OpsecError};
pub use lifecycle::{LifecycleState, LogGrabberProcess, DEFAULT_DRAIN_GRACE};
pub use metrics::{
    Histogram, HistogramSnapshot, Meter, MeterSnapshot, MetricsEvent, MetricsSink,
    MetricsSnapshot, NoopMetrics, SourceMetrics,
};
pub use queue::{line_queue, LineReceiver, LineSender};
pub use reader::{ErrorLogSink, TracingErrorLog};
pub use record::{encode_record, parse_fields, split_entries, split_key_value, FieldMap};
pub use source::{Event, EventSink, OpsecSource, OpsecSourceBuilder, PollStatus};
