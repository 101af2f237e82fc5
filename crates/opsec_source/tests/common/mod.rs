#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use opsec_source::{
    DeliveryError, ErrorLogSink, Event, OpsecError, OpsecSource, PollStatus, SourceConfig,
    LEA_CONF_FILENAME, LOGGRABBER_CONF_FILENAME,
};
use serde_json::Value;
use tempfile::TempDir;

pub const POLL_DEADLINE: Duration = Duration::from_secs(10);

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Configuration directory holding both required files.
pub fn config_dir() -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join(LEA_CONF_FILENAME), b"lea_server ip 10.0.0.1\n").expect("lea.conf");
    fs::write(dir.path().join(LOGGRABBER_CONF_FILENAME), b"ONLINE_MODE=\"yes\"\n")
        .expect("fw1-loggrabber.conf");
    dir
}

pub fn config(dir: &TempDir) -> SourceConfig {
    SourceConfig::new(dir.path())
}

#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, script).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

#[derive(Clone, Default)]
pub struct Delivered(Arc<Mutex<Vec<Event>>>);

impl Delivered {
    pub fn sink(&self) -> impl FnMut(Event) -> Result<(), DeliveryError> + Send + 'static {
        let events = Arc::clone(&self.0);
        move |event| {
            events.lock().unwrap().push(event);
            Ok(())
        }
    }

    pub fn json(&self) -> Vec<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|event| serde_json::from_slice(event.body()).expect("record is JSON"))
            .collect()
    }
}

#[derive(Default)]
pub struct CollectedStderr(Mutex<Vec<String>>);

impl CollectedStderr {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl ErrorLogSink for CollectedStderr {
    fn log_line(&self, line: &str) {
        self.0.lock().unwrap().push(line.to_string());
    }
}

/// Polls until `process` returns something other than `Backoff`, or the deadline passes.
pub async fn next_outcome(source: &mut OpsecSource) -> Result<PollStatus, OpsecError> {
    let deadline = Instant::now() + POLL_DEADLINE;
    loop {
        match source.process() {
            Ok(PollStatus::Backoff) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            other => return other,
        }
    }
}

pub async fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + POLL_DEADLINE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
