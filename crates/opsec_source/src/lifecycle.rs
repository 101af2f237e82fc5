//! Ownership of the fw1-loggrabber child process.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use tempfile::TempDir;
use tokio::{
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::{ValidatedConfigDir, LOGGRABBER_CONFIG_PATH, LOGGRABBER_TEMP_PATH},
    process,
    queue::LineSender,
    reader::{self, ErrorLogSink},
    OpsecError,
};

/// How long an exit may go unreported while stdout is still open.
///
/// A descendant that inherited the pipe can keep it open after the log grabber itself is gone.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopped,
}

/// Starts, watches and stops a single log grabber process.
///
/// The process is spawned at most once. Its stdout feeds a [`LineSender`] and its stderr an
/// [`ErrorLogSink`], each from its own task.
pub struct LogGrabberProcess {
    binary: PathBuf,
    args: Vec<String>,
    config_dir: ValidatedConfigDir,
    state: LifecycleState,
    child: Option<Child>,
    temp_dir: Option<TempDir>,
    readers: Vec<JoinHandle<()>>,
    drain_grace: Duration,
    exited_at: Option<Instant>,
}

impl LogGrabberProcess {
    pub fn new(
        binary: impl Into<PathBuf>,
        args: Vec<String>,
        config_dir: ValidatedConfigDir,
    ) -> Self {
        Self {
            binary: binary.into(),
            args,
            config_dir,
            state: LifecycleState::NotStarted,
            child: None,
            temp_dir: None,
            readers: Vec::new(),
            drain_grace: DEFAULT_DRAIN_GRACE,
            exited_at: None,
        }
    }

    /// Bounds how long [`check_terminated`](Self::check_terminated) waits for stdout to close
    /// once the child has exited.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Private working directory handed to the child, present while it runs.
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// OS process id of the running child.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Launches the child and its two stream readers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &mut self,
        queue: LineSender,
        error_sink: Arc<dyn ErrorLogSink>,
    ) -> Result<(), OpsecError> {
        if self.state != LifecycleState::NotStarted {
            return Err(OpsecError::AlreadyStarted);
        }

        let temp_dir = tempfile::Builder::new()
            .prefix("loggrabber-")
            .tempdir()
            .map_err(OpsecError::TempDir)?;
        debug!(path = ?temp_dir.path(), "using loggrabber temp directory");

        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .env(LOGGRABBER_TEMP_PATH, temp_dir.path())
            .env(LOGGRABBER_CONFIG_PATH, self.config_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(binary = ?self.binary, args = ?self.args, "executing loggrabber binary");
        let mut child = process::spawn_with_retry(&mut command, &self.binary)?;

        let stdout = child.stdout.take().ok_or(OpsecError::StdoutUnavailable)?;
        let stderr = child.stderr.take().ok_or(OpsecError::StderrUnavailable)?;

        self.readers = vec![
            tokio::spawn(reader::stdout_task(stdout, queue)),
            tokio::spawn(reader::stderr_task(stderr, error_sink)),
        ];
        self.child = Some(child);
        self.temp_dir = Some(temp_dir);
        self.state = LifecycleState::Running;
        Ok(())
    }

    /// Non-blocking liveness check.
    ///
    /// Fails with [`OpsecError::UnexpectedTermination`] when the child exited without
    /// [`stop`](Self::stop) being called. The failure is only reported once its stdout has been
    /// read to the end, so every line it printed is already queued, or once the drain grace has
    /// passed since the exit was first seen.
    pub fn check_terminated(&mut self) -> Result<(), OpsecError> {
        match self.state {
            LifecycleState::NotStarted => Err(OpsecError::NotStarted),
            LifecycleState::Stopped => Ok(()),
            LifecycleState::Running => {
                let Some(child) = self.child.as_mut() else {
                    return Ok(());
                };
                let Some(status) = child
                    .try_wait()
                    .map_err(|source| OpsecError::Wait { source })?
                else {
                    trace!(binary = ?self.binary, "loggrabber not yet terminated");
                    return Ok(());
                };
                let exited_at = *self.exited_at.get_or_insert_with(Instant::now);
                let stdout_drained = self.readers.first().map_or(true, JoinHandle::is_finished);
                if !stdout_drained {
                    if exited_at.elapsed() < self.drain_grace {
                        trace!(%status, "loggrabber exited, stdout still draining");
                        return Ok(());
                    }
                    debug!(%status, "loggrabber exited but its stdout is still open");
                }
                Err(OpsecError::UnexpectedTermination {
                    binary: self.binary.clone(),
                    status,
                })
            }
        }
    }

    /// Kills the child if it is still running and waits for it to exit.
    ///
    /// Idempotent, and a no-op when the child was never started.
    pub async fn stop(&mut self) -> Result<(), OpsecError> {
        if self.state != LifecycleState::Running {
            return Ok(());
        }
        self.state = LifecycleState::Stopped;

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let running = child
            .try_wait()
            .map_err(|source| OpsecError::Wait { source })?
            .is_none();
        if running {
            if let Err(source) = child.start_kill() {
                // Lost the race against a natural exit.
                if source.kind() != std::io::ErrorKind::InvalidInput {
                    return Err(OpsecError::Kill { source });
                }
            }
        }
        let status = child
            .wait()
            .await
            .map_err(|source| OpsecError::Wait { source })?;
        info!(binary = ?self.binary, %status, "loggrabber stopped");

        if let Some(temp_dir) = self.temp_dir.take() {
            if let Err(err) = temp_dir.close() {
                warn!("failed to remove loggrabber temp directory: {err}");
            }
        }
        Ok(())
    }
}

impl Drop for LogGrabberProcess {
    fn drop(&mut self) {
        for handle in &self.readers {
            handle.abort();
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

impl std::fmt::Debug for LogGrabberProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGrabberProcess")
            .field("binary", &self.binary)
            .field("args", &self.args)
            .field("config_dir", &self.config_dir)
            .field("state", &self.state)
            .field("drain_grace", &self.drain_grace)
            .field("pid", &self.id())
            .finish()
    }
}
