use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error};

use crate::queue::LineSender;

/// Destination for the text fw1-loggrabber writes to its standard error.
pub trait ErrorLogSink: Send + Sync + 'static {
    fn log_line(&self, line: &str);
}

/// Logs each stderr line at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorLog;

impl ErrorLogSink for TracingErrorLog {
    fn log_line(&self, line: &str) {
        error!(target: "opsec_source::stderr", "{line}");
    }
}

/// Reads `reader` line by line until end of stream, decoding lossily and stripping the
/// terminator. Returns the number of lines seen.
async fn for_each_line<R, F>(reader: R, mut on_line: F) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    let mut count = 0;
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer).await? == 0 {
            return Ok(count);
        }
        if buffer.last() == Some(&b'\n') {
            buffer.pop();
            if buffer.last() == Some(&b'\r') {
                buffer.pop();
            }
        }
        count += 1;
        on_line(String::from_utf8_lossy(&buffer).into_owned());
    }
}

/// Pushes every stdout line, blank ones included, onto the queue.
pub(crate) async fn stdout_task<R>(stdout: R, queue: LineSender)
where
    R: AsyncRead + Unpin,
{
    debug!("starting output stream reader");
    let result = for_each_line(stdout, |line| {
        if !queue.push(line) {
            debug!("line queue closed, dropping loggrabber output");
        }
    })
    .await;
    match result {
        Ok(lines) => debug!(lines, "loggrabber stdout reached end of stream"),
        Err(err) => error!("failed reading loggrabber stdout: {err}"),
    }
}

/// Forwards every stderr line to `sink`.
pub(crate) async fn stderr_task<R>(stderr: R, sink: std::sync::Arc<dyn ErrorLogSink>)
where
    R: AsyncRead + Unpin,
{
    debug!("starting error stream reader");
    let result = for_each_line(stderr, |line| sink.log_line(&line)).await;
    match result {
        Ok(lines) => debug!(lines, "loggrabber stderr reached end of stream"),
        Err(err) => error!("failed reading loggrabber stderr: {err}"),
    }
}
