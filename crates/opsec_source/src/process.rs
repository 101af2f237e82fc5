use std::{io, path::Path, time::Duration};

use tokio::process::{Child, Command};
use tracing::debug;

use crate::OpsecError;

const ETXTBSY: i32 = 26;
const SPAWN_RETRIES: usize = 4;
const SPAWN_RETRY_START: Duration = Duration::from_millis(2);
const SPAWN_RETRY_MAX: Duration = Duration::from_millis(50);

/// Spawns the log grabber, retrying a few times on `ETXTBSY`.
///
/// Deployments that drop a new `fw1-loggrabber` in place right before the source starts can
/// race the writer still holding the file open. Any other spawn error is returned at once.
pub(crate) fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, OpsecError> {
    let mut delay = SPAWN_RETRY_START;
    for _ in 0..SPAWN_RETRIES {
        match command.spawn() {
            Err(err) if is_text_busy(&err) => {
                debug!(?binary, ?delay, "loggrabber binary busy, retrying spawn");
                std::thread::sleep(delay);
                delay = (delay * 2).min(SPAWN_RETRY_MAX);
            }
            result => return result.map_err(|source| spawn_error(binary, source)),
        }
    }
    command.spawn().map_err(|source| spawn_error(binary, source))
}

fn is_text_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ExecutableFileBusy || err.raw_os_error() == Some(ETXTBSY)
}

fn spawn_error(binary: &Path, source: io::Error) -> OpsecError {
    OpsecError::Spawn {
        binary: binary.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_text_busy_is_retried() {
        assert!(is_text_busy(&io::Error::from_raw_os_error(ETXTBSY)));
        assert!(!is_text_busy(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!is_text_busy(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn missing_binary_fails_without_retry() {
        let binary = Path::new("/nonexistent/fw1-loggrabber");
        let err = spawn_with_retry(&mut Command::new(binary), binary).unwrap_err();
        match err {
            OpsecError::Spawn { binary: reported, source } => {
                assert_eq!(reported, binary);
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }
}
