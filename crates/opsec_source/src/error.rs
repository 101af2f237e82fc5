use std::{path::PathBuf, process::ExitStatus};

use thiserror::Error;

/// Errors raised while configuring, running or polling the log grabber source.
#[derive(Debug, Error)]
pub enum OpsecError {
    #[error("loggrabber.config.path property cannot be empty")]
    EmptyConfigPath,
    #[error("directory `{path}` must exist")]
    MissingConfigDir { path: PathBuf },
    #[error("file `{path}` must exist")]
    MissingConfigFile { path: PathBuf },
    #[error("failed to read source configuration `{path}`: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse source configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("failed to create loggrabber temporary directory: {0}")]
    TempDir(#[source] std::io::Error),
    #[error("cannot start embedded `{binary}`: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: loggrabber stdout unavailable")]
    StdoutUnavailable,
    #[error("internal error: loggrabber stderr unavailable")]
    StderrUnavailable,
    #[error("failed to query loggrabber process status: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal loggrabber process: {source}")]
    Kill {
        #[source]
        source: std::io::Error,
    },
    #[error("source has not been started")]
    NotStarted,
    #[error("source has already been started")]
    AlreadyStarted,
    #[error("`{binary}` has terminated with exit status: {status}")]
    UnexpectedTermination { binary: PathBuf, status: ExitStatus },
    #[error("cannot process message `{line}`: {source}")]
    Serialize {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot deliver message `{line}`: {source}")]
    Delivery {
        line: String,
        #[source]
        source: DeliveryError,
    },
}

impl OpsecError {
    /// Whether the fault must stop the whole source.
    ///
    /// Record-level faults (`Serialize`, `Delivery`) only affect the line that triggered them;
    /// everything else means the source cannot keep running.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Serialize { .. } | Self::Delivery { .. })
    }
}

/// Failure reported by a [`crate::EventSink`] when it rejects a record.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeliveryError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
