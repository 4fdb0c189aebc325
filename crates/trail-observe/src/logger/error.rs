use thiserror::Error;
use tracing_subscriber::{filter::ParseError, util::TryInitError};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log format {0:?} (one of text|json|journald)")]
    InvalidFormat(String),
    #[error("journald output needs Linux and the `journald` feature")]
    JournaldNotSupported,
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
    #[error("invalid log filter {level:?}: {source}")]
    InvalidLogLevel {
        level: String,
        #[source]
        source: ParseError,
    },
    #[error("connecting to journald: {0}")]
    Journald(#[source] std::io::Error),
    #[error("installing tracing subscriber: {0}")]
    InitializationFailed(#[from] TryInitError),
}
