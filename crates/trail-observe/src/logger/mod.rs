mod config;
mod error;
mod format;
mod install;

pub use config::LoggerConfig;
pub use error::LoggerError;
pub use format::LoggerFormat;

/// Install the process-wide `tracing` subscriber described by `cfg`.
///
/// Succeeds at most once per process.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    install::install(cfg)
}
