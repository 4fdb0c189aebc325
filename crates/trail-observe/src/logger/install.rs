use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    EnvFilter, fmt, fmt::time::OffsetTime, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::logger::{config::LoggerConfig, error::LoggerError, format::LoggerFormat};

/// Build the subscriber for `cfg` and install it as the global default.
///
/// Configuration problems are reported before checking whether a subscriber
/// already exists, so they surface even in a process that already logs.
pub(crate) fn install(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = filter(cfg)?;
    let journald = journald(cfg.format)?;

    if tracing::dispatcher::has_been_set() {
        return Err(LoggerError::AlreadyInitialized);
    }

    let text = (cfg.format == LoggerFormat::Text).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(cfg.use_color)
            .with_target(cfg.with_targets)
            .with_timer(local_rfc3339())
    });
    let json = (cfg.format == LoggerFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(cfg.with_targets)
            .with_timer(local_rfc3339())
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(journald)
        .try_init()?;
    Ok(())
}

fn filter(cfg: &LoggerConfig) -> Result<EnvFilter, LoggerError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&cfg.level).map_err(|source| LoggerError::InvalidLogLevel {
        level: cfg.level.clone(),
        source,
    })
}

fn local_rfc3339() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn journald(format: LoggerFormat) -> Result<Option<tracing_journald::Layer>, LoggerError> {
    if format != LoggerFormat::Journald {
        return Ok(None);
    }
    tracing_journald::layer()
        .map(Some)
        .map_err(LoggerError::Journald)
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn journald(
    format: LoggerFormat,
) -> Result<Option<tracing_subscriber::layer::Identity>, LoggerError> {
    match format {
        LoggerFormat::Journald => Err(LoggerError::JournaldNotSupported),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(format: LoggerFormat, level: &str) -> LoggerConfig {
        LoggerConfig {
            format,
            level: level.to_string(),
            ..LoggerConfig::default()
        }
    }

    #[test]
    fn bad_filter_is_reported() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = install(&cfg(LoggerFormat::Text, "trail=notalevel")).unwrap_err();
        assert!(
            matches!(err, LoggerError::InvalidLogLevel { ref level, .. } if level == "trail=notalevel")
        );
    }

    #[cfg(not(all(target_os = "linux", feature = "journald")))]
    #[test]
    fn journald_without_support_is_reported() {
        let err = install(&cfg(LoggerFormat::Journald, "info")).unwrap_err();
        assert!(matches!(err, LoggerError::JournaldNotSupported));
    }

    #[test]
    fn only_one_subscriber_per_process() {
        let _ = install(&cfg(LoggerFormat::Json, "info"));
        let err = install(&cfg(LoggerFormat::Text, "info")).unwrap_err();
        assert!(matches!(err, LoggerError::AlreadyInitialized));
    }
}
