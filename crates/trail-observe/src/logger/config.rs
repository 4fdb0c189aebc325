use std::io::IsTerminal;

use serde::Deserialize;

use crate::logger::format::LoggerFormat;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directives, e.g. `info,trail_positions=debug`.
    /// `RUST_LOG`, when set, replaces this.
    pub level: String,
    /// Print the event target (module path) in text and json output.
    pub with_targets: bool,
    /// ANSI colours in text output.
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: false,
            use_color: std::io::stderr().is_terminal(),
        }
    }
}
