//! Crash-safe record of how far each source has been read.
//!
//! Offsets are keyed by a source path (or a synthetic [`cursor_key`]) plus a
//! rendered label set, kept in memory, and periodically written to a YAML
//! file with an atomic replace:
//!
//! ```yaml
//! positions:
//!   ? path: /var/log/syslog
//!     labels: '{job="syslog"}'
//!   : "4096"
//! ```
//!
//! Files written by older agents, which keyed offsets by path alone, are
//! still read and upgraded to the labelled form in memory.
mod config;
pub use config::PositionsConfig;

mod entry;
pub use entry::{Entry, cursor_key};

mod error;
pub use error::PositionsError;

mod file;

mod legacy;
pub use legacy::migrate_legacy_file;

mod store;
pub use store::{Checkpoints, Positions};
