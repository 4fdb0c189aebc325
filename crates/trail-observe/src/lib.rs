//! Logging bootstrap shared by trail binaries.
//!
//! Everything in the agent logs through `tracing`; this crate only decides
//! where those events go and how they are rendered.
mod logger;
pub use logger::*;
