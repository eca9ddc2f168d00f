//! chainsink-observability: logging setup shared by chainsink binaries.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, LogConfig};
