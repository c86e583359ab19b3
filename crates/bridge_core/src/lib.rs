//! Shared infrastructure for the bridge binaries and tests: well-known
//! directories and logging setup.

pub mod logging;
pub mod paths;

pub use logging::{init_logging, init_logging_to_dir, init_test_logging};
