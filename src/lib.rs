//! FTP/SFTP file-arrival event source
//!
//! Periodically lists a remote directory, works out which files are new
//! since the last persisted watermark and publishes one event per new file.

pub mod cli;
pub mod config;
pub mod engine;
pub mod logging;
pub mod protocols;
pub mod publisher;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

pub use cli::parse_args;
pub use config::{parse_config, Config};
pub use engine::{BoundaryTracking, WatermarkEngine};
pub use logging::{log, log_with_cycle, set_log_file};
pub use scheduler::{PollScheduler, PollSettings};
pub use shutdown::{install_signal_handler, ShutdownSignal};
pub use state::StateRecord;
pub use store::{FileRecordBackend, StateStore};

/// Name of the program used in usage and version output
pub const PROGRAM_NAME: &str = "ftpsource";

/// Current version of the program (from Cargo.toml)
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
