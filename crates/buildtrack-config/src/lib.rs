//! KDL configuration parsing for BuildTrack.
//!
//! This crate handles parsing of the tracker process configuration
//! (buildtrack.kdl).

pub mod error;
pub mod tracker;

pub use error::{ConfigError, ConfigResult};
pub use tracker::{
    DatabaseConfig, ExecutorConfig, LogFormat, LoggingConfig, RunnerConfig, TrackerConfig,
    load_tracker_config, parse_tracker_config,
};
