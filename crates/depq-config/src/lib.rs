//! KDL configuration parsing for depq.
//!
//! This crate handles parsing of:
//! - Queue settings (group, lease timeout, polling, worker count)
//! - Database connection settings
//! - Human-readable durations ("500ms", "5m")

pub mod duration;
pub mod error;
pub mod system;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{DatabaseConfig, QueueConfig, SystemConfig, load_config, parse_system_config};
