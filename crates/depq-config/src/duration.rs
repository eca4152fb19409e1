//! Duration strings such as `"250ms"`, `"30s"`, `"5m"` or `"1h 30m"`.

use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Parse a human-readable duration.
///
/// `field` names the setting in the returned error.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::invalid(field, format!("'{value}': {e}")))
}
