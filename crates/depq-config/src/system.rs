//! System configuration parsing (`depq.kdl`).

use crate::{ConfigError, ConfigResult, parse_duration};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
}

/// Settings shared by every worker of one logical queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue group served by this process.
    pub group: String,
    /// Lease length after which an unrefreshed claim may be stolen.
    pub lock_timeout: Duration,
    /// Idle delay between dispatch attempts.
    pub poll_interval: Duration,
    pub workers: usize,
    /// Upper bound on candidates fetched per dispatch attempt.
    pub candidate_limit: usize,
    /// Apply wait-until / dispatch-by windows in the candidate query.
    pub timing_aware: bool,
    /// Executions allowed before a failing job is completed anyway.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            lock_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            workers: 2,
            candidate_limit: 32,
            timing_aware: true,
            max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut seen_queue = false;
    let mut seen_database = false;

    for node in doc.nodes() {
        match node.name().value() {
            "queue" => {
                if std::mem::replace(&mut seen_queue, true) {
                    return Err(ConfigError::Duplicate("queue".to_string()));
                }
                config.queue = parse_queue(node)?;
            }
            "database" => {
                if std::mem::replace(&mut seen_database, true) {
                    return Err(ConfigError::Duplicate("database".to_string()));
                }
                config.database = parse_database(node)?;
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueConfig> {
    let mut queue = QueueConfig::default();
    let Some(children) = node.children() else {
        return Ok(queue);
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "group" => queue.group = string_arg(child, field)?,
            "lock-timeout" => queue.lock_timeout = duration_arg(child, field)?,
            "poll-interval" => queue.poll_interval = duration_arg(child, field)?,
            "workers" => queue.workers = positive_arg(child, field)?,
            "candidate-limit" => queue.candidate_limit = positive_arg(child, field)?,
            "timing-aware" => queue.timing_aware = bool_arg(child, field)?,
            "max-attempts" => queue.max_attempts = positive_arg(child, field)?,
            _ => {}
        }
    }

    if queue.lock_timeout.is_zero() {
        return Err(ConfigError::invalid("lock-timeout", "must be greater than zero"));
    }
    Ok(queue)
}

fn parse_database(node: &KdlNode) -> ConfigResult<DatabaseConfig> {
    let mut database = DatabaseConfig::default();
    let Some(children) = node.children() else {
        return Ok(database);
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "url" => database.url = Some(string_arg(child, field)?),
            "max-connections" => database.max_connections = positive_arg(child, field)?,
            _ => {}
        }
    }
    Ok(database)
}

fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn first_arg<'a>(node: &'a KdlNode, field: &str) -> ConfigResult<&'a KdlValue> {
    get_first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    first_arg(node, field)?
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::invalid(field, "expected a string"))
}

fn bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    first_arg(node, field)?
        .as_bool()
        .ok_or_else(|| ConfigError::invalid(field, "expected #true or #false"))
}

fn duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    parse_duration(field, &string_arg(node, field)?)
}

fn positive_arg<T: TryFrom<i128>>(node: &KdlNode, field: &str) -> ConfigResult<T> {
    let value = first_arg(node, field)?
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(field, "expected an integer"))?;
    if value < 1 {
        return Err(ConfigError::invalid(field, "must be at least 1"));
    }
    T::try_from(value).map_err(|_| ConfigError::invalid(field, "out of range"))
}
