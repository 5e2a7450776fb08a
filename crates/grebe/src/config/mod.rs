pub mod watcher;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::Map;
use crate::common::Set;
use crate::common::error::CoreError;

/// Environment variable overriding the directory config files are read from.
pub const CONFIG_DIR_ENV: &str = "GREBE_CONFIG_DIR";

/// Leaf-queue property selecting how applications are ordered.
pub const APPLICATION_SORT_POLICY: &str = "application.sort.policy";

/// Authoritative scheduler configuration, one file per policy group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    /// Root of the configured queue tree.
    pub queues: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub properties: Map<String, String>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

impl QueueConfig {
    pub fn is_leaf(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Location of the config file of a policy group.
pub fn resolve_config_file(policy_group: &str) -> PathBuf {
    let dir = std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| ".".to_string());
    Path::new(&dir).join(format!("{policy_group}.json"))
}

/// BLAKE2b digest of the config file content, used for change detection.
pub fn file_checksum(path: &Path) -> crate::Result<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    content_checksum(&bytes)
}

pub fn content_checksum(bytes: &[u8]) -> crate::Result<Vec<u8>> {
    let digest = orion::hash::digest(bytes)
        .map_err(|e| CoreError::ConfigError(format!("checksum failed: {e}")))?;
    Ok(digest.as_ref().to_vec())
}

/// Load and validate the configuration; returns the parsed config together
/// with the checksum of the raw file content.
pub fn load_config(path: &Path) -> crate::Result<(SchedulerConfig, Vec<u8>)> {
    let bytes = std::fs::read(path).map_err(|e| {
        CoreError::ConfigError(format!("cannot read config file {}: {e}", path.display()))
    })?;
    let config: SchedulerConfig = serde_json::from_slice(&bytes)?;
    validate_config(&config)?;
    let checksum = content_checksum(&bytes)?;
    Ok((config, checksum))
}

pub fn validate_config(config: &SchedulerConfig) -> crate::Result<()> {
    let mut partition_names = Set::default();
    for partition in &config.partitions {
        if partition.name.is_empty() {
            return Err(CoreError::ConfigError(
                "partition with an empty name".to_string(),
            ));
        }
        if !partition_names.insert(partition.name.as_str()) {
            return Err(CoreError::ConfigError(format!(
                "duplicate partition name '{}'",
                partition.name
            )));
        }
        validate_queue(&partition.queues, &partition.name)?;
    }
    Ok(())
}

fn validate_queue(queue: &QueueConfig, partition: &str) -> crate::Result<()> {
    if queue.name.is_empty() {
        return Err(CoreError::ConfigError(format!(
            "queue with an empty name in partition '{partition}'"
        )));
    }
    if queue.name.contains('.') {
        return Err(CoreError::ConfigError(format!(
            "queue name '{}' in partition '{partition}' must not contain '.'",
            queue.name
        )));
    }
    let mut child_names = Set::default();
    for child in &queue.queues {
        if !child_names.insert(child.name.as_str()) {
            return Err(CoreError::ConfigError(format!(
                "duplicate queue name '{}' under '{}' in partition '{partition}'",
                child.name, queue.name
            )));
        }
        validate_queue(child, partition)?;
    }
    Ok(())
}
