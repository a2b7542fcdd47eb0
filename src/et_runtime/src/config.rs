//! Runtime configuration, loaded from TOML.
//!
//! ```toml
//! device_count = 1
//! clusters = 32
//! threads_per_cluster = 64
//! active_clusters = 2
//! device_region_size = 536870912
//! ```
//!
//! Missing keys take their default.

use minion_rt::topology::{CLUSTERS, THREADS_PER_CLUSTER};
use serde::Deserialize;
use std::{fs, path::Path};

const MIB: u64 = 1024 * 1024;

/// Errors while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The text is not valid TOML for this schema.
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
/// Settings of the simulated platform.
pub struct RuntimeConfig {
    /// Devices exposed by the platform.
    pub device_count: i32,
    /// Clusters per device.
    pub clusters: u32,
    /// Hardware threads per cluster.
    pub threads_per_cluster: u32,
    /// Clusters programmed as active at bring-up.
    pub active_clusters: u32,
    /// Pinned host memory region size.
    pub host_region_size: u64,
    /// Device data region size.
    pub device_region_size: u64,
    /// Device code region size.
    pub code_region_size: u64,
    /// Allocation granularity of every region.
    pub region_alignment: u64,
    /// Elements per virtual queue.
    pub queue_depth: usize,
    /// Largest element a virtual queue accepts.
    pub queue_slot_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            device_count: 1,
            clusters: CLUSTERS,
            threads_per_cluster: THREADS_PER_CLUSTER,
            active_clusters: 2,
            host_region_size: 64 * MIB,
            device_region_size: 512 * MIB,
            code_region_size: 128 * MIB,
            region_alignment: 64,
            queue_depth: 16,
            queue_slot_size: 4096,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.device_count < 0 {
            return invalid(format!("device_count {} is negative", self.device_count));
        }
        if self.clusters == 0 || self.threads_per_cluster == 0 {
            return invalid("topology has no hardware threads".to_string());
        }
        if self.active_clusters == 0 || self.active_clusters > self.clusters {
            return invalid(format!(
                "active_clusters {} outside 1..={}",
                self.active_clusters, self.clusters
            ));
        }
        if !self.region_alignment.is_power_of_two() {
            return invalid(format!(
                "region_alignment {} is not a power of two",
                self.region_alignment
            ));
        }
        for (name, size) in &[
            ("host_region_size", self.host_region_size),
            ("device_region_size", self.device_region_size),
            ("code_region_size", self.code_region_size),
        ] {
            if *size == 0 || size % self.region_alignment != 0 {
                return invalid(format!(
                    "{} {} must be a non-zero multiple of {}",
                    name, size, self.region_alignment
                ));
            }
        }
        if self.queue_depth == 0 || self.queue_slot_size < 64 {
            return invalid("virtual queues need at least one slot of 64 bytes".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_follow_hardware() {
        let config = RuntimeConfig::default();
        assert_eq!(config.clusters, 32);
        assert_eq!(config.threads_per_cluster, 64);
        assert_eq!(config.device_region_size, 512 * MIB);
        assert_eq!(config.code_region_size, 128 * MIB);
        config.validate().unwrap();
    }

    #[test]
    fn partial_document() {
        let config = RuntimeConfig::from_toml_str("active_clusters = 4\nqueue_depth = 2\n").unwrap();
        assert_eq!(config.active_clusters, 4);
        assert_eq!(config.queue_depth, 2);
        assert_eq!(config.clusters, 32);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("active_clusters = 40"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("region_alignment = 48"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("no_such_key = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_file("/nonexistent/etrt.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
