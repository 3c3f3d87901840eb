//! Construction-time configuration for a grid node
//!
//! A [`GridConfig`] is assembled once (defaults, then CLI flags, then
//! environment overrides via [`GridConfig::apply_env`]) and stays immutable for
//! the lifetime of the node.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};

/// Environment variable overriding the configured namespace
pub const ENV_NAMESPACE: &str = "GRID_NAMESPACE";
/// Environment variable enabling test mode (`1` or `true`)
pub const ENV_TEST_MODE: &str = "GRID_TEST_MODE";
/// Environment variable pinning the public address reported in the identity
pub const ENV_PUBLIC_IP: &str = "GRID_PUBLIC_IP";

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "gridsync";
/// Local API port used when none is configured
pub const DEFAULT_API_PORT: u16 = 10000;

const NAME_ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusky", "eager", "frosty", "gentle", "hollow", "ivory", "jolly",
    "keen", "lucid", "mellow", "nimble", "olive", "proud", "quiet", "rapid", "silent", "tidy",
];

const NAME_NOUNS: &[&str] = &[
    "anchor", "beacon", "cedar", "delta", "ember", "falcon", "grove", "harbor", "island",
    "juniper", "kestrel", "lagoon", "meadow", "nebula", "orchid", "pebble", "quarry", "river",
    "summit", "tundra",
];

/// Generate a human-friendly random node name like `calm-harbor-42`
pub fn random_node_name() -> String {
    let mut rng = rand::rng();
    let adjective = NAME_ADJECTIVES[rng.random_range(0..NAME_ADJECTIVES.len())];
    let noun = NAME_NOUNS[rng.random_range(0..NAME_NOUNS.len())];
    format!("{}-{}-{:02}", adjective, noun, rng.random_range(0..100u32))
}

/// Task instance ports follow the API port: `api_port + 1 + index`
pub fn task_port(api_port: u16, index: u32) -> Option<u16> {
    let offset = u16::try_from(index).ok()?.checked_add(1)?;
    api_port.checked_add(offset)
}

/// Where the replicated payload lives on disk and whether this node owns it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    /// Payload file served by the file master
    pub dest_file: Option<PathBuf>,
    /// Folder a replica unpacks the received payload into
    pub dest_folder: Option<PathBuf>,
    /// Whether this node is the authoritative payload holder
    pub is_file_master: bool,
    /// Scratch folder for in-flight payload writes
    pub tmp_folder: Option<PathBuf>,
}

/// Options handed to the task-execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    /// Number of task instances to run per node
    pub instances: u32,
    /// Task group configuration (JSON text)
    pub json_conf: Option<String>,
    /// Folder holding task entry points, relative to the payload base folder
    pub task_folder: String,
    /// Extra environment passed to task processes
    pub env: BTreeMap<String, String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            instances: 1,
            json_conf: None,
            task_folder: "tasks".to_string(),
            env: BTreeMap::new(),
        }
    }
}

/// Timers and deadlines used by the coordination engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Delay between identity exchange and the master's sync offer
    pub propagation_delay: Duration,
    /// Period of the isolation check after readiness
    pub health_check_period: Duration,
    /// Upper bound on a single send to one peer
    pub send_timeout: Duration,
    /// Upper bound on a remote trigger round-trip
    pub request_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            propagation_delay: Duration::from_secs(1),
            health_check_period: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Full node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Peer display name
    pub name: String,
    /// Grid namespace; nodes only rendezvous within the same namespace
    pub namespace: String,
    /// Local API port; task ports are offset from it
    pub api_port: u16,
    /// Payload location options
    pub files: FileOptions,
    /// Task-execution options
    pub tasks: TaskOptions,
    /// Engine timers
    pub timing: Timing,
    /// Known peers to bootstrap the rendezvous topic (transport-specific ids)
    pub bootstrap: Vec<String>,
    /// Short-circuit real task execution and real payload writes
    pub test_mode: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            name: random_node_name(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            api_port: DEFAULT_API_PORT,
            files: FileOptions::default(),
            tasks: TaskOptions::default(),
            timing: Timing::default(),
            bootstrap: Vec::new(),
            test_mode: false,
        }
    }
}

impl GridConfig {
    /// Create a config with defaults and the given namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Set the node name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark this node as the file master serving `dest_file`
    pub fn as_file_master(mut self, dest_file: impl Into<PathBuf>) -> Self {
        self.files.is_file_master = true;
        self.files.dest_file = Some(dest_file.into());
        self
    }

    /// Override engine timers
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Enable or disable test mode
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Apply process-environment overrides (namespace, test mode)
    pub fn apply_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(namespace) = lookup(ENV_NAMESPACE).filter(|ns| !ns.trim().is_empty()) {
            self.namespace = namespace.trim().to_string();
        }
        if let Some(flag) = lookup(ENV_TEST_MODE) {
            self.test_mode = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Port assigned to the `index`-th task instance; `None` past `u16::MAX`
    pub fn task_port(&self, index: u32) -> Option<u16> {
        task_port(self.api_port, index)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> GridResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(GridError::Config("namespace must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(GridError::Config("node name must not be empty".to_string()));
        }
        if self.files.is_file_master && self.files.dest_file.is_none() && !self.test_mode {
            return Err(GridError::Config(
                "a file master needs files.dest_file".to_string(),
            ));
        }
        if self.timing.health_check_period.is_zero() {
            return Err(GridError::Config(
                "health_check_period must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GridConfig::default();
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.api_port, 10000);
        assert!(!config.files.is_file_master);
        assert_eq!(config.timing.health_check_period, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_random_name_shape() {
        let name = random_node_name();
        assert_eq!(name.split('-').count(), 3);
    }

    #[test]
    fn test_namespace_override_takes_precedence() {
        let mut config = GridConfig::new("from-flag");
        config.apply_overrides(|key| match key {
            ENV_NAMESPACE => Some("from-env".to_string()),
            _ => None,
        });
        assert_eq!(config.namespace, "from-env");
    }

    #[test]
    fn test_blank_env_namespace_is_ignored() {
        let mut config = GridConfig::new("from-flag");
        config.apply_overrides(|key| match key {
            ENV_NAMESPACE => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(config.namespace, "from-flag");
    }

    #[test]
    fn test_test_mode_flag() {
        let mut config = GridConfig::default();
        config.apply_overrides(|key| match key {
            ENV_TEST_MODE => Some("true".to_string()),
            _ => None,
        });
        assert!(config.test_mode);
    }

    #[test]
    fn test_task_ports_offset_from_api_port() {
        let config = GridConfig::default();
        assert_eq!(config.task_port(0), Some(10001));
        assert_eq!(config.task_port(3), Some(10004));
    }

    #[test]
    fn test_task_port_overflow_is_none() {
        assert_eq!(task_port(u16::MAX - 2, 1), Some(u16::MAX));
        assert_eq!(task_port(u16::MAX - 2, 2), None);
        assert_eq!(task_port(10000, 70_000), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GridConfig =
            serde_json::from_str(r#"{"namespace":"farm","files":{"is_file_master":true}}"#).unwrap();
        assert_eq!(config.namespace, "farm");
        assert_eq!(config.api_port, DEFAULT_API_PORT);
        assert!(config.files.is_file_master);
        assert_eq!(config.tasks.task_folder, "tasks");
    }

    #[test]
    fn test_master_without_file_is_invalid() {
        let mut config = GridConfig::default();
        config.files.is_file_master = true;
        assert!(matches!(config.validate(), Err(GridError::Config(_))));
    }
}
