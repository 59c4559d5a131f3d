//! Configuration types for chargemesh nodes
//!
//! This module defines [`NodeConfig`], the role presets that pick relay
//! behaviour, and JSON persistence. Durations are stored in milliseconds so
//! the file stays human-editable.

use crate::addressing::NodeId;
use crate::error::{ConfigError, Result};
use crate::forwarding::DefaultPolicy;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Part a node plays in the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// End device such as a charging station (default)
    ///
    /// - Does not relay other nodes' traffic
    /// - Pass-through requests are refused with `ForwardingRejected`
    #[default]
    Leaf,

    /// Relay between leaves and the controller
    ///
    /// - Relays traffic
    /// - Admits anything no filter decided on
    Hub,

    /// Central controller
    ///
    /// - Answers requests addressed to `$controller`
    /// - Announces itself as `$controller` to its neighbours
    /// - Relays traffic
    Controller,
}

impl NodeRole {
    /// Whether nodes in this role forward traffic by default
    pub fn relays(&self) -> bool {
        !matches!(self, Self::Leaf)
    }

    /// Whether this role answers the well-known controller address
    pub fn is_controller(&self) -> bool {
        matches!(self, Self::Controller)
    }

    /// Default forwarding policy for this role
    pub fn default_policy(&self) -> DefaultPolicy {
        DefaultPolicy::Admit
    }
}

/// Complete node configuration
///
/// Every field has a default, so a config file only needs the values it
/// changes. Instances are validated by `NodeBuilder::build` and
/// [`load_config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier of this node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,

    /// Role preset
    pub role: NodeRole,

    /// Whether pass-through traffic is forwarded at all; `None` follows the role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_enabled: Option<bool>,

    /// What relays do with traffic no filter decided on
    pub default_policy: DefaultPolicy,

    /// Run the forwarding pipeline on requests addressed to this node too
    pub filter_local_requests: bool,

    /// Largest accepted payload in bytes
    pub max_payload_size: usize,

    /// Maximum number of attached channels
    pub max_connections: usize,

    /// Cap on concurrently pending outbound requests
    pub max_pending_requests: usize,

    /// Consecutive malformed frames tolerated before a channel is closed
    pub max_decode_errors: u32,

    /// Delivery attempts for parked sends
    pub max_retries: u32,

    /// Park transiently failed sends instead of failing them at once
    pub retry_transient_failures: bool,

    /// Default request timeout
    pub request_timeout_ms: u64,

    /// How long a relay remembers where a forwarded request came from
    pub relay_timeout_ms: u64,

    /// Interval between maintenance cycles
    pub maintenance_interval_ms: u64,

    /// Minimum spacing between topology announcements
    pub announce_debounce_ms: u64,

    /// Re-announce an unchanged table after this long (defaults to the debounce)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce_refresh_ms: Option<u64>,

    /// Validity of routes learned from announcements; `None` never expires
    pub learned_route_ttl_ms: Option<u64>,

    /// Destinations this node never forwards to
    pub deny_list: Vec<NodeId>,

    /// When non-empty, the only destinations this node forwards to
    pub allow_list: Vec<NodeId>,

    /// Associated-data parameter bound into sealed payloads
    pub secure_channel_parameter: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_role(NodeRole::default())
    }
}

impl NodeConfig {
    /// Defaults for a role
    pub fn for_role(role: NodeRole) -> Self {
        Self {
            node_id: None,
            role,
            relay_enabled: None,
            default_policy: role.default_policy(),
            filter_local_requests: false,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_connections: 1024,
            max_pending_requests: crate::correlation::DEFAULT_MAX_PENDING,
            max_decode_errors: 3,
            max_retries: crate::routing::DEFAULT_MAX_RETRIES,
            retry_transient_failures: false,
            request_timeout_ms: 30_000,
            relay_timeout_ms: 60_000,
            maintenance_interval_ms: 1_000,
            announce_debounce_ms: 10_000,
            announce_refresh_ms: None,
            learned_route_ttl_ms: Some(30_000),
            deny_list: Vec::new(),
            allow_list: Vec::new(),
            secure_channel_parameter: "chargemesh".to_string(),
        }
    }

    /// Switch role, updating the settings the role implies
    pub fn set_role(&mut self, role: NodeRole) {
        self.role = role;
        self.relay_enabled = None;
        self.default_policy = role.default_policy();
    }

    /// Whether this node forwards pass-through traffic
    pub fn relays(&self) -> bool {
        self.relay_enabled.unwrap_or_else(|| self.role.relays())
    }

    /// Default request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Relay record lifetime
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    /// Maintenance interval
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Announcement debounce
    pub fn announce_debounce(&self) -> Duration {
        Duration::from_millis(self.announce_debounce_ms)
    }

    /// Announcement refresh interval
    pub fn announce_refresh(&self) -> Duration {
        Duration::from_millis(self.announce_refresh_ms.unwrap_or(self.announce_debounce_ms))
    }

    /// Learned route validity
    pub fn learned_route_ttl(&self) -> Option<Duration> {
        self.learned_route_ttl_ms.map(Duration::from_millis)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a cap or interval is zero, or
    /// when the refresh interval is shorter than the debounce.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_payload_size", self.max_payload_size as u64),
            ("max_connections", self.max_connections as u64),
            ("max_pending_requests", self.max_pending_requests as u64),
            ("max_decode_errors", u64::from(self.max_decode_errors)),
            ("request_timeout_ms", self.request_timeout_ms),
            ("relay_timeout_ms", self.relay_timeout_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }

        if let Some(refresh) = self.announce_refresh_ms {
            if refresh < self.announce_debounce_ms {
                return Err(invalid(
                    "announce_refresh_ms",
                    "must not be shorter than announce_debounce_ms",
                ));
            }
        }

        if self.learned_route_ttl_ms == Some(0) {
            return Err(invalid("learned_route_ttl_ms", "must be greater than 0"));
        }

        if let Some(id) = &self.node_id {
            if id.is_reserved() {
                return Err(ConfigError::InvalidNodeId {
                    reason: format!("{} is a reserved address", id),
                }
                .into());
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::ChargemeshError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Save configuration to a JSON file
///
/// Parent directories are created as needed.
///
/// # Example
///
/// ```no_run
/// use chargemesh::api::{save_config, NodeConfig};
/// use std::path::Path;
///
/// let config = NodeConfig::default();
/// save_config(Path::new("node.json"), &config).unwrap();
/// ```
pub fn save_config(path: &Path, config: &NodeConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(config).map_err(|e| ConfigError::SerializationFailed {
        reason: format!("Failed to serialize config: {}", e),
    })?;

    std::fs::write(path, json)?;
    Ok(())
}

/// Load and validate configuration from a JSON file
///
/// # Errors
///
/// Returns an error if:
/// - The file doesn't exist
/// - The file contains invalid JSON or doesn't match the schema
/// - The loaded values fail [`NodeConfig::validate`]
pub fn load_config(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }

    let json = std::fs::read_to_string(path)?;
    let config: NodeConfig =
        serde_json::from_str(&json).map_err(|e| ConfigError::SerializationFailed {
            reason: format!("Failed to parse config: {}", e),
        })?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChargemeshError;
    use tempfile::TempDir;

    #[test]
    fn test_role_presets() {
        let leaf = NodeConfig::for_role(NodeRole::Leaf);
        assert!(!leaf.relays());

        let hub = NodeConfig::for_role(NodeRole::Hub);
        assert!(hub.relays());
        assert_eq!(hub.default_policy, DefaultPolicy::Admit);

        assert!(NodeRole::Controller.is_controller());
        assert!(NodeRole::Controller.relays());
        assert_eq!(NodeConfig::default().role, NodeRole::Leaf);
    }

    #[test]
    fn test_set_role_updates_dependent_settings() {
        let mut config = NodeConfig::default();
        config.relay_enabled = Some(false);
        config.set_role(NodeRole::Hub);
        assert!(config.relays());

        config.relay_enabled = Some(false);
        assert!(!config.relays());
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();

        assert!(!config.filter_local_requests);
        assert_eq!(config.maintenance_interval(), Duration::from_secs(1));
        assert_eq!(config.announce_debounce(), Duration::from_secs(10));
        assert_eq!(config.announce_refresh(), config.announce_debounce());
        assert_eq!(config.max_decode_errors, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let config = NodeConfig {
            maintenance_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ChargemeshError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_validation_rejects_short_refresh() {
        let config = NodeConfig {
            announce_debounce_ms: 10_000,
            announce_refresh_ms: Some(5_000),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_reserved_node_id() {
        let config = NodeConfig {
            node_id: Some(NodeId::controller()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ChargemeshError::Config(ConfigError::InvalidNodeId { .. }))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("node.json");

        let mut config = NodeConfig::for_role(NodeRole::Hub);
        config.node_id = Some(NodeId::new("HUB-1").unwrap());
        config.deny_list = vec![NodeId::new("CS-666").unwrap()];

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"node_id": "CS-1", "role": "hub"}"#).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.node_id, Some(NodeId::new("CS-1").unwrap()));
        assert_eq!(loaded.role, NodeRole::Hub);
        assert!(loaded.relays());
        assert_eq!(loaded.request_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = load_config(&dir.path().join("absent.json"));
        assert!(matches!(
            result,
            Err(ChargemeshError::Config(ConfigError::FileNotFound { .. }))
        ));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            load_config(&path),
            Err(ChargemeshError::Config(ConfigError::SerializationFailed { .. }))
        ));
    }
}
