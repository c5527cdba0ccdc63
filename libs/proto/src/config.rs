//! Node configuration types.
//!
//! A `NodeConfig` is the declarative, immutable description of a node the
//! Stem should keep alive. It converts to and from a structured record
//! (`serde_json::Value`) for the embedding application and to and from
//! compact JSON text for the IPC channel. Both forms use the same field
//! names; absent optionals are omitted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// A node's role within the cluster. Opaque to the supervision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRole {
    #[default]
    None,
    Logger,
    Manager,
    Proxy,
    Worker,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterRole::None => "none",
            ClusterRole::Logger => "logger",
            ClusterRole::Manager => "manager",
            ClusterRole::Proxy => "proxy",
            ClusterRole::Worker => "worker",
        };
        write!(f, "{}", s)
    }
}

/// Network location and role of a peer in the static cluster topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterEndpoint {
    /// Role of the peer (manager, logger, worker, ...).
    pub role: ClusterRole,

    /// Host or IP at which the peer listens.
    pub host: String,

    /// TCP port at which the peer listens.
    pub port: u16,

    /// Packet source interface, typically set for workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Declarative configuration of a supervised node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Unique, human-readable name within a supervision tree.
    pub name: String,

    /// Interface from which the node reads packets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Working directory of the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// File receiving the node's stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,

    /// File receiving the node's stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<String>,

    /// CPU core the node pins itself to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_affinity: Option<u32>,

    /// Additional scripts to load, in order.
    #[serde(default)]
    pub scripts: Vec<String>,

    /// Full static cluster layout, keyed by node name.
    #[serde(default)]
    pub cluster: BTreeMap<String, ClusterEndpoint>,
}

impl NodeConfig {
    /// Create a config with only a name set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: None,
            directory: None,
            stdout_file: None,
            stderr_file: None,
            cpu_affinity: None,
            scripts: Vec::new(),
            cluster: BTreeMap::new(),
        }
    }

    /// Check the invariants every node config must hold.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.name.trim().is_empty() {
            return Err(ProtoError::MissingField("name"));
        }

        if self.name.contains(['\n', '\0']) {
            return Err(ProtoError::InvalidField {
                field: "name".to_string(),
                detail: "must not contain newline or NUL characters".to_string(),
            });
        }

        for (peer, endpoint) in &self.cluster {
            if endpoint.host.trim().is_empty() {
                return Err(ProtoError::InvalidField {
                    field: format!("cluster.{}.host", peer),
                    detail: "host cannot be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Convert from the structured representation.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ProtoError> {
        let config: NodeConfig = serde_json::from_value(value.clone())
            .map_err(|e| ProtoError::MalformedConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Convert into the structured representation.
    pub fn to_value(&self) -> serde_json::Value {
        // Plain strings, integers and maps keyed by strings always serialize.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Parse from compact JSON text.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        let config: NodeConfig =
            serde_json::from_str(json).map_err(|e| ProtoError::MalformedConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as compact JSON text.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn populated() -> NodeConfig {
        let mut cluster = BTreeMap::new();
        cluster.insert(
            "manager".to_string(),
            ClusterEndpoint {
                role: ClusterRole::Manager,
                host: "127.0.0.1".to_string(),
                port: 9999,
                interface: None,
            },
        );
        cluster.insert(
            "worker-1".to_string(),
            ClusterEndpoint {
                role: ClusterRole::Worker,
                host: "10.0.0.2".to_string(),
                port: 10001,
                interface: Some("eth1".to_string()),
            },
        );

        NodeConfig {
            name: "worker-1".to_string(),
            interface: Some("eth1".to_string()),
            directory: Some("/var/spool/worker-1".to_string()),
            stdout_file: Some("stdout.log".to_string()),
            stderr_file: Some("stderr.log".to_string()),
            cpu_affinity: Some(3),
            scripts: vec!["local.zeek".to_string(), "extra.zeek".to_string()],
            cluster,
        }
    }

    #[test]
    fn test_value_round_trip_populated() {
        let config = populated();
        let value = config.to_value();
        assert_eq!(NodeConfig::from_value(&value).unwrap(), config);

        let text = config.to_json().unwrap();
        assert_eq!(NodeConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_value_round_trip_empty_cluster() {
        let config = NodeConfig::new("logger");
        let value = config.to_value();

        assert_eq!(value["cluster"], json!({}));
        assert_eq!(value["scripts"], json!([]));
        assert_eq!(NodeConfig::from_value(&value).unwrap(), config);
    }

    #[test]
    fn test_absent_optionals_are_omitted() {
        let value = NodeConfig::new("w").to_value();
        let obj = value.as_object().unwrap();

        assert!(!obj.contains_key("interface"));
        assert!(!obj.contains_key("directory"));
        assert!(!obj.contains_key("stdout_file"));
        assert!(!obj.contains_key("stderr_file"));
        assert!(!obj.contains_key("cpu_affinity"));
    }

    #[test]
    fn test_minimal_input_defaults_collections() {
        let config = NodeConfig::from_json(r#"{"name":"proxy-1"}"#).unwrap();
        assert_eq!(config.name, "proxy-1");
        assert!(config.scripts.is_empty());
        assert!(config.cluster.is_empty());
    }

    #[rstest]
    #[case(json!({"name": ""}))]
    #[case(json!({"name": "   "}))]
    #[case(json!({"interface": "eth0"}))]
    #[case(json!({"name": "w", "bogus": 1}))]
    #[case(json!({"name": "w", "cluster": {"m": {"role": "captain", "host": "h", "port": 1}}}))]
    #[case(json!({"name": "w", "cluster": {"m": {"role": "manager", "host": "", "port": 1}}}))]
    #[case(json!({"name": "w", "cluster": {"m": {"role": "manager", "host": "h", "port": 70000}}}))]
    fn test_invalid_configs_rejected(#[case] value: serde_json::Value) {
        assert!(NodeConfig::from_value(&value).is_err());
    }

    #[rstest]
    #[case("none", ClusterRole::None)]
    #[case("logger", ClusterRole::Logger)]
    #[case("manager", ClusterRole::Manager)]
    #[case("proxy", ClusterRole::Proxy)]
    #[case("worker", ClusterRole::Worker)]
    fn test_role_tags(#[case] tag: &str, #[case] role: ClusterRole) {
        let parsed: ClusterRole = serde_json::from_value(json!(tag)).unwrap();
        assert_eq!(parsed, role);
        assert_eq!(role.to_string(), tag);
    }
}
