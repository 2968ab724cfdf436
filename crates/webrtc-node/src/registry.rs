use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::NodeConfig;
use crate::error::ConfigError;
use crate::node::{Node, WebRtcNode};

pub type NodeConstructor = fn(&serde_json::Value) -> Result<Box<dyn Node>, ConfigError>;

#[derive(Clone)]
pub struct NodeType {
    pub name: &'static str,
    pub description: &'static str,
    pub constructor: NodeConstructor,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown node type {0:?}")]
    UnknownType(String),
    #[error("node type {0:?} is already registered")]
    Duplicate(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Node types available to a host process, keyed by type tag.
#[derive(Default)]
pub struct NodeRegistry {
    types: BTreeMap<&'static str, NodeType>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every node type this crate provides.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.types.insert(
            WebRtcNode::KIND,
            NodeType {
                name: WebRtcNode::KIND,
                description: "Web Real-time Communication",
                constructor: build_webrtc,
            },
        );
        registry
    }

    pub fn register(&mut self, node_type: NodeType) -> Result<(), RegistryError> {
        if self.types.contains_key(node_type.name) {
            return Err(RegistryError::Duplicate(node_type.name));
        }
        self.types.insert(node_type.name, node_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NodeType> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &NodeType> {
        self.types.values()
    }

    pub fn create(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Node>, RegistryError> {
        let node_type = self
            .get(name)
            .ok_or_else(|| RegistryError::UnknownType(name.to_string()))?;
        Ok((node_type.constructor)(config)?)
    }
}

fn build_webrtc(config: &serde_json::Value) -> Result<Box<dyn Node>, ConfigError> {
    let mut config = NodeConfig::from_json(config)?;
    config.apply_env_overrides()?;
    Ok(Box::new(WebRtcNode::new(config)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn build_failing(_: &serde_json::Value) -> Result<Box<dyn Node>, ConfigError> {
        Err(ConfigError::MissingSession)
    }

    #[test]
    fn defaults_register_webrtc() {
        let registry = NodeRegistry::with_defaults();
        let names: Vec<_> = registry.types().map(|node_type| node_type.name).collect();
        assert_eq!(names, vec!["webrtc"]);
    }

    #[test]
    fn create_builds_configured_node() {
        let _lock = crate::config::ENV_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let registry = NodeRegistry::with_defaults();
        let node = registry
            .create(
                "webrtc",
                &json!({ "session": "lab", "server": "wss://relay.example.com/signaling" }),
            )
            .expect("node");
        assert_eq!(node.kind(), "webrtc");
        assert!(node.details().contains("session=lab"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = NodeRegistry::with_defaults()
            .create("loopback", &json!({}))
            .err()
            .expect("unknown");
        assert!(matches!(err, RegistryError::UnknownType(name) if name == "loopback"));
    }

    #[test]
    fn config_errors_surface() {
        let _lock = crate::config::ENV_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let err = NodeRegistry::with_defaults()
            .create("webrtc", &json!({ "server": "ws://127.0.0.1:8080" }))
            .err()
            .expect("missing session");
        assert!(matches!(err, RegistryError::Config(ConfigError::MissingSession)));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = NodeRegistry::with_defaults();
        let err = registry
            .register(NodeType {
                name: "webrtc",
                description: "again",
                constructor: build_failing,
            })
            .expect_err("duplicate");
        assert!(matches!(err, RegistryError::Duplicate("webrtc")));

        registry
            .register(NodeType {
                name: "broken",
                description: "always fails",
                constructor: build_failing,
            })
            .expect("register");
        assert_eq!(registry.types().count(), 2);
        assert!(registry.create("broken", &json!({})).is_err());
    }
}
