//! FreightPlugin Custom Resource Definition
//!
//! A FreightPlugin is derived from one plugin component of an instance. Its
//! controller drives a Deployment, a Service, and a FreightGateway to
//! convergence, in that order.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::conditions::ConditionsAware;

/// A name/value environment variable injected into the plugin container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Literal value
    #[serde(default)]
    pub value: String,
}

fn default_replicas() -> i32 {
    1
}

fn default_port() -> i32 {
    8080
}

/// Specification for a FreightPlugin
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "freight.dev",
    version = "v1alpha1",
    kind = "FreightPlugin",
    plural = "freightplugins",
    shortname = "fpl",
    status = "FreightPluginStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FreightPluginSpec {
    /// Container image reference (repository@digest)
    pub image: String,

    /// Number of replicas for the derived deployment
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container port the plugin serves on
    #[serde(default = "default_port")]
    pub port: i32,

    /// HTTP path probed for readiness and liveness
    #[serde(default)]
    pub health_check_path: String,

    /// Environment variables for the plugin container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_variables: Vec<EnvVar>,

    /// Shared ingress to join; empty means a dedicated ingress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_name: Option<String>,

    /// Hostname the plugin is exposed under
    #[serde(default)]
    pub ingress_host: String,

    /// HTTP path prefix the plugin is exposed under
    #[serde(default)]
    pub ingress_path: String,
}

/// Status for a FreightPlugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FreightPluginStatus {
    /// Conditions recording each derived resource's apply/ready facts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ConditionsAware for FreightPlugin {
    fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: plugin specs default replicas and port
    ///
    /// Bundles typically declare only the image and routing facts; the
    /// workload shape falls back to one replica on port 8080.
    #[test]
    fn story_plugin_spec_defaults() {
        let yaml = r#"
image: registry.example.com/acme/catalog@sha256:abc
healthCheckPath: /health
ingressHost: shop.example.com
ingressPath: /catalog
"#;
        let spec: FreightPluginSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.port, 8080);
        assert!(spec.ingress_name.is_none());
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = FreightPluginSpec {
            image: "registry.example.com/acme/catalog@sha256:abc".to_string(),
            replicas: 2,
            port: 9090,
            health_check_path: "/healthz".to_string(),
            environment_variables: vec![EnvVar {
                name: "LOG_LEVEL".to_string(),
                value: "debug".to_string(),
            }],
            ingress_name: Some("shared".to_string()),
            ingress_host: "shop.example.com".to_string(),
            ingress_path: "/catalog".to_string(),
        };
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: FreightPluginSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }
}
