//! FreightInstance Custom Resource Definition
//!
//! A FreightInstance pins one installation of a bundle at a specific content
//! digest. Its controller unpacks the bundle content and drives every
//! component (plugins and raw manifests) to convergence in descriptor order.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::conditions::ConditionsAware;

/// Specification for a FreightInstance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "freight.dev",
    version = "v1alpha1",
    kind = "FreightInstance",
    plural = "freightinstances",
    shortname = "fin",
    status = "FreightInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"InstanceReady\")].status"}"#,
    printcolumn = r#"{"name":"Tag","type":"string","jsonPath":".spec.tag"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FreightInstanceSpec {
    /// Image repository serving the bundle content
    pub repository: String,

    /// Tag the instance was installed from (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Content digest the installation is pinned to (`sha256:...`)
    pub digest: String,

    /// Desired lifecycle state requested by the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_status: Option<String>,

    /// Free-form configuration passed through to the bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

/// Status for a FreightInstance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FreightInstanceStatus {
    /// Conditions recording per-component apply/ready facts and readiness
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl FreightInstance {
    /// Validate the instance, including the conventional name shape
    ///
    /// Instance names embed the owning bundle's code
    /// (`<bundle-code>-<instance-code>`); derived plugin names are composed
    /// from those segments, so a malformed name is rejected up front.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.spec.repository.is_empty() {
            return Err(crate::Error::validation("instance repository must be set"));
        }
        if self.spec.digest.is_empty() {
            return Err(crate::Error::validation("instance digest must be set"));
        }
        crate::identity::instance_short_code(&self.name_any())?;
        Ok(())
    }
}

impl ConditionsAware for FreightInstance {
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
