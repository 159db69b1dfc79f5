//! FreightGateway Custom Resource Definition
//!
//! A FreightGateway carries the ingress routing facts for one plugin. Its
//! controller materializes (or joins) an Ingress and reports readiness once
//! the ingress has an address.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::conditions::ConditionsAware;

/// Specification for a FreightGateway
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "freight.dev",
    version = "v1alpha1",
    kind = "FreightGateway",
    plural = "freightgateways",
    shortname = "fgw",
    status = "FreightGatewayStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.ingressHost"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FreightGatewaySpec {
    /// Name of the ingress to create or join
    pub ingress_name: String,

    /// Hostname routed to the backing service
    pub ingress_host: String,

    /// HTTP path prefix routed to the backing service
    pub ingress_path: String,

    /// Named port on the backing service
    pub ingress_port: String,

    /// Backing service name
    pub ingress_service: String,
}

/// Status for a FreightGateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FreightGatewayStatus {
    /// Conditions recording the ingress apply/ready facts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ConditionsAware for FreightGateway {
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
