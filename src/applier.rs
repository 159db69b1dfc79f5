//! Raw manifest application
//!
//! Manifest components ship arbitrary resource documents with the bundle.
//! The applier resolves each document's kind against API discovery and
//! applies it with server-side apply, so re-applying the same document is
//! always safe.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde::Deserialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result, FIELD_MANAGER};

/// Applies raw multi-document manifests to the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply every document in `manifest` into `namespace`
    ///
    /// Documents carrying their own namespace keep it; create-if-absent,
    /// else update (server-side apply).
    async fn apply(&self, namespace: &str, manifest: &str) -> Result<()>;
}

/// Manifest applier backed by the Kubernetes API
pub struct KubeManifestApplier {
    client: Client,
}

impl KubeManifestApplier {
    /// Create a new applier with the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Discover the ApiResource for a given API version and kind.
    ///
    /// Queries the API server for the correct plural form and metadata,
    /// falling back to rule-based pluralization when the resource is not in
    /// the discovery snapshot yet (e.g. a CRD installed moments ago).
    async fn discover_api_resource(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<kube::discovery::ApiResource> {
        use kube::discovery::Discovery;

        let (group, version) = parse_api_version(api_version);

        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::manifest_apply(format!("API discovery failed: {e}")))?;

        for api_group in discovery.groups() {
            if api_group.name() != group {
                continue;
            }
            for (ar, _caps) in api_group.recommended_resources() {
                if ar.kind == kind && ar.version == version {
                    return Ok(ar.clone());
                }
            }
        }

        debug!(
            api_version = %api_version,
            kind = %kind,
            "resource not found in discovery, using fallback pluralization"
        );

        Ok(kube::discovery::ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural: pluralize_kind(kind),
        })
    }
}

#[async_trait]
impl ManifestApplier for KubeManifestApplier {
    async fn apply(&self, namespace: &str, manifest: &str) -> Result<()> {
        for document in parse_documents(manifest)? {
            let api_version = field_str(&document, "apiVersion")?;
            let kind = field_str(&document, "kind")?;
            let name = document
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(|n| n.as_str())
                .ok_or_else(|| Error::manifest_apply("document has no metadata.name"))?
                .to_string();
            let target_namespace = document
                .get("metadata")
                .and_then(|m| m.get("namespace"))
                .and_then(|n| n.as_str())
                .unwrap_or(namespace)
                .to_string();

            let ar = self.discover_api_resource(&api_version, &kind).await?;

            let obj: DynamicObject = serde_json::from_value(document)
                .map_err(|e| Error::manifest_apply(format!("invalid {kind} document: {e}")))?;

            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &target_namespace, &ar);
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;

            info!(
                kind = %kind,
                name = %name,
                namespace = %target_namespace,
                "applied manifest document"
            );
        }
        Ok(())
    }
}

/// Split a multi-document YAML string into non-empty JSON values
fn parse_documents(manifest: &str) -> Result<Vec<serde_json::Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_json::Value::deserialize(document)
            .map_err(|e| Error::manifest_apply(format!("invalid YAML document: {e}")))?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn field_str(document: &serde_json::Value, field: &str) -> Result<String> {
    document
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::manifest_apply(format!("document has no {field}")))
}

/// Parse an apiVersion into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        // Core API (e.g. "v1")
        None => ("", api_version),
    }
}

/// Convert a Kind to its plural form for Kubernetes API paths
///
/// Rule-based fallback used only when discovery does not know the kind yet.
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        // policy -> policies, but not gateway -> gateways
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}
