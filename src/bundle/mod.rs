//! Bundle descriptor model and content collaborators
//!
//! A bundle's unpacked content carries a `descriptor.yaml` declaring its
//! name, version, dependencies, and an ordered component list. Components are
//! polymorphic - each is either a plugin (a containerized workload with
//! routing facts) or a manifest (a raw resource document to apply) - and are
//! re-read from the descriptor on every reconcile that needs them, never
//! persisted.

mod content;
mod signature;

pub use content::{ContentProvider, CraneContentProvider};
pub use signature::{CosignVerifier, SignatureVerifier};

#[cfg(test)]
pub use content::MockContentProvider;
#[cfg(test)]
pub use signature::MockSignatureVerifier;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name of the bundle descriptor inside unpacked content
pub const DESCRIPTOR_FILE: &str = "descriptor.yaml";

/// A plugin component: a containerized workload with ingress routing facts
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginComponent {
    /// Image repository of the plugin
    pub repository: String,

    /// Tag the plugin was published under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Content digest of the plugin image (`sha256:...`)
    pub digest: String,

    /// HTTP path probed for plugin health
    #[serde(default)]
    pub health_check_path: String,

    /// Container port the plugin serves on
    #[serde(default)]
    pub port: i32,

    /// Shared ingress to join; empty means a dedicated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_name: Option<String>,

    /// Hostname the plugin is exposed under
    #[serde(default)]
    pub ingress_host: String,

    /// HTTP path prefix the plugin is exposed under
    #[serde(default)]
    pub ingress_path: String,
}

/// A manifest component: a raw resource document shipped with the bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestComponent {
    /// Path of the document relative to the bundle content root
    pub file_path: String,
}

/// The typed payload of one component, selected by the descriptor's
/// discriminator field
///
/// An unrecognized discriminator is a deserialization error, surfaced to the
/// instance controller as a content failure.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", content = "spec")]
pub enum ComponentSpec {
    /// `type: PLUGIN`
    #[serde(rename = "PLUGIN")]
    Plugin(PluginComponent),
    /// `type: MANIFEST`
    #[serde(rename = "MANIFEST")]
    Manifest(ManifestComponent),
}

/// One entry of a bundle's ordered component list
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Component {
    /// Component name, for logging and events
    #[serde(default)]
    pub name: String,

    /// The typed payload
    #[serde(flatten)]
    pub spec: ComponentSpec,
}

/// The parsed `descriptor.yaml` of a bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct BundleDescriptor {
    /// Bundle version
    #[serde(default)]
    pub version: String,

    /// Bundle name
    #[serde(default)]
    pub name: String,

    /// Descriptor format revision
    #[serde(default)]
    pub descriptor: String,

    /// Other bundles this one depends on
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Ordered component list; order is the installation order
    #[serde(default)]
    pub components: Vec<Component>,
}

/// Read and parse the descriptor from an unpacked content directory
pub fn read_descriptor(dir: &Path) -> Result<BundleDescriptor> {
    let path = dir.join(DESCRIPTOR_FILE);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::content(format!("reading {}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| Error::content(format!("parsing {}: {e}", path.display())))
}
