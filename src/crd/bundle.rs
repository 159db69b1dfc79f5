//! FreightBundle Custom Resource Definition
//!
//! A FreightBundle describes a published application bundle: the repository
//! it is served from and the list of signed tags that may be installed.
//! The bundle controller verifies every listed signature before the bundle
//! becomes ready for installation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BundleTag, Condition};
use crate::conditions::ConditionsAware;

/// Specification for a FreightBundle
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "freight.dev",
    version = "v1alpha1",
    kind = "FreightBundle",
    plural = "freightbundles",
    shortname = "fbu",
    status = "FreightBundleStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"BundleReady\")].status"}"#,
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FreightBundleSpec {
    /// Display title for the bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Icon reference for UI surfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Image repository serving the bundle content
    pub repository: String,

    /// Published tags with their signature requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_list: Vec<BundleTag>,
}

impl FreightBundleSpec {
    /// Validate the bundle specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.repository.is_empty() {
            return Err(crate::Error::validation("bundle repository must be set"));
        }
        for tag in &self.tag_list {
            if tag.digest.is_empty() {
                return Err(crate::Error::validation(format!(
                    "tag {:?} must carry a content digest",
                    tag.tag
                )));
            }
        }
        Ok(())
    }
}

/// Status for a FreightBundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FreightBundleStatus {
    /// Conditions recording signature verification and aggregate readiness
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ConditionsAware for FreightBundle {
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
    use crate::crd::types::{SignatureInfo, SignatureType};

    fn sample_spec() -> FreightBundleSpec {
        FreightBundleSpec {
            title: Some("Shop".to_string()),
            icon: None,
            repository: "docker.io/acme/shop-bundle".to_string(),
            tag_list: vec![BundleTag {
                tag: "v1.0.0".to_string(),
                digest: "sha256:abc".to_string(),
                signature_info: vec![SignatureInfo {
                    type_: SignatureType::KeyPair,
                    pub_key: None,
                    pub_key_secret: "k8s://freight-system/shop-key".to_string(),
                }],
            }],
        }
    }

    #[test]
    fn test_valid_spec_passes_validation() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn test_empty_repository_fails_validation() {
        let mut spec = sample_spec();
        spec.repository = String::new();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("repository"));
    }

    #[test]
    fn test_tag_without_digest_fails_validation() {
        let mut spec = sample_spec();
        spec.tag_list[0].digest = String::new();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("digest"));
    }

    /// Story: bundles are defined in YAML manifests
    #[test]
    fn story_yaml_manifest_defines_bundle() {
        let yaml = r#"
title: Shop
repository: docker.io/acme/shop-bundle
tagList:
  - tag: v1.0.0
    digest: sha256:abc
    signatureInfo:
      - type: KEY_PAIR
        pubKeySecret: k8s://freight-system/shop-key
"#;
        let spec: FreightBundleSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.repository, "docker.io/acme/shop-bundle");
        assert_eq!(spec.tag_list.len(), 1);
        assert_eq!(
            spec.tag_list[0].signature_info[0].pub_key_secret,
            "k8s://freight-system/shop-key"
        );
    }
}
