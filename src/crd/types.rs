//! Supporting types shared by the Freight CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// Besides the conventional type/status/reason/message fields, every condition
/// records the object generation that was observed when it was set. A
/// condition only counts as satisfied while that generation matches the
/// object's current one - editing the spec automatically invalidates every
/// previously recorded fact.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., DeployApplied, Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Object generation observed when the condition was recorded
    #[serde(rename = "observedGeneration")]
    pub observed_generation: i64,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }
}

/// Type of key used to verify an image signature
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureType {
    /// Verification against a private/public key pair
    #[default]
    KeyPair,
    /// Keyless verification via an OIDC identity flow
    KeyLess,
}

/// How to verify one signature on a bundle tag
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    /// Key flavor used for verification
    #[serde(rename = "type", default)]
    pub type_: SignatureType,

    /// Inline public key, if provided directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<String>,

    /// Reference to the secret holding the public key (e.g. `k8s://ns/name`)
    #[serde(default)]
    pub pub_key_secret: String,
}

/// One published tag of a bundle with its signature requirements
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleTag {
    /// Human-readable tag (e.g. `v1.0.0`)
    pub tag: String,

    /// Content digest the tag resolves to (`sha256:...`)
    pub digest: String,

    /// Signatures that must verify before the tag is trusted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signature_info: Vec<SignatureInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_new_sets_timestamp_and_generation() {
        let before = Utc::now();
        let condition = Condition::new(
            "Ready",
            ConditionStatus::True,
            "InstanceIsReady",
            "Your instance is ready",
            3,
        );
        let after = Utc::now();

        assert_eq!(condition.type_, "Ready");
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.observed_generation, 3);
        assert!(condition.last_transition_time >= before);
        assert!(condition.last_transition_time <= after);
    }

    #[test]
    fn test_condition_status_display() {
        assert_eq!(ConditionStatus::True.to_string(), "True");
        assert_eq!(ConditionStatus::False.to_string(), "False");
        assert_eq!(ConditionStatus::Unknown.to_string(), "Unknown");
    }

    /// Story: Unknown is the safe default when state cannot be determined
    #[test]
    fn story_default_condition_status_is_safe() {
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }

    #[test]
    fn test_signature_type_serde_uses_wire_names() {
        let json = serde_json::to_string(&SignatureType::KeyPair).unwrap();
        assert_eq!(json, "\"KEY_PAIR\"");
        let json = serde_json::to_string(&SignatureType::KeyLess).unwrap();
        assert_eq!(json, "\"KEY_LESS\"");
    }

    #[test]
    fn test_bundle_tag_roundtrip() {
        let tag = BundleTag {
            tag: "v1.0.0".to_string(),
            digest: "sha256:abc".to_string(),
            signature_info: vec![SignatureInfo {
                type_: SignatureType::KeyPair,
                pub_key: None,
                pub_key_secret: "k8s://freight-system/shop-key".to_string(),
            }],
        };
        let json = serde_json::to_string(&tag).unwrap();
        let parsed: BundleTag = serde_json::from_str(&json).unwrap();
        assert_eq!(tag, parsed);
    }

    #[test]
    fn test_condition_serde_roundtrip() {
        let condition = Condition::new(
            "DeployApplied",
            ConditionStatus::True,
            "DeployIsApplied",
            "Your deploy was applied",
            1,
        );
        let json = serde_json::to_string(&condition).unwrap();
        assert!(json.contains("\"observedGeneration\":1"));
        let parsed: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(condition, parsed);
    }
}
