//! Deterministic identities for derived resources
//!
//! Every resource the operator derives (plugin CRs, deployments, services,
//! gateways, ingresses) gets a stable, collision-resistant name computed from
//! the semantic identity of its inputs: a one-way digest of the discriminating
//! fields, truncated to fit Kubernetes name limits, with a human-readable role
//! suffix. Identical inputs always yield identical names, which is what makes
//! create-or-update idempotent across repeated reconciliations and process
//! restarts - the name itself is the memory of "was this already created".

use sha2::{Digest, Sha256};

use crate::bundle::PluginComponent;
use crate::Error;

/// Length of the short hex code embedded in derived names
pub const CODE_LEN: usize = 8;

/// Maximum length of an owner name before a role suffix is appended
///
/// Keeps `<name>-deployment` and friends under the 253-character object
/// name limit.
pub const OWNER_NAME_LIMIT: usize = 208;

/// Maximum length of the instance name embedded in a plugin code
pub const INSTANCE_NAME_LIMIT: usize = 180;

/// Maximum length of an annotation key
pub const ANNOTATION_KEY_LIMIT: usize = 63;

/// Length of the digest prefix used in service port names
///
/// Port names must stay within 15 characters; 9 digest characters plus the
/// `-port` suffix fits.
const PORT_DIGEST_LEN: usize = 9;

/// Hex-encoded SHA-256 of the input string
pub fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncate a string to at most `max` bytes, returning it unchanged if shorter
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() > max {
        &s[..max]
    } else {
        s
    }
}

/// Stable short code for a bundle, derived from its repository
///
/// The code doubles as the conventional name prefix for instances of the
/// bundle (`<bundle-code>-<instance-code>`).
pub fn bundle_code(repository: &str) -> String {
    let s = sha256_hex(repository);
    format!("bundle-{}", truncate(&s, CODE_LEN)).to_lowercase()
}

/// Extract the instance short code from an instance name
///
/// Instance names follow `<bundle>-<code>-<instance-code>[...]`; the third
/// dash-separated segment is the instance's short code.
pub fn instance_short_code(instance_name: &str) -> Result<&str, Error> {
    instance_name.split('-').nth(2).ok_or_else(|| {
        Error::validation(format!(
            "instance name {instance_name:?} must look like '<bundle-code>-<instance-code>'"
        ))
    })
}

/// Short identifier for a plugin within one instance
///
/// Changing the plugin's repository, its digest, or the owning instance's
/// short code - and only those - changes the id.
pub fn plugin_id(instance_code: &str, plugin: &PluginComponent) -> String {
    let full = format!(
        "{}@{}-{}",
        plugin.repository, plugin.digest, instance_code
    );
    truncate(&sha256_hex(&full), CODE_LEN).to_string()
}

/// Full name for the plugin CR derived from a component of an instance
///
/// Composed as `<bundle-name>-pn-<plugin-id>-<instance-name>`, lowercased.
pub fn plugin_code(instance_name: &str, plugin: &PluginComponent) -> Result<String, Error> {
    let code = instance_short_code(instance_name)?;
    let mut segments = instance_name.split('-');
    // Both segments exist because instance_short_code found a third one.
    let bundle_name = format!(
        "{}-{}",
        segments.next().unwrap_or_default(),
        segments.next().unwrap_or_default()
    );
    let id = plugin_id(code, plugin);
    Ok(format!(
        "{}-pn-{}-{}",
        bundle_name,
        id,
        truncate(instance_name, INSTANCE_NAME_LIMIT)
    )
    .to_lowercase())
}

/// Idempotency key for a raw manifest within one instance
///
/// Keyed on the instance's content digest plus the manifest's relative path,
/// so re-pinning the instance to new content re-applies every manifest.
pub fn manifest_id(instance_digest: &str, file_path: &str) -> String {
    let s = sha256_hex(&format!("{instance_digest}{file_path}"));
    truncate(&s, CODE_LEN).to_string()
}

/// Deployment name derived from a plugin CR name
pub fn deployment_name(owner: &str) -> String {
    format!("{}-deployment", truncate(owner, OWNER_NAME_LIMIT))
}

/// Container name derived from a plugin CR name
pub fn container_name(owner: &str) -> String {
    format!("{}-container", truncate(owner, OWNER_NAME_LIMIT))
}

/// Service name derived from a plugin CR name
pub fn service_name(owner: &str) -> String {
    format!("{}-service", truncate(owner, OWNER_NAME_LIMIT))
}

/// Named service port for a derived service
///
/// Digest-based so distinct services never share a port name on a merged
/// ingress backend.
pub fn service_port_name(service: &str) -> String {
    format!("{}-port", truncate(&sha256_hex(service), PORT_DIGEST_LEN))
}

/// Gateway CR name derived from a plugin CR name
pub fn gateway_name(owner: &str) -> String {
    format!("{}-gateway", truncate(owner, OWNER_NAME_LIMIT))
}

/// Fallback ingress name when a plugin does not request a shared one
pub fn default_ingress_name(owner: &str) -> String {
    format!("{}-ingress", truncate(owner, OWNER_NAME_LIMIT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plugin() -> PluginComponent {
        PluginComponent {
            repository: "registry.example.com/acme/catalog".to_string(),
            tag: Some("v1.0.0".to_string()),
            digest:
                "sha256:0f1e2d3c4b5a69788796a5b4c3d2e1f00112233445566778899aabbccddeeff0"
                    .to_string(),
            health_check_path: "/health".to_string(),
            port: 8080,
            ingress_name: None,
            ingress_host: "shop.example.com".to_string(),
            ingress_path: "/catalog".to_string(),
        }
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("docker.io/acme/shop-bundle"),
            "646b19502cc07ef18c5e153ee4536e8e3d8aa9bd3ab6edf152473e6f46033b99"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("0123456789", 8), "01234567");
        assert_eq!(truncate("0123", 8), "0123");
        assert_eq!(truncate("", 8), "");
        assert_eq!(truncate("01234567", 8), "01234567");
    }

    #[test]
    fn test_bundle_code() {
        assert_eq!(
            bundle_code("docker.io/acme/shop-bundle"),
            "bundle-646b1950"
        );
    }

    #[test]
    fn test_instance_short_code() {
        assert_eq!(
            instance_short_code("bundle-646b1950-inst01").unwrap(),
            "inst01"
        );
        assert!(instance_short_code("just-two").is_err());
        assert!(instance_short_code("solo").is_err());
    }

    #[test]
    fn test_plugin_id_known_vector() {
        // sha256("registry.example.com/acme/catalog@sha256:0f1e...ff0-inst01")
        assert_eq!(plugin_id("inst01", &sample_plugin()), "8e2aff92");
    }

    #[test]
    fn test_plugin_code_composition() {
        let code = plugin_code("bundle-646b1950-inst01", &sample_plugin()).unwrap();
        assert_eq!(code, "bundle-646b1950-pn-8e2aff92-bundle-646b1950-inst01");
    }

    #[test]
    fn test_manifest_id_known_vector() {
        let id = manifest_id(
            "sha256:0f1e2d3c4b5a69788796a5b4c3d2e1f00112233445566778899aabbccddeeff0",
            "/manifests/db-service.yaml",
        );
        assert_eq!(id, "accbc78c");
    }

    #[test]
    fn test_role_suffixed_names() {
        assert_eq!(deployment_name("my-plugin"), "my-plugin-deployment");
        assert_eq!(container_name("my-plugin"), "my-plugin-container");
        assert_eq!(service_name("my-plugin"), "my-plugin-service");
        assert_eq!(gateway_name("my-plugin"), "my-plugin-gateway");
        assert_eq!(default_ingress_name("my-plugin"), "my-plugin-ingress");
    }

    #[test]
    fn test_long_owner_names_are_truncated_before_suffix() {
        let long = "x".repeat(300);
        let name = deployment_name(&long);
        assert_eq!(name.len(), OWNER_NAME_LIMIT + "-deployment".len());
        assert!(name.ends_with("-deployment"));
    }

    #[test]
    fn test_service_port_name_fits_port_name_limit() {
        let port = service_port_name("my-plugin-service");
        // sha256("my-plugin-service") starts with 6dce91122
        assert_eq!(port, "6dce91122-port");
        assert!(port.len() <= 15, "kubernetes port names max out at 15");
    }

    // =========================================================================
    // Identity Stories
    // =========================================================================
    //
    // The naming scheme is the operator's idempotency memory: a reconcile asks
    // "does the derived resource exist" by computing its name, never by
    // scanning history.

    /// Story: identical inputs always produce identical names
    ///
    /// Name derivation must be a pure function of the inputs so that a
    /// restarted operator regenerates exactly the names it created before.
    #[test]
    fn story_naming_is_deterministic_across_calls() {
        let plugin = sample_plugin();
        let a = plugin_code("bundle-646b1950-inst01", &plugin).unwrap();
        let b = plugin_code("bundle-646b1950-inst01", &plugin).unwrap();
        assert_eq!(a, b);

        assert_eq!(
            manifest_id("sha256:abc", "/m/one.yaml"),
            manifest_id("sha256:abc", "/m/one.yaml")
        );
    }

    /// Story: changing any discriminating field changes the derived name
    ///
    /// Upgrading a plugin image (new digest) or installing the same bundle
    /// as a different instance must yield different derived names, so the
    /// old and new worlds never collide.
    #[test]
    fn story_discriminator_changes_change_the_name() {
        let plugin = sample_plugin();
        let mut upgraded = sample_plugin();
        upgraded.digest =
            "sha256:ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
                .to_string();

        assert_ne!(
            plugin_id("inst01", &plugin),
            plugin_id("inst01", &upgraded),
            "new digest must produce a new id"
        );
        assert_ne!(
            plugin_id("inst01", &plugin),
            plugin_id("inst02", &plugin),
            "different instance must produce a new id"
        );
        assert_ne!(
            manifest_id("sha256:abc", "/m/one.yaml"),
            manifest_id("sha256:def", "/m/one.yaml"),
            "re-pinned content must re-key manifests"
        );
    }

    /// Story: names stay lowercase and bounded for Kubernetes
    #[test]
    fn story_names_are_valid_kubernetes_names() {
        let mut plugin = sample_plugin();
        plugin.repository = "Registry.Example.COM/Acme/Catalog".to_string();
        let code = plugin_code("bundle-646b1950-inst01", &plugin).unwrap();
        assert_eq!(code, code.to_lowercase());
        assert!(code.len() <= 253);
    }
}
