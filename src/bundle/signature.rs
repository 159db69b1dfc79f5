//! Bundle signature verification
//!
//! Before a bundle becomes installable, every tag it declares must carry at
//! least one signature and every signature must verify against its key. The
//! verifier itself is an external collaborator behind a trait so controllers
//! can be exercised without a registry.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

use super::content::run_with_timeout;
use crate::{Error, Result};

/// Timeout for one signature verification
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Verifies one image signature against a key reference
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Verify the signature of `image_ref` against `key_ref`
    ///
    /// `key_ref` follows cosign conventions (e.g. `k8s://ns/secret-name`).
    async fn verify(&self, image_ref: &str, key_ref: &str) -> Result<()>;
}

/// Signature verifier backed by the `cosign` CLI
pub struct CosignVerifier {
    timeout: Duration,
}

impl CosignVerifier {
    /// Create a verifier with the default timeout
    pub fn new() -> Self {
        Self {
            timeout: VERIFY_TIMEOUT,
        }
    }
}

impl Default for CosignVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignatureVerifier for CosignVerifier {
    async fn verify(&self, image_ref: &str, key_ref: &str) -> Result<()> {
        let mut cmd = Command::new("cosign");
        cmd.arg("verify")
            .arg("--key")
            .arg(key_ref)
            .arg("--insecure-ignore-tlog=true")
            .arg(image_ref);

        run_with_timeout(cmd, self.timeout, &format!("cosign verify {image_ref}"))
            .await
            .map_err(|e| Error::signature(e.to_string()))
    }
}
