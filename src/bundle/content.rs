//! Bundle content retrieval
//!
//! Bundles are distributed as container images; the content provider pulls
//! an image by repository and digest and unpacks its flattened filesystem
//! into a local scratch directory where the descriptor and manifest files
//! can be read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Timeout for the image export subprocess
const EXPORT_TIMEOUT: Duration = Duration::from_secs(300);

/// Provides unpacked bundle content for a pinned digest
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Fetch and unpack the content at `repository@digest`
    ///
    /// Returns a local directory containing the bundle filesystem, including
    /// its descriptor. Unreachable registries, corrupt archives, and missing
    /// descriptors all surface as [`Error::Content`].
    async fn fetch(&self, repository: &str, digest: &str) -> Result<PathBuf>;
}

/// Content provider backed by the `crane` CLI
///
/// `crane export` flattens the image to a single tarball, which is then
/// unpacked into a per-digest scratch directory under the system temp dir.
/// The directory is keyed by digest, so repeated reconciles of the same
/// content reuse the unpack path without re-racing each other's files.
pub struct CraneContentProvider {
    timeout: Duration,
}

impl CraneContentProvider {
    /// Create a provider with the default export timeout
    pub fn new() -> Self {
        Self {
            timeout: EXPORT_TIMEOUT,
        }
    }

    /// Scratch directory for one digest's unpacked content
    fn scratch_dir(digest: &str) -> PathBuf {
        let safe = digest.replace([':', '/'], "-");
        std::env::temp_dir().join(format!("freight-bundle-{safe}"))
    }
}

impl Default for CraneContentProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentProvider for CraneContentProvider {
    async fn fetch(&self, repository: &str, digest: &str) -> Result<PathBuf> {
        let image = format!("{repository}@{digest}");
        let dir = Self::scratch_dir(digest);

        // Stale content from a previous crash is discarded rather than trusted.
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| Error::content(format!("cleaning {}: {e}", dir.display())))?;
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::content(format!("creating {}: {e}", dir.display())))?;

        let tar_path = dir.with_extension("tar");
        info!(image = %image, "exporting bundle content");

        let mut cmd = Command::new("crane");
        cmd.arg("export").arg(&image).arg(&tar_path);
        run_with_timeout(cmd, self.timeout, &format!("crane export {image}")).await?;

        let unpack_dir = dir.clone();
        let unpack_tar = tar_path.clone();
        tokio::task::spawn_blocking(move || unpack(&unpack_tar, &unpack_dir))
            .await
            .map_err(|e| Error::content(format!("unpack task failed: {e}")))??;

        if let Err(e) = std::fs::remove_file(&tar_path) {
            debug!(path = %tar_path.display(), error = %e, "could not remove export tarball");
        }

        Ok(dir)
    }
}

/// Unpack an exported image tarball into a directory
fn unpack(tar_path: &Path, dir: &Path) -> Result<()> {
    let file = std::fs::File::open(tar_path)
        .map_err(|e| Error::content(format!("opening {}: {e}", tar_path.display())))?;
    let mut archive = tar::Archive::new(file);
    archive
        .unpack(dir)
        .map_err(|e| Error::content(format!("unpacking {}: {e}", tar_path.display())))
}

/// Run a subprocess with a timeout, mapping every failure mode to one error
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    description: &str,
) -> Result<()> {
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| Error::content(format!("{description}: timed out after {timeout:?}")))?
        .map_err(|e| Error::content(format!("{description}: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::content(format!(
            "{description}: exit {:?}: {}",
            output.status.code(),
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_dir_is_stable_per_digest() {
        let a = CraneContentProvider::scratch_dir("sha256:abc");
        let b = CraneContentProvider::scratch_dir("sha256:abc");
        assert_eq!(a, b);
        assert_ne!(a, CraneContentProvider::scratch_dir("sha256:def"));
    }

    #[test]
    fn test_scratch_dir_sanitizes_digest() {
        let dir = CraneContentProvider::scratch_dir("sha256:abc");
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!name.contains(':'));
        assert_eq!(name, "freight-bundle-sha256-abc");
    }

    /// Story: a missing binary surfaces as a content error
    #[tokio::test]
    async fn story_missing_subprocess_is_a_content_error() {
        let cmd = Command::new("freight-no-such-binary");
        let err = run_with_timeout(cmd, Duration::from_secs(1), "export")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("content error"));
    }

    /// Story: a failing subprocess carries its stderr in the error
    #[tokio::test]
    async fn story_subprocess_failure_carries_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken registry >&2; exit 3");
        let err = run_with_timeout(cmd, Duration::from_secs(5), "crane export img")
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken registry"));
        assert!(msg.contains("crane export img"));
    }

    #[tokio::test]
    async fn test_successful_subprocess_is_ok() {
        let cmd = Command::new("true");
        assert!(run_with_timeout(cmd, Duration::from_secs(5), "noop")
            .await
            .is_ok());
    }
}
