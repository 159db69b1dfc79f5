//! FreightBundle controller
//!
//! The bundle controller gates installation behind signature verification:
//! it derives the bundle's short code, verifies every signature declared on
//! every tag, and only then marks the bundle ready. Instances of a bundle
//! that never reaches `SignatureVerified` have nothing trustworthy to
//! install.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::bundle::SignatureVerifier;
use crate::conditions::{
    self, CONDITION_BUNDLE_READY, CONDITION_SIGNATURE_VERIFIED, MSG_BUNDLE_READY,
    MSG_SIGNATURE_VERIFIED, REASON_BUNDLE_READY, REASON_SIGNATURE_VERIFIED,
};
use crate::crd::{ConditionStatus, FreightBundle, FreightBundleStatus};
use crate::identity;
use crate::{Error, Result, FIELD_MANAGER};

/// Finalizer token for FreightBundle cleanup
pub const BUNDLE_FINALIZER: &str = "bundle.freight.dev/finalizer";

/// Annotation carrying the generated bundle code
pub const BUNDLE_CODE_ANNOTATION: &str = "freight.dev/bundle-code";

/// Trait abstracting Kubernetes operations for FreightBundle
///
/// Allows mocking the Kubernetes client in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleClient: Send + Sync {
    /// Patch the status subresource of a bundle
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightBundleStatus,
    ) -> Result<()>;

    /// Merge annotations into a bundle's metadata
    async fn merge_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Add the bundle finalizer
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the bundle finalizer
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeBundleClient {
    client: Client,
}

impl KubeBundleClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BundleClient for KubeBundleClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightBundleStatus,
    ) -> Result<()> {
        let api: Api<FreightBundle> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn merge_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<FreightBundle> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "annotations": annotations } })),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<FreightBundle> = Api::namespaced(self.client.clone(), namespace);
        let bundle = api.get(name).await?;
        let mut finalizers = bundle.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == BUNDLE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(BUNDLE_FINALIZER.to_string());
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<FreightBundle> = Api::namespaced(self.client.clone(), namespace);
        let bundle = api.get(name).await?;
        let finalizers: Vec<String> = bundle
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != BUNDLE_FINALIZER)
            .collect();
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
        Ok(())
    }
}

/// Controller context for FreightBundle reconciliation
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub client: Arc<dyn BundleClient>,
    /// Signature verification collaborator
    pub verifier: Arc<dyn SignatureVerifier>,
}

impl Context {
    /// Create a production context from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(KubeBundleClient::new(client)),
            verifier: Arc::new(crate::bundle::CosignVerifier::new()),
        }
    }

    /// Create a context with custom collaborators (primarily for tests)
    pub fn with_collaborators(
        client: Arc<dyn BundleClient>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self { client, verifier }
    }
}

/// Reconcile a FreightBundle resource
#[instrument(skip(bundle, ctx), fields(bundle = %bundle.name_any()))]
pub async fn reconcile(bundle: Arc<FreightBundle>, ctx: Arc<Context>) -> Result<Action> {
    let name = bundle.name_any();
    let namespace = bundle.namespace().unwrap_or_default();
    info!("reconciling bundle");

    if bundle.metadata.deletion_timestamp.is_some() {
        ctx.client.remove_finalizer(&namespace, &name).await?;
        return Ok(Action::await_change());
    }

    if !bundle.finalizers().iter().any(|f| f == BUNDLE_FINALIZER) {
        ctx.client.add_finalizer(&namespace, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut bundle = (*bundle).clone();

    if let Err(e) = bundle.spec.validate() {
        warn!(error = %e, "bundle validation failed");
        record(
            &mut bundle,
            &ctx,
            CONDITION_BUNDLE_READY,
            ConditionStatus::False,
        )
        .await;
        // A spec change is required; no point requeueing.
        return Ok(Action::await_change());
    }

    if conditions::is_satisfied(&bundle, CONDITION_BUNDLE_READY) {
        debug!("bundle already converged at this generation");
        return Ok(Action::await_change());
    }

    record(
        &mut bundle,
        &ctx,
        CONDITION_BUNDLE_READY,
        ConditionStatus::Unknown,
    )
    .await;

    // Persist the bundle code so instances and tooling can reference it.
    let code = identity::bundle_code(&bundle.spec.repository);
    if bundle.annotations().get(BUNDLE_CODE_ANNOTATION) != Some(&code) {
        info!(code = %code, "recording bundle code");
        let mut annotations = BTreeMap::new();
        annotations.insert(BUNDLE_CODE_ANNOTATION.to_string(), code);
        ctx.client
            .merge_annotations(&namespace, &name, annotations)
            .await?;
    }

    match verify_signatures(&bundle, ctx.as_ref()).await {
        Ok(verified) => {
            if let Err(e) = ctx
                .client
                .merge_annotations(&namespace, &name, verified)
                .await
            {
                warn!(error = %e, "could not save verified signature annotations");
            }
            record(
                &mut bundle,
                &ctx,
                CONDITION_SIGNATURE_VERIFIED,
                ConditionStatus::True,
            )
            .await;
            record(
                &mut bundle,
                &ctx,
                CONDITION_BUNDLE_READY,
                ConditionStatus::True,
            )
            .await;
            info!("bundle converged");
            Ok(Action::await_change())
        }
        Err(e) => {
            warn!(error = %e, "bundle signature verification failed");
            record(
                &mut bundle,
                &ctx,
                CONDITION_BUNDLE_READY,
                ConditionStatus::False,
            )
            .await;
            Err(e)
        }
    }
}

/// Verify every signature on every tag of the bundle
///
/// Returns the `signature-<digest>` annotations to record for verified tags.
/// A tag without signature info, or any failing verification, fails the
/// whole gate.
async fn verify_signatures(
    bundle: &FreightBundle,
    ctx: &Context,
) -> Result<BTreeMap<String, String>> {
    let mut verified = BTreeMap::new();
    for tag in &bundle.spec.tag_list {
        if tag.signature_info.is_empty() {
            return Err(Error::signature(format!(
                "tag {:?} has no signature info",
                tag.tag
            )));
        }
        let image_ref = format!("{}@{}", bundle.spec.repository, tag.digest);
        for signature in &tag.signature_info {
            ctx.verifier
                .verify(&image_ref, &signature.pub_key_secret)
                .await
                .map_err(|e| {
                    Error::signature(format!("tag {:?} failed verification: {e}", tag.tag))
                })?;
        }
        let digest_hex = tag.digest.split(':').nth(1).unwrap_or(&tag.digest);
        let key = identity::truncate(
            &format!("signature-{digest_hex}"),
            identity::ANNOTATION_KEY_LIMIT,
        )
        .to_string();
        verified.insert(key, "Verified".to_string());
    }
    Ok(verified)
}

/// Record a bundle condition and persist the status, logging write failures
async fn record(
    bundle: &mut FreightBundle,
    ctx: &Context,
    type_: &str,
    status: ConditionStatus,
) {
    let (reason, message) = match type_ {
        CONDITION_SIGNATURE_VERIFIED => (REASON_SIGNATURE_VERIFIED, MSG_SIGNATURE_VERIFIED),
        _ => (REASON_BUNDLE_READY, MSG_BUNDLE_READY),
    };
    conditions::set_condition(bundle, type_, status, reason, message);

    let name = bundle.name_any();
    let namespace = bundle.namespace().unwrap_or_default();
    if let Some(status) = &bundle.status {
        if let Err(e) = ctx.client.patch_status(&namespace, &name, status).await {
            warn!(error = %e, condition = type_, "bundle status update failed");
        }
    }
}

/// Error policy for the bundle controller
pub fn error_policy(bundle: Arc<FreightBundle>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        bundle = %bundle.name_any(),
        "bundle reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::MockSignatureVerifier;
    use crate::crd::{BundleTag, FreightBundleSpec, SignatureInfo, SignatureType};
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    /// Captured status updates for verification without coupling to mock
    /// call parameters.
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<FreightBundleStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: FreightBundleStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn last_condition(&self, type_: &str) -> Option<ConditionStatus> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find_map(|s| {
                    s.conditions
                        .iter()
                        .find(|c| c.type_ == type_)
                        .map(|c| c.status.clone())
                })
        }

        fn ever_recorded(&self, type_: &str, status: ConditionStatus) -> bool {
            self.updates.lock().unwrap().iter().any(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == type_ && c.status == status)
            })
        }
    }

    fn sample_bundle(signature_info: Vec<SignatureInfo>) -> FreightBundle {
        FreightBundle {
            metadata: ObjectMeta {
                name: Some("shop".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(1),
                finalizers: Some(vec![BUNDLE_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: FreightBundleSpec {
                title: None,
                icon: None,
                repository: "docker.io/acme/shop-bundle".to_string(),
                tag_list: vec![BundleTag {
                    tag: "v1.0.0".to_string(),
                    digest: "sha256:abc".to_string(),
                    signature_info,
                }],
            },
            status: None,
        }
    }

    fn key_pair_signature() -> SignatureInfo {
        SignatureInfo {
            type_: SignatureType::KeyPair,
            pub_key: None,
            pub_key_secret: "k8s://freight-system/shop-key".to_string(),
        }
    }

    fn capturing_client(capture: &StatusCapture) -> MockBundleClient {
        let capture = capture.clone();
        let mut client = MockBundleClient::new();
        client.expect_patch_status().returning(move |_, _, status| {
            capture.record(status.clone());
            Ok(())
        });
        client
    }

    /// Story: a fully signed bundle converges to ready
    ///
    /// The controller records the bundle code, verifies the tag signature,
    /// stores the verification annotation, and sets SignatureVerified then
    /// BundleReady.
    #[tokio::test]
    async fn story_signed_bundle_becomes_ready() {
        let capture = StatusCapture::default();
        let mut client = capturing_client(&capture);
        let annotations: Arc<Mutex<Vec<BTreeMap<String, String>>>> = Arc::default();
        let seen = annotations.clone();
        client
            .expect_merge_annotations()
            .returning(move |_, _, map| {
                seen.lock().unwrap().push(map);
                Ok(())
            });

        let mut verifier = MockSignatureVerifier::new();
        verifier
            .expect_verify()
            .withf(|image, key| {
                image == "docker.io/acme/shop-bundle@sha256:abc"
                    && key == "k8s://freight-system/shop-key"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(verifier),
        ));
        let bundle = Arc::new(sample_bundle(vec![key_pair_signature()]));

        let action = reconcile(bundle, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        assert_eq!(
            capture.last_condition(CONDITION_SIGNATURE_VERIFIED),
            Some(ConditionStatus::True)
        );
        assert_eq!(
            capture.last_condition(CONDITION_BUNDLE_READY),
            Some(ConditionStatus::True)
        );

        let recorded = annotations.lock().unwrap();
        assert!(recorded
            .iter()
            .any(|m| m.get(BUNDLE_CODE_ANNOTATION) == Some(&"bundle-646b1950".to_string())));
        assert!(recorded
            .iter()
            .any(|m| m.get("signature-abc") == Some(&"Verified".to_string())));
    }

    /// Story: a tag without signature info never verifies
    ///
    /// BundleReady goes False and SignatureVerified is never set True; the
    /// error escapes so the runtime retries with backoff.
    #[tokio::test]
    async fn story_missing_signature_info_fails_bundle() {
        let capture = StatusCapture::default();
        let mut client = capturing_client(&capture);
        client.expect_merge_annotations().returning(|_, _, _| Ok(()));

        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().times(0);

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(verifier),
        ));
        let bundle = Arc::new(sample_bundle(vec![]));

        let err = reconcile(bundle, ctx).await.unwrap_err();
        assert!(err.to_string().contains("no signature info"));

        assert_eq!(
            capture.last_condition(CONDITION_BUNDLE_READY),
            Some(ConditionStatus::False)
        );
        assert!(
            !capture.ever_recorded(CONDITION_SIGNATURE_VERIFIED, ConditionStatus::True),
            "SignatureVerified must never be set True"
        );
    }

    /// Story: an unresolvable key fails verification and the bundle
    #[tokio::test]
    async fn story_failed_verification_fails_bundle() {
        let capture = StatusCapture::default();
        let mut client = capturing_client(&capture);
        client.expect_merge_annotations().returning(|_, _, _| Ok(()));

        let mut verifier = MockSignatureVerifier::new();
        verifier
            .expect_verify()
            .returning(|_, _| Err(Error::signature("key secret not found")));

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(verifier),
        ));
        let bundle = Arc::new(sample_bundle(vec![key_pair_signature()]));

        let err = reconcile(bundle, ctx).await.unwrap_err();
        assert!(err.to_string().contains("failed verification"));
        assert_eq!(
            capture.last_condition(CONDITION_BUNDLE_READY),
            Some(ConditionStatus::False)
        );
        assert!(!capture.ever_recorded(CONDITION_SIGNATURE_VERIFIED, ConditionStatus::True));
    }

    /// Story: a converged bundle does nothing on re-reconcile
    #[tokio::test]
    async fn story_converged_bundle_is_a_no_op() {
        let mut bundle = sample_bundle(vec![key_pair_signature()]);
        conditions::set_condition(
            &mut bundle,
            CONDITION_BUNDLE_READY,
            ConditionStatus::True,
            REASON_BUNDLE_READY,
            MSG_BUNDLE_READY,
        );

        // No client or verifier calls expected at all.
        let client = MockBundleClient::new();
        let verifier = MockSignatureVerifier::new();
        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(verifier),
        ));

        let action = reconcile(Arc::new(bundle), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: the finalizer is added before any work happens
    #[tokio::test]
    async fn story_finalizer_added_first() {
        let mut bundle = sample_bundle(vec![key_pair_signature()]);
        bundle.metadata.finalizers = None;

        let mut client = MockBundleClient::new();
        client
            .expect_add_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        let verifier = MockSignatureVerifier::new();

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(verifier),
        ));

        let action = reconcile(Arc::new(bundle), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    /// Story: deletion removes the finalizer and nothing else
    #[tokio::test]
    async fn story_deletion_removes_finalizer() {
        let mut bundle = sample_bundle(vec![key_pair_signature()]);
        bundle.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));

        let mut client = MockBundleClient::new();
        client
            .expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        let verifier = MockSignatureVerifier::new();

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(verifier),
        ));

        let action = reconcile(Arc::new(bundle), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }
}
