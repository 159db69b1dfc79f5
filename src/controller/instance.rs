//! FreightInstance controller
//!
//! The instance controller unpacks the bundle content pinned by the instance
//! and drives every component to convergence in descriptor order. Plugin
//! components become FreightPlugin CRs driven through the staged state
//! machine; manifest components are applied once per content digest through
//! the raw manifest applier. A component that is not yet ready halts the
//! pass - later components are not touched until everything before them has
//! converged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::applier::ManifestApplier;
use crate::bundle::{
    read_descriptor, ComponentSpec, ContentProvider, PluginComponent,
};
use crate::conditions::{
    self, CONDITION_INSTANCE_READY, CONDITION_PLUGIN_READY, MSG_INSTANCE_READY,
    MSG_MANIFEST_APPLIED, MSG_PLUGIN_CR_APPLIED, MSG_PLUGIN_CR_READY, REASON_INSTANCE_READY,
    REASON_MANIFEST_APPLIED, REASON_PLUGIN_CR_APPLIED, REASON_PLUGIN_CR_READY,
};
use crate::controller::{EventPublisher, EventSeverity};
use crate::crd::{
    ConditionStatus, EnvVar, FreightInstance, FreightInstanceStatus, FreightPlugin,
    FreightPluginSpec,
};
use crate::identity;
use crate::stage::{
    advance, ChildResource, ConditionSeed, StageConditions, StageLedger, StageOutcome,
    REQUEUE_SLOW,
};
use crate::{Error, Result, FIELD_MANAGER};

/// Finalizer token for FreightInstance cleanup
pub const INSTANCE_FINALIZER: &str = "instance.freight.dev/finalizer";

/// Trait abstracting Kubernetes operations for FreightInstance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Patch the status subresource of an instance
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightInstanceStatus,
    ) -> Result<()>;

    /// Get a FreightPlugin by name, `None` when absent
    async fn get_plugin(&self, namespace: &str, name: &str) -> Result<Option<FreightPlugin>>;

    /// Create a FreightPlugin
    async fn create_plugin(&self, plugin: &FreightPlugin) -> Result<()>;

    /// Update a FreightPlugin (spec already replaced by the caller)
    async fn update_plugin(&self, plugin: &FreightPlugin) -> Result<()>;

    /// Add the instance finalizer
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the instance finalizer
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeInstanceClient {
    client: Client,
}

impl KubeInstanceClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn plugins(&self, namespace: &str) -> Api<FreightPlugin> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn instances(&self, namespace: &str) -> Api<FreightInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl InstanceClient for KubeInstanceClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightInstanceStatus,
    ) -> Result<()> {
        self.instances(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn get_plugin(&self, namespace: &str, name: &str) -> Result<Option<FreightPlugin>> {
        Ok(self.plugins(namespace).get_opt(name).await?)
    }

    async fn create_plugin(&self, plugin: &FreightPlugin) -> Result<()> {
        let namespace = plugin.namespace().unwrap_or_default();
        self.plugins(&namespace)
            .create(&PostParams::default(), plugin)
            .await?;
        Ok(())
    }

    async fn update_plugin(&self, plugin: &FreightPlugin) -> Result<()> {
        let namespace = plugin.namespace().unwrap_or_default();
        self.plugins(&namespace)
            .replace(&plugin.name_any(), &PostParams::default(), plugin)
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.instances(namespace);
        let instance = api.get(name).await?;
        let mut finalizers = instance.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == INSTANCE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(INSTANCE_FINALIZER.to_string());
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.instances(namespace);
        let instance = api.get(name).await?;
        let finalizers: Vec<String> = instance
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != INSTANCE_FINALIZER)
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

/// Controller context for FreightInstance reconciliation
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub client: Arc<dyn InstanceClient>,
    /// Bundle content collaborator
    pub content: Arc<dyn ContentProvider>,
    /// Raw manifest applier collaborator
    pub applier: Arc<dyn ManifestApplier>,
    /// Event publishing collaborator
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a production context from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(KubeInstanceClient::new(client.clone())),
            content: Arc::new(crate::bundle::CraneContentProvider::new()),
            applier: Arc::new(crate::applier::KubeManifestApplier::new(client.clone())),
            events: Arc::new(crate::controller::KubeEventPublisher::new(client)),
        }
    }

    /// Create a context with custom collaborators (primarily for tests)
    pub fn with_collaborators(
        client: Arc<dyn InstanceClient>,
        content: Arc<dyn ContentProvider>,
        applier: Arc<dyn ManifestApplier>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            content,
            applier,
            events,
        }
    }
}

/// The FreightPlugin CR derived from one plugin component, as a stage
struct PluginCrStage {
    instance: FreightInstance,
    plugin: PluginComponent,
    code: String,
    client: Arc<dyn InstanceClient>,
}

#[async_trait]
impl ChildResource for PluginCrStage {
    fn describe(&self) -> &'static str {
        "plugin cr"
    }

    fn conditions(&self) -> StageConditions {
        StageConditions {
            applied: ConditionSeed {
                type_: conditions::plugin_cr_applied(&self.code),
                reason: REASON_PLUGIN_CR_APPLIED,
                message: MSG_PLUGIN_CR_APPLIED.to_string(),
            },
            ready: ConditionSeed {
                type_: conditions::plugin_cr_ready(&self.code),
                reason: REASON_PLUGIN_CR_READY,
                message: MSG_PLUGIN_CR_READY.to_string(),
            },
        }
    }

    fn requeue_delay(&self) -> Duration {
        REQUEUE_SLOW
    }

    async fn apply(&self) -> Result<()> {
        let namespace = self.instance.namespace().unwrap_or_default();
        let desired = build_plugin(&self.instance, &self.plugin, &self.code);

        match self.client.get_plugin(&namespace, &self.code).await? {
            Some(mut existing) => {
                existing.spec = desired.spec;
                debug!(plugin = %self.code, "updating plugin cr");
                self.client.update_plugin(&existing).await
            }
            None => {
                debug!(plugin = %self.code, "creating plugin cr");
                self.client.create_plugin(&desired).await
            }
        }
    }

    async fn is_ready(&self) -> Result<bool> {
        let namespace = self.instance.namespace().unwrap_or_default();
        // Readiness of a plugin CR is the plugin's own aggregate Ready
        // condition at its current generation.
        Ok(self
            .client
            .get_plugin(&namespace, &self.code)
            .await?
            .map(|plugin| conditions::is_satisfied(&plugin, CONDITION_PLUGIN_READY))
            .unwrap_or(false))
    }
}

/// Build the desired FreightPlugin for one plugin component
fn build_plugin(
    instance: &FreightInstance,
    plugin: &PluginComponent,
    code: &str,
) -> FreightPlugin {
    FreightPlugin {
        metadata: ObjectMeta {
            name: Some(code.to_string()),
            namespace: instance.namespace(),
            owner_references: instance.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: FreightPluginSpec {
            image: format!("{}@{}", plugin.repository, plugin.digest),
            replicas: 1,
            port: plugin.port,
            health_check_path: plugin.health_check_path.clone(),
            environment_variables: Vec::<EnvVar>::new(),
            ingress_name: plugin.ingress_name.clone(),
            ingress_host: plugin.ingress_host.clone(),
            ingress_path: plugin.ingress_path.clone(),
        },
        status: None,
    }
}

/// Ledger view over the instance during staged sub-orchestrations
struct InstanceLedger<'a> {
    instance: &'a mut FreightInstance,
    client: &'a dyn InstanceClient,
}

#[async_trait]
impl StageLedger for InstanceLedger<'_> {
    fn is_satisfied(&self, type_: &str) -> bool {
        conditions::is_satisfied(self.instance, type_)
    }

    async fn record(&mut self, seed: &ConditionSeed) {
        record(
            self.instance,
            self.client,
            &seed.type_,
            ConditionStatus::True,
            seed.reason,
            &seed.message,
        )
        .await;
    }
}

/// Reconcile a FreightInstance resource
#[instrument(skip(instance, ctx), fields(instance = %instance.name_any()))]
pub async fn reconcile(instance: Arc<FreightInstance>, ctx: Arc<Context>) -> Result<Action> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    info!("reconciling instance");

    if instance.metadata.deletion_timestamp.is_some() {
        // Derived plugins are garbage-collected through owner references.
        ctx.client.remove_finalizer(&namespace, &name).await?;
        return Ok(Action::await_change());
    }

    if !instance.finalizers().iter().any(|f| f == INSTANCE_FINALIZER) {
        ctx.client.add_finalizer(&namespace, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut instance = (*instance).clone();

    if let Err(e) = instance.validate() {
        warn!(error = %e, "instance validation failed");
        record_instance_ready(&mut instance, ctx.as_ref(), ConditionStatus::False).await;
        return Ok(Action::await_change());
    }

    if conditions::is_satisfied(&instance, CONDITION_INSTANCE_READY) {
        debug!("instance already converged at this generation");
        return Ok(Action::await_change());
    }

    record_instance_ready(&mut instance, ctx.as_ref(), ConditionStatus::Unknown).await;

    // Components are never persisted: re-derive them from the pinned content
    // on every pass that needs them.
    let dir = match ctx
        .content
        .fetch(&instance.spec.repository, &instance.spec.digest)
        .await
    {
        Ok(dir) => dir,
        Err(e) => {
            warn!(error = %e, "bundle content retrieval failed");
            record_instance_ready(&mut instance, ctx.as_ref(), ConditionStatus::False).await;
            return Err(e);
        }
    };

    let descriptor = match read_descriptor(&dir) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(error = %e, "bundle descriptor unreadable");
            record_instance_ready(&mut instance, ctx.as_ref(), ConditionStatus::False).await;
            return Err(e);
        }
    };

    for component in &descriptor.components {
        debug!(component = %component.name, "reconciling component");
        let halted = match &component.spec {
            ComponentSpec::Plugin(plugin) => {
                manage_plugin(&mut instance, ctx.as_ref(), plugin.clone()).await?
            }
            ComponentSpec::Manifest(manifest) => {
                manage_manifest(&mut instance, ctx.as_ref(), &dir, &manifest.file_path).await?
            }
        };
        if let Some(action) = halted {
            // A not-ready component halts the pass; later components wait.
            record_instance_ready(&mut instance, ctx.as_ref(), ConditionStatus::False).await;
            return Ok(action);
        }
    }

    record_instance_ready(&mut instance, ctx.as_ref(), ConditionStatus::True).await;
    info!("instance converged");
    Ok(Action::await_change())
}

/// Drive one plugin component; `Some(action)` means the pass halts here
async fn manage_plugin(
    instance: &mut FreightInstance,
    ctx: &Context,
    plugin: PluginComponent,
) -> Result<Option<Action>> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();

    let code = match identity::plugin_code(&name, &plugin) {
        Ok(code) => code,
        Err(e) => {
            record_instance_ready(instance, ctx, ConditionStatus::False).await;
            return Err(e);
        }
    };

    let stage = PluginCrStage {
        instance: instance.clone(),
        plugin,
        code: code.clone(),
        client: ctx.client.clone(),
    };

    let reference = instance.object_ref(&());
    let outcome = {
        let mut ledger = InstanceLedger {
            instance,
            client: ctx.client.as_ref(),
        };
        advance(&stage, &mut ledger).await
    };

    match outcome {
        Ok(StageOutcome::Converged) => {
            ctx.events
                .publish(
                    &reference,
                    EventSeverity::Normal,
                    "Updated",
                    &format!("Updated plugin cr {namespace}/{code}"),
                )
                .await;
            Ok(None)
        }
        Ok(StageOutcome::Retry(delay)) => {
            info!(plugin = %code, delay = ?delay, "plugin cr not ready, rescheduling");
            ctx.events
                .publish(
                    &reference,
                    EventSeverity::Warning,
                    "NotReady",
                    &format!("Plugin cr not ready {namespace}/{code}"),
                )
                .await;
            Ok(Some(Action::requeue(delay)))
        }
        Err(e) => {
            warn!(plugin = %code, error = %e, "plugin cr apply failed");
            record_instance_ready(instance, ctx, ConditionStatus::False).await;
            Err(e)
        }
    }
}

/// Apply one manifest component if its idempotency key is unmet
async fn manage_manifest(
    instance: &mut FreightInstance,
    ctx: &Context,
    dir: &std::path::Path,
    file_path: &str,
) -> Result<Option<Action>> {
    let id = identity::manifest_id(&instance.spec.digest, file_path);
    let type_ = conditions::manifest_applied(&id);

    if conditions::is_satisfied(instance, &type_) {
        return Ok(None);
    }

    let namespace = instance.namespace().unwrap_or_default();
    let full_path = dir.join(file_path.trim_start_matches('/'));
    let raw = match tokio::fs::read_to_string(&full_path).await {
        Ok(raw) => raw,
        Err(e) => {
            record_instance_ready(instance, ctx, ConditionStatus::False).await;
            return Err(Error::content(format!(
                "reading manifest {}: {e}",
                full_path.display()
            )));
        }
    };

    if let Err(e) = ctx.applier.apply(&namespace, &raw).await {
        warn!(manifest = file_path, error = %e, "manifest apply failed");
        record_instance_ready(instance, ctx, ConditionStatus::False).await;
        return Err(e);
    }

    let message = format!("{MSG_MANIFEST_APPLIED} {file_path}");
    record(
        instance,
        ctx.client.as_ref(),
        &type_,
        ConditionStatus::True,
        REASON_MANIFEST_APPLIED,
        &message,
    )
    .await;
    Ok(None)
}

/// Record the aggregate instance readiness condition
async fn record_instance_ready(
    instance: &mut FreightInstance,
    ctx: &Context,
    status: ConditionStatus,
) {
    record(
        instance,
        ctx.client.as_ref(),
        CONDITION_INSTANCE_READY,
        status,
        REASON_INSTANCE_READY,
        MSG_INSTANCE_READY,
    )
    .await;
}

/// Record a condition and persist the status, logging write failures
async fn record(
    instance: &mut FreightInstance,
    client: &dyn InstanceClient,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    conditions::set_condition(instance, type_, status, reason, message);
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    if let Some(status) = &instance.status {
        if let Err(e) = client.patch_status(&namespace, &name, status).await {
            warn!(error = %e, condition = type_, "instance status update failed");
        }
    }
}

/// Error policy for the instance controller
pub fn error_policy(instance: Arc<FreightInstance>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        instance = %instance.name_any(),
        "instance reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
