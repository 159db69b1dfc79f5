//! FreightPlugin controller
//!
//! The plugin controller materializes the workload for one plugin: a
//! Deployment, then a Service, then a FreightGateway CR, each driven through
//! the staged state machine and gated on the previous one being ready. The
//! plugin's aggregate `Ready` condition is what the owning instance watches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::conditions::{
    self, CONDITION_DEPLOY_APPLIED, CONDITION_DEPLOY_READY, CONDITION_GATEWAY_CR_APPLIED,
    CONDITION_GATEWAY_CR_READY, CONDITION_GATEWAY_READY, CONDITION_PLUGIN_READY,
    CONDITION_SERVICE_APPLIED, CONDITION_SERVICE_READY, MSG_PLUGIN_READY, REASON_PLUGIN_READY,
};
use crate::controller::{EventPublisher, EventSeverity};
use crate::crd::{
    ConditionStatus, FreightGateway, FreightGatewaySpec, FreightPlugin, FreightPluginStatus,
};
use crate::identity;
use crate::stage::{
    advance, ChildResource, ConditionSeed, StageConditions, StageLedger, StageOutcome,
    REQUEUE_FAST, REQUEUE_SLOW,
};
use crate::{Error, Result, FIELD_MANAGER};

/// Finalizer token for FreightPlugin cleanup
pub const PLUGIN_FINALIZER: &str = "plugin.freight.dev/finalizer";

/// Label key selecting a plugin's pods
pub const APP_LABEL: &str = "app";

/// Named container port the derived service targets
pub const SERVER_PORT_NAME: &str = "server-port";

/// Trait abstracting Kubernetes operations for FreightPlugin
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Patch the status subresource of a plugin
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightPluginStatus,
    ) -> Result<()>;

    /// Get a Deployment by name, `None` when absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Update a Deployment (spec already replaced by the caller)
    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Get a Service by name, `None` when absent
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<()>;

    /// Update a Service (spec already replaced by the caller)
    async fn update_service(&self, service: &Service) -> Result<()>;

    /// Get a FreightGateway by name, `None` when absent
    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<FreightGateway>>;

    /// Create a FreightGateway
    async fn create_gateway(&self, gateway: &FreightGateway) -> Result<()>;

    /// Update a FreightGateway (spec already replaced by the caller)
    async fn update_gateway(&self, gateway: &FreightGateway) -> Result<()>;

    /// Add the plugin finalizer
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the plugin finalizer
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubePluginClient {
    client: Client,
}

impl KubePluginClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PluginClient for KubePluginClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightPluginStatus,
    ) -> Result<()> {
        let api: Api<FreightPlugin> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let namespace = deployment.namespace().unwrap_or_default();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        let namespace = deployment.namespace().unwrap_or_default();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<()> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn update_service(&self, service: &Service) -> Result<()> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&service.name_any(), &PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<FreightGateway>> {
        let api: Api<FreightGateway> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_gateway(&self, gateway: &FreightGateway) -> Result<()> {
        let namespace = gateway.namespace().unwrap_or_default();
        let api: Api<FreightGateway> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), gateway).await?;
        Ok(())
    }

    async fn update_gateway(&self, gateway: &FreightGateway) -> Result<()> {
        let namespace = gateway.namespace().unwrap_or_default();
        let api: Api<FreightGateway> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&gateway.name_any(), &PostParams::default(), gateway)
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<FreightPlugin> = Api::namespaced(self.client.clone(), namespace);
        let plugin = api.get(name).await?;
        let mut finalizers = plugin.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == PLUGIN_FINALIZER) {
            return Ok(());
        }
        finalizers.push(PLUGIN_FINALIZER.to_string());
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<FreightPlugin> = Api::namespaced(self.client.clone(), namespace);
        let plugin = api.get(name).await?;
        let finalizers: Vec<String> = plugin
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != PLUGIN_FINALIZER)
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

/// Controller context for FreightPlugin reconciliation
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub client: Arc<dyn PluginClient>,
    /// Event publishing collaborator
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a production context from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(KubePluginClient::new(client.clone())),
            events: Arc::new(crate::controller::KubeEventPublisher::new(client)),
        }
    }

    /// Create a context with custom collaborators (primarily for tests)
    pub fn with_collaborators(
        client: Arc<dyn PluginClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { client, events }
    }
}

/// Selector labels for a plugin's pods
fn pod_labels(plugin: &FreightPlugin) -> BTreeMap<String, String> {
    BTreeMap::from([(
        APP_LABEL.to_string(),
        identity::container_name(&plugin.name_any()),
    )])
}

fn http_probe(plugin: &FreightPlugin, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(plugin.spec.health_check_path.clone()),
            port: IntOrString::Int(plugin.spec.port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        ..Default::default()
    }
}

/// Build the desired Deployment for a plugin
pub fn build_deployment(plugin: &FreightPlugin) -> Deployment {
    let name = plugin.name_any();
    let labels = pod_labels(plugin);

    Deployment {
        metadata: ObjectMeta {
            name: Some(identity::deployment_name(&name)),
            namespace: plugin.namespace(),
            owner_references: plugin.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(plugin.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("25%".to_string())),
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: identity::container_name(&name),
                        image: Some(plugin.spec.image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: plugin.spec.port,
                            name: Some(SERVER_PORT_NAME.to_string()),
                            ..Default::default()
                        }]),
                        env: if plugin.spec.environment_variables.is_empty() {
                            None
                        } else {
                            Some(
                                plugin
                                    .spec
                                    .environment_variables
                                    .iter()
                                    .map(|v| k8s_openapi::api::core::v1::EnvVar {
                                        name: v.name.clone(),
                                        value: Some(v.value.clone()),
                                        value_from: None,
                                    })
                                    .collect(),
                            )
                        },
                        readiness_probe: Some(http_probe(plugin, 10)),
                        liveness_probe: Some(http_probe(plugin, 10)),
                        startup_probe: Some(http_probe(plugin, 20)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the desired Service for a plugin
pub fn build_service(plugin: &FreightPlugin) -> Service {
    let name = plugin.name_any();
    let service_name = identity::service_name(&name);
    let port_name = identity::service_port_name(&service_name);

    Service {
        metadata: ObjectMeta {
            name: Some(service_name),
            namespace: plugin.namespace(),
            owner_references: plugin.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(port_name),
                port: plugin.spec.port,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::String(SERVER_PORT_NAME.to_string())),
                ..Default::default()
            }]),
            selector: Some(pod_labels(plugin)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the desired FreightGateway for a plugin
pub fn build_gateway(plugin: &FreightPlugin) -> FreightGateway {
    let name = plugin.name_any();
    let service_name = identity::service_name(&name);
    let ingress_name = plugin
        .spec
        .ingress_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| identity::default_ingress_name(&name));

    FreightGateway {
        metadata: ObjectMeta {
            name: Some(identity::gateway_name(&name)),
            namespace: plugin.namespace(),
            owner_references: plugin.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: FreightGatewaySpec {
            ingress_name,
            ingress_host: plugin.spec.ingress_host.clone(),
            ingress_path: plugin.spec.ingress_path.clone(),
            ingress_port: identity::service_port_name(&service_name),
            ingress_service: service_name,
        },
        status: None,
    }
}

/// The derived Deployment, as a stage
struct DeploymentStage {
    plugin: FreightPlugin,
    client: Arc<dyn PluginClient>,
}

#[async_trait]
impl ChildResource for DeploymentStage {
    fn describe(&self) -> &'static str {
        "deployment"
    }

    fn conditions(&self) -> StageConditions {
        StageConditions {
            applied: ConditionSeed {
                type_: CONDITION_DEPLOY_APPLIED.to_string(),
                reason: "DeployIsApplied",
                message: "Your deploy was applied".to_string(),
            },
            ready: ConditionSeed {
                type_: CONDITION_DEPLOY_READY.to_string(),
                reason: "DeployIsReady",
                message: "Your deploy is ready".to_string(),
            },
        }
    }

    fn requeue_delay(&self) -> Duration {
        REQUEUE_SLOW
    }

    async fn apply(&self) -> Result<()> {
        let namespace = self.plugin.namespace().unwrap_or_default();
        let desired = build_deployment(&self.plugin);
        let name = desired.name_any();

        match self.client.get_deployment(&namespace, &name).await? {
            Some(mut existing) => {
                existing.spec = desired.spec;
                self.client.update_deployment(&existing).await
            }
            None => self.client.create_deployment(&desired).await,
        }
    }

    async fn is_ready(&self) -> Result<bool> {
        let namespace = self.plugin.namespace().unwrap_or_default();
        let name = identity::deployment_name(&self.plugin.name_any());
        let available = self
            .client
            .get_deployment(&namespace, &name)
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.available_replicas)
            .unwrap_or(0);
        Ok(available >= self.plugin.spec.replicas)
    }
}

/// The derived Service, as a stage
struct ServiceStage {
    plugin: FreightPlugin,
    client: Arc<dyn PluginClient>,
}

#[async_trait]
impl ChildResource for ServiceStage {
    fn describe(&self) -> &'static str {
        "service"
    }

    fn conditions(&self) -> StageConditions {
        StageConditions {
            applied: ConditionSeed {
                type_: CONDITION_SERVICE_APPLIED.to_string(),
                reason: "ServiceIsApplied",
                message: "Your service was applied".to_string(),
            },
            ready: ConditionSeed {
                type_: CONDITION_SERVICE_READY.to_string(),
                reason: "ServiceIsReady",
                message: "Your service is ready".to_string(),
            },
        }
    }

    fn requeue_delay(&self) -> Duration {
        REQUEUE_FAST
    }

    async fn apply(&self) -> Result<()> {
        let namespace = self.plugin.namespace().unwrap_or_default();
        let desired = build_service(&self.plugin);
        let name = desired.name_any();

        match self.client.get_service(&namespace, &name).await? {
            Some(mut existing) => {
                existing.spec = desired.spec;
                self.client.update_service(&existing).await
            }
            None => self.client.create_service(&desired).await,
        }
    }

    async fn is_ready(&self) -> Result<bool> {
        let namespace = self.plugin.namespace().unwrap_or_default();
        let name = identity::service_name(&self.plugin.name_any());
        Ok(self
            .client
            .get_service(&namespace, &name)
            .await?
            .and_then(|s| s.spec)
            .and_then(|s| s.cluster_ip)
            .is_some_and(|ip| !ip.is_empty()))
    }
}

/// The derived FreightGateway CR, as a stage
struct GatewayCrStage {
    plugin: FreightPlugin,
    client: Arc<dyn PluginClient>,
}

#[async_trait]
impl ChildResource for GatewayCrStage {
    fn describe(&self) -> &'static str {
        "gateway cr"
    }

    fn conditions(&self) -> StageConditions {
        StageConditions {
            applied: ConditionSeed {
                type_: CONDITION_GATEWAY_CR_APPLIED.to_string(),
                reason: "GatewayCrIsApplied",
                message: "Your gateway cr was applied".to_string(),
            },
            ready: ConditionSeed {
                type_: CONDITION_GATEWAY_CR_READY.to_string(),
                reason: "GatewayCrIsReady",
                message: "Your gateway cr is ready".to_string(),
            },
        }
    }

    fn requeue_delay(&self) -> Duration {
        REQUEUE_SLOW
    }

    async fn apply(&self) -> Result<()> {
        let namespace = self.plugin.namespace().unwrap_or_default();
        let desired = build_gateway(&self.plugin);
        let name = desired.name_any();

        match self.client.get_gateway(&namespace, &name).await? {
            Some(mut existing) => {
                existing.spec = desired.spec;
                self.client.update_gateway(&existing).await
            }
            None => self.client.create_gateway(&desired).await,
        }
    }

    async fn is_ready(&self) -> Result<bool> {
        let namespace = self.plugin.namespace().unwrap_or_default();
        let name = identity::gateway_name(&self.plugin.name_any());
        // The gateway's own controller reports aggregate readiness on the
        // gateway CR; that condition at the gateway's current generation is
        // the probe.
        Ok(self
            .client
            .get_gateway(&namespace, &name)
            .await?
            .map(|gateway| conditions::is_satisfied(&gateway, CONDITION_GATEWAY_READY))
            .unwrap_or(false))
    }
}

/// Ledger view over the plugin during staged orchestration
struct PluginLedger<'a> {
    plugin: &'a mut FreightPlugin,
    client: &'a dyn PluginClient,
}

#[async_trait]
impl StageLedger for PluginLedger<'_> {
    fn is_satisfied(&self, type_: &str) -> bool {
        conditions::is_satisfied(self.plugin, type_)
    }

    async fn record(&mut self, seed: &ConditionSeed) {
        record(
            self.plugin,
            self.client,
            &seed.type_,
            ConditionStatus::True,
            seed.reason,
            &seed.message,
        )
        .await;
    }
}

/// Reconcile a FreightPlugin resource
#[instrument(skip(plugin, ctx), fields(plugin = %plugin.name_any()))]
pub async fn reconcile(plugin: Arc<FreightPlugin>, ctx: Arc<Context>) -> Result<Action> {
    let name = plugin.name_any();
    let namespace = plugin.namespace().unwrap_or_default();
    info!("reconciling plugin");

    if plugin.metadata.deletion_timestamp.is_some() {
        // Derived resources are garbage-collected through owner references.
        ctx.client.remove_finalizer(&namespace, &name).await?;
        return Ok(Action::await_change());
    }

    if !plugin.finalizers().iter().any(|f| f == PLUGIN_FINALIZER) {
        ctx.client.add_finalizer(&namespace, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut plugin = (*plugin).clone();

    if conditions::is_satisfied(&plugin, CONDITION_PLUGIN_READY) {
        debug!("plugin already converged at this generation");
        return Ok(Action::await_change());
    }

    record_plugin_ready(&mut plugin, ctx.as_ref(), ConditionStatus::Unknown).await;

    let reference = plugin.object_ref(&());
    let stages: [Box<dyn ChildResource>; 3] = [
        Box::new(DeploymentStage {
            plugin: plugin.clone(),
            client: ctx.client.clone(),
        }),
        Box::new(ServiceStage {
            plugin: plugin.clone(),
            client: ctx.client.clone(),
        }),
        Box::new(GatewayCrStage {
            plugin: plugin.clone(),
            client: ctx.client.clone(),
        }),
    ];

    for stage in &stages {
        let outcome = {
            let mut ledger = PluginLedger {
                plugin: &mut plugin,
                client: ctx.client.as_ref(),
            };
            advance(stage.as_ref(), &mut ledger).await
        };

        match outcome {
            Ok(StageOutcome::Converged) => {
                ctx.events
                    .publish(
                        &reference,
                        EventSeverity::Normal,
                        "Updated",
                        &format!("Updated {} {namespace}/{name}", stage.describe()),
                    )
                    .await;
            }
            Ok(StageOutcome::Retry(delay)) => {
                info!(stage = stage.describe(), delay = ?delay, "not ready, rescheduling");
                ctx.events
                    .publish(
                        &reference,
                        EventSeverity::Warning,
                        "NotReady",
                        &format!("Plugin {} not ready {namespace}/{name}", stage.describe()),
                    )
                    .await;
                record_plugin_ready(&mut plugin, ctx.as_ref(), ConditionStatus::False).await;
                return Ok(Action::requeue(delay));
            }
            Err(e) => {
                warn!(stage = stage.describe(), error = %e, "stage failed");
                record_plugin_ready(&mut plugin, ctx.as_ref(), ConditionStatus::False).await;
                return Err(e);
            }
        }
    }

    ctx.events
        .publish(
            &reference,
            EventSeverity::Normal,
            "Done",
            &format!("Plugin deployed {namespace}/{name}"),
        )
        .await;
    record_plugin_ready(&mut plugin, ctx.as_ref(), ConditionStatus::True).await;
    info!("plugin converged");
    Ok(Action::await_change())
}

/// Record the aggregate plugin readiness condition
async fn record_plugin_ready(plugin: &mut FreightPlugin, ctx: &Context, status: ConditionStatus) {
    record(
        plugin,
        ctx.client.as_ref(),
        CONDITION_PLUGIN_READY,
        status,
        REASON_PLUGIN_READY,
        MSG_PLUGIN_READY,
    )
    .await;
}

/// Record a condition and persist the status, logging write failures
async fn record(
    plugin: &mut FreightPlugin,
    client: &dyn PluginClient,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    conditions::set_condition(plugin, type_, status, reason, message);
    let name = plugin.name_any();
    let namespace = plugin.namespace().unwrap_or_default();
    if let Some(status) = &plugin.status {
        if let Err(e) = client.patch_status(&namespace, &name, status).await {
            warn!(error = %e, condition = type_, "plugin status update failed");
        }
    }
}

/// Error policy for the plugin controller
pub fn error_policy(plugin: Arc<FreightPlugin>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        plugin = %plugin.name_any(),
        "plugin reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockEventPublisher;
    use crate::crd::FreightPluginSpec;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use std::sync::Mutex;

    const PLUGIN_NAME: &str = "bundle-646b1950-pn-8e2aff92-bundle-646b1950-inst01";

    fn sample_plugin() -> FreightPlugin {
        FreightPlugin {
            metadata: ObjectMeta {
                name: Some(PLUGIN_NAME.to_string()),
                namespace: Some("default".to_string()),
                generation: Some(1),
                finalizers: Some(vec![PLUGIN_FINALIZER.to_string()]),
                uid: Some("7c3d9f00-aaaa-bbbb-cccc-ddddeeeeffff".to_string()),
                ..Default::default()
            },
            spec: FreightPluginSpec {
                image: "registry.example.com/acme/catalog@sha256:abc".to_string(),
                replicas: 1,
                port: 8080,
                health_check_path: "/health".to_string(),
                environment_variables: Vec::new(),
                ingress_name: None,
                ingress_host: "shop.example.com".to_string(),
                ingress_path: "/catalog".to_string(),
            },
            status: None,
        }
    }

    fn available_deployment(name: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(DeploymentStatus {
                available_replicas: Some(1),
                ..Default::default()
            }),
        }
    }

    fn backed_service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.17".to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn ready_gateway(name: &str) -> FreightGateway {
        let mut gateway = FreightGateway {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: FreightGatewaySpec::default(),
            status: None,
        };
        conditions::set_condition(
            &mut gateway,
            CONDITION_GATEWAY_READY,
            ConditionStatus::True,
            "GatewayIsReady",
            "Your gateway is ready",
        );
        gateway
    }

    fn quiet_events() -> MockEventPublisher {
        let mut events = MockEventPublisher::new();
        events.expect_publish().returning(|_, _, _, _| ());
        events
    }

    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<FreightPluginStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: FreightPluginStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn last_condition(&self, type_: &str) -> Option<ConditionStatus> {
            self.updates.lock().unwrap().iter().rev().find_map(|s| {
                s.conditions
                    .iter()
                    .find(|c| c.type_ == type_)
                    .map(|c| c.status.clone())
            })
        }
    }

    fn capturing_client(capture: &StatusCapture) -> MockPluginClient {
        let capture = capture.clone();
        let mut client = MockPluginClient::new();
        client.expect_patch_status().returning(move |_, _, status| {
            capture.record(status.clone());
            Ok(())
        });
        client
    }

    // =========================================================================
    // Builder tests
    // =========================================================================

    #[test]
    fn test_build_deployment_shape() {
        let plugin = sample_plugin();
        let deployment = build_deployment(&plugin);

        assert_eq!(
            deployment.name_any(),
            format!("{PLUGIN_NAME}-deployment")
        );
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, format!("{PLUGIN_NAME}-container"));
        assert_eq!(
            container.image.as_deref(),
            Some("registry.example.com/acme/catalog@sha256:abc")
        );
        assert_eq!(
            container.ports.as_ref().unwrap()[0].name.as_deref(),
            Some(SERVER_PORT_NAME)
        );
        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.http_get.as_ref().unwrap().path.as_deref(),
            Some("/health")
        );
        assert_eq!(probe.initial_delay_seconds, Some(10));
        assert_eq!(
            container
                .startup_probe
                .as_ref()
                .unwrap()
                .initial_delay_seconds,
            Some(20)
        );
    }

    #[test]
    fn test_build_deployment_carries_owner_reference() {
        let deployment = build_deployment(&sample_plugin());
        let refs = deployment.metadata.owner_references.unwrap();
        assert_eq!(refs[0].kind, "FreightPlugin");
        assert_eq!(refs[0].name, PLUGIN_NAME);
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn test_build_service_shape() {
        let service = build_service(&sample_plugin());
        assert_eq!(service.name_any(), format!("{PLUGIN_NAME}-service"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 8080);
        // sha256("<plugin>-service") prefix; see identity tests.
        assert_eq!(port.name.as_deref(), Some("bc299e1c4-port"));
        assert_eq!(
            port.target_port,
            Some(IntOrString::String(SERVER_PORT_NAME.to_string()))
        );
        assert_eq!(
            spec.selector.unwrap().get(APP_LABEL).unwrap(),
            &format!("{PLUGIN_NAME}-container")
        );
    }

    #[test]
    fn test_build_gateway_defaults_ingress_name() {
        let gateway = build_gateway(&sample_plugin());
        assert_eq!(gateway.name_any(), format!("{PLUGIN_NAME}-gateway"));
        assert_eq!(
            gateway.spec.ingress_name,
            format!("{PLUGIN_NAME}-ingress")
        );
        assert_eq!(gateway.spec.ingress_service, format!("{PLUGIN_NAME}-service"));
        assert_eq!(gateway.spec.ingress_port, "bc299e1c4-port");
        assert_eq!(gateway.spec.ingress_host, "shop.example.com");
    }

    #[test]
    fn test_build_gateway_honors_shared_ingress_name() {
        let mut plugin = sample_plugin();
        plugin.spec.ingress_name = Some("shared-edge".to_string());
        let gateway = build_gateway(&plugin);
        assert_eq!(gateway.spec.ingress_name, "shared-edge");
    }

    // =========================================================================
    // Reconcile stories
    // =========================================================================

    /// Story: a plugin converges through deployment, service, and gateway
    ///
    /// Against an empty store, one pass creates exactly one deployment, one
    /// service, and one gateway CR, each under its deterministic name, and
    /// ends with the aggregate Ready condition True.
    #[tokio::test]
    async fn story_plugin_chain_converges() {
        let capture = StatusCapture::default();
        let mut client = capturing_client(&capture);

        let deploy_lookups = Arc::new(Mutex::new(0u32));
        client.expect_get_deployment().returning(move |_, name| {
            assert_eq!(name, format!("{PLUGIN_NAME}-deployment"));
            let mut count = deploy_lookups.lock().unwrap();
            *count += 1;
            if *count == 1 {
                Ok(None)
            } else {
                Ok(Some(available_deployment(name)))
            }
        });
        client
            .expect_create_deployment()
            .times(1)
            .returning(|_| Ok(()));
        client.expect_update_deployment().times(0);

        let service_lookups = Arc::new(Mutex::new(0u32));
        client.expect_get_service().returning(move |_, name| {
            assert_eq!(name, format!("{PLUGIN_NAME}-service"));
            let mut count = service_lookups.lock().unwrap();
            *count += 1;
            if *count == 1 {
                Ok(None)
            } else {
                Ok(Some(backed_service(name)))
            }
        });
        client.expect_create_service().times(1).returning(|_| Ok(()));
        client.expect_update_service().times(0);

        let gateway_lookups = Arc::new(Mutex::new(0u32));
        client.expect_get_gateway().returning(move |_, name| {
            assert_eq!(name, format!("{PLUGIN_NAME}-gateway"));
            let mut count = gateway_lookups.lock().unwrap();
            *count += 1;
            if *count == 1 {
                Ok(None)
            } else {
                Ok(Some(ready_gateway(name)))
            }
        });
        client.expect_create_gateway().times(1).returning(|_| Ok(()));
        client.expect_update_gateway().times(0);

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(quiet_events()),
        ));

        let action = reconcile(Arc::new(sample_plugin()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(
            capture.last_condition(CONDITION_PLUGIN_READY),
            Some(ConditionStatus::True)
        );
        assert_eq!(
            capture.last_condition(CONDITION_DEPLOY_APPLIED),
            Some(ConditionStatus::True)
        );
        assert_eq!(
            capture.last_condition(CONDITION_GATEWAY_CR_READY),
            Some(ConditionStatus::True)
        );
    }

    /// Story: an unavailable deployment halts the chain before the service
    #[tokio::test]
    async fn story_unready_deployment_halts_chain() {
        let capture = StatusCapture::default();
        let mut client = capturing_client(&capture);

        client.expect_get_deployment().returning(|_, _| Ok(None));
        client
            .expect_create_deployment()
            .times(1)
            .returning(|_| Ok(()));
        client.expect_get_service().times(0);
        client.expect_create_service().times(0);
        client.expect_get_gateway().times(0);

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(quiet_events()),
        ));

        let action = reconcile(Arc::new(sample_plugin()), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(
            capture.last_condition(CONDITION_PLUGIN_READY),
            Some(ConditionStatus::False)
        );
    }

    /// Story: the service stage polls on the shorter cadence
    #[tokio::test]
    async fn story_service_stage_requeues_fast() {
        let capture = StatusCapture::default();
        let mut client = capturing_client(&capture);

        // Deployment stage already satisfied on the ledger.
        let mut plugin = sample_plugin();
        conditions::set_condition(
            &mut plugin,
            CONDITION_DEPLOY_APPLIED,
            ConditionStatus::True,
            "DeployIsApplied",
            "Your deploy was applied",
        );
        conditions::set_condition(
            &mut plugin,
            CONDITION_DEPLOY_READY,
            ConditionStatus::True,
            "DeployIsReady",
            "Your deploy is ready",
        );

        // Service exists but has no cluster IP assigned yet.
        client.expect_get_service().returning(|_, name| {
            Ok(Some(Service {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                spec: Some(ServiceSpec::default()),
                status: None,
            }))
        });
        client.expect_update_service().times(1).returning(|_| Ok(()));
        client.expect_create_service().times(0);
        client.expect_get_deployment().times(0);
        client.expect_get_gateway().times(0);

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(quiet_events()),
        ));

        let action = reconcile(Arc::new(plugin), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    /// Story: a converged plugin re-reconciles without touching the store
    #[tokio::test]
    async fn story_converged_plugin_is_a_no_op() {
        let mut plugin = sample_plugin();
        conditions::set_condition(
            &mut plugin,
            CONDITION_PLUGIN_READY,
            ConditionStatus::True,
            REASON_PLUGIN_READY,
            MSG_PLUGIN_READY,
        );

        let client = MockPluginClient::new();
        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(MockEventPublisher::new()),
        ));

        let action = reconcile(Arc::new(plugin), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a store failure during apply aborts the pass
    ///
    /// Errors other than not-found are fatal to the reconcile; the aggregate
    /// condition goes False and the error escapes for backoff retry.
    #[tokio::test]
    async fn story_store_error_aborts_with_false_ready() {
        let capture = StatusCapture::default();
        let mut client = capturing_client(&capture);

        client.expect_get_deployment().returning(|_, _| {
            Err(Error::validation("store unavailable"))
        });

        let ctx = Arc::new(Context::with_collaborators(
            Arc::new(client),
            Arc::new(quiet_events()),
        ));

        let err = reconcile(Arc::new(sample_plugin()), ctx).await.unwrap_err();
        assert!(err.to_string().contains("store unavailable"));
        assert_eq!(
            capture.last_condition(CONDITION_PLUGIN_READY),
            Some(ConditionStatus::False)
        );
    }
}
