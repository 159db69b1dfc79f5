//! FreightGateway controller
//!
//! The gateway controller materializes the Ingress for one plugin's routing
//! facts. Several gateways may share one ingress object; applying merges
//! this gateway's host/path route into whatever is already there instead of
//! clobbering other routes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::conditions::{
    self, CONDITION_GATEWAY_READY, CONDITION_INGRESS_APPLIED, CONDITION_INGRESS_READY,
    MSG_GATEWAY_READY, REASON_GATEWAY_READY,
};
use crate::controller::{EventPublisher, EventSeverity};
use crate::crd::{ConditionStatus, FreightGateway, FreightGatewayStatus};
use crate::stage::{
    advance, ChildResource, ConditionSeed, StageConditions, StageLedger, StageOutcome,
    REQUEUE_SLOW,
};
use crate::{Error, Result, FIELD_MANAGER};

/// Finalizer token for FreightGateway cleanup
pub const GATEWAY_FINALIZER: &str = "gateway.freight.dev/finalizer";

/// Trait abstracting Kubernetes operations for FreightGateway
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Patch the status subresource of a gateway
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightGatewayStatus,
    ) -> Result<()>;

    /// Get an Ingress by name, `None` when absent
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>>;

    /// Create an Ingress
    async fn create_ingress(&self, ingress: &Ingress) -> Result<()>;

    /// Update an Ingress (rules already merged by the caller)
    async fn update_ingress(&self, ingress: &Ingress) -> Result<()>;

    /// Add the gateway finalizer
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the gateway finalizer
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeGatewayClient {
    client: Client,
}

impl KubeGatewayClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GatewayClient for KubeGatewayClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FreightGatewayStatus,
    ) -> Result<()> {
        let api: Api<FreightGateway> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<()> {
        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), ingress).await?;
        Ok(())
    }

    async fn update_ingress(&self, ingress: &Ingress) -> Result<()> {
        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&ingress.name_any(), &PostParams::default(), ingress)
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<FreightGateway> = Api::namespaced(self.client.clone(), namespace);
        let gateway = api.get(name).await?;
        let mut finalizers = gateway.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == GATEWAY_FINALIZER) {
            return Ok(());
        }
        finalizers.push(GATEWAY_FINALIZER.to_string());
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<FreightGateway> = Api::namespaced(self.client.clone(), namespace);
        let gateway = api.get(name).await?;
        let finalizers: Vec<String> = gateway
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != GATEWAY_FINALIZER)
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

/// Controller context for FreightGateway reconciliation
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub client: Arc<dyn GatewayClient>,
    /// Event publishing collaborator
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a production context from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(KubeGatewayClient::new(client.clone())),
            events: Arc::new(crate::controller::KubeEventPublisher::new(client)),
        }
    }

    /// Create a context with custom collaborators (primarily for tests)
    pub fn with_collaborators(
        client: Arc<dyn GatewayClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { client, events }
    }
}

/// Build the desired route for a gateway as a single-rule ingress
pub fn build_ingress(gateway: &FreightGateway) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(gateway.spec.ingress_name.clone()),
            namespace: gateway.namespace(),
            owner_references: gateway.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![build_rule(gateway)]),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_rule(gateway: &FreightGateway) -> IngressRule {
    IngressRule {
        host: Some(gateway.spec.ingress_host.clone()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![build_path(gateway)],
        }),
    }
}

fn build_path(gateway: &FreightGateway) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(gateway.spec.ingress_path.clone()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: gateway.spec.ingress_service.clone(),
                port: Some(ServiceBackendPort {
                    name: Some(gateway.spec.ingress_port.clone()),
                    number: None,
                }),
            }),
            resource: None,
        },
    }
}

/// Merge this gateway's route into an existing shared ingress
///
/// Same host and path: the backend is replaced. Same host, new path: the
/// path is appended to the host's rule. New host: a whole rule is appended.
/// Routes owned by other gateways are left untouched.
pub fn merge_route(ingress: &mut Ingress, gateway: &FreightGateway) {
    let spec = ingress.spec.get_or_insert_with(Default::default);
    let rules = spec.rules.get_or_insert_with(Vec::new);

    let host = &gateway.spec.ingress_host;
    let path = &gateway.spec.ingress_path;

    if let Some(rule) = rules.iter_mut().find(|r| r.host.as_deref() == Some(host)) {
        let http = rule.http.get_or_insert_with(|| HTTPIngressRuleValue {
            paths: Vec::new(),
        });
        if let Some(existing) = http
            .paths
            .iter_mut()
            .find(|p| p.path.as_deref() == Some(path))
        {
            existing.backend = build_path(gateway).backend;
            existing.path_type = "Prefix".to_string();
        } else {
            http.paths.push(build_path(gateway));
        }
    } else {
        rules.push(build_rule(gateway));
    }
}

/// The derived Ingress, as a stage
struct IngressStage {
    gateway: FreightGateway,
    client: Arc<dyn GatewayClient>,
}

#[async_trait]
impl ChildResource for IngressStage {
    fn describe(&self) -> &'static str {
        "ingress"
    }

    fn conditions(&self) -> StageConditions {
        StageConditions {
            applied: ConditionSeed {
                type_: CONDITION_INGRESS_APPLIED.to_string(),
                reason: "IngressIsApplied",
                message: "Your ingress was applied".to_string(),
            },
            ready: ConditionSeed {
                type_: CONDITION_INGRESS_READY.to_string(),
                reason: "IngressIsReady",
                message: "Your ingress is ready".to_string(),
            },
        }
    }

    fn requeue_delay(&self) -> Duration {
        REQUEUE_SLOW
    }

    async fn apply(&self) -> Result<()> {
        let namespace = self.gateway.namespace().unwrap_or_default();
        let name = &self.gateway.spec.ingress_name;

        match self.client.get_ingress(&namespace, name).await? {
            Some(mut existing) => {
                merge_route(&mut existing, &self.gateway);
                debug!(ingress = %name, "merging route into existing ingress");
                self.client.update_ingress(&existing).await
            }
            None => {
                debug!(ingress = %name, "creating ingress");
                self.client.create_ingress(&build_ingress(&self.gateway)).await
            }
        }
    }

    async fn is_ready(&self) -> Result<bool> {
        let namespace = self.gateway.namespace().unwrap_or_default();
        let name = &self.gateway.spec.ingress_name;
        // Ready once the ingress controller has published an address.
        Ok(self
            .client
            .get_ingress(&namespace, name)
            .await?
            .and_then(|i| i.status)
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .map(|endpoints| !endpoints.is_empty())
            .unwrap_or(false))
    }
}

/// Ledger view over the gateway during staged orchestration
struct GatewayLedger<'a> {
    gateway: &'a mut FreightGateway,
    client: &'a dyn GatewayClient,
}

#[async_trait]
impl StageLedger for GatewayLedger<'_> {
    fn is_satisfied(&self, type_: &str) -> bool {
        conditions::is_satisfied(self.gateway, type_)
    }

    async fn record(&mut self, seed: &ConditionSeed) {
        record(
            self.gateway,
            self.client,
            &seed.type_,
            ConditionStatus::True,
            seed.reason,
            &seed.message,
        )
        .await;
    }
}

/// Reconcile a FreightGateway resource
#[instrument(skip(gateway, ctx), fields(gateway = %gateway.name_any()))]
pub async fn reconcile(gateway: Arc<FreightGateway>, ctx: Arc<Context>) -> Result<Action> {
    let name = gateway.name_any();
    let namespace = gateway.namespace().unwrap_or_default();
    info!("reconciling gateway");

    if gateway.metadata.deletion_timestamp.is_some() {
        ctx.client.remove_finalizer(&namespace, &name).await?;
        return Ok(Action::await_change());
    }

    if !gateway.finalizers().iter().any(|f| f == GATEWAY_FINALIZER) {
        ctx.client.add_finalizer(&namespace, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut gateway = (*gateway).clone();

    if conditions::is_satisfied(&gateway, CONDITION_GATEWAY_READY) {
        debug!("gateway already converged at this generation");
        return Ok(Action::await_change());
    }

    record_gateway_ready(&mut gateway, ctx.as_ref(), ConditionStatus::Unknown).await;

    let reference = gateway.object_ref(&());
    let stage = IngressStage {
        gateway: gateway.clone(),
        client: ctx.client.clone(),
    };

    let outcome = {
        let mut ledger = GatewayLedger {
            gateway: &mut gateway,
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
                    "Done",
                    &format!("Gateway ingress deployed {namespace}/{name}"),
                )
                .await;
            record_gateway_ready(&mut gateway, ctx.as_ref(), ConditionStatus::True).await;
            info!("gateway converged");
            Ok(Action::await_change())
        }
        Ok(StageOutcome::Retry(delay)) => {
            info!(delay = ?delay, "ingress not ready, rescheduling");
            ctx.events
                .publish(
                    &reference,
                    EventSeverity::Warning,
                    "NotReady",
                    &format!("Gateway ingress not ready {namespace}/{name}"),
                )
                .await;
            record_gateway_ready(&mut gateway, ctx.as_ref(), ConditionStatus::False).await;
            Ok(Action::requeue(delay))
        }
        Err(e) => {
            warn!(error = %e, "ingress stage failed");
            record_gateway_ready(&mut gateway, ctx.as_ref(), ConditionStatus::False).await;
            Err(e)
        }
    }
}

/// Record the aggregate gateway readiness condition
async fn record_gateway_ready(
    gateway: &mut FreightGateway,
    ctx: &Context,
    status: ConditionStatus,
) {
    record(
        gateway,
        ctx.client.as_ref(),
        CONDITION_GATEWAY_READY,
        status,
        REASON_GATEWAY_READY,
        MSG_GATEWAY_READY,
    )
    .await;
}

/// Record a condition and persist the status, logging write failures
async fn record(
    gateway: &mut FreightGateway,
    client: &dyn GatewayClient,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    conditions::set_condition(gateway, type_, status, reason, message);
    let name = gateway.name_any();
    let namespace = gateway.namespace().unwrap_or_default();
    if let Some(status) = &gateway.status {
        if let Err(e) = client.patch_status(&namespace, &name, status).await {
            warn!(error = %e, condition = type_, "gateway status update failed");
        }
    }
}

/// Error policy for the gateway controller
pub fn error_policy(gateway: Arc<FreightGateway>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        gateway = %gateway.name_any(),
        "gateway reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
