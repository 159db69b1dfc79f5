//! Freight Operator - installs signed application bundles onto a cluster

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use freight::controller::{bundle, gateway, instance, plugin};
use freight::crd::{FreightBundle, FreightGateway, FreightInstance, FreightPlugin};
use freight::{DEFAULT_OPERATOR_MODE, FIELD_MANAGER, OPERATOR_MODE_ENV, WATCH_NAMESPACE_ENV};

/// Freight - Kubernetes operator for signed application bundles
#[derive(Parser, Debug)]
#[command(name = "freight", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    ///
    /// Watches FreightBundle, FreightInstance, FreightPlugin, and
    /// FreightGateway resources and reconciles each to its desired state.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [
            serde_yaml::to_string(&FreightBundle::crd())?,
            serde_yaml::to_string(&FreightInstance::crd())?,
            serde_yaml::to_string(&FreightPlugin::crd())?,
            serde_yaml::to_string(&FreightGateway::crd())?,
        ] {
            println!("---\n{crd}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controllers().await,
    }
}

/// Ensure all Freight CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply,
/// so the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        ("freightbundles.freight.dev", FreightBundle::crd()),
        ("freightinstances.freight.dev", FreightInstance::crd()),
        ("freightplugins.freight.dev", FreightPlugin::crd()),
        ("freightgateways.freight.dev", FreightGateway::crd()),
    ] {
        tracing::info!(crd = name, "installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {name}: {e}"))?;
    }

    tracing::info!("all Freight CRDs installed");
    Ok(())
}

/// Scope an Api to the watch namespace, or the whole cluster when unset
fn scoped_api<K>(client: &Client, watch_namespace: &str) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    if watch_namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), watch_namespace)
    }
}

/// Run all four controllers until shutdown
async fn run_controllers() -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    ensure_crds_installed(&client).await?;

    let watch_namespace = std::env::var(WATCH_NAMESPACE_ENV).unwrap_or_default();
    let operator_mode =
        std::env::var(OPERATOR_MODE_ENV).unwrap_or_else(|_| DEFAULT_OPERATOR_MODE.to_string());
    if watch_namespace.is_empty() {
        tracing::info!(mode = %operator_mode, "watching all namespaces");
    } else {
        tracing::info!(namespace = %watch_namespace, mode = %operator_mode, "watching single namespace");
    }

    let bundles: Api<FreightBundle> = scoped_api(&client, &watch_namespace);
    let instances: Api<FreightInstance> = scoped_api(&client, &watch_namespace);
    let plugins: Api<FreightPlugin> = scoped_api(&client, &watch_namespace);
    let gateways: Api<FreightGateway> = scoped_api(&client, &watch_namespace);

    let bundle_ctx = Arc::new(bundle::Context::new(client.clone()));
    let instance_ctx = Arc::new(instance::Context::new(client.clone()));
    let plugin_ctx = Arc::new(plugin::Context::new(client.clone()));
    let gateway_ctx = Arc::new(gateway::Context::new(client.clone()));

    tracing::info!("starting Freight controllers");

    let bundle_controller = Controller::new(bundles, WatcherConfig::default())
        .shutdown_on_signal()
        .run(bundle::reconcile, bundle::error_policy, bundle_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "bundle reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "bundle reconciliation error"),
            }
        });

    let instance_controller = Controller::new(instances, WatcherConfig::default())
        .shutdown_on_signal()
        .run(instance::reconcile, instance::error_policy, instance_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "instance reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "instance reconciliation error"),
            }
        });

    let plugin_controller = Controller::new(plugins, WatcherConfig::default())
        .shutdown_on_signal()
        .run(plugin::reconcile, plugin::error_policy, plugin_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "plugin reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "plugin reconciliation error"),
            }
        });

    let gateway_controller = Controller::new(gateways, WatcherConfig::default())
        .shutdown_on_signal()
        .run(gateway::reconcile, gateway::error_policy, gateway_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "gateway reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "gateway reconciliation error"),
            }
        });

    tokio::select! {
        _ = bundle_controller => tracing::info!("bundle controller completed"),
        _ = instance_controller => tracing::info!("instance controller completed"),
        _ = plugin_controller => tracing::info!("plugin controller completed"),
        _ = gateway_controller => tracing::info!("gateway controller completed"),
    }

    tracing::info!("Freight operator shutting down");
    Ok(())
}
