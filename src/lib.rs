//! Freight - Kubernetes operator that installs signed application bundles
//!
//! Freight drives a chain of custom resources from a published bundle down to
//! running workloads. A `FreightBundle` describes a signed, published bundle;
//! a `FreightInstance` pins one installation of it at a digest; each plugin
//! component of the bundle becomes a `FreightPlugin` whose controller derives
//! a Deployment, a Service, and a `FreightGateway`; the gateway controller in
//! turn derives an Ingress.
//!
//! Reconciliation is level-triggered and idempotent: every controller records
//! per-stage conditions (with the observed generation) on its resource status
//! and re-derives desired state from the latest spec on every pass, so a
//! crashed or repeated reconcile never double-applies work.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (FreightBundle, FreightInstance, ...)
//! - [`conditions`] - the condition ledger: per-stage apply/ready bookkeeping
//! - [`identity`] - deterministic names for derived resources
//! - [`stage`] - the staged apply / check-ready / advance state machine
//! - [`bundle`] - bundle descriptor model, content fetching, signature checks
//! - [`applier`] - raw manifest application via API discovery
//! - [`controller`] - reconciliation logic for all four custom resources
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod applier;
pub mod bundle;
pub mod conditions;
pub mod controller;
pub mod crd;
pub mod error;
pub mod identity;
pub mod stage;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for all server-side apply patches
pub const FIELD_MANAGER: &str = "freight-controller";

/// API group for all Freight custom resources
pub const API_GROUP: &str = "freight.dev";

/// Environment variable selecting the namespace to watch
///
/// An empty or unset value means the operator runs with cluster scope.
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

/// Environment variable selecting the operator deployment mode
pub const OPERATOR_MODE_ENV: &str = "OPERATOR_MODE";

/// Default operator deployment mode when [`OPERATOR_MODE_ENV`] is unset
pub const DEFAULT_OPERATOR_MODE: &str = "standard";
