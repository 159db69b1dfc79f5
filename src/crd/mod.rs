//! Custom Resource Definitions for Freight
//!
//! Four resources form the installation chain: a [`FreightBundle`] describes a
//! published, signed bundle; a [`FreightInstance`] pins one installation of it
//! at a digest; a [`FreightPlugin`] is derived per plugin component; and a
//! [`FreightGateway`] carries the ingress routing for one plugin.

mod bundle;
mod gateway;
mod instance;
mod plugin;
mod types;

pub use bundle::{FreightBundle, FreightBundleSpec, FreightBundleStatus};
pub use gateway::{FreightGateway, FreightGatewaySpec, FreightGatewayStatus};
pub use instance::{FreightInstance, FreightInstanceSpec, FreightInstanceStatus};
pub use plugin::{EnvVar, FreightPlugin, FreightPluginSpec, FreightPluginStatus};
pub use types::{BundleTag, Condition, ConditionStatus, SignatureInfo, SignatureType};
