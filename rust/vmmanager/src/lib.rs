//! VM lifecycle controller.
//!
//! Mediates between the lab front-end and the cloud provider: consumes
//! provisioning and decommissioning intents from two durable queues,
//! reconciles them against the per-user VM cache, drives the cloud
//! operations with bounded retries, and expires abandoned VMs on a timer.
//!
//! The crate is organized around two capability boundaries, [`store::Store`]
//! for queues/cache and [`cloud::CloudDriver`] for the provider, with the
//! control plane ([`provisioner`], [`decommissioner`], [`reconciler`],
//! [`dispatcher`]) written purely against those traits.

pub mod cloud;
pub mod config;
pub mod decommissioner;
pub mod dispatcher;
pub mod domain;
pub mod logging;
pub mod provisioner;
pub mod rate_limit;
pub mod reconciler;
pub mod store;

pub use config::AppConfig;
pub use decommissioner::Decommissioner;
pub use dispatcher::Dispatcher;
pub use provisioner::Provisioner;
pub use reconciler::ExpiryReconciler;
