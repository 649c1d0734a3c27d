//! Core pipeline of the kbatch proxy: it turns a free-form workload
//! submission into a safe, namespaced Kubernetes resource graph and creates
//! that graph transactionally.
//!
//! The stations of the pipeline, in submission order:
//!
//! - [`merge`] folds the administrator's job template over the user payload.
//! - [`workload`] normalizes the free-form mapping into typed cluster objects.
//! - [`patch`] weaves in the user's identity, namespace, environment secret
//!   and code volume.
//! - [`submit`] creates the resulting Secret/ConfigMap/Job (or CronJob) set
//!   with owner references wired for cluster-side garbage collection.
//!
//! All cluster access goes through the [`client::ClusterClient`] trait so the
//! pipeline can be exercised against a mock cluster.

pub mod client;
pub mod kvp;
pub mod merge;
pub mod namespace;
pub mod patch;
pub mod submit;
pub mod workload;

// External re-exports
pub use k8s_openapi;
pub use kube;
