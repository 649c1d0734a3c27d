//! Transactional creation of a submitted resource group.
//!
//! A group is created in a fixed order: the user's namespace is ensured,
//! then the env Secret, then the optional code ConfigMap, then the Job or
//! CronJob itself, and finally the Secret/ConfigMap get an owner reference
//! pointing at the workload so cluster-side garbage collection tears the
//! whole group down with it. A phase failure rolls back the resources
//! created so far with best-effort deletes and surfaces the original error.

use std::{sync::Arc, time::Duration};

use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    client::{ClusterClient, Error as ClusterError, NamespaceOutcome},
    namespace::is_valid_namespace_name,
    patch,
    workload::{ResourceKind, Workload},
};

/// Compensating deletes run to completion even when the request that
/// triggered them is gone, but never longer than this.
const COMPENSATION_BUDGET: Duration = Duration::from_secs(5);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{namespace:?} is not a legal namespace name"))]
    IllegalNamespace { namespace: String },

    #[snafu(display("failed to ensure namespace {namespace:?}"))]
    EnsureNamespace {
        source: ClusterError,
        namespace: String,
    },

    #[snafu(display("failed to create the environment secret"))]
    CreateSecret { source: ClusterError },

    #[snafu(display("failed to create the code config map"))]
    CreateConfigMap { source: ClusterError },

    #[snafu(display("failed to create the {kind}"))]
    CreateWorkload {
        source: ClusterError,
        kind: ResourceKind,
    },

    #[snafu(display("the cluster did not report a name for the created {resource}"))]
    MissingAssignedName { resource: &'static str },

    #[snafu(display("failed to rewire the workload after creation"))]
    Rewire { source: patch::Error },
}

impl Error {
    /// The underlying cluster error, when a cluster call caused the failure.
    pub fn cluster_source(&self) -> Option<&ClusterError> {
        match self {
            Error::EnsureNamespace { source, .. }
            | Error::CreateSecret { source }
            | Error::CreateConfigMap { source }
            | Error::CreateWorkload { source, .. } => Some(source),
            Error::IllegalNamespace { .. }
            | Error::MissingAssignedName { .. }
            | Error::Rewire { .. } => None,
        }
    }
}

/// One patched resource group, ready for creation.
pub struct Submission {
    pub workload: Workload,
    pub secret: Secret,
    pub config_map: Option<ConfigMap>,
    pub namespace: String,
}

/// Creates resource groups against a [`ClusterClient`].
#[derive(Clone)]
pub struct Submitter {
    client: Arc<dyn ClusterClient>,
    create_user_namespace: bool,
}

impl Submitter {
    pub fn new(client: Arc<dyn ClusterClient>, create_user_namespace: bool) -> Self {
        Self {
            client,
            create_user_namespace,
        }
    }

    /// Runs the phases in order and returns the created workload as the
    /// cluster reported it (server-assigned name, uid, and all).
    pub async fn submit(&self, submission: Submission) -> Result<Workload> {
        let Submission {
            mut workload,
            secret,
            config_map,
            namespace,
        } = submission;
        let kind = workload.kind();

        // the identity mapping guarantees a legal name; a failure here means
        // the derivation was bypassed or corrupted, so create nothing
        ensure!(
            is_valid_namespace_name(&namespace),
            IllegalNamespaceSnafu {
                namespace: namespace.clone(),
            }
        );

        if self.create_user_namespace {
            info!(%namespace, "ensuring namespace");
            let outcome = self
                .client
                .ensure_namespace(&namespace)
                .await
                .context(EnsureNamespaceSnafu {
                    namespace: namespace.clone(),
                })?;
            if outcome == NamespaceOutcome::Created {
                info!(%namespace, "created namespace");
            }
        }

        // Phase 2: the Secret must exist before the workload so its assigned
        // name can replace the placeholder in every secretKeyRef.
        let placeholder = secret.metadata.generate_name.clone().unwrap_or_default();
        info!("submitting environment secret");
        let created_secret = self
            .client
            .create_secret(&namespace, secret)
            .await
            .context(CreateSecretSnafu)?;
        let secret_name =
            created_secret
                .metadata
                .name
                .clone()
                .context(MissingAssignedNameSnafu {
                    resource: "Secret",
                })?;
        if let Some(job_spec) = workload.job_spec_mut() {
            patch::set_env_secret_name(job_spec, &placeholder, &secret_name);
        }

        // Phase 3: same ordering constraint for the code ConfigMap.
        let config_map_name = match config_map {
            Some(config_map) => {
                info!("submitting code config map");
                let created = match self.client.create_config_map(&namespace, config_map).await {
                    Ok(created) => created,
                    Err(source) => {
                        self.compensate(&namespace, Some(secret_name), None).await;
                        return Err(Error::CreateConfigMap { source });
                    }
                };
                let name = created
                    .metadata
                    .name
                    .clone()
                    .context(MissingAssignedNameSnafu {
                        resource: "ConfigMap",
                    })?;
                let job_spec = workload.job_spec_mut().ok_or(Error::Rewire {
                    source: patch::Error::NoCodeVolume,
                })?;
                patch::set_code_config_map_name(job_spec, &name).context(RewireSnafu)?;
                Some(name)
            }
            None => None,
        };

        // Phase 4: the workload itself.
        info!(%kind, "submitting workload");
        let created = match &workload {
            Workload::Job(job) => self
                .client
                .create_job(&namespace, job.clone())
                .await
                .map(Workload::Job),
            Workload::CronJob(cron_job) => self
                .client
                .create_cron_job(&namespace, cron_job.clone())
                .await
                .map(Workload::CronJob),
        };
        let created = match created {
            Ok(created) => created,
            Err(source) => {
                self.compensate(&namespace, Some(secret_name), config_map_name)
                    .await;
                return Err(Error::CreateWorkload { source, kind });
            }
        };

        // Phase 5: owner back-patches; failures leave orphans for the
        // administrator's cleanup but never fail the request.
        self.patch_owners(&namespace, &created, &secret_name, config_map_name.as_deref())
            .await;

        Ok(created)
    }

    async fn patch_owners(
        &self,
        namespace: &str,
        owner: &Workload,
        secret_name: &str,
        config_map_name: Option<&str>,
    ) {
        let Some(reference) = owner_reference(owner) else {
            warn!("created workload reports no name or uid, skipping owner back-patch");
            return;
        };
        let owner_patch = json!({"metadata": {"ownerReferences": [reference]}});

        if let Err(error) = self
            .client
            .patch_secret(namespace, secret_name, owner_patch.clone())
            .await
        {
            warn!(%error, secret = secret_name, "failed to back-patch the secret owner");
        }
        if let Some(name) = config_map_name {
            info!(config_map = name, "patching config map owner");
            if let Err(error) = self
                .client
                .patch_config_map(namespace, name, owner_patch)
                .await
            {
                warn!(%error, config_map = name, "failed to back-patch the config map owner");
            }
        }
    }

    /// Deletes the resources an aborted submission left behind. The deletes
    /// run on a detached task so a dropped request cannot interrupt them,
    /// bounded by [`COMPENSATION_BUDGET`].
    async fn compensate(
        &self,
        namespace: &str,
        secret_name: Option<String>,
        config_map_name: Option<String>,
    ) {
        let client = Arc::clone(&self.client);
        let namespace = namespace.to_owned();
        let cleanup = tokio::spawn(async move {
            if let Some(name) = secret_name {
                warn!(secret = name.as_str(), "rolling back environment secret");
                if let Err(error) = client.delete_secret(&namespace, &name).await {
                    warn!(%error, secret = name.as_str(), "compensating secret delete failed");
                }
            }
            if let Some(name) = config_map_name {
                warn!(config_map = name.as_str(), "rolling back code config map");
                if let Err(error) = client.delete_config_map(&namespace, &name).await {
                    warn!(%error, config_map = name.as_str(), "compensating config map delete failed");
                }
            }
        });
        if timeout(COMPENSATION_BUDGET, cleanup).await.is_err() {
            warn!("compensating deletes exceeded their budget, leaving residue to cluster cleanup");
        }
    }
}

fn owner_reference(workload: &Workload) -> Option<OwnerReference> {
    let metadata = workload.metadata();
    Some(OwnerReference {
        api_version: "batch/v1".to_owned(),
        kind: workload.kind().to_string(),
        name: metadata.name.clone()?,
        uid: metadata.uid.clone()?,
        ..Default::default()
    })
}
