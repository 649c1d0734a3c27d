//! Abstract cluster access for the submission pipeline.
//!
//! The pipeline only ever talks to the cluster through [`ClusterClient`], so
//! tests drive it against a recording mock while production wires in
//! [`KubeClusterClient`], a thin typed wrapper over [`kube::Client`].

use async_trait::async_trait;
use either::Either;
use futures::{AsyncBufReadExt, StreamExt, stream::BoxStream};
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        batch::v1::{CronJob, Job},
        core::v1::{ConfigMap, Namespace, Pod, Secret},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    Api,
    api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    core::{ErrorResponse, ObjectList},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A lazily produced sequence of log lines; dropping it cancels the relay.
pub type LogStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster API returned status {status}: {message}"))]
    Api { status: u16, message: String },

    #[snafu(display("cluster API request failed"))]
    Transport { source: kube::Error },

    #[snafu(display("log stream failed"))]
    Stream { source: std::io::Error },

    #[snafu(display("failed to serialize the cluster response"))]
    SerializeResponse { source: serde_json::Error },
}

impl Error {
    /// The numeric status the cluster tagged the failure with, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn from_kube(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(status) => {
                let ErrorResponse { code, message, .. } = *status;
                Error::Api {
                    status: code,
                    message,
                }
            }
            source => Error::Transport { source },
        }
    }
}

/// Whether [`ClusterClient::ensure_namespace`] had to create the namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceOutcome {
    Created,
    Existed,
}

/// The cluster operations the submission pipeline and the HTTP surface
/// consume. Everything is scoped to an explicit namespace; no call touches
/// cluster-wide state beyond namespace creation itself.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceOutcome>;

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
    async fn patch_secret(&self, namespace: &str, name: &str, patch: Value) -> Result<()>;

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
    async fn patch_config_map(&self, namespace: &str, name: &str, patch: Value) -> Result<()>;

    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job>;
    async fn read_job(&self, namespace: &str, name: &str) -> Result<Job>;
    async fn list_jobs(&self, namespace: &str) -> Result<ObjectList<Job>>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<Value>;

    async fn create_cron_job(&self, namespace: &str, cron_job: CronJob) -> Result<CronJob>;
    async fn read_cron_job(&self, namespace: &str, name: &str) -> Result<CronJob>;
    async fn list_cron_jobs(&self, namespace: &str) -> Result<ObjectList<CronJob>>;
    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<Value>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Pod>>;
    async fn read_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
    async fn read_pod_log(&self, namespace: &str, name: &str) -> Result<String>;
    async fn stream_pod_log(&self, namespace: &str, name: &str) -> Result<LogStream>;
}

/// Production [`ClusterClient`] backed by [`kube::Client`].
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
    post_params: PostParams,
    patch_params: PatchParams,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            post_params: PostParams::default(),
            patch_params: PatchParams::default(),
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create<K>(&self, namespace: &str, resource: &K) -> Result<K>
    where
        K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned
            + Serialize,
    {
        self.namespaced::<K>(namespace)
            .create(&self.post_params, resource)
            .await
            .map_err(Error::from_kube)
    }

    async fn read<K>(&self, namespace: &str, name: &str) -> Result<K>
    where
        K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned,
    {
        self.namespaced::<K>(namespace)
            .get(name)
            .await
            .map_err(Error::from_kube)
    }

    async fn list<K>(&self, namespace: &str, params: &ListParams) -> Result<ObjectList<K>>
    where
        K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned,
    {
        self.namespaced::<K>(namespace)
            .list(params)
            .await
            .map_err(Error::from_kube)
    }

    async fn patch_metadata<K>(&self, namespace: &str, name: &str, patch: Value) -> Result<()>
    where
        K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned,
    {
        self.namespaced::<K>(namespace)
            .patch(name, &self.patch_params, &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(Error::from_kube)
    }

    async fn delete_quietly<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned,
    {
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(Error::from_kube)
    }

    /// Deletes a workload with `Foreground` propagation so dependents (pods,
    /// the env Secret, the code ConfigMap) are gone before the owner is.
    async fn delete_with_foreground<K>(&self, namespace: &str, name: &str) -> Result<Value>
    where
        K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned
            + Serialize,
    {
        let params = DeleteParams::foreground();
        let deleted = self
            .namespaced::<K>(namespace)
            .delete(name, &params)
            .await
            .map_err(Error::from_kube)?;
        match deleted {
            Either::Left(resource) => {
                serde_json::to_value(resource).map_err(|source| Error::SerializeResponse { source })
            }
            Either::Right(status) => {
                serde_json::to_value(status).map_err(|source| Error::SerializeResponse { source })
            }
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceOutcome> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&self.post_params, &namespace).await {
            Ok(_) => Ok(NamespaceOutcome::Created),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Ok(NamespaceOutcome::Existed)
            }
            Err(error) => Err(Error::from_kube(error)),
        }
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret> {
        self.create(namespace, &secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_quietly::<Secret>(namespace, name).await
    }

    async fn patch_secret(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        self.patch_metadata::<Secret>(namespace, name, patch).await
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap> {
        self.create(namespace, &config_map).await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_quietly::<ConfigMap>(namespace, name).await
    }

    async fn patch_config_map(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        self.patch_metadata::<ConfigMap>(namespace, name, patch)
            .await
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job> {
        self.create(namespace, &job).await
    }

    async fn read_job(&self, namespace: &str, name: &str) -> Result<Job> {
        self.read(namespace, name).await
    }

    async fn list_jobs(&self, namespace: &str) -> Result<ObjectList<Job>> {
        self.list(namespace, &ListParams::default()).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<Value> {
        self.delete_with_foreground::<Job>(namespace, name).await
    }

    async fn create_cron_job(&self, namespace: &str, cron_job: CronJob) -> Result<CronJob> {
        self.create(namespace, &cron_job).await
    }

    async fn read_cron_job(&self, namespace: &str, name: &str) -> Result<CronJob> {
        self.read(namespace, name).await
    }

    async fn list_cron_jobs(&self, namespace: &str) -> Result<ObjectList<CronJob>> {
        self.list(namespace, &ListParams::default()).await
    }

    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<Value> {
        self.delete_with_foreground::<CronJob>(namespace, name).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Pod>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        self.list(namespace, &params).await
    }

    async fn read_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.read(namespace, name).await
    }

    async fn read_pod_log(&self, namespace: &str, name: &str) -> Result<String> {
        self.namespaced::<Pod>(namespace)
            .logs(name, &LogParams::default())
            .await
            .map_err(Error::from_kube)
    }

    async fn stream_pod_log(&self, namespace: &str, name: &str) -> Result<LogStream> {
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let reader = self
            .namespaced::<Pod>(namespace)
            .log_stream(name, &params)
            .await
            .map_err(Error::from_kube)?;
        // the upstream watch yields lines; re-append the separator so the
        // relayed body reads like the raw log
        let lines = reader.lines().map(|line| {
            line.map(|mut line| {
                line.push('\n');
                line
            })
            .map_err(|source| Error::Stream { source })
        });
        Ok(lines.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_api_errors_with_their_status() {
        let error = Error::from_kube(kube::Error::Api(Box::new(ErrorResponse {
            status: Some(kube::core::response::StatusSummary::Failure),
            message: "jobs.batch \"missing\" not found".to_owned(),
            reason: "NotFound".to_owned(),
            code: 404,
            metadata: None,
            details: None,
        })));
        assert_eq!(error.status(), Some(404));
        assert!(error.to_string().contains("not found"));
    }

    #[test]
    fn conflicts_are_distinguishable() {
        let error = Error::Api {
            status: 409,
            message: "namespaces \"kbatch-alice\" already exists".to_owned(),
        };
        assert_eq!(error.status(), Some(409));
    }
}
