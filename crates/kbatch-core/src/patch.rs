//! Rewrites a parsed workload so it is safe to run on the user's behalf.
//!
//! The proxy never trusts the submitted pod template as-is: identity gets
//! stamped on, the workload is pinned to the user's namespace, literal env
//! values move into a Secret, and attached code is wired in through an init
//! container that unzips it into a shared volume.

use std::collections::BTreeMap;

use k8s_openapi::{
    ByteString,
    api::{
        batch::v1::{CronJob, Job, JobSpec, JobTemplateSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar,
            EnvVarSource, KeyToPath, PodSpec, Secret, SecretKeySelector, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use snafu::{OptionExt, Snafu};

use crate::{
    kvp::{USERNAME_KEY, escape_label_value},
    namespace::namespace_for_username,
    workload::Workload,
};

/// Volume carrying the zipped code, projected from the code ConfigMap.
pub const CODE_SOURCE_VOLUME: &str = "code-source-volume";

/// Volume the init container unzips into, shared with the primary container.
pub const CODE_VOLUME: &str = "code-volume";

const CODE_MOUNT_PATH: &str = "/code";
const CODE_SOURCE_MOUNT_PATH: &str = "/code-zipped";
const CODE_KEY: &str = "code";
const CODE_ARCHIVE_FILE: &str = "code.b64";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("metadata carries neither name nor generateName"))]
    NoName,

    #[snafu(display("the workload has no containers to patch"))]
    NoContainers,

    #[snafu(display("the first container has no image to advertise"))]
    NoImage,

    #[snafu(display("a CronJob must embed spec.jobTemplate"))]
    NoJobTemplate,

    #[snafu(display("the pod spec carries no code volume to rewire"))]
    NoCodeVolume,
}

/// Everything the patch pipeline needs to know about the submitting request.
#[derive(Clone, Debug, Default)]
pub struct PatchOptions {
    /// Raw identity of the submitting user.
    pub username: String,
    /// The user's own token, forwarded into the container environment.
    pub api_token: Option<String>,
    /// Administrator-configured env pairs added to every job.
    pub extra_env: BTreeMap<String, String>,
    /// Seconds after which the cluster garbage-collects the finished job.
    pub ttl_seconds_after_finished: Option<i32>,
}

/// Applies the full rewrite to a workload and its optional code ConfigMap.
///
/// For a CronJob the embedded job template is the patch target: it is lifted
/// into a [`Job`], patched, and written back into `spec.jobTemplate`.
///
/// Returns the Secret holding the extracted env literals; the caller must
/// create it before the workload so the server-assigned name can replace the
/// `generateName` placeholder left in every `secretKeyRef`.
pub fn patch(
    workload: &mut Workload,
    config_map: Option<&mut ConfigMap>,
    options: &PatchOptions,
) -> Result<Secret> {
    match workload {
        Workload::Job(job) => patch_job(job, config_map, options),
        Workload::CronJob(cron_job) => {
            let mut job = lift_job_template(cron_job)?;
            let secret = patch_job(&mut job, config_map, options)?;
            restore_job_template(cron_job, job);
            // the outer wrapper is created in the user's namespace as well
            cron_job.metadata.namespace = Some(namespace_for_username(&options.username));
            Ok(secret)
        }
    }
}

fn patch_job(
    job: &mut Job,
    config_map: Option<&mut ConfigMap>,
    options: &PatchOptions,
) -> Result<Secret> {
    let namespace = namespace_for_username(&options.username);

    add_identity(job, &options.username);
    add_namespace(job, &namespace);
    add_extra_env(job, &options.extra_env, options.api_token.as_deref())?;
    let secret = extract_env_to_secret(job)?;
    if let Some(ttl) = options.ttl_seconds_after_finished {
        set_job_ttl(job, ttl);
    }
    if let Some(config_map) = config_map {
        add_unzip_init_container(job)?;
        prepare_code_config_map(config_map, job, &namespace, &options.username);
    }

    Ok(secret)
}

/// Stamps the identity on both the workload metadata and the pod template
/// metadata: as an annotation carrying the raw name and as a label carrying
/// the escaped name.
pub fn add_identity(job: &mut Job, username: &str) {
    let label_value = escape_label_value(username);
    stamp_identity(&mut job.metadata, username, &label_value);
    stamp_identity(pod_template_metadata(job), username, &label_value);
}

fn stamp_identity(metadata: &mut ObjectMeta, username: &str, label_value: &str) {
    metadata
        .annotations
        .get_or_insert_default()
        .insert(USERNAME_KEY.to_owned(), username.to_owned());
    metadata
        .labels
        .get_or_insert_default()
        .insert(USERNAME_KEY.to_owned(), label_value.to_owned());
}

/// Pins the workload and its pod template to `namespace`.
pub fn add_namespace(job: &mut Job, namespace: &str) {
    job.metadata.namespace = Some(namespace.to_owned());
    pod_template_metadata(job).namespace = Some(namespace.to_owned());
}

/// Appends the ambient environment to the first container: the configured
/// extra pairs, the image advertisement variables, and the forwarded
/// JupyterHub token.
pub fn add_extra_env(
    job: &mut Job,
    extra_env: &BTreeMap<String, String>,
    api_token: Option<&str>,
) -> Result<()> {
    let container = pod_spec_mut(job)
        .containers
        .first_mut()
        .context(NoContainersSnafu)?;
    let image = container.image.clone().context(NoImageSnafu)?;
    let env = container.env.get_or_insert_default();
    for (name, value) in extra_env {
        env.push(literal_env_var(name, value));
    }
    env.push(literal_env_var("JUPYTER_IMAGE", &image));
    env.push(literal_env_var("JUPYTER_IMAGE_SPEC", &image));
    if let Some(token) = api_token {
        env.push(literal_env_var("JUPYTERHUB_API_TOKEN", token));
    }
    Ok(())
}

fn literal_env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..Default::default()
    }
}

/// Moves every literal env value (in regular and init containers alike) into
/// a Secret and leaves a `secretKeyRef` behind.
///
/// The reference names the Secret's `generateName` placeholder; the
/// submitter swaps in the server-assigned name once the Secret exists. Env
/// entries that already use `valueFrom` are left untouched.
pub fn extract_env_to_secret(job: &mut Job) -> Result<Secret> {
    let placeholder = name_placeholder(&job.metadata)?;
    let metadata = ObjectMeta {
        generate_name: Some(placeholder.clone()),
        labels: job.metadata.labels.clone(),
        namespace: job.metadata.namespace.clone(),
        ..Default::default()
    };

    let mut data = BTreeMap::new();
    for container in all_containers_mut(pod_spec_mut(job)) {
        for env in container.env.iter_mut().flatten() {
            if let Some(value) = env.value.take() {
                data.insert(env.name.clone(), ByteString(value.into_bytes()));
                env.value_from = Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: placeholder.clone(),
                        key: env.name.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
        }
    }

    Ok(Secret {
        metadata,
        data: Some(data),
        ..Default::default()
    })
}

/// Replaces the placeholder in every `secretKeyRef` with the name the server
/// assigned to the env Secret.
pub fn set_env_secret_name(job_spec: &mut JobSpec, placeholder: &str, assigned: &str) {
    let Some(pod_spec) = job_spec.template.spec.as_mut() else {
        return;
    };
    for container in all_containers_mut(pod_spec) {
        for env in container.env.iter_mut().flatten() {
            if let Some(secret_ref) = env
                .value_from
                .as_mut()
                .and_then(|source| source.secret_key_ref.as_mut())
            {
                if secret_ref.name == placeholder {
                    secret_ref.name = assigned.to_owned();
                }
            }
        }
    }
}

/// Stamps the cluster-side cleanup deadline onto the job.
pub fn set_job_ttl(job: &mut Job, ttl_seconds_after_finished: i32) {
    job.spec.get_or_insert_default().ttl_seconds_after_finished =
        Some(ttl_seconds_after_finished);
}

/// Prepends the init container that unzips the attached code and wires up
/// the two code volumes.
///
/// The ConfigMap-backed volume must stay at index `len - 2` of the final
/// volume list: the submitter later patches the server-assigned ConfigMap
/// name into exactly that slot.
pub fn add_unzip_init_container(job: &mut Job) -> Result<()> {
    let placeholder = name_placeholder(&job.metadata)?;
    let pod_spec = pod_spec_mut(job);

    let init_container = Container {
        name: format!("{placeholder}-init"),
        image: Some("busybox".to_owned()),
        args: Some(vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            format!("unzip -d {CODE_MOUNT_PATH}/ {CODE_SOURCE_MOUNT_PATH}/{CODE_ARCHIVE_FILE}"),
        ]),
        volume_mounts: Some(vec![
            volume_mount(CODE_SOURCE_VOLUME, CODE_SOURCE_MOUNT_PATH),
            volume_mount(CODE_VOLUME, CODE_MOUNT_PATH),
        ]),
        ..Default::default()
    };
    pod_spec
        .init_containers
        .get_or_insert_default()
        .insert(0, init_container);

    let volumes = pod_spec.volumes.get_or_insert_default();
    volumes.push(Volume {
        name: CODE_SOURCE_VOLUME.to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: placeholder,
            items: Some(vec![KeyToPath {
                key: CODE_KEY.to_owned(),
                path: CODE_ARCHIVE_FILE.to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    });
    volumes.push(Volume {
        name: CODE_VOLUME.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });

    let primary = pod_spec
        .containers
        .first_mut()
        .context(NoContainersSnafu)?;
    primary
        .volume_mounts
        .get_or_insert_default()
        .push(volume_mount(CODE_VOLUME, CODE_MOUNT_PATH));
    Ok(())
}

/// Writes the server-assigned ConfigMap name into the code-source volume,
/// which sits at index `len - 2` of the pod-spec volume list.
pub fn set_code_config_map_name(job_spec: &mut JobSpec, assigned: &str) -> Result<()> {
    let volumes = job_spec
        .template
        .spec
        .as_mut()
        .and_then(|pod_spec| pod_spec.volumes.as_mut())
        .context(NoCodeVolumeSnafu)?;
    let index = volumes.len().checked_sub(2).context(NoCodeVolumeSnafu)?;
    let source = volumes
        .get_mut(index)
        .and_then(|volume| volume.config_map.as_mut())
        .context(NoCodeVolumeSnafu)?;
    source.name = assigned.to_owned();
    Ok(())
}

fn prepare_code_config_map(
    config_map: &mut ConfigMap,
    job: &Job,
    namespace: &str,
    username: &str,
) {
    let metadata = &mut config_map.metadata;
    metadata.namespace = Some(namespace.to_owned());
    if metadata.name.is_none() && metadata.generate_name.is_none() {
        metadata.generate_name = name_placeholder(&job.metadata).ok();
    }
    metadata
        .annotations
        .get_or_insert_default()
        .insert(USERNAME_KEY.to_owned(), username.to_owned());
    metadata
        .labels
        .get_or_insert_default()
        .insert(USERNAME_KEY.to_owned(), escape_label_value(username));
}

/// Lifts a CronJob's embedded job template into a standalone [`Job`] so the
/// same patch pipeline applies to both kinds.
pub fn lift_job_template(cron_job: &CronJob) -> Result<Job> {
    let spec = cron_job.spec.as_ref().context(NoJobTemplateSnafu)?;
    let template = &spec.job_template;
    Ok(Job {
        metadata: template
            .metadata
            .clone()
            .unwrap_or_else(|| cron_job.metadata.clone()),
        spec: template.spec.clone(),
        ..Default::default()
    })
}

/// Writes a patched [`Job`] back into the CronJob's `spec.jobTemplate`.
pub fn restore_job_template(cron_job: &mut CronJob, job: Job) {
    if let Some(spec) = cron_job.spec.as_mut() {
        spec.job_template = JobTemplateSpec {
            metadata: Some(job.metadata),
            spec: job.spec,
        };
    }
}

/// The `generateName` prefix used as the pre-submission stand-in for names
/// the server has not assigned yet.
pub fn name_placeholder(metadata: &ObjectMeta) -> Result<String> {
    metadata
        .generate_name
        .clone()
        .or_else(|| metadata.name.as_ref().map(|name| format!("{name}-")))
        .context(NoNameSnafu)
}

fn pod_template_metadata(job: &mut Job) -> &mut ObjectMeta {
    job.spec
        .get_or_insert_default()
        .template
        .metadata
        .get_or_insert_default()
}

fn pod_spec_mut(job: &mut Job) -> &mut PodSpec {
    job.spec
        .get_or_insert_default()
        .template
        .spec
        .get_or_insert_default()
}

fn volume_mount(name: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: mount_path.to_owned(),
        ..Default::default()
    }
}

fn all_containers_mut(pod_spec: &mut PodSpec) -> impl Iterator<Item = &mut Container> {
    pod_spec
        .containers
        .iter_mut()
        .chain(pod_spec.init_containers.iter_mut().flatten())
}
