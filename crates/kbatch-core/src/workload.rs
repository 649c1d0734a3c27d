//! Normalizes free-form workload submissions into typed cluster objects.
//!
//! Clients submit workloads as nested JSON mappings and are allowed to spell
//! keys either in the cluster's canonical camelCase or in the snake_case the
//! Python Kubernetes client emits. [`normalize_keys`] folds both spellings
//! into the canonical one before the mapping is deserialized into the
//! [`k8s_openapi`] models the rest of the pipeline works with.

use k8s_openapi::{
    ByteString,
    api::{
        batch::v1::{CronJob, Job, JobSpec},
        core::v1::{ConfigMap, PodSpec},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// Map fields whose keys are user data, not schema: nothing below them is
/// rewritten.
const OPAQUE_MAP_KEYS: &[&str] = &[
    "labels",
    "annotations",
    "data",
    "binaryData",
    "stringData",
    "nodeSelector",
    "matchLabels",
    "limits",
    "requests",
    "capacity",
];

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the submitted body does not describe a {kind}"))]
    Deserialize {
        source: serde_json::Error,
        kind: ResourceKind,
    },

    #[snafu(display("the code attachment does not describe a ConfigMap"))]
    DeserializeCode { source: serde_json::Error },

    #[snafu(display("{path} must be a mapping"))]
    NotAMapping { path: &'static str },

    #[snafu(display("spec.template is present but spec.template.spec is missing"))]
    MissingPodSpec,

    #[snafu(display("metadata must carry a name or a generateName"))]
    MissingName,

    #[snafu(display("a CronJob submission must embed spec.jobTemplate"))]
    MissingJobTemplate,

    #[snafu(display("the pod template declares no containers"))]
    NoContainers,

    #[snafu(display("container {name:?} has no image"))]
    MissingImage { name: String },

    #[snafu(display(
        "code attachment {key:?} is {size} bytes, exceeding the {limit} byte limit"
    ))]
    CodeTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
}

impl Error {
    /// True for the size-cap rejection, which maps to a different HTTP status
    /// than ordinary malformed submissions.
    pub fn is_too_large(&self) -> bool {
        matches!(self, Error::CodeTooLarge { .. })
    }
}

/// The two batch resource kinds the proxy materializes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ResourceKind {
    Job,
    CronJob,
}

/// A parsed workload submission.
#[derive(Clone, Debug)]
pub enum Workload {
    Job(Job),
    CronJob(CronJob),
}

impl Workload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Workload::Job(_) => ResourceKind::Job,
            Workload::CronJob(_) => ResourceKind::CronJob,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Job(job) => &job.metadata,
            Workload::CronJob(cron_job) => &cron_job.metadata,
        }
    }

    /// The job spec that carries the pod template: the workload's own for a
    /// Job, the embedded template's for a CronJob.
    pub fn job_spec(&self) -> Option<&JobSpec> {
        match self {
            Workload::Job(job) => job.spec.as_ref(),
            Workload::CronJob(cron_job) => cron_job.spec.as_ref()?.job_template.spec.as_ref(),
        }
    }

    pub fn job_spec_mut(&mut self) -> Option<&mut JobSpec> {
        match self {
            Workload::Job(job) => job.spec.as_mut(),
            Workload::CronJob(cron_job) => cron_job.spec.as_mut()?.job_template.spec.as_mut(),
        }
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.job_spec()?.template.spec.as_ref()
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Workload::Job(job) => serde_json::to_value(job),
            Workload::CronJob(cron_job) => serde_json::to_value(cron_job),
        }
    }
}

/// Rewrites snake_case map keys to their camelCase alias, recursively.
///
/// The canonical (snake_case) spelling wins when a mapping carries both.
/// Keys below the free-form string maps in [`OPAQUE_MAP_KEYS`] pass through
/// untouched, so a label named `my_label` survives normalization.
pub fn normalize_keys(value: &Value) -> Value {
    normalize(value, false)
}

fn normalize(value: &Value, opaque: bool) -> Value {
    match value {
        Value::Object(map) => {
            if opaque {
                return value.clone();
            }
            let mut normalized = Map::with_capacity(map.len());
            // camelCase spellings first, then the canonical snake_case ones,
            // so the canonical spelling overwrites on conflict
            for (key, child) in map {
                if key.contains('_') {
                    continue;
                }
                let child_opaque = OPAQUE_MAP_KEYS.contains(&key.as_str());
                normalized.insert(key.clone(), normalize(child, child_opaque));
            }
            for (key, child) in map {
                if !key.contains('_') {
                    continue;
                }
                let converted = snake_to_camel(key);
                let child_opaque = OPAQUE_MAP_KEYS.contains(&converted.as_str());
                normalized.insert(converted, normalize(child, child_opaque));
            }
            Value::Object(normalized)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| normalize(item, opaque)).collect())
        }
        scalar => scalar.clone(),
    }
}

fn snake_to_camel(key: &str) -> String {
    let mut converted = String::with_capacity(key.len());
    let mut capitalize_next = false;
    for character in key.chars() {
        if character == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            converted.extend(character.to_uppercase());
            capitalize_next = false;
        } else {
            converted.push(character);
        }
    }
    converted
}

/// Parses a normalized (or raw) mapping into a typed [`Job`].
pub fn parse_job(data: &Value) -> Result<Job> {
    let mut normalized = normalize_keys(data);
    let root = normalized
        .as_object_mut()
        .context(NotAMappingSnafu { path: "job" })?;
    if let Some(spec) = root.get_mut("spec") {
        let spec = spec
            .as_object_mut()
            .context(NotAMappingSnafu { path: "spec" })?;
        scaffold_pod_template(spec)?;
    }
    serde_json::from_value(normalized).context(DeserializeSnafu {
        kind: ResourceKind::Job,
    })
}

/// Parses a normalized (or raw) mapping into a typed [`CronJob`]. The
/// embedded job template is mandatory; it is what the patch pipeline
/// rewrites later.
pub fn parse_cron_job(data: &Value) -> Result<CronJob> {
    let mut normalized = normalize_keys(data);
    let root = normalized
        .as_object_mut()
        .context(NotAMappingSnafu { path: "job" })?;
    let spec = root
        .get_mut("spec")
        .context(MissingJobTemplateSnafu)?
        .as_object_mut()
        .context(NotAMappingSnafu { path: "spec" })?;
    let job_template = spec
        .get_mut("jobTemplate")
        .context(MissingJobTemplateSnafu)?
        .as_object_mut()
        .context(NotAMappingSnafu {
            path: "spec.jobTemplate",
        })?;
    if let Some(job_spec) = job_template.get_mut("spec") {
        let job_spec = job_spec.as_object_mut().context(NotAMappingSnafu {
            path: "spec.jobTemplate.spec",
        })?;
        scaffold_pod_template(job_spec)?;
    }
    serde_json::from_value(normalized).context(DeserializeSnafu {
        kind: ResourceKind::CronJob,
    })
}

/// Parses the optional `code` attachment into a [`ConfigMap`], decoding its
/// base64 payloads on the way, and rejects blobs above `limit` bytes.
pub fn parse_code_config_map(data: &Value, limit: usize) -> Result<ConfigMap> {
    let normalized = normalize_keys(data);
    let config_map: ConfigMap =
        serde_json::from_value(normalized).context(DeserializeCodeSnafu)?;
    for (key, ByteString(bytes)) in config_map.binary_data.iter().flatten() {
        ensure!(
            bytes.len() <= limit,
            CodeTooLargeSnafu {
                key: key.clone(),
                size: bytes.len(),
                limit,
            }
        );
    }
    Ok(config_map)
}

/// Enforces the submission invariants the patch pipeline depends on.
pub fn validate(workload: &Workload) -> Result<()> {
    let metadata = workload.metadata();
    ensure!(
        metadata.name.is_some() || metadata.generate_name.is_some(),
        MissingNameSnafu
    );
    let container = workload
        .pod_spec()
        .and_then(|pod_spec| pod_spec.containers.first())
        .context(NoContainersSnafu)?;
    ensure!(
        container.image.is_some(),
        MissingImageSnafu {
            name: container.name.clone(),
        }
    );
    Ok(())
}

// A present pod template must carry a pod spec, and `containers` defaults to
// an empty list so sparse submissions still deserialize.
fn scaffold_pod_template(job_spec: &mut Map<String, Value>) -> Result<()> {
    let Some(template) = job_spec.get_mut("template") else {
        return Ok(());
    };
    let template = template.as_object_mut().context(NotAMappingSnafu {
        path: "spec.template",
    })?;
    let pod_spec = template
        .get_mut("spec")
        .context(MissingPodSpecSnafu)?
        .as_object_mut()
        .context(MissingPodSpecSnafu)?;
    pod_spec
        .entry("containers")
        .or_insert_with(|| Value::Array(Vec::new()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn job_body() -> Value {
        json!({
            "metadata": {
                "generate_name": "t-",
                "labels": {"my_label": "unchanged"},
            },
            "spec": {
                "backoff_limit": 4,
                "template": {
                    "spec": {
                        "restart_policy": "Never",
                        "containers": [{
                            "name": "job",
                            "image": "alpine",
                            "args": ["ls", "-lh"],
                            "env": [{"name": "MYENV", "value": "MYVALUE"}],
                        }],
                    },
                },
            },
        })
    }

    fn cron_job_body() -> Value {
        json!({
            "metadata": {"generate_name": "nightly-"},
            "spec": {
                "schedule": "*/5 * * * *",
                "job_template": {
                    "metadata": {"generate_name": "nightly-"},
                    "spec": job_body()["spec"].clone(),
                },
            },
        })
    }

    #[test]
    fn accepts_snake_case_spellings() {
        let job = parse_job(&job_body()).expect("parses");
        assert_eq!(job.metadata.generate_name.as_deref(), Some("t-"));
        let spec = job.spec.expect("spec present");
        assert_eq!(spec.backoff_limit, Some(4));
        let pod_spec = spec.template.spec.expect("pod spec present");
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("alpine"));
    }

    #[test]
    fn accepts_camel_case_spellings() {
        let body = json!({
            "metadata": {"generateName": "t-"},
            "spec": {
                "backoffLimit": 2,
                "template": {"spec": {"containers": [{"name": "job", "image": "alpine"}]}},
            },
        });
        let job = parse_job(&body).expect("parses");
        assert_eq!(job.metadata.generate_name.as_deref(), Some("t-"));
        assert_eq!(job.spec.expect("spec present").backoff_limit, Some(2));
    }

    #[test]
    fn canonical_spelling_wins_over_its_alias() {
        let body = json!({
            "metadata": {"generateName": "t-"},
            "spec": {
                "backoff_limit": 4,
                "backoffLimit": 9,
                "template": {"spec": {"containers": [{"name": "job", "image": "alpine"}]}},
            },
        });
        let job = parse_job(&body).expect("parses");
        assert_eq!(job.spec.expect("spec present").backoff_limit, Some(4));
    }

    #[test]
    fn opaque_map_keys_survive_normalization() {
        let job = parse_job(&job_body()).expect("parses");
        let labels = job.metadata.labels.expect("labels present");
        assert_eq!(labels.get("my_label").map(String::as_str), Some("unchanged"));
    }

    #[test]
    fn containers_default_to_an_empty_list() {
        let body = json!({
            "metadata": {"name": "empty"},
            "spec": {"template": {"spec": {"restart_policy": "Never"}}},
        });
        let job = parse_job(&body).expect("parses");
        let pod_spec = job.spec.expect("spec").template.spec.expect("pod spec");
        assert!(pod_spec.containers.is_empty());
    }

    #[test]
    fn template_without_pod_spec_is_malformed() {
        let body = json!({
            "metadata": {"name": "broken"},
            "spec": {"template": {"metadata": {"name": "pod"}}},
        });
        let error = parse_job(&body).expect_err("must fail");
        assert!(matches!(error, Error::MissingPodSpec));
    }

    #[test]
    fn parses_cron_jobs_with_embedded_templates() {
        let cron_job = parse_cron_job(&cron_job_body()).expect("parses");
        let spec = cron_job.spec.expect("spec present");
        assert_eq!(spec.schedule, "*/5 * * * *");
        let job_spec = spec.job_template.spec.expect("embedded job spec");
        assert_eq!(job_spec.backoff_limit, Some(4));
    }

    #[test]
    fn cron_job_without_job_template_is_malformed() {
        let body = json!({
            "metadata": {"name": "cron"},
            "spec": {"schedule": "* * * * *"},
        });
        let error = parse_cron_job(&body).expect_err("must fail");
        assert!(matches!(error, Error::MissingJobTemplate));
    }

    #[test]
    fn decodes_code_attachments() {
        let body = json!({
            "metadata": {"generate_name": "t-"},
            "binary_data": {"code": "UEsFBgAAAAAAAAAAAAAAAAAAAAAAAA=="},
        });
        let config_map = parse_code_config_map(&body, 1024).expect("parses");
        let binary = config_map.binary_data.expect("binaryData present");
        let ByteString(bytes) = binary.get("code").expect("code key present");
        assert_eq!(bytes.len(), 22);
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn rejects_oversized_code_attachments() {
        let body = json!({
            "binary_data": {"code": "UEsFBgAAAAAAAAAAAAAAAAAAAAAAAA=="},
        });
        let error = parse_code_config_map(&body, 8).expect_err("must fail");
        assert!(error.is_too_large());
        assert!(matches!(
            error,
            Error::CodeTooLarge { size: 22, limit: 8, .. }
        ));
    }

    #[test]
    fn rejects_undecodable_code_attachments() {
        let body = json!({"binary_data": {"code": "not base64 at all!"}});
        let error = parse_code_config_map(&body, 1024).expect_err("must fail");
        assert!(matches!(error, Error::DeserializeCode { .. }));
    }

    #[test]
    fn validate_demands_a_name() {
        let body = json!({
            "spec": {"template": {"spec": {"containers": [{"name": "job", "image": "alpine"}]}}},
        });
        let workload = Workload::Job(parse_job(&body).expect("parses"));
        let error = validate(&workload).expect_err("must fail");
        assert!(matches!(error, Error::MissingName));
    }

    #[test]
    fn validate_demands_a_container_with_an_image() {
        let body = json!({
            "metadata": {"name": "no-containers"},
            "spec": {"template": {"spec": {}}},
        });
        let workload = Workload::Job(parse_job(&body).expect("parses"));
        assert!(matches!(
            validate(&workload).expect_err("must fail"),
            Error::NoContainers
        ));

        let body = json!({
            "metadata": {"name": "no-image"},
            "spec": {"template": {"spec": {"containers": [{"name": "job"}]}}},
        });
        let workload = Workload::Job(parse_job(&body).expect("parses"));
        assert!(matches!(
            validate(&workload).expect_err("must fail"),
            Error::MissingImage { name } if name == "job"
        ));
    }

    #[test]
    fn validate_accepts_cron_jobs() {
        let workload = Workload::CronJob(parse_cron_job(&cron_job_body()).expect("parses"));
        validate(&workload).expect("valid");
        assert_eq!(workload.kind(), ResourceKind::CronJob);
        assert!(workload.job_spec().is_some());
    }
}
