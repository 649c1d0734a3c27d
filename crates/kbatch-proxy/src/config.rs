//! Startup configuration: environment-bound settings plus the administrator
//! supplied job template and profile files.

use std::{collections::BTreeMap, net::SocketAddr, path::Path};

use clap::Parser;
use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use kbatch_core::workload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use url::Url;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {path}"))]
    ReadFile {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("failed to parse {path} as YAML"))]
    ParseYaml {
        source: serde_yaml::Error,
        path: String,
    },

    #[snafu(display("the job template in {path} is not a valid Job"))]
    InvalidTemplate {
        source: workload::Error,
        path: String,
    },

    #[snafu(display("failed to canonicalize the job template"))]
    CanonicalizeTemplate { source: serde_json::Error },
}

/// Proxy settings, resolved from command-line flags and environment
/// variables (`KBATCH_*` plus the JupyterHub service contract variables).
///
/// [`Settings::load`] additionally sources an env-style file first, so a
/// mounted settings file and plain environment variables configure the same
/// keys.
#[derive(Clone, Debug, Parser)]
#[command(name = "kbatch-proxy", version, about)]
pub struct Settings {
    /// Token used to authenticate against the JupyterHub API.
    #[arg(
        long,
        env = "JUPYTERHUB_API_TOKEN",
        default_value = "super-secret",
        hide_env_values = true
    )]
    pub jupyterhub_api_token: String,

    /// Base URL of the JupyterHub API.
    #[arg(
        long,
        env = "JUPYTERHUB_API_URL",
        default_value = "http://127.0.0.1:8081/hub/api"
    )]
    pub jupyterhub_api_url: Url,

    /// URL prefix under which the API is mounted, e.g. `/services/kbatch`.
    #[arg(long, env = "KBATCH_PREFIX", default_value = "")]
    pub kbatch_prefix: String,

    /// Whether to install the structured logging subscriber at startup.
    #[arg(
        long,
        env = "KBATCH_INIT_LOGGING",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub kbatch_init_logging: bool,

    /// Path to a YAML job template merged over every submission.
    #[arg(long, env = "KBATCH_JOB_TEMPLATE_FILE")]
    pub kbatch_job_template_file: Option<std::path::PathBuf>,

    /// Path to a YAML file with named submission profiles.
    #[arg(long, env = "KBATCH_PROFILE_FILE")]
    pub kbatch_profile_file: Option<std::path::PathBuf>,

    /// Seconds after which the cluster garbage-collects finished jobs.
    #[arg(
        long,
        env = "KBATCH_JOB_TTL_SECONDS_AFTER_FINISHED",
        default_value_t = 3600
    )]
    pub kbatch_job_ttl_seconds_after_finished: i32,

    /// Extra environment variables added to every job, as a JSON object.
    #[arg(long, env = "KBATCH_JOB_EXTRA_ENV", value_parser = parse_env_map)]
    pub kbatch_job_extra_env: Option<BTreeMap<String, String>>,

    /// Whether to create the per-user namespace on demand.
    #[arg(
        long,
        env = "KBATCH_CREATE_USER_NAMESPACE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub kbatch_create_user_namespace: bool,

    /// Scope a token must carry to use the service.
    #[arg(long, env = "KBATCH_REQUIRED_SCOPE", default_value = "access:services")]
    pub kbatch_required_scope: String,

    /// Largest accepted decoded code archive, in bytes.
    #[arg(long, env = "KBATCH_CODE_MAX_BYTES", default_value_t = 1024 * 1024)]
    pub kbatch_code_max_bytes: usize,

    /// Address the HTTP server binds to.
    #[arg(long, env = "KBATCH_BIND_ADDRESS", default_value = "0.0.0.0:8000")]
    pub kbatch_bind_address: SocketAddr,
}

impl Settings {
    /// Resolves settings after sourcing the env-style file named by
    /// `KBATCH_SETTINGS_PATH` (default `.env`), when it exists.
    pub fn load() -> Self {
        let path =
            std::env::var("KBATCH_SETTINGS_PATH").unwrap_or_else(|_| ".env".to_owned());
        let _ = dotenvy::from_filename(path);
        Self::parse()
    }
}

fn parse_env_map(raw: &str) -> Result<BTreeMap<String, String>, String> {
    serde_json::from_str(raw).map_err(|error| format!("not a JSON string map: {error}"))
}

/// An administrator-defined preset clients may select by name. The proxy
/// only serves profiles back; applying one is the client's job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity_required: Option<Value>,
}

/// Loads the admin job template and normalizes it to the cluster's canonical
/// key spelling, with absent fields dropped, so merging it over user
/// submissions behaves predictably.
pub fn load_job_template(path: &Path) -> Result<Value> {
    let display_path = path.display().to_string();
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu {
        path: display_path.clone(),
    })?;
    let parsed: Value = serde_yaml::from_str(&raw).context(ParseYamlSnafu {
        path: display_path.clone(),
    })?;
    let template = workload::parse_job(&parsed).context(InvalidTemplateSnafu {
        path: display_path.clone(),
    })?;
    serde_json::to_value(template).context(CanonicalizeTemplateSnafu)
}

/// Loads the named profile map. Unknown keys are rejected so typos surface
/// at startup instead of silently producing broken presets.
pub fn load_profiles(path: &Path) -> Result<BTreeMap<String, Profile>> {
    let display_path = path.display().to_string();
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu {
        path: display_path.clone(),
    })?;
    serde_yaml::from_str(&raw).context(ParseYamlSnafu { path: display_path })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use indoc::indoc;
    use serde_json::json;

    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn defaults_match_the_documented_contract() {
        let settings = Settings::parse_from(["kbatch-proxy"]);
        assert_eq!(settings.kbatch_prefix, "");
        assert_eq!(settings.kbatch_job_ttl_seconds_after_finished, 3600);
        assert!(settings.kbatch_create_user_namespace);
        assert_eq!(settings.kbatch_required_scope, "access:services");
        assert_eq!(settings.kbatch_code_max_bytes, 1024 * 1024);
    }

    #[test]
    fn extra_env_parses_from_json() {
        let settings = Settings::parse_from([
            "kbatch-proxy",
            "--kbatch-job-extra-env",
            r#"{"MY_ENV": "VALUE"}"#,
        ]);
        let extra = settings.kbatch_job_extra_env.expect("extra env");
        assert_eq!(extra.get("MY_ENV").map(String::as_str), Some("VALUE"));
    }

    #[test]
    fn rejects_malformed_extra_env() {
        let result = Settings::try_parse_from([
            "kbatch-proxy",
            "--kbatch-job-extra-env",
            "MY_ENV=VALUE",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn canonicalizes_the_job_template() {
        let file = write_temp(indoc! {"
            metadata:
              generate_name: templated-
            spec:
              backoff_limit: 0
              template:
                spec:
                  containers: []
        "});
        let template = load_job_template(file.path()).expect("loads");
        assert_eq!(template["spec"]["backoffLimit"], json!(0));
        assert_eq!(template["metadata"]["generateName"], json!("templated-"));
        // canonical form drops absent fields instead of carrying nulls
        assert_eq!(template["spec"].get("suspend"), None);
    }

    #[test]
    fn rejects_a_template_that_is_not_a_job() {
        let file = write_temp("spec:\n  template: {metadata: {}}\n");
        let error = load_job_template(file.path()).expect_err("must fail");
        assert!(matches!(error, Error::InvalidTemplate { .. }));
    }

    #[test]
    fn loads_profiles() {
        let file = write_temp(indoc! {r#"
            small:
              image: alpine
              resources:
                requests: {cpu: "1", memory: 1Gi}
            gpu:
              tolerations:
              - key: nvidia.com/gpu
                operator: Exists
                effect: NoSchedule
              node_affinity_required:
                key: node-type
                values: [gpu]
        "#});
        let profiles = load_profiles(file.path()).expect("loads");
        assert_eq!(profiles.len(), 2);
        assert_eq!(
            profiles.get("small").and_then(|p| p.image.as_deref()),
            Some("alpine")
        );
        assert!(profiles.get("gpu").is_some_and(|p| p.tolerations.is_some()));
    }

    #[test]
    fn profile_typos_fail_at_startup() {
        let file = write_temp("small:\n  imgae: alpine\n");
        let error = load_profiles(file.path()).expect_err("must fail");
        assert!(matches!(error, Error::ParseYaml { .. }));
    }
}
