use std::sync::Arc;

use kbatch_core::client::KubeClusterClient;
use kbatch_proxy::{
    auth::HubAuthenticator,
    config::{self, Settings},
    server::{self, AppContext, ServeError},
};
use snafu::{ResultExt, Snafu};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to load startup files"))]
    Config { source: config::Error },

    #[snafu(display("failed to construct the Kubernetes client"))]
    KubeClient { source: kube::Error },

    #[snafu(display("failed to run the HTTP server"))]
    Serve { source: ServeError },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let settings = Settings::load();
    if settings.kbatch_init_logging {
        initialize_logging();
    }

    let job_template = match &settings.kbatch_job_template_file {
        Some(path) => {
            info!(path = %path.display(), "loading job template");
            Some(config::load_job_template(path).context(ConfigSnafu)?)
        }
        None => None,
    };
    let profiles = match &settings.kbatch_profile_file {
        Some(path) => {
            info!(path = %path.display(), "loading profiles");
            config::load_profiles(path).context(ConfigSnafu)?
        }
        None => Default::default(),
    };

    let kube_client = kube::Client::try_default().await.context(KubeClientSnafu)?;
    let cluster = Arc::new(KubeClusterClient::new(kube_client));
    let authenticator = Arc::new(HubAuthenticator::new(
        settings.jupyterhub_api_url.clone(),
        settings.jupyterhub_api_token.clone(),
        settings.kbatch_required_scope.clone(),
    ));

    let context = Arc::new(AppContext::new(
        settings,
        job_template,
        profiles,
        authenticator,
        cluster,
    ));
    server::serve(context).await.context(ServeSnafu)
}

/// Structured logging to stderr, filtered by `KBATCH_LOG` (INFO when unset).
fn initialize_logging() {
    let filter =
        EnvFilter::try_from_env("KBATCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
