use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser};
use gatehouse_certs::store::DirectoryCertificateStore;
use gatehouse_telemetry::{TelemetryOptions, Tracing};
use gatehouse_webhook::{
    ConfigurationError, Registry, WebhookDependencies, WebhookError, WebhookOptions,
    WebhookServer, operator::OperatorIdentityError,
};
use k8s_openapi::api::core::v1::Pod;
use snafu::{ResultExt, Snafu};
use tracing::info;

use crate::validator::PodNameValidator;

mod validator;

const APP_NAME: &str = "gatehouse-pod-webhook";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: gatehouse_telemetry::tracing::Error,
    },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to resolve the operator identity"))]
    ResolveIdentity { source: OperatorIdentityError },

    #[snafu(display("failed to create webhook server"))]
    CreateWebhookServer { source: ConfigurationError },

    #[snafu(display("failed to run webhook server"))]
    RunWebhookServer { source: WebhookError },
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
enum Command {
    /// Run the webhook.
    Run(RunArguments),
}

#[derive(Debug, Args)]
struct RunArguments {
    #[command(flatten)]
    webhook: WebhookOptions,

    #[command(flatten)]
    telemetry: TelemetryOptions,

    /// Keep the certificates in DIRECTORY instead of a Secret.
    #[arg(long, env, value_name = "DIRECTORY")]
    certificate_store_dir: Option<PathBuf>,
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_resource::<Pod, _>(PodNameValidator);
    registry
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let Command::Run(arguments) = Command::parse();
    let RunArguments {
        webhook: options,
        telemetry,
        certificate_store_dir,
    } = arguments;

    // Dropping the guard shuts the subscribers down
    let _tracing_guard = Tracing::pre_configured(APP_NAME, telemetry)
        .init()
        .context(InitTracingSnafu)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        operator.name = %options.operator_name,
        "starting {APP_NAME}"
    );

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let mut dependencies = WebhookDependencies::kubernetes(client, &options)
        .await
        .context(ResolveIdentitySnafu)?;
    if let Some(directory) = certificate_store_dir {
        dependencies.certificate_store = Arc::new(DirectoryCertificateStore::new(directory));
    }

    WebhookServer::new(registry(), options, dependencies)
        .await
        .context(CreateWebhookServerSnafu)?
        .run()
        .await
        .context(RunWebhookServerSnafu)
}
