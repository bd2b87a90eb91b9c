//! Resolution of the name and namespace the webhook runs under.
use std::{io::ErrorKind, path::Path};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, instrument};

use crate::{
    WebhookOptions,
    constants::{SERVICE_ACCOUNT_NAMESPACE_PATH, WEBHOOK_NAMESPACE_ENV},
};

#[derive(Debug, Snafu)]
pub enum OperatorIdentityError {
    #[snafu(display("the operator name must not be empty"))]
    EmptyName,

    #[snafu(display("failed to read the service account namespace from {path:?}"))]
    ReadServiceAccountNamespace {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display(
        "failed to determine the operator namespace: set it explicitly, run in a pod with a \
        service account or set WEBHOOK_NAMESPACE"
    ))]
    UnknownNamespace,
}

/// The name and namespace of the operator. The name doubles as the name of the
/// Service fronting the webhook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorIdentity {
    pub name: String,
    pub namespace: String,
}

impl OperatorIdentity {
    /// Resolves the identity from the `options`.
    ///
    /// The namespace is taken from the first source available:
    ///
    /// - the explicitly configured namespace,
    /// - the namespace file of the mounted service account,
    /// - the `WEBHOOK_NAMESPACE` environment variable.
    #[instrument(name = "resolve_operator_identity", skip(options), fields(operator.name = %options.operator_name))]
    pub async fn resolve(options: &WebhookOptions) -> Result<Self, OperatorIdentityError> {
        Self::resolve_with(
            &options.operator_name,
            options.operator_namespace.as_deref(),
            Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH),
            |key| std::env::var(key).ok(),
        )
        .await
    }

    async fn resolve_with(
        name: &str,
        explicit_namespace: Option<&str>,
        service_account_namespace_path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OperatorIdentityError> {
        ensure!(!name.trim().is_empty(), EmptyNameSnafu);

        let namespace = match non_empty(explicit_namespace.map(ToOwned::to_owned)) {
            Some(namespace) => namespace,
            None => match read_namespace_file(service_account_namespace_path).await? {
                Some(namespace) => namespace,
                None => non_empty(env(WEBHOOK_NAMESPACE_ENV)).context(UnknownNamespaceSnafu)?,
            },
        };

        debug!(operator.namespace = %namespace, "resolved operator identity");
        Ok(Self {
            name: name.to_owned(),
            namespace,
        })
    }
}

async fn read_namespace_file(path: &Path) -> Result<Option<String>, OperatorIdentityError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(non_empty(Some(content))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(ReadServiceAccountNamespaceSnafu {
            path: path.display().to_string(),
        }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
