//! Access to the control plane objects the webhook manages for itself.
use async_trait::async_trait;
use k8s_openapi::api::{
    admissionregistration::v1::ValidatingWebhookConfiguration, core::v1::Service,
};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument};

#[derive(Debug, Snafu)]
pub enum ClusterError {
    #[snafu(display("object {name:?} does not specify a namespace"))]
    MissingNamespace { name: String },

    #[snafu(display("failed to apply Service {namespace}/{name}"))]
    ApplyService {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to apply ValidatingWebhookConfiguration {name:?}"))]
    ApplyValidatingWebhookConfiguration { source: kube::Error, name: String },
}

/// Applies the objects which make the webhook reachable and known to the API
/// server. Objects are applied as a whole with server-side apply.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn apply_service(
        &self,
        service: &Service,
        field_manager: &str,
    ) -> Result<Service, ClusterError>;

    async fn apply_validating_webhook_configuration(
        &self,
        configuration: &ValidatingWebhookConfiguration,
        field_manager: &str,
    ) -> Result<ValidatingWebhookConfiguration, ClusterError>;
}

/// [`ClusterApi`] backed by a kube [`Client`].
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip_all, fields(k8s.service.name = %service.name_any()))]
    async fn apply_service(
        &self,
        service: &Service,
        field_manager: &str,
    ) -> Result<Service, ClusterError> {
        let name = service.name_any();
        let namespace = service
            .namespace()
            .context(MissingNamespaceSnafu { name: &name })?;

        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let service = api
            .patch(&name, &PatchParams::apply(field_manager), &Patch::Apply(service))
            .await
            .with_context(|_| ApplyServiceSnafu {
                namespace: &namespace,
                name: &name,
            })?;

        debug!(k8s.namespace = %namespace, "applied service");
        Ok(service)
    }

    // The configuration is applied without force, conflicting field managers
    // are reported instead of being overridden.
    #[instrument(skip_all, fields(k8s.validatingwebhookconfiguration.name = %configuration.name_any()))]
    async fn apply_validating_webhook_configuration(
        &self,
        configuration: &ValidatingWebhookConfiguration,
        field_manager: &str,
    ) -> Result<ValidatingWebhookConfiguration, ClusterError> {
        let name = configuration.name_any();

        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        let configuration = api
            .patch(
                &name,
                &PatchParams::apply(field_manager),
                &Patch::Apply(configuration),
            )
            .await
            .context(ApplyValidatingWebhookConfigurationSnafu { name: &name })?;

        debug!("applied validating webhook configuration");
        Ok(configuration)
    }
}
