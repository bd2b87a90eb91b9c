//! Publishes the Service through which the API server reaches the webhook.
use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::api::ObjectMeta;
use snafu::{ResultExt, Snafu};
use tracing::{info, instrument};

use crate::{
    WebhookOptions,
    cluster::{ClusterApi, ClusterError},
    constants::{APP_NAME_LABEL, MANAGED_BY_LABEL, SELECTOR_LABEL, SERVICE_PORT_NAME},
    operator::OperatorIdentity,
};

#[derive(Debug, Snafu)]
pub enum EndpointError {
    #[snafu(display("failed to apply the webhook Service"))]
    ApplyService { source: ClusterError },
}

/// Ensures the Service `<operator name>` exists and forwards its HTTPS port to
/// the webhook pods, which are selected by the label `name=<operator name>`.
/// The Service carries the selector label itself, plus the recommended app
/// name and managed-by labels.
///
/// Publishing is idempotent and runs on every start. Existing Services are
/// updated in place.
pub struct EndpointPublisher {
    cluster: Arc<dyn ClusterApi>,
    field_manager: String,
    service_port: u16,
    webhook_port: u16,
}

impl EndpointPublisher {
    pub fn new(cluster: Arc<dyn ClusterApi>, options: &WebhookOptions) -> Self {
        Self {
            cluster,
            field_manager: options.field_manager.clone(),
            service_port: options.service_port,
            webhook_port: options.webhook_port,
        }
    }

    /// Builds the desired Service of `identity`.
    pub fn service(&self, identity: &OperatorIdentity) -> Service {
        let selector = BTreeMap::from([(SELECTOR_LABEL.to_owned(), identity.name.clone())]);
        let mut labels = selector.clone();
        labels.extend([
            (APP_NAME_LABEL.to_owned(), identity.name.clone()),
            (MANAGED_BY_LABEL.to_owned(), self.field_manager.clone()),
        ]);

        Service {
            metadata: ObjectMeta {
                name: Some(identity.name.clone()),
                namespace: Some(identity.namespace.clone()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some(SERVICE_PORT_NAME.to_owned()),
                    port: self.service_port.into(),
                    protocol: Some("TCP".to_owned()),
                    target_port: Some(IntOrString::Int(self.webhook_port.into())),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    #[instrument(
        name = "publish_endpoint",
        skip(self, identity),
        fields(k8s.service.name = %identity.name, k8s.namespace = %identity.namespace)
    )]
    pub async fn publish(&self, identity: &OperatorIdentity) -> Result<Service, EndpointError> {
        let service = self
            .cluster
            .apply_service(&self.service(identity), &self.field_manager)
            .await
            .context(ApplyServiceSnafu)?;

        info!(
            service.port = self.service_port,
            webhook.port = self.webhook_port,
            "published webhook service"
        );
        Ok(service)
    }
}
