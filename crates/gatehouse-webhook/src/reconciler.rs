//! Keeps the ValidatingWebhookConfiguration in sync with the registered
//! validators and the current CA bundle.
use std::sync::Arc;

use k8s_openapi::{
    ByteString,
    api::admissionregistration::v1::{
        RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
        WebhookClientConfig,
    },
};
use kube::api::ObjectMeta;
use snafu::{ResultExt, Snafu};
use tracing::{info, instrument};

use crate::{
    WebhookOptions,
    cluster::{ClusterApi, ClusterError},
    constants::{ADMISSION_REVIEW_VERSIONS, FAILURE_POLICY, SIDE_EFFECTS, VALIDATED_OPERATIONS},
    operator::OperatorIdentity,
    path::webhook_name,
    registry::{Registration, Registry},
};

#[derive(Debug, Snafu)]
pub enum ReconcileError {
    #[snafu(display("failed to apply the ValidatingWebhookConfiguration"))]
    ApplyConfiguration { source: ClusterError },
}

/// Builds the ValidatingWebhookConfiguration from scratch and applies it as a
/// whole.
///
/// The configuration contains one webhook per registration. Each webhook
/// sends CREATE and UPDATE requests of its resource to the Service of the
/// operator, secured by the CA bundle. Requests fail if the webhook cannot be
/// reached.
pub struct ConfigReconciler {
    cluster: Arc<dyn ClusterApi>,
    name: String,
    field_manager: String,
    service_port: u16,
    timeout_seconds: i32,
}

impl ConfigReconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, options: &WebhookOptions) -> Self {
        Self {
            cluster,
            name: options.webhook_configuration_name(),
            field_manager: options.field_manager.clone(),
            service_port: options.service_port,
            timeout_seconds: options.timeout_seconds,
        }
    }

    /// Builds the desired configuration. Equal inputs produce equal
    /// configurations.
    pub fn webhook_configuration(
        &self,
        registry: &Registry,
        identity: &OperatorIdentity,
        ca_bundle: &str,
    ) -> ValidatingWebhookConfiguration {
        ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..ObjectMeta::default()
            },
            webhooks: Some(
                registry
                    .iter()
                    .map(|registration| self.webhook(registration, identity, ca_bundle))
                    .collect(),
            ),
        }
    }

    fn webhook(
        &self,
        registration: &Registration,
        identity: &OperatorIdentity,
        ca_bundle: &str,
    ) -> ValidatingWebhook {
        let resource = registration.identity();

        ValidatingWebhook {
            name: webhook_name(resource, registration.resource_name()),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: identity.name.clone(),
                    namespace: identity.namespace.clone(),
                    path: Some(registration.path().to_owned()),
                    port: Some(self.service_port.into()),
                }),
                // ByteString takes care of the base64 encoding
                ca_bundle: Some(ByteString(ca_bundle.as_bytes().to_vec())),
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                operations: Some(to_strings(&VALIDATED_OPERATIONS)),
                api_groups: Some(vec![resource.group.clone()]),
                api_versions: Some(vec![resource.version.clone()]),
                resources: Some(vec![registration.resource_name().to_owned()]),
                ..RuleWithOperations::default()
            }]),
            side_effects: SIDE_EFFECTS.to_owned(),
            admission_review_versions: to_strings(&ADMISSION_REVIEW_VERSIONS),
            failure_policy: Some(FAILURE_POLICY.to_owned()),
            timeout_seconds: Some(self.timeout_seconds),
            ..ValidatingWebhook::default()
        }
    }

    /// Applies the configuration for the current registrations and CA bundle.
    #[instrument(
        name = "reconcile_webhook_configuration",
        skip_all,
        fields(k8s.validatingwebhookconfiguration.name = %self.name, webhooks = registry.len())
    )]
    pub async fn reconcile(
        &self,
        registry: &Registry,
        identity: &OperatorIdentity,
        ca_bundle: &str,
    ) -> Result<ValidatingWebhookConfiguration, ReconcileError> {
        let configuration = self.webhook_configuration(registry, identity, ca_bundle);
        let configuration = self
            .cluster
            .apply_validating_webhook_configuration(&configuration, &self.field_manager)
            .await
            .context(ApplyConfigurationSnafu)?;

        info!("reconciled validating webhook configuration");
        Ok(configuration)
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|&value| value.to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
    use kube::ResourceExt;

    use super::*;
    use crate::{
        cluster::fake::FakeCluster,
        validation::{ValidationContext, from_fn},
    };

    const CA_BUNDLE: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn identity() -> OperatorIdentity {
        OperatorIdentity {
            name: "gatehouse".to_owned(),
            namespace: "webhooks".to_owned(),
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_resource::<Pod, _>(from_fn(|_: &Pod, _: &ValidationContext<'_>| Ok(())))
            .register_resource::<Deployment, _>(from_fn(
                |_: &Deployment, _: &ValidationContext<'_>| Ok(()),
            ));
        registry
    }

    #[test]
    fn one_webhook_per_registration() {
        let options = WebhookOptions::builder("gatehouse").timeout_seconds(5).build();
        let reconciler = ConfigReconciler::new(Arc::new(FakeCluster::default()), &options);

        let configuration = reconciler.webhook_configuration(&registry(), &identity(), CA_BUNDLE);
        assert_eq!(configuration.name_any(), "gatehouse-validating");

        let webhooks = configuration.webhooks.expect("webhooks must be set");
        assert_eq!(webhooks.len(), 2);

        let pods = &webhooks[0];
        assert_eq!(pods.name, "webhook-pods-v1.core.admission.gatehouse.dev");
        assert_eq!(pods.side_effects, "None");
        assert_eq!(pods.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(pods.timeout_seconds, Some(5));
        assert_eq!(pods.admission_review_versions, ["v1", "v1beta1"]);
        assert_eq!(
            pods.client_config,
            WebhookClientConfig {
                service: Some(ServiceReference {
                    name: "gatehouse".to_owned(),
                    namespace: "webhooks".to_owned(),
                    path: Some("/validate-v1-pod".to_owned()),
                    port: Some(443),
                }),
                ca_bundle: Some(ByteString(CA_BUNDLE.as_bytes().to_vec())),
                url: None,
            }
        );
        assert_eq!(
            pods.rules,
            Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_owned()]),
                resources: Some(vec!["pods".to_owned()]),
                ..RuleWithOperations::default()
            }])
        );

        let deployments = &webhooks[1];
        assert_eq!(deployments.name, "webhook-deployments-v1.apps");
        assert_eq!(
            deployments
                .rules
                .as_ref()
                .and_then(|rules| rules[0].api_groups.clone()),
            Some(vec!["apps".to_owned()])
        );
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let cluster = Arc::new(FakeCluster::default());
        let reconciler = ConfigReconciler::new(cluster.clone(), &WebhookOptions::new("gatehouse"));
        let registry = registry();

        let first = reconciler
            .reconcile(&registry, &identity(), CA_BUNDLE)
            .await
            .expect("configuration must be applied");
        let second = reconciler
            .reconcile(&registry, &identity(), CA_BUNDLE)
            .await
            .expect("configuration must be applied");
        assert_eq!(first.resource_version(), second.resource_version());

        let rotated = reconciler
            .reconcile(&registry, &identity(), "rotated")
            .await
            .expect("configuration must be applied");
        assert_ne!(rotated.resource_version(), first.resource_version());
    }
}
