//! Rotates the serving certificate in the background and keeps the webhook
//! configuration trusting the current CA.
use std::{sync::Arc, time::Duration};

use gatehouse_certs::provider::{
    CertificateContext, CertificateProvider, CertificateProviderError, Provisioning,
};
use snafu::{ResultExt, Snafu};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument};

use crate::{
    operator::OperatorIdentity,
    reconciler::{ConfigReconciler, ReconcileError},
    registry::Registry,
    tls::{CertificateResolver, CertificateResolverError},
};

#[derive(Debug, Snafu)]
pub enum MaintainerError {
    #[snafu(display("failed to provide certificates"))]
    ProvideCertificates { source: CertificateProviderError },

    #[snafu(display("failed to rotate the served certificate"))]
    RotateCertificate { source: CertificateResolverError },

    #[snafu(display("failed to reconcile the webhook configuration"))]
    ReconcileConfiguration { source: ReconcileError },
}

/// Periodically checks whether the serving certificate is about to expire.
///
/// When the [`CertificateProvider`] hands out new material, the maintainer
///
/// 1. applies the webhook configuration trusting both the old and the new CA,
/// 2. swaps the certificate served by the [`CertificateResolver`],
/// 3. applies the webhook configuration trusting only the new CA.
///
/// The API server can verify every certificate served in between. Checks run
/// one after another and never block request handling.
pub struct CertificateMaintainer {
    provider: CertificateProvider,
    resolver: Arc<CertificateResolver>,
    reconciler: ConfigReconciler,
    registry: Arc<Registry>,
    identity: OperatorIdentity,
    current: CertificateContext,
    check_interval: Duration,
}

impl CertificateMaintainer {
    pub fn new(
        provider: CertificateProvider,
        resolver: Arc<CertificateResolver>,
        reconciler: ConfigReconciler,
        registry: Arc<Registry>,
        identity: OperatorIdentity,
        current: CertificateContext,
        check_interval: Duration,
    ) -> Self {
        Self {
            provider,
            resolver,
            reconciler,
            registry,
            identity,
            current,
            check_interval,
        }
    }

    pub fn current(&self) -> &CertificateContext {
        &self.current
    }

    /// Runs a check every interval, forever.
    ///
    /// A failed check is logged and retried on the next tick. The served
    /// certificate stays in place until a check succeeds.
    pub async fn run(mut self) {
        let mut interval = interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Let the interval tick once, so that the first check does not run
        // right after startup.
        interval.tick().await;

        loop {
            interval.tick().await;

            if let Err(err) = self.check().await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to check certificates, retrying on the next tick"
                );
            }
        }
    }

    /// Provides certificates once and rolls them out if they changed. Returns
    /// whether they changed.
    #[instrument(name = "check_certificates", skip(self))]
    pub async fn check(&mut self) -> Result<bool, MaintainerError> {
        let (context, provisioning) = self
            .provider
            .provide()
            .await
            .context(ProvideCertificatesSnafu)?;

        if provisioning == Provisioning::Reused && context.bundle() == self.current.bundle() {
            debug!("certificates are still valid");
            return Ok(false);
        }

        let previous_ca_bundle = self.current.ca_bundle();
        if previous_ca_bundle != context.ca_bundle() {
            debug!("trusting the previous and the new CA");
            self.reconcile(&transition_ca_bundle(previous_ca_bundle, context.ca_bundle()))
                .await?;
        }

        self.resolver
            .rotate(context.bundle())
            .context(RotateCertificateSnafu)?;
        self.reconcile(context.ca_bundle()).await?;

        info!(
            certificate.not_after = %humantime::format_rfc3339_seconds(context.not_after()),
            "rotated certificates"
        );
        self.current = context;
        Ok(true)
    }

    async fn reconcile(&self, ca_bundle: &str) -> Result<(), MaintainerError> {
        self.reconciler
            .reconcile(&self.registry, &self.identity, ca_bundle)
            .await
            .context(ReconcileConfigurationSnafu)?;
        Ok(())
    }
}

/// Concatenates two PEM bundles.
fn transition_ca_bundle(previous: &str, next: &str) -> String {
    if previous.is_empty() || previous.ends_with('\n') {
        format!("{previous}{next}")
    } else {
        format!("{previous}\n{next}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use gatehouse_certs::{
        bundle::CertificateBundle,
        provider::CertificateProviderOptions,
        store::{CertificateStore, StoreError},
    };
    use k8s_openapi::api::{
        admissionregistration::v1::ValidatingWebhookConfiguration,
        core::v1::{Pod, Service},
    };
    use tokio_rustls::rustls::pki_types::CertificateDer;

    use super::*;
    use crate::{
        WebhookOptions,
        cluster::{ClusterApi, ClusterError, fake::FakeCluster},
        validation::{ValidationContext, from_fn},
    };

    const CONFIGURATION_KEY: &str = "validatingwebhookconfigurations/gatehouse-validating";

    #[derive(Default)]
    struct MemoryStore(Mutex<Option<CertificateBundle>>);

    #[async_trait]
    impl CertificateStore for MemoryStore {
        async fn load(&self) -> Result<Option<CertificateBundle>, StoreError> {
            Ok(self.0.lock().expect("lock must not be poisoned").clone())
        }

        async fn save(&self, bundle: &CertificateBundle) -> Result<(), StoreError> {
            *self.0.lock().expect("lock must not be poisoned") = Some(bundle.clone());
            Ok(())
        }
    }

    /// Records the CA bundle of every applied configuration together with the
    /// leaf certificate served at that moment.
    #[derive(Default)]
    struct RecordingCluster {
        inner: FakeCluster,
        resolver: OnceLock<Arc<CertificateResolver>>,
        applied: Mutex<Vec<(String, CertificateDer<'static>)>>,
    }

    #[async_trait]
    impl ClusterApi for RecordingCluster {
        async fn apply_service(
            &self,
            service: &Service,
            field_manager: &str,
        ) -> Result<Service, ClusterError> {
            self.inner.apply_service(service, field_manager).await
        }

        async fn apply_validating_webhook_configuration(
            &self,
            configuration: &ValidatingWebhookConfiguration,
            field_manager: &str,
        ) -> Result<ValidatingWebhookConfiguration, ClusterError> {
            if let Some(resolver) = self.resolver.get() {
                let ca_bundle = configuration_ca_bundle(configuration)
                    .expect("configuration must carry a CA bundle");
                let served = resolver.current().cert[0].clone();
                self.applied
                    .lock()
                    .expect("lock must not be poisoned")
                    .push((ca_bundle, served));
            }

            self.inner
                .apply_validating_webhook_configuration(configuration, field_manager)
                .await
        }
    }

    /// Fails the first `failures` applications of the webhook configuration.
    struct FlakyCluster {
        inner: FakeCluster,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ClusterApi for FlakyCluster {
        async fn apply_service(
            &self,
            service: &Service,
            field_manager: &str,
        ) -> Result<Service, ClusterError> {
            self.inner.apply_service(service, field_manager).await
        }

        async fn apply_validating_webhook_configuration(
            &self,
            configuration: &ValidatingWebhookConfiguration,
            field_manager: &str,
        ) -> Result<ValidatingWebhookConfiguration, ClusterError> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |failures| {
                    failures.checked_sub(1)
                })
                .is_ok();
            if fail {
                return Err(ClusterError::MissingNamespace {
                    name: "gatehouse-validating".to_owned(),
                });
            }

            self.inner
                .apply_validating_webhook_configuration(configuration, field_manager)
                .await
        }
    }

    fn configuration_ca_bundle(configuration: &ValidatingWebhookConfiguration) -> Option<String> {
        configuration
            .webhooks
            .as_ref()
            .and_then(|webhooks| webhooks[0].client_config.ca_bundle.clone())
            .map(|ca_bundle| String::from_utf8(ca_bundle.0).expect("CA bundle must be PEM"))
    }

    fn ca_bundle(cluster: &FakeCluster) -> Option<String> {
        cluster
            .get::<ValidatingWebhookConfiguration>(CONFIGURATION_KEY)
            .as_ref()
            .and_then(configuration_ca_bundle)
    }

    fn served_certificate(bundle: &CertificateBundle) -> CertificateDer<'static> {
        CertificateResolver::new(bundle)
            .expect("resolver must be created")
            .current()
            .cert[0]
            .clone()
    }

    async fn maintainer(
        rotation_threshold: Duration,
        cluster: Arc<dyn ClusterApi>,
        directory: &std::path::Path,
        check_interval: Duration,
    ) -> CertificateMaintainer {
        let options = WebhookOptions::new("gatehouse");
        let identity = OperatorIdentity {
            name: "gatehouse".to_owned(),
            namespace: "webhooks".to_owned(),
        };

        let mut registry = Registry::new();
        registry.register_resource::<Pod, _>(from_fn(|_: &Pod, _: &ValidationContext<'_>| Ok(())));
        let registry = Arc::new(registry);

        let provider = CertificateProvider::new(
            CertificateProviderOptions {
                ca_validity: Duration::from_secs(10 * 3600),
                certificate_validity: Duration::from_secs(5 * 3600),
                rotation_threshold,
                ..CertificateProviderOptions::new("gatehouse", "webhooks", directory)
            },
            Arc::new(MemoryStore::default()),
        );
        let (context, _) = provider
            .provide()
            .await
            .expect("certificates must be provided");

        let reconciler = ConfigReconciler::new(cluster, &options);
        reconciler
            .reconcile(&registry, &identity, context.ca_bundle())
            .await
            .expect("configuration must be applied");

        CertificateMaintainer::new(
            provider,
            Arc::new(CertificateResolver::new(context.bundle()).expect("resolver must be created")),
            reconciler,
            registry,
            identity,
            context,
            check_interval,
        )
    }

    #[tokio::test]
    async fn keep_valid_certificates() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let cluster = Arc::new(FakeCluster::default());
        let mut maintainer = maintainer(
            Duration::from_secs(3600),
            cluster.clone(),
            directory.path(),
            Duration::from_secs(60),
        )
        .await;
        let before = ca_bundle(&cluster);

        assert!(!maintainer.check().await.expect("check must succeed"));
        assert_eq!(ca_bundle(&cluster), before);
    }

    #[tokio::test]
    async fn rotate_expiring_certificates() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let cluster = Arc::new(FakeCluster::default());
        // Every certificate is below a threshold longer than its validity.
        let mut maintainer = maintainer(
            Duration::from_secs(6 * 3600),
            cluster.clone(),
            directory.path(),
            Duration::from_secs(60),
        )
        .await;
        let before = maintainer.current().clone();

        assert!(maintainer.check().await.expect("check must succeed"));
        assert_ne!(maintainer.current().bundle(), before.bundle());
        assert_eq!(
            ca_bundle(&cluster).as_deref(),
            Some(maintainer.current().ca_bundle())
        );
    }

    #[tokio::test]
    async fn new_ca_is_trusted_before_the_new_certificate_is_served() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let cluster = Arc::new(RecordingCluster::default());
        let mut maintainer = maintainer(
            Duration::from_secs(6 * 3600),
            cluster.clone(),
            directory.path(),
            Duration::from_secs(60),
        )
        .await;
        cluster
            .resolver
            .set(maintainer.resolver.clone())
            .expect("resolver must be set once");
        let before = maintainer.current().clone();

        assert!(maintainer.check().await.expect("check must succeed"));
        let after = maintainer.current();
        assert_ne!(after.ca_bundle(), before.ca_bundle());

        let old_certificate = served_certificate(before.bundle());
        let new_certificate = served_certificate(after.bundle());
        let applied = cluster.applied.lock().expect("lock must not be poisoned");
        assert_eq!(applied.len(), 2);

        // Still serving the old certificate while both CAs are trusted
        let (ca_bundle, served) = &applied[0];
        assert_eq!(served, &old_certificate);
        assert!(ca_bundle.contains(before.ca_bundle()));
        assert!(ca_bundle.contains(after.ca_bundle()));

        // The old CA is dropped only once the new certificate is served
        let (ca_bundle, served) = &applied[1];
        assert_eq!(served, &new_certificate);
        assert_eq!(ca_bundle, after.ca_bundle());
    }

    #[tokio::test]
    async fn failed_reconcile_keeps_the_served_certificate() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let cluster = Arc::new(FlakyCluster {
            inner: FakeCluster::default(),
            failures: AtomicUsize::new(0),
        });
        let mut maintainer = maintainer(
            Duration::from_secs(6 * 3600),
            cluster.clone(),
            directory.path(),
            Duration::from_secs(60),
        )
        .await;
        let before = maintainer.current().clone();
        let served = served_certificate(before.bundle());

        cluster.failures.store(1, Ordering::SeqCst);
        let err = maintainer.check().await.expect_err("check must fail");
        assert!(matches!(err, MaintainerError::ReconcileConfiguration { .. }));
        assert_eq!(maintainer.current().bundle(), before.bundle());
        assert_eq!(maintainer.resolver.current().cert[0], served);
        assert_eq!(
            ca_bundle(&cluster.inner).as_deref(),
            Some(before.ca_bundle())
        );

        assert!(maintainer.check().await.expect("check must succeed"));
        assert_ne!(maintainer.current().bundle(), before.bundle());
    }

    #[tokio::test]
    async fn run_retries_after_a_failed_check() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let cluster = Arc::new(FlakyCluster {
            inner: FakeCluster::default(),
            failures: AtomicUsize::new(0),
        });
        let maintainer = maintainer(
            Duration::from_secs(6 * 3600),
            cluster.clone(),
            directory.path(),
            Duration::from_millis(10),
        )
        .await;
        let before = maintainer.current().ca_bundle().to_owned();

        cluster.failures.store(1, Ordering::SeqCst);
        let task = tokio::spawn(maintainer.run());

        tokio::time::timeout(Duration::from_secs(30), async {
            while ca_bundle(&cluster.inner).as_deref() == Some(before.as_str()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("certificates must rotate after the failed check");

        assert_eq!(cluster.failures.load(Ordering::SeqCst), 0);
        assert!(!task.is_finished());
        task.abort();
    }

    #[test]
    fn transition_bundle_joins_pem_blocks() {
        let old = "-----BEGIN CERTIFICATE-----\nA\n-----END CERTIFICATE-----";
        let new = "-----BEGIN CERTIFICATE-----\nB\n-----END CERTIFICATE-----\n";

        assert_eq!(
            transition_ca_bundle(old, new),
            format!("{old}\n{new}")
        );
        assert_eq!(
            transition_ca_bundle(&format!("{old}\n"), new),
            format!("{old}\n{new}")
        );
    }
}
