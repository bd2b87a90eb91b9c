//! A self-registering validating admission webhook.
//!
//! Validators are collected in a [`Registry`], keyed by the type of resource
//! they validate. The [`WebhookServer`] serves them over HTTPS and takes care of
//! everything needed to be called by the API server:
//!
//! - it publishes a Service pointing at the webhook,
//! - it issues its own CA and serving certificate and rotates them before they
//!   expire,
//! - it keeps a ValidatingWebhookConfiguration in sync with the registered
//!   validators and the current CA.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gatehouse_webhook::{
//!     WebhookDependencies, WebhookOptions, WebhookServer,
//!     registry::Registry,
//!     validation::{ValidationContext, ValidationError, from_fn},
//! };
//! use k8s_openapi::api::core::v1::Pod;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = Registry::new();
//! registry.register_resource::<Pod, _>(from_fn(|pod: &Pod, _: &ValidationContext<'_>| {
//!     match pod.metadata.name.as_deref() {
//!         Some(name) if !name.is_empty() => Ok(()),
//!         _ => Err(ValidationError::rejected("name must be non-empty")),
//!     }
//! }));
//!
//! let options = WebhookOptions::new("pod-validator");
//! let client = kube::Client::try_default().await?;
//! let dependencies = WebhookDependencies::kubernetes(client, &options).await?;
//!
//! WebhookServer::new(registry, options, dependencies)
//!     .await?
//!     .run()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! This library is fully compatible with the [`tracing`] crate and emits debug
//! level tracing data.
use std::{sync::Arc, time::Duration};

use futures_util::{FutureExt as _, pin_mut, select};
use gatehouse_certs::{
    provider::{CertificateProvider, CertificateProviderError},
    store::{CertificateStore, SecretCertificateStore},
};
use kube::Client;
use snafu::{ResultExt, Snafu, ensure};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Instrument as _, debug, info, instrument};

use crate::{
    cluster::{ClusterApi, KubeClusterApi},
    dispatcher::Dispatcher,
    endpoint::{EndpointError, EndpointPublisher},
    maintainer::CertificateMaintainer,
    operator::{OperatorIdentity, OperatorIdentityError},
    reconciler::{ConfigReconciler, ReconcileError},
    registry::RegistryError,
    secrets::{KubernetesSecretProvider, SecretProvider},
    tls::{CertificateResolver, CertificateResolverError, TlsServer, TlsServerError},
};

pub mod cluster;
pub mod constants;
pub mod dispatcher;
pub mod endpoint;
pub mod maintainer;
pub mod operator;
pub mod options;
pub mod path;
pub mod reconciler;
pub mod registry;
pub mod resource;
pub mod secrets;
pub mod tls;
pub mod validation;

// Selected re-exports
pub use crate::{options::WebhookOptions, registry::Registry, resource::ResourceIdentity};

/// Errors which prevent the [`WebhookServer`] from starting.
#[derive(Debug, Snafu)]
pub enum ConfigurationError {
    #[snafu(display("no validators are registered"))]
    NoRegistrations,

    #[snafu(display(
        "the rotation threshold {} must be shorter than the certificate lifetime {}",
        humantime::format_duration(*rotation_threshold),
        humantime::format_duration(*certificate_lifetime)
    ))]
    RotationThresholdTooLarge {
        rotation_threshold: Duration,
        certificate_lifetime: Duration,
    },

    #[snafu(display("registered validators conflict"))]
    ConflictingPaths { source: RegistryError },

    #[snafu(display("failed to resolve the operator identity"))]
    ResolveIdentity { source: OperatorIdentityError },

    #[snafu(display("failed to publish the webhook endpoint"))]
    PublishEndpoint { source: EndpointError },

    #[snafu(display("failed to provide certificates"))]
    ProvideCertificates { source: CertificateProviderError },

    #[snafu(display("failed to create certificate resolver"))]
    CreateCertificateResolver { source: CertificateResolverError },

    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: TlsServerError },

    #[snafu(display("failed to reconcile the webhook configuration"))]
    ReconcileConfiguration { source: ReconcileError },
}

/// Errors which stop a running [`WebhookServer`].
#[derive(Debug, Snafu)]
pub enum WebhookError {
    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: TlsServerError },

    #[snafu(display("failed to create {signal} listener"))]
    CreateSignalListener {
        source: std::io::Error,
        signal: &'static str,
    },
}

/// The collaborators the [`WebhookServer`] talks to.
pub struct WebhookDependencies {
    pub cluster: Arc<dyn ClusterApi>,
    pub certificate_store: Arc<dyn CertificateStore>,
    pub secrets: Arc<dyn SecretProvider>,
}

impl WebhookDependencies {
    /// Talks to the cluster of `client`. Certificates are stored in the
    /// Secret named by [`WebhookOptions::certificate_secret_name`] and secrets
    /// of cluster scoped resources are resolved in the operator namespace.
    pub async fn kubernetes(
        client: Client,
        options: &WebhookOptions,
    ) -> Result<Self, OperatorIdentityError> {
        let identity = OperatorIdentity::resolve(options).await?;

        Ok(Self {
            cluster: Arc::new(KubeClusterApi::new(client.clone())),
            certificate_store: Arc::new(SecretCertificateStore::new(
                client.clone(),
                &identity.namespace,
                options.certificate_secret_name(),
                &options.field_manager,
            )),
            secrets: Arc::new(
                KubernetesSecretProvider::new(client).with_default_namespace(identity.namespace),
            ),
        })
    }
}

/// A ready-to-use validating webhook server.
///
/// Creating the server prepares everything the API server needs to call it.
/// Running it serves the registered validators until SIGINT or SIGTERM is
/// received.
pub struct WebhookServer {
    tls_server: TlsServer,
    maintainer: CertificateMaintainer,
}

impl WebhookServer {
    /// Creates a new ready-to-use webhook server serving the validators of
    /// `registry`.
    ///
    /// In order, this
    ///
    /// - ensures at least one validator is registered and no two validators
    ///   share a path,
    /// - ensures certificates are rotated before they expire, but not right
    ///   after they were issued,
    /// - resolves the [`OperatorIdentity`],
    /// - publishes the webhook Service,
    /// - provides the TLS certificates,
    /// - creates the TLS server,
    /// - applies the ValidatingWebhookConfiguration.
    ///
    /// Any failure is returned as [`ConfigurationError`].
    #[instrument(name = "create_webhook_server", skip_all, fields(operator.name = %options.operator_name))]
    pub async fn new(
        registry: Registry,
        options: WebhookOptions,
        dependencies: WebhookDependencies,
    ) -> Result<Self, ConfigurationError> {
        ensure!(!registry.is_empty(), NoRegistrationsSnafu);
        registry.check_paths().context(ConflictingPathsSnafu)?;
        ensure!(
            options.rotation_threshold < options.certificate_lifetime,
            RotationThresholdTooLargeSnafu {
                rotation_threshold: options.rotation_threshold,
                certificate_lifetime: options.certificate_lifetime,
            }
        );
        let registry = Arc::new(registry);

        let identity = OperatorIdentity::resolve(&options)
            .await
            .context(ResolveIdentitySnafu)?;

        EndpointPublisher::new(dependencies.cluster.clone(), &options)
            .publish(&identity)
            .await
            .context(PublishEndpointSnafu)?;

        let provider = CertificateProvider::new(
            options.certificate_provider_options(&identity.namespace),
            dependencies.certificate_store,
        );
        let (context, provisioning) = provider
            .provide()
            .await
            .context(ProvideCertificatesSnafu)?;
        debug!(%provisioning, certificate_dir = ?context.certificate_dir(), "provided certificates");

        let resolver = Arc::new(
            CertificateResolver::new(context.bundle()).context(CreateCertificateResolverSnafu)?,
        );
        let router = Dispatcher::new(registry.clone(), dependencies.secrets).router();
        let tls_server = TlsServer::new(options.socket_addr(), router, resolver.clone())
            .context(CreateTlsServerSnafu)?;

        let reconciler = ConfigReconciler::new(dependencies.cluster, &options);
        reconciler
            .reconcile(&registry, &identity, context.ca_bundle())
            .await
            .context(ReconcileConfigurationSnafu)?;

        info!(
            validators = registry.len(),
            k8s.namespace = %identity.namespace,
            "created webhook server"
        );

        let maintainer = CertificateMaintainer::new(
            provider,
            resolver,
            reconciler,
            registry,
            identity,
            context,
            options.rotation_check_interval,
        );

        Ok(Self {
            tls_server,
            maintainer,
        })
    }

    /// Runs the webhook server until it fails or a shutdown signal is
    /// received. Certificates are rotated in a background task meanwhile,
    /// failed rotations are retried and never stop the server.
    ///
    /// This does not implement graceful shutdown of the underlying server.
    pub async fn run(self) -> Result<(), WebhookError> {
        debug!("run webhook server");

        let maintainer = tokio::spawn(self.maintainer.run().in_current_span());
        let server = self.tls_server.run().fuse();
        let shutdown = shutdown_signal().fuse();

        // select requires Future + Unpin
        pin_mut!(server, shutdown);

        let result = select! {
            result = server => result.context(RunTlsServerSnafu),
            result = shutdown => result,
        };

        maintainer.abort();
        result
    }
}

async fn shutdown_signal() -> Result<(), WebhookError> {
    let mut sigint = signal(SignalKind::interrupt())
        .context(CreateSignalListenerSnafu { signal: "SIGINT" })?;
    let mut sigterm = signal(SignalKind::terminate())
        .context(CreateSignalListenerSnafu { signal: "SIGTERM" })?;

    debug!("created unix signal handlers");

    select! {
        signal = sigint.recv().fuse() => {
            if signal.is_some() {
                info!("received SIGINT, shutting down");
            }
        },
        signal = sigterm.recv().fuse() => {
            if signal.is_some() {
                info!("received SIGTERM, shutting down");
            }
        },
    };

    Ok(())
}
