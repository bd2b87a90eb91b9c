//! Provides the TLS material of the webhook: reuses stored material while it
//! is valid for the service and rotates it before it expires.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument};

use crate::{
    PrivateKeyType,
    bundle::{
        CertificateBundle, InspectBundleError, remaining_validity, subject_alternative_dns_names,
    },
    issuer::{CA_SUBJECT, CertificateAuthority, IssueError},
    keys::{EcdsaKey, KeyPair, RsaKey},
    store::{
        CA_CERTIFICATE_KEY, CertificateStore, StoreError, TLS_CERTIFICATE_KEY, TLS_PRIVATE_KEY_KEY,
        write_file,
    },
};

const DAY: u64 = 24 * 60 * 60;

/// CAs are valid for ten years by default.
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * DAY);

/// Serving certificates are valid for one year by default.
pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(365 * DAY);

pub const DEFAULT_ROTATION_THRESHOLD: Duration = Duration::from_secs(30 * DAY);

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

#[derive(Debug, Snafu)]
pub enum CertificateProviderError {
    #[snafu(display("failed to load the stored certificate bundle"))]
    LoadBundle { source: StoreError },

    #[snafu(display("failed to persist the certificate bundle"))]
    SaveBundle { source: StoreError },

    #[snafu(display("failed to generate {key_type} certificates"))]
    Generate {
        source: IssueError,
        key_type: PrivateKeyType,
    },

    #[snafu(display("failed to run certificate generation in blocking thread"))]
    TokioSpawnBlocking { source: tokio::task::JoinError },

    #[snafu(display("failed to inspect the generated leaf certificate"))]
    InspectGenerated { source: InspectBundleError },

    #[snafu(display("failed to create certificate directory {path:?}"))]
    CreateCertificateDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {path:?}"))]
    WriteCertificateFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Settings of the [`CertificateProvider`].
#[derive(Clone, Debug)]
pub struct CertificateProviderOptions {
    /// Name of the Service fronting the webhook.
    pub service_name: String,

    /// Namespace of the Service fronting the webhook.
    pub namespace: String,

    pub cluster_domain: String,
    pub key_type: PrivateKeyType,
    pub ca_validity: Duration,
    pub certificate_validity: Duration,

    /// Stored leaf certificates with less remaining validity are replaced.
    pub rotation_threshold: Duration,

    /// Directory receiving `tls.crt`, `tls.key` and `ca.crt`.
    pub certificate_dir: PathBuf,
}

impl CertificateProviderOptions {
    pub fn new(
        service_name: impl Into<String>,
        namespace: impl Into<String>,
        certificate_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            namespace: namespace.into(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_owned(),
            key_type: PrivateKeyType::default(),
            ca_validity: DEFAULT_CA_VALIDITY,
            certificate_validity: DEFAULT_CERTIFICATE_VALIDITY,
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
            certificate_dir: certificate_dir.into(),
        }
    }

    /// The DNS names the leaf certificate must cover:
    /// `<svc>`, `<svc>.<ns>`, `<svc>.<ns>.svc` and `<svc>.<ns>.svc.<cluster domain>`.
    pub fn subject_alternative_dns_names(&self) -> Vec<String> {
        let service = &self.service_name;
        let namespace = &self.namespace;

        vec![
            service.clone(),
            format!("{service}.{namespace}"),
            format!("{service}.{namespace}.svc"),
            format!("{service}.{namespace}.svc.{}", self.cluster_domain),
        ]
    }

    fn subject(&self) -> String {
        format!("CN={}.{}.svc", self.service_name, self.namespace)
    }
}

/// Whether [`CertificateProvider::provide`] reused stored material or
/// generated new material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Provisioning {
    Reused,
    Generated,
}

/// The TLS material currently in use, together with the directory it was
/// written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateContext {
    bundle: CertificateBundle,
    certificate_dir: PathBuf,
    not_before: SystemTime,
    not_after: SystemTime,
}

impl CertificateContext {
    pub fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }

    /// The PEM-encoded CA certificate, used as `caBundle` of the webhook
    /// configuration.
    pub fn ca_bundle(&self) -> &str {
        self.bundle.ca_bundle()
    }

    pub fn certificate_dir(&self) -> &Path {
        &self.certificate_dir
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.certificate_dir.join(TLS_CERTIFICATE_KEY)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.certificate_dir.join(TLS_PRIVATE_KEY_KEY)
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }
}

/// Issues a self-signed CA and a leaf certificate for the webhook Service,
/// persisted in a [`CertificateStore`].
pub struct CertificateProvider {
    options: CertificateProviderOptions,
    store: Arc<dyn CertificateStore>,
}

impl CertificateProvider {
    pub fn new(options: CertificateProviderOptions, store: Arc<dyn CertificateStore>) -> Self {
        Self { options, store }
    }

    pub fn options(&self) -> &CertificateProviderOptions {
        &self.options
    }

    /// Returns usable TLS material, generating and persisting new material if
    /// the stored one is missing, unparsable, issued for other DNS names or
    /// about to expire. The material is written to the certificate directory
    /// in both cases.
    #[instrument(
        name = "provide_certificates",
        skip(self),
        fields(
            k8s.service.name = %self.options.service_name,
            k8s.namespace = %self.options.namespace,
        )
    )]
    pub async fn provide(
        &self,
    ) -> Result<(CertificateContext, Provisioning), CertificateProviderError> {
        let stored = self.store.load().await.context(LoadBundleSnafu)?;

        let (bundle, provisioning) = match stored.filter(|bundle| self.is_reusable(bundle)) {
            Some(bundle) => {
                debug!("reusing stored certificates");
                (bundle, Provisioning::Reused)
            }
            None => {
                let bundle = self.generate().await?;
                self.store.save(&bundle).await.context(SaveBundleSnafu)?;
                info!("generated and stored new certificates");
                (bundle, Provisioning::Generated)
            }
        };

        let leaf = bundle.leaf_certificate().context(InspectGeneratedSnafu)?;
        let validity = leaf.tbs_certificate.validity;
        self.write_certificate_dir(&bundle).await?;

        Ok((
            CertificateContext {
                bundle,
                certificate_dir: self.options.certificate_dir.clone(),
                not_before: validity.not_before.to_system_time(),
                not_after: validity.not_after.to_system_time(),
            },
            provisioning,
        ))
    }

    fn is_reusable(&self, bundle: &CertificateBundle) -> bool {
        let leaf = match bundle.leaf_certificate() {
            Ok(leaf) => leaf,
            Err(err) => {
                info!(error = %err, "stored leaf certificate is unparsable");
                return false;
            }
        };

        let keys_parse = match self.options.key_type {
            PrivateKeyType::Ecdsa => keys_parse::<EcdsaKey>(bundle),
            PrivateKeyType::Rsa => keys_parse::<RsaKey>(bundle),
        };
        if !keys_parse {
            info!(
                key_type = %self.options.key_type,
                "stored private keys are unparsable or of another key type"
            );
            return false;
        }

        let covered = subject_alternative_dns_names(&leaf);
        let missing = self
            .options
            .subject_alternative_dns_names()
            .into_iter()
            .filter(|name| !covered.contains(name))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            info!(?missing, "stored leaf certificate does not cover all DNS names");
            return false;
        }

        let remaining = remaining_validity(&leaf, SystemTime::now());
        if remaining < self.options.rotation_threshold {
            info!(
                remaining = %humanize(remaining),
                threshold = %humanize(self.options.rotation_threshold),
                "stored leaf certificate is about to expire"
            );
            return false;
        }

        true
    }

    async fn generate(&self) -> Result<CertificateBundle, CertificateProviderError> {
        let options = self.options.clone();

        // Key generation can take a while, especially for RSA.
        tokio::task::spawn_blocking(move || {
            let key_type = options.key_type;
            let generated = match key_type {
                PrivateKeyType::Ecdsa => generate::<EcdsaKey>(&options),
                PrivateKeyType::Rsa => generate::<RsaKey>(&options),
            };
            generated.context(GenerateSnafu { key_type })
        })
        .await
        .context(TokioSpawnBlockingSnafu)?
    }

    async fn write_certificate_dir(
        &self,
        bundle: &CertificateBundle,
    ) -> Result<(), CertificateProviderError> {
        let directory = &self.options.certificate_dir;
        tokio::fs::create_dir_all(directory)
            .await
            .with_context(|_| CreateCertificateDirSnafu { path: directory })?;

        for (file_name, content, private) in [
            (TLS_CERTIFICATE_KEY, bundle.certificate_pem.as_str(), false),
            (TLS_PRIVATE_KEY_KEY, bundle.private_key_pem.as_str(), true),
            (CA_CERTIFICATE_KEY, bundle.ca_certificate_pem.as_str(), false),
        ] {
            let path = directory.join(file_name);
            write_file(&path, content, private)
                .await
                .context(WriteCertificateFileSnafu { path })?;
        }

        Ok(())
    }
}

fn keys_parse<K: KeyPair>(bundle: &CertificateBundle) -> bool {
    K::from_pem(&bundle.ca_private_key_pem).is_ok() && K::from_pem(&bundle.private_key_pem).is_ok()
}

fn generate<K: KeyPair>(
    options: &CertificateProviderOptions,
) -> Result<CertificateBundle, IssueError> {
    let ca = CertificateAuthority::<K>::generate(CA_SUBJECT, options.ca_validity)?;
    let serving = ca.issue(
        &options.subject(),
        &options.subject_alternative_dns_names(),
        options.certificate_validity,
    )?;

    Ok(CertificateBundle {
        ca_certificate_pem: ca.certificate().certificate_pem()?,
        ca_private_key_pem: ca.certificate().private_key_pem()?,
        certificate_pem: serving.certificate_pem()?,
        private_key_pem: serving.private_key_pem()?,
    })
}

fn humanize(duration: Duration) -> humantime::FormattedDuration {
    // Sub-second precision only adds noise to the logs.
    humantime::format_duration(Duration::from_secs(duration.as_secs()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rstest::rstest;

    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[derive(Default)]
    struct MemoryStore {
        bundle: Mutex<Option<CertificateBundle>>,
        saves: Mutex<usize>,
    }

    #[async_trait]
    impl CertificateStore for MemoryStore {
        async fn load(&self) -> Result<Option<CertificateBundle>, StoreError> {
            Ok(self.bundle.lock().expect("lock must not be poisoned").clone())
        }

        async fn save(&self, bundle: &CertificateBundle) -> Result<(), StoreError> {
            *self.bundle.lock().expect("lock must not be poisoned") = Some(bundle.clone());
            *self.saves.lock().expect("lock must not be poisoned") += 1;
            Ok(())
        }
    }

    fn options(
        directory: &Path,
        service_name: &str,
        rotation_threshold: Duration,
    ) -> CertificateProviderOptions {
        CertificateProviderOptions {
            ca_validity: 10 * HOUR,
            certificate_validity: 5 * HOUR,
            rotation_threshold,
            ..CertificateProviderOptions::new(service_name, "webhooks", directory)
        }
    }

    #[test]
    fn dns_names() {
        let options = CertificateProviderOptions::new("gatehouse", "webhooks", "/tmp");
        assert_eq!(options.subject_alternative_dns_names(), vec![
            "gatehouse",
            "gatehouse.webhooks",
            "gatehouse.webhooks.svc",
            "gatehouse.webhooks.svc.cluster.local",
        ]);
    }

    #[tokio::test]
    async fn generates_persists_and_writes_files() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let store = Arc::new(MemoryStore::default());
        let provider =
            CertificateProvider::new(options(directory.path(), "gatehouse", HOUR), store.clone());

        let (context, provisioning) = provider.provide().await.expect("provide must succeed");
        assert_eq!(provisioning, Provisioning::Generated);
        assert_eq!(*store.saves.lock().expect("lock must not be poisoned"), 1);
        assert_eq!(
            store.bundle.lock().expect("lock must not be poisoned").as_ref(),
            Some(context.bundle())
        );

        let leaf = context.bundle().leaf_certificate().expect("leaf certificate must parse");
        assert_eq!(
            subject_alternative_dns_names(&leaf),
            provider.options().subject_alternative_dns_names()
        );

        let written_ca = tokio::fs::read_to_string(directory.path().join("ca.crt"))
            .await
            .expect("CA must be written");
        assert_eq!(written_ca, context.ca_bundle());
        assert!(context.certificate_path().exists());
        assert!(context.private_key_path().exists());
        assert!(!directory.path().join("ca.key").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;

            let metadata = std::fs::metadata(context.private_key_path())
                .expect("private key must be written");
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        }
    }

    #[rstest]
    #[case::above_threshold(HOUR, Provisioning::Reused)]
    #[case::below_threshold(6 * HOUR, Provisioning::Generated)]
    #[tokio::test]
    async fn rotation_threshold(#[case] threshold: Duration, #[case] expected: Provisioning) {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let store = Arc::new(MemoryStore::default());

        // Seed the store with material that is valid for five hours.
        let seeding =
            CertificateProvider::new(options(directory.path(), "gatehouse", HOUR), store.clone());
        let (first, _) = seeding.provide().await.expect("certificates must be provided");

        let provider = CertificateProvider::new(
            options(directory.path(), "gatehouse", threshold),
            store.clone(),
        );
        let (second, provisioning) = provider
            .provide()
            .await
            .expect("certificates must be provided");

        assert_eq!(provisioning, expected);
        assert_eq!(first == second, expected == Provisioning::Reused);
    }

    #[tokio::test]
    async fn regenerates_for_other_service() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let store = Arc::new(MemoryStore::default());

        CertificateProvider::new(options(directory.path(), "gatehouse", HOUR), store.clone())
            .provide()
            .await
            .expect("certificates must be provided");

        let (_, provisioning) =
            CertificateProvider::new(options(directory.path(), "other", HOUR), store.clone())
                .provide()
                .await
                .expect("certificates must be provided");
        assert_eq!(provisioning, Provisioning::Generated);
    }

    #[tokio::test]
    async fn regenerates_for_other_key_type() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let store = Arc::new(MemoryStore::default());

        CertificateProvider::new(options(directory.path(), "gatehouse", HOUR), store.clone())
            .provide()
            .await
            .expect("certificates must be provided");

        let rsa_options = CertificateProviderOptions {
            key_type: PrivateKeyType::Rsa,
            ..options(directory.path(), "gatehouse", HOUR)
        };
        let (_, provisioning) = CertificateProvider::new(rsa_options, store.clone())
            .provide()
            .await
            .expect("certificates must be provided");
        assert_eq!(provisioning, Provisioning::Generated);
    }

    #[tokio::test]
    async fn regenerates_unparsable_material() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let store = Arc::new(MemoryStore::default());
        *store.bundle.lock().expect("lock must not be poisoned") = Some(CertificateBundle {
            ca_certificate_pem: "garbage".to_owned(),
            ca_private_key_pem: "garbage".to_owned().into(),
            certificate_pem: "garbage".to_owned(),
            private_key_pem: "garbage".to_owned().into(),
        });

        let provider =
            CertificateProvider::new(options(directory.path(), "gatehouse", HOUR), store.clone());
        let (_, provisioning) = provider.provide().await.expect("certificates must be provided");
        assert_eq!(provisioning, Provisioning::Generated);
        assert_eq!(*store.saves.lock().expect("lock must not be poisoned"), 1);
    }
}
