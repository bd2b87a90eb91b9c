//! Durable storage for the [`CertificateBundle`] of the webhook, so that
//! restarts reuse the material while it is valid.
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{
    Api, Client,
    api::{ObjectMeta, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::bundle::CertificateBundle;

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

pub const CA_CERTIFICATE_KEY: &str = "ca.crt";
pub const CA_PRIVATE_KEY_KEY: &str = "ca.key";
pub const TLS_CERTIFICATE_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Files holding private keys are only accessible by their owner.
#[cfg(unix)]
const PRIVATE_KEY_FILE_MODE: u32 = 0o600;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("failed to retrieve secret {namespace}/{name}"))]
    GetSecret {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to apply secret {namespace}/{name}"))]
    ApplySecret {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to read {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {path:?}"))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to create directory {path:?}"))]
    CreateDirectory {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Loads and saves the [`CertificateBundle`] of the webhook.
///
/// `load` returns [`None`] if no complete bundle is stored. Errors are
/// reserved for the store being unreachable or unusable.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn load(&self) -> Result<Option<CertificateBundle>, StoreError>;

    /// Overwrites the stored bundle. Saving the same bundle twice is a no-op.
    async fn save(&self, bundle: &CertificateBundle) -> Result<(), StoreError>;
}

/// Stores the bundle in a `kubernetes.io/tls` [`Secret`].
///
/// The leaf certificate and key use the well-known `tls.crt` and `tls.key`
/// entries, the CA is stored alongside as `ca.crt` and `ca.key`.
pub struct SecretCertificateStore {
    client: Client,
    namespace: String,
    name: String,
    field_manager: String,
}

impl SecretCertificateStore {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        name: impl Into<String>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            field_manager: field_manager.into(),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl CertificateStore for SecretCertificateStore {
    #[instrument(skip(self), fields(k8s.namespace = %self.namespace, k8s.secret.name = %self.name))]
    async fn load(&self) -> Result<Option<CertificateBundle>, StoreError> {
        let secret = self
            .api()
            .get_opt(&self.name)
            .await
            .with_context(|_| GetSecretSnafu {
                namespace: &self.namespace,
                name: &self.name,
            })?;

        let Some(secret) = secret else {
            debug!("certificate secret does not exist yet");
            return Ok(None);
        };

        if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
            warn!(
                secret.type = ?secret.type_,
                "certificate secret has an unexpected type, ignoring its content"
            );
            return Ok(None);
        }

        Ok(bundle_from_secret_data(secret.data.unwrap_or_default()))
    }

    #[instrument(skip_all, fields(k8s.namespace = %self.namespace, k8s.secret.name = %self.name))]
    async fn save(&self, bundle: &CertificateBundle) -> Result<(), StoreError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            type_: Some(TLS_SECRET_TYPE.to_owned()),
            data: Some(bundle_to_secret_data(bundle)),
            ..Secret::default()
        };

        let patch_params = PatchParams::apply(&self.field_manager).force();
        self.api()
            .patch(&self.name, &patch_params, &Patch::Apply(&secret))
            .await
            .with_context(|_| ApplySecretSnafu {
                namespace: &self.namespace,
                name: &self.name,
            })?;

        debug!("stored certificate bundle in secret");
        Ok(())
    }
}

fn bundle_to_secret_data(bundle: &CertificateBundle) -> BTreeMap<String, ByteString> {
    [
        (CA_CERTIFICATE_KEY, bundle.ca_certificate_pem.as_bytes()),
        (CA_PRIVATE_KEY_KEY, bundle.ca_private_key_pem.as_bytes()),
        (TLS_CERTIFICATE_KEY, bundle.certificate_pem.as_bytes()),
        (TLS_PRIVATE_KEY_KEY, bundle.private_key_pem.as_bytes()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), ByteString(value.to_vec())))
    .collect()
}

fn bundle_from_secret_data(mut data: BTreeMap<String, ByteString>) -> Option<CertificateBundle> {
    let mut take = |key: &str| {
        let value = data.remove(key).map(|bytes| String::from_utf8(bytes.0));
        match value {
            Some(Ok(value)) => Some(value),
            Some(Err(_)) => {
                warn!(key, "certificate secret entry is not valid UTF-8");
                None
            }
            None => {
                debug!(key, "certificate secret entry is missing");
                None
            }
        }
    };

    Some(CertificateBundle {
        ca_certificate_pem: take(CA_CERTIFICATE_KEY)?,
        ca_private_key_pem: Zeroizing::new(take(CA_PRIVATE_KEY_KEY)?),
        certificate_pem: take(TLS_CERTIFICATE_KEY)?,
        private_key_pem: Zeroizing::new(take(TLS_PRIVATE_KEY_KEY)?),
    })
}

/// Stores the bundle as four PEM files in a local directory. Intended for
/// running the webhook outside of a cluster.
#[derive(Clone, Debug)]
pub struct DirectoryCertificateStore {
    directory: PathBuf,
}

impl DirectoryCertificateStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    async fn read(&self, file_name: &str) -> Result<Option<String>, StoreError> {
        let path = self.directory.join(file_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                warn!(?path, "certificate file is not valid UTF-8");
                Ok(None)
            }
            Err(source) => Err(StoreError::ReadFile { source, path }),
        }
    }
}

#[async_trait]
impl CertificateStore for DirectoryCertificateStore {
    #[instrument(skip(self), fields(directory = ?self.directory))]
    async fn load(&self) -> Result<Option<CertificateBundle>, StoreError> {
        let (Some(ca_certificate_pem), Some(ca_private_key_pem), Some(certificate_pem), Some(private_key_pem)) = (
            self.read(CA_CERTIFICATE_KEY).await?,
            self.read(CA_PRIVATE_KEY_KEY).await?,
            self.read(TLS_CERTIFICATE_KEY).await?,
            self.read(TLS_PRIVATE_KEY_KEY).await?,
        ) else {
            debug!("certificate directory does not contain a complete bundle");
            return Ok(None);
        };

        Ok(Some(CertificateBundle {
            ca_certificate_pem,
            ca_private_key_pem: Zeroizing::new(ca_private_key_pem),
            certificate_pem,
            private_key_pem: Zeroizing::new(private_key_pem),
        }))
    }

    #[instrument(skip_all, fields(directory = ?self.directory))]
    async fn save(&self, bundle: &CertificateBundle) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .with_context(|_| CreateDirectorySnafu {
                path: &self.directory,
            })?;

        for (file_name, content, private) in [
            (CA_CERTIFICATE_KEY, bundle.ca_certificate_pem.as_str(), false),
            (CA_PRIVATE_KEY_KEY, bundle.ca_private_key_pem.as_str(), true),
            (TLS_CERTIFICATE_KEY, bundle.certificate_pem.as_str(), false),
            (TLS_PRIVATE_KEY_KEY, bundle.private_key_pem.as_str(), true),
        ] {
            let path = self.directory.join(file_name);
            write_file(&path, content, private)
                .await
                .context(WriteFileSnafu { path })?;
        }

        Ok(())
    }
}

/// Replaces the content of the file at `path`. On unix, private files are
/// restricted to mode 0600 before the content is written.
#[cfg_attr(not(unix), allow(unused_variables))]
pub(crate) async fn write_file(path: &Path, content: &str, private: bool) -> std::io::Result<()> {
    #[cfg(unix)]
    if private {
        use std::{fs::Permissions, os::unix::fs::PermissionsExt as _};

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(PRIVATE_KEY_FILE_MODE)
            .open(path)
            .await?;
        // The mode only applies to newly created files
        file.set_permissions(Permissions::from_mode(PRIVATE_KEY_FILE_MODE))
            .await?;
    }

    tokio::fs::write(path, content).await
}
