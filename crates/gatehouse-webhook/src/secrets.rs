//! Secret resolution for validators.
//!
//! A [`SecretProvider`] hands out one [`SecretSession`] per admission request.
//! The session caches what it resolved and releases it when dropped, so
//! secret values never outlive the request which needed them.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{Api, Client};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument};

#[derive(Debug, Snafu)]
pub enum SecretError {
    #[snafu(display("no namespace to resolve secrets in"))]
    MissingNamespace,

    #[snafu(display("failed to retrieve secret {namespace}/{name}"))]
    GetSecret {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("secret {namespace}/{name} does not exist"))]
    SecretNotFound { namespace: String, name: String },

    #[snafu(display("secret {namespace}/{name} has no key {key:?}"))]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },

    #[snafu(display("key {key:?} of secret {namespace}/{name} is not valid UTF-8"))]
    InvalidUtf8 {
        source: std::string::FromUtf8Error,
        namespace: String,
        name: String,
        key: String,
    },
}

/// Hands out [`SecretSession`]s scoped to a single admission request.
pub trait SecretProvider: Send + Sync {
    /// Opens a session resolving secrets in `namespace`, the namespace of the
    /// object under review.
    fn acquire(&self, namespace: Option<&str>) -> Result<Box<dyn SecretSession>, SecretError>;
}

/// Resolves secret values for the duration of one admission request. Dropping
/// the session releases everything it holds.
#[async_trait]
pub trait SecretSession: Send + Sync {
    async fn resolve(&self, name: &str, key: &str) -> Result<String, SecretError>;
}

/// Resolves Kubernetes [`Secret`]s through the API server.
///
/// Cluster scoped objects have no namespace, their secrets are resolved in the
/// default namespace if one is configured.
#[derive(Clone)]
pub struct KubernetesSecretProvider {
    client: Client,
    default_namespace: Option<String>,
}

impl KubernetesSecretProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            default_namespace: None,
        }
    }

    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = Some(namespace.into());
        self
    }
}

impl SecretProvider for KubernetesSecretProvider {
    fn acquire(&self, namespace: Option<&str>) -> Result<Box<dyn SecretSession>, SecretError> {
        let namespace = namespace
            .or(self.default_namespace.as_deref())
            .context(MissingNamespaceSnafu)?
            .to_owned();

        Ok(Box::new(KubernetesSecretSession::new(
            Api::namespaced(self.client.clone(), &namespace),
            namespace,
        )))
    }
}

/// Fetches a single [`Secret`] by name.
#[async_trait]
trait SecretLookup: Send + Sync {
    async fn get_opt(&self, name: &str) -> Result<Option<Secret>, kube::Error>;
}

#[async_trait]
impl SecretLookup for Api<Secret> {
    async fn get_opt(&self, name: &str) -> Result<Option<Secret>, kube::Error> {
        Api::get_opt(self, name).await
    }
}

/// Fetches every secret at most once and keeps its data until dropped.
struct KubernetesSecretSession<L = Api<Secret>> {
    lookup: L,
    namespace: String,
    cache: Mutex<HashMap<String, BTreeMap<String, ByteString>>>,
}

impl<L: SecretLookup> KubernetesSecretSession<L> {
    fn new(lookup: L, namespace: String) -> Self {
        Self {
            lookup,
            namespace,
            cache: Mutex::default(),
        }
    }

    fn cached(&self, name: &str) -> Option<BTreeMap<String, ByteString>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    async fn fetch(&self, name: &str) -> Result<BTreeMap<String, ByteString>, SecretError> {
        let secret = self
            .lookup
            .get_opt(name)
            .await
            .context(GetSecretSnafu {
                namespace: &self.namespace,
                name,
            })?
            .context(SecretNotFoundSnafu {
                namespace: &self.namespace,
                name,
            })?;

        let data = secret.data.unwrap_or_default();
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), data.clone());

        Ok(data)
    }
}

#[async_trait]
impl<L: SecretLookup> SecretSession for KubernetesSecretSession<L> {
    #[instrument(skip(self), fields(k8s.namespace = %self.namespace))]
    async fn resolve(&self, name: &str, key: &str) -> Result<String, SecretError> {
        let data = match self.cached(name) {
            Some(data) => data,
            None => self.fetch(name).await?,
        };

        let value = data.get(key).context(MissingKeySnafu {
            namespace: &self.namespace,
            name,
            key,
        })?;

        String::from_utf8(value.0.clone()).context(InvalidUtf8Snafu {
            namespace: &self.namespace,
            name,
            key,
        })
    }
}

impl<L> Drop for KubernetesSecretSession<L> {
    fn drop(&mut self) {
        let cache = self.cache.get_mut().unwrap_or_else(PoisonError::into_inner);
        debug!(
            k8s.namespace = %self.namespace,
            secrets = cache.len(),
            "releasing secret session"
        );
        cache.clear();
    }
}
