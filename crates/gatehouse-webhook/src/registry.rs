//! The table of validators served by the webhook, keyed by [`ResourceIdentity`].
use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use kube::core::{DynamicObject, admission::AdmissionRequest};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::{
    path::validate_path,
    resource::ResourceIdentity,
    secrets::SecretProvider,
    validation::{AcquireSecretsSnafu, ValidationContext, ValidationError, Validator},
};

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("{first} and {second} would both be served on {path:?}"))]
    ConflictingPaths {
        path: String,
        first: ResourceIdentity,
        second: ResourceIdentity,
    },
}

#[derive(Debug, Snafu)]
pub enum AdmissionError {
    #[snafu(display("admission request does not contain an object"))]
    MissingObject,

    #[snafu(display("failed to decode {identity}"))]
    DecodeObject {
        source: serde_json::Error,
        identity: ResourceIdentity,
    },

    #[snafu(display("failed to validate {identity}"))]
    Validate {
        source: ValidationError,
        identity: ResourceIdentity,
    },
}

/// Decodes the object of an admission request and validates it.
///
/// Implemented for every registered validator by the [`Registry`], which erases
/// the resource type. The `object` of `request` is passed separately and still
/// undecoded, objects of types without a validator are never decoded.
#[async_trait]
pub trait AdmissionHandler: Send + Sync {
    async fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        object: Option<&Value>,
        secrets: &dyn SecretProvider,
    ) -> Result<(), AdmissionError>;
}

struct TypedHandler<R, V> {
    validator: V,
    resource: PhantomData<fn() -> R>,
}

#[async_trait]
impl<R, V> AdmissionHandler for TypedHandler<R, V>
where
    R: DeserializeOwned + Send + Sync,
    V: Validator<R>,
{
    async fn admit(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        object: Option<&Value>,
        secrets: &dyn SecretProvider,
    ) -> Result<(), AdmissionError> {
        let identity = ResourceIdentity::from(&request.kind);
        let object = object.context(MissingObjectSnafu)?;
        let resource = R::deserialize(object).with_context(|_| DecodeObjectSnafu {
            identity: identity.clone(),
        })?;

        let session = secrets
            .acquire(request.namespace.as_deref())
            .context(AcquireSecretsSnafu)
            .with_context(|_| ValidateSnafu {
                identity: identity.clone(),
            })?;

        let result = self
            .validator
            .validate(&resource, &ValidationContext::new(request, session.as_ref()))
            .await;
        drop(session);

        result.context(ValidateSnafu { identity })
    }
}

/// A validator together with where and for which resources it is served.
pub struct Registration {
    identity: ResourceIdentity,
    resource_name: String,
    path: String,
    handler: Arc<dyn AdmissionHandler>,
}

impl Registration {
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// The plural resource name used in the webhook rules, for example `pods`.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// The URL path the validator is served on.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handler(&self) -> &Arc<dyn AdmissionHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("identity", &self.identity)
            .field("resource_name", &self.resource_name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Maps resource types to their validators.
///
/// The registry is assembled before the [`WebhookServer`][crate::WebhookServer]
/// is created and is read-only afterwards.
///
/// ```
/// use gatehouse_webhook::{
///     registry::Registry,
///     validation::{ValidationContext, ValidationError, from_fn},
/// };
/// use k8s_openapi::api::core::v1::Pod;
///
/// let mut registry = Registry::new();
/// registry.register_resource::<Pod, _>(from_fn(|pod: &Pod, _: &ValidationContext<'_>| {
///     match pod.metadata.name.as_deref() {
///         Some(name) if !name.is_empty() => Ok(()),
///         _ => Err(ValidationError::rejected("name must be non-empty")),
///     }
/// }));
///
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    registrations: Vec<Registration>,
    index: HashMap<ResourceIdentity, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `validator` for resources of type `identity`, which are called
    /// `resource_name` in webhook rules.
    ///
    /// Registering an identity twice replaces the earlier registration.
    pub fn register<R, V>(
        &mut self,
        identity: ResourceIdentity,
        resource_name: impl Into<String>,
        validator: V,
    ) -> &mut Self
    where
        R: DeserializeOwned + Send + Sync + 'static,
        V: Validator<R> + 'static,
    {
        let registration = Registration {
            path: validate_path(&identity),
            resource_name: resource_name.into(),
            handler: Arc::new(TypedHandler {
                validator,
                resource: PhantomData,
            }),
            identity,
        };

        debug!(
            resource.identity = %registration.identity,
            url.path = %registration.path,
            "registering validator"
        );

        match self.index.get(&registration.identity) {
            Some(&position) => {
                warn!(
                    resource.identity = %registration.identity,
                    "validator registered twice, replacing the earlier registration"
                );
                self.registrations[position] = registration;
            }
            None => {
                self.index
                    .insert(registration.identity.clone(), self.registrations.len());
                self.registrations.push(registration);
            }
        }

        self
    }

    /// Registers `validator` for the statically typed resource `K`.
    pub fn register_resource<K, V>(&mut self, validator: V) -> &mut Self
    where
        K: kube::Resource<DynamicType = ()> + DeserializeOwned + Send + Sync + 'static,
        V: Validator<K> + 'static,
    {
        self.register::<K, V>(ResourceIdentity::of::<K>(), K::plural(&()), validator)
    }

    pub fn lookup(&self, identity: &ResourceIdentity) -> Option<&Registration> {
        self.index
            .get(identity)
            .map(|&position| &self.registrations[position])
    }

    /// Iterates over the registrations in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.iter()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Ensures no two registrations are served on the same path.
    pub fn check_paths(&self) -> Result<(), RegistryError> {
        let mut seen = HashMap::<&str, &ResourceIdentity>::new();

        for registration in &self.registrations {
            if let Some(first) = seen.insert(&registration.path, &registration.identity) {
                return ConflictingPathsSnafu {
                    path: &registration.path,
                    first: first.clone(),
                    second: registration.identity.clone(),
                }
                .fail();
            }
        }

        Ok(())
    }
}

impl<'a> IntoIterator for &'a Registry {
    type IntoIter = std::slice::Iter<'a, Registration>;
    type Item = &'a Registration;

    fn into_iter(self) -> Self::IntoIter {
        self.registrations.iter()
    }
}
