//! The [`Validator`] trait implemented by per-resource validation rules.
use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use kube::core::{
    DynamicObject,
    admission::{AdmissionRequest, Operation},
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::secrets::{SecretError, SecretSession};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    /// The resource violates a validation rule. The message is shown to the
    /// client as is.
    #[snafu(display("{message}"))]
    Rejected { message: String },

    #[snafu(display("unknown type {type_name:?}"))]
    UnknownType { type_name: String },

    #[snafu(display("resource does not specify a type"))]
    MissingType,

    #[snafu(display("failed to resolve secret {name:?}"))]
    ResolveSecret { source: SecretError, name: String },

    #[snafu(display("failed to acquire secrets"))]
    AcquireSecrets { source: SecretError },
}

impl ValidationError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Details of the admission request a resource is validated for.
pub struct ValidationContext<'a> {
    pub uid: &'a str,
    pub operation: &'a Operation,
    pub namespace: Option<&'a str>,
    pub name: &'a str,
    pub dry_run: bool,

    /// Resolves secrets referenced by the resource. Only valid during the
    /// validation call.
    pub secrets: &'a dyn SecretSession,
}

impl<'a> ValidationContext<'a> {
    pub fn new(
        request: &'a AdmissionRequest<DynamicObject>,
        secrets: &'a dyn SecretSession,
    ) -> Self {
        Self {
            uid: &request.uid,
            operation: &request.operation,
            namespace: request.namespace.as_deref(),
            name: &request.name,
            dry_run: request.dry_run,
            secrets,
        }
    }

    /// Resolves `key` of the secret `name` through the session of the request.
    pub async fn resolve_secret(&self, name: &str, key: &str) -> Result<String, ValidationError> {
        self.secrets
            .resolve(name, key)
            .await
            .context(ResolveSecretSnafu { name })
    }
}

impl fmt::Debug for ValidationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationContext")
            .field("uid", &self.uid)
            .field("operation", &self.operation)
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

/// Validates decoded resources of type `R`.
///
/// ```
/// use async_trait::async_trait;
/// use gatehouse_webhook::validation::{ValidationContext, ValidationError, Validator};
/// use k8s_openapi::api::core::v1::ConfigMap;
///
/// struct NoEmptyConfigMaps;
///
/// #[async_trait]
/// impl Validator<ConfigMap> for NoEmptyConfigMaps {
///     async fn validate(
///         &self,
///         config_map: &ConfigMap,
///         _context: &ValidationContext<'_>,
///     ) -> Result<(), ValidationError> {
///         match &config_map.data {
///             Some(data) if !data.is_empty() => Ok(()),
///             _ => Err(ValidationError::rejected("data must not be empty")),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Validator<R>: Send + Sync {
    async fn validate(
        &self,
        resource: &R,
        context: &ValidationContext<'_>,
    ) -> Result<(), ValidationError>;
}

/// A [`Validator`] backed by a synchronous function, created by [`from_fn`].
pub struct FromFn<F>(F);

/// Turns a synchronous function into a [`Validator`].
pub fn from_fn<R, F>(f: F) -> FromFn<F>
where
    F: Fn(&R, &ValidationContext<'_>) -> Result<(), ValidationError> + Send + Sync,
{
    FromFn(f)
}

#[async_trait]
impl<R, F> Validator<R> for FromFn<F>
where
    R: Sync,
    F: Fn(&R, &ValidationContext<'_>) -> Result<(), ValidationError> + Send + Sync,
{
    async fn validate(
        &self,
        resource: &R,
        context: &ValidationContext<'_>,
    ) -> Result<(), ValidationError> {
        (self.0)(resource, context)
    }
}

type Constructor<R> = Box<dyn Fn() -> Box<dyn Validator<R>> + Send + Sync>;

/// Selects the validator of a resource by a type field of the resource itself.
///
/// Resources of one kind often carry a discriminator, like the `type` of a
/// Secret. Each type name maps to a validator constructor, unknown type names
/// fail validation.
pub struct TypeRegistry<R> {
    type_of: fn(&R) -> Option<&str>,
    constructors: HashMap<String, Constructor<R>>,
}

impl<R> TypeRegistry<R> {
    /// Creates an empty registry reading the type name with `type_of`.
    pub fn new(type_of: fn(&R) -> Option<&str>) -> Self {
        Self {
            type_of,
            constructors: HashMap::new(),
        }
    }

    /// Registers `constructor` for resources of `type_name`. Registering a type
    /// name again replaces the previous constructor.
    pub fn register<V, C>(&mut self, type_name: impl Into<String>, constructor: C) -> &mut Self
    where
        V: Validator<R> + 'static,
        C: Fn() -> V + Send + Sync + 'static,
    {
        self.constructors.insert(
            type_name.into(),
            Box::new(move || Box::new(constructor()) as Box<dyn Validator<R>>),
        );
        self
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

#[async_trait]
impl<R> Validator<R> for TypeRegistry<R>
where
    R: Send + Sync,
{
    async fn validate(
        &self,
        resource: &R,
        context: &ValidationContext<'_>,
    ) -> Result<(), ValidationError> {
        let type_name = (self.type_of)(resource).context(MissingTypeSnafu)?;
        let constructor = self
            .constructors
            .get(type_name)
            .context(UnknownTypeSnafu { type_name })?;

        constructor().validate(resource, context).await
    }
}
