//! Derives URL paths and webhook names from [`ResourceIdentity`]s.
use crate::{constants::CORE_GROUP_WEBHOOK_DOMAIN, resource::ResourceIdentity};

/// Returns the URL path the validator of `identity` is served on:
/// `/validate-<group>-<version>-<kind>`.
///
/// Dots in the group become dashes and the kind is lowercased. The empty core
/// group is left out, so Pods are validated on `/validate-v1-pod`.
///
/// ```
/// use gatehouse_webhook::{path::validate_path, resource::ResourceIdentity};
///
/// let identity = ResourceIdentity::new("apps", "v1", "Deployment");
/// assert_eq!(validate_path(&identity), "/validate-apps-v1-deployment");
/// ```
pub fn validate_path(identity: &ResourceIdentity) -> String {
    let version = &identity.version;
    let kind = identity.kind.to_lowercase();

    if identity.is_core_group() {
        format!("/validate-{version}-{kind}")
    } else {
        let group = identity.group.replace('.', "-");
        format!("/validate-{group}-{version}-{kind}")
    }
}

/// Returns the fully qualified name of the webhook validating `identity`:
/// `webhook-<resource name>-<version>.<group>`.
///
/// The empty core group would leave a trailing dot, so it is replaced by
/// [`CORE_GROUP_WEBHOOK_DOMAIN`].
pub fn webhook_name(identity: &ResourceIdentity, resource_name: &str) -> String {
    let domain = if identity.is_core_group() {
        CORE_GROUP_WEBHOOK_DOMAIN.to_owned()
    } else {
        identity.group.to_lowercase()
    };

    format!("webhook-{resource_name}-{}.{domain}", identity.version)
}
