//! Contains various constant definitions, mostly default ports, addresses and
//! well-known names.
use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

/// The default HTTPS port `9876` the webhook server listens on.
pub const DEFAULT_WEBHOOK_PORT: u16 = 9876;

/// The default port `443` of the Service fronting the webhook.
pub const DEFAULT_SERVICE_PORT: u16 = 443;

/// The name of the Service port.
pub const SERVICE_PORT_NAME: &str = "https";

/// The default IP address [`Ipv4Addr::UNSPECIFIED`] (`0.0.0.0`) the webhook server binds to,
/// which represents binding on all network addresses.
pub const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The directory the serving certificate and key are written to.
pub const DEFAULT_CERTIFICATE_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Liveness route, served without request tracing.
pub const HEALTH_PATH: &str = "/health";

/// The time the API server waits for a webhook response.
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 10;

/// Field manager used for server-side apply.
pub const DEFAULT_FIELD_MANAGER: &str = "gatehouse-webhook";

/// How often the background task checks whether the certificate must be rotated.
pub const DEFAULT_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The label selecting the webhook pods, its value is the operator name.
pub const SELECTOR_LABEL: &str = "name";

/// Recommended label naming the application, set on the webhook Service.
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Recommended label naming the tool managing an object, set on the webhook
/// Service.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// The namespace file mounted into every pod with a service account token.
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Environment variable consulted for the namespace outside of a pod.
pub const WEBHOOK_NAMESPACE_ENV: &str = "WEBHOOK_NAMESPACE";

/// Webhook names must be fully qualified. Registrations of the core group use
/// this domain instead of their empty group.
pub const CORE_GROUP_WEBHOOK_DOMAIN: &str = "core.admission.gatehouse.dev";

/// The admission review versions the dispatcher understands.
pub const ADMISSION_REVIEW_VERSIONS: [&str; 2] = ["v1", "v1beta1"];

/// The operations validated by the registered webhooks.
pub const VALIDATED_OPERATIONS: [&str; 2] = ["CREATE", "UPDATE"];

/// Calling the webhooks has no side effects besides the admission decision.
pub const SIDE_EFFECTS: &str = "None";

/// Requests are rejected if the webhook cannot be reached.
pub const FAILURE_POLICY: &str = "Fail";
