//! Contains available options to configure the [WebhookServer][crate::WebhookServer].
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use gatehouse_certs::{
    PrivateKeyType,
    provider::{
        CertificateProviderOptions, DEFAULT_CA_VALIDITY, DEFAULT_CERTIFICATE_VALIDITY,
        DEFAULT_CLUSTER_DOMAIN, DEFAULT_ROTATION_THRESHOLD,
    },
};

use crate::constants::{
    DEFAULT_CERTIFICATE_DIR, DEFAULT_FIELD_MANAGER, DEFAULT_LISTEN_ADDRESS,
    DEFAULT_ROTATION_CHECK_INTERVAL, DEFAULT_SERVICE_PORT, DEFAULT_TIMEOUT_SECONDS,
    DEFAULT_WEBHOOK_PORT,
};

/// Specifies available webhook server options.
///
/// The operator name is required, everything else has a default:
///
/// - The socket binds to 0.0.0.0 on port 9876 (HTTPS), the Service exposes it on port 443.
/// - The namespace is discovered from the service account, see
///   [`OperatorIdentity`][crate::operator::OperatorIdentity].
/// - Certificates are stored in the Secret `<operator name>-tls` and use ECDSA keys.
/// - The webhook configuration is named `<operator name>-validating`.
///
/// ### Example with Custom HTTPS Port
///
/// ```
/// use gatehouse_webhook::WebhookOptions;
///
/// let options = WebhookOptions::builder("pod-validator")
///     .bind_port(12345)
///     .operator_namespace("webhooks")
///     .build();
///
/// assert_eq!(options.socket_addr().port(), 12345);
/// assert_eq!(options.webhook_configuration_name(), "pod-validator-validating");
/// ```
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookOptions {
    /// Name of the operator, used as Service name and as prefix of derived names.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub operator_name: String,

    /// Namespace the operator runs in. Discovered automatically if not set.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub operator_namespace: Option<String>,

    /// IP address the HTTPS server binds to.
    #[cfg_attr(feature = "clap", arg(long, env, default_value_t = DEFAULT_LISTEN_ADDRESS))]
    pub listen_address: IpAddr,

    /// Port the HTTPS server binds to.
    #[cfg_attr(feature = "clap", arg(long, env, default_value_t = DEFAULT_WEBHOOK_PORT))]
    pub webhook_port: u16,

    /// Port of the Service fronting the webhook.
    #[cfg_attr(feature = "clap", arg(long, env, default_value_t = DEFAULT_SERVICE_PORT))]
    pub service_port: u16,

    /// Directory the serving certificate and key are written to.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", default_value = DEFAULT_CERTIFICATE_DIR)
    )]
    pub certificate_dir: PathBuf,

    /// Name of the Secret storing the certificates. Defaults to `<operator name>-tls`.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub certificate_secret_name: Option<String>,

    /// Private key algorithm of newly generated certificates.
    #[cfg_attr(feature = "clap", arg(long, env, value_enum, default_value_t))]
    pub key_type: PrivateKeyType,

    #[cfg_attr(feature = "clap", arg(long, env, default_value = DEFAULT_CLUSTER_DOMAIN))]
    pub cluster_domain: String,

    /// Validity of newly generated CA certificates.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_parser = humantime::parse_duration, default_value = "3650d")
    )]
    pub ca_lifetime: Duration,

    /// Validity of newly generated serving certificates.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_parser = humantime::parse_duration, default_value = "365d")
    )]
    pub certificate_lifetime: Duration,

    /// Serving certificates with less remaining validity are replaced. Must be
    /// shorter than the certificate lifetime.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_parser = humantime::parse_duration, default_value = "30d")
    )]
    pub rotation_threshold: Duration,

    /// Interval of the background certificate expiry check.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_parser = humantime::parse_duration, default_value = "1h")
    )]
    pub rotation_check_interval: Duration,

    /// Name of the ValidatingWebhookConfiguration. Defaults to `<operator name>-validating`.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub webhook_configuration_name: Option<String>,

    /// Seconds the API server waits for a webhook response.
    #[cfg_attr(feature = "clap", arg(long, env, default_value_t = DEFAULT_TIMEOUT_SECONDS))]
    pub timeout_seconds: i32,

    /// Field manager used for server-side apply.
    #[cfg_attr(feature = "clap", arg(long, env, default_value = DEFAULT_FIELD_MANAGER))]
    pub field_manager: String,
}

impl WebhookOptions {
    /// Returns the default options for the operator `operator_name`.
    pub fn new(operator_name: impl Into<String>) -> Self {
        Self {
            operator_name: operator_name.into(),
            operator_namespace: None,
            listen_address: DEFAULT_LISTEN_ADDRESS,
            webhook_port: DEFAULT_WEBHOOK_PORT,
            service_port: DEFAULT_SERVICE_PORT,
            certificate_dir: PathBuf::from(DEFAULT_CERTIFICATE_DIR),
            certificate_secret_name: None,
            key_type: PrivateKeyType::default(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_owned(),
            ca_lifetime: DEFAULT_CA_VALIDITY,
            certificate_lifetime: DEFAULT_CERTIFICATE_VALIDITY,
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
            rotation_check_interval: DEFAULT_ROTATION_CHECK_INTERVAL,
            webhook_configuration_name: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            field_manager: DEFAULT_FIELD_MANAGER.to_owned(),
        }
    }

    /// Returns the default [`WebhookOptionsBuilder`] which allows to selectively
    /// customize the options.
    pub fn builder(operator_name: impl Into<String>) -> WebhookOptionsBuilder {
        WebhookOptionsBuilder {
            options: Self::new(operator_name),
        }
    }

    /// The socket address the [`TcpListener`][tokio::net::TcpListener] binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.webhook_port)
    }

    pub fn certificate_secret_name(&self) -> String {
        self.certificate_secret_name
            .clone()
            .unwrap_or_else(|| format!("{}-tls", self.operator_name))
    }

    pub fn webhook_configuration_name(&self) -> String {
        self.webhook_configuration_name
            .clone()
            .unwrap_or_else(|| format!("{}-validating", self.operator_name))
    }

    /// Settings of the [`CertificateProvider`][gatehouse_certs::provider::CertificateProvider]
    /// for the Service `<operator name>` in `namespace`.
    pub fn certificate_provider_options(&self, namespace: &str) -> CertificateProviderOptions {
        CertificateProviderOptions {
            cluster_domain: self.cluster_domain.clone(),
            key_type: self.key_type,
            ca_validity: self.ca_lifetime,
            certificate_validity: self.certificate_lifetime,
            rotation_threshold: self.rotation_threshold,
            ..CertificateProviderOptions::new(
                &self.operator_name,
                namespace,
                &self.certificate_dir,
            )
        }
    }
}

/// The [`WebhookOptionsBuilder`] which allows to selectively customize the webhook
/// server [`WebhookOptions`].
///
/// Usually, this struct is not constructed manually, but instead by calling
/// [`WebhookOptions::builder()`].
#[derive(Debug)]
pub struct WebhookOptionsBuilder {
    options: WebhookOptions,
}

impl WebhookOptionsBuilder {
    /// Sets the socket address the webhook server uses to bind for HTTPS.
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.options.listen_address = bind_ip.into();
        self.options.webhook_port = bind_port;
        self
    }

    /// Sets the IP address of the socket address the webhook server uses to
    /// bind for HTTPS.
    pub fn bind_ip(mut self, bind_ip: impl Into<IpAddr>) -> Self {
        self.options.listen_address = bind_ip.into();
        self
    }

    /// Sets the port of the socket address the webhook server uses to bind
    /// for HTTPS.
    pub fn bind_port(mut self, bind_port: u16) -> Self {
        self.options.webhook_port = bind_port;
        self
    }

    pub fn operator_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.options.operator_namespace = Some(namespace.into());
        self
    }

    pub fn service_port(mut self, service_port: u16) -> Self {
        self.options.service_port = service_port;
        self
    }

    pub fn certificate_dir(mut self, certificate_dir: impl Into<PathBuf>) -> Self {
        self.options.certificate_dir = certificate_dir.into();
        self
    }

    pub fn key_type(mut self, key_type: PrivateKeyType) -> Self {
        self.options.key_type = key_type;
        self
    }

    pub fn timeout_seconds(mut self, timeout_seconds: i32) -> Self {
        self.options.timeout_seconds = timeout_seconds;
        self
    }

    /// Builds the final [`WebhookOptions`] by using default values for any not
    /// explicitly set option.
    pub fn build(self) -> WebhookOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names() {
        let options = WebhookOptions::new("pod-validator");

        assert_eq!(options.certificate_secret_name(), "pod-validator-tls");
        assert_eq!(
            options.webhook_configuration_name(),
            "pod-validator-validating"
        );
        assert_eq!(options.socket_addr().to_string(), "0.0.0.0:9876");
    }

    #[test]
    fn explicit_names_win() {
        let options = WebhookOptions {
            certificate_secret_name: Some("serving-cert".to_owned()),
            webhook_configuration_name: Some("pods".to_owned()),
            ..WebhookOptions::new("pod-validator")
        };

        assert_eq!(options.certificate_secret_name(), "serving-cert");
        assert_eq!(options.webhook_configuration_name(), "pods");
    }

    #[test]
    fn certificate_provider_options() {
        let options = WebhookOptions::builder("pod-validator")
            .key_type(PrivateKeyType::Rsa)
            .certificate_dir("/certs")
            .build();

        let provider_options = options.certificate_provider_options("webhooks");
        assert_eq!(provider_options.service_name, "pod-validator");
        assert_eq!(provider_options.namespace, "webhooks");
        assert_eq!(provider_options.key_type, PrivateKeyType::Rsa);
        assert_eq!(provider_options.certificate_dir, PathBuf::from("/certs"));
    }
}
