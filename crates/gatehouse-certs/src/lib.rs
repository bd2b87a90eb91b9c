//! This crate provides the X.509 TLS material of an admission webhook. It
//! generates a self-signed certificate authority (CA) which signs the
//! certificate served by the webhook, persists that material in a
//! [`CertificateStore`](store::CertificateStore) and decides whether the
//! persisted material can be reused or has to be rotated, see
//! [`CertificateProvider`](provider::CertificateProvider).
//!
//! ## Feature Flags
//!
//! - `rustls`: Converts the PEM-encoded material into the DER types used by
//!   `tokio-rustls`, which is required by the `gatehouse-webhook` crate.
//! - `clap`: Allows selecting the [`PrivateKeyType`] on the command line.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://kubernetes.io/docs/reference/access-authn-authz/extensible-admission-controllers/#contacting-the-webhook>
use x509_cert::der::pem::LineEnding;

pub mod bundle;
pub mod issuer;
pub mod keys;
pub mod provider;
pub mod store;

/// Line ending of all PEM output of this crate.
pub const PEM_LINE_ENDING: LineEnding = LineEnding::LF;

/// Algorithm of newly generated keys, see [`keys`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[strum(serialize_all = "lowercase")]
pub enum PrivateKeyType {
    #[default]
    Ecdsa,
    Rsa,
}
