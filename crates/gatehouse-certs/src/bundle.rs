//! The PEM-encoded TLS material of the webhook and helpers to inspect it.
use std::{
    fmt,
    time::{Duration, SystemTime},
};

use snafu::{ResultExt, Snafu};
use x509_cert::{
    Certificate,
    der::{Decode, DecodePem},
    ext::pkix::{ID_CE_SUBJECT_ALT_NAME, SubjectAltName, name::GeneralName},
};
use zeroize::Zeroizing;

#[derive(Debug, Snafu)]
pub enum InspectBundleError {
    #[snafu(display("failed to decode the leaf certificate from PEM"))]
    DecodeCertificate { source: x509_cert::der::Error },
}

/// The CA and leaf certificate of the webhook together with their private
/// keys, all PEM-encoded.
///
/// Private keys are zeroed when the bundle is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub ca_certificate_pem: String,
    pub ca_private_key_pem: Zeroizing<String>,
    pub certificate_pem: String,
    pub private_key_pem: Zeroizing<String>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("ca_certificate_pem", &self.ca_certificate_pem)
            .field("ca_private_key_pem", &"<redacted>")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

impl CertificateBundle {
    /// Decodes the leaf certificate.
    pub fn leaf_certificate(&self) -> Result<Certificate, InspectBundleError> {
        Certificate::from_pem(self.certificate_pem.as_bytes()).context(DecodeCertificateSnafu)
    }

    /// Returns the PEM-encoded CA certificate which clients use to verify
    /// the leaf certificate.
    pub fn ca_bundle(&self) -> &str {
        &self.ca_certificate_pem
    }
}

#[cfg(feature = "rustls")]
mod rustls {
    use snafu::{ResultExt, Snafu};
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};

    use super::CertificateBundle;

    #[derive(Debug, Snafu)]
    pub enum DerConversionError {
        #[snafu(display("failed to decode the leaf certificate PEM as DER"))]
        DecodeCertificatePem {
            source: tokio_rustls::rustls::pki_types::pem::Error,
        },

        #[snafu(display("failed to decode the leaf private key PEM as DER"))]
        DecodePrivateKeyPem {
            source: tokio_rustls::rustls::pki_types::pem::Error,
        },
    }

    impl CertificateBundle {
        /// Converts the leaf certificate and its private key into the DER types
        /// expected by rustls.
        pub fn leaf_der(
            &self,
        ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), DerConversionError> {
            let certificate = CertificateDer::from_pem_slice(self.certificate_pem.as_bytes())
                .context(DecodeCertificatePemSnafu)?;
            let private_key = PrivateKeyDer::from_pem_slice(self.private_key_pem.as_bytes())
                .context(DecodePrivateKeyPemSnafu)?;

            Ok((certificate, private_key))
        }
    }
}

#[cfg(feature = "rustls")]
pub use rustls::DerConversionError;

/// Returns all DNS names of the subject alternative name extension.
pub fn subject_alternative_dns_names(certificate: &Certificate) -> Vec<String> {
    let Some(extensions) = &certificate.tbs_certificate.extensions else {
        return Vec::new();
    };

    extensions
        .iter()
        .filter(|extension| extension.extn_id == ID_CE_SUBJECT_ALT_NAME)
        .filter_map(|extension| SubjectAltName::from_der(extension.extn_value.as_bytes()).ok())
        .flat_map(|san| san.0)
        .filter_map(|name| match name {
            GeneralName::DnsName(dns_name) => Some(dns_name.as_str().to_owned()),
            _ => None,
        })
        .collect()
}

/// Returns how long `certificate` stays valid, measured from `now`. Expired
/// certificates have no remaining validity.
pub fn remaining_validity(certificate: &Certificate, now: SystemTime) -> Duration {
    certificate
        .tbs_certificate
        .validity
        .not_after
        .to_system_time()
        .duration_since(now)
        .unwrap_or_default()
}
