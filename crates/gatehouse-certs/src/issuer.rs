//! Issues the self-signed CA of the webhook and the serving certificate it
//! signs.
//!
//! ```
//! use std::time::Duration;
//!
//! use gatehouse_certs::{issuer::CertificateAuthority, keys::EcdsaKey};
//!
//! let ca = CertificateAuthority::<EcdsaKey>::generate(
//!     "CN=Example CA",
//!     Duration::from_secs(7 * 24 * 60 * 60),
//! )
//! .unwrap();
//! let serving = ca
//!     .issue(
//!         "CN=example.default.svc",
//!         &["example.default.svc".to_owned()],
//!         Duration::from_secs(24 * 60 * 60),
//!     )
//!     .unwrap();
//!
//! assert!(serving.not_after() < ca.certificate().not_after());
//! ```
use std::time::{Duration, SystemTime};

use const_oid::db::rfc5280::ID_KP_SERVER_AUTH;
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{EncodePem, asn1::Ia5String, referenced::OwnedToRef},
    ext::pkix::{AuthorityKeyIdentifier, ExtendedKeyUsage, SubjectAltName, name::GeneralName},
    name::Name,
    serial_number::SerialNumber,
    time::Validity,
};
use zeroize::Zeroizing;

use crate::{
    PEM_LINE_ENDING,
    keys::{KeyError, KeyPair},
};

/// Subject of the CA generated by the
/// [`CertificateProvider`](crate::provider::CertificateProvider).
pub const CA_SUBJECT: &str = "CN=Gatehouse Webhook CA";

#[derive(Debug, Snafu)]
pub enum IssueError {
    #[snafu(display("failed to compute a validity of {validity:?} starting now"))]
    ComputeValidity {
        source: x509_cert::der::Error,
        validity: Duration,
    },

    #[snafu(display("failed to parse {subject:?} as distinguished name"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to parse {dns_name:?} as DNS name"))]
    ParseDnsName {
        source: x509_cert::der::Error,
        dns_name: String,
    },

    #[snafu(display("failed to prepare key for {subject:?}"))]
    PrepareKey { source: KeyError, subject: String },

    #[snafu(display("failed to derive the authority key identifier"))]
    DeriveAuthorityKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to build certificate for {subject:?}"))]
    BuildCertificate {
        source: x509_cert::builder::Error,
        subject: String,
    },

    #[snafu(display("certificate for {subject:?} would expire after the CA"))]
    OutlivesCa { subject: String },

    #[snafu(display("failed to encode certificate as PEM"))]
    EncodeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to encode private key as PEM"))]
    EncodePrivateKey { source: KeyError },
}

/// A certificate together with the private key it is bound to.
pub struct SignedCertificate<K> {
    certificate: Certificate,
    key: K,
}

impl<K: KeyPair> SignedCertificate<K> {
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn not_after(&self) -> SystemTime {
        self.certificate
            .tbs_certificate
            .validity
            .not_after
            .to_system_time()
    }

    pub fn certificate_pem(&self) -> Result<String, IssueError> {
        self.certificate
            .to_pem(PEM_LINE_ENDING)
            .context(EncodeCertificateSnafu)
    }

    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, IssueError> {
        self.key.to_pem().context(EncodePrivateKeySnafu)
    }
}

/// A self-signed certificate authority, signing serving certificates with a
/// key of type `K`.
pub struct CertificateAuthority<K> {
    signed: SignedCertificate<K>,
}

impl<K: KeyPair> CertificateAuthority<K> {
    /// Generates a fresh key and a self-signed CA certificate valid for
    /// `validity` from now.
    #[instrument(name = "generate_certificate_authority", skip(validity), fields(key.algorithm = K::ALGORITHM))]
    pub fn generate(subject: &str, validity: Duration) -> Result<Self, IssueError> {
        let key = K::generate().context(PrepareKeySnafu { subject })?;
        let public_key = key.public_key_info().context(PrepareKeySnafu { subject })?;
        let authority_key_identifier = AuthorityKeyIdentifier::try_from(public_key.owned_to_ref())
            .context(DeriveAuthorityKeyIdentifierSnafu)?;

        // The root profile marks the certificate as CA and adds the subject
        // key identifier.
        let mut builder = CertificateBuilder::new(
            Profile::Root,
            random_serial_number(),
            validity_from_now(validity)?,
            parse_name(subject)?,
            public_key,
            key.signing_key(),
        )
        .context(BuildCertificateSnafu { subject })?;
        builder
            .add_extension(&authority_key_identifier)
            .context(BuildCertificateSnafu { subject })?;
        let certificate = builder
            .build::<K::Signature>()
            .context(BuildCertificateSnafu { subject })?;

        let signed = SignedCertificate { certificate, key };
        debug!(ca.not_after = ?signed.not_after(), "generated certificate authority");
        Ok(Self { signed })
    }

    pub fn certificate(&self) -> &SignedCertificate<K> {
        &self.signed
    }

    /// Issues a certificate for TLS servers reachable under `dns_names`. The
    /// certificate is bound to a freshly generated key and must expire before
    /// the CA does.
    #[instrument(name = "issue_serving_certificate", skip(self, validity), fields(key.algorithm = K::ALGORITHM))]
    pub fn issue(
        &self,
        subject: &str,
        dns_names: &[String],
        validity: Duration,
    ) -> Result<SignedCertificate<K>, IssueError> {
        let validity = validity_from_now(validity)?;
        ensure!(
            validity.not_after.to_system_time() < self.signed.not_after(),
            OutlivesCaSnafu { subject }
        );

        let subject_alt_names = dns_names
            .iter()
            .map(|dns_name| {
                Ia5String::new(dns_name)
                    .map(GeneralName::DnsName)
                    .context(ParseDnsNameSnafu { dns_name })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let key = K::generate().context(PrepareKeySnafu { subject })?;
        let public_key = key.public_key_info().context(PrepareKeySnafu { subject })?;

        let mut builder = CertificateBuilder::new(
            Profile::Leaf {
                issuer: self.signed.certificate.tbs_certificate.subject.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: true,
            },
            random_serial_number(),
            validity,
            parse_name(subject)?,
            public_key,
            self.signed.key.signing_key(),
        )
        .context(BuildCertificateSnafu { subject })?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH]))
            .context(BuildCertificateSnafu { subject })?;
        if !subject_alt_names.is_empty() {
            builder
                .add_extension(&SubjectAltName(subject_alt_names))
                .context(BuildCertificateSnafu { subject })?;
        }
        let certificate = builder
            .build::<K::Signature>()
            .context(BuildCertificateSnafu { subject })?;

        let signed = SignedCertificate { certificate, key };
        debug!(certificate.not_after = ?signed.not_after(), "issued serving certificate");
        Ok(signed)
    }
}

fn validity_from_now(validity: Duration) -> Result<Validity, IssueError> {
    Validity::from_now(validity).context(ComputeValiditySnafu { validity })
}

fn parse_name(subject: &str) -> Result<Name, IssueError> {
    subject.parse().context(ParseSubjectSnafu { subject })
}

fn random_serial_number() -> SerialNumber {
    SerialNumber::from(rand::random::<u64>())
}
