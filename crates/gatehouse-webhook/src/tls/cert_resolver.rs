use std::sync::Arc;

use arc_swap::ArcSwap;
use gatehouse_certs::bundle::{CertificateBundle, DerConversionError};
use snafu::{ResultExt, Snafu};
use tokio_rustls::rustls::{
    crypto::ring::default_provider,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};

type Result<T, E = CertificateResolverError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CertificateResolverError {
    #[snafu(display("failed to convert the certificate bundle to DER"))]
    ConvertBundleToDer { source: DerConversionError },

    #[snafu(display("failed to decode CertifiedKey from DER"))]
    DecodeCertifiedKeyFromDer { source: tokio_rustls::rustls::Error },
}

/// Hands the serving certificate of the current [`CertificateBundle`] to
/// every TLS handshake. [`Self::rotate`] replaces it while the server runs.
#[derive(Debug)]
pub struct CertificateResolver {
    // Written by the maintainer task, read synchronously during handshakes
    current_certified_key: ArcSwap<CertifiedKey>,
}

impl CertificateResolver {
    pub fn new(bundle: &CertificateBundle) -> Result<Self> {
        Ok(Self {
            current_certified_key: ArcSwap::new(certified_key(bundle)?),
        })
    }

    /// Serves the leaf certificate of `bundle` to all new connections.
    /// Established connections keep their certificate.
    pub fn rotate(&self, bundle: &CertificateBundle) -> Result<()> {
        self.current_certified_key.store(certified_key(bundle)?);
        Ok(())
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current_certified_key.load_full()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current_certified_key.load_full())
    }
}

fn certified_key(bundle: &CertificateBundle) -> Result<Arc<CertifiedKey>> {
    let (certificate_der, private_key_der) = bundle.leaf_der().context(ConvertBundleToDerSnafu)?;
    let certified_key =
        CertifiedKey::from_der(vec![certificate_der], private_key_der, &default_provider())
            .context(DecodeCertifiedKeyFromDerSnafu)?;

    Ok(Arc::new(certified_key))
}
