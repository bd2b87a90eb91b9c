//! The private key algorithms the webhook certificates can be issued with.
//!
//! [`EcdsaKey`] uses the NIST P-256 curve and is the default. [`RsaKey`] is
//! offered for API servers which only accept RSA. Note that the [`rsa`] crate
//! is affected by the Marvin attack, see
//! <https://rustsec.org/advisories/RUSTSEC-2023-0071.html>.
use p256::{
    NistP256,
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
};
use rand_core::OsRng;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use signature::{Keypair, Signer};
use snafu::{ResultExt, Snafu};
use x509_cert::spki::{
    EncodePublicKey, SignatureAlgorithmIdentifier, SignatureBitStringEncoding,
    SubjectPublicKeyInfoOwned,
};
use zeroize::Zeroizing;

use crate::PEM_LINE_ENDING;

// Generating 4096 bit keys takes seconds in debug builds
#[cfg(not(test))]
const RSA_KEY_SIZE: usize = 4096;
#[cfg(test)]
const RSA_KEY_SIZE: usize = 2048;

#[derive(Debug, Snafu)]
pub enum KeyError {
    #[snafu(display("failed to generate RSA key"))]
    GenerateRsa { source: rsa::Error },

    #[snafu(display("failed to decode {algorithm} private key from PKCS#8 PEM"))]
    DecodePrivateKey {
        source: p256::pkcs8::Error,
        algorithm: &'static str,
    },

    #[snafu(display("failed to encode {algorithm} private key as PKCS#8 PEM"))]
    EncodePrivateKey {
        source: p256::pkcs8::Error,
        algorithm: &'static str,
    },

    #[snafu(display("failed to encode {algorithm} public key"))]
    EncodePublicKey {
        source: x509_cert::spki::Error,
        algorithm: &'static str,
    },
}

/// A private key which signs certificates or is bound to one.
pub trait KeyPair: Sized + Send + 'static {
    /// Name of the algorithm, as shown in logs.
    const ALGORITHM: &'static str;

    type SigningKey: Keypair<VerifyingKey = Self::VerifyingKey>
        + SignatureAlgorithmIdentifier
        + Signer<Self::Signature>
        + EncodePrivateKey;
    type VerifyingKey: EncodePublicKey;
    type Signature: SignatureBitStringEncoding;

    /// Generates a fresh key using the operating system's random number
    /// generator.
    fn generate() -> Result<Self, KeyError>;

    /// Decodes a PKCS#8 PEM private key, as produced by [`KeyPair::to_pem`].
    fn from_pem(pem: &str) -> Result<Self, KeyError>;

    fn signing_key(&self) -> &Self::SigningKey;

    /// The public half of the key, ready to be embedded into a certificate.
    fn public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned, KeyError> {
        SubjectPublicKeyInfoOwned::from_key(self.signing_key().verifying_key()).context(
            EncodePublicKeySnafu {
                algorithm: Self::ALGORITHM,
            },
        )
    }

    /// Encodes the private key as PKCS#8 PEM. The returned string is zeroed
    /// when dropped.
    fn to_pem(&self) -> Result<Zeroizing<String>, KeyError> {
        self.signing_key()
            .to_pkcs8_pem(PEM_LINE_ENDING)
            .context(EncodePrivateKeySnafu {
                algorithm: Self::ALGORITHM,
            })
    }
}

pub struct EcdsaKey(p256::ecdsa::SigningKey);

impl KeyPair for EcdsaKey {
    type Signature = ecdsa::der::Signature<NistP256>;
    type SigningKey = p256::ecdsa::SigningKey;
    type VerifyingKey = p256::ecdsa::VerifyingKey;

    const ALGORITHM: &'static str = "ecdsa-p256";

    fn generate() -> Result<Self, KeyError> {
        Ok(Self(p256::ecdsa::SigningKey::random(&mut OsRng)))
    }

    fn from_pem(pem: &str) -> Result<Self, KeyError> {
        p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .map(Self)
            .context(DecodePrivateKeySnafu {
                algorithm: Self::ALGORITHM,
            })
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }
}

pub struct RsaKey(rsa::pkcs1v15::SigningKey<Sha256>);

impl KeyPair for RsaKey {
    type Signature = rsa::pkcs1v15::Signature;
    type SigningKey = rsa::pkcs1v15::SigningKey<Sha256>;
    type VerifyingKey = rsa::pkcs1v15::VerifyingKey<Sha256>;

    const ALGORITHM: &'static str = "rsa";

    fn generate() -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_SIZE).context(GenerateRsaSnafu)?;
        Ok(Self(rsa::pkcs1v15::SigningKey::new(private_key)))
    }

    fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem).context(DecodePrivateKeySnafu {
            algorithm: Self::ALGORITHM,
        })?;
        Ok(Self(rsa::pkcs1v15::SigningKey::new(private_key)))
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }
}
