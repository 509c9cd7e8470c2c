//! RS256 key material for the trust station.
//!
//! The station owns a single 2048-bit RSA signing key pair with a lifetime
//! longer than any certificate it issues. The private half never leaves the
//! station process; gateways verify with the public half fetched from the
//! station's discovery endpoint.
//!
//! ## Security Properties
//!
//! 1. The private key PEM is wrapped in [`SecretString`]: `Debug` output is
//!    redacted and the buffer is zeroized on drop.
//! 2. [`SigningKey::from_pem_pair`] cross-checks that the configured public
//!    key actually belongs to the configured private key, so a mismatched
//!    deployment fails at startup instead of issuing unverifiable tokens.

use crate::error::{Error, Result};
use crate::ISSUER;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// RSA modulus size for generated station keys.
const RSA_BITS: usize = 2048;

/// The station signing key: a 2048-bit RSA private key used to sign
/// certificates as RS256 compact JWS.
pub struct SigningKey {
    encoding: EncodingKey,
    private_pem: SecretString,
    public: PublicKey,
}

// Redacted Debug: the private PEM must never hit logs.
impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("private_pem", &"***SECRET***")
            .field("public", &self.public.fingerprint())
            .finish()
    }
}

impl SigningKey {
    /// Generate a fresh 2048-bit RSA key pair.
    ///
    /// Used by `keygen` and tests. Production stations load keys from the
    /// environment via [`SigningKey::from_pem_pair`].
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| Error::Internal(format!("RSA key generation failed: {e}")))?;
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Internal(format!("PKCS8 encoding failed: {e}")))?
            .to_string();
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Internal(format!("SPKI encoding failed: {e}")))?;
        Self::build(private_pem, public_pem)
    }

    /// Load a signing key from a PKCS8 private PEM, deriving the public half.
    pub fn from_pem(private_pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| Error::Internal(format!("invalid private key PEM: {e}")))?;
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Internal(format!("SPKI encoding failed: {e}")))?;
        Self::build(private_pem.to_string(), public_pem)
    }

    /// Load a signing key from the station's configured PEM pair,
    /// verifying that the two halves belong together.
    pub fn from_pem_pair(private_pem: &str, public_pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| Error::Internal(format!("invalid private key PEM: {e}")))?;
        let configured = RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| Error::Internal(format!("invalid public key PEM: {e}")))?;
        if private.to_public_key() != configured {
            return Err(Error::Internal(
                "configured public key does not match the private key".to_string(),
            ));
        }
        Self::build(private_pem.to_string(), public_pem.to_string())
    }

    fn build(private_pem: String, public_pem: String) -> Result<Self> {
        let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| Error::Internal(format!("unusable private key: {e}")))?;
        let public = PublicKey::from_pem(&public_pem)?;
        Ok(Self {
            encoding,
            private_pem: SecretString::new(private_pem),
            public,
        })
    }

    /// The verification half of this key pair.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The `jsonwebtoken` encoding key for signing.
    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    /// Export the private key as PKCS8 PEM.
    ///
    /// Only `keygen` should call this; nothing else re-emits the secret.
    pub fn to_pem(&self) -> String {
        self.private_pem.expose_secret().clone()
    }
}

/// The station public key, distributed to gateways for local verification.
#[derive(Clone)]
pub struct PublicKey {
    decoding: DecodingKey,
    pem: String,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.pem == other.pem
    }
}
impl Eq for PublicKey {}

impl PublicKey {
    /// Parse a public key from SPKI PEM.
    pub fn from_pem(pem: &str) -> Result<Self> {
        // Parse eagerly so a bad key fails at load time, not at first verify.
        RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| Error::Internal(format!("invalid public key PEM: {e}")))?;
        let decoding = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| Error::Internal(format!("unusable public key: {e}")))?;
        Ok(Self {
            decoding,
            pem: pem.to_string(),
        })
    }

    /// The SPKI PEM form served by the discovery endpoint.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    /// The `jsonwebtoken` decoding key for verification.
    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Short fingerprint of the key for audit logs and receipts.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.pem.trim().as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Payload of the station's `/.well-known/station-keys` endpoint.
///
/// Unauthenticated and safe to expose: it carries only public material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDiscovery {
    /// Current public key in SPKI PEM form.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Signing algorithm. Always `"RS256"`.
    pub algorithm: String,
    /// Key use. Always `"sig"`.
    #[serde(rename = "use")]
    pub key_use: String,
    /// Issuer string the key signs for.
    pub issuer: String,
}

impl KeyDiscovery {
    /// Build the discovery payload for a public key.
    pub fn for_key(key: &PublicKey) -> Self {
        Self {
            public_key: key.to_pem().to_string(),
            algorithm: "RS256".to_string(),
            key_use: "sig".to_string(),
            issuer: ISSUER.to_string(),
        }
    }

    /// Parse the advertised key, rejecting metadata this core cannot honor.
    pub fn into_key(self) -> Result<PublicKey> {
        if self.algorithm != "RS256" {
            return Err(Error::Upstream(format!(
                "station advertises unsupported algorithm '{}'",
                self.algorithm
            )));
        }
        if self.issuer != ISSUER {
            return Err(Error::Upstream(format!(
                "station advertises unexpected issuer '{}'",
                self.issuer
            )));
        }
        PublicKey::from_pem(&self.public_key)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    // 2048-bit generation is slow in debug builds; share one pair per binary.
    pub(crate) fn test_signing_key() -> &'static SigningKey {
        static KEY: OnceLock<SigningKey> = OnceLock::new();
        KEY.get_or_init(|| SigningKey::generate().unwrap())
    }

    #[test]
    fn test_pem_round_trip() {
        let key = test_signing_key();
        let restored = SigningKey::from_pem(&key.to_pem()).unwrap();
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn test_pem_pair_consistency_check() {
        let key = test_signing_key();
        let other = SigningKey::generate().unwrap();

        let ok = SigningKey::from_pem_pair(&key.to_pem(), key.public_key().to_pem());
        assert!(ok.is_ok());

        let mismatched = SigningKey::from_pem_pair(&key.to_pem(), other.public_key().to_pem());
        assert!(mismatched.is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let key = test_signing_key();
        let debug = format!("{key:?}");
        assert!(debug.contains("***SECRET***"));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_discovery_round_trip() {
        let key = test_signing_key();
        let discovery = KeyDiscovery::for_key(key.public_key());
        assert_eq!(discovery.algorithm, "RS256");
        assert_eq!(discovery.key_use, "sig");
        assert_eq!(discovery.issuer, ISSUER);

        let parsed = discovery.into_key().unwrap();
        assert_eq!(&parsed, key.public_key());
    }

    #[test]
    fn test_discovery_rejects_foreign_algorithm() {
        let key = test_signing_key();
        let mut discovery = KeyDiscovery::for_key(key.public_key());
        discovery.algorithm = "ES256".to_string();
        assert!(discovery.into_key().is_err());
    }
}
