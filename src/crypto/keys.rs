//! Post-quantum signing keys using CRYSTALS-Dilithium5.
//!
//! Jurors and mediators sign results, adapter answers and VRF inputs with the
//! same keypair. Dilithium5 provides NIST security level 5.

use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as SignPkTrait, SecretKey as SignSkTrait,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Hash;

// Expected key sizes for validation
const DILITHIUM5_PK_BYTES: usize = 2592;
pub(crate) const DILITHIUM5_SIG_BYTES: usize = 4627;

/// A CRYSTALS-Dilithium5 signing public key (2592 bytes).
///
/// Inner bytes are `pub(crate)` to prevent external construction of
/// unvalidated keys. Use [`SigningKeypair::generate`] or deserialization.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SigningPublicKey(pub(crate) Vec<u8>);

/// A CRYSTALS-Dilithium5 signing secret key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

/// A Dilithium5 detached signature (4627 bytes).
///
/// Ordering is lexicographic over the raw bytes; the committer tie-break
/// relies on it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// An empty signature. Never verifies.
    pub fn empty() -> Self {
        Signature(vec![])
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wrap raw bytes received from a peer, validating the size.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != DILITHIUM5_SIG_BYTES {
            return None;
        }
        Some(Signature(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Empty signatures are tolerated (they never verify); anything else
        // must be exactly one Dilithium5 signature.
        if !bytes.is_empty() && bytes.len() != DILITHIUM5_SIG_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium5 signature: expected {} bytes, got {}",
                DILITHIUM5_SIG_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// A Dilithium5 signing keypair.
///
/// The secret key is zeroized on drop via [`ZeroizeOnDrop`] on
/// [`SigningSecretKey`].
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("fingerprint", &hex::encode(&self.public.fingerprint()[..8]))
            .field("secret", &"REDACTED")
            .finish()
    }
}

impl SigningKeypair {
    /// Generate a new random Dilithium5 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium5::keypair();
        SigningKeypair {
            public: SigningPublicKey(pk.as_bytes().to_vec()),
            secret: SigningSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Sign a message, producing a detached signature.
    ///
    /// A corrupted secret key is logged and yields an empty signature, which
    /// always fails verification.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sk = match dilithium5::SecretKey::from_bytes(&self.secret.0) {
            Ok(sk) => sk,
            Err(_) => {
                tracing::error!("SigningKeypair::sign called with corrupted secret key");
                return Signature::empty();
            }
        };
        let sig = dilithium5::detached_sign(message, &sk);
        Signature(sig.as_bytes().to_vec())
    }

    /// Create a keypair from raw bytes, validating key sizes.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Option<Self> {
        dilithium5::PublicKey::from_bytes(&public).ok()?;
        dilithium5::SecretKey::from_bytes(&secret).ok()?;
        Some(SigningKeypair {
            public: SigningPublicKey(public),
            secret: SigningSecretKey(secret),
        })
    }

    /// Raw secret key bytes, for persisting to a key file.
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret.0
    }
}

impl SigningPublicKey {
    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Verify a detached signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let pk = match dilithium5::PublicKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match dilithium5::DetachedSignature::from_bytes(&signature.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    /// Derive a compact fingerprint (BLAKE3 hash of the public key).
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain(b"jury.signing.fingerprint", &self.0)
    }

    /// Check if this public key has the correct size.
    pub fn is_valid_size(&self) -> bool {
        self.0.len() == DILITHIUM5_PK_BYTES
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != DILITHIUM5_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium5 public key: expected {} bytes, got {}",
                DILITHIUM5_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(SigningPublicKey(bytes))
    }
}
