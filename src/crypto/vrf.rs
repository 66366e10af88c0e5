//! Verifiable Random Function (VRF) for jury sortition.
//!
//! A VRF produces a pseudorandom output that anyone can verify but nobody can
//! predict without the secret key. Jurors evaluate it on a per-contract
//! election seed and feed the output into [`super::sortition::selected`].
//!
//! Construction: VRF(sk, seed) = (H(dilithium_sign(sk, tag(seed))), proof = dilithium_sign(sk, tag(seed)))
//!
//! Correctness needs deterministic signing: the same (key, seed) must always
//! yield the same proof. [`check_deterministic_signing`] is run at node start.

use serde::{Deserialize, Serialize};

use super::keys::{Signature, SigningKeypair, SigningPublicKey, DILITHIUM5_SIG_BYTES};
use crate::Hash;

/// A VRF output and its proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfOutput {
    /// The pseudorandom value, derived from the proof
    pub value: Hash,
    /// Dilithium signature over the tagged seed
    pub proof: Vec<u8>,
}

fn tagged_seed(seed: &[u8]) -> Hash {
    crate::hash_concat(&[b"jury.vrf.input", seed])
}

fn value_from_proof(proof: &[u8]) -> Hash {
    crate::hash_domain(b"jury.vrf.output", proof)
}

impl VrfOutput {
    /// Evaluate the VRF on `seed` with the holder's secret key.
    pub fn evaluate(keypair: &SigningKeypair, seed: &[u8]) -> Self {
        let signature = keypair.sign(&tagged_seed(seed));
        let value = value_from_proof(signature.as_bytes());
        VrfOutput {
            value,
            proof: signature.as_bytes().to_vec(),
        }
    }

    /// Recompute the output from a peer's proof without their secret key.
    ///
    /// Returns `None` when the proof is malformed or does not verify; callers
    /// treat that as "not selected".
    pub fn from_proof(public_key: &SigningPublicKey, seed: &[u8], proof: &[u8]) -> Option<Self> {
        if proof.len() != DILITHIUM5_SIG_BYTES {
            return None;
        }
        let sig = Signature::from_bytes(proof.to_vec())?;
        if !public_key.verify(&tagged_seed(seed), &sig) {
            return None;
        }
        Some(VrfOutput {
            value: value_from_proof(proof),
            proof: proof.to_vec(),
        })
    }

    /// Verify that `value` and `proof` belong together and to `public_key`.
    pub fn verify(&self, public_key: &SigningPublicKey, seed: &[u8]) -> bool {
        match Self::from_proof(public_key, seed, &self.proof) {
            Some(recomputed) => crate::constant_time_eq(&recomputed.value, &self.value),
            None => false,
        }
    }
}

/// Check that the Dilithium5 implementation signs deterministically.
///
/// A randomized signer would give every evaluation a different VRF value and
/// break committee agreement.
pub fn check_deterministic_signing(keypair: &SigningKeypair) -> bool {
    let test_msg = crate::hash_domain(b"jury.vrf.determinism_check", b"test");
    let sig1 = keypair.sign(&test_msg);
    let sig2 = keypair.sign(&test_msg);
    !sig1.as_bytes().is_empty() && sig1 == sig2
}
