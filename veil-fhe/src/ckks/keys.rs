//! Ring-LWE key generation and the server/secret custody split.
//!
//! The public key is an RLWE instance (b, a) where b = -(a·s + e).
//! Everything the evaluator needs is bundled in [`ServerKeys`]; the ternary
//! secret lives only in [`SecretKey`], which is never part of that bundle.

use std::fmt;

use bincode::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::eval_key::{gen_eval_key, EvalKey};
use super::params::{NUM_DIGITS, SIGMA};
use super::poly::NttPoly;
use super::sampling::{sample_gaussian, sample_ternary, sample_uniform_ntt};
use crate::error::{FheError, Result};

/// Upper bound accepted when decoding uploaded server keys.
pub const MAX_SERVER_KEY_BYTES: u64 = 8 * 1024 * 1024;

/// Public encryption key, evaluation domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// b = -(a·s + e) mod q
    pub b: NttPoly,
    /// Uniform random polynomial
    pub a: NttPoly,
}

/// Ternary secret, evaluation domain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey {
    pub(crate) s: NttPoly,
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Identifier of a key epoch: SHA-256 over the public and evaluation keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 32]);

impl KeyId {
    /// First 8 bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.short())
    }
}

/// Key material safe to hand to the evaluating server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKeys {
    pub public: PublicKey,
    pub eval: EvalKey,
    pub key_id: KeyId,
}

impl ServerKeys {
    /// Bundle keys and derive their epoch id.
    pub fn new(public: PublicKey, eval: EvalKey) -> Self {
        let key_id = compute_key_id(&public, &eval);
        Self {
            public,
            eval,
            key_id,
        }
    }

    /// Structural check for externally supplied key material.
    pub fn validate(&self) -> Result<()> {
        let polys_ok = self.public.a.is_well_formed()
            && self.public.b.is_well_formed()
            && self.eval.keys.len() == NUM_DIGITS
            && self
                .eval
                .keys
                .iter()
                .all(|(b, a)| b.is_well_formed() && a.is_well_formed());
        if !polys_ok {
            return Err(FheError::InvalidKeyMaterial(
                "server keys are malformed (wrong length or non-canonical values)".into(),
            ));
        }
        if compute_key_id(&self.public, &self.eval) != self.key_id {
            return Err(FheError::InvalidKeyMaterial(
                "server key id does not match key content".into(),
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FheError::Storage(e.to_string()))
    }

    /// Decode and validate an uploaded bundle.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let keys: ServerKeys = bincode::DefaultOptions::new()
            .with_limit(MAX_SERVER_KEY_BYTES)
            .with_fixint_encoding()
            .deserialize(bytes)
            .map_err(|e| FheError::InvalidKeyMaterial(format!("server keys unreadable: {}", e)))?;
        keys.validate()?;
        Ok(keys)
    }
}

impl SecretKey {
    /// True when `keys` were generated from this secret: b + a·s must be
    /// the small error polynomial.
    pub fn matches(&self, keys: &ServerKeys) -> bool {
        let residual = keys.public.b.add(&keys.public.a.mul(&self.s)).to_coeffs();
        let bound = (SIGMA * 6.0).ceil() as i64;
        residual.coeffs.iter().all(|c| c.abs() <= bound)
    }
}

/// Generate a fresh key epoch.
///
/// 1. s ← ternary (secret)
/// 2. a ← uniform over Z_q
/// 3. e ← discrete Gaussian
/// 4. b = -(a·s + e)
/// 5. evaluation key for s² (see [`gen_eval_key`])
pub fn keygen<R: Rng>(rng: &mut R) -> Result<(ServerKeys, SecretKey)> {
    let sk = SecretKey {
        s: sample_ternary(rng).to_ntt(),
    };
    let a = sample_uniform_ntt(rng);
    let e = sample_gaussian(rng).to_ntt();
    let b = a.mul(&sk.s).add(&e).neg();
    let public = PublicKey { b, a };

    let eval = gen_eval_key(&sk, rng);
    let keys = ServerKeys::new(public, eval);

    if !sk.matches(&keys) {
        return Err(FheError::KeyGeneration(
            "public key does not reduce to a small error under the new secret".into(),
        ));
    }
    Ok((keys, sk))
}

/// SHA-256 over every key polynomial, domain separated.
pub fn compute_key_id(public: &PublicKey, eval: &EvalKey) -> KeyId {
    let mut hasher = Sha256::new();
    hasher.update(b"veil_key_id_v1");
    public.a.hash_into(&mut hasher);
    public.b.hash_into(&mut hasher);
    for (b, a) in &eval.keys {
        b.hash_into(&mut hasher);
        a.hash_into(&mut hasher);
    }
    KeyId(hasher.finalize().into())
}
