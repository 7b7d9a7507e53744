//! Vector ciphertexts and score ciphertexts.
//!
//! A quantized vector of dimension d is encrypted slot by slot: component
//! v_i becomes an RLWE pair whose plaintext is the constant polynomial
//! v_i·DELTA. The blob size is therefore a function of d alone
//! (2·N·8 bytes per component plus a fixed header).
//!
//! Every ciphertext is bound to its key epoch (`key_id`) and carries a
//! SHA-256 integrity tag over its content. Evaluation refuses wrong-epoch
//! or tampered inputs before doing any arithmetic.

use bincode::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::keys::{KeyId, PublicKey, SecretKey, ServerKeys};
use super::params::{DELTA, MAX_DIM, N};
use super::poly::{NttPoly, Poly};
use super::sampling::{sample_gaussian, sample_ternary};
use crate::circuit::CircuitShape;
use crate::error::{FheError, Result};

/// Bytes of one serialized evaluation-domain polynomial (length prefix + N values).
const POLY_WIRE_BYTES: u64 = 8 + 8 * N as u64;

/// Upper bound accepted when decoding an untrusted vector ciphertext.
pub const MAX_CIPHERTEXT_BYTES: u64 = 4096 + 2 * POLY_WIRE_BYTES * MAX_DIM as u64;

/// Upper bound accepted when decoding an untrusted score ciphertext.
pub const MAX_SCORE_BYTES: u64 = 4096 + 2 * POLY_WIRE_BYTES;

/// An encrypted quantized vector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    /// (d, bits) the vector was quantized for.
    pub shape: CircuitShape,
    /// One `(c0, c1)` pair per component.
    pub slots: Vec<(NttPoly, NttPoly)>,
    /// Epoch of the public key that produced this ciphertext.
    pub key_id: KeyId,
    pub nonce: [u8; 16],
    pub auth_tag: [u8; 32],
}

/// The encrypted result of one dot product.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCiphertext {
    pub shape: CircuitShape,
    pub c0: NttPoly,
    pub c1: NttPoly,
    pub key_id: KeyId,
    pub auth_tag: [u8; 32],
}

fn vector_tag(
    shape: &CircuitShape,
    slots: &[(NttPoly, NttPoly)],
    key_id: &KeyId,
    nonce: &[u8; 16],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"veil_ct_v1");
    hasher.update(key_id.0);
    hasher.update(nonce);
    hasher.update((shape.dim as u64).to_le_bytes());
    hasher.update([shape.bits]);
    for (c0, c1) in slots {
        c0.hash_into(&mut hasher);
        c1.hash_into(&mut hasher);
    }
    hasher.finalize().into()
}

fn score_tag(shape: &CircuitShape, c0: &NttPoly, c1: &NttPoly, key_id: &KeyId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"veil_score_v1");
    hasher.update(key_id.0);
    hasher.update((shape.dim as u64).to_le_bytes());
    hasher.update([shape.bits]);
    c0.hash_into(&mut hasher);
    c1.hash_into(&mut hasher);
    hasher.finalize().into()
}

fn decode_limited<T: serde::de::DeserializeOwned>(bytes: &[u8], limit: u64) -> Result<T> {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
        .deserialize(bytes)
        .map_err(|e| FheError::Decryption(format!("malformed ciphertext encoding: {}", e)))
}

impl Ciphertext {
    /// Recompute the integrity tag and compare.
    pub fn verify_integrity(&self) -> bool {
        self.slots.len() == self.shape.dim
            && self
                .slots
                .iter()
                .all(|(c0, c1)| c0.is_well_formed() && c1.is_well_formed())
            && vector_tag(&self.shape, &self.slots, &self.key_id, &self.nonce) == self.auth_tag
    }

    /// Serialized blob (fixed-width bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FheError::Storage(e.to_string()))
    }

    /// Decode an untrusted blob. Integrity is checked later, by whoever
    /// consumes the ciphertext, so the error kind matches that consumer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_limited(bytes, MAX_CIPHERTEXT_BYTES)
    }
}

impl ScoreCiphertext {
    /// Seal a relinearized pair under `key_id`.
    pub fn seal(shape: CircuitShape, c0: NttPoly, c1: NttPoly, key_id: KeyId) -> Self {
        let auth_tag = score_tag(&shape, &c0, &c1, &key_id);
        Self {
            shape,
            c0,
            c1,
            key_id,
            auth_tag,
        }
    }

    pub fn verify_integrity(&self) -> bool {
        self.c0.is_well_formed()
            && self.c1.is_well_formed()
            && score_tag(&self.shape, &self.c0, &self.c1, &self.key_id) == self.auth_tag
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FheError::Storage(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_limited(bytes, MAX_SCORE_BYTES)
    }
}

/// Encrypt one constant message `value·DELTA` under `pk`.
///
/// c0 = b·u + e1 + m,  c1 = a·u + e2
fn encrypt_slot<R: Rng>(value: i64, pk: &PublicKey, rng: &mut R) -> (NttPoly, NttPoly) {
    let u = sample_ternary(rng).to_ntt();
    let mut e1_plus_m = sample_gaussian(rng);
    e1_plus_m.coeffs[0] += value * DELTA;
    let e1_plus_m = e1_plus_m.to_ntt();
    let e2 = sample_gaussian(rng).to_ntt();

    let c0 = pk.b.mul(&u).add(&e1_plus_m);
    let c1 = pk.a.mul(&u).add(&e2);
    (c0, c1)
}

/// Encrypt an already validated quantized vector.
///
/// Callers check the length and value range against `shape`; see
/// `FheContext::encrypt`.
pub fn encrypt<R: Rng>(
    values: &[i64],
    shape: CircuitShape,
    keys: &ServerKeys,
    rng: &mut R,
) -> Ciphertext {
    let mut nonce = [0u8; 16];
    rng.fill(&mut nonce);
    let slots: Vec<_> = values
        .iter()
        .map(|&v| encrypt_slot(v, &keys.public, rng))
        .collect();
    let auth_tag = vector_tag(&shape, &slots, &keys.key_id, &nonce);
    Ciphertext {
        shape,
        slots,
        key_id: keys.key_id,
        nonce,
        auth_tag,
    }
}

/// Decrypt a score ciphertext and round away the squared scale.
///
/// `m = c0 + c1·s`; the constant coefficient holds score·DELTA² plus noise.
/// A rounding residual above DELTA²/4, or a magnitude above `max_abs`,
/// means the ciphertext is corrupt or was not produced under this secret.
pub fn decrypt_score(ct: &ScoreCiphertext, sk: &SecretKey, max_abs: i64) -> Result<i64> {
    let m: Poly = ct.c0.add(&ct.c1.mul(&sk.s)).to_coeffs();
    let scale = (DELTA as i128) * (DELTA as i128);
    let c = m.coeffs[0] as i128;

    let score = if c >= 0 {
        (c + scale / 2) / scale
    } else {
        -((-c + scale / 2) / scale)
    };
    let residual = c - score * scale;
    if residual.abs() > scale / 4 {
        return Err(FheError::Decryption(format!(
            "noise residual {} exceeds tolerance (wrong secret or corrupt ciphertext)",
            residual
        )));
    }
    if score.abs() > max_abs as i128 {
        return Err(FheError::Decryption(format!(
            "decrypted score {} outside circuit bound ±{}",
            score, max_abs
        )));
    }
    Ok(score as i64)
}
