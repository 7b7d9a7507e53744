//! Scheme parameters for the encrypted dot-product circuit.
//!
//! One 62-bit NTT-friendly prime with N=2048. There is no modulus chain:
//! the circuit has multiplicative depth one and decryption divides out
//! the squared scale, so a single level is all that is ever consumed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Ring dimension, the degree of the cyclotomic polynomial X^N + 1.
pub const N: usize = 2048;

/// Ciphertext modulus 2^62 - 2^16 + 1. Prime, q ≡ 1 (mod 2N), and 2q < 2^63
/// so sums of two reduced values never overflow i64.
pub const Q: i64 = 0x3FFF_FFFF_FFFF_0001;

/// Scaling factor for one encoded vector component.
///
/// A product of two components carries DELTA², so the worst-case score
/// occupies at most 2^60 of the 2^61 centered range (see
/// [`MAX_SCORE_MAGNITUDE`]); the rest is noise headroom.
pub const DELTA: i64 = 1i64 << 22;

/// Standard deviation for discrete Gaussian error sampling.
pub const SIGMA: f64 = 3.2;

// ── Decomposition parameters (for relinearization) ────────────────────

/// Bit width of each decomposition digit.
pub const DECOMP_BITS: u32 = 16;

/// Base T for digit decomposition of the degree-2 component.
pub const DECOMP_BASE: i64 = 1i64 << DECOMP_BITS;

/// ceil(62 / 16) = 4 digits.
pub const NUM_DIGITS: usize = 4;

// ── Circuit shape limits ──────────────────────────────────────────────

/// Largest dot-product magnitude that decrypts exactly: 2^16.
pub const MAX_SCORE_MAGNITUDE: i64 = 1i64 << 16;

/// Widest vector a circuit may be compiled for.
pub const MAX_DIM: usize = 4096;

/// Supported quantization bit widths.
pub const MIN_BITS: u8 = 2;
pub const MAX_BITS: u8 = 8;

/// The full parameter set, recorded in every compiled circuit so a cached
/// artifact built under different parameters is never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemeParams {
    pub n: usize,
    pub q: i64,
    pub delta: i64,
    pub decomp_bits: u32,
    pub num_digits: usize,
}

impl SchemeParams {
    /// The parameters compiled into this build.
    pub const fn current() -> Self {
        Self {
            n: N,
            q: Q,
            delta: DELTA,
            decomp_bits: DECOMP_BITS,
            num_digits: NUM_DIGITS,
        }
    }

    /// SHA-256 over the parameter set.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"veil_scheme_params_v1");
        hasher.update((self.n as u64).to_le_bytes());
        hasher.update(self.q.to_le_bytes());
        hasher.update(self.delta.to_le_bytes());
        hasher.update(self.decomp_bits.to_le_bytes());
        hasher.update((self.num_digits as u64).to_le_bytes());
        hasher.finalize().into()
    }
}
