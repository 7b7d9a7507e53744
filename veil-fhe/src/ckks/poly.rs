//! Polynomial ring Z_q[X]/(X^N + 1) in two representations.
//!
//! [`Poly`] holds coefficients in the centered range (-q/2, q/2] and is
//! used where coefficients matter: sampling, message encoding, digit
//! decomposition and decoding. [`NttPoly`] holds evaluation-domain values
//! in [0, q); ciphertexts and keys are stored this way so that every ring
//! product in the dot-product circuit is element-wise.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ntt::{mod_mul, ntt_context};
use super::params::{DECOMP_BASE, DECOMP_BITS, N, NUM_DIGITS, Q};

/// A polynomial in coefficient form. Always has exactly N coefficients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poly {
    pub coeffs: Vec<i64>,
}

impl Poly {
    /// The zero polynomial.
    pub fn zero() -> Self {
        Self {
            coeffs: vec![0i64; N],
        }
    }

    /// Create from a coefficient vector. Pads or truncates to length N.
    #[cfg(test)]
    pub fn from_coeffs(mut coeffs: Vec<i64>) -> Self {
        coeffs.resize(N, 0);
        for c in coeffs.iter_mut() {
            *c = mod_reduce(*c);
        }
        Self { coeffs }
    }

    /// The constant polynomial `value`.
    #[cfg(test)]
    pub fn constant(value: i64) -> Self {
        let mut p = Self::zero();
        p.coeffs[0] = mod_reduce(value);
        p
    }

    /// Forward NTT into the evaluation domain.
    pub fn to_ntt(&self) -> NttPoly {
        NttPoly {
            values: ntt_context().forward(&self.coeffs),
        }
    }

    /// Decompose each coefficient into unsigned base-T digits.
    ///
    /// Returns `NUM_DIGITS` polynomials with digit[j] in [0, T), such that
    /// Σ_j digit[j]·T^j equals the coefficient's representative in [0, q).
    pub fn decompose_base_t(&self) -> Vec<Poly> {
        let mask = DECOMP_BASE - 1;
        let mut digits = vec![Poly::zero(); NUM_DIGITS];
        for (i, &c) in self.coeffs.iter().enumerate() {
            let mut val = c.rem_euclid(Q);
            for digit in digits.iter_mut() {
                digit.coeffs[i] = val & mask;
                val >>= DECOMP_BITS;
            }
        }
        digits
    }
}

/// A polynomial in evaluation (NTT) form, values in [0, q).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NttPoly {
    pub values: Vec<i64>,
}

impl NttPoly {
    /// The zero polynomial.
    pub fn zero() -> Self {
        Self {
            values: vec![0i64; N],
        }
    }

    /// A constant polynomial. Its transform is flat: every point equals `value`.
    pub fn constant(value: i64) -> Self {
        Self {
            values: vec![value.rem_euclid(Q); N],
        }
    }

    /// Inverse NTT back to centered coefficients.
    pub fn to_coeffs(&self) -> Poly {
        let ctx = ntt_context();
        let coeffs = ctx.inverse(&self.values).into_iter().map(|v| ctx.center(v)).collect();
        Poly { coeffs }
    }

    /// True when every value is a canonical residue and the length is N.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() == N && self.values.iter().all(|&v| (0..Q).contains(&v))
    }

    /// Element-wise addition mod q.
    pub fn add(&self, other: &NttPoly) -> NttPoly {
        let values = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(&a, &b)| add_mod(a, b))
            .collect();
        NttPoly { values }
    }

    /// Element-wise subtraction mod q.
    #[cfg(test)]
    pub fn sub(&self, other: &NttPoly) -> NttPoly {
        let values = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(&a, &b)| add_mod(a, Q - b))
            .collect();
        NttPoly { values }
    }

    /// Negate mod q.
    pub fn neg(&self) -> NttPoly {
        let values = self.values.iter().map(|&a| if a == 0 { 0 } else { Q - a }).collect();
        NttPoly { values }
    }

    /// Ring product (element-wise in the evaluation domain).
    pub fn mul(&self, other: &NttPoly) -> NttPoly {
        let values = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(&a, &b)| mod_mul(a, b, Q))
            .collect();
        NttPoly { values }
    }

    /// `self += a · b`, the accumulation step of the dot-product circuit.
    pub fn add_mul_assign(&mut self, a: &NttPoly, b: &NttPoly) {
        for ((acc, &x), &y) in self.values.iter_mut().zip(&a.values).zip(&b.values) {
            *acc = add_mod(*acc, mod_mul(x, y, Q));
        }
    }

    /// Little-endian bytes of every value, for hashing.
    pub fn hash_into(&self, hasher: &mut Sha256) {
        for v in &self.values {
            hasher.update(v.to_le_bytes());
        }
    }
}

#[inline]
fn add_mod(a: i64, b: i64) -> i64 {
    let s = a + b;
    if s >= Q {
        s - Q
    } else {
        s
    }
}

/// Centered modular reduction into (-q/2, q/2].
#[cfg(test)]
pub fn mod_reduce(val: i64) -> i64 {
    let r = val.rem_euclid(Q);
    if r > Q / 2 {
        r - Q
    } else {
        r
    }
}
