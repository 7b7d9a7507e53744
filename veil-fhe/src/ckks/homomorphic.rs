//! Ciphertext-ciphertext arithmetic for the dot-product circuit.
//!
//! A dot product of two vector ciphertexts is the sum, over slots, of
//! slot-wise tensor products. The tensor of (a0, a1) and (b0, b1) is the
//! triple
//!
//!   d0 = a0·b0,  d1 = a0·b1 + a1·b0,  d2 = a1·b1
//!
//! which decrypts as d0 + d1·s + d2·s². Triples add component-wise, so the
//! whole sum is accumulated first and relinearized exactly once.
//!
//! Scale: slot plaintexts carry DELTA, so the accumulated triple carries
//! DELTA². There is no rescaling; decryption divides DELTA² out.

use super::eval_key::EvalKey;
use super::poly::NttPoly;

// ---------------------------------------------------------------------------
// Ciphertext triple (transient, never stored)
// ---------------------------------------------------------------------------

/// Degree-2 ciphertext: the running sum of tensor products.
#[derive(Clone, Debug)]
pub struct CiphertextTriple {
    pub d0: NttPoly,
    pub d1: NttPoly,
    pub d2: NttPoly,
}

impl CiphertextTriple {
    /// Encryption of zero with a zero s² component.
    pub fn zero() -> Self {
        Self {
            d0: NttPoly::zero(),
            d1: NttPoly::zero(),
            d2: NttPoly::zero(),
        }
    }

    /// `self += (a0, a1) ⊗ (b0, b1)`.
    pub fn tensor_accumulate(&mut self, a: &(NttPoly, NttPoly), b: &(NttPoly, NttPoly)) {
        let (a0, a1) = a;
        let (b0, b1) = b;
        self.d0.add_mul_assign(a0, b0);
        self.d1.add_mul_assign(a0, b1);
        self.d1.add_mul_assign(a1, b0);
        self.d2.add_mul_assign(a1, b1);
    }
}

// ---------------------------------------------------------------------------
// Relinearization
// ---------------------------------------------------------------------------

/// Fold a triple back into a pair with the evaluation key.
///
/// d2 is brought to the coefficient domain and split into base-T digits
/// D_j; each digit is transformed back and multiplied against evk_j:
///
///   c0 = d0 + Σ_j D_j·b_j
///   c1 = d1 + Σ_j D_j·a_j
///
/// Since b_j + a_j·s = T^j·s² - e_j, the pair decrypts to
/// d0 + d1·s + d2·s² - Σ_j D_j·e_j. Digits are below T, which keeps the
/// added noise small.
pub fn relinearize(triple: CiphertextTriple, evk: &EvalKey) -> (NttPoly, NttPoly) {
    let CiphertextTriple { mut d0, mut d1, d2 } = triple;
    let digits = d2.to_coeffs().decompose_base_t();
    for (digit, (b_j, a_j)) in digits.iter().zip(&evk.keys) {
        let digit = digit.to_ntt();
        d0.add_mul_assign(&digit, b_j);
        d1.add_mul_assign(&digit, a_j);
    }
    (d0, d1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ckks::params::{DELTA, N};
    use crate::ckks::keys::keygen;
    use crate::ckks::poly::Poly;
    use crate::ckks::sampling::sample_ternary;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Decrypt a triple directly: d0 + d1·s + d2·s².
    fn decrypt_triple(t: &CiphertextTriple, s: &NttPoly) -> Poly {
        t.d0.add(&t.d1.mul(s)).add(&t.d2.mul(&s.mul(s))).to_coeffs()
    }

    /// Trivial-noise encryption of a constant, enough to exercise the algebra.
    fn encrypt_const(
        value: i64,
        keys_b: &NttPoly,
        keys_a: &NttPoly,
        rng: &mut StdRng,
    ) -> (NttPoly, NttPoly) {
        let u = sample_ternary(rng).to_ntt();
        let m = NttPoly::constant(value * DELTA);
        (keys_b.mul(&u).add(&m), keys_a.mul(&u))
    }

    #[test]
    fn relinearized_pair_matches_triple_decryption() {
        let mut rng = StdRng::seed_from_u64(5);
        let (keys, sk) = keygen(&mut rng).unwrap();
        let mut triple = CiphertextTriple::zero();
        for (x, y) in [(3i64, -4i64), (-8, -8), (7, 1)] {
            let a = encrypt_const(x, &keys.public.b, &keys.public.a, &mut rng);
            let b = encrypt_const(y, &keys.public.b, &keys.public.a, &mut rng);
            triple.tensor_accumulate(&a, &b);
        }
        let before = decrypt_triple(&triple, &sk.s);
        let (c0, c1) = relinearize(triple, &keys.eval);
        let after = c0.add(&c1.mul(&sk.s)).to_coeffs();

        let scale = (DELTA as i128) * (DELTA as i128);
        let expected = (3 * -4 + 64 + 7) as i128 * scale;
        assert_eq!(after.coeffs.len(), N);
        let noise_before = (before.coeffs[0] as i128 - expected).abs();
        let noise_after = (after.coeffs[0] as i128 - expected).abs();
        assert!(noise_before < scale / 64, "triple noise {}", noise_before);
        assert!(noise_after < scale / 64, "relinearized noise {}", noise_after);
    }
}
