//! Evaluation key for relinearization.
//!
//! The tensor product of two ciphertexts has a third component d2 that
//! decrypts against s². Relinearization folds it back into a pair using
//! RLWE encryptions of s²·T^j, one per base-T digit j:
//!
//!   b_j = -(a_j·s + e_j) + T^j·s²,  a_j uniform
//!
//! The evaluation key is public material and ships inside `ServerKeys`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::keys::SecretKey;
use super::params::{DECOMP_BASE, NUM_DIGITS};
use super::poly::NttPoly;
use super::sampling::{sample_gaussian, sample_uniform_ntt};

/// `NUM_DIGITS` pairs `(b_j, a_j)`, evaluation domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalKey {
    pub keys: Vec<(NttPoly, NttPoly)>,
}

/// Generate the relinearization key for `sk`.
pub fn gen_eval_key<R: Rng>(sk: &SecretKey, rng: &mut R) -> EvalKey {
    let s_squared = sk.s.mul(&sk.s);
    let mut power_of_t: i64 = 1;

    let keys = (0..NUM_DIGITS)
        .map(|_| {
            let a_j = sample_uniform_ntt(rng);
            let e_j = sample_gaussian(rng).to_ntt();
            let b_j = a_j
                .mul(&sk.s)
                .add(&e_j)
                .neg()
                .add(&s_squared.mul(&NttPoly::constant(power_of_t)));
            // T^3 = 2^48 is the largest power used; still below q.
            power_of_t = power_of_t.saturating_mul(DECOMP_BASE);
            (b_j, a_j)
        })
        .collect();

    EvalKey { keys }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ckks::keys::keygen;
    use crate::ckks::params::{N, SIGMA};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn each_digit_key_hides_scaled_s_squared() {
        let mut rng = StdRng::seed_from_u64(9);
        let (keys, sk) = keygen(&mut rng).unwrap();
        let s2 = sk.s.mul(&sk.s);
        let bound = (SIGMA * 6.0).ceil() as i64;
        let mut power: i64 = 1;
        for (b, a) in &keys.eval.keys {
            // b + a·s - T^j·s² = -e_j
            let residual = b
                .add(&a.mul(&sk.s))
                .sub(&s2.mul(&NttPoly::constant(power)))
                .to_coeffs();
            assert_eq!(residual.coeffs.len(), N);
            assert!(residual.coeffs.iter().all(|c| c.abs() <= bound));
            power = power.saturating_mul(DECOMP_BASE);
        }
    }
}
