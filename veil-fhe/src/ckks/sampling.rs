//! Random sampling: uniform (directly in the evaluation domain), ternary
//! secrets and discrete Gaussian errors.

use rand::Rng;

use super::params::{N, Q, SIGMA};
use super::poly::{NttPoly, Poly};

/// Uniform polynomial, sampled point-wise in the evaluation domain.
///
/// The NTT is a bijection on Z_q^N, so this is distributed exactly like a
/// uniform coefficient polynomial and saves one transform.
pub fn sample_uniform_ntt<R: Rng>(rng: &mut R) -> NttPoly {
    NttPoly {
        values: (0..N).map(|_| rng.gen_range(0..Q)).collect(),
    }
}

/// Ternary polynomial over {-1, 0, 1} with P(0) = 0.5, P(±1) = 0.25.
pub fn sample_ternary<R: Rng>(rng: &mut R) -> Poly {
    let coeffs = (0..N)
        .map(|_| match rng.gen_range(0u8..4) {
            0 => -1,
            1 => 1,
            _ => 0,
        })
        .collect();
    Poly { coeffs }
}

/// Discrete Gaussian polynomial with σ = SIGMA.
/// Box-Muller pairs, rounded, with samples beyond 6σ rejected.
pub fn sample_gaussian<R: Rng>(rng: &mut R) -> Poly {
    let tail_bound = (SIGMA * 6.0).ceil() as i64;
    let mut coeffs = Vec::with_capacity(N);
    while coeffs.len() < N {
        let u1: f64 = rng.gen_range(1e-15_f64..1.0_f64);
        let u2: f64 = rng.gen_range(0.0_f64..std::f64::consts::TAU);
        let r = (-2.0 * u1.ln()).sqrt() * SIGMA;
        for z in [r * u2.cos(), r * u2.sin()] {
            let s = z.round() as i64;
            if s.abs() <= tail_bound && coeffs.len() < N {
                coeffs.push(s);
            }
        }
    }
    Poly { coeffs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn ternary_has_all_three_values() {
        let p = sample_ternary(&mut test_rng());
        assert!(p.coeffs.iter().all(|c| (-1..=1).contains(c)));
        assert!(p.coeffs.contains(&-1));
        assert!(p.coeffs.contains(&0));
        assert!(p.coeffs.contains(&1));
    }

    #[test]
    fn uniform_values_are_canonical() {
        let p = sample_uniform_ntt(&mut test_rng());
        assert!(p.is_well_formed());
    }

    #[test]
    fn gaussian_is_small_and_centered() {
        let p = sample_gaussian(&mut test_rng());
        assert_eq!(p.coeffs.len(), N);
        assert!(p.coeffs.iter().all(|c| c.abs() <= 20));
        let mean: f64 = p.coeffs.iter().map(|&c| c as f64).sum::<f64>() / N as f64;
        assert!(mean.abs() < 1.0, "gaussian mean too far from zero: {}", mean);
    }
}
