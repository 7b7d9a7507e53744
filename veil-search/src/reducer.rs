//! Fixed random projection from the embedding width D to the reduced width d.
//!
//! The matrix is a d×D Rademacher matrix scaled by 1/√d, generated from a
//! seed with ChaCha20 so every process and platform that uses the same seed
//! gets the same matrix bit for bit. Inputs are L2-normalized first, which
//! keeps reduced components inside a predictable range for the quantizer.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SearchError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerConfig {
    /// Embedding width D.
    pub input_dim: usize,
    /// Reduced width d.
    pub output_dim: usize,
    /// Seed of the projection matrix. Changing it is a breaking schema change.
    pub seed: u64,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            input_dim: 768,
            output_dim: 32,
            seed: 0x5EED_0F_7E11,
        }
    }
}

pub struct Reducer {
    config: ReducerConfig,
    /// Row-major d×D, entries ±1/√d.
    matrix: Vec<f32>,
    fingerprint: String,
}

impl Reducer {
    pub fn new(config: ReducerConfig) -> Result<Self> {
        if config.input_dim == 0 || config.output_dim == 0 {
            return Err(SearchError::ConfigMismatch(
                "projection dimensions must be non-zero".into(),
            ));
        }
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&config.seed.to_le_bytes());
        seed[8..16].copy_from_slice(&(config.input_dim as u64).to_le_bytes());
        seed[16..24].copy_from_slice(&(config.output_dim as u64).to_le_bytes());
        let mut rng = ChaCha20Rng::from_seed(seed);

        let entry = 1.0 / (config.output_dim as f32).sqrt();
        let matrix: Vec<f32> = (0..config.output_dim * config.input_dim)
            .map(|_| if rng.gen::<bool>() { entry } else { -entry })
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(b"veil_projection_v1");
        hasher.update((config.input_dim as u64).to_le_bytes());
        hasher.update((config.output_dim as u64).to_le_bytes());
        for v in &matrix {
            hasher.update(v.to_le_bytes());
        }
        let fingerprint = hex::encode(hasher.finalize());

        Ok(Self {
            config,
            matrix,
            fingerprint,
        })
    }

    pub fn config(&self) -> &ReducerConfig {
        &self.config
    }

    /// SHA-256 of the matrix, hex. Recorded with every stored chunk.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Normalize `vector` and project it to d dimensions.
    ///
    /// A zero vector stays zero.
    pub fn reduce(&self, vector: &[f32]) -> Result<Vec<f32>> {
        let d_in = self.config.input_dim;
        if vector.len() != d_in {
            return Err(SearchError::DimensionMismatch {
                expected: d_in,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(SearchError::ConfigMismatch(
                "embedding contains non-finite values".into(),
            ));
        }

        let norm = vector.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>().sqrt();
        let inv = if norm > 0.0 { 1.0 / norm } else { 0.0 };

        let reduced = self
            .matrix
            .chunks_exact(d_in)
            .map(|row| {
                let acc: f64 = row
                    .iter()
                    .zip(vector)
                    .map(|(&m, &v)| m as f64 * v as f64)
                    .sum();
                (acc * inv) as f32
            })
            .collect();
        Ok(reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ReducerConfig {
        ReducerConfig {
            input_dim: 64,
            output_dim: 8,
            seed: 7,
        }
    }

    #[test]
    fn same_seed_same_projection() {
        let a = Reducer::new(small()).unwrap();
        let b = Reducer::new(small()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let v: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        assert_eq!(a.reduce(&v).unwrap(), b.reduce(&v).unwrap());
    }

    #[test]
    fn different_seed_different_projection() {
        let a = Reducer::new(small()).unwrap();
        let b = Reducer::new(ReducerConfig { seed: 8, ..small() }).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn wrong_length_is_dimension_mismatch() {
        let r = Reducer::new(small()).unwrap();
        assert_eq!(
            r.reduce(&[0.0; 63]).unwrap_err(),
            SearchError::DimensionMismatch {
                expected: 64,
                actual: 63
            }
        );
    }

    #[test]
    fn zero_vector_reduces_to_zero() {
        let r = Reducer::new(small()).unwrap();
        assert!(r.reduce(&[0.0; 64]).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn output_is_scale_invariant() {
        let r = Reducer::new(small()).unwrap();
        let v: Vec<f32> = (0..64).map(|i| (i as f32).cos()).collect();
        let w: Vec<f32> = v.iter().map(|x| x * 10.0).collect();
        let (a, b) = (r.reduce(&v).unwrap(), r.reduce(&w).unwrap());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let r = Reducer::new(small()).unwrap();
        let mut v = vec![0.1; 64];
        v[3] = f32::NAN;
        assert!(r.reduce(&v).is_err());
    }
}
