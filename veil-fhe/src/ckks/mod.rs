//! # Lattice layer
//!
//! From-scratch Ring-LWE encryption with fixed-point (CKKS-style) encoding,
//! specialised to one circuit: the exact dot product of two quantized
//! integer vectors.
//!
//! - Ring dimension N = 2048, single modulus q = 2^62 - 2^16 + 1
//! - Scale DELTA = 2^22 per component, DELTA² per product
//! - One relinearization per dot product (base-2^16 digit decomposition)
//! - Keys and ciphertexts are stored in the NTT domain

pub mod ciphertext;
pub mod eval_key;
pub mod homomorphic;
pub mod keys;
pub mod ntt;
pub mod params;
pub mod poly;
pub mod sampling;

pub use ciphertext::{Ciphertext, ScoreCiphertext};
pub use eval_key::EvalKey;
pub use keys::{keygen, KeyId, PublicKey, SecretKey, ServerKeys};
