//! The compiled dot-product circuit.
//!
//! Compilation is deterministic in (d, bits, scheme parameters): it checks
//! that the worst-case score of the shape decrypts exactly, lays out the
//! op plan, and seals everything under a digest so an artifact read back
//! from disk can be trusted without rebuilding it.

use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ckks::ciphertext::{Ciphertext, ScoreCiphertext};
use crate::ckks::homomorphic::{relinearize, CiphertextTriple};
use crate::ckks::keys::ServerKeys;
use crate::ckks::params::{SchemeParams, DELTA, MAX_BITS, MAX_DIM, MAX_SCORE_MAGNITUDE, MIN_BITS};
use crate::error::{FheError, Result};

/// Upper bound on a serialized circuit: the plan holds at most MAX_DIM + 1 ops.
const MAX_CIRCUIT_BYTES: u64 = 1024 + 16 * (MAX_DIM as u64 + 1);

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// Vector dimension and quantization width a circuit is compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitShape {
    pub dim: usize,
    pub bits: u8,
}

impl CircuitShape {
    pub fn new(dim: usize, bits: u8) -> Self {
        Self { dim, bits }
    }

    /// Smallest representable component, -2^(bits-1).
    pub fn min_value(&self) -> i64 {
        -(1i64 << (self.bits.clamp(1, 63) - 1))
    }

    /// Largest representable component, 2^(bits-1) - 1.
    pub fn max_value(&self) -> i64 {
        -self.min_value() - 1
    }

    /// Worst-case |Σ a_i·b_i| for this shape: d·4^(bits-1).
    pub fn max_abs_score(&self) -> i64 {
        let m = self.min_value();
        (self.dim as i64).saturating_mul(m.saturating_mul(m))
    }

    /// Reject shapes whose worst-case score would not decrypt exactly.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.dim > MAX_DIM {
            return Err(FheError::Compilation(format!(
                "unsupported dimension {} (1..={})",
                self.dim, MAX_DIM
            )));
        }
        if self.bits < MIN_BITS || self.bits > MAX_BITS {
            return Err(FheError::Compilation(format!(
                "unsupported bit width {} ({}..={})",
                self.bits, MIN_BITS, MAX_BITS
            )));
        }
        if self.max_abs_score() > MAX_SCORE_MAGNITUDE {
            return Err(FheError::Compilation(format!(
                "shape {} can reach |score| = {}, above the exact-decryption bound {}",
                self,
                self.max_abs_score(),
                MAX_SCORE_MAGNITUDE
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CircuitShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}b{}", self.dim, self.bits)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitOp {
    /// Tensor slot `slot` of both operands into the accumulator.
    Tensor { slot: usize },
    /// Fold the degree-2 accumulator back to a pair.
    Relinearize,
}

/// Homomorphic operations one evaluation performs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounts {
    /// Ciphertext-ciphertext products.
    pub mul: u64,
    /// Ciphertext additions folding products together.
    pub add: u64,
    pub relinearize: u64,
}

impl OpCounts {
    pub fn scaled(self, times: u64) -> Self {
        Self {
            mul: self.mul * times,
            add: self.add * times,
            relinearize: self.relinearize * times,
        }
    }
}

impl std::ops::AddAssign for OpCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.mul += rhs.mul;
        self.add += rhs.add;
        self.relinearize += rhs.relinearize;
    }
}

// ---------------------------------------------------------------------------
// Compiled circuit
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCircuit {
    pub shape: CircuitShape,
    pub params: SchemeParams,
    pub plan: Vec<CircuitOp>,
    pub max_abs_score: i64,
    /// Scale carried by a score ciphertext (DELTA²).
    pub score_scale: i64,
    pub digest: [u8; 32],
}

fn circuit_digest(
    shape: &CircuitShape,
    params: &SchemeParams,
    plan: &[CircuitOp],
    max_abs_score: i64,
    score_scale: i64,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"veil_circuit_v1");
    hasher.update(params.fingerprint());
    hasher.update((shape.dim as u64).to_le_bytes());
    hasher.update([shape.bits]);
    for op in plan {
        match op {
            CircuitOp::Tensor { slot } => {
                hasher.update([0u8]);
                hasher.update((*slot as u64).to_le_bytes());
            }
            CircuitOp::Relinearize => hasher.update([1u8]),
        }
    }
    hasher.update(max_abs_score.to_le_bytes());
    hasher.update(score_scale.to_le_bytes());
    hasher.finalize().into()
}

impl CompiledCircuit {
    /// Build the circuit for `shape` under the current scheme parameters.
    pub fn compile(shape: CircuitShape) -> Result<Self> {
        shape.validate()?;
        let params = SchemeParams::current();
        let mut plan: Vec<CircuitOp> = (0..shape.dim).map(|slot| CircuitOp::Tensor { slot }).collect();
        plan.push(CircuitOp::Relinearize);
        let max_abs_score = shape.max_abs_score();
        let score_scale = DELTA * DELTA;
        let digest = circuit_digest(&shape, &params, &plan, max_abs_score, score_scale);
        Ok(Self {
            shape,
            params,
            plan,
            max_abs_score,
            score_scale,
            digest,
        })
    }

    /// Check a circuit read back from storage.
    pub fn verify(&self) -> Result<()> {
        if self.params != SchemeParams::current() {
            return Err(FheError::Compilation(format!(
                "cached circuit {} was built for different scheme parameters",
                self.shape
            )));
        }
        let expected = circuit_digest(
            &self.shape,
            &self.params,
            &self.plan,
            self.max_abs_score,
            self.score_scale,
        );
        if expected != self.digest {
            return Err(FheError::Compilation(format!(
                "cached circuit {} failed digest check",
                self.shape
            )));
        }
        Ok(())
    }

    /// Operations performed by one `evaluate`.
    pub fn op_counts(&self) -> OpCounts {
        let tensors = self
            .plan
            .iter()
            .filter(|op| matches!(op, CircuitOp::Tensor { .. }))
            .count() as u64;
        let relins = self.plan.len() as u64 - tensors;
        OpCounts {
            mul: tensors,
            add: tensors.saturating_sub(1),
            relinearize: relins,
        }
    }

    /// Encrypted dot product of `query` and `chunk` under `keys`.
    ///
    /// Needs only server key material. Wrong-epoch, wrong-shape or
    /// tampered operands are rejected before any arithmetic.
    pub fn evaluate(
        &self,
        keys: &ServerKeys,
        query: &Ciphertext,
        chunk: &Ciphertext,
    ) -> Result<ScoreCiphertext> {
        for (role, ct) in [("query", query), ("chunk", chunk)] {
            if ct.key_id != keys.key_id {
                return Err(FheError::Evaluation(format!(
                    "{} ciphertext belongs to key epoch {}, current epoch is {}",
                    role,
                    ct.key_id.short(),
                    keys.key_id.short()
                )));
            }
            if ct.shape != self.shape {
                return Err(FheError::Evaluation(format!(
                    "{} ciphertext has shape {}, circuit is {}",
                    role, ct.shape, self.shape
                )));
            }
            if !ct.verify_integrity() {
                return Err(FheError::Evaluation(format!(
                    "{} ciphertext failed integrity check",
                    role
                )));
            }
        }

        let mut acc = CiphertextTriple::zero();
        let mut pair = None;
        for op in &self.plan {
            match *op {
                CircuitOp::Tensor { slot } => {
                    acc.tensor_accumulate(&query.slots[slot], &chunk.slots[slot]);
                }
                CircuitOp::Relinearize => {
                    pair = Some(relinearize(
                        std::mem::replace(&mut acc, CiphertextTriple::zero()),
                        &keys.eval,
                    ));
                }
            }
        }
        let (c0, c1) = pair.ok_or_else(|| {
            FheError::Evaluation("circuit plan ends without relinearization".into())
        })?;
        Ok(ScoreCiphertext::seal(self.shape, c0, c1, keys.key_id))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FheError::Storage(e.to_string()))
    }

    /// Decode and verify a stored circuit.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let circuit: Self = bincode::DefaultOptions::new()
            .with_limit(MAX_CIRCUIT_BYTES)
            .with_fixint_encoding()
            .deserialize(bytes)
            .map_err(|e| FheError::Compilation(format!("corrupt cached circuit: {}", e)))?;
        circuit.verify()?;
        Ok(circuit)
    }
}
