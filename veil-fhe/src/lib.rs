//! # veil-fhe — exact encrypted dot products
//!
//! Ring-LWE encryption of quantized integer vectors, a compiled circuit
//! that scores two ciphertexts without the secret key, and the context that
//! owns key material and the circuit cache.
//!
//! ```ignore
//! let ctx = FheContext::init(Arc::new(FsRepository::open("data/fhe")?))?;
//! ctx.generate_keys(false)?;
//! let shape = CircuitShape::new(32, 4);
//! ctx.compile_circuit(shape)?;
//! let q = ctx.encrypt(shape, &query)?;
//! let c = ctx.encrypt(shape, &chunk)?;
//! let score = ctx.decrypt(&ctx.evaluate(&q, &c)?)?; // Σ query[i]·chunk[i]
//! ```

pub mod circuit;
pub mod ckks;
pub mod context;
pub mod error;
pub mod repository;

pub use circuit::{CircuitShape, CompiledCircuit, OpCounts};
pub use ckks::{Ciphertext, KeyId, ScoreCiphertext, SecretKey, ServerKeys};
pub use context::{CircuitHandle, CircuitSource, ContextState, FheContext, KeyHandle};
pub use error::{FheError, Result};
pub use repository::{Artifact, FsRepository, MemoryRepository, Repository};
