//! # veil-search — encrypted similarity search core
//!
//! Raw embeddings are projected to a small width ([`reducer`]), quantized to
//! signed integers ([`quantizer`]), encrypted and stored per chunk
//! ([`store`]). A query is scored against every chunk of a document under
//! encryption ([`engine`]); only the resulting scores are ever decrypted.
//!
//! Alongside the encrypted path, a clear-text shadow ranking measures
//! retrieval quality ([`hybrid`]) and every query leaves an audit record of
//! exactly what it touched ([`audit`]). [`service`] wraps all of it in tagged
//! results.

pub mod audit;
pub mod engine;
pub mod error;
pub mod hybrid;
pub mod quantizer;
pub mod reducer;
pub mod service;
pub mod store;
pub mod telemetry;

pub use engine::{EngineConfig, Query, SearchOutcome, SimilarityEngine, Stores};
pub use error::{ErrorKind, Result, SearchError};
pub use quantizer::{QuantConfig, Quantizer};
pub use reducer::{Reducer, ReducerConfig};
pub use service::{ApiResult, QueryInput, SearchService};
