//! Privacy audit trail.
//!
//! Each search appends an [`AuditRecord`] stating how many stored
//! ciphertexts were homomorphically scored and what was decrypted. The
//! decryption scope is an enum with a single variant, so a record claiming
//! anything other than similarity scores cannot be constructed.

use serde::{Deserialize, Serialize};
use veil_fhe::OpCounts;

use crate::store::DocumentId;
use crate::telemetry::Record;

/// What a query is allowed to decrypt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptionScope {
    SimilarityScores,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub query_id: String,
    pub document_id: DocumentId,
    /// SHA-256 of the query, hex.
    pub query_hash: String,
    /// Stored ciphertexts scored for this query.
    pub ciphertexts_touched: usize,
    /// Stored ciphertexts skipped as corrupt or from a retired key epoch.
    pub ciphertexts_skipped: usize,
    pub homomorphic_ops: OpCounts,
    pub top_k: usize,
    pub reduced_dim: usize,
    pub quantization_bits: u8,
    pub decrypted_only: Vec<DecryptionScope>,
    pub timestamp: u64,
}

impl AuditRecord {
    /// Every record declares score-only decryption.
    pub fn zero_plaintext_docs_exposed(&self) -> bool {
        self.decrypted_only
            .iter()
            .all(|s| *s == DecryptionScope::SimilarityScores)
    }
}

impl Record for AuditRecord {
    fn document_id(&self) -> DocumentId {
        self.document_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub document_id: DocumentId,
    pub total_queries: usize,
    pub mean_ciphertexts_touched: f64,
    pub total_ciphertexts_skipped: usize,
    pub total_homomorphic_ops: OpCounts,
    /// Active configuration of this node.
    pub reduced_dim: usize,
    pub quantization_bits: u8,
    pub decryption_scope: Vec<DecryptionScope>,
    pub zero_plaintext_docs_exposed: bool,
}

/// Aggregate the records of one document under the active (d, bits).
pub fn report(
    document_id: DocumentId,
    records: &[AuditRecord],
    reduced_dim: usize,
    quantization_bits: u8,
) -> AuditReport {
    let total_queries = records.len();
    let touched: usize = records.iter().map(|r| r.ciphertexts_touched).sum();
    let mut ops = OpCounts::default();
    for r in records {
        ops += r.homomorphic_ops;
    }
    AuditReport {
        document_id,
        total_queries,
        mean_ciphertexts_touched: if total_queries == 0 {
            0.0
        } else {
            touched as f64 / total_queries as f64
        },
        total_ciphertexts_skipped: records.iter().map(|r| r.ciphertexts_skipped).sum(),
        total_homomorphic_ops: ops,
        reduced_dim,
        quantization_bits,
        decryption_scope: vec![DecryptionScope::SimilarityScores],
        zero_plaintext_docs_exposed: records.iter().all(AuditRecord::zero_plaintext_docs_exposed),
    }
}
