//! The similarity engine: encrypted top-k over one document's chunks.
//!
//! Per query: reduce → quantize → encrypt once, then score every stored
//! chunk ciphertext on a bounded worker pool (evaluate + decrypt), rank by
//! score with insertion order as tie-break, and return the first k. The
//! plaintext shadow ranking runs alongside on the same pool and feeds the
//! hybrid evaluator; the auditor records what was touched.
//!
//! Chunk-level failures are best effort: the chunk is skipped, logged and
//! counted. A query where every chunk failed is an error, never an empty
//! ranking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use veil_fhe::{Ciphertext, CircuitHandle, CircuitShape, FheContext};

use crate::audit::{self, AuditRecord, AuditReport, DecryptionScope};
use crate::error::{ErrorKind, Result, SearchError};
use crate::hybrid::{self, EvalRecord, EvalSummary, Ranked};
use crate::quantizer::{QuantConfig, Quantizer};
use crate::reducer::Reducer;
use crate::store::{
    CiphertextStore, ChunkId, DocumentId, MemoryCiphertextStore, MemoryShadowStore, QuantMeta,
    ShadowStore, ShadowVector, StoredChunk,
};
use crate::telemetry::{MemoryLog, RecordLog};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Threads scoring chunks within one query.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Persistence the engine writes to.
#[derive(Clone)]
pub struct Stores {
    pub ciphertexts: Arc<dyn CiphertextStore>,
    pub shadow: Arc<dyn ShadowStore>,
    pub evals: Arc<dyn RecordLog<EvalRecord>>,
    pub audits: Arc<dyn RecordLog<AuditRecord>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            ciphertexts: Arc::new(MemoryCiphertextStore::new()),
            shadow: Arc::new(MemoryShadowStore::new()),
            evals: Arc::new(MemoryLog::new()),
            audits: Arc::new(MemoryLog::new()),
        }
    }
}

/// A search query: a raw embedding, or a query already encrypted by
/// `encrypt_vector` (which has no plaintext to shadow).
#[derive(Clone, Copy, Debug)]
pub enum Query<'a> {
    Raw(&'a [f32]),
    Encrypted(&'a [u8]),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub query_id: String,
    pub results: Vec<Ranked<i64>>,
    /// Chunks scored successfully.
    pub scored: usize,
    /// Chunks skipped (corrupt, wrong epoch, failed decryption).
    pub skipped: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub document_id: DocumentId,
    pub chunk_id: ChunkId,
    pub ciphertext_bytes: usize,
}

struct Scored {
    seq: usize,
    chunk_id: ChunkId,
    score: i64,
}

pub struct SimilarityEngine {
    fhe: Arc<FheContext>,
    reducer: Arc<Reducer>,
    quantizer: Quantizer,
    stores: Stores,
    pool: rayon::ThreadPool,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn millis(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

fn hash_embedding(v: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for x in v {
        hasher.update(x.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Descending score, then ascending insertion order.
fn rank<S: PartialOrd + Copy>(items: &mut [(usize, ChunkId, S)]) {
    items.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
}

impl SimilarityEngine {
    pub fn new(
        fhe: Arc<FheContext>,
        reducer: Arc<Reducer>,
        quant: QuantConfig,
        stores: Stores,
        config: EngineConfig,
    ) -> Result<Self> {
        if reducer.config().output_dim != quant.dim {
            return Err(SearchError::ConfigMismatch(format!(
                "reducer outputs {} dimensions, quantizer expects {}",
                reducer.config().output_dim,
                quant.dim
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("veil-score-{}", i))
            .build()
            .map_err(|e| SearchError::Internal(format!("scoring pool: {}", e)))?;
        Ok(Self {
            fhe,
            reducer,
            quantizer: Quantizer::new(quant),
            stores,
            pool,
        })
    }

    pub fn fhe(&self) -> &Arc<FheContext> {
        &self.fhe
    }

    pub fn shape(&self) -> CircuitShape {
        self.quantizer.config().shape()
    }

    /// Metadata every chunk ingested now is stored with.
    pub fn current_meta(&self) -> Result<QuantMeta> {
        let key_id = self.fhe.key_id().ok_or_else(|| {
            SearchError::KeyMissing(
                "no key material has been generated or uploaded; call generate_keys".into(),
            )
        })?;
        let q = self.quantizer.config();
        Ok(QuantMeta {
            dim: q.dim,
            bits: q.bits,
            scale: q.scale,
            zero_point: q.zero_point,
            projection: self.reducer.fingerprint().to_string(),
            key_id,
        })
    }

    /// Compile (or fetch) the circuit for the active shape.
    pub fn prepare(&self) -> Result<CircuitHandle> {
        Ok(self.fhe.compile_circuit(self.shape())?)
    }

    fn encrypt_raw(&self, embedding: &[f32]) -> Result<(Vec<f32>, Ciphertext)> {
        let reduced = self.reducer.reduce(embedding)?;
        let quantized = self.quantizer.quantize(&reduced)?;
        self.prepare()?;
        let ct = self.fhe.encrypt(self.shape(), &quantized.values)?;
        Ok((reduced, ct))
    }

    /// Full reduce → quantize → encrypt pipeline; returns the blob.
    pub fn encrypt_vector(&self, embedding: &[f32]) -> Result<Vec<u8>> {
        let (_, ct) = self.encrypt_raw(embedding)?;
        Ok(ct.to_bytes()?)
    }

    /// Encrypt and store one chunk, plus its shadow vector.
    pub fn ingest_chunk(
        &self,
        doc: DocumentId,
        chunk: ChunkId,
        embedding: &[f32],
    ) -> Result<IngestReceipt> {
        let (reduced, ct) = self.encrypt_raw(embedding)?;
        let bytes = ct.to_bytes()?;
        let ciphertext_bytes = bytes.len();
        let meta = QuantMeta {
            key_id: ct.key_id,
            ..self.current_meta()?
        };
        self.stores.ciphertexts.put(doc, chunk, bytes, meta)?;
        self.stores
            .shadow
            .put(doc, chunk, ShadowVector::new(reduced))?;
        debug!("ingested doc {} chunk {} ({} bytes)", doc, chunk, ciphertext_bytes);
        Ok(IngestReceipt {
            document_id: doc,
            chunk_id: chunk,
            ciphertext_bytes,
        })
    }

    /// Remove every ciphertext and shadow vector of `doc`.
    pub fn delete_document(&self, doc: DocumentId) -> Result<usize> {
        let removed = self.stores.ciphertexts.delete(doc)?;
        self.stores.shadow.delete(doc)?;
        info!("deleted document {} ({} chunks)", doc, removed);
        Ok(removed)
    }

    pub fn eval_stats(&self, doc: DocumentId) -> Result<EvalSummary> {
        let records = self.stores.evals.for_document(doc)?;
        Ok(hybrid::summarize(doc, &records))
    }

    pub fn audit_report(&self, doc: DocumentId) -> Result<AuditReport> {
        let records = self.stores.audits.for_document(doc)?;
        let q = self.quantizer.config();
        Ok(audit::report(doc, &records, q.dim, q.bits))
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Encrypted top-k of `doc` for `query`.
    pub fn search(&self, doc: DocumentId, query: Query<'_>, k: usize) -> Result<SearchOutcome> {
        let started = Instant::now();
        let query_id = format!("{:016x}", rand::random::<u64>());
        let shape = self.shape();

        if !self.fhe.can_decrypt() {
            return Err(SearchError::KeyMissing(
                "this node holds no secret key for the current epoch; call generate_keys".into(),
            ));
        }
        let circuit = self.prepare()?.circuit;

        let (query_ct, reduced, query_hash) = match query {
            Query::Raw(embedding) => {
                let (reduced, ct) = self.encrypt_raw(embedding)?;
                (ct, Some(reduced), hash_embedding(embedding))
            }
            Query::Encrypted(bytes) => {
                let ct = Ciphertext::from_bytes(bytes).map_err(|e| {
                    SearchError::Evaluation(format!("query ciphertext unreadable: {}", e))
                })?;
                if ct.shape != shape {
                    return Err(SearchError::ConfigMismatch(format!(
                        "query encrypted for {}, node is configured for {}",
                        ct.shape, shape
                    )));
                }
                (ct, None, hex::encode(Sha256::digest(bytes)))
            }
        };

        let current = self.current_meta()?;
        let chunks = self.stores.ciphertexts.get_all(doc)?;
        if let Some(bad) = chunks.iter().find(|c| !c.meta.comparable(&current)) {
            return Err(SearchError::ConfigMismatch(format!(
                "chunk {} of document {} was stored as d={} bits={} scale={}, query uses d={} bits={} scale={}",
                bad.chunk_id, doc, bad.meta.dim, bad.meta.bits, bad.meta.scale,
                current.dim, current.bits, current.scale
            )));
        }

        let query_ready = millis(started);
        let ((outcomes, fhe_scoring_ms), plain) = self.pool.install(|| {
            rayon::join(
                || {
                    let t = Instant::now();
                    let out: Vec<_> = chunks
                        .par_iter()
                        .enumerate()
                        .map(|(seq, chunk)| self.score_chunk(seq, chunk, &query_ct))
                        .collect();
                    (out, millis(t))
                },
                || {
                    reduced
                        .as_ref()
                        .map(|r| self.plaintext_ranking(doc, r, &chunks))
                },
            )
        });

        let rank_started = Instant::now();
        let mut scored = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (chunk, outcome) in chunks.iter().zip(outcomes) {
            match outcome {
                Ok(s) => scored.push((s.seq, s.chunk_id, s.score)),
                Err(e) => {
                    warn!(
                        "query {}: skipping chunk {} of document {}: {}",
                        query_id, chunk.chunk_id, doc, e
                    );
                    failures.push(e);
                }
            }
        }

        if scored.is_empty() && !failures.is_empty() {
            let all_decryption = failures.iter().all(|e| e.kind() == ErrorKind::DecryptionError);
            let msg = format!(
                "all {} chunk(s) of document {} failed; first error: {}",
                failures.len(),
                doc,
                failures[0]
            );
            return Err(if all_decryption {
                SearchError::Decryption(msg)
            } else {
                SearchError::Evaluation(msg)
            });
        }

        rank(&mut scored);
        let n_scored = scored.len();
        let results: Vec<Ranked<i64>> = scored
            .into_iter()
            .take(k)
            .map(|(_, chunk_id, score)| Ranked { chunk_id, score })
            .collect();
        let fhe_latency_ms = query_ready + fhe_scoring_ms + millis(rank_started);

        let ops = circuit.op_counts().scaled(n_scored as u64);
        let timestamp = now_secs();

        if let Some(plain) = plain {
            let (plain_ranking, plain_latency_ms) = plain?;
            let (overlap, rank_correlation) =
                hybrid::compare(&results, &plain_ranking, k, chunks.len());
            self.stores.evals.append(EvalRecord {
                query_id: query_id.clone(),
                document_id: doc,
                query_hash: query_hash.clone(),
                top_k: k,
                overlap,
                rank_correlation,
                fhe_latency_ms,
                plain_latency_ms,
                timestamp,
            })?;
        }

        self.stores.audits.append(AuditRecord {
            query_id: query_id.clone(),
            document_id: doc,
            query_hash,
            ciphertexts_touched: n_scored,
            ciphertexts_skipped: failures.len(),
            homomorphic_ops: ops,
            top_k: k,
            reduced_dim: shape.dim,
            quantization_bits: shape.bits,
            decrypted_only: vec![DecryptionScope::SimilarityScores],
            timestamp,
        })?;

        info!(
            "query {} on document {}: {} scored, {} skipped, top-{} in {:.1} ms",
            query_id,
            doc,
            n_scored,
            failures.len(),
            k,
            fhe_latency_ms
        );
        Ok(SearchOutcome {
            query_id,
            results,
            scored: n_scored,
            skipped: failures.len(),
        })
    }

    /// Evaluate and decrypt one chunk against the query.
    fn score_chunk(&self, seq: usize, chunk: &StoredChunk, query: &Ciphertext) -> Result<Scored> {
        if chunk.meta.key_id != query.key_id {
            return Err(SearchError::Evaluation(format!(
                "stored under retired key epoch {}",
                chunk.meta.key_id.short()
            )));
        }
        let ct = Ciphertext::from_bytes(&chunk.ciphertext)
            .map_err(|e| SearchError::Evaluation(format!("unreadable ciphertext: {}", e)))?;
        let score_ct = self.fhe.evaluate(query, &ct)?;
        let score = self.fhe.decrypt(&score_ct)?;
        Ok(Scored {
            seq,
            chunk_id: chunk.chunk_id,
            score,
        })
    }

    /// Float dot products against the shadow vectors, ranked like the
    /// encrypted path. Returns the ranking and its latency.
    fn plaintext_ranking(
        &self,
        doc: DocumentId,
        query: &[f32],
        chunks: &[StoredChunk],
    ) -> Result<(Vec<Ranked<f64>>, f64)> {
        let t = Instant::now();
        let seq_of: HashMap<ChunkId, usize> = chunks
            .iter()
            .enumerate()
            .map(|(seq, c)| (c.chunk_id, seq))
            .collect();
        let mut items: Vec<(usize, ChunkId, f64)> = self
            .stores
            .shadow
            .get_all(doc)?
            .into_iter()
            .filter_map(|(chunk_id, v)| {
                let seq = *seq_of.get(&chunk_id)?;
                let dot = v
                    .values
                    .iter()
                    .zip(query)
                    .map(|(&a, &b)| a as f64 * b as f64)
                    .sum::<f64>();
                Some((seq, chunk_id, dot))
            })
            .collect();
        rank(&mut items);
        let ranking = items
            .into_iter()
            .map(|(_, chunk_id, score)| Ranked { chunk_id, score })
            .collect();
        Ok((ranking, millis(t)))
    }
}
