//! Hybrid evaluation: the encrypted ranking against a plaintext shadow.
//!
//! For every raw-embedding query the engine also ranks the chunks by the
//! float dot product of the reduced vectors. This module scores how well
//! the two rankings agree and aggregates the per-query records.

use serde::{Deserialize, Serialize};

use crate::store::{ChunkId, DocumentId};
use crate::telemetry::Record;

/// One ranked entry, in the order returned to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ranked<S> {
    pub chunk_id: ChunkId,
    pub score: S,
}

/// `|A ∩ B| / k_eff` with `k_eff = min(k, available)`; 1.0 when `k_eff` is 0.
pub fn overlap(encrypted: &[ChunkId], plaintext: &[ChunkId], k: usize, available: usize) -> f64 {
    let k_eff = k.min(available);
    if k_eff == 0 {
        return 1.0;
    }
    let hits = encrypted
        .iter()
        .take(k_eff)
        .filter(|id| plaintext.iter().take(k_eff).any(|p| p == *id))
        .count();
    hits as f64 / k_eff as f64
}

/// 1-based ranks, ties sharing the mean of the ranks they span.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let mean = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = mean;
        }
        i = j + 1;
    }
    ranks
}

/// Spearman's rho of paired samples (Pearson correlation of average ranks).
///
/// `None` with fewer than two pairs or when either side has no rank variance.
pub fn spearman(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len();
    if n < 2 || ys.len() != n {
        return None;
    }
    let (rx, ry) = (average_ranks(xs), average_ranks(ys));
    let mean = (n as f64 + 1.0) / 2.0;
    let (mut cov, mut vx, mut vy) = (0.0, 0.0, 0.0);
    for (a, b) in rx.iter().zip(&ry) {
        cov += (a - mean) * (b - mean);
        vx += (a - mean) * (a - mean);
        vy += (b - mean) * (b - mean);
    }
    if vx == 0.0 || vy == 0.0 {
        return None;
    }
    Some((cov / (vx * vy).sqrt()).clamp(-1.0, 1.0))
}

/// Agreement between an encrypted top-k and the plaintext ranking.
///
/// Correlation pairs each encrypted top-k item's encrypted score with its
/// plaintext score; items without a plaintext score are left out.
pub fn compare(
    encrypted_top: &[Ranked<i64>],
    plaintext_ranking: &[Ranked<f64>],
    k: usize,
    available: usize,
) -> (f64, Option<f64>) {
    let enc_ids: Vec<ChunkId> = encrypted_top.iter().map(|r| r.chunk_id).collect();
    let plain_ids: Vec<ChunkId> = plaintext_ranking.iter().map(|r| r.chunk_id).collect();
    let ov = overlap(&enc_ids, &plain_ids, k, available);

    let (xs, ys): (Vec<f64>, Vec<f64>) = encrypted_top
        .iter()
        .filter_map(|e| {
            plaintext_ranking
                .iter()
                .find(|p| p.chunk_id == e.chunk_id)
                .map(|p| (e.score as f64, p.score))
        })
        .unzip();
    (ov, spearman(&xs, &ys))
}

/// One row per query processed on the raw-embedding path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub query_id: String,
    pub document_id: DocumentId,
    /// SHA-256 of the query, hex. The query itself is never stored.
    pub query_hash: String,
    pub top_k: usize,
    pub overlap: f64,
    pub rank_correlation: Option<f64>,
    pub fhe_latency_ms: f64,
    pub plain_latency_ms: f64,
    pub timestamp: u64,
}

impl Record for EvalRecord {
    fn document_id(&self) -> DocumentId {
        self.document_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub document_id: DocumentId,
    pub count: usize,
    pub mean_overlap: Option<f64>,
    pub mean_overlap_pct: Option<f64>,
    /// Mean over queries that had a defined correlation.
    pub mean_rank_correlation: Option<f64>,
    pub mean_fhe_latency_ms: Option<f64>,
    pub mean_plain_latency_ms: Option<f64>,
    /// FHE latency divided by plaintext latency.
    pub latency_ratio: Option<f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

pub fn summarize(document_id: DocumentId, records: &[EvalRecord]) -> EvalSummary {
    let mean_overlap = mean(records.iter().map(|r| r.overlap));
    let mean_fhe = mean(records.iter().map(|r| r.fhe_latency_ms));
    let mean_plain = mean(records.iter().map(|r| r.plain_latency_ms));
    let latency_ratio = match (mean_fhe, mean_plain) {
        (Some(f), Some(p)) if p > 0.0 => Some(f / p),
        _ => None,
    };
    EvalSummary {
        document_id,
        count: records.len(),
        mean_overlap,
        mean_overlap_pct: mean_overlap.map(|m| m * 100.0),
        mean_rank_correlation: mean(records.iter().filter_map(|r| r.rank_correlation)),
        mean_fhe_latency_ms: mean_fhe,
        mean_plain_latency_ms: mean_plain,
        latency_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(ids: &[(ChunkId, i64)]) -> Vec<Ranked<i64>> {
        ids.iter().map(|&(chunk_id, score)| Ranked { chunk_id, score }).collect()
    }

    fn plain(ids: &[(ChunkId, f64)]) -> Vec<Ranked<f64>> {
        ids.iter().map(|&(chunk_id, score)| Ranked { chunk_id, score }).collect()
    }

    #[test]
    fn overlap_bounds() {
        assert_eq!(overlap(&[1, 2, 3], &[3, 2, 1], 3, 5), 1.0);
        assert_eq!(overlap(&[1, 2], &[3, 4], 2, 5), 0.0);
        assert_eq!(overlap(&[1, 2], &[2, 9], 2, 5), 0.5);
    }

    #[test]
    fn overlap_uses_effective_k() {
        // k larger than the corpus: both rankings hold all 2 chunks.
        assert_eq!(overlap(&[1, 2], &[2, 1], 10, 2), 1.0);
        assert_eq!(overlap(&[], &[], 0, 4), 1.0);
        assert_eq!(overlap(&[], &[], 5, 0), 1.0);
    }

    #[test]
    fn overlap_penalizes_skipped_chunks() {
        // One chunk skipped on the encrypted side.
        assert_eq!(overlap(&[1], &[1, 2], 2, 2), 0.5);
    }

    #[test]
    fn spearman_perfect_and_inverse() {
        let xs = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(spearman(&xs, &[0.1, 0.2, 0.3, 0.4]), Some(1.0));
        assert_eq!(spearman(&xs, &[4.0, 3.0, 2.0, 1.0]), Some(-1.0));
    }

    #[test]
    fn spearman_with_ties() {
        // Ranks x = [1.5, 1.5, 3], y = [1, 2, 3] → rho = sqrt(3)/2
        let rho = spearman(&[5.0, 5.0, 9.0], &[1.0, 2.0, 3.0]).unwrap();
        assert!((rho - 0.8660254).abs() < 1e-6, "rho = {}", rho);
    }

    #[test]
    fn spearman_undefined_cases() {
        assert_eq!(spearman(&[1.0], &[1.0]), None);
        assert_eq!(spearman(&[], &[]), None);
        assert_eq!(spearman(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]), None);
    }

    #[test]
    fn compare_identical_rankings() {
        let e = enc(&[(7, 90), (3, 40), (5, -10)]);
        let p = plain(&[(7, 0.9), (3, 0.4), (5, -0.1)]);
        let (ov, rho) = compare(&e, &p, 3, 3);
        assert_eq!(ov, 1.0);
        assert_eq!(rho, Some(1.0));
    }

    #[test]
    fn summary_ignores_null_correlations() {
        let rec = |overlap, rho, fhe, plain| EvalRecord {
            query_id: "q".into(),
            document_id: 1,
            query_hash: "h".into(),
            top_k: 3,
            overlap,
            rank_correlation: rho,
            fhe_latency_ms: fhe,
            plain_latency_ms: plain,
            timestamp: 0,
        };
        let s = summarize(1, &[rec(1.0, Some(0.5), 100.0, 1.0), rec(0.5, None, 300.0, 3.0)]);
        assert_eq!(s.count, 2);
        assert_eq!(s.mean_overlap, Some(0.75));
        assert_eq!(s.mean_overlap_pct, Some(75.0));
        assert_eq!(s.mean_rank_correlation, Some(0.5));
        assert_eq!(s.mean_fhe_latency_ms, Some(200.0));
        assert_eq!(s.latency_ratio, Some(100.0));
    }

    #[test]
    fn empty_summary_has_no_means() {
        let s = summarize(4, &[]);
        assert_eq!(s.count, 0);
        assert_eq!(s.mean_overlap, None);
        assert_eq!(s.latency_ratio, None);
    }
}
