//! Tagged operation API.
//!
//! Every operation the core exposes returns an [`ApiResult`]: a success
//! variant carrying the payload, or a failure variant carrying one error
//! kind and a message. This is the surface the node serializes to JSON.

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use veil_fhe::{KeyHandle, ServerKeys};

use crate::audit::AuditReport;
use crate::engine::{IngestReceipt, Query, SearchOutcome, SimilarityEngine};
use crate::error::{ErrorKind, Result, SearchError};
use crate::hybrid::EvalSummary;
use crate::store::{ChunkId, DocumentId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiResult<T> {
    Ok { data: T },
    Err { kind: ErrorKind, message: String },
}

impl<T> ApiResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiResult::Ok { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ApiResult::Ok { .. } => None,
            ApiResult::Err { kind, .. } => Some(*kind),
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            ApiResult::Ok { data } => Some(data),
            ApiResult::Err { .. } => None,
        }
    }
}

impl<T> From<Result<T>> for ApiResult<T> {
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(data) => ApiResult::Ok { data },
            Err(e) => {
                let kind = e.kind();
                if kind.is_caller_error() {
                    debug!("rejected request: {}", e);
                } else {
                    warn!("request failed ({:?}): {}", kind, e);
                }
                ApiResult::Err {
                    kind,
                    message: e.to_string(),
                }
            }
        }
    }
}

/// Key epoch as reported to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub created: bool,
    pub can_decrypt: bool,
}

impl From<KeyHandle> for KeyInfo {
    fn from(h: KeyHandle) -> Self {
        Self {
            key_id: h.key_id.to_string(),
            created: h.created,
            can_decrypt: h.can_decrypt,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedVector {
    /// Hex of the serialized ciphertext.
    pub ciphertext: String,
    pub size_bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReceipt {
    pub document_id: DocumentId,
    pub chunks_removed: usize,
}

/// A query as it arrives from a caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryInput {
    /// Raw embedding of width D.
    Embedding(Vec<f32>),
    /// Hex ciphertext returned by `encrypt_vector`.
    Ciphertext(String),
}

pub struct SearchService {
    engine: Arc<SimilarityEngine>,
}

impl SearchService {
    pub fn new(engine: Arc<SimilarityEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SimilarityEngine> {
        &self.engine
    }

    /// Create key material (no-op unless `force` when keys exist) and make
    /// sure the active circuit runs under it.
    pub fn generate_keys(&self, force: bool) -> ApiResult<KeyInfo> {
        let run = || -> Result<KeyInfo> {
            let handle = self.engine.fhe().generate_keys(force)?;
            self.engine.prepare()?;
            Ok(handle.into())
        };
        run().into()
    }

    /// Register server keys generated off-box (bincode bundle).
    pub fn upload_key(&self, bundle: &[u8]) -> ApiResult<KeyInfo> {
        let run = || -> Result<KeyInfo> {
            let keys = ServerKeys::from_bytes(bundle)?;
            Ok(self.engine.fhe().upload_key(keys)?.into())
        };
        run().into()
    }

    pub fn encrypt_vector(&self, embedding: &[f32]) -> ApiResult<EncryptedVector> {
        self.engine
            .encrypt_vector(embedding)
            .map(|bytes| EncryptedVector {
                size_bytes: bytes.len(),
                ciphertext: hex::encode(bytes),
            })
            .into()
    }

    pub fn ingest_chunk(
        &self,
        doc: DocumentId,
        chunk: ChunkId,
        embedding: &[f32],
    ) -> ApiResult<IngestReceipt> {
        self.engine.ingest_chunk(doc, chunk, embedding).into()
    }

    pub fn similarity_search(
        &self,
        doc: DocumentId,
        query: &QueryInput,
        k: usize,
    ) -> ApiResult<SearchOutcome> {
        let run = || -> Result<SearchOutcome> {
            match query {
                QueryInput::Embedding(v) => self.engine.search(doc, Query::Raw(v), k),
                QueryInput::Ciphertext(h) => {
                    let bytes = hex::decode(h).map_err(|e| {
                        SearchError::Evaluation(format!("query ciphertext is not hex: {}", e))
                    })?;
                    self.engine.search(doc, Query::Encrypted(&bytes), k)
                }
            }
        };
        run().into()
    }

    pub fn delete_document(&self, doc: DocumentId) -> ApiResult<DeleteReceipt> {
        self.engine
            .delete_document(doc)
            .map(|chunks_removed| DeleteReceipt {
                document_id: doc,
                chunks_removed,
            })
            .into()
    }

    pub fn get_eval_stats(&self, doc: DocumentId) -> ApiResult<EvalSummary> {
        self.engine.eval_stats(doc).into()
    }

    pub fn get_audit_report(&self, doc: DocumentId) -> ApiResult<AuditReport> {
        self.engine.audit_report(doc).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_are_tagged_by_status() {
        let ok: ApiResult<u32> = Ok(7).into();
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"], 7);

        let err: ApiResult<u32> = Err(SearchError::KeyMissing("no keys".into())).into();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "err");
        assert_eq!(json["kind"], "KeyMissingError");
        assert!(json.get("data").is_none());
        assert_eq!(err.error_kind(), Some(ErrorKind::KeyMissingError));
    }

    #[test]
    fn query_input_is_externally_tagged() {
        let q: QueryInput = serde_json::from_str(r#"{"embedding":[0.5,1.0]}"#).unwrap();
        assert_eq!(q, QueryInput::Embedding(vec![0.5, 1.0]));
        let q: QueryInput = serde_json::from_str(r#"{"ciphertext":"00ff"}"#).unwrap();
        assert_eq!(q, QueryInput::Ciphertext("00ff".into()));
    }
}
