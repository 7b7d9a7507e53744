//! Persistence of per-chunk ciphertexts and the clear-text shadow vectors.
//!
//! Two separate stores on purpose:
//!
//! - [`CiphertextStore`] keeps encrypted blobs plus their quantization
//!   metadata. It is what the encrypted search path reads.
//! - [`ShadowStore`] keeps the reduced float vectors used only by the
//!   hybrid evaluator. Its value type, [`ShadowVector`], has no public
//!   accessor and no `Serialize` impl, so nothing outside this crate can
//!   read the floats back or put them in a response.
//!
//! Neither store transforms data; ordering is by first insertion.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use veil_fhe::KeyId;

use crate::error::{Result, SearchError};

pub type DocumentId = u64;
pub type ChunkId = u64;

/// Quantization and key context a ciphertext was produced under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantMeta {
    pub dim: usize,
    pub bits: u8,
    pub scale: f32,
    pub zero_point: i32,
    /// Fingerprint of the projection matrix (hex SHA-256).
    pub projection: String,
    pub key_id: KeyId,
}

impl QuantMeta {
    /// True when vectors under `self` and `other` may be dot-producted.
    /// The key epoch is checked separately.
    pub fn comparable(&self, other: &QuantMeta) -> bool {
        self.dim == other.dim
            && self.bits == other.bits
            && self.scale == other.scale
            && self.zero_point == other.zero_point
            && self.projection == other.projection
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk_id: ChunkId,
    pub ciphertext: Vec<u8>,
    pub meta: QuantMeta,
}

pub trait CiphertextStore: Send + Sync {
    /// Insert or replace. A replaced chunk keeps its original position.
    fn put(
        &self,
        doc: DocumentId,
        chunk: ChunkId,
        ciphertext: Vec<u8>,
        meta: QuantMeta,
    ) -> Result<()>;
    /// All chunks of `doc` in insertion order; empty if unknown.
    fn get_all(&self, doc: DocumentId) -> Result<Vec<StoredChunk>>;
    /// Remove every chunk of `doc`, returning how many were removed.
    fn delete(&self, doc: DocumentId) -> Result<usize>;
}

fn poisoned() -> SearchError {
    SearchError::Storage("store lock poisoned".into())
}

// ---------------------------------------------------------------------------
// In-memory ciphertext store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCiphertextStore {
    docs: RwLock<HashMap<DocumentId, Vec<StoredChunk>>>,
}

impl MemoryCiphertextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CiphertextStore for MemoryCiphertextStore {
    fn put(
        &self,
        doc: DocumentId,
        chunk: ChunkId,
        ciphertext: Vec<u8>,
        meta: QuantMeta,
    ) -> Result<()> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        let chunks = docs.entry(doc).or_default();
        let record = StoredChunk {
            chunk_id: chunk,
            ciphertext,
            meta,
        };
        match chunks.iter_mut().find(|c| c.chunk_id == chunk) {
            Some(existing) => *existing = record,
            None => chunks.push(record),
        }
        Ok(())
    }

    fn get_all(&self, doc: DocumentId) -> Result<Vec<StoredChunk>> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(&doc).cloned().unwrap_or_default())
    }

    fn delete(&self, doc: DocumentId) -> Result<usize> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        Ok(docs.remove(&doc).map(|c| c.len()).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Directory-backed ciphertext store
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    chunk_id: ChunkId,
    meta: QuantMeta,
}

/// Layout: `<root>/<doc>/index.json` (ordered chunk list + metadata) and
/// `<root>/<doc>/<chunk>.ct` (ciphertext blob).
pub struct FsCiphertextStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsCiphertextStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn doc_dir(&self, doc: DocumentId) -> PathBuf {
        self.root.join(doc.to_string())
    }

    fn read_index(dir: &Path) -> Result<Vec<IndexEntry>> {
        let path = dir.join("index.json");
        if !path.is_file() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl CiphertextStore for FsCiphertextStore {
    fn put(
        &self,
        doc: DocumentId,
        chunk: ChunkId,
        ciphertext: Vec<u8>,
        meta: QuantMeta,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        let dir = self.doc_dir(doc);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(format!("{}.ct", chunk)), &ciphertext)?;

        let mut index = Self::read_index(&dir)?;
        match index.iter_mut().find(|e| e.chunk_id == chunk) {
            Some(existing) => existing.meta = meta,
            None => index.push(IndexEntry {
                chunk_id: chunk,
                meta,
            }),
        }
        write_atomic(&dir.join("index.json"), &serde_json::to_vec(&index)?)
    }

    fn get_all(&self, doc: DocumentId) -> Result<Vec<StoredChunk>> {
        let dir = self.doc_dir(doc);
        Self::read_index(&dir)?
            .into_iter()
            .map(|entry| {
                let path = dir.join(format!("{}.ct", entry.chunk_id));
                let ciphertext = fs::read(&path).map_err(|e| {
                    SearchError::Storage(format!("reading {}: {}", path.display(), e))
                })?;
                Ok(StoredChunk {
                    chunk_id: entry.chunk_id,
                    ciphertext,
                    meta: entry.meta,
                })
            })
            .collect()
    }

    fn delete(&self, doc: DocumentId) -> Result<usize> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        let dir = self.doc_dir(doc);
        let removed = Self::read_index(&dir)?.len();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Shadow store (evaluation-only clear text)
// ---------------------------------------------------------------------------

/// A reduced vector kept in the clear for the hybrid evaluator.
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowVector {
    pub(crate) values: Vec<f32>,
}

impl ShadowVector {
    pub(crate) fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

pub trait ShadowStore: Send + Sync {
    fn put(&self, doc: DocumentId, chunk: ChunkId, vector: ShadowVector) -> Result<()>;
    fn get_all(&self, doc: DocumentId) -> Result<Vec<(ChunkId, ShadowVector)>>;
    fn delete(&self, doc: DocumentId) -> Result<usize>;
}

fn upsert(rows: &mut Vec<(ChunkId, ShadowVector)>, chunk: ChunkId, vector: ShadowVector) {
    match rows.iter_mut().find(|(id, _)| *id == chunk) {
        Some(existing) => existing.1 = vector,
        None => rows.push((chunk, vector)),
    }
}

#[derive(Default)]
pub struct MemoryShadowStore {
    docs: RwLock<HashMap<DocumentId, Vec<(ChunkId, ShadowVector)>>>,
}

impl MemoryShadowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShadowStore for MemoryShadowStore {
    fn put(&self, doc: DocumentId, chunk: ChunkId, vector: ShadowVector) -> Result<()> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        upsert(docs.entry(doc).or_default(), chunk, vector);
        Ok(())
    }

    fn get_all(&self, doc: DocumentId) -> Result<Vec<(ChunkId, ShadowVector)>> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(&doc).cloned().unwrap_or_default())
    }

    fn delete(&self, doc: DocumentId) -> Result<usize> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        Ok(docs.remove(&doc).map(|rows| rows.len()).unwrap_or(0))
    }
}

/// On-disk row; private so the floats never leave through a public type.
#[derive(Serialize, Deserialize)]
struct ShadowRow {
    chunk_id: ChunkId,
    values: Vec<f32>,
}

/// One JSON file per document: `<root>/<doc>.shadow.json`.
pub struct FsShadowStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsShadowStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, doc: DocumentId) -> PathBuf {
        self.root.join(format!("{}.shadow.json", doc))
    }

    fn read(&self, doc: DocumentId) -> Result<Vec<(ChunkId, ShadowVector)>> {
        let path = self.path(doc);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let rows: Vec<ShadowRow> = serde_json::from_slice(&fs::read(path)?)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.chunk_id, ShadowVector::new(r.values)))
            .collect())
    }
}

impl ShadowStore for FsShadowStore {
    fn put(&self, doc: DocumentId, chunk: ChunkId, vector: ShadowVector) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        let mut rows = self.read(doc)?;
        upsert(&mut rows, chunk, vector);
        let rows: Vec<ShadowRow> = rows
            .into_iter()
            .map(|(chunk_id, v)| ShadowRow {
                chunk_id,
                values: v.values,
            })
            .collect();
        write_atomic(&self.path(doc), &serde_json::to_vec(&rows)?)
    }

    fn get_all(&self, doc: DocumentId) -> Result<Vec<(ChunkId, ShadowVector)>> {
        self.read(doc)
    }

    fn delete(&self, doc: DocumentId) -> Result<usize> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        let removed = self.read(doc)?.len();
        let path = self.path(doc);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(removed)
    }
}
