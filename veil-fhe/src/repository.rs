//! Persistence boundary for key material and compiled circuits.
//!
//! The context never touches a path: it asks a [`Repository`] whether an
//! artifact exists, loads it, or saves it. Artifacts are opaque bytes.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::circuit::CircuitShape;
use crate::error::{FheError, Result};

/// Everything the context persists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// Public + evaluation key bundle.
    ServerKeys,
    /// Decryption key, stored apart from the server bundle.
    SecretKey,
    /// Compiled circuit for one shape.
    Circuit(CircuitShape),
}

pub trait Repository: Send + Sync {
    fn exists(&self, artifact: &Artifact) -> bool;
    fn load(&self, artifact: &Artifact) -> Result<Vec<u8>>;
    fn save(&self, artifact: &Artifact, bytes: &[u8]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File system
// ---------------------------------------------------------------------------

/// One file per artifact under a root directory:
///
/// ```text
/// <root>/keys/server.bin
/// <root>/keys/secret.bin
/// <root>/circuits/d32b4.bin
/// ```
pub struct FsRepository {
    root: PathBuf,
}

impl FsRepository {
    /// Open (and create if needed) a repository rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("keys"))?;
        fs::create_dir_all(root.join("circuits"))?;
        Ok(Self { root })
    }

    fn path_of(&self, artifact: &Artifact) -> PathBuf {
        match artifact {
            Artifact::ServerKeys => self.root.join("keys").join("server.bin"),
            Artifact::SecretKey => self.root.join("keys").join("secret.bin"),
            Artifact::Circuit(shape) => self.root.join("circuits").join(format!("{}.bin", shape)),
        }
    }
}

impl Repository for FsRepository {
    fn exists(&self, artifact: &Artifact) -> bool {
        self.path_of(artifact).is_file()
    }

    fn load(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        let path = self.path_of(artifact);
        fs::read(&path)
            .map_err(|e| FheError::Storage(format!("reading {}: {}", path.display(), e)))
    }

    /// Write to a sibling temp file, then rename over the target.
    fn save(&self, artifact: &Artifact, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(artifact);
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, bytes)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| FheError::Storage(format!("writing {}: {}", path.display(), e)))
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

/// Process-local repository, for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryRepository {
    blobs: RwLock<HashMap<Artifact, Vec<u8>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn exists(&self, artifact: &Artifact) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(artifact))
            .unwrap_or(false)
    }

    fn load(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| FheError::Storage("repository lock poisoned".into()))?;
        blobs
            .get(artifact)
            .cloned()
            .ok_or_else(|| FheError::Storage(format!("{:?} not found", artifact)))
    }

    fn save(&self, artifact: &Artifact, bytes: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| FheError::Storage("repository lock poisoned".into()))?;
        blobs.insert(*artifact, bytes.to_vec());
        Ok(())
    }
}
