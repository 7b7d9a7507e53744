//! The FHE context: key lifecycle, circuit cache, encrypt/evaluate/decrypt.
//!
//! One context is constructed by the process owner and shared (`Arc`)
//! with everything that needs homomorphic operations. It moves through
//!
//! ```text
//! Uninitialized ──generate_keys──▶ KeysReady ──compile_circuit──▶ Ready
//!       └────compile_circuit──▶ CircuitCompiled ──generate_keys──┘
//! ```
//!
//! Key generation is serialized behind a mutex. Compilation is
//! single-flight per shape: concurrent callers for one shape share the
//! in-flight build instead of starting their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Instant;

use bincode::Options;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::ckks::ciphertext::{self, Ciphertext, ScoreCiphertext};
use crate::ckks::keys::{keygen, KeyId, SecretKey, ServerKeys};
use crate::circuit::{CircuitShape, CompiledCircuit};
use crate::error::{FheError, Result};
use crate::repository::{Artifact, Repository};

/// Upper bound on a stored key file.
const MAX_KEY_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextState {
    /// No keys, no circuits.
    Uninitialized,
    /// Keys present, no circuit compiled yet.
    KeysReady,
    /// A circuit is compiled but there are no keys to run it with.
    CircuitCompiled,
    /// Keys and at least one circuit.
    Ready,
}

/// What `generate_keys` / `upload_key` hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub key_id: KeyId,
    /// False when existing keys were kept.
    pub created: bool,
    /// Whether this context can decrypt under the epoch.
    pub can_decrypt: bool,
}

/// Where a `compile_circuit` result came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitSource {
    /// Built by this call.
    Compiled,
    /// Loaded from the repository by this call.
    DiskCache,
    /// Already in memory, or built by a concurrent caller.
    Memory,
}

#[derive(Clone, Debug)]
pub struct CircuitHandle {
    pub circuit: Arc<CompiledCircuit>,
    pub source: CircuitSource,
}

#[derive(Default)]
struct KeyStore {
    server: Option<Arc<ServerKeys>>,
    secret: Option<Arc<SecretKey>>,
}

type CircuitSlot = Arc<OnceLock<Result<Arc<CompiledCircuit>>>>;

pub struct FheContext {
    repo: Arc<dyn Repository>,
    keys: RwLock<KeyStore>,
    keygen_lock: Mutex<()>,
    circuits: Mutex<HashMap<CircuitShape, CircuitSlot>>,
}

fn decode_key<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::DefaultOptions::new()
        .with_limit(MAX_KEY_BYTES)
        .with_fixint_encoding()
        .deserialize(bytes)
        .map_err(|e| FheError::Storage(format!("corrupt key file: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| FheError::Storage(e.to_string()))
}

fn poisoned() -> FheError {
    FheError::Storage("context lock poisoned".into())
}

impl FheContext {
    /// Build a context over `repo`, picking up keys persisted by an earlier run.
    ///
    /// Never generates keys. A stored secret that does not belong to the
    /// stored server keys is ignored (the context then cannot decrypt).
    pub fn init(repo: Arc<dyn Repository>) -> Result<Self> {
        let mut store = KeyStore::default();
        if repo.exists(&Artifact::ServerKeys) {
            let server: ServerKeys = decode_key(&repo.load(&Artifact::ServerKeys)?)?;
            server.validate()?;
            info!("loaded cached server keys, epoch {}", server.key_id.short());
            if repo.exists(&Artifact::SecretKey) {
                let secret: SecretKey = decode_key(&repo.load(&Artifact::SecretKey)?)?;
                if secret.matches(&server) {
                    store.secret = Some(Arc::new(secret));
                } else {
                    warn!(
                        "stored secret key does not belong to epoch {}; decryption disabled",
                        server.key_id.short()
                    );
                }
            }
            store.server = Some(Arc::new(server));
        } else {
            debug!("no cached keys in repository");
        }

        Ok(Self {
            repo,
            keys: RwLock::new(store),
            keygen_lock: Mutex::new(()),
            circuits: Mutex::new(HashMap::new()),
        })
    }

    pub fn state(&self) -> ContextState {
        let has_keys = self
            .keys
            .read()
            .map(|k| k.server.is_some())
            .unwrap_or(false);
        let has_circuit = self
            .circuits
            .lock()
            .map(|c| c.values().any(|slot| matches!(slot.get(), Some(Ok(_)))))
            .unwrap_or(false);
        match (has_keys, has_circuit) {
            (false, false) => ContextState::Uninitialized,
            (true, false) => ContextState::KeysReady,
            (false, true) => ContextState::CircuitCompiled,
            (true, true) => ContextState::Ready,
        }
    }

    /// Current key epoch, if any.
    pub fn key_id(&self) -> Option<KeyId> {
        self.keys
            .read()
            .ok()
            .and_then(|k| k.server.as_ref().map(|s| s.key_id))
    }

    /// Server-side key bundle, for handing to another evaluator.
    pub fn server_keys(&self) -> Option<Arc<ServerKeys>> {
        self.keys.read().ok().and_then(|k| k.server.clone())
    }

    pub fn can_decrypt(&self) -> bool {
        self.keys
            .read()
            .map(|k| k.secret.is_some())
            .unwrap_or(false)
    }

    fn server(&self) -> Result<Arc<ServerKeys>> {
        self.keys
            .read()
            .map_err(|_| poisoned())?
            .server
            .clone()
            .ok_or_else(|| {
                FheError::KeyMissing("no key material; call generate_keys or upload_key".into())
            })
    }

    // -----------------------------------------------------------------------
    // Key lifecycle
    // -----------------------------------------------------------------------

    /// Create and persist a key epoch.
    ///
    /// With keys already present this is a no-op unless `force` is set;
    /// forcing starts a new epoch and every existing ciphertext becomes
    /// unusable.
    pub fn generate_keys(&self, force: bool) -> Result<KeyHandle> {
        let _guard = self.keygen_lock.lock().map_err(|_| poisoned())?;
        {
            let keys = self.keys.read().map_err(|_| poisoned())?;
            if let (Some(server), false) = (&keys.server, force) {
                debug!("keys already present, epoch {}", server.key_id.short());
                return Ok(KeyHandle {
                    key_id: server.key_id,
                    created: false,
                    can_decrypt: keys.secret.is_some(),
                });
            }
            if let Some(server) = &keys.server {
                warn!(
                    "forced key regeneration: epoch {} retired, its ciphertexts are now undecryptable",
                    server.key_id.short()
                );
            }
        }

        let start = Instant::now();
        let (server, secret) = keygen(&mut rand::thread_rng())?;
        self.repo.save(&Artifact::ServerKeys, &encode(&server)?)?;
        self.repo.save(&Artifact::SecretKey, &encode(&secret)?)?;
        let key_id = server.key_id;

        let mut keys = self.keys.write().map_err(|_| poisoned())?;
        keys.server = Some(Arc::new(server));
        keys.secret = Some(Arc::new(secret));
        info!(
            "generated key epoch {} in {:?}",
            key_id.short(),
            start.elapsed()
        );
        Ok(KeyHandle {
            key_id,
            created: true,
            can_decrypt: true,
        })
    }

    /// Register server keys generated elsewhere.
    ///
    /// The current secret is kept only if it belongs to the uploaded keys.
    pub fn upload_key(&self, server: ServerKeys) -> Result<KeyHandle> {
        server.validate()?;
        let _guard = self.keygen_lock.lock().map_err(|_| poisoned())?;
        self.repo.save(&Artifact::ServerKeys, &encode(&server)?)?;

        let mut keys = self.keys.write().map_err(|_| poisoned())?;
        let keep_secret = keys
            .secret
            .as_ref()
            .map(|s| s.matches(&server))
            .unwrap_or(false);
        if !keep_secret && keys.secret.take().is_some() {
            warn!(
                "uploaded epoch {} does not match the held secret key; decryption disabled",
                server.key_id.short()
            );
        }
        let key_id = server.key_id;
        let created = keys.server.as_ref().map(|s| s.key_id) != Some(key_id);
        keys.server = Some(Arc::new(server));
        info!("registered uploaded key epoch {}", key_id.short());
        Ok(KeyHandle {
            key_id,
            created,
            can_decrypt: keep_secret,
        })
    }

    /// Install the decryption key for the current epoch.
    pub fn install_secret_key(&self, secret: SecretKey) -> Result<()> {
        let _guard = self.keygen_lock.lock().map_err(|_| poisoned())?;
        let server = self.server()?;
        if !secret.matches(&server) {
            return Err(FheError::InvalidKeyMaterial(format!(
                "secret key does not belong to epoch {}",
                server.key_id.short()
            )));
        }
        self.repo.save(&Artifact::SecretKey, &encode(&secret)?)?;
        self.keys.write().map_err(|_| poisoned())?.secret = Some(Arc::new(secret));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Circuits
    // -----------------------------------------------------------------------

    /// Load or build the circuit for `shape`.
    ///
    /// Order: memory, then repository, then a fresh build. A fresh build
    /// under a full key pair is probed with worst-case operands before it
    /// is cached and persisted. Failures are not cached.
    pub fn compile_circuit(&self, shape: CircuitShape) -> Result<CircuitHandle> {
        let slot = {
            let mut circuits = self.circuits.lock().map_err(|_| poisoned())?;
            circuits.entry(shape).or_default().clone()
        };

        let mut source = CircuitSource::Memory;
        let result = slot
            .get_or_init(|| {
                let (circuit, from) = self.load_or_build(shape)?;
                source = from;
                Ok(Arc::new(circuit))
            })
            .clone();

        match result {
            Ok(circuit) => Ok(CircuitHandle { circuit, source }),
            Err(e) => {
                if let Ok(mut circuits) = self.circuits.lock() {
                    if circuits.get(&shape).map(|s| Arc::ptr_eq(s, &slot)) == Some(true) {
                        circuits.remove(&shape);
                    }
                }
                Err(e)
            }
        }
    }

    fn load_or_build(&self, shape: CircuitShape) -> Result<(CompiledCircuit, CircuitSource)> {
        let artifact = Artifact::Circuit(shape);
        if self.repo.exists(&artifact) {
            match self
                .repo
                .load(&artifact)
                .and_then(|b| CompiledCircuit::from_bytes(&b))
            {
                Ok(circuit) if circuit.shape == shape => {
                    info!("circuit {} loaded from cache", shape);
                    return Ok((circuit, CircuitSource::DiskCache));
                }
                Ok(_) => warn!("cached circuit for {} has a different shape; rebuilding", shape),
                Err(e) => warn!("discarding cached circuit {}: {}", shape, e),
            }
        }

        let start = Instant::now();
        let circuit = CompiledCircuit::compile(shape)?;
        self.probe(&circuit)?;
        self.repo.save(&artifact, &circuit.to_bytes()?)?;
        info!("compiled circuit {} in {:?}", shape, start.elapsed());
        Ok((circuit, CircuitSource::Compiled))
    }

    /// Run worst-case operands through a fresh circuit when a full key pair
    /// is present: all-minimum against itself, and minimum against maximum.
    fn probe(&self, circuit: &CompiledCircuit) -> Result<()> {
        let (server, secret) = {
            let keys = self.keys.read().map_err(|_| poisoned())?;
            match (&keys.server, &keys.secret) {
                (Some(p), Some(s)) => (p.clone(), s.clone()),
                _ => {
                    debug!("skipping probe for {}: no key pair", circuit.shape);
                    return Ok(());
                }
            }
        };
        let shape = circuit.shape;
        let lo = vec![shape.min_value(); shape.dim];
        let hi = vec![shape.max_value(); shape.dim];
        let mut rng = rand::thread_rng();
        let ct_lo = ciphertext::encrypt(&lo, shape, &server, &mut rng);
        let ct_hi = ciphertext::encrypt(&hi, shape, &server, &mut rng);

        let d = shape.dim as i64;
        let cases = [
            (&ct_lo, &ct_lo, d * shape.min_value() * shape.min_value()),
            (&ct_lo, &ct_hi, d * shape.min_value() * shape.max_value()),
        ];
        for (a, b, expected) in cases {
            let got = circuit
                .evaluate(&server, a, b)
                .and_then(|s| ciphertext::decrypt_score(&s, &secret, circuit.max_abs_score))
                .map_err(|e| FheError::Compilation(format!("probe for {} failed: {}", shape, e)))?;
            if got != expected {
                return Err(FheError::Compilation(format!(
                    "probe for {} decrypted {} instead of {}",
                    shape, got, expected
                )));
            }
        }
        Ok(())
    }

    fn circuit(&self, shape: CircuitShape) -> Result<Arc<CompiledCircuit>> {
        self.compile_circuit(shape).map(|h| h.circuit)
    }

    // -----------------------------------------------------------------------
    // Encrypt / evaluate / decrypt
    // -----------------------------------------------------------------------

    /// Encrypt a quantized vector of shape `shape`.
    ///
    /// Requires keys and a compiled circuit for the shape.
    pub fn encrypt(&self, shape: CircuitShape, values: &[i64]) -> Result<Ciphertext> {
        let server = self.server()?;
        let compiled = self
            .circuits
            .lock()
            .map_err(|_| poisoned())?
            .get(&shape)
            .map(|slot| matches!(slot.get(), Some(Ok(_))))
            .unwrap_or(false);
        if !compiled {
            return Err(FheError::KeyMissing(format!(
                "no compiled circuit for {}; call compile_circuit first",
                shape
            )));
        }
        if values.len() != shape.dim {
            return Err(FheError::DimensionMismatch {
                expected: shape.dim,
                actual: values.len(),
            });
        }
        let (lo, hi) = (shape.min_value(), shape.max_value());
        if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !(lo..=hi).contains(*v)) {
            return Err(FheError::ValueOutOfRange {
                index,
                value,
                bits: shape.bits,
            });
        }
        Ok(ciphertext::encrypt(values, shape, &server, &mut rand::thread_rng()))
    }

    /// Homomorphic dot product. Uses server key material only.
    pub fn evaluate(&self, query: &Ciphertext, chunk: &Ciphertext) -> Result<ScoreCiphertext> {
        let server = self.server()?;
        let circuit = self.circuit(query.shape)?;
        circuit.evaluate(&server, query, chunk)
    }

    /// Decrypt a score. Requires the secret key of the score's epoch.
    pub fn decrypt(&self, score: &ScoreCiphertext) -> Result<i64> {
        let (server, secret) = {
            let keys = self.keys.read().map_err(|_| poisoned())?;
            let server = keys.server.clone().ok_or_else(|| {
                FheError::KeyMissing("no key material; call generate_keys".into())
            })?;
            let secret = keys.secret.clone().ok_or_else(|| {
                FheError::KeyMissing(format!(
                    "this context holds no secret key for epoch {}",
                    server.key_id.short()
                ))
            })?;
            (server, secret)
        };
        if score.key_id != server.key_id {
            return Err(FheError::Decryption(format!(
                "score produced under epoch {}, secret belongs to {}",
                score.key_id.short(),
                server.key_id.short()
            )));
        }
        if !score.verify_integrity() {
            return Err(FheError::Decryption(
                "score ciphertext failed integrity check".into(),
            ));
        }
        score.shape.validate().map_err(|e| FheError::Decryption(e.to_string()))?;
        ciphertext::decrypt_score(score, &secret, score.shape.max_abs_score())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Flush keys and every compiled circuit to the repository.
    pub fn shutdown(&self) -> Result<()> {
        {
            let keys = self.keys.read().map_err(|_| poisoned())?;
            if let Some(server) = &keys.server {
                self.repo.save(&Artifact::ServerKeys, &encode(server.as_ref())?)?;
            }
            if let Some(secret) = &keys.secret {
                self.repo.save(&Artifact::SecretKey, &encode(secret.as_ref())?)?;
            }
        }
        let circuits: Vec<Arc<CompiledCircuit>> = self
            .circuits
            .lock()
            .map_err(|_| poisoned())?
            .values()
            .filter_map(|slot| slot.get().and_then(|r| r.as_ref().ok()).cloned())
            .collect();
        for circuit in &circuits {
            self.repo
                .save(&Artifact::Circuit(circuit.shape), &circuit.to_bytes()?)?;
        }
        info!("context flushed: {} circuit(s)", circuits.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn ctx() -> FheContext {
        FheContext::init(Arc::new(MemoryRepository::new())).unwrap()
    }

    #[test]
    fn state_machine_keys_first() {
        let c = ctx();
        assert_eq!(c.state(), ContextState::Uninitialized);
        c.generate_keys(false).unwrap();
        assert_eq!(c.state(), ContextState::KeysReady);
        c.compile_circuit(CircuitShape::new(4, 4)).unwrap();
        assert_eq!(c.state(), ContextState::Ready);
    }

    #[test]
    fn state_machine_circuit_first() {
        let c = ctx();
        c.compile_circuit(CircuitShape::new(4, 4)).unwrap();
        assert_eq!(c.state(), ContextState::CircuitCompiled);
        c.generate_keys(false).unwrap();
        assert_eq!(c.state(), ContextState::Ready);
    }

    #[test]
    fn generate_keys_is_idempotent_unless_forced() {
        let c = ctx();
        let first = c.generate_keys(false).unwrap();
        assert!(first.created);
        let again = c.generate_keys(false).unwrap();
        assert!(!again.created);
        assert_eq!(again.key_id, first.key_id);
        let forced = c.generate_keys(true).unwrap();
        assert!(forced.created);
        assert_ne!(forced.key_id, first.key_id);
    }

    #[test]
    fn encrypt_before_ready_is_key_missing() {
        let c = ctx();
        let shape = CircuitShape::new(2, 4);
        assert!(matches!(c.encrypt(shape, &[1, 2]), Err(FheError::KeyMissing(_))));
        c.generate_keys(false).unwrap();
        assert!(matches!(c.encrypt(shape, &[1, 2]), Err(FheError::KeyMissing(_))));
        c.compile_circuit(shape).unwrap();
        assert!(c.encrypt(shape, &[1, 2]).is_ok());
    }

    #[test]
    fn encrypt_checks_length_and_range() {
        let c = ctx();
        let shape = CircuitShape::new(3, 4);
        c.generate_keys(false).unwrap();
        c.compile_circuit(shape).unwrap();
        assert_eq!(
            c.encrypt(shape, &[1, 2]).unwrap_err(),
            FheError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
        assert!(matches!(
            c.encrypt(shape, &[1, 8, 0]),
            Err(FheError::ValueOutOfRange { index: 1, value: 8, bits: 4 })
        ));
    }

    #[test]
    fn failed_compilation_is_not_cached() {
        let c = ctx();
        let bad = CircuitShape::new(0, 4);
        assert!(matches!(c.compile_circuit(bad), Err(FheError::Compilation(_))));
        assert!(matches!(c.compile_circuit(bad), Err(FheError::Compilation(_))));
        assert_eq!(c.state(), ContextState::Uninitialized);
    }

    #[test]
    fn second_compile_hits_memory() {
        let c = ctx();
        c.generate_keys(false).unwrap();
        let shape = CircuitShape::new(4, 4);
        assert_eq!(c.compile_circuit(shape).unwrap().source, CircuitSource::Compiled);
        assert_eq!(c.compile_circuit(shape).unwrap().source, CircuitSource::Memory);
    }

    #[test]
    fn decrypt_without_keys_is_key_missing() {
        let c = ctx();
        let other = ctx();
        other.generate_keys(false).unwrap();
        let shape = CircuitShape::new(2, 4);
        other.compile_circuit(shape).unwrap();
        let ct = other.encrypt(shape, &[1, 1]).unwrap();
        let score = other.evaluate(&ct, &ct).unwrap();
        assert!(matches!(c.decrypt(&score), Err(FheError::KeyMissing(_))));
    }
}
