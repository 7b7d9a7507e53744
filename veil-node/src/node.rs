//! SearchNode: owns the FHE context, the stores and the search service.
//!
//! Startup loads cached keys and circuits, generates keys only on a first
//! start and compiles the active shape before serving. Searches are
//! admitted through a semaphore and run on the blocking pool; a caller
//! that goes away never cancels the blocking work, so a compilation in
//! progress always finishes and lands in the cache.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use veil_fhe::{CircuitSource, ContextState, FheContext, FsRepository};
use veil_search::audit::AuditRecord;
use veil_search::engine::SearchOutcome;
use veil_search::hybrid::EvalRecord;
use veil_search::store::{DocumentId, FsCiphertextStore, FsShadowStore};
use veil_search::telemetry::JsonlLog;
use veil_search::{
    ApiResult, ErrorKind, QueryInput, Reducer, SearchService, SimilarityEngine, Stores,
};

use crate::config::NodeConfig;

/// What happened while the node came up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartupReport {
    pub key_id: String,
    /// True when this start generated the key epoch.
    pub keys_created: bool,
    pub circuit_source: CircuitSource,
    pub circuit_ms: f64,
}

impl fmt::Display for StartupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {}{}, circuit from {:?} in {:.0} ms",
            self.key_id,
            if self.keys_created { " (new)" } else { "" },
            self.circuit_source,
            self.circuit_ms
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub state: ContextState,
    pub key_id: Option<String>,
    pub can_decrypt: bool,
    pub shape: String,
    pub available_query_slots: usize,
    pub queries: QueryStats,
}

/// Admitted searches as seen by the blocking pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStats {
    pub running: usize,
    /// Most searches ever running at once since the node opened.
    pub peak: usize,
    pub completed: u64,
}

#[derive(Default)]
struct QueryGauge {
    running: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
}

impl QueryGauge {
    fn admit(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Admission {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Admission {
            permit: Some(permit),
            gauge: self.clone(),
        }
    }

    fn snapshot(&self) -> QueryStats {
        QueryStats {
            running: self.running.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }
}

/// A search holding its slot. Dropping it leaves the running count, then
/// frees the slot, then counts the search as completed.
struct Admission {
    permit: Option<OwnedSemaphorePermit>,
    gauge: Arc<QueryGauge>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.gauge.running.fetch_sub(1, Ordering::SeqCst);
        self.permit.take();
        self.gauge.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A running search node.
pub struct SearchNode {
    config: NodeConfig,
    fhe: Arc<FheContext>,
    service: Arc<SearchService>,
    queries: Arc<Semaphore>,
    gauge: Arc<QueryGauge>,
    startup: StartupReport,
}

impl SearchNode {
    /// Open (or create) the node's state under `config.data_dir`.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let root = &config.data_dir;
        let repo = FsRepository::open(root.join("fhe"))
            .with_context(|| format!("opening key repository under {}", root.display()))?;
        let fhe = Arc::new(FheContext::init(Arc::new(repo))?);

        let stores = Stores {
            ciphertexts: Arc::new(FsCiphertextStore::open(root.join("chunks"))?),
            shadow: Arc::new(FsShadowStore::open(root.join("shadow"))?),
            evals: Arc::new(JsonlLog::<EvalRecord>::open(root.join("logs").join("eval.jsonl"))?),
            audits: Arc::new(JsonlLog::<AuditRecord>::open(
                root.join("logs").join("audit.jsonl"),
            )?),
        };
        let reducer = Arc::new(Reducer::new(config.reducer())?);
        let engine = SimilarityEngine::new(
            fhe.clone(),
            reducer,
            config.quant()?,
            stores,
            config.engine(),
        )?;

        let keys = fhe.generate_keys(false)?;
        if keys.created {
            info!("first start: generated key epoch {}", keys.key_id.short());
        }
        let start = Instant::now();
        let circuit = engine.prepare()?;
        let circuit_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            "circuit {} ready ({:?}, {:.0} ms)",
            engine.shape(),
            circuit.source,
            circuit_ms
        );

        Ok(Self {
            queries: Arc::new(Semaphore::new(config.max_concurrent_queries.max(1))),
            gauge: Arc::new(QueryGauge::default()),
            startup: StartupReport {
                key_id: keys.key_id.to_string(),
                keys_created: keys.created,
                circuit_source: circuit.source,
                circuit_ms,
            },
            service: Arc::new(SearchService::new(Arc::new(engine))),
            fhe,
            config,
        })
    }

    /// [`SearchNode::open`] on the blocking pool, for callers inside the runtime.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::open(config))
            .await
            .context("node startup task failed")?
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<SearchService> {
        &self.service
    }

    pub fn startup(&self) -> &StartupReport {
        &self.startup
    }

    pub fn health(&self) -> Health {
        Health {
            state: self.fhe.state(),
            key_id: self.fhe.key_id().map(|k| k.to_string()),
            can_decrypt: self.fhe.can_decrypt(),
            shape: self.service.engine().shape().to_string(),
            available_query_slots: self.queries.available_permits(),
            queries: self.gauge.snapshot(),
        }
    }

    /// Run a CPU-bound service call on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SearchService) -> ApiResult<T> + Send + 'static,
    {
        let service = self.service.clone();
        match tokio::task::spawn_blocking(move || f(&service)).await {
            Ok(result) => result,
            Err(e) => internal(format!("worker task failed: {}", e)),
        }
    }

    /// Admit a search (waiting for a slot) and run it.
    ///
    /// The permit travels into the blocking task, so the slot stays taken
    /// until the work itself ends, even if this future is dropped.
    pub async fn search(
        &self,
        doc: DocumentId,
        query: QueryInput,
        k: Option<usize>,
    ) -> ApiResult<SearchOutcome> {
        let permit = match self.queries.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return internal("query admission closed".into()),
        };
        let k = k.unwrap_or(self.config.default_top_k);
        let gauge = self.gauge.clone();
        self.call(move |service| {
            let _admitted = gauge.admit(permit);
            service.similarity_search(doc, &query, k)
        })
        .await
    }

    /// Stop admitting searches, let running ones finish, flush the context.
    pub async fn shutdown(&self) -> Result<()> {
        let permits = self.config.max_concurrent_queries.max(1) as u32;
        match tokio::time::timeout(Duration::from_secs(30), self.queries.acquire_many(permits)).await
        {
            Ok(Ok(held)) => held.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!("shutdown: searches still running after 30s; flushing anyway"),
        }
        self.queries.close();
        self.fhe.shutdown()?;
        info!("node state flushed to {}", self.config.data_dir.display());
        Ok(())
    }
}

fn internal<T>(message: String) -> ApiResult<T> {
    ApiResult::Err {
        kind: ErrorKind::InternalError,
        message,
    }
}
