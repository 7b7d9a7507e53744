use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;
use veil_search::quantizer::{QuantConfig, DEFAULT_VALUE_RANGE};
use veil_search::{EngineConfig, ReducerConfig, SearchError};

/// Configuration for a search node.
///
/// Every field is a long flag with an environment fallback, so the same
/// binary runs from a shell or a container manifest.
#[derive(Args, Clone, Debug, PartialEq)]
pub struct NodeConfig {
    /// Directory for keys, circuits, ciphertexts and telemetry logs.
    #[arg(long, env = "VEIL_DATA_DIR", default_value = "veil-data")]
    pub data_dir: PathBuf,

    /// Address of the HTTP JSON surface.
    #[arg(long, env = "VEIL_LISTEN", default_value = "127.0.0.1:8400")]
    pub listen_addr: SocketAddr,

    /// Width D of incoming raw embeddings.
    #[arg(long, env = "VEIL_INPUT_DIM", default_value_t = 768)]
    pub input_dim: usize,

    /// Reduced width d that gets encrypted.
    #[arg(long, env = "VEIL_REDUCED_DIM", default_value_t = 32)]
    pub reduced_dim: usize,

    /// Quantization width in bits.
    #[arg(long, env = "VEIL_BITS", default_value_t = 4)]
    pub bits: u8,

    /// Expected magnitude of reduced components; fixes the quantization scale.
    #[arg(long, env = "VEIL_VALUE_RANGE", default_value_t = DEFAULT_VALUE_RANGE)]
    pub value_range: f32,

    /// Seed of the projection matrix.
    #[arg(long, env = "VEIL_PROJECTION_SEED", default_value_t = ReducerConfig::default().seed)]
    pub projection_seed: u64,

    /// k used when a search request names none.
    #[arg(long, env = "VEIL_TOP_K", default_value_t = 4)]
    pub default_top_k: usize,

    /// Searches allowed in flight at once.
    #[arg(long, env = "VEIL_MAX_QUERIES", default_value_t = 4)]
    pub max_concurrent_queries: usize,

    /// Threads scoring chunks within one search (0: one per core).
    #[arg(long, env = "VEIL_SCORING_THREADS", default_value_t = 0)]
    pub scoring_threads: usize,
}

impl NodeConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8400)),
            input_dim: 768,
            reduced_dim: 32,
            bits: 4,
            value_range: DEFAULT_VALUE_RANGE,
            projection_seed: ReducerConfig::default().seed,
            default_top_k: 4,
            max_concurrent_queries: 4,
            scoring_threads: 0,
        }
    }

    pub fn reducer(&self) -> ReducerConfig {
        ReducerConfig {
            input_dim: self.input_dim,
            output_dim: self.reduced_dim,
            seed: self.projection_seed,
        }
    }

    pub fn quant(&self) -> Result<QuantConfig, SearchError> {
        QuantConfig::for_range(self.reduced_dim, self.bits, self.value_range)
    }

    pub fn engine(&self) -> EngineConfig {
        match self.scoring_threads {
            0 => EngineConfig::default(),
            workers => EngineConfig { workers },
        }
    }
}
