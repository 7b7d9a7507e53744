//! # veil-node — encrypted similarity search node
//!
//! Process owner for the search core: builds the FHE context and the
//! on-disk stores, admits searches through a bounded semaphore, and serves
//! the tagged operation API as JSON over HTTP.
//!
//! ## Architecture
//!
//! - **`config`** — `NodeConfig` (clap flags with environment fallbacks)
//! - **`node`** — `SearchNode`: lifecycle, admission, blocking-pool dispatch
//! - **`http`** — routes and the `tiny_http` accept loop

pub mod config;
pub mod http;
pub mod node;
