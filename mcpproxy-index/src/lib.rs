//! Tool index, router and response cache
//!
//! The registry aggregates every upstream's tool catalog into one flat
//! namespace (`"<server>.<tool>"`), keeps a BM25 index over it for ranked
//! discovery and routes qualified names back to their upstream. Rebuilds
//! are copy-on-write: searches always read a complete snapshot and never
//! block on a rebuild in progress.

pub mod bm25;
pub mod cache;
pub mod error;
pub mod registry;

pub use bm25::{Bm25Index, ScoredTool, BM25_B, BM25_K1};
pub use cache::{canonical_json, fingerprint, ResponseCache};
pub use error::{IndexError, IndexResult};
pub use registry::{IndexedTool, ToolRegistry};
