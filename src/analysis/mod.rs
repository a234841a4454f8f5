//! The xref scanning engine.
//!
//! Leaves first: `image`, `translate` and `memory` give bounded access to the
//! native image in its three address spaces; `cursor` and `xrefs` decode one
//! method window; `graph` fans that out over all methods; `reachability`
//! classifies the finished graph; `session` ties a run together.

pub mod cache;
pub mod config;
pub mod cursor;
pub mod graph;
pub mod image;
pub mod memory;
pub mod metadata_init;
pub mod reachability;
pub mod session;
pub mod translate;
pub mod xrefs;

pub use cache::{CachedScan, MemoryScanCache, ScanCache, ScanCacheDb};
pub use config::ScanConfig;
pub use graph::{GraphBuild, GraphBuilder, ScanStats};
pub use image::BinaryImage;
pub use reachability::{classify, LiveSet, Liveness};
pub use session::{run_pass, ScanOutcome, ScanSession};
pub use xrefs::{ClassFilter, ClassSentinels, XrefExtractor};
