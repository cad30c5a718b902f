//! Incremental media catalog indexer.
//!
//! Walks media directories into a SQLite catalog, re-reading only files
//! whose fingerprint changed, caching extracted metadata by file state and
//! grouping exact and near duplicates.

pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod logging;
pub mod notify;
pub mod scanner;

pub use config::Config;
pub use db::Database;
pub use error::{IndexError, Result};
pub use scanner::{CancelToken, Indexer, ScanOptions, ScanProgress, ScanStats};
