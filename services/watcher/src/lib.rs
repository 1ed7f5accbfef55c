// watcher: Library entry point.
// Exposes modules for integration testing.

pub mod auth;
pub mod backfill;
pub mod backoff;
pub mod cleaner;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod ingest;
pub mod session_cache;
pub mod shutdown;
pub mod storage;
pub mod stream;
pub mod summary;
