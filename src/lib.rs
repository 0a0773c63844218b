//! # BOTWALL - Anti-Bot Verification Backend Core
//!
//! The data-access fabric for a CAPTCHA/anti-bot backend.
//!
//! ## Architecture
//!
//! - `keys`: Opaque external identifiers (site keys, API secrets, hashed IDs)
//! - `cache`: In-memory typed cache, key algebra, transaction staging, replay counters
//! - `db`: Relational store models and the narrow backend query surface
//! - `business`: Domain operations over store + cache, maintenance mode
//! - `batch`: Channel-to-chunk batching pipelines with panic isolation
//! - `audit`: Buffered audit log sink
//! - `session`: Cookie-backed session store with batched persistence
//! - `jobs`: One-off, periodic, and fleet-unique background jobs
//! - `timeseries`: Access/verify log ingestion and aggregated reads
//! - `config`: Typed configuration surface
//! - `context`: Ambient request context (trace ID, session ID, service name)
//! - `util`: Small text and domain helpers

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration surface
pub mod config;

// Ambient request context
pub mod context;

// External identifier codecs
pub mod keys;

// Text and domain helpers
pub mod util;

// Caching layer
pub mod cache;

// Relational store layer
pub mod db;

// Domain operations
pub mod business;

// Batching pipelines
pub mod batch;

// Audit log sink
pub mod audit;

// Session store
pub mod session;

// Background job engine
pub mod jobs;

// Time-series facade
pub mod timeseries;

// Re-export commonly used types
pub use business::{BusinessService, BusinessStore};
pub use cache::{Cache, CacheError, CacheKey, CachedValue, Prefix};
pub use context::Context;
pub use db::{StoreBackend, StoreError, StoreResult};
