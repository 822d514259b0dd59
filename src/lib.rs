//! # chronos-db
//!
//! A unified, versioned persistence layer combining an indexed metadata
//! store with an authoritative blob store.
//!
//! Every record's payload is the source of truth in the blob store; the
//! metadata store holds only a `head` pointer, an append-only `version`
//! index, locks, and counters. Writes go through the [`pipeline`]'s
//! commit protocol: validate, lock, externalize, allocate a commit
//! sequence number, write the blob, commit head+version, bump counters,
//! unlock.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chronos_db::prelude::*;
//!
//! let engine = Engine::new(config, blob_handles)?;
//! let ctx = RouteContext { collection: "users".into(), ..Default::default() };
//! let created = engine.create(&ctx, serde_json::json!({"email": "a@x"}), WriteOptions::default()).await?;
//! let latest = engine.get_latest(&ctx, created.id).await?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Record identity and versioning
//!
//! Every record has a stable [`types::ItemId`], a monotonically increasing
//! `ov` (object version, per-record) and `cv` (commit sequence, per
//! collection). Updates never overwrite — they append a new version and
//! swing the head pointer under an optimistic-lock precondition.
//!
//! ### Routing
//!
//! The [`router`] resolves a [`router::RouteContext`] (database type, tier,
//! tenant) to a concrete metadata connection and bucket quadruple, with
//! on-demand tenant provisioning via a template engine.
//!
//! ### Durability under failure
//!
//! The [`fallback`] queue accepts writes that fail for retryable reasons as
//! durable intents, replayed by a background worker with exponential
//! backoff, falling through to a dead-letter collection once exhausted.
//!
//! ## Thread Safety
//!
//! [`engine::Engine`] is `Send + Sync` and meant to be shared across tasks
//! behind an `Arc`. Per-record mutual exclusion is enforced by a
//! cross-process lock in the metadata store, not by any in-process mutex.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod blob_key;
mod counters;
mod error;
mod hash;
mod metadata_map;
mod system;
mod types;

pub mod config;
pub mod engine;
pub mod fallback;
pub mod model;
pub mod optimizer;
pub mod pipeline;
pub mod restore;
pub mod router;
pub mod storage;

// ============================================================================
// Public API re-exports
// ============================================================================

// Engine
pub use engine::Engine;

// Configuration
pub use config::{Config, CounterOp, CounterRule, CounterRulesConfig, DevShadowConfig, FallbackConfig, WriteOptimizationConfig};

// Error handling
pub use error::{ChronosError, NotFoundError, Result, RouteError, StorageError, ValidationError};

// Core types
pub use types::{ActorId, Cv, ItemId, Ov, RequestId, Timestamp};

// Data model
pub use model::{CounterTotals, FallbackOp, FallbackOpType, Head, RuleTotals, Version};

// Write pipeline
pub use pipeline::{CommitOutcome, RecordView, WriteOptions, WritePipeline};

// Restore engine
pub use restore::{RestoreCollectionReport, RestoreTarget};

// Routing
pub use router::{DatabaseType, ResolvedRoute, RouteContext, Router, Tier};

// Storage (for advanced users wiring their own blob/metadata handles)
pub use storage::{BlobStore, CompositeBlobStore, MetadataStore, ObjectStoreBlobStore, RedbMetadataStore};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common chronos-db usage.
///
/// ```rust
/// use chronos_db::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::Engine;
    pub use crate::error::{ChronosError, Result};
    pub use crate::pipeline::{CommitOutcome, RecordView, WriteOptions};
    pub use crate::router::RouteContext;
    pub use crate::types::{ItemId, Ov, Timestamp};
}
