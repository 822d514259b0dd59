//! Storage layer abstractions.
//!
//! Two capability traits back the engine, matching `spec.md` §4.2's split
//! between the authoritative blob store and the indexed metadata store:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Engine                             │
//! │            │                          │                    │
//! │            ▼                          ▼                    │
//! │   ┌────────────────┐         ┌─────────────────┐           │
//! │   │  MetadataStore │  trait  │    BlobStore     │  trait   │
//! │   └────────────────┘         └─────────────────┘           │
//! │          ▲                          ▲                      │
//! │          │                          │                      │
//! │  ┌───────┴───────┐         ┌───────┴────────────┐          │
//! │  │RedbMetadataStore│       │ObjectStoreBlobStore│          │
//! │  └────────────────┘        └────────────────────┘          │
//! │    (prod, sync)              (prod, async)                 │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! `MetadataStore` is synchronous because `redb` itself is synchronous;
//! `BlobStore` is `async` because `object_store` I/O is inherently async.
//! Bridging the two inside the write pipeline (`spec.md` §4.6) is the
//! engine's job, not either store's.

pub mod blob_store;
pub mod metadata_store;

pub use blob_store::{BlobStore, CompositeBlobStore, HeadResult, InMemoryBlobStore, ListPage, ObjectStoreBlobStore, PutResult};
pub use metadata_store::{MetadataStore, RedbMetadataStore};
