//! Breaks the router -> pipeline -> fallback cycle (`SPEC_FULL.md` §3.10):
//! the fallback worker replays ops against whatever routes/commits them
//! without depending on the concrete engine type.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::FallbackOp;

/// Replays one durable [`FallbackOp`] to completion. Implemented by the
/// top-level engine, which owns the router and the write pipelines that
/// the fallback worker would otherwise need to import directly.
#[async_trait]
pub trait ReplayAdapter: Send + Sync {
    async fn replay(&self, op: &FallbackOp) -> Result<()>;
}
