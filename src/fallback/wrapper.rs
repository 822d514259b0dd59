//! Fallback wrapper (`spec.md` §4.9): runs an operation, and on a retryable
//! failure enqueues a durable replay instead of surfacing the error.

use std::future::Future;

use crate::config::FallbackConfig;
use crate::error::{ChronosError, Result};
use crate::model::FallbackOpType;
use crate::storage::MetadataStore;
use crate::types::RequestId;

use super::enqueue;

/// Result of [`execute`]: either the operation completed inline, or it was
/// accepted as a durable intent and will be replayed by the worker.
#[derive(Debug)]
pub enum ExecuteOutcome<T> {
    Completed(T),
    Queued { request_id: RequestId },
}

/// Runs `operation`. If it fails and `fallback.enabled`, classifies the
/// error: a permanent error (`spec.md` §7) always surfaces; a retryable one
/// is enqueued under `request_id` (generated if not given) and reported as
/// queued. With fallback disabled, every error surfaces directly.
pub async fn execute<T, F, Fut>(
    metadata: &dyn MetadataStore,
    cfg: &FallbackConfig,
    op_type: FallbackOpType,
    ctx: serde_json::Value,
    payload: serde_json::Value,
    opts: serde_json::Value,
    request_id: Option<RequestId>,
    operation: F,
) -> Result<ExecuteOutcome<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match operation().await {
        Ok(value) => Ok(ExecuteOutcome::Completed(value)),
        Err(e) => {
            if !cfg.enabled || e.is_permanent() {
                return Err(e);
            }
            let request_id = request_id.unwrap_or_else(RequestId::new);
            enqueue(metadata, cfg, request_id, op_type, ctx, payload, opts)?;
            Ok(ExecuteOutcome::Queued { request_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RedbMetadataStore;
    use crate::types::ItemId;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_execute_returns_completed_on_success() {
        let dir = tempdir().unwrap();
        let metadata = RedbMetadataStore::open(dir.path().join("t.redb")).unwrap();
        let cfg = FallbackConfig::default();
        let outcome = execute(
            &metadata,
            &cfg,
            FallbackOpType::Create,
            json!({}),
            json!({}),
            json!({}),
            None,
            || async { Ok(42) },
        )
        .await
        .unwrap();
        assert!(matches!(outcome, ExecuteOutcome::Completed(42)));
    }

    #[tokio::test]
    async fn test_execute_queues_retryable_failure() {
        let dir = tempdir().unwrap();
        let metadata = RedbMetadataStore::open(dir.path().join("t.redb")).unwrap();
        let cfg = FallbackConfig::default();
        let outcome = execute::<(), _, _>(
            &metadata,
            &cfg,
            FallbackOpType::Create,
            json!({}),
            json!({}),
            json!({}),
            None,
            || async { Err(ChronosError::txn("aborted")) },
        )
        .await
        .unwrap();
        match outcome {
            ExecuteOutcome::Queued { request_id } => {
                assert!(metadata.get_fallback_op(request_id).unwrap().is_some());
            }
            _ => panic!("expected Queued"),
        }
    }

    #[tokio::test]
    async fn test_execute_surfaces_permanent_error_even_with_fallback_enabled() {
        let dir = tempdir().unwrap();
        let metadata = RedbMetadataStore::open(dir.path().join("t.redb")).unwrap();
        let cfg = FallbackConfig::default();
        let err = execute::<(), _, _>(
            &metadata,
            &cfg,
            FallbackOpType::Create,
            json!({}),
            json!({}),
            json!({}),
            None,
            || async { Err(ChronosError::from(crate::error::NotFoundError::item(ItemId::nil()))) },
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }
}
