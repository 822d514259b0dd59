//! Single-process fallback worker (`spec.md` §4.9, §5): polls for due ops,
//! dispatches them concurrently with a per-op dedup set, and reschedules or
//! dead-letters on failure. `stop` is cooperative: it refuses new dequeues
//! and waits for the active set to drain.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::FallbackConfig;
use crate::fallback::{self, ReplayAdapter};
use crate::storage::MetadataStore;
use crate::types::{RequestId, Timestamp};

const STOP_POLL_MS: u64 = 100;

/// Polls `metadata` for due [`FallbackOp`](crate::model::FallbackOp)s and
/// replays them through `adapter` until [`stop`](Worker::stop) is called.
pub struct Worker {
    metadata: Arc<dyn MetadataStore>,
    adapter: Arc<dyn ReplayAdapter>,
    cfg: FallbackConfig,
    stopping: Arc<AtomicBool>,
    active: Arc<Mutex<HashSet<RequestId>>>,
}

impl Worker {
    pub fn new(metadata: Arc<dyn MetadataStore>, adapter: Arc<dyn ReplayAdapter>, cfg: FallbackConfig) -> Self {
        Self {
            metadata,
            adapter,
            cfg,
            stopping: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs the poll loop until `stop` is called. Intended to be spawned as
    /// a background task by the owning engine.
    pub async fn run(&self) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.poll_once().await {
                tracing::warn!(error = %e, "fallback worker poll failed");
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.poll_interval_ms)).await;
        }
        self.drain().await;
    }

    async fn poll_once(&self) -> crate::error::Result<()> {
        let due = self.metadata.due_fallback_ops(Timestamp::now(), self.cfg.batch_size)?;
        let mut handles = Vec::new();
        for op in due {
            let request_id = op.request_id;
            {
                let mut active = self.active.lock().expect("fallback active-set mutex poisoned");
                if !active.insert(request_id) {
                    continue;
                }
            }
            let metadata = self.metadata.clone();
            let adapter = self.adapter.clone();
            let cfg = self.cfg.clone();
            let active = self.active.clone();
            handles.push(tokio::spawn(async move {
                let result = adapter.replay(&op).await;
                match result {
                    Ok(()) => {
                        if let Err(e) = metadata.delete_fallback_op(request_id) {
                            tracing::warn!(error = %e, %request_id, "failed to delete completed fallback op");
                        }
                    }
                    Err(e) => {
                        let outcome = if fallback::is_exhausted(op.attempt + 1, cfg.max_attempts, &e) {
                            fallback::dead_letter(metadata.as_ref(), &cfg, op, &e)
                        } else {
                            fallback::reschedule(metadata.as_ref(), &cfg, op, &e)
                        };
                        if let Err(store_err) = outcome {
                            tracing::warn!(error = %store_err, %request_id, "failed to update fallback op after failure");
                        }
                    }
                }
                active.lock().expect("fallback active-set mutex poisoned").remove(&request_id);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Requests the worker stop after draining in-flight ops. Blocks the
    /// caller until the active set is empty.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.drain().await;
    }

    async fn drain(&self) {
        loop {
            let empty = self.active.lock().expect("fallback active-set mutex poisoned").is_empty();
            if empty {
                break;
            }
            tokio::time::sleep(Duration::from_millis(STOP_POLL_MS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FallbackOp, FallbackOpType};
    use crate::storage::RedbMetadataStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct CountingAdapter {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl ReplayAdapter for CountingAdapter {
        async fn replay(&self, _op: &FallbackOp) -> crate::error::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(crate::error::ChronosError::txn("boom"))
            }
        }
    }

    fn sample_op() -> FallbackOp {
        FallbackOp {
            request_id: RequestId::new(),
            op_type: FallbackOpType::Update,
            ctx: json!({}),
            payload: json!({}),
            opts: json!({}),
            attempt: 0,
            next_attempt_at: Timestamp::from_millis(0),
            last_error: None,
            created_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_poll_once_replays_due_op_and_deletes_on_success() {
        let dir = tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(RedbMetadataStore::open(dir.path().join("t.redb")).unwrap());
        let op = sample_op();
        let request_id = op.request_id;
        metadata.put_fallback_op(&op).unwrap();

        let adapter = Arc::new(CountingAdapter {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let worker = Worker::new(metadata.clone(), adapter.clone(), FallbackConfig::default());
        worker.poll_once().await.unwrap();

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert!(metadata.get_fallback_op(request_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_once_reschedules_on_retryable_failure() {
        let dir = tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(RedbMetadataStore::open(dir.path().join("t.redb")).unwrap());
        let op = sample_op();
        let request_id = op.request_id;
        metadata.put_fallback_op(&op).unwrap();

        let adapter = Arc::new(CountingAdapter {
            calls: AtomicUsize::new(0),
            succeed: false,
        });
        let worker = Worker::new(metadata.clone(), adapter, FallbackConfig::default());
        worker.poll_once().await.unwrap();

        let rescheduled = metadata.get_fallback_op(request_id).unwrap().unwrap();
        assert_eq!(rescheduled.attempt, 1);
        assert!(rescheduled.last_error.is_some());
    }
}
