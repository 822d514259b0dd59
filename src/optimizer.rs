//! Write optimizer (`spec.md` §4.10): two independent debouncers sitting in
//! front of the blob store and the counter engine, plus the dev-shadow skip
//! policy.
//!
//! Both debouncers follow the same shape: the first caller in a window arms
//! a single timer for the configured delay; every caller in that window
//! gets folded into the pending batch; the timer fires once and drains
//! everything queued since it was armed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::config::{CounterOp, WriteOptimizationConfig};
use crate::error::Result;
use crate::storage::{BlobStore, PutResult};

/// Payload of one queued blob write.
enum BlobPayload {
    Json(Value),
    Raw(Vec<u8>, Option<String>),
}

struct QueuedBlobWrite {
    bucket: String,
    key: String,
    payload: BlobPayload,
    respond: oneshot::Sender<Result<PutResult>>,
}

/// Tags that force the dev-shadow to be skipped regardless of size
/// (`spec.md` §4.10).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerTag {
    BulkUpdate,
    BulkDelete,
}

/// Payloads larger than this always skip the dev-shadow when
/// `allowShadowSkip` is set, matching `DevShadowConfig`'s default cap.
pub const SHADOW_SKIP_THRESHOLD_BYTES: usize = 100 * 1024;

/// Aggregates counter bumps for one `(scope, op)` pair observed during a
/// debounce window.
type CounterFlush = dyn Fn(String, CounterOp, u64) -> Result<()> + Send + Sync;

pub struct WriteOptimizer {
    cfg: WriteOptimizationConfig,
    blob: Arc<dyn BlobStore>,
    blob_queue: Arc<Mutex<Vec<QueuedBlobWrite>>>,
    blob_timer_armed: Arc<AtomicBool>,
    counter_queue: Arc<Mutex<HashMap<(String, CounterOp), u64>>>,
    counter_timer_armed: Arc<AtomicBool>,
    counter_flush: Arc<CounterFlush>,
}

impl WriteOptimizer {
    pub fn new(cfg: WriteOptimizationConfig, blob: Arc<dyn BlobStore>, counter_flush: Arc<CounterFlush>) -> Self {
        Self {
            cfg,
            blob,
            blob_queue: Arc::new(Mutex::new(Vec::new())),
            blob_timer_armed: Arc::new(AtomicBool::new(false)),
            counter_queue: Arc::new(Mutex::new(HashMap::new())),
            counter_timer_armed: Arc::new(AtomicBool::new(false)),
            counter_flush,
        }
    }

    /// Writes a JSON blob, batched behind `batchWindowMs` if `batchS3` is
    /// enabled; writes immediately otherwise.
    pub async fn put_json(&self, bucket: &str, key: &str, value: &Value) -> Result<PutResult> {
        if !self.cfg.batch_s3 {
            return self.blob.put_json(bucket, key, value).await;
        }
        let (tx, rx) = oneshot::channel();
        self.queue_blob_write(QueuedBlobWrite {
            bucket: bucket.to_string(),
            key: key.to_string(),
            payload: BlobPayload::Json(value.clone()),
            respond: tx,
        })
        .await;
        rx.await.expect("blob batch worker always responds before dropping the sender")
    }

    /// Writes raw bytes, batched behind `batchWindowMs` if `batchS3` is
    /// enabled; writes immediately otherwise.
    pub async fn put_raw(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<PutResult> {
        if !self.cfg.batch_s3 {
            return self.blob.put_raw(bucket, key, bytes, content_type).await;
        }
        let (tx, rx) = oneshot::channel();
        self.queue_blob_write(QueuedBlobWrite {
            bucket: bucket.to_string(),
            key: key.to_string(),
            payload: BlobPayload::Raw(bytes, content_type.map(str::to_string)),
            respond: tx,
        })
        .await;
        rx.await.expect("blob batch worker always responds before dropping the sender")
    }

    async fn queue_blob_write(&self, request: QueuedBlobWrite) {
        self.blob_queue.lock().await.push(request);
        if self
            .blob_timer_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let blob = self.blob.clone();
            let queue = self.blob_queue.clone();
            let armed = self.blob_timer_armed.clone();
            let window_ms = self.cfg.batch_window_ms;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(window_ms)).await;
                let batch = std::mem::take(&mut *queue.lock().await);
                armed.store(false, Ordering::SeqCst);
                let futures = batch.into_iter().map(|req| {
                    let blob = blob.clone();
                    async move {
                        let result = match req.payload {
                            BlobPayload::Json(value) => blob.put_json(&req.bucket, &req.key, &value).await,
                            BlobPayload::Raw(bytes, content_type) => {
                                blob.put_raw(&req.bucket, &req.key, bytes, content_type.as_deref()).await
                            }
                        };
                        let _ = req.respond.send(result);
                    }
                });
                futures_util::future::join_all(futures).await;
            });
        }
    }

    /// Coalesces a counter bump for `(scope_key, op)`, flushing the
    /// aggregated count to the registered callback after `debounceCountersMs`.
    pub async fn debounced_counter_update(&self, scope_key: &str, op: CounterOp) {
        {
            let mut queue = self.counter_queue.lock().await;
            *queue.entry((scope_key.to_string(), op)).or_insert(0) += 1;
        }
        self.arm_counter_timer();
    }

    fn arm_counter_timer(&self) {
        if self
            .counter_timer_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let queue = self.counter_queue.clone();
        let armed = self.counter_timer_armed.clone();
        let flush = self.counter_flush.clone();
        let window_ms = self.cfg.debounce_counters_ms;
        let needs_rearm = Arc::new(AtomicBool::new(false));
        let needs_rearm_for_timer = needs_rearm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(window_ms)).await;
            let batch = std::mem::take(&mut *queue.lock().await);
            armed.store(false, Ordering::SeqCst);
            for ((scope, op), count) in batch {
                if let Err(e) = flush(scope.clone(), op, count) {
                    tracing::warn!(error = %e, scope = %scope, "counter flush failed, re-queuing");
                    queue.lock().await.entry((scope, op)).and_modify(|c| *c += count).or_insert(count);
                    needs_rearm_for_timer.store(true, Ordering::SeqCst);
                }
            }
            if needs_rearm_for_timer.load(Ordering::SeqCst)
                && armed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
            {
                let queue = queue.clone();
                let armed = armed.clone();
                let flush = flush.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(window_ms)).await;
                    let batch = std::mem::take(&mut *queue.lock().await);
                    armed.store(false, Ordering::SeqCst);
                    for ((scope, op), count) in batch {
                        if let Err(e) = flush(scope.clone(), op, count) {
                            tracing::warn!(error = %e, scope = %scope, "counter flush retry failed, dropping batch");
                        }
                    }
                });
            }
        });
        let _ = needs_rearm;
    }

    /// Whether the dev-shadow should be omitted for a payload of
    /// `payload_bytes` bytes with optional bulk `tag`.
    pub fn should_skip_shadow(&self, payload_bytes: usize, tag: Option<OptimizerTag>) -> bool {
        if !self.cfg.allow_shadow_skip {
            return false;
        }
        payload_bytes > SHADOW_SKIP_THRESHOLD_BYTES || tag.is_some()
    }
}
