//! Durable fallback queue (`spec.md` §4.9): backoff scheduling and the
//! permanent/retryable classification shared by the wrapper and the worker.

pub mod replay;
pub mod worker;
pub mod wrapper;

use rand::Rng;

use crate::config::FallbackConfig;
use crate::error::{ChronosError, Result};
use crate::model::{FallbackOp, FallbackOpType};
use crate::storage::MetadataStore;
use crate::types::{RequestId, Timestamp};

pub use replay::ReplayAdapter;
pub use worker::Worker;
pub use wrapper::{execute, ExecuteOutcome};

/// `delay(attempt) = min(2^attempt * baseDelayMs, maxDelayMs) * (1 +- 10% jitter)`.
pub fn compute_delay_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exp = 2u64.saturating_pow(attempt).saturating_mul(base_delay_ms);
    let capped = exp.min(max_delay_ms);
    let jitter_fraction = rand::rng().random_range(-0.1..=0.1);
    let jittered = (capped as f64) * (1.0 + jitter_fraction);
    jittered.max(0.0).round() as u64
}

/// Whether an op at `attempt` attempts with `last_error` should move to dead
/// letter instead of being rescheduled.
pub fn is_exhausted(attempt: u32, max_attempts: u32, last_error: &ChronosError) -> bool {
    attempt >= max_attempts || last_error.is_permanent()
}

/// Enqueues (or reschedules, if `request_id` already exists) a durable
/// replay intent. `enqueue` is idempotent by `request_id`: a duplicate just
/// overwrites `payload`/`opts` and resets the schedule.
#[allow(clippy::too_many_arguments)]
pub fn enqueue(
    metadata: &dyn MetadataStore,
    cfg: &FallbackConfig,
    request_id: RequestId,
    op_type: FallbackOpType,
    ctx: serde_json::Value,
    payload: serde_json::Value,
    opts: serde_json::Value,
) -> Result<()> {
    let now = Timestamp::now();
    let op = FallbackOp {
        request_id,
        op_type,
        ctx,
        payload,
        opts,
        attempt: 0,
        next_attempt_at: Timestamp::from_millis(now.as_millis() + compute_delay_ms(0, cfg.base_delay_ms, cfg.max_delay_ms) as i64),
        last_error: None,
        created_at: now,
    };
    metadata.put_fallback_op(&op)
}

/// Reschedules `op` for another attempt after an observed failure.
pub fn reschedule(metadata: &dyn MetadataStore, cfg: &FallbackConfig, mut op: FallbackOp, error: &ChronosError) -> Result<()> {
    op.attempt += 1;
    op.last_error = Some(error.to_string());
    let delay = compute_delay_ms(op.attempt, cfg.base_delay_ms, cfg.max_delay_ms);
    op.next_attempt_at = Timestamp::from_millis(Timestamp::now().as_millis() + delay as i64);
    metadata.put_fallback_op(&op)
}

/// Moves `op` to the configured dead-letter collection and removes it from
/// the active queue.
pub fn dead_letter(metadata: &dyn MetadataStore, cfg: &FallbackConfig, op: FallbackOp, final_error: &ChronosError) -> Result<()> {
    let request_id = op.request_id;
    let entry = crate::model::DeadLetterEntry {
        op,
        final_error: final_error.to_string(),
        failed_at: Timestamp::now(),
    };
    metadata.put_dead_letter(&cfg.dead_letter_collection, &entry)?;
    metadata.delete_fallback_op(request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_delay_caps_at_max() {
        let delay = compute_delay_ms(10, 500, 60_000);
        assert!(delay <= 66_000);
        assert!(delay >= 54_000);
    }

    #[test]
    fn test_compute_delay_grows_exponentially_before_cap() {
        let d0 = compute_delay_ms(0, 500, 60_000);
        let d1 = compute_delay_ms(1, 500, 60_000);
        assert!(d0 <= 550 && d0 >= 450);
        assert!(d1 <= 1_100 && d1 >= 900);
    }

    #[test]
    fn test_is_exhausted_on_max_attempts() {
        let err = ChronosError::txn("aborted");
        assert!(is_exhausted(8, 8, &err));
        assert!(!is_exhausted(3, 8, &err));
    }

    #[test]
    fn test_is_exhausted_on_permanent_error() {
        let err = ChronosError::optimistic_lock(crate::types::ItemId::nil(), crate::types::Ov(0));
        assert!(is_exhausted(0, 8, &err));
    }
}
