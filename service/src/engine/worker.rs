//! The per-(type, direction) sync worker.
//!
//! Each worker pages its source's change feed from the persisted cursor,
//! resolves every record against the destination, applies the winner, and
//! advances the cursor past successes only. A failed apply leaves the cursor
//! behind so the record is retried on the next cycle; the in-flight set
//! keeps those retries from re-applying what already landed.

use crate::engine::hotset::HotSet;
use crate::engine::status::StatusRegistry;
use crate::error::{Result, SyncError};
use crate::store::{LocalStore, StoreAdapter};
use flowsync_core::{
    resolve, ApplyOutcome, CursorToken, DataType, MonotonicClock, Record, Resolution, StoreOrigin,
    SyncDirection, SyncPolicy, SyncStrategy,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Retryable failures tolerated before backoff and `Degraded`.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Backoff base and cap.
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Per-record apply timeout against a remote peer.
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Metrics of one worker cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub seen: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
}

/// Result of one cycle, including the ids that changed on the destination.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub summary: CycleSummary,
    pub applied_ids: Vec<String>,
}

/// Everything a worker needs, owned by value so workers survive engine
/// reconfiguration until drained.
pub struct WorkerContext {
    pub data_type: DataType,
    pub direction: SyncDirection,
    pub policy: SyncPolicy,
    pub source: Arc<dyn StoreAdapter>,
    pub dest: Arc<dyn StoreAdapter>,
    /// Cursor persistence always lives in the local store.
    pub cursors: Arc<LocalStore>,
    pub external_permits: Arc<Semaphore>,
    pub status: Arc<StatusRegistry>,
    pub hot_set: Arc<HotSet>,
    pub clock: Arc<MonotonicClock>,
}

impl WorkerContext {
    fn touches_remote(&self) -> bool {
        self.source.origin() == StoreOrigin::External
            || self.dest.origin() == StoreOrigin::External
    }

    fn is_on_demand(&self) -> bool {
        self.policy.strategy == SyncStrategy::OnDemand
    }
}

/// The worker loop: tick on the policy interval, wake on explicit trigger,
/// exit on cancellation at the next suspension point.
pub async fn run_worker(
    ctx: WorkerContext,
    mut trigger: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(ctx.policy.interval_seconds.max(1));
    let mut in_flight: HashSet<InFlightKey> = HashSet::new();
    let mut consecutive_failures: u32 = 0;

    tracing::debug!(
        data_type = %ctx.data_type,
        direction = ctx.direction.as_str(),
        interval_s = ctx.policy.interval_seconds,
        "sync worker started"
    );

    loop {
        let delay = if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            backoff_delay(consecutive_failures - MAX_CONSECUTIVE_FAILURES)
        } else {
            interval
        };

        let triggered = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => false,
            Some(_) = trigger.recv() => true,
        };

        // For on-demand types the interval is only a ceiling; a tick with a
        // cold working set does nothing.
        if ctx.is_on_demand() && !triggered && ctx.hot_set.is_empty() {
            continue;
        }

        match run_cycle(&ctx, &mut in_flight, &cancel).await {
            Ok(outcome) => {
                consecutive_failures = 0;
                tracing::debug!(
                    data_type = %ctx.data_type,
                    direction = ctx.direction.as_str(),
                    seen = outcome.summary.seen,
                    applied = outcome.summary.applied,
                    conflicts = outcome.summary.conflicts,
                    elapsed_ms = outcome.summary.elapsed_ms,
                    "sync cycle finished"
                );
            }
            Err(e) if e.is_retryable() => {
                consecutive_failures += 1;
                let degraded = consecutive_failures >= MAX_CONSECUTIVE_FAILURES;
                ctx.status
                    .record_error(ctx.data_type, ctx.direction, &e.to_string(), degraded);
                if degraded {
                    tracing::warn!(
                        data_type = %ctx.data_type,
                        direction = ctx.direction.as_str(),
                        failures = consecutive_failures,
                        "worker degraded, backing off"
                    );
                }
            }
            Err(e) => {
                ctx.status
                    .record_error(ctx.data_type, ctx.direction, &e.to_string(), false);
                tracing::error!(
                    data_type = %ctx.data_type,
                    direction = ctx.direction.as_str(),
                    error = %e,
                    "sync cycle failed"
                );
            }
        }
    }

    tracing::debug!(
        data_type = %ctx.data_type,
        direction = ctx.direction.as_str(),
        "sync worker stopped"
    );
}

/// Identity of an applied record version, used to deduplicate retries.
pub type InFlightKey = (String, u64, u64);

/// Run one incremental reconciliation cycle.
///
/// The cursor advances record by record and is persisted on every exit path,
/// so an error never skips the failing record.
pub async fn run_cycle(
    ctx: &WorkerContext,
    in_flight: &mut HashSet<InFlightKey>,
    cancel: &CancellationToken,
) -> Result<CycleOutcome> {
    let started = Instant::now();
    let mut token = ctx
        .cursors
        .load_cursor(ctx.data_type, ctx.direction)
        .await?
        .unwrap_or_default();

    let mut outcome = CycleOutcome::default();

    'feed: loop {
        let page = match ctx
            .source
            .list_since(ctx.data_type, &token, ctx.policy.batch_size.max(1))
            .await
        {
            Ok(page) => page,
            Err(e) => {
                finish(ctx, &mut outcome, &token, started).await;
                return Err(e);
            }
        };

        if page.records.is_empty() {
            break;
        }
        let has_more = page.has_more;

        for record in page.records {
            if cancel.is_cancelled() {
                // Finish the record we are on, not the batch.
                break 'feed;
            }

            outcome.summary.seen += 1;

            if ctx.is_on_demand() && !ctx.hot_set.contains(&record.id) {
                token.advance(record.updated_at, &record.id);
                continue;
            }

            let key = (record.id.clone(), record.updated_at, record.version);
            if in_flight.contains(&key) {
                outcome.summary.skipped += 1;
                token.advance(record.updated_at, &record.id);
                continue;
            }

            let applied = {
                let _permit = if ctx.touches_remote() {
                    Some(ctx.external_permits.acquire().await.map_err(|_| {
                        SyncError::Internal("external permit semaphore closed".into())
                    })?)
                } else {
                    None
                };
                apply_record(ctx, &record).await
            };

            match applied {
                Ok(result) => {
                    in_flight.insert(key);
                    token.advance(record.updated_at, &record.id);
                    match result {
                        ApplyOutcome::Applied => {
                            outcome.summary.applied += 1;
                            outcome.applied_ids.push(record.id.clone());
                        }
                        ApplyOutcome::ConflictResolved => {
                            outcome.summary.applied += 1;
                            outcome.summary.conflicts += 1;
                            outcome.applied_ids.push(record.id.clone());
                        }
                        ApplyOutcome::SkippedSuperseded | ApplyOutcome::AlreadyConverged => {
                            outcome.summary.skipped += 1;
                        }
                    }
                }
                Err(e) => {
                    outcome.summary.errors += 1;
                    finish(ctx, &mut outcome, &token, started).await;
                    return Err(e);
                }
            }
        }

        if !has_more {
            break;
        }
    }

    in_flight.clear();
    finish(ctx, &mut outcome, &token, started).await;
    Ok(outcome)
}

async fn finish(
    ctx: &WorkerContext,
    outcome: &mut CycleOutcome,
    token: &CursorToken,
    started: Instant,
) {
    outcome.summary.elapsed_ms = started.elapsed().as_millis() as u64;
    if let Err(e) = ctx
        .cursors
        .save_cursor(ctx.data_type, ctx.direction, token)
        .await
    {
        tracing::warn!(
            data_type = %ctx.data_type,
            error = %e,
            "failed to persist sync cursor"
        );
    }
    ctx.status.record_cycle(
        ctx.data_type,
        ctx.direction,
        outcome.summary.clone(),
        token.updated_at,
        ctx.clock.now_millis(),
    );
}

/// Apply one record to the destination under the policy's strategy.
async fn apply_record(ctx: &WorkerContext, record: &Record) -> Result<ApplyOutcome> {
    let apply = async {
        match ctx.policy.strategy {
            // No conflict check: the destination accepts the source.
            SyncStrategy::MasterSlave | SyncStrategy::BackupOnly => ctx.dest.put(record).await,
            _ => {
                let current = ctx.dest.get(record.data_type, &record.id).await?;
                match current {
                    None => ctx.dest.put(record).await,
                    Some(current) => match resolve(record, &current) {
                        Resolution::KeepCurrent => {
                            tracing::debug!(
                                data_type = %record.data_type,
                                id = %record.id,
                                "incoming copy superseded by destination"
                            );
                            Ok(ApplyOutcome::SkippedSuperseded)
                        }
                        Resolution::Converged => Ok(ApplyOutcome::AlreadyConverged),
                        Resolution::KeepIncoming => {
                            let outcome = ctx.dest.put(record).await?;
                            if outcome == ApplyOutcome::Applied
                                && record.updated_at == current.updated_at
                            {
                                tracing::debug!(
                                    data_type = %record.data_type,
                                    id = %record.id,
                                    "conflict resolved in favor of incoming copy"
                                );
                                Ok(ApplyOutcome::ConflictResolved)
                            } else {
                                Ok(outcome)
                            }
                        }
                    },
                }
            }
        }
    };

    if ctx.touches_remote() {
        match tokio::time::timeout(APPLY_TIMEOUT, apply).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Retryable(format!(
                "apply of {}/{} timed out",
                record.data_type, record.id
            ))),
        }
    } else {
        apply.await
    }
}

fn backoff_delay(exponent: u32) -> Duration {
    let factor = 2u32.saturating_pow(exponent.min(8));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_cap() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(10), BACKOFF_CAP);
    }
}
