use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gatehouse_core_types::ActorId;

/// Quotas charged per decision, taken from the actor's tier definition.
/// Both the long primary window and the short burst window must pass.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub window_quota: u32,
    pub window_secs: u64,
    pub burst_quota: u32,
    pub burst_secs: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Window,
    Burst,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded ({scope:?}); retry after {retry_after:?}")]
    Exceeded {
        scope: LimitScope,
        retry_after: Duration,
    },
}

/// What a successful charge leaves behind.
#[derive(Clone, Copy, Debug)]
pub struct ChargeReceipt {
    pub remaining_window: u32,
    pub remaining_burst: u32,
    pub window_start: i64,
}

/// Read-only view for dashboards.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateStatus {
    pub used_window: u32,
    pub used_burst: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct WindowCounter {
    window_start: i64,
    count: u32,
}

impl WindowCounter {
    /// Lazy expiry: a counter from an elapsed window reads as zero.
    fn current(&self, now_secs: i64, window_secs: u64) -> u32 {
        if aligned_start(now_secs, window_secs) == self.window_start {
            self.count
        } else {
            0
        }
    }

    fn charge(&mut self, now_secs: i64, window_secs: u64) {
        let start = aligned_start(now_secs, window_secs);
        if self.window_start != start {
            self.window_start = start;
            self.count = 0;
        }
        self.count += 1;
    }

    fn refund(&mut self, now_secs: i64, window_secs: u64) {
        if aligned_start(now_secs, window_secs) == self.window_start && self.count > 0 {
            self.count -= 1;
        }
    }

    fn retry_after(&self, now_secs: i64, window_secs: u64) -> Duration {
        let next = self.window_start + window_secs as i64;
        Duration::from_secs(next.saturating_sub(now_secs).max(1) as u64)
    }
}

fn aligned_start(now_secs: i64, window_secs: u64) -> i64 {
    let window = window_secs.max(1) as i64;
    now_secs.div_euclid(window) * window
}

#[derive(Default)]
struct ActorBuckets {
    primary: WindowCounter,
    burst: WindowCounter,
}

/// Fixed-window counters keyed by actor. Charge-and-decide is atomic per
/// actor: the per-actor mutex serializes concurrent evaluations for one
/// actor while leaving other actors fully parallel, so no two concurrent
/// requests can both pass a check that should have exhausted the quota.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<ActorId, Mutex<ActorBuckets>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_charge(
        &self,
        actor: &ActorId,
        quota: &QuotaSpec,
        now: DateTime<Utc>,
    ) -> Result<ChargeReceipt, RateLimitError> {
        let now_secs = now.timestamp();
        let entry = self.buckets.entry(actor.clone()).or_default();
        let mut buckets = entry.lock();

        let used_window = buckets.primary.current(now_secs, quota.window_secs);
        if used_window >= quota.window_quota {
            return Err(RateLimitError::Exceeded {
                scope: LimitScope::Window,
                retry_after: buckets.primary.retry_after(now_secs, quota.window_secs),
            });
        }
        let used_burst = buckets.burst.current(now_secs, quota.burst_secs);
        if used_burst >= quota.burst_quota {
            return Err(RateLimitError::Exceeded {
                scope: LimitScope::Burst,
                retry_after: buckets.burst.retry_after(now_secs, quota.burst_secs),
            });
        }

        buckets.primary.charge(now_secs, quota.window_secs);
        buckets.burst.charge(now_secs, quota.burst_secs);
        Ok(ChargeReceipt {
            remaining_window: quota.window_quota - (used_window + 1),
            remaining_burst: quota.burst_quota - (used_burst + 1),
            window_start: buckets.primary.window_start,
        })
    }

    /// Back out a charge made in the current windows. Used when a decision
    /// cannot be completed after charging (lost audit write).
    pub fn refund(&self, actor: &ActorId, quota: &QuotaSpec, now: DateTime<Utc>) {
        if let Some(entry) = self.buckets.get(actor) {
            let now_secs = now.timestamp();
            let mut buckets = entry.lock();
            buckets.primary.refund(now_secs, quota.window_secs);
            buckets.burst.refund(now_secs, quota.burst_secs);
        }
    }

    pub fn peek(&self, actor: &ActorId, quota: &QuotaSpec, now: DateTime<Utc>) -> RateStatus {
        match self.buckets.get(actor) {
            Some(entry) => {
                let now_secs = now.timestamp();
                let buckets = entry.lock();
                RateStatus {
                    used_window: buckets.primary.current(now_secs, quota.window_secs),
                    used_burst: buckets.burst.current(now_secs, quota.burst_secs),
                }
            }
            None => RateStatus::default(),
        }
    }

    /// Drop buckets whose primary window ended before `cutoff`. Lazy expiry
    /// makes this optional housekeeping, not a correctness requirement.
    pub fn purge_idle(&self, cutoff: DateTime<Utc>, window_secs: u64) {
        let cutoff_secs = cutoff.timestamp();
        self.buckets.retain(|_, bucket| {
            let guard = bucket.lock();
            guard.primary.window_start + window_secs.max(1) as i64 >= cutoff_secs
        });
    }
}
