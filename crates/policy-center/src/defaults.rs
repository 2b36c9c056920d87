use std::collections::HashSet;

use gatehouse_core_types::{ActionType, TierLevel};

use crate::model::{PolicySnapshot, TierDefinition};

const DAY_SECS: u64 = 86_400;
const MINUTE_SECS: u64 = 60;

/// Built-in tier ladder. Each level widens the allowed action set and
/// raises the quotas; operators overlay adjustments via the loader or
/// runtime overrides.
pub fn default_snapshot() -> PolicySnapshot {
    let mut snapshot = PolicySnapshot {
        rev: 1,
        ..PolicySnapshot::default()
    };

    snapshot.push_tier(tier(
        TierLevel::Trial,
        &[ActionType::ChatReply],
        50,
        5,
        1,
        30_000,
        2,
    ));
    snapshot.push_tier(tier(
        TierLevel::Starter,
        &[
            ActionType::ChatReply,
            ActionType::DocumentDraft,
            ActionType::CalendarSync,
        ],
        200,
        10,
        2,
        60_000,
        3,
    ));
    snapshot.push_tier(tier(
        TierLevel::Standard,
        &[
            ActionType::ChatReply,
            ActionType::DocumentDraft,
            ActionType::CalendarSync,
            ActionType::ReportCompile,
            ActionType::DataAnalyze,
            ActionType::MailboxSweep,
            ActionType::CodeReview,
        ],
        1_000,
        30,
        4,
        120_000,
        3,
    ));
    snapshot.push_tier(tier(
        TierLevel::Professional,
        &[
            ActionType::ChatReply,
            ActionType::DocumentDraft,
            ActionType::CalendarSync,
            ActionType::ReportCompile,
            ActionType::DataAnalyze,
            ActionType::MailboxSweep,
            ActionType::CodeReview,
            ActionType::LedgerSync,
            ActionType::InvoiceMatch,
        ],
        5_000,
        60,
        8,
        300_000,
        3,
    ));
    snapshot.push_tier(tier(
        TierLevel::Enterprise,
        &ActionType::ALL,
        20_000,
        120,
        16,
        600_000,
        3,
    ));

    snapshot
}

fn tier(
    level: TierLevel,
    allowed: &[ActionType],
    window_quota: u32,
    burst_quota: u32,
    worker_concurrency: usize,
    task_timeout_ms: u64,
    max_attempts: u8,
) -> TierDefinition {
    TierDefinition {
        level,
        version: 1,
        allowed: allowed.iter().copied().collect::<HashSet<_>>(),
        window_quota,
        window_secs: DAY_SECS,
        burst_quota,
        burst_secs: MINUTE_SECS,
        worker_concurrency,
        task_timeout_ms,
        max_attempts,
    }
}
