//! Rolling replacement of allocations after a job changes.

use crate::model::{Allocation, DesiredStatus, UpdateStrategy};
use crate::state::ClusterState;

/// Live allocations of an older job version that should be replaced now.
///
/// Without a strategy every outdated allocation goes at once. With one, at
/// most `max_parallel` go per batch, and a batch only starts once every
/// new-version allocation is running and healthy and `stagger` has passed
/// since the previous batch was placed.
pub fn next_batch<'a>(
    state: &'a ClusterState,
    job_id: &str,
    version: u64,
    count: u32,
    strategy: Option<&UpdateStrategy>,
    now_ms: i64,
) -> Vec<&'a Allocation> {
    let heads: Vec<&Allocation> = (0..count)
        .filter_map(|slot| state.slot_head(job_id, slot))
        .collect();

    let outdated: Vec<&Allocation> = heads
        .iter()
        .copied()
        .filter(|a| {
            a.job_version != version && a.desired == DesiredStatus::Run && !a.status.is_terminal()
        })
        .collect();
    if outdated.is_empty() {
        return Vec::new();
    }
    let Some(strategy) = strategy else {
        return outdated;
    };

    let settling = heads.iter().any(|a| {
        a.job_version == version
            && a.desired == DesiredStatus::Run
            && !a.status.is_terminal()
            && !state.alloc_is_healthy(a)
    });
    if settling {
        return Vec::new();
    }

    let last_batch_at = state
        .allocations_for_job(job_id)
        .into_iter()
        .filter(|a| a.job_version == version && a.previous_allocation.is_some())
        .map(|a| a.created_at_ms)
        .max();
    if let Some(at) = last_batch_at {
        if now_ms.saturating_sub(at) < strategy.stagger.as_millis() as i64 {
            return Vec::new();
        }
    }

    outdated
        .into_iter()
        .take(strategy.max_parallel.max(1) as usize)
        .collect()
}
