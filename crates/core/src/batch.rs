//! Batch orchestration.
//!
//! Items are processed in fixed-size contiguous slices: slices run strictly
//! one after another (bounding in-flight load on the target server to one
//! batch's worth), while items inside a slice run concurrently on the one
//! cooperative thread. One item failing never prevents its siblings from
//! completing; the failure is carried in that item's result slot.

use crate::error::SyncResult;
use futures::future::join_all;
use std::future::Future;

/// Run `worker` over `items` in sequential batches of `batch_size`.
///
/// Returns one result per item, in input order.
pub async fn run_in_batches<T, O, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    worker: F,
) -> Vec<SyncResult<O>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = SyncResult<O>>,
{
    let batch_size = batch_size.max(1);
    let total = items.len();
    let mut results = Vec::with_capacity(total);

    let mut batch = Vec::with_capacity(batch_size);
    let mut remaining = items.into_iter();
    let mut batch_index = 0usize;
    loop {
        batch.clear();
        batch.extend(remaining.by_ref().take(batch_size));
        if batch.is_empty() {
            break;
        }
        batch_index += 1;
        tracing::info!(
            "processing batch {batch_index} ({} of {total} items)",
            batch.len()
        );
        let outcomes = join_all(batch.drain(..).map(&worker)).await;
        results.extend(outcomes);
    }

    let failures = results.iter().filter(|r| r.is_err()).count();
    if failures > 0 {
        tracing::warn!("{failures} of {total} items failed");
    }
    results
}
