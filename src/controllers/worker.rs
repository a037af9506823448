//! Workers draining a work queue into a reconciler

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconcilers::{SyncResult, Syncer};

/// Sync one key and schedule its next sync.
///
/// Returns `false` once the queue is shut down and drained.
pub async fn process_next_item(queue: &Arc<WorkQueue>, syncer: &dyn Syncer) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    let kind = syncer.kind();

    let timer = metrics::RECONCILE_DURATION
        .with_label_values(&[kind])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[kind]).inc();
    let result = syncer.sync(&key).await;
    timer.observe_duration();
    metrics::SYNC_RESULTS
        .with_label_values(&[kind, result.label()])
        .inc();

    match result {
        SyncResult::Succ => {
            debug!(kind, key = %key, "Synced");
            queue.forget(&key);
        }
        SyncResult::Periodic(period) => {
            debug!(kind, key = %key, ?period, "Synced, next periodic sync scheduled");
            queue.forget(&key);
            queue.add_after(key.clone(), period);
        }
        SyncResult::Running(delay) => {
            debug!(kind, key = %key, ?delay, "Operation in progress");
            queue.forget(&key);
            queue.add_after(key.clone(), delay);
        }
        SyncResult::Fail { retry_after, reason } => {
            info!(kind, key = %key, reason = %reason, ?retry_after, "Operation failed, will retry");
            queue.forget(&key);
            queue.add_after(key.clone(), retry_after);
        }
        SyncResult::Error(e) => {
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[kind])
                .inc();
            error!(
                kind,
                key = %key,
                error = %e,
                retries = queue.num_requeues(&key),
                "Sync failed"
            );
            queue.add_rate_limited(&key);
        }
    }
    queue.done(&key);
    true
}

/// Spawn `workers` tasks syncing keys from `queue` until it shuts down
pub fn spawn_workers(
    queue: Arc<WorkQueue>,
    syncer: Arc<dyn Syncer>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let syncer = Arc::clone(&syncer);
            tokio::spawn(async move {
                while process_next_item(&queue, syncer.as_ref()).await {}
            })
        })
        .collect()
}
