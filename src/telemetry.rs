//! Self-instrumentation through the `metrics` facade. Nothing is recorded
//! unless the host installs a recorder.

use crate::collect::CollectStatus;

pub const BLOCKS_ALLOCATED: &str = "shm_repository_blocks_allocated_total";
pub const LIVE_INSTANCES: &str = "shm_repository_live_instances";
pub const COLLECTIONS: &str = "shm_repository_collections_total";
pub const COLLECT_BYTES: &str = "shm_repository_collect_bytes";
pub const LOCK_TIMEOUTS: &str = "shm_repository_lock_timeouts_total";

/// Registers descriptions for every metric this crate emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        BLOCKS_ALLOCATED,
        "Shared memory blocks mapped by the provider."
    );
    metrics::describe_gauge!(LIVE_INSTANCES, "Counter instances currently alive.");
    metrics::describe_counter!(COLLECTIONS, "Collect requests served, by status.");
    metrics::describe_histogram!(
        COLLECT_BYTES,
        metrics::Unit::Bytes,
        "Bytes written by a single collect request."
    );
    metrics::describe_counter!(
        LOCK_TIMEOUTS,
        "Repository lock acquisitions that timed out."
    );
}

pub(crate) fn block_allocated() {
    metrics::counter!(BLOCKS_ALLOCATED).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn live_instances(live: usize) {
    metrics::gauge!(LIVE_INSTANCES).set(live as f64);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn collected(status: CollectStatus, bytes: usize) {
    let status = match status {
        CollectStatus::Success => "success",
        CollectStatus::MoreData => "more_data",
    };
    metrics::counter!(COLLECTIONS, "status" => status).increment(1);
    metrics::histogram!(COLLECT_BYTES).record(bytes as f64);
}

pub(crate) fn lock_timeout() {
    metrics::counter!(LOCK_TIMEOUTS).increment(1);
}
