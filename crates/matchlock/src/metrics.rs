use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetricsSnapshot {
    pub requests_sent: u64,
    pub responses_matched: u64,
    pub pending_rpc_count: u64,
    pub notifications_seen: u64,
    pub stream_chunks_forwarded: u64,
    pub events_dispatched: u64,
    pub safe_batches_dropped: u64,
    pub hook_callback_errors: u64,
}

/// Client counters for snapshots and regression checks.
/// All counters are lock-free atomics; hot paths must remain O(1).
pub(crate) struct ClientMetrics {
    requests_sent: AtomicU64,
    responses_matched: AtomicU64,
    pending_rpc_count: AtomicU64,
    notifications_seen: AtomicU64,
    stream_chunks_forwarded: AtomicU64,
    events_dispatched: AtomicU64,
    safe_batches_dropped: AtomicU64,
    hook_callback_errors: AtomicU64,
}

impl ClientMetrics {
    pub(crate) fn new() -> Self {
        Self {
            requests_sent: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            pending_rpc_count: AtomicU64::new(0),
            notifications_seen: AtomicU64::new(0),
            stream_chunks_forwarded: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            safe_batches_dropped: AtomicU64::new(0),
            hook_callback_errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_pending_rpc(&self) {
        self.pending_rpc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement; EOF cleanup may race individual waiters.
    pub(crate) fn dec_pending_rpc(&self) {
        saturating_dec(&self.pending_rpc_count);
    }

    pub(crate) fn set_pending_rpc_count(&self, count: u64) {
        self.pending_rpc_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn record_notification(&self) {
        self.notifications_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stream_chunk(&self) {
        self.stream_chunks_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_safe_batch_dropped(&self) {
        self.safe_batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hook_callback_error(&self) {
        self.hook_callback_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            pending_rpc_count: self.pending_rpc_count.load(Ordering::Relaxed),
            notifications_seen: self.notifications_seen.load(Ordering::Relaxed),
            stream_chunks_forwarded: self.stream_chunks_forwarded.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            safe_batches_dropped: self.safe_batches_dropped.load(Ordering::Relaxed),
            hook_callback_errors: self.hook_callback_errors.load(Ordering::Relaxed),
        }
    }
}

fn saturating_dec(v: &AtomicU64) {
    let mut current = v.load(Ordering::Relaxed);
    loop {
        if current == 0 {
            return;
        }
        match v.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(next) => current = next,
        }
    }
}
