use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::SandboxError;
use crate::hooks::{LocalCallback, LocalHook, VfsHookEvent};
use crate::rpc::{classify_message, map_rpc_error, notification_method, response_id, MsgKind};

use super::vfs::{wait_hook, HookWait};
use super::{read_lock, Client, ClientInner};

#[derive(Clone, Copy)]
enum StreamChannel {
    Stdout,
    Stderr,
}

/// Consume the transport read channel until EOF: responses resolve pending
/// waiters, notifications fan out to stream sinks and event hooks. On EOF
/// every pending entry fails with `ClosedUnexpectedly` and the table is
/// cleared.
pub(super) async fn dispatcher_loop(inner: Arc<ClientInner>, mut read_rx: mpsc::Receiver<Value>) {
    while let Some(json) = read_rx.recv().await {
        match classify_message(&json) {
            MsgKind::Response => handle_response(&inner, &json).await,
            MsgKind::Notification => handle_notification(&inner, &json).await,
            MsgKind::Unknown => {}
        }
    }
    resolve_closed_pending(&inner).await;
}

async fn handle_response(inner: &Arc<ClientInner>, json: &Value) {
    let Some(id) = response_id(json) else {
        return;
    };
    // Unknown ids are dropped: either the waiter timed out and unregistered,
    // or this is the reply to a fire-and-forget cancel.
    let Some(entry) = inner.pending.lock().await.remove(&id) else {
        return;
    };
    inner.metrics.dec_pending_rpc();
    inner.metrics.record_response_matched();

    let outcome = match json.get("error").filter(|error| !error.is_null()) {
        Some(error) => Err(SandboxError::Rpc(map_rpc_error(error))),
        None => Ok(json.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = entry.tx.send(outcome);
}

async fn handle_notification(inner: &Arc<ClientInner>, json: &Value) {
    inner.metrics.record_notification();
    match notification_method(json) {
        Some("exec_stream.stdout") => {
            forward_stream_chunk(inner, json, StreamChannel::Stdout).await;
        }
        Some("exec_stream.stderr") => {
            forward_stream_chunk(inner, json, StreamChannel::Stderr).await;
        }
        Some("event") => dispatch_event(inner, json),
        _ => {}
    }
}

/// Forward one decoded chunk to the originating call's sink. Runs on the
/// dispatcher task, so chunks for one call arrive in wire order.
async fn forward_stream_chunk(inner: &Arc<ClientInner>, json: &Value, channel: StreamChannel) {
    let Some(params) = json.get("params") else {
        return;
    };
    let Some(id) = params.get("id").and_then(Value::as_u64) else {
        return;
    };
    let sinks = inner
        .pending
        .lock()
        .await
        .get(&id)
        .and_then(|entry| entry.stream.clone());
    let Some(sinks) = sinks else {
        return;
    };
    let sink = match channel {
        StreamChannel::Stdout => sinks.stdout,
        StreamChannel::Stderr => sinks.stderr,
    };
    let Some(sink) = sink else {
        return;
    };

    let Some(data) = params.get("data").and_then(Value::as_str) else {
        return;
    };
    let bytes = match BASE64.decode(data) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!(id, error = %err, "dropping stream chunk with invalid base64");
            return;
        }
    };

    inner.metrics.record_stream_chunk();
    if let Err(err) = sink.write(&bytes).await {
        tracing::debug!(id, error = %err, "stream sink write failed");
    }
}

/// Route one `event` notification to the local after-hooks.
///
/// Dangerous hooks each get their own task immediately and may re-enter the
/// SDK. Safe hooks run as one ordered batch behind the re-entrancy guard;
/// a batch arriving while the guard is set is dropped to stop event-driven
/// recursion from growing the stack.
pub(super) fn dispatch_event(inner: &Arc<ClientInner>, json: &Value) {
    let Some(file) = json.get("params").and_then(|params| params.get("file")) else {
        return;
    };
    let Ok(mut event) = serde_json::from_value::<VfsHookEvent>(file.clone()) else {
        return;
    };
    event.op = event.op.to_ascii_lowercase();

    let tables = Arc::clone(&read_lock(&inner.hooks));
    let mut safe_batch = Vec::new();
    for (index, hook) in tables.event_hooks.iter().enumerate() {
        if !hook.matches(&event.op, &event.path) {
            continue;
        }
        if hook.is_dangerous() {
            let task_inner = Arc::clone(inner);
            let task_tables = Arc::clone(&tables);
            let task_event = event.clone();
            tokio::spawn(async move {
                run_event_hook(&task_inner, &task_tables.event_hooks[index], &task_event).await;
            });
        } else {
            safe_batch.push(index);
        }
    }
    inner.metrics.record_event_dispatched();

    if safe_batch.is_empty() {
        return;
    }
    if inner
        .safe_hook_entered
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        inner.metrics.record_safe_batch_dropped();
        tracing::debug!(
            op = %event.op,
            path = %event.path,
            "dropping safe event batch: re-entrancy guard is set"
        );
        return;
    }

    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        let _guard = SafeGuardReset {
            inner: Arc::clone(&task_inner),
        };
        for index in safe_batch {
            run_event_hook(&task_inner, &tables.event_hooks[index], &event).await;
        }
    });
}

/// Clears the safe-hook guard on every exit path of the batch task.
struct SafeGuardReset {
    inner: Arc<ClientInner>,
}

impl Drop for SafeGuardReset {
    fn drop(&mut self) {
        self.inner.safe_hook_entered.store(false, Ordering::Release);
    }
}

/// Invoke one event hook. Failures and timeouts are logged and counted;
/// they never propagate past the hook task.
async fn run_event_hook(inner: &Arc<ClientInner>, hook: &LocalHook, event: &VfsHookEvent) {
    let outcome = match &hook.callback {
        LocalCallback::Event(callback) => wait_hook(hook.timeout, callback.call(event)).await,
        LocalCallback::Dangerous(callback) => {
            let client = Client::from_inner(Arc::clone(inner));
            wait_hook(hook.timeout, callback.call(client, event)).await
        }
        LocalCallback::Mutate(_) | LocalCallback::Action(_) => return,
    };

    match outcome {
        HookWait::Done(Ok(())) => {}
        HookWait::Done(Err(err)) => {
            inner.metrics.record_hook_callback_error();
            tracing::debug!(hook = %hook.name, error = %err, "event hook failed");
        }
        HookWait::TimedOut => {
            inner.metrics.record_hook_callback_error();
            tracing::debug!(hook = %hook.name, "event hook timed out");
        }
    }
}

async fn resolve_closed_pending(inner: &Arc<ClientInner>) {
    let mut pending = inner.pending.lock().await;
    for (_, entry) in pending.drain() {
        let _ = entry.tx.send(Err(SandboxError::ClosedUnexpectedly));
    }
    drop(pending);
    inner.metrics.set_pending_rpc_count(0);
}
