use std::future::Future;

use tokio::time::{timeout, Duration};

use crate::errors::SandboxError;
use crate::hooks::{
    HookDecision, LocalCallback, LocalHookTables, VfsActionRequest, VfsMutateRequest,
};

pub(super) enum HookWait<T> {
    Done(T),
    TimedOut,
}

/// Await one hook callback under its optional time budget.
pub(super) async fn wait_hook<F>(limit: Option<Duration>, fut: F) -> HookWait<F::Output>
where
    F: Future,
{
    match limit {
        Some(limit) => match timeout(limit, fut).await {
            Ok(value) => HookWait::Done(value),
            Err(_) => HookWait::TimedOut,
        },
        None => HookWait::Done(fut.await),
    }
}

/// Run every matching action hook in declaration order. `Block` aborts the
/// VFS call before any RPC bytes are written; callback failures and
/// timeouts abort it too.
pub(super) async fn apply_action_hooks(
    tables: &LocalHookTables,
    op: &str,
    path: &str,
    size: u64,
    mode: u32,
) -> Result<(), SandboxError> {
    if tables.action_hooks.is_empty() {
        return Ok(());
    }

    let (uid, gid) = effective_uid_gid();
    let request = VfsActionRequest {
        op: op.to_owned(),
        path: path.to_owned(),
        size,
        mode,
        uid,
        gid,
    };

    for hook in &tables.action_hooks {
        if !hook.matches(op, path) {
            continue;
        }
        let LocalCallback::Action(callback) = &hook.callback else {
            continue;
        };

        let decision = match wait_hook(hook.timeout, callback.call(&request)).await {
            HookWait::Done(Ok(decision)) => decision,
            HookWait::Done(Err(err)) => {
                return Err(SandboxError::HookFailed {
                    hook: hook.name.clone(),
                    message: err.message,
                });
            }
            HookWait::TimedOut => {
                return Err(SandboxError::HookFailed {
                    hook: hook.name.clone(),
                    message: "timed out".to_owned(),
                });
            }
        };

        match decision {
            HookDecision::Allow => {}
            HookDecision::Block => {
                return Err(SandboxError::HookBlocked {
                    op: op.to_owned(),
                    path: path.to_owned(),
                    hook: hook.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Thread the payload through every matching mutate hook in declaration
/// order; each hook sees the previous hook's output via `size`.
pub(super) async fn apply_mutate_hooks(
    tables: &LocalHookTables,
    path: &str,
    content: Vec<u8>,
    mode: u32,
) -> Result<Vec<u8>, SandboxError> {
    if tables.mutate_hooks.is_empty() {
        return Ok(content);
    }

    let (uid, gid) = effective_uid_gid();
    let mut content = content;

    for hook in &tables.mutate_hooks {
        if !hook.matches("write", path) {
            continue;
        }
        let LocalCallback::Mutate(callback) = &hook.callback else {
            continue;
        };

        let request = VfsMutateRequest {
            path: path.to_owned(),
            size: content.len() as u64,
            mode,
            uid,
            gid,
        };
        match wait_hook(hook.timeout, callback.call(&request)).await {
            HookWait::Done(Ok(Some(output))) => content = output.into_bytes(),
            HookWait::Done(Ok(None)) => {}
            HookWait::Done(Err(err)) => {
                return Err(SandboxError::HookFailed {
                    hook: hook.name.clone(),
                    message: err.message,
                });
            }
            HookWait::TimedOut => {
                return Err(SandboxError::HookFailed {
                    hook: hook.name.clone(),
                    message: "timed out".to_owned(),
                });
            }
        }
    }
    Ok(content)
}

/// Host effective uid/gid for hook requests; 0 where the platform has none.
#[cfg(unix)]
pub(super) fn effective_uid_gid() -> (u32, u32) {
    (
        nix::unistd::geteuid().as_raw(),
        nix::unistd::getegid().as_raw(),
    )
}

#[cfg(not(unix))]
pub(super) fn effective_uid_gid() -> (u32, u32) {
    (0, 0)
}
