pub mod builder;
pub mod client;
pub mod errors;
pub mod hooks;
pub mod metrics;
pub(crate) mod rpc;
pub mod sink;
pub(crate) mod transport;
pub mod types;

pub use builder::Sandbox;
pub use client::{Client, ExecStreamSinks};
pub use errors::{HookError, RpcError, SandboxError, SinkError};
pub use hooks::{
    action_hook_fn, dangerous_hook_fn, event_hook_fn, mutate_hook_fn, ActionHook,
    DangerousEventHook, EventHook, HookAction, HookDecision, HookFuture, MutateHook, MutateOutput,
    VfsActionRequest, VfsHookEvent, VfsHookPhase, VfsHookRule, VfsInterceptionConfig,
    VfsMutateRequest, VfsOp, WireInterception, WireRule,
};
pub use metrics::ClientMetricsSnapshot;
pub use sink::{BufferSink, ByteSink, SinkFuture, WriterSink};
pub use types::{
    Config, CreateOptions, ExecResult, ExecStreamResult, FileInfo, ImageConfig, MountConfig,
    MountType, Secret, MATCHLOCK_BIN_ENV,
};
