use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Peer-reported JSON-RPC failure carried in a response `error` object.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const VM_FAILED: i64 = -32000;
    pub const EXEC_FAILED: i64 = -32001;
    pub const FILE_FAILED: i64 = -32002;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_vm_error(&self) -> bool {
        self.code == Self::VM_FAILED
    }

    pub fn is_exec_error(&self) -> bool {
        self.code == Self::EXEC_FAILED
    }

    pub fn is_file_error(&self) -> bool {
        self.code == Self::FILE_FAILED
    }
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SandboxError {
    #[error("supervisor process not running")]
    NotRunning,
    #[error("supervisor closed unexpectedly")]
    ClosedUnexpectedly,
    #[error("request timed out")]
    Timeout,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("blocked operation: op={op} path={path} hook={hook}")]
    HookBlocked {
        op: String,
        path: String,
        hook: String,
    },
    #[error("hook {hook} failed: {message}")]
    HookFailed { hook: String, message: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure reported by a user-supplied hook callback.
/// The dispatcher logs and swallows these for event hooks; action and
/// mutate hooks surface them to the VFS caller as `HookFailed`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}
