use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::builder::Sandbox;
use crate::errors::SandboxError;
use crate::hooks::{compile_interception, LocalHookTables};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::sink::ByteSink;
use crate::transport::{supervisor_command, StdioTransport, TransportConfig};
use crate::types::{Config, CreateOptions, ExecResult, ExecStreamResult, FileInfo};

mod dispatch;
mod vfs;

const DEFAULT_FILE_MODE: u32 = 0o644;
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) type PendingResult = Result<Value, SandboxError>;

/// Caller-supplied destinations for one `exec_stream` call. The SDK writes
/// to them only for the duration of that call, from the dispatcher task.
#[derive(Clone, Default)]
pub struct ExecStreamSinks {
    pub stdout: Option<Arc<dyn ByteSink>>,
    pub stderr: Option<Arc<dyn ByteSink>>,
}

impl std::fmt::Debug for ExecStreamSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStreamSinks")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

impl ExecStreamSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, sink: Arc<dyn ByteSink>) -> Self {
        self.stdout = Some(sink);
        self
    }

    pub fn with_stderr(mut self, sink: Arc<dyn ByteSink>) -> Self {
        self.stderr = Some(sink);
        self
    }
}

/// One in-flight request: the waiter's completion channel plus the optional
/// notification sinks used by `exec_stream` fan-out.
struct PendingRequest {
    tx: oneshot::Sender<PendingResult>,
    stream: Option<ExecStreamSinks>,
}

struct ClientInner {
    config: Config,
    started: AtomicBool,
    closing: AtomicBool,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    outbound_tx: ArcSwapOption<tokio::sync::mpsc::Sender<Value>>,
    transport: Mutex<Option<StdioTransport>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    hooks: RwLock<Arc<LocalHookTables>>,
    safe_hook_entered: AtomicBool,
    vm_id: RwLock<Option<String>>,
    last_vm_id: RwLock<Option<String>>,
    metrics: Arc<ClientMetrics>,
}

/// Client for a matchlock supervisor spoken to over line-delimited JSON-RPC
/// on the subprocess's stdio. Cheap to clone; all clones share one
/// subprocess, one reader task, and one request-id space.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client with the default config (`MATCHLOCK_BIN` or `matchlock`).
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                next_request_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                outbound_tx: ArcSwapOption::new(None),
                transport: Mutex::new(None),
                dispatcher_task: Mutex::new(None),
                hooks: RwLock::new(Arc::new(LocalHookTables::default())),
                safe_hook_entered: AtomicBool::new(false),
                vm_id: RwLock::new(None),
                last_vm_id: RwLock::new(None),
                metrics: Arc::new(ClientMetrics::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn vm_id(&self) -> Option<String> {
        read_lock(&self.inner.vm_id).clone()
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Spawn the supervisor subprocess and the dispatcher task. Idempotent
    /// while the process is alive.
    pub async fn start(&self) -> Result<(), SandboxError> {
        let mut transport_guard = self.inner.transport.lock().await;
        if transport_guard.is_some() {
            return Ok(());
        }

        let command = supervisor_command(&self.inner.config);
        let mut transport = StdioTransport::spawn(command, TransportConfig::default())?;
        let read_rx = transport.take_read_rx()?;
        let write_tx = transport.write_tx()?;

        self.inner.outbound_tx.store(Some(Arc::new(write_tx)));
        transport_guard.replace(transport);
        drop(transport_guard);

        let dispatcher_inner = Arc::clone(&self.inner);
        let task = tokio::spawn(dispatch::dispatcher_loop(dispatcher_inner, read_rx));
        self.inner.dispatcher_task.lock().await.replace(task);

        self.inner.closing.store(false, Ordering::Release);
        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Send one JSON-RPC request and wait for its response.
    ///
    /// On timeout the waiter unregisters and a fire-and-forget `cancel`
    /// carrying the original id is emitted; the supervisor's late reply, if
    /// any, is dropped by the dispatcher. The pending entry is removed on
    /// every exit path.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_duration: Option<Duration>,
    ) -> Result<Value, SandboxError> {
        self.send_request_inner(method, params, None, timeout_duration)
            .await
    }

    pub(crate) async fn send_request_inner(
        &self,
        method: &str,
        params: Option<Value>,
        stream: Option<ExecStreamSinks>,
        timeout_duration: Option<Duration>,
    ) -> Result<Value, SandboxError> {
        self.ensure_running().await?;
        let outbound_tx = self
            .inner
            .outbound_tx
            .load_full()
            .ok_or(SandboxError::NotRunning)?;

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (pending_tx, pending_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(
            request_id,
            PendingRequest {
                tx: pending_tx,
                stream,
            },
        );
        self.inner.metrics.inc_pending_rpc();

        let request = build_request(method, request_id, params);
        self.inner.metrics.record_request_sent();
        if outbound_tx.send(request).await.is_err() {
            self.remove_pending(request_id).await;
            return Err(SandboxError::ClosedUnexpectedly);
        }

        let waited = match timeout_duration {
            Some(duration) => match timeout(duration, pending_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.remove_pending(request_id).await;
                    self.send_cancel(request_id).await;
                    return Err(SandboxError::Timeout);
                }
            },
            None => pending_rx.await,
        };

        match waited {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SandboxError::ClosedUnexpectedly),
        }
    }

    /// Create and start a new sandbox VM; returns its id.
    ///
    /// Compiles the VFS hook config before any I/O, replaces the local hook
    /// tables wholesale once the supervisor confirms, and remembers the VM
    /// id for `remove`.
    pub async fn create(&self, opts: &CreateOptions) -> Result<String, SandboxError> {
        if opts.image.is_empty() {
            return Err(SandboxError::InvalidConfig("image is required".to_owned()));
        }
        let compiled = compile_interception(opts.vfs_interception.as_ref())?;
        self.set_hook_tables(LocalHookTables::default());

        let params = serde_json::to_value(opts.to_create_params(compiled.wire))
            .map_err(|err| SandboxError::Internal(format!("failed to encode create params: {err}")))?;
        let result = self
            .send_request_inner("create", Some(params), None, None)
            .await?;

        let vm_id = result
            .get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        *write_lock(&self.inner.vm_id) = vm_id.clone();
        let vm_id = vm_id
            .ok_or_else(|| SandboxError::Internal("create response missing vm id".to_owned()))?;

        self.set_hook_tables(compiled.tables);
        Ok(vm_id)
    }

    /// `create` with a builder's accumulated options.
    pub async fn launch(&self, sandbox: &Sandbox) -> Result<String, SandboxError> {
        self.create(sandbox.options()).await
    }

    /// Execute a command and collect its full output.
    pub async fn exec(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout_duration: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        let result = self
            .send_request_inner(
                "exec",
                Some(exec_params(command, working_dir)),
                None,
                timeout_duration,
            )
            .await?;
        let wire: ExecResultWire = decode_result("exec", result)?;
        Ok(ExecResult {
            exit_code: wire.exit_code,
            stdout: decode_b64_text("exec.stdout", &wire.stdout)?,
            stderr: decode_b64_text("exec.stderr", &wire.stderr)?,
            duration_ms: wire.duration_ms,
        })
    }

    /// Execute a command, streaming decoded output chunks to the caller's
    /// sinks as they arrive. The result carries only exit code and duration.
    pub async fn exec_stream(
        &self,
        command: &str,
        sinks: ExecStreamSinks,
        working_dir: Option<&str>,
        timeout_duration: Option<Duration>,
    ) -> Result<ExecStreamResult, SandboxError> {
        let result = self
            .send_request_inner(
                "exec_stream",
                Some(exec_params(command, working_dir)),
                Some(sinks),
                timeout_duration,
            )
            .await?;
        let wire: ExecStreamResultWire = decode_result("exec_stream", result)?;
        Ok(ExecStreamResult {
            exit_code: wire.exit_code,
            duration_ms: wire.duration_ms,
        })
    }

    /// Write a file into the VM's VFS with mode 0644.
    pub async fn write_file(
        &self,
        path: &str,
        content: impl Into<Vec<u8>>,
        timeout_duration: Option<Duration>,
    ) -> Result<(), SandboxError> {
        self.write_file_with_mode(path, content, DEFAULT_FILE_MODE, timeout_duration)
            .await
    }

    /// Write a file with an explicit mode. Local action hooks run first
    /// (op `write`), then mutate hooks rewrite the payload in declaration
    /// order; only then is the RPC emitted.
    pub async fn write_file_with_mode(
        &self,
        path: &str,
        content: impl Into<Vec<u8>>,
        mode: u32,
        timeout_duration: Option<Duration>,
    ) -> Result<(), SandboxError> {
        let content = content.into();
        let tables = self.hook_tables();
        vfs::apply_action_hooks(&tables, "write", path, content.len() as u64, mode).await?;
        let content = vfs::apply_mutate_hooks(&tables, path, content, mode).await?;

        let params = json!({
            "path": path,
            "content": BASE64.encode(&content),
            "mode": mode,
        });
        self.send_request_inner("write_file", Some(params), None, timeout_duration)
            .await?;
        Ok(())
    }

    /// Read a file from the VM's VFS. Local action hooks run first (op
    /// `read`).
    pub async fn read_file(
        &self,
        path: &str,
        timeout_duration: Option<Duration>,
    ) -> Result<Vec<u8>, SandboxError> {
        let tables = self.hook_tables();
        vfs::apply_action_hooks(&tables, "read", path, 0, 0).await?;

        let result = self
            .send_request_inner("read_file", Some(json!({"path": path})), None, timeout_duration)
            .await?;
        let wire: ReadFileWire = decode_result("read_file", result)?;
        decode_b64("read_file.content", &wire.content)
    }

    /// List a VFS directory. Local action hooks run first (op `readdir`).
    pub async fn list_files(
        &self,
        path: &str,
        timeout_duration: Option<Duration>,
    ) -> Result<Vec<FileInfo>, SandboxError> {
        let tables = self.hook_tables();
        vfs::apply_action_hooks(&tables, "readdir", path, 0, 0).await?;

        let result = self
            .send_request_inner("list_files", Some(json!({"path": path})), None, timeout_duration)
            .await?;
        let wire: ListFilesWire = decode_result("list_files", result)?;
        Ok(wire.files)
    }

    /// Close the sandbox and tear the subprocess down. Idempotent, and
    /// swallows every failure: this runs in cleanup paths.
    ///
    /// Records the VM id for a later `remove`, clears the hook tables so no
    /// further callbacks fire, best-effort sends `close`, closes stdin, and
    /// escalates to kill after `grace`.
    pub async fn close(&self, grace: Duration) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(id) = write_lock(&self.inner.vm_id).take() {
            *write_lock(&self.inner.last_vm_id) = Some(id);
        }
        self.set_hook_tables(LocalHookTables::default());

        let live = {
            let mut guard = self.inner.transport.lock().await;
            match guard.as_mut() {
                Some(transport) => matches!(transport.try_wait_exit(), Ok(None)),
                None => false,
            }
        };
        if live {
            // Ceiling, so a sub-second grace still reports one full second.
            let grace_seconds = grace.as_secs() + u64::from(grace.subsec_nanos() > 0);
            let params = json!({"timeout_seconds": grace_seconds});
            let _ = self
                .send_request_inner("close", Some(params), None, Some(grace))
                .await;
        }

        self.inner.started.store(false, Ordering::Release);
        self.inner.outbound_tx.store(None);

        if let Some(transport) = self.inner.transport.lock().await.take() {
            let _ = transport
                .terminate_and_join(SHUTDOWN_FLUSH_TIMEOUT, grace)
                .await;
        }
        if let Some(task) = self.inner.dispatcher_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Remove the VM's on-disk state by invoking the supervisor's `rm`
    /// subcommand. Legal whenever a VM id is known, current or last.
    pub async fn remove(&self) -> Result<(), SandboxError> {
        let vm_id = read_lock(&self.inner.vm_id)
            .clone()
            .or_else(|| read_lock(&self.inner.last_vm_id).clone());
        let Some(vm_id) = vm_id else {
            return Ok(());
        };

        let output = tokio::process::Command::new(&self.inner.config.binary_path)
            .args(["rm", vm_id.as_str()])
            .output()
            .await
            .map_err(|err| SandboxError::Internal(format!("failed to run rm {vm_id}: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Internal(format!(
                "rm {vm_id} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn ensure_running(&self) -> Result<(), SandboxError> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(SandboxError::NotRunning);
        }
        let mut guard = self.inner.transport.lock().await;
        match guard.as_mut() {
            Some(transport) => match transport.try_wait_exit()? {
                None => Ok(()),
                Some(_) => Err(SandboxError::NotRunning),
            },
            None => Err(SandboxError::NotRunning),
        }
    }

    async fn remove_pending(&self, request_id: u64) {
        if self
            .inner
            .pending
            .lock()
            .await
            .remove(&request_id)
            .is_some()
        {
            self.inner.metrics.dec_pending_rpc();
        }
    }

    /// Best-effort `cancel` under a fresh id with no waiter registered.
    async fn send_cancel(&self, target_id: u64) {
        let Some(outbound_tx) = self.inner.outbound_tx.load_full() else {
            return;
        };
        let cancel_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = build_request("cancel", cancel_id, Some(json!({"id": target_id})));
        self.inner.metrics.record_request_sent();
        let _ = outbound_tx.send(request).await;
    }

    pub(crate) fn hook_tables(&self) -> Arc<LocalHookTables> {
        Arc::clone(&read_lock(&self.inner.hooks))
    }

    fn set_hook_tables(&self, tables: LocalHookTables) {
        *write_lock(&self.inner.hooks) = Arc::new(tables);
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn build_request(method: &str, request_id: u64, params: Option<Value>) -> Value {
    let mut message = Map::new();
    message.insert("jsonrpc".to_owned(), Value::String("2.0".to_owned()));
    message.insert("method".to_owned(), Value::String(method.to_owned()));
    message.insert("id".to_owned(), Value::Number(request_id.into()));
    if let Some(params) = params {
        message.insert("params".to_owned(), params);
    }
    Value::Object(message)
}

fn exec_params(command: &str, working_dir: Option<&str>) -> Value {
    let mut params = Map::new();
    params.insert("command".to_owned(), Value::String(command.to_owned()));
    if let Some(dir) = working_dir.filter(|dir| !dir.is_empty()) {
        params.insert("working_dir".to_owned(), Value::String(dir.to_owned()));
    }
    Value::Object(params)
}

fn decode_result<T: for<'de> Deserialize<'de>>(
    method: &str,
    result: Value,
) -> Result<T, SandboxError> {
    serde_json::from_value(result)
        .map_err(|err| SandboxError::Internal(format!("malformed {method} result: {err}")))
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, SandboxError> {
    BASE64
        .decode(value)
        .map_err(|err| SandboxError::Internal(format!("invalid base64 in {field}: {err}")))
}

fn decode_b64_text(field: &str, value: &str) -> Result<String, SandboxError> {
    let bytes = decode_b64(field, value)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Deserialize)]
struct ExecResultWire {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Deserialize)]
struct ExecStreamResultWire {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Deserialize)]
struct ReadFileWire {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ListFilesWire {
    #[serde(default)]
    files: Vec<FileInfo>,
}

#[cfg(test)]
mod tests;
