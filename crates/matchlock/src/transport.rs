use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::errors::SandboxError;
use crate::types::Config;

/// Build the supervisor launch command: `[binary_path, "rpc"]`, prefixed
/// with `sudo` when configured.
pub(crate) fn supervisor_command(config: &Config) -> Command {
    let mut command = if config.use_sudo {
        let mut command = Command::new("sudo");
        command.arg(&config.binary_path);
        command
    } else {
        Command::new(&config.binary_path)
    };
    command.arg("rpc");
    command
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TransportConfig {
    pub read_channel_capacity: usize,
    pub write_channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_channel_capacity: 1024,
            write_channel_capacity: 1024,
        }
    }
}

/// Supervisor subprocess plus its reader and writer tasks. stdin and stdout
/// are pipes; stderr is discarded. The writer task is the only stdin
/// mutation point; the reader task is the only stdout consumer.
pub(crate) struct StdioTransport {
    write_tx: Option<mpsc::Sender<Value>>,
    read_rx: Option<mpsc::Receiver<Value>>,
    malformed_line_count: Arc<AtomicU64>,
    reader_task: Option<JoinHandle<std::io::Result<()>>>,
    writer_task: Option<JoinHandle<std::io::Result<()>>>,
    child: Option<Child>,
    child_exit_status: Option<ExitStatus>,
}

impl StdioTransport {
    pub(crate) fn spawn(
        mut command: Command,
        config: TransportConfig,
    ) -> Result<Self, SandboxError> {
        if config.read_channel_capacity == 0 || config.write_channel_capacity == 0 {
            return Err(SandboxError::InvalidConfig(
                "transport channel capacities must be non-zero".to_owned(),
            ));
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|err| SandboxError::Internal(format!("failed to spawn supervisor: {err}")))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SandboxError::Internal("supervisor spawned without a stdin pipe".to_owned())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::Internal("supervisor spawned without a stdout pipe".to_owned())
        })?;

        let (write_tx, write_rx) = mpsc::channel(config.write_channel_capacity);
        let (read_tx, read_rx) = mpsc::channel(config.read_channel_capacity);
        let malformed_line_count = Arc::new(AtomicU64::new(0));
        let malformed_line_count_clone = Arc::clone(&malformed_line_count);

        let reader_task = tokio::spawn(reader_loop(stdout, read_tx, malformed_line_count_clone));
        let writer_task = tokio::spawn(writer_loop(write_rx, stdin));

        Ok(Self {
            write_tx: Some(write_tx),
            read_rx: Some(read_rx),
            malformed_line_count,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
            child: Some(child),
            child_exit_status: None,
        })
    }

    pub(crate) fn write_tx(&self) -> Result<mpsc::Sender<Value>, SandboxError> {
        self.write_tx
            .as_ref()
            .cloned()
            .ok_or_else(|| SandboxError::Internal("write sender missing from transport".to_owned()))
    }

    pub(crate) fn take_read_rx(&mut self) -> Result<mpsc::Receiver<Value>, SandboxError> {
        self.read_rx.take().ok_or_else(|| {
            SandboxError::Internal("read receiver already taken from transport".to_owned())
        })
    }

    pub(crate) fn malformed_line_count(&self) -> u64 {
        self.malformed_line_count.load(Ordering::Relaxed)
    }

    /// Probe the child without blocking; the status is cached once observed
    /// so later callers need no live child handle.
    pub(crate) fn try_wait_exit(&mut self) -> Result<Option<ExitStatus>, SandboxError> {
        if self.child_exit_status.is_none() {
            if let Some(child) = self.child.as_mut() {
                self.child_exit_status = child.try_wait().map_err(|err| {
                    SandboxError::Internal(format!("supervisor status probe failed: {err}"))
                })?;
            }
        }
        Ok(self.child_exit_status)
    }

    #[cfg(test)]
    pub(crate) async fn join(mut self) -> Result<ExitStatus, SandboxError> {
        drop(self.read_rx.take());
        drop(self.write_tx.take());

        join_io_task(self.writer_task.take(), "writer").await?;
        join_io_task(self.reader_task.take(), "reader").await?;
        reap_child(&mut self, None).await
    }

    /// Shutdown path used by `Client::close`: close the outbound queue
    /// (which closes stdin once drained), bound the writer flush, wait for
    /// graceful child exit, force-kill on expiry, then join the reader.
    pub(crate) async fn terminate_and_join(
        mut self,
        flush_timeout: Duration,
        terminate_grace: Duration,
    ) -> Result<(), SandboxError> {
        drop(self.read_rx.take());
        drop(self.write_tx.take());

        let mut writer_task = self.writer_task.take().ok_or_else(|| {
            SandboxError::Internal("transport writer task already joined".to_owned())
        })?;

        // Bounded drain window. A writer wedged on a full pipe is freed by
        // reaping the child, so rejoin it after that.
        let writer_result = match timeout(flush_timeout, &mut writer_task).await {
            Ok(joined) => joined,
            Err(_) => {
                reap_child(&mut self, Some(terminate_grace)).await?;
                writer_task.await
            }
        };
        match writer_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(SandboxError::Internal(format!(
                    "supervisor writer pipe error: {err}"
                )));
            }
            Err(err) => {
                return Err(SandboxError::Internal(format!(
                    "supervisor writer task panicked: {err}"
                )));
            }
        }

        reap_child(&mut self, Some(terminate_grace)).await?;
        join_io_task(self.reader_task.take(), "reader").await
    }
}

async fn join_io_task(
    task: Option<JoinHandle<std::io::Result<()>>>,
    label: &str,
) -> Result<(), SandboxError> {
    match task {
        None => Err(SandboxError::Internal(format!(
            "transport {label} task already joined"
        ))),
        Some(task) => match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SandboxError::Internal(format!(
                "supervisor {label} pipe error: {err}"
            ))),
            Err(err) => Err(SandboxError::Internal(format!(
                "supervisor {label} task panicked: {err}"
            ))),
        },
    }
}

/// Collect the child's exit status. With a grace bound, a child still alive
/// when it expires is killed and reaped; without one, wait indefinitely.
async fn reap_child(
    transport: &mut StdioTransport,
    grace: Option<Duration>,
) -> Result<ExitStatus, SandboxError> {
    if let Some(status) = transport.try_wait_exit()? {
        return Ok(status);
    }
    let Some(child) = transport.child.as_mut() else {
        return Err(SandboxError::Internal(
            "supervisor child already reaped".to_owned(),
        ));
    };

    let waited = match grace {
        None => child.wait().await,
        Some(grace) => match timeout(grace, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                child.kill().await.map_err(|err| {
                    SandboxError::Internal(format!("could not kill supervisor: {err}"))
                })?;
                child.wait().await
            }
        },
    };

    let status = waited
        .map_err(|err| SandboxError::Internal(format!("could not reap supervisor: {err}")))?;
    transport.child_exit_status = Some(status);
    Ok(status)
}

/// Reader loop: feeds parsed JSON lines into the inbound channel until the
/// supervisor closes its stdout. Unparseable lines are counted and skipped.
async fn reader_loop(
    stdout: ChildStdout,
    inbound_tx: mpsc::Sender<Value>,
    malformed_line_count: Arc<AtomicU64>,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await? {
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }
        let Ok(json) = serde_json::from_str::<Value>(raw) else {
            malformed_line_count.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        if inbound_tx.send(json).await.is_err() {
            // Receiving side is gone; nothing left to deliver to.
            break;
        }
    }

    Ok(())
}

/// Writer loop: sole owner of supervisor stdin. One JSON object per line,
/// flushed per frame so a request is visible as soon as it is queued.
async fn writer_loop(
    mut outbound_rx: mpsc::Receiver<Value>,
    mut stdin: ChildStdin,
) -> std::io::Result<()> {
    let mut frame = Vec::<u8>::with_capacity(4096);

    while let Some(json) = outbound_rx.recv().await {
        frame.clear();
        serde_json::to_writer(&mut frame, &json).map_err(std::io::Error::other)?;
        frame.push(b'\n');

        match write_frame(&mut stdin, &frame).await {
            Ok(()) => {}
            // The supervisor hanging up mid-shutdown is a normal exit here.
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

async fn write_frame(stdin: &mut ChildStdin, frame: &[u8]) -> std::io::Result<()> {
    stdin.write_all(frame).await?;
    stdin.flush().await
}
