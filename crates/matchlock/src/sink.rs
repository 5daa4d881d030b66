use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::SinkError;

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Destination for decoded `exec_stream` output bytes. Chunks arrive in
/// wire order from the dispatcher task; implementations must tolerate
/// being flushed after every chunk.
pub trait ByteSink: Send + Sync + 'static {
    /// Consume one decoded chunk.
    /// Side effects: sink-specific I/O. Complexity depends on implementation.
    fn write<'a>(&'a self, chunk: &'a [u8]) -> SinkFuture<'a>;
}

/// Shared in-memory sink, mainly for tests and short captures.
#[derive(Clone, Debug, Default)]
pub struct BufferSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        match self.buffer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl ByteSink for BufferSink {
    fn write<'a>(&'a self, chunk: &'a [u8]) -> SinkFuture<'a> {
        Box::pin(async move {
            match self.buffer.lock() {
                Ok(mut guard) => guard.extend_from_slice(chunk),
                Err(poisoned) => poisoned.into_inner().extend_from_slice(chunk),
            }
            Ok(())
        })
    }
}

/// Adapter over any async writer (stdout, a file, a pipe), flushed per
/// chunk so streamed output is visible immediately.
pub struct WriterSink<W> {
    writer: Arc<tokio::sync::Mutex<W>>,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        }
    }
}

impl<W> ByteSink for WriterSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn write<'a>(&'a self, chunk: &'a [u8]) -> SinkFuture<'a> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(chunk)
                .await
                .map_err(|err| SinkError::Io(err.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|err| SinkError::Io(err.to_string()))?;
            Ok(())
        })
    }
}
