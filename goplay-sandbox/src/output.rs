//! Bounded capture of the child's output streams

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 8 * 1024;

/// Caps shared by the stdout and stderr collectors of one execution
#[derive(Debug, Clone)]
pub struct OutputBudget {
    per_stream: usize,
    combined_cap: usize,
    combined_used: Arc<AtomicUsize>,
    overflow: CancellationToken,
}

impl OutputBudget {
    pub fn new(per_stream: usize, combined_cap: usize) -> Self {
        Self {
            per_stream,
            combined_cap,
            combined_used: Arc::new(AtomicUsize::new(0)),
            overflow: CancellationToken::new(),
        }
    }

    /// Cancelled as soon as either stream goes over a cap
    pub fn overflow(&self) -> &CancellationToken {
        &self.overflow
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.is_cancelled()
    }

    /// Claim up to `want` bytes of the combined budget; returns what was granted
    fn reserve(&self, want: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .combined_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                granted = want.min(self.combined_cap.saturating_sub(used));
                Some(used + granted)
            });
        granted
    }

    /// Read `reader` to EOF into `sink`, keeping at most the capped number of bytes.
    ///
    /// Stops reading and trips the overflow token the moment a cap is exceeded.
    pub async fn capture<R>(&self, mut reader: R, sink: &CaptureBuffer) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }

            let stream_room = self.per_stream.saturating_sub(sink.len());
            let granted = self.reserve(n.min(stream_room));
            sink.append(&chunk[..granted]);

            if granted < n {
                self.overflow.cancel();
                return Ok(());
            }
        }
    }

    /// Collect `reader` on its own task
    pub fn spawn_capture<R>(&self, reader: Option<R>) -> StreamCapture
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = CaptureBuffer::default();
        let task = reader.map(|reader| {
            let budget = self.clone();
            let sink = buffer.clone();
            tokio::spawn(async move { budget.capture(reader, &sink).await })
        });
        StreamCapture { buffer, task }
    }
}

/// Bytes read from one stream so far, readable while the collector still runs
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }
}

/// How a stream collector ended
#[derive(Debug)]
pub enum CaptureEnd {
    /// The pipe reached EOF or a cap
    Complete,
    Failed(io::Error),
    /// The pipe was still open at the drain deadline
    Abandoned,
}

/// A running collector for one stream
#[derive(Debug)]
pub struct StreamCapture {
    buffer: CaptureBuffer,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl StreamCapture {
    /// Wait for the collector until `until`.
    ///
    /// On expiry the collector is stopped and the bytes it already read are kept.
    pub async fn finish(self, until: Instant) -> (Vec<u8>, CaptureEnd) {
        let end = match self.task {
            None => CaptureEnd::Complete,
            Some(mut task) => match tokio::time::timeout_at(until, &mut task).await {
                Ok(Ok(Ok(()))) => CaptureEnd::Complete,
                Ok(Ok(Err(e))) => CaptureEnd::Failed(e),
                Ok(Err(e)) => CaptureEnd::Failed(io::Error::new(io::ErrorKind::Other, e)),
                Err(_) => {
                    task.abort();
                    CaptureEnd::Abandoned
                }
            },
        };
        (self.buffer.take(), end)
    }
}
