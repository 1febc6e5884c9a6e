//! Background feeding of a fixed payload into a process input stream.

use crate::result::StdinReport;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Upper bound on the number of bytes handed to a single write.
pub(crate) const MAX_CHUNK_LEN: usize = 4096;

/// Writes a pre-supplied payload into a writable stream on a background task,
/// in chunks of at most [`MAX_CHUNK_LEN`] bytes, then closes the stream to
/// signal end-of-input.
///
/// A peer that stops reading before the payload is exhausted (broken pipe) is
/// an expected outcome, not an error; it only shows up in the transfer
/// counters. Progress can be queried at any time, including mid-transfer.
#[derive(Debug)]
pub(crate) struct Feed {
    total: usize,
    sent: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
}

impl Feed {
    pub(crate) fn spawn<W>(stream: W, payload: Bytes) -> Feed
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let total = payload.len();
        let sent = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(feed_chunks(stream, payload, Arc::clone(&sent)));
        Feed {
            total,
            sent,
            task: Some(task),
        }
    }

    /// Non-blocking. True once the payload was fully written and the stream
    /// closed, or once the peer closed its read end.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// Bytes written so far. Valid at any time.
    pub(crate) fn bytes_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed).min(self.total)
    }

    /// Bytes of the payload not yet written. Valid at any time.
    pub(crate) fn bytes_remaining(&self) -> usize {
        self.total - self.bytes_sent()
    }

    /// Snapshot of the transfer state, consistent even mid-transfer.
    pub(crate) fn report(&self) -> StdinReport {
        let bytes_sent = self.bytes_sent();
        StdinReport {
            bytes_sent,
            bytes_remaining: self.total - bytes_sent,
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn feed_chunks<W: AsyncWrite + Unpin>(mut stream: W, payload: Bytes, sent: Arc<AtomicUsize>) {
    let mut pos = 0;
    while pos < payload.len() {
        let end = usize::min(pos + MAX_CHUNK_LEN, payload.len());
        match stream.write_all(&payload[pos..end]).await {
            Ok(()) => {
                pos = end;
                sent.store(pos, Ordering::Relaxed);
            }
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                // The process exited (or closed its stdin) without reading
                // the entire payload.
                tracing::debug!(
                    remaining = payload.len() - pos,
                    "Input reader closed its end early"
                );
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Write error while feeding process input");
                break;
            }
        }
    }
    // Closing signals end-of-input to the reader.
    if let Err(err) = stream.shutdown().await {
        if err.kind() != io::ErrorKind::BrokenPipe {
            tracing::warn!(error = %err, "Failed to close process input stream");
        }
    }
}
