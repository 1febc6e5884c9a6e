//! Background capture of one process output stream.

use crate::error::DrainError;
use bytes::{Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

/// The size of the buffer used when reading from the stream in bytes.
pub(crate) const READ_BUFFER_SIZE: usize = 32 * 1024;

/// The size of an individual chunk read from the read buffer in bytes.
pub(crate) const CHUNK_SIZE: usize = 16 * 1024;

/// Identifies which output stream of the process a drain captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamName::Stdout => f.write_str("stdout"),
            StreamName::Stderr => f.write_str("stderr"),
        }
    }
}

/// Continuously consumes a readable stream on a background task so that the
/// process writing to it is never blocked on a full pipe.
///
/// Everything read is accumulated in order. Once end-of-stream is observed,
/// the buffer can be taken exactly once via [`Drain::take_output`]. Taking it
/// earlier, or a second time, is a caller error and fails loudly instead of
/// handing out partial or stale data.
#[derive(Debug)]
pub(crate) struct Drain {
    name: StreamName,
    task: Option<JoinHandle<Bytes>>,
}

impl Drain {
    /// Starts draining `stream`. When `echo` is set, every chunk is also
    /// mirrored to this process' own stdout/stderr as it arrives.
    pub(crate) fn spawn<S>(stream: S, name: StreamName, echo: bool) -> Drain
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stream);
            let mut captured = BytesMut::new();
            let mut scratch = BytesMut::with_capacity(CHUNK_SIZE);
            loop {
                match reader.read_buf(&mut scratch).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let chunk = scratch.split().freeze();
                        captured.extend_from_slice(&chunk);
                        if echo {
                            if let Err(err) = echo_chunk(name, &chunk).await {
                                tracing::warn!(stream = %name, error = %err, "Failed to echo chunk");
                            }
                        }
                    }
                    Err(err) => {
                        // Treated as end-of-stream; whatever was captured so
                        // far remains available.
                        tracing::warn!(stream = %name, error = %err, "Read error on stream");
                        break;
                    }
                }
            }
            captured.freeze()
        });
        Drain {
            name,
            task: Some(task),
        }
    }

    /// Non-blocking. True once end-of-stream was observed (or the buffer was
    /// already consumed). The owning process may well still be running.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// One-shot retrieval of the captured bytes. Only valid once
    /// [`Drain::is_finished`] reports true; the session is invalidated
    /// afterwards.
    pub(crate) async fn take_output(&mut self) -> Result<Bytes, DrainError> {
        let Some(task) = self.task.as_ref() else {
            return Err(DrainError::AlreadyConsumed { stream: self.name });
        };
        if !task.is_finished() {
            return Err(DrainError::StillActive { stream: self.name });
        }
        let task = self.task.take().expect("checked right above");
        // The task has finished, so this resolves immediately.
        task.await.map_err(|source| DrainError::TaskJoin {
            stream: self.name,
            source,
        })
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn echo_chunk(name: StreamName, chunk: &[u8]) -> std::io::Result<()> {
    match name {
        StreamName::Stdout => {
            let mut out = tokio::io::stdout();
            out.write_all(chunk).await?;
            out.flush().await
        }
        StreamName::Stderr => {
            let mut err = tokio::io::stderr();
            err.write_all(chunk).await?;
            err.flush().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Drain, StreamName};
    use crate::error::DrainError;
    use assertr::prelude::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
    use tokio::time::sleep;

    async fn await_finished(drain: &Drain) {
        for _ in 0..500 {
            if drain.is_finished() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("drain did not reach end-of-stream in time");
    }

    #[tokio::test]
    async fn captures_all_bytes_in_order() {
        let (read_half, mut write_half) = tokio::io::duplex(64);
        let mut drain = Drain::spawn(read_half, StreamName::Stdout, false);

        write_half.write_all(b"first\n").await.unwrap();
        sleep(Duration::from_millis(20)).await;
        write_half.write_all(b"second\n").await.unwrap();
        sleep(Duration::from_millis(20)).await;
        write_half.write_all(b"no trailing newline").await.unwrap();
        drop(write_half);

        await_finished(&drain).await;
        let output = drain.take_output().await.unwrap();
        assert_that(output.as_ref()).is_equal_to(b"first\nsecond\nno trailing newline".as_slice());
    }

    #[tokio::test]
    async fn take_output_before_end_of_stream_fails() {
        let (read_half, mut write_half) = tokio::io::duplex(64);
        let mut drain = Drain::spawn(read_half, StreamName::Stderr, false);

        write_half.write_all(b"still going\n").await.unwrap();
        sleep(Duration::from_millis(20)).await;

        assert_that(drain.is_finished()).is_false();
        let err = drain.take_output().await.unwrap_err();
        assert_that(matches!(err, DrainError::StillActive { stream: StreamName::Stderr })).is_true();

        // The session stays intact; finishing the stream makes it readable.
        drop(write_half);
        await_finished(&drain).await;
        let output = drain.take_output().await.unwrap();
        assert_that(output.as_ref()).is_equal_to(b"still going\n".as_slice());
    }

    #[tokio::test]
    async fn take_output_twice_fails() {
        let (read_half, write_half) = tokio::io::duplex(64);
        drop(write_half);
        let mut drain = Drain::spawn(read_half, StreamName::Stdout, false);

        await_finished(&drain).await;
        drain.take_output().await.unwrap();

        let err = drain.take_output().await.unwrap_err();
        assert_that(matches!(err, DrainError::AlreadyConsumed { stream: StreamName::Stdout }))
            .is_true();
    }

    /// Yields one chunk of data, then fails every subsequent read.
    struct FailAfterFirstRead {
        data: Option<&'static [u8]>,
    }

    impl AsyncRead for FailAfterFirstRead {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(std::io::Error::other("read failure"))),
            }
        }
    }

    #[tokio::test]
    async fn read_error_is_treated_as_end_of_stream() {
        let stream = FailAfterFirstRead {
            data: Some(b"partial"),
        };
        let mut drain = Drain::spawn(stream, StreamName::Stdout, false);

        await_finished(&drain).await;
        let output = drain.take_output().await.unwrap();
        assert_that(output.as_ref()).is_equal_to(b"partial".as_slice());
    }
}
