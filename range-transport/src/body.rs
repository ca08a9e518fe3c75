//! The stitched response body: the ordered concatenation of every chunk's
//! FIFO, presented as one readable, cancellable byte stream.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    chunk::{Chunk, ChunkState},
    error::Error,
    Result,
};

/// Size of the scratch buffer used when this body is consumed as a
/// [`Stream`] rather than through [`StitchedBody::read`] directly.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// The ordered concatenation of a plan's chunks, presented as one readable
/// stream.
#[derive(Debug)]
pub struct StitchedBody {
    chunks: Vec<Arc<Chunk>>,
    total_size: u64,
    current: Mutex<usize>,
    delivered: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl StitchedBody {
    /// Build a stitched body over an ordered, already-planned chunk list.
    #[must_use]
    pub fn new(chunks: Vec<Arc<Chunk>>, total_size: u64, cancel: CancellationToken) -> Self {
        Self {
            chunks,
            total_size,
            current: Mutex::new(0),
            delivered: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    /// Total size of the resource this body reconstructs.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes delivered to the caller so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Read the next available bytes into `buf`, following the current
    /// chunk across completed-chunk boundaries transparently.
    ///
    /// Returns `Ok(0)` only once every chunk has drained. A single call
    /// returns as soon as any byte is available from the current chunk; it
    /// does not block trying to fill `buf` completely.
    ///
    /// # Errors
    ///
    /// - [`Error::BodyClosed`] if [`StitchedBody::close`] was already called.
    /// - [`Error::Cancelled`] if the body's cancellation token fires.
    /// - [`Error::Chunk`] if the chunk currently being drained failed.
    /// - [`Error::ProtocolViolation`] if a chunk's FIFO signalled
    ///   end-of-stream while the chunk itself was neither `Completed` nor
    ///   `Failed` — a bug in the chunk/FIFO contract, not a user error.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BodyClosed);
        }

        loop {
            let idx = *self.current.lock().unwrap();

            if idx >= self.chunks.len() {
                return Ok(0);
            }

            let chunk = Arc::clone(&self.chunks[idx]);

            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                res = chunk.read(buf) => res,
            };

            // A FIFO read only fails on a genuine backing-file I/O error;
            // closing always surfaces as `Ok(0)`, handled below via state.
            let n = read.map_err(|e| Error::Chunk {
                index: idx,
                source: Arc::new(crate::error::ChunkError::Fifo(e)),
            })?;

            if n > 0 {
                self.delivered.fetch_add(n as u64, Ordering::Relaxed);
                return Ok(n);
            }

            // n == 0: the chunk's FIFO reports end-of-stream. Whether that's
            // a real EOF or a failure depends on the chunk's own state.
            match chunk.state() {
                ChunkState::Completed => {
                    *self.current.lock().unwrap() = idx + 1;
                    // loop again: either drain the next chunk or hit the
                    // final Ok(0) once every chunk has been consumed.
                }
                ChunkState::Failed(source) => {
                    return Err(Error::Chunk { index: idx, source });
                }
                ChunkState::NotStarted | ChunkState::Downloading => {
                    return Err(Error::ProtocolViolation { index: idx });
                }
            }
        }
    }

    /// Close the body: marks it closed and closes every chunk's FIFO,
    /// waking any blocked reader and releasing backing storage. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for chunk in &self.chunks {
            chunk.close();
        }
    }

    /// Adapt this body into a [`Stream`] of byte chunks, e.g. to feed
    /// [`reqwest::Body::wrap_stream`]. The stream ends after the first
    /// error; it does not retry.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::unfold(Some(self), |state| async move {
            let body = state?;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            match body.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(body)))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
