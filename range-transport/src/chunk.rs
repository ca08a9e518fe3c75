//! A single planned sub-range of the target resource, plus its FIFO and
//! download state.
use std::sync::{Arc, Mutex};

use fifo_pipe::Fifo;

use crate::{error::ChunkError, range::ClosedByteRange};

/// The lifecycle of a [`Chunk`]'s download.
///
/// Transitions are monotonic: `NotStarted -> Downloading -> (Completed |
/// Failed)`. A worker sets `Downloading` as the very first action, before
/// any I/O, so a reader can never observe `NotStarted` with a terminal
/// error already recorded.
#[derive(Debug, Clone)]
pub enum ChunkState {
    /// No worker has started downloading this chunk yet.
    NotStarted,
    /// A worker is actively downloading this chunk.
    Downloading,
    /// The chunk downloaded successfully; its FIFO is write-closed.
    Completed,
    /// The chunk's download failed; its FIFO is fully closed.
    Failed(Arc<ChunkError>),
}

/// One planned, contiguous byte range of the target resource.
#[derive(Debug)]
pub struct Chunk {
    /// This chunk's position in the overall plan.
    pub index: usize,
    /// The byte range this chunk is responsible for.
    pub range: ClosedByteRange,
    fifo: Fifo,
    state: Mutex<ChunkState>,
}

impl Chunk {
    /// Create a new, not-yet-started chunk with a fresh FIFO.
    #[must_use]
    pub fn new(index: usize, range: ClosedByteRange, fifo: Fifo) -> Self {
        Self {
            index,
            range,
            fifo,
            state: Mutex::new(ChunkState::NotStarted),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChunkState {
        self.state.lock().unwrap().clone()
    }

    /// Mark this chunk as actively downloading. Must be called before any
    /// worker I/O begins.
    pub fn start(&self) {
        *self.state.lock().unwrap() = ChunkState::Downloading;
    }

    /// Mark this chunk as successfully downloaded and let its reader drain
    /// the remaining buffered bytes before seeing end-of-stream.
    pub fn complete(&self) {
        *self.state.lock().unwrap() = ChunkState::Completed;
        self.fifo.close_write();
    }

    /// Mark this chunk as failed and wake any blocked reader immediately.
    pub fn fail(&self, err: ChunkError) {
        *self.state.lock().unwrap() = ChunkState::Failed(Arc::new(err));
        self.fifo.close();
    }

    /// Append downloaded bytes to this chunk's FIFO.
    ///
    /// # Errors
    ///
    /// Fails if the FIFO has already been closed.
    pub async fn write(&self, data: impl Into<bytes::Bytes>) -> Result<usize, fifo_pipe::FifoError> {
        self.fifo.write(data).await
    }

    /// Read from this chunk's FIFO. Blocks until bytes are available, the
    /// chunk completes, or the chunk is closed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, fifo_pipe::FifoError> {
        self.fifo.read(buf).await
    }

    /// Cancel this chunk by closing its FIFO, waking any blocked reader.
    /// Idempotent.
    pub fn close(&self) {
        self.fifo.close();
    }
}
