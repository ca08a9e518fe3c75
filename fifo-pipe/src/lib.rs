//! A single-producer/single-consumer byte pipe backed by a temporary file.
//!
//! Unlike an in-memory channel, a [`Fifo`] never applies backpressure to its
//! writer: bytes are appended to a temp file that is unlinked from its
//! directory entry the moment it is created, so the only cost of a slow
//! reader is disk space, not heap. This lets a [`Fifo`] decouple a multi-gigabyte
//! chunk download from the reader that eventually consumes it.
use std::{
    fmt,
    fs::File,
    io,
    path::Path,
    sync::{Arc, Mutex},
};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Errors returned by [`Fifo`] operations.
#[derive(Debug, thiserror::Error)]
pub enum FifoError {
    /// The FIFO was closed (by either end) before the operation could complete.
    #[error("fifo is closed")]
    Closed,

    /// The backing file could not be created, read, or written.
    #[error("fifo io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct State {
    read_pos: u64,
    write_pos: u64,
    write_closed: bool,
    closed: bool,
}

struct Inner {
    file: File,
    state: Mutex<State>,
    notify: Notify,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Inner")
            .field("read_pos", &state.read_pos)
            .field("write_pos", &state.write_pos)
            .field("write_closed", &state.write_closed)
            .field("closed", &state.closed)
            .finish()
    }
}

/// An unbounded, file-backed, single-producer/single-consumer byte pipe.
///
/// A [`Fifo`] is cheap to clone: clones share the same backing file and
/// state, which is the intended way to hand the writing half to one task and
/// the reading half to another.
#[derive(Debug, Clone)]
pub struct Fifo {
    inner: Arc<Inner>,
}

impl Fifo {
    /// Create a new FIFO with its backing file in `dir`.
    ///
    /// The file is created and immediately unlinked from `dir` (on
    /// platforms that support it), so its storage is reclaimed by the OS as
    /// soon as every clone of this [`Fifo`] is dropped, even if the process
    /// exits abruptly mid-transfer.
    pub fn new(dir: &Path) -> Result<Self, FifoError> {
        let file = tempfile::tempfile_in(dir)?;
        debug!(?dir, "created fifo backing file");

        Ok(Self {
            inner: Arc::new(Inner {
                file,
                state: Mutex::new(State {
                    read_pos: 0,
                    write_pos: 0,
                    write_closed: false,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        })
    }

    /// Append `data` at the current write position and wake any blocked
    /// reader.
    ///
    /// # Errors
    ///
    /// Fails with [`FifoError::Closed`] if the FIFO has been closed or
    /// write-closed, and with [`FifoError::Io`] on a backing-file error.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<usize, FifoError> {
        let data = data.into();
        let len = data.len();

        let pos = {
            let state = self.inner.state.lock().unwrap();
            if state.closed || state.write_closed {
                return Err(FifoError::Closed);
            }
            state.write_pos
        };

        if !data.is_empty() {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || write_at(&inner.file, &data, pos))
                .await
                .expect("fifo write task panicked")?;

            let mut state = self.inner.state.lock().unwrap();
            // A single writer is assumed, so write_pos can only have moved
            // forward by exactly what we just wrote.
            state.write_pos = pos + len as u64;
        }

        self.inner.notify.notify_waiters();

        Ok(len)
    }

    /// Read up to `buf.len()` bytes starting at the current read position.
    ///
    /// Blocks (asynchronously) until bytes are available, the FIFO becomes
    /// write-closed, or the FIFO is closed. Returns `Ok(0)` for end-of-stream,
    /// matching the `Read` convention rather than a distinct EOF error.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, FifoError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // Register interest in notifications *before* inspecting state,
            // so a write or close racing with this read is never missed.
            let notified = self.inner.notify.notified();

            let (pos, available, write_closed, closed) = {
                let state = self.inner.state.lock().unwrap();
                (
                    state.read_pos,
                    state.write_pos.saturating_sub(state.read_pos),
                    state.write_closed,
                    state.closed,
                )
            };

            if closed {
                return Ok(0);
            }

            if available > 0 {
                let want = available.min(buf.len() as u64) as usize;
                let inner = Arc::clone(&self.inner);
                let mut scratch = BytesMut::zeroed(want);
                let scratch = tokio::task::spawn_blocking(move || {
                    let n = read_at(&inner.file, &mut scratch, pos)?;
                    scratch.truncate(n);
                    Ok::<_, io::Error>(scratch)
                })
                .await
                .expect("fifo read task panicked")?;

                let n = scratch.len();
                buf[..n].copy_from_slice(&scratch);
                let mut state = self.inner.state.lock().unwrap();
                state.read_pos = pos + n as u64;
                return Ok(n);
            }

            if write_closed {
                return Ok(0);
            }

            notified.await;
        }
    }

    /// Signal that no more writes will occur. Readers drain whatever remains
    /// in the file and then see end-of-stream. Idempotent.
    pub fn close_write(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.write_closed = true;
        drop(state);
        trace!("fifo write half closed");
        self.inner.notify.notify_waiters();
    }

    /// Fully close the FIFO: any blocked reader wakes immediately with
    /// end-of-stream (discarding unread bytes) and subsequent writes fail.
    /// Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        drop(state);
        trace!("fifo closed");
        self.inner.notify.notify_waiters();
    }

    /// Whether [`Fifo::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
