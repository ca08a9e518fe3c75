//! The crate-wide error taxonomy.
use std::sync::Arc;

use crate::{
    headers::{ContentRange, HeaderParseError},
    range::ClosedByteRange,
    wire::TransportError,
};

/// Errors that can terminate a single chunk's download.
///
/// Stored on the [`Chunk`](crate::chunk::Chunk) itself and surfaced through
/// the stitched body's next `read` once the chunk's FIFO reports
/// end-of-stream in the `Failed` state.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The server answered a ranged GET with `200 OK`, meaning it rejected
    /// the `If-Range` validator: the resource changed mid-download.
    #[error("server returned 200 OK to a range request; resource may have changed")]
    ValidatorMismatch,

    /// Any status other than 206 for a ranged GET.
    #[error("unexpected status {0} for ranged GET")]
    UnexpectedStatus(reqwest::StatusCode),

    /// The response's `Content-Range` disagreed with what was requested.
    #[error("content-range mismatch: requested {requested:?}, server reported {got:?}")]
    RangeMismatch {
        /// The byte range this worker asked for.
        requested: ClosedByteRange,
        /// The range the server claimed to return.
        got: ContentRange,
    },

    /// Fewer bytes arrived than `end - start + 1`.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes the chunk's range promised.
        expected: u64,
        /// Bytes actually copied before the body ended.
        got: u64,
    },

    /// A malformed `Content-Range` header on the ranged GET's response.
    #[error("malformed content-range header: {0}")]
    HeaderParse(#[from] HeaderParseError),

    /// The underlying transport failed the ranged GET.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Writing downloaded bytes into the chunk's FIFO failed.
    #[error(transparent)]
    Fifo(#[from] fifo_pipe::FifoError),

    /// The request was cancelled while this chunk was downloading.
    #[error("chunk download cancelled")]
    Cancelled,
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying transport failed a HEAD probe or a non-parallelized
    /// GET.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A chunk failed; `index` identifies which one of the plan's chunks.
    #[error("chunk {index} failed: {source}")]
    Chunk {
        /// Index of the failing chunk within the plan.
        index: usize,
        /// The chunk's terminal error.
        source: Arc<ChunkError>,
    },

    /// Allocating a chunk's backing FIFO failed during planning.
    #[error(transparent)]
    Fifo(#[from] fifo_pipe::FifoError),

    /// The request was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A read was attempted on a body that was already closed.
    #[error("read from closed body")]
    BodyClosed,

    /// A chunk's `read` returned zero bytes without reporting EOF or an
    /// error — a violation of the FIFO/chunk contract this crate relies on.
    #[error("chunk {index} returned zero bytes without eof or error")]
    ProtocolViolation {
        /// Index of the offending chunk.
        index: usize,
    },
}
