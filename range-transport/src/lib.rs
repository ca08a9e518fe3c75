//! Transparent HTTP middleware that splits a large GET into concurrent
//! byte-range sub-requests and reassembles the bytes into a single
//! streaming response, indistinguishable from what the wrapped transport
//! would have produced for the same GET.
//!
//! [`ParallelTransport`] decorates any [`Transport`] implementation — a
//! blanket impl is provided for [`reqwest::Client`] — and decides per
//! request whether splitting is safe and worthwhile: non-GET methods and
//! requests that already carry a `Range` header pass through untouched; GET
//! requests are probed with a `HEAD` and parallelized only when the server
//! advertises byte-range support, isn't serving a compressed body, and the
//! resource is large enough to benefit.
#![warn(
    unreachable_pub,
    missing_debug_implementations,
    missing_docs,
    clippy::pedantic
)]

/// The stitched response body: the ordered concatenation of a plan's chunks.
pub mod body;
/// A single planned byte range, its FIFO, and its download state.
pub mod chunk;
mod error;
/// Parsing and scrubbing of `Range`, `Content-Range`, and related headers.
pub mod headers;
/// Byte ranges and the chunk-partitioning arithmetic built on them.
pub mod range;
/// Per-host concurrency gating for sub-range workers.
pub mod semaphore;
/// The parallel transport itself: planning, dispatch, and worker orchestration.
pub mod transport;
/// The `Transport` trait boundary this crate decorates.
pub mod wire;

pub(crate) type Result<T> = core::result::Result<T, error::Error>;

pub use error::{ChunkError, Error};
pub use transport::{ParallelTransport, TransportConfig};
pub use wire::{Request, Response, Transport, TransportError};
