//! The parallel transport: the request interceptor that decides when
//! splitting a GET into concurrent byte-range sub-requests is safe, plans
//! the chunks, drives the workers, and hands back a stitched response.
use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{
    header::{
        HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, ETAG,
        LAST_MODIFIED, RANGE,
    },
    Method, StatusCode, Version,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    body::StitchedBody,
    chunk::Chunk,
    error::{ChunkError, Error},
    headers::{accepts_byte_ranges, content_length, has_content_encoding, is_weak_etag, parse_content_range, scrub_conditional_headers},
    range::{self, ByteRange},
    semaphore::HostSemaphores,
    wire::{Request, Response, Transport, TransportError},
};

/// Default per-host worker ceiling used when no more specific entry (and no
/// `""` default entry) is configured.
const FALLBACK_HOST_LIMIT: usize = 4;

/// Default chunk count ceiling for a single logical GET.
const DEFAULT_MAX_CONCURRENT_PER_REQUEST: usize = 4;

/// Default minimum chunk size: below this, splitting isn't worth it.
const DEFAULT_MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Configuration for a [`ParallelTransport`].
///
/// All options are independent and idempotent: building two transports from
/// the same config produces two instances with identical, non-interfering
/// behavior.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    max_concurrent_per_host: HashMap<String, usize>,
    max_concurrent_per_request: usize,
    min_chunk_size: u64,
    temp_dir: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_host: HashMap::from([(String::new(), FALLBACK_HOST_LIMIT)]),
            max_concurrent_per_request: DEFAULT_MAX_CONCURRENT_PER_REQUEST,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl TransportConfig {
    /// Start from the normative defaults: `{"": 4}` per-host limit, 4 chunks
    /// per request, 1 MiB minimum chunk size, system temp dir.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ceiling for `host` (or the default ceiling, for the
    /// empty string). A limit of 0 means unlimited concurrency for that
    /// host.
    #[must_use]
    pub fn with_max_concurrent_per_host(mut self, host: impl Into<String>, limit: usize) -> Self {
        self.max_concurrent_per_host.insert(host.into(), limit);
        self
    }

    /// Set the chunk count ceiling for a single logical GET.
    #[must_use]
    pub fn with_max_concurrent_per_request(mut self, n: usize) -> Self {
        self.max_concurrent_per_request = n;
        self
    }

    /// Set the minimum bytes per chunk below which parallelization is
    /// refused.
    #[must_use]
    pub fn with_min_chunk_size(mut self, n: u64) -> Self {
        self.min_chunk_size = n;
        self
    }

    /// Set the directory used to create chunk FIFO backing files.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}

/// The HEAD-probe snapshot a plan is built from.
#[derive(Debug, Clone)]
struct ParallelInfo {
    total_size: u64,
    version: Version,
    headers: HeaderMap,
    if_range: Option<HeaderValue>,
}

/// Number of chunks to split `total_size` into, given the configured
/// minimum chunk size and per-request worker ceiling. Always at least 1.
#[must_use]
fn plan_chunk_count(total_size: u64, min_chunk_size: u64, max_concurrent_per_request: usize) -> usize {
    let by_size = (total_size / min_chunk_size.max(1)) as usize;
    max_concurrent_per_request.min(by_size).max(1)
}

/// Decorates an underlying [`Transport`], splitting eligible GETs into
/// concurrent byte-range sub-requests.
#[derive(Debug)]
pub struct ParallelTransport<T> {
    inner: Arc<T>,
    config: TransportConfig,
    semaphores: HostSemaphores,
}

impl<T: Transport + 'static> ParallelTransport<T> {
    /// Wrap `inner` with the given configuration.
    pub fn new(inner: T, config: TransportConfig) -> Self {
        let semaphores = HostSemaphores::new(config.max_concurrent_per_host.clone());
        Self {
            inner: Arc::new(inner),
            config,
            semaphores,
        }
    }

    /// Run one logical request through the transport, splitting it into
    /// concurrent range workers when safe and beneficial.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport fails the HEAD probe or
    /// (for non-parallelized requests) the GET itself, if `cancel` fires, or
    /// if planning fails (e.g. a FIFO's backing file can't be created).
    #[instrument(skip_all, fields(method = %req.method, url = %req.url))]
    pub async fn execute(&self, req: Request, cancel: CancellationToken) -> crate::Result<Response> {
        if req.method != Method::GET {
            trace!("non-GET request, passing through");
            return self.inner.roundtrip(req).await.map_err(Error::Transport);
        }

        if req.headers.contains_key(RANGE) {
            trace!("caller already set Range, passing through");
            return self.inner.roundtrip(req).await.map_err(Error::Transport);
        }

        match self.check_parallelizable(&req, &cancel).await? {
            None => self.inner.roundtrip(req).await.map_err(Error::Transport),
            Some(info) => self.parallel_get(req, info, cancel).await,
        }
    }

    #[instrument(skip_all)]
    async fn check_parallelizable(
        &self,
        req: &Request,
        cancel: &CancellationToken,
    ) -> crate::Result<Option<ParallelInfo>> {
        let mut head = Request::new(Method::HEAD, req.url.clone());
        head.headers = req.headers.clone();
        scrub_conditional_headers(&mut head.headers);
        head.headers
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let res = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            res = self.inner.roundtrip(head) => res.map_err(Error::Transport)?,
        };

        if res.status != StatusCode::OK && res.status != StatusCode::PARTIAL_CONTENT {
            debug!(status = %res.status, "HEAD status refuses parallelization");
            return Ok(None);
        }

        if !accepts_byte_ranges(&res.headers) {
            debug!("server does not advertise Accept-Ranges: bytes");
            return Ok(None);
        }

        if has_content_encoding(&res.headers) {
            warn!("refusing parallelization: response carries Content-Encoding");
            return Ok(None);
        }

        let total_size = match content_length(&res.headers) {
            Some(len) if len > 0 => Some(len),
            _ => res
                .headers
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_content_range(v).ok())
                .and_then(|cr| cr.total),
        };

        let Some(total_size) = total_size else {
            debug!("refusing parallelization: total size unknown");
            return Ok(None);
        };

        if total_size < self.config.min_chunk_size * self.config.max_concurrent_per_request as u64 {
            debug!(total_size, "refusing parallelization: below min-chunk-size threshold");
            return Ok(None);
        }

        let if_range = res
            .headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|etag| !is_weak_etag(etag))
            .and_then(|etag| HeaderValue::from_str(etag).ok())
            .or_else(|| res.headers.get(LAST_MODIFIED).cloned());

        debug!(total_size, has_validator = if_range.is_some(), "accepted for parallelization");

        Ok(Some(ParallelInfo {
            total_size,
            version: res.version,
            headers: res.headers.clone(),
            if_range,
        }))
    }

    #[instrument(skip_all, fields(total_size = info.total_size))]
    async fn parallel_get(&self, req: Request, info: ParallelInfo, cancel: CancellationToken) -> crate::Result<Response> {
        let num_chunks = plan_chunk_count(
            info.total_size,
            self.config.min_chunk_size,
            self.config.max_concurrent_per_request,
        );
        let ranges = range::partition(info.total_size, num_chunks);
        debug!(num_chunks, "planned chunks");

        let mut chunks = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.iter().enumerate() {
            let fifo = fifo_pipe::Fifo::new(&self.config.temp_dir)?;
            chunks.push(Arc::new(Chunk::new(index, *range, fifo)));
        }

        let host = req.url.host_str().unwrap_or_default().to_owned();

        let mut handles = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let chunk = Arc::clone(chunk);
            let inner = Arc::clone(&self.inner);
            let base_headers = req.headers.clone();
            let url = req.url.clone();
            let if_range = info.if_range.clone();
            let host = host.clone();
            let cancel = cancel.clone();
            // Acquired here rather than inside the spawned task: `self` is
            // borrowed, not `Arc`'d, so the task itself can't reach the
            // semaphore map. The permit is moved into the task and dropped
            // when the worker finishes.
            let permit = self.semaphores.acquire(&host, &cancel).await?;

            let handle = tokio::spawn(async move {
                run_worker(inner, chunk, url, base_headers, if_range, cancel).await;
                drop(permit);
            });
            handles.push(handle);
        }

        // Workers are not joined here: the caller gets the response — and
        // can start reading the FIFOs — as soon as they're spawned, not once
        // every chunk has already finished. A detached task watches for
        // panics; worker failures proper are recorded on the chunk and
        // surfaced through the stitched body's own `read`.
        tokio::spawn(async move {
            for handle in handles {
                if handle.await.is_err() {
                    warn!("chunk worker task panicked");
                }
            }
        });

        let mut headers = info.headers;
        headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&info.total_size.to_string()).expect("decimal digits are valid header bytes"),
        );
        headers.remove(CONTENT_RANGE);

        let body = Arc::new(StitchedBody::new(chunks, info.total_size, cancel));
        let stream = body
            .into_stream()
            .map_err(|e| TransportError::Other(e.to_string()));

        Ok(Response {
            status: StatusCode::OK,
            version: info.version,
            headers,
            body: Box::pin(stream),
        })
    }
}

#[async_trait]
impl<T: Transport + 'static> Transport for ParallelTransport<T> {
    async fn roundtrip(&self, req: Request) -> Result<Response, TransportError> {
        self.execute(req, CancellationToken::new())
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Drive one chunk's ranged GET to completion, recording any failure on the
/// chunk itself rather than returning it — the stitched body surfaces chunk
/// errors through its own `read`.
#[instrument(skip_all, fields(index = chunk.index, start = chunk.range.start(), end = chunk.range.end()))]
async fn run_worker<T: Transport + 'static>(
    inner: Arc<T>,
    chunk: Arc<Chunk>,
    url: reqwest::Url,
    mut headers: HeaderMap,
    if_range: Option<HeaderValue>,
    cancel: CancellationToken,
) {
    chunk.start();

    scrub_conditional_headers(&mut headers);
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(RANGE, chunk.range.to_http());
    if let Some(if_range) = if_range {
        headers.insert(reqwest::header::IF_RANGE, if_range);
    }

    let mut req = Request::new(Method::GET, url);
    req.headers = headers;

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ChunkError::Cancelled),
        res = download_chunk(&*inner, req, &chunk) => res,
    };

    match result {
        Ok(()) => {
            trace!("chunk completed");
            chunk.complete();
        }
        Err(err) => {
            warn!(error = %err, "chunk failed");
            chunk.fail(err);
        }
    }
}

async fn download_chunk<T: Transport + ?Sized>(
    inner: &T,
    req: Request,
    chunk: &Chunk,
) -> Result<(), ChunkError> {
    let res = inner.roundtrip(req).await?;

    if res.status == StatusCode::OK {
        return Err(ChunkError::ValidatorMismatch);
    }
    if res.status != StatusCode::PARTIAL_CONTENT {
        return Err(ChunkError::UnexpectedStatus(res.status));
    }

    if let Some(value) = res.headers.get(CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        let got = parse_content_range(value)?;
        if got.start != chunk.range.start() || got.end != chunk.range.end() {
            return Err(ChunkError::RangeMismatch {
                requested: chunk.range,
                got,
            });
        }
    }

    let mut body = res.body;
    let mut copied: u64 = 0;
    while let Some(bytes) = body.next().await {
        let bytes: Bytes = bytes?;
        copied += bytes.len() as u64;
        chunk.write(bytes).await?;
    }

    if copied != chunk.range.len() {
        return Err(ChunkError::ShortRead {
            expected: chunk.range.len(),
            got: copied,
        });
    }

    Ok(())
}
