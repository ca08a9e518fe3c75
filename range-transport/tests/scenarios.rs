//! End-to-end scenarios driven against an in-process fake transport: no
//! socket is ever opened.
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use range_transport::{
    wire::{Request, Response, Transport, TransportError},
    ParallelTransport, TransportConfig,
};
use reqwest::{
    header::{
        HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE,
        ETAG, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE,
        LAST_MODIFIED, RANGE,
    },
    Method, StatusCode, Url, Version,
};
use tokio_util::sync::CancellationToken;

/// A resource served by [`FakeTransport`]: byte content plus the HEAD-probe
/// headers that control whether the caller will consider it parallelizable.
#[derive(Debug, Clone)]
struct FakeResource {
    body: Bytes,
    accept_ranges: bool,
    content_encoding: Option<&'static str>,
    etag: Option<&'static str>,
    last_modified: Option<&'static str>,
    /// If true, every ranged GET answers `200 OK` with a fresh ETag instead
    /// of honoring `If-Range` — simulates the resource changing mid-download.
    reject_if_range: bool,
}

impl FakeResource {
    fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            accept_ranges: true,
            content_encoding: None,
            etag: None,
            last_modified: None,
            reject_if_range: false,
        }
    }
}

#[derive(Debug)]
struct FakeTransport {
    resource: FakeResource,
    requests: Mutex<Vec<Request>>,
}

impl FakeTransport {
    fn new(resource: FakeResource) -> Self {
        Self {
            resource,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    fn head_count(&self) -> usize {
        self.requests().iter().filter(|r| r.method == Method::HEAD).count()
    }

    fn get_count(&self) -> usize {
        self.requests().iter().filter(|r| r.method == Method::GET).count()
    }

    fn ranged_get_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == Method::GET && r.headers.contains_key(RANGE))
            .count()
    }

    fn base_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        if self.resource.accept_ranges {
            h.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        if let Some(enc) = self.resource.content_encoding {
            h.insert(CONTENT_ENCODING, HeaderValue::from_str(enc).unwrap());
        }
        if let Some(etag) = self.resource.etag {
            h.insert(ETAG, HeaderValue::from_str(etag).unwrap());
        }
        if let Some(lm) = self.resource.last_modified {
            h.insert(LAST_MODIFIED, HeaderValue::from_str(lm).unwrap());
        }
        h
    }

    fn empty_body() -> Response {
        Response {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Box::pin(futures::stream::empty::<Result<Bytes, TransportError>>()),
        }
    }

    fn body_stream(bytes: Bytes) -> range_transport::wire::BodyStream {
        Box::pin(futures::stream::once(async move {
            Ok::<_, TransportError>(bytes)
        }))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn roundtrip(&self, req: Request) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(req.clone());

        for forbidden in [IF_MATCH, IF_NONE_MATCH, IF_MODIFIED_SINCE, IF_UNMODIFIED_SINCE] {
            assert!(
                !req.headers.contains_key(&forbidden),
                "conditional header {forbidden} leaked through to the underlying transport"
            );
        }

        match req.method {
            Method::HEAD => {
                let mut headers = self.base_headers();
                headers.insert(
                    CONTENT_LENGTH,
                    HeaderValue::from_str(&self.resource.body.len().to_string()).unwrap(),
                );
                let mut res = Self::empty_body();
                res.headers = headers;
                Ok(res)
            }
            Method::GET => {
                if let Some(range) = req.headers.get(RANGE) {
                    let range = range.to_str().unwrap();
                    let (start, end) = parse_test_range(range);

                    if self.resource.reject_if_range {
                        let mut headers = self.base_headers();
                        headers.insert(ETAG, HeaderValue::from_static("\"changed\""));
                        headers.insert(
                            CONTENT_LENGTH,
                            HeaderValue::from_str(&self.resource.body.len().to_string()).unwrap(),
                        );
                        return Ok(Response {
                            status: StatusCode::OK,
                            version: Version::HTTP_11,
                            headers,
                            body: Self::body_stream(self.resource.body.clone()),
                        });
                    }

                    let slice = self.resource.body.slice(start as usize..=end as usize);
                    let mut headers = self.base_headers();
                    headers.insert(
                        CONTENT_RANGE,
                        HeaderValue::from_str(&format!(
                            "bytes {start}-{end}/{}",
                            self.resource.body.len()
                        ))
                        .unwrap(),
                    );
                    Ok(Response {
                        status: StatusCode::PARTIAL_CONTENT,
                        version: Version::HTTP_11,
                        headers,
                        body: Self::body_stream(slice),
                    })
                } else {
                    let mut headers = self.base_headers();
                    headers.insert(
                        CONTENT_LENGTH,
                        HeaderValue::from_str(&self.resource.body.len().to_string()).unwrap(),
                    );
                    Ok(Response {
                        status: StatusCode::OK,
                        version: Version::HTTP_11,
                        headers,
                        body: Self::body_stream(self.resource.body.clone()),
                    })
                }
            }
            other => Err(TransportError::Other(format!("unexpected method {other}"))),
        }
    }
}

fn parse_test_range(value: &str) -> (u64, u64) {
    let rest = value.strip_prefix("bytes=").unwrap();
    let (start, end) = rest.split_once('-').unwrap();
    (start.parse().unwrap(), end.parse().unwrap())
}

async fn read_all(res: Response) -> Bytes {
    res.bytes().await.unwrap()
}

fn test_url() -> Url {
    Url::parse("https://example.com/resource.bin").unwrap()
}

/// S1: a resource far below the parallelization threshold falls back to a
/// single plain GET.
#[tokio::test]
async fn small_file_fallback() {
    let fake = FakeTransport::new(FakeResource::new(Bytes::from_static(b"Hello, World!")));
    let transport = ParallelTransport::new(fake, TransportConfig::default());

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read_all(res).await, Bytes::from_static(b"Hello, World!"));
}

/// S2: a large resource with a strong ETag is split into several ranged
/// GETs, each carrying `If-Range`, and reassembles byte-for-byte.
#[tokio::test]
async fn parallel_success() {
    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let mut resource = FakeResource::new(Bytes::from(content.clone()));
    resource.etag = Some("\"test-etag\"");
    let fake = std::sync::Arc::new(FakeTransport::new(resource));
    let transport = ParallelTransport::new(
        std::sync::Arc::clone(&fake),
        TransportConfig::new()
            .with_min_chunk_size(1024)
            .with_max_concurrent_per_request(4),
    );

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fake.head_count(), 1);
    assert!(fake.ranged_get_count() >= 2);
    for req in fake.requests() {
        if req.method == Method::GET && req.headers.contains_key(RANGE) {
            assert_eq!(
                req.headers.get(IF_RANGE).unwrap(),
                &HeaderValue::from_static("\"test-etag\"")
            );
        }
    }

    assert_eq!(read_all(res).await.as_ref(), content.as_slice());
}

/// S3: no `Accept-Ranges` means a single full GET, no ranged requests.
#[tokio::test]
async fn no_range_support() {
    let content = vec![7u8; 100_000];
    let mut resource = FakeResource::new(Bytes::from(content.clone()));
    resource.accept_ranges = false;
    let fake = FakeTransport::new(resource);
    let transport = ParallelTransport::new(fake, TransportConfig::new().with_min_chunk_size(1024));

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read_all(res).await.as_ref(), content.as_slice());
}

/// S4: a `Content-Encoding` on the resource refuses parallelization.
#[tokio::test]
async fn gzip_refusal() {
    let content = vec![3u8; 100_000];
    let mut resource = FakeResource::new(Bytes::from(content.clone()));
    resource.content_encoding = Some("gzip");
    let fake = std::sync::Arc::new(FakeTransport::new(resource));
    let transport = ParallelTransport::new(
        std::sync::Arc::clone(&fake),
        TransportConfig::new().with_min_chunk_size(1024),
    );

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fake.ranged_get_count(), 0);
    assert_eq!(read_all(res).await.as_ref(), content.as_slice());
}

/// S5: a weak ETag is not used as a validator; `Last-Modified` is used
/// instead.
#[tokio::test]
async fn weak_etag_falls_back_to_last_modified() {
    let content = vec![9u8; 100_000];
    let mut resource = FakeResource::new(Bytes::from(content.clone()));
    resource.etag = Some("W/\"weak\"");
    resource.last_modified = Some("Wed, 21 Oct 2015 07:28:00 GMT");
    let fake = std::sync::Arc::new(FakeTransport::new(resource));
    let transport = ParallelTransport::new(
        std::sync::Arc::clone(&fake),
        TransportConfig::new().with_min_chunk_size(1024),
    );

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();
    let _ = read_all(res).await;

    for req in fake.requests() {
        if req.method == Method::GET && req.headers.contains_key(RANGE) {
            assert_eq!(
                req.headers.get(IF_RANGE).unwrap(),
                &HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT")
            );
        }
    }
}

/// S6: the server rejects `If-Range` (200 instead of 206) mid-download; the
/// stitched body's read surfaces a validator-mismatch error.
#[tokio::test]
async fn validator_mismatch_surfaces_on_read() {
    let content = vec![1u8; 100_000];
    let mut resource = FakeResource::new(Bytes::from(content));
    resource.etag = Some("\"original\"");
    resource.reject_if_range = true;
    let fake = FakeTransport::new(resource);
    let transport = ParallelTransport::new(fake, TransportConfig::new().with_min_chunk_size(1024));

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();

    let err = res.bytes().await.unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("200") || message.contains("resource may have changed"),
        "unexpected error message: {message}"
    );
}

/// S7: chunk boundaries exactly partition `[0, totalSize-1]` with the
/// remainder on the last chunk, and the stitched read-back matches exactly.
#[tokio::test]
async fn chunk_boundaries_cover_resource_with_remainder() {
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    let fake = FakeTransport::new(FakeResource::new(Bytes::from(content.clone())));
    let transport = ParallelTransport::new(
        fake,
        TransportConfig::new()
            .with_min_chunk_size(2_500)
            .with_max_concurrent_per_request(4),
    );

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read_all(res).await.as_ref(), content.as_slice());
}

/// Method neutrality: a non-GET request passes straight through with no
/// HEAD probe.
#[tokio::test]
async fn non_get_method_passes_through() {
    let fake = std::sync::Arc::new(FakeTransport::new(FakeResource::new(Bytes::from_static(
        b"irrelevant",
    ))));
    let transport = ParallelTransport::new(std::sync::Arc::clone(&fake), TransportConfig::default());

    let mut req = Request::new(Method::GET, test_url());
    req.method = Method::POST;
    let _ = transport.execute(req, CancellationToken::new()).await;

    assert_eq!(fake.head_count(), 0);
}

/// Caller-Range neutrality: an explicit `Range` header on the inbound
/// request disables parallelization entirely and is forwarded untouched.
#[tokio::test]
async fn caller_supplied_range_disables_parallelization() {
    let content = vec![5u8; 100_000];
    let fake = std::sync::Arc::new(FakeTransport::new(FakeResource::new(Bytes::from(content))));
    let transport = ParallelTransport::new(
        std::sync::Arc::clone(&fake),
        TransportConfig::new().with_min_chunk_size(1024),
    );

    let mut req = Request::new(Method::GET, test_url());
    req.headers.insert(RANGE, HeaderValue::from_static("bytes=10-19"));
    let res = transport.execute(req, CancellationToken::new()).await.unwrap();
    let _ = read_all(res).await;

    assert_eq!(fake.head_count(), 0);
    assert_eq!(fake.get_count(), 1);
    let sent = fake.requests();
    assert_eq!(
        sent[0].headers.get(RANGE).unwrap(),
        &HeaderValue::from_static("bytes=10-19")
    );
}

/// A [`Transport`] wrapper that delays every ranged GET briefly and tracks
/// how many were ever in flight at once, to verify per-host gating.
#[derive(Debug)]
struct CountingTransport<T> {
    inner: T,
    in_flight: std::sync::atomic::AtomicUsize,
    peak: std::sync::atomic::AtomicUsize,
}

impl<T> CountingTransport<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            in_flight: std::sync::atomic::AtomicUsize::new(0),
            peak: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Transport> Transport for CountingTransport<T> {
    async fn roundtrip(&self, req: Request) -> Result<Response, TransportError> {
        let ranged = req.method == Method::GET && req.headers.contains_key(RANGE);
        if ranged {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            let res = self.inner.roundtrip(req).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            res
        } else {
            self.inner.roundtrip(req).await
        }
    }
}

/// Testable property 7: at most `limit(host)` ranged GETs are ever
/// simultaneously in flight for a given host.
#[tokio::test]
async fn per_host_gating_bounds_concurrency() {
    let content: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
    let fake = FakeTransport::new(FakeResource::new(Bytes::from(content.clone())));
    let counting = std::sync::Arc::new(CountingTransport::new(fake));
    let transport = ParallelTransport::new(
        std::sync::Arc::clone(&counting),
        TransportConfig::new()
            .with_min_chunk_size(1_000)
            .with_max_concurrent_per_request(8)
            .with_max_concurrent_per_host("", 2),
    );

    let res = transport
        .execute(Request::new(Method::GET, test_url()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(read_all(res).await.as_ref(), content.as_slice());

    assert!(counting.peak() <= 2, "peak concurrent workers was {}", counting.peak());
}
