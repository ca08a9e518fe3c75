//! The boundary between this crate and whatever actually puts bytes on a
//! socket.
//!
//! [`Transport`] is the "underlying transport" of this crate's design: a
//! polymorphic `roundtrip(request) -> response | error` capability. The
//! production implementation is a thin wrapper around [`reqwest::Client`];
//! tests substitute an in-memory fake so the rest of this crate never
//! touches a real socket.
use std::{fmt::Debug, pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{header::HeaderMap, Method, StatusCode, Url, Version};

/// A byte stream making up a response body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// An outgoing request, stripped down to what this crate ever sends: a
/// method, a URL, and headers. GET and HEAD carry no body.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
}

impl Request {
    /// Construct a new request with empty headers.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// The canonical host this request targets, or an empty string if the
    /// URL has none.
    #[must_use]
    pub fn host(&self) -> String {
        self.url.host_str().unwrap_or_default().to_owned()
    }

}

/// An incoming response: status, protocol version, headers, and a body
/// stream.
pub struct Response {
    /// Status code.
    pub status: StatusCode,
    /// HTTP protocol version.
    pub version: Version,
    /// Response headers.
    pub headers: HeaderMap,
    /// The response body, as a stream of byte chunks.
    pub body: BodyStream,
}

impl Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Collect the entire body into a single buffer. Intended for tests and
    /// small fixed-size resources, not for the stitched body itself.
    pub async fn bytes(mut self) -> Result<Bytes, TransportError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

/// Failure communicating with the underlying transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The `reqwest`-based production transport failed.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// A test double or other transport implementation failed.
    #[error("{0}")]
    Other(String),
}

/// The capability this crate decorates: send a [`Request`], get back a
/// [`Response`] or an error.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Perform one HTTP round trip.
    async fn roundtrip(&self, req: Request) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn roundtrip(&self, req: Request) -> Result<Response, TransportError> {
        (**self).roundtrip(req).await
    }
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn roundtrip(&self, req: Request) -> Result<Response, TransportError> {
        let built = self
            .request(req.method, req.url)
            .headers(req.headers)
            .build()?;

        let res = self.execute(built).await?;

        Ok(Response {
            status: res.status(),
            version: res.version(),
            headers: res.headers().clone(),
            body: Box::pin(res.bytes_stream().map_err(TransportError::from)),
        })
    }
}
