//! The HTTP seam every network exchange goes through.

use std::fmt;
use std::sync::{
    Arc,
    Mutex,
};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{
    HeaderMap,
    HeaderName,
    HeaderValue,
};
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

#[allow(unused_imports)]
use tracing::{
    debug,
    trace,
};

use crate::error::TransportError;

pub const APPLICATION_ZIP: &str = "application/zip";
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

/// Outcome class of a status code, shared by every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    AuthFailure,
    RetryableFailure,
    PermanentFailure,
}

pub fn classify(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        401 => ResponseClass::AuthFailure,
        408 | 429 | 500 | 502 | 503 | 504 => ResponseClass::RetryableFailure,
        _ => ResponseClass::PermanentFailure,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A streamed body. The reader is dropped (and its file closed) when the
/// request finishes, whichever way it finishes.
pub struct StreamBody {
    pub reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    pub content_type: &'static str,
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBody")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Stream(StreamBody),
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub query: Vec<(&'static str, String)>,
    pub body: Body,
    /// Longest stretch without progress: no body chunk taken by the socket,
    /// no response headers, no response chunk.
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: Body::Empty,
            timeout,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn query(mut self, name: &'static str, value: Option<impl Into<String>>) -> Self {
        if let Some(value) = value {
            self.query.push((name, value.into()));
        }
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn class(&self) -> ResponseClass {
        classify(self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait::async_trait]
impl<T: HttpClient + ?Sized> HttpClient for &T {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> eyre::Result<Self> {
        Self::from_builder(reqwest::Client::builder())
    }

    fn from_builder(builder: reqwest::ClientBuilder) -> eyre::Result<Self> {
        use eyre::WrapErr;
        let client = builder.build().wrap_err("building http client")?;
        Ok(Self { client })
    }
}

/// When the exchange last moved forward.
#[derive(Debug, Clone)]
struct Progress(Arc<Mutex<Instant>>);

impl Progress {
    fn start() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        let mut last = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves once `idle` has passed without progress.
async fn stalled(progress: &Progress, idle: Duration) {
    loop {
        let deadline = progress.last() + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

fn header_map(headers: &[(&'static str, String)]) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Other(format!("invalid value for header {name}: {e}")))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Other(format!("invalid header name {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait::async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            query,
            body,
            timeout,
        } = request;
        debug!(?method, %url, ?query, "sending request");
        let progress = Progress::start();
        let mut builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        }
        .headers(header_map(&headers)?)
        .query(&query);
        builder = match body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Stream(StreamBody {
                reader,
                content_type,
            }) => {
                let progress = progress.clone();
                let chunks = ReaderStream::new(reader).inspect(move |_| progress.touch());
                builder
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(reqwest::Body::wrap_stream(chunks))
            }
        };
        // a slow but moving upload is fine, only a stall of `timeout` aborts it
        let mut response = tokio::select! {
            sent = builder.send() => sent.map_err(|e| transport_error(e, timeout))?,
            _ = stalled(&progress, timeout) => return Err(TransportError::Timeout(timeout)),
        };
        let status = response.status().as_u16();
        let mut body = Vec::new();
        loop {
            match tokio::time::timeout(timeout, response.chunk()).await {
                Ok(Ok(Some(chunk))) => body.extend_from_slice(&chunk),
                Ok(Ok(None)) => break,
                Ok(Err(e)) => return Err(transport_error(e, timeout)),
                Err(_) => return Err(TransportError::Timeout(timeout)),
            }
        }
        trace!(status, len = body.len(), "received response");
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory client that records what was sent and replays canned results.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    /// What the fake saw of one request, body drained.
    #[derive(Debug, Clone)]
    pub struct Recorded {
        pub method: Method,
        pub url: String,
        pub headers: Vec<(&'static str, String)>,
        pub query: Vec<(&'static str, String)>,
        pub content_type: Option<&'static str>,
        pub json: Option<serde_json::Value>,
        pub body: Vec<u8>,
    }

    impl Recorded {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn query(&self, name: &str) -> Option<&str> {
            self.query
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.as_str())
        }
    }

    pub type Reply = Result<HttpResponse, TransportError>;

    #[derive(Default)]
    pub struct FakeClient {
        replies: Mutex<VecDeque<Reply>>,
        recorded: Mutex<Vec<Recorded>>,
    }

    pub fn ok(status: u16, body: &str) -> Reply {
        Ok(HttpResponse {
            status,
            body: body.as_bytes().to_vec(),
        })
    }

    impl FakeClient {
        pub fn replying(replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                recorded: Mutex::default(),
            }
        }

        pub fn calls(&self) -> usize {
            self.recorded.lock().map(|r| r.len()).unwrap_or_default()
        }

        pub fn recorded(&self) -> Vec<Recorded> {
            self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl HttpClient for FakeClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let HttpRequest {
                method,
                url,
                headers,
                query,
                body,
                ..
            } = request;
            let (content_type, json, bytes) = match body {
                Body::Empty => (None, None, Vec::new()),
                Body::Json(value) => (None, Some(value), Vec::new()),
                Body::Stream(StreamBody {
                    mut reader,
                    content_type,
                }) => {
                    let mut bytes = Vec::new();
                    reader
                        .read_to_end(&mut bytes)
                        .await
                        .map_err(|e| TransportError::Other(e.to_string()))?;
                    (Some(content_type), None, bytes)
                }
            };
            self.recorded.lock().expect("poisoned").push(Recorded {
                method,
                url,
                headers,
                query,
                content_type,
                json,
                body: bytes,
            });
            self.replies
                .lock()
                .expect("poisoned")
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("no reply queued".into())))
        }
    }
}
