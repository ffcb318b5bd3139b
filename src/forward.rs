//! Request and response rewriting between the client and a backend
//!
//! Outbound: hop-by-hop headers and `Host` are dropped, forwarding headers
//! are set, and the target URL is the backend base joined with the original
//! path and query. Inbound: hop-by-hop headers are dropped, as is
//! `Content-Length` except on HEAD, then the body is either omitted, buffered,
//! or streamed.

use crate::error::{full_body, ProxyBody};
use crate::pool::{ConnectionPool, PoolStats, UpstreamError};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

/// Headers that only apply to a single transport hop
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_REQUEST_ID: &str = "x-request-id";

/// Per-request routing decision, built once the hostname has resolved
#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub hostname: String,
    /// Backend base URL from the registry
    pub target_base: String,
    pub client_ip: IpAddr,
    pub request_id: String,
    /// Scheme the client used to reach the gateway
    pub scheme: &'static str,
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Join a backend base URL with the original path and query
pub fn join_target(base: &str, path_and_query: Option<&str>) -> Result<Uri, String> {
    let base: Uri = base
        .parse()
        .map_err(|e| format!("invalid target URL '{}': {}", base, e))?;
    let scheme = base.scheme_str().ok_or("target URL has no scheme")?;
    let authority = base.authority().ok_or("target URL has no host")?;

    let prefix = base.path().trim_end_matches('/');
    let pq = path_and_query.unwrap_or("/");
    let pq = if pq.starts_with('/') { pq.to_string() } else { format!("/{}", pq) };

    format!("{}://{}{}{}", scheme, authority, prefix, pq)
        .parse()
        .map_err(|e| format!("invalid joined URL: {}", e))
}

/// Split a Host header value into hostname and optional port
pub fn split_host(value: &str) -> (&str, Option<&str>) {
    // Bracketed IPv6 literal
    if let Some(rest) = value.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let port = rest[end + 1..].strip_prefix(':');
            return (&value[..end + 2], port);
        }
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host, Some(port))
        }
        _ => (value, None),
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let ip = client_ip.to_string();
    let existing: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();

    let value = if existing.is_empty() {
        ip
    } else {
        format!("{}, {}", existing.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Build the header set sent to the backend
pub fn outbound_headers(original: &HeaderMap, ctx: &ProxyRequestContext) -> HeaderMap {
    let mut headers = original.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);

    append_forwarded_for(&mut headers, ctx.client_ip);

    // An upstream TLS terminator knows the real scheme better than we do
    let proto = match original.get(X_FORWARDED_PROTO).and_then(|v| v.to_str().ok()) {
        Some(p) if !p.trim().is_empty() => p.trim().to_string(),
        _ => ctx.scheme.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&proto) {
        headers.insert(X_FORWARDED_PROTO, value);
    }

    let host_value = original.get(HOST).and_then(|v| v.to_str().ok());
    if let Some(host) = host_value {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }

    let port = host_value
        .and_then(|h| split_host(h).1)
        .map(str::to_string)
        .unwrap_or_else(|| if proto == "https" { "443" } else { "80" }.to_string());
    if let Ok(value) = HeaderValue::from_str(&port) {
        headers.insert(X_FORWARDED_PORT, value);
    }

    if let Ok(value) = HeaderValue::from_str(&ctx.client_ip.to_string()) {
        headers.insert(X_REAL_IP, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    headers
}

/// Methods whose body is never forwarded
fn drops_request_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
    )
}

/// Turn the client request into the backend request
pub fn build_outbound_request(
    req: Request<Incoming>,
    ctx: &ProxyRequestContext,
) -> Result<Request<ProxyBody>, UpstreamError> {
    let (parts, body) = req.into_parts();

    let uri = join_target(
        &ctx.target_base,
        parts.uri.path_and_query().map(|pq| pq.as_str()),
    )
    .map_err(UpstreamError::Internal)?;

    let body = if drops_request_body(&parts.method) {
        drop(body);
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    } else {
        body.boxed()
    };

    let mut outbound = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .version(Version::HTTP_11)
        .body(body)
        .map_err(|e| UpstreamError::Internal(e.to_string()))?;
    *outbound.headers_mut() = outbound_headers(&parts.headers, ctx);

    Ok(outbound)
}

/// How a backend response body is relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No body may be sent (204, 304, or a HEAD request)
    Empty,
    /// Read fully, then send with an exact Content-Length
    Buffer,
    /// Relay frame by frame as they arrive
    Stream,
}

/// Decide between buffering and streaming for a backend response
pub fn choose_body_mode(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
    buffer_threshold: u64,
) -> BodyMode {
    if *method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return BodyMode::Empty;
    }

    let closes = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")));
    if closes {
        return BodyMode::Stream;
    }

    let length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match length {
        Some(len) if len <= buffer_threshold => BodyMode::Buffer,
        _ => BodyMode::Stream,
    }
}

/// Turn the backend response into the client response
pub async fn relay_response(
    response: Response<Incoming>,
    method: &Method,
    ctx: &ProxyRequestContext,
    pool: &ConnectionPool,
    buffer_threshold: u64,
) -> Result<Response<ProxyBody>, UpstreamError> {
    let mode = choose_body_mode(method, response.status(), response.headers(), buffer_threshold);
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    // A HEAD answer has no body, so its length still describes the resource
    if *method != Method::HEAD {
        parts.headers.remove(CONTENT_LENGTH);
    }

    let body = match mode {
        BodyMode::Empty => {
            drop(body);
            Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
        }
        BodyMode::Buffer => {
            let bytes = pool.read_body(body).await?;
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            pool.stats().record_buffered();
            full_body(bytes)
        }
        BodyMode::Stream => StreamingBody::new(body, pool.stats(), &ctx.hostname).boxed(),
    };

    debug!(hostname = %ctx.hostname, status = %parts.status, ?mode, request_id = %ctx.request_id, "Relaying response");
    Ok(Response::from_parts(parts, body))
}

/// Marks a backend stream as active until dropped
struct StreamGuard {
    stats: Arc<PoolStats>,
    hostname: String,
    bytes: u64,
    completed: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stats.record_stream_released();
        debug!(
            hostname = %self.hostname,
            bytes = self.bytes,
            completed = self.completed,
            "Backend stream released"
        );
    }
}

/// Backend body relayed to the client without buffering.
///
/// The backend connection is owned by `inner`; it is released when the body
/// ends, errors, or is dropped because the client went away. The guard is
/// taken on the first of those, so the release is accounted exactly once.
pub struct StreamingBody {
    inner: Incoming,
    guard: Option<StreamGuard>,
}

impl StreamingBody {
    pub fn new(inner: Incoming, stats: Arc<PoolStats>, hostname: &str) -> Self {
        stats.record_stream_opened();
        Self {
            inner,
            guard: Some(StreamGuard {
                stats,
                hostname: hostname.to_string(),
                bytes: 0,
                completed: false,
            }),
        }
    }
}

impl Body for StreamingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(guard)) = (frame.data_ref(), this.guard.as_mut()) {
                    guard.bytes += data.len() as u64;
                }
            }
            Poll::Ready(None) => {
                if let Some(mut guard) = this.guard.take() {
                    guard.completed = true;
                }
            }
            Poll::Ready(Some(Err(e))) => {
                debug!(error = %e, "Backend stream failed");
                this.guard.take();
            }
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
