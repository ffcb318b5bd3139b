//! Outbound HTTP client for backend connections
//!
//! Wraps a pooled hyper client with a connect timeout on the connector and a
//! read timeout around the response head (and around buffered bodies), and
//! classifies client failures into the gateway's error taxonomy.

use crate::config::ProxyConfig;
use crate::error::{ProxyBody, ProxyErrorCode};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for backend requests
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Connection refused, unreachable, or the connect timeout elapsed
    #[error("backend unreachable: {0}")]
    Unavailable(#[source] hyper_util::client::legacy::Error),

    /// The backend did not produce a response (or body) within the read timeout
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend spoke invalid HTTP or dropped the connection mid-response
    #[error("backend protocol error: {0}")]
    Protocol(#[source] Box<dyn StdError + Send + Sync>),

    /// Anything else, e.g. a request that could not be built
    #[error("proxy error: {0}")]
    Internal(String),
}

impl UpstreamError {
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            UpstreamError::Unavailable(_) => ProxyErrorCode::BackendUnavailable,
            UpstreamError::Timeout(_) => ProxyErrorCode::BackendTimeout,
            UpstreamError::Protocol(_) => ProxyErrorCode::BadGateway,
            UpstreamError::Internal(_) => ProxyErrorCode::InternalError,
        }
    }

    fn from_client(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            return UpstreamError::Unavailable(err);
        }
        if has_source::<hyper::Error>(&err) {
            return UpstreamError::Protocol(Box::new(err));
        }
        UpstreamError::Internal(err.to_string())
    }
}

/// Whether any error in the source chain has type `T`
fn has_source<T: StdError + 'static>(err: &(dyn StdError + 'static)) -> bool {
    let mut current = err.source();
    while let Some(e) = current {
        if e.is::<T>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Statistics for backend traffic
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent to backends
    pub total_requests: AtomicU64,
    /// Responses relayed after reading the full body
    pub buffered_responses: AtomicU64,
    /// Responses relayed chunk by chunk
    pub streamed_responses: AtomicU64,
    /// Streamed responses whose backend body is still held
    pub active_streams: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self) {
        self.buffered_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_opened(&self) {
        self.streamed_responses.fetch_add(1, Ordering::Relaxed);
        self.active_streams.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_stream_released(&self) {
        self.active_streams.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_buffered_responses(&self) -> u64 {
        self.buffered_responses.load(Ordering::Relaxed)
    }

    pub fn get_streamed_responses(&self) -> u64 {
        self.streamed_responses.load(Ordering::Relaxed)
    }

    pub fn get_active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::SeqCst)
    }
}

/// Configuration for the backend client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Time allowed to establish a connection
    pub connect_timeout: Duration,
    /// Time allowed for the response head and for buffered bodies
    pub read_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for PoolConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        }
    }
}

/// A pooled HTTP client for backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        // Redirects are never followed; the legacy client relays them as-is.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_secs = config.connect_timeout.as_secs(),
            read_timeout_secs = config.read_timeout.as_secs(),
            "Backend connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a fully prepared request and wait for the response head
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        self.stats.record_request();

        match tokio::time::timeout(self.config.read_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(UpstreamError::from_client(e)),
            Err(_) => Err(UpstreamError::Timeout(self.config.read_timeout)),
        }
    }

    /// Read a backend body to completion within the read timeout
    pub async fn read_body(&self, body: Incoming) -> Result<Bytes, UpstreamError> {
        match tokio::time::timeout(self.config.read_timeout, body.collect()).await {
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
            Ok(Err(e)) => Err(UpstreamError::Protocol(Box::new(e))),
            Err(_) => Err(UpstreamError::Timeout(self.config.read_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_idle_per_host: 2,
            idle_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(300),
        }
    }

    fn get(uri: &str) -> Request<ProxyBody> {
        Request::builder().uri(uri).body(full_body("")).unwrap()
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        stats.record_request();
        stats.record_buffered();
        stats.record_stream_opened();
        assert_eq!(stats.get_total_requests(), 1);
        assert_eq!(stats.get_buffered_responses(), 1);
        assert_eq!(stats.get_streamed_responses(), 1);
        assert_eq!(stats.get_active_streams(), 1);

        stats.record_stream_released();
        assert_eq!(stats.get_active_streams(), 0);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            UpstreamError::Timeout(Duration::from_secs(1)).error_code(),
            ProxyErrorCode::BackendTimeout
        );
        assert_eq!(
            UpstreamError::Internal("x".into()).error_code(),
            ProxyErrorCode::InternalError
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = ConnectionPool::new(test_config());
        let err = pool
            .send_request(get(&format!("http://127.0.0.1:{}/", port)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ProxyErrorCode::BackendUnavailable);
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let pool = ConnectionPool::new(test_config());
        let err = pool
            .send_request(get(&format!("http://127.0.0.1:{}/", port)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ProxyErrorCode::BackendTimeout);
    }

    #[tokio::test]
    async fn test_garbage_response_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(b"this is not http\r\n\r\n").await;
            let _ = socket.shutdown().await;
        });

        let pool = ConnectionPool::new(test_config());
        let err = pool
            .send_request(get(&format!("http://127.0.0.1:{}/", port)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ProxyErrorCode::BadGateway);
    }
}
