use crate::admin::{self, HEALTH_PATH, SERVICES_PATH};
use crate::auth::{self, AuthOutcome, SharedAuthenticator};
use crate::config::Settings;
use crate::error::{json_error_response, ProxyBody, ProxyErrorCode};
use crate::forward::{
    build_outbound_request, relay_response, split_host, ProxyRequestContext, X_FORWARDED_PROTO,
    X_REQUEST_ID,
};
use crate::pool::{ConnectionPool, PoolConfig, UpstreamError};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::registry::SharedRegistry;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum hostname length (DNS limit)
const MAX_HOSTNAME_LEN: usize = 253;

/// State shared by every request: routing table, outbound client, and the
/// hot-reloadable parts of the configuration
pub struct Gateway {
    registry: SharedRegistry,
    reconciler: Arc<Reconciler>,
    pool: ConnectionPool,
    settings: RwLock<Arc<Settings>>,
    authenticator: RwLock<SharedAuthenticator>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl Gateway {
    pub fn new(settings: Settings, reconciler: Arc<Reconciler>) -> Arc<Self> {
        let pool = ConnectionPool::new(PoolConfig::from(&settings.proxy));
        let authenticator = auth::from_settings(&settings);

        Arc::new(Self {
            registry: Arc::clone(reconciler.registry()),
            reconciler,
            pool,
            settings: RwLock::new(Arc::new(settings)),
            authenticator: RwLock::new(authenticator),
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.read())
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn authenticator(&self) -> SharedAuthenticator {
        Arc::clone(&self.authenticator.read())
    }

    /// Apply the startup configuration
    pub async fn start(&self) -> ReconcileReport {
        let _guard = self.reload_lock.lock().await;
        let settings = self.settings();
        self.reconciler.reconcile(None, &settings).await
    }

    /// Switch to a newly loaded configuration. Returns `None` when it is
    /// identical to the one in effect.
    pub async fn apply_settings(&self, new: Settings) -> Option<ReconcileReport> {
        let _guard = self.reload_lock.lock().await;
        let old = self.settings();
        if *old == new {
            debug!("Configuration unchanged, nothing to apply");
            return None;
        }

        if old.server.bind != new.server.bind || old.server.port != new.server.port {
            warn!("Listener address changed; restart required for it to take effect");
        }
        if PoolConfig::from(&old.proxy) != PoolConfig::from(&new.proxy) {
            warn!("Backend client settings changed; restart required for them to take effect");
        }

        let report = self.reconciler.reconcile(Some(&old), &new).await;
        *self.authenticator.write() = auth::from_settings(&new);
        *self.settings.write() = Arc::new(new);
        Some(report)
    }

    /// Stop background discovery
    pub async fn shutdown(&self) {
        self.reconciler.shutdown().await;
    }
}

/// The main reverse proxy server
pub struct ProxyServer {
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(gateway: Arc<Gateway>, shutdown: CancellationToken) -> Self {
        Self { gateway, shutdown }
    }

    pub async fn run(self, bind_addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Gateway listener shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Run one request through the gateway; every outcome becomes a response
pub async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let settings = gateway.settings();
    let mut response = route_request(req, &gateway, &settings, client_addr, &request_id).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn route_request(
    req: Request<Incoming>,
    gateway: &Gateway,
    settings: &Settings,
    client_addr: SocketAddr,
    request_id: &str,
) -> Response<ProxyBody> {
    if req.uri().path() == HEALTH_PATH {
        return admin::health_response(
            settings.discovery.enabled,
            gateway.reconciler.discovery_active(),
        );
    }

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => return json_error_response(ProxyErrorCode::MissingHostHeader, None),
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let is_gateway_host = settings.gateway_hostname().as_deref() == Some(hostname.as_str());

    if is_gateway_host && req.uri().path() == "/" {
        return admin::root_redirect(&settings.server.admin_path);
    }

    // The login flow lives on the gateway hostname and needs no session.
    // It never goes through the routing table.
    if is_gateway_host && settings.is_login_path(req.uri().path()) {
        let Some(target) = settings.auth.login_service_url.clone() else {
            debug!(hostname, request_id, "Login requested but no login service is configured");
            return json_error_response(ProxyErrorCode::LoginUnavailable, Some(&hostname));
        };
        let ctx = request_context(hostname, target, client_addr, request_id);
        return proxy_to(req, &ctx, gateway, settings).await;
    }

    let url = original_url(&req, &hostname, settings);
    match gateway.authenticator().authenticate(req.headers(), &url) {
        AuthOutcome::Allowed(identity) => {
            debug!(hostname, user = %identity.username, request_id, "Request authenticated");
        }
        AuthOutcome::Redirect(response) => {
            debug!(hostname, request_id, "No valid session, redirecting to login");
            return response;
        }
    }

    if req.uri().path() == SERVICES_PATH {
        return admin::services_response(&gateway.registry);
    }

    let target = match gateway.registry.resolve(&hostname) {
        Some(target) => target,
        None => {
            debug!(hostname, request_id, "No route for host");
            return json_error_response(ProxyErrorCode::UnknownHost, Some(&hostname));
        }
    };

    let ctx = request_context(hostname, target, client_addr, request_id);
    proxy_to(req, &ctx, gateway, settings).await
}

fn request_context(
    hostname: String,
    target_base: String,
    client_addr: SocketAddr,
    request_id: &str,
) -> ProxyRequestContext {
    ProxyRequestContext {
        hostname,
        target_base,
        client_ip: client_addr.ip(),
        request_id: request_id.to_string(),
        scheme: "http",
    }
}

/// Forward to the context's target, turning failures into JSON errors
async fn proxy_to(
    req: Request<Incoming>,
    ctx: &ProxyRequestContext,
    gateway: &Gateway,
    settings: &Settings,
) -> Response<ProxyBody> {
    match forward(req, ctx, gateway, settings).await {
        Ok(response) => response,
        Err(e) => {
            // Details stay in the log; the client only sees the failure class
            warn!(
                hostname = %ctx.hostname,
                target = %ctx.target_base,
                request_id = %ctx.request_id,
                error = %e,
                "Backend request failed"
            );
            json_error_response(e.error_code(), Some(&ctx.hostname))
        }
    }
}

async fn forward(
    req: Request<Incoming>,
    ctx: &ProxyRequestContext,
    gateway: &Gateway,
    settings: &Settings,
) -> Result<Response<ProxyBody>, UpstreamError> {
    let method = req.method().clone();
    let outbound = build_outbound_request(req, ctx)?;

    debug!(hostname = %ctx.hostname, target = %outbound.uri(), request_id = %ctx.request_id, "Forwarding request");

    let response = gateway.pool.send_request(outbound).await?;
    relay_response(
        response,
        &method,
        ctx,
        &gateway.pool,
        settings.proxy.buffer_threshold_bytes,
    )
    .await
}

/// Full URL the client asked for, used as the post-login return address
fn original_url(req: &Request<Incoming>, hostname: &str, settings: &Settings) -> String {
    let scheme = req
        .headers()
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| {
            if settings.base_url_is_https() { "https" } else { "http" }.to_string()
        });
    let authority = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(hostname);
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    format!("{}://{}{}", scheme, authority, path)
}

/// Hostname from the Host header (or the HTTP/2 authority), port stripped,
/// validated and lowercased
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.headers().get(HOST) {
        Some(value) => value.to_str().ok()?,
        None => req.uri().host()?,
    };
    let (hostname, _) = split_host(raw.trim());

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; keeps hostnames out of log injection
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.to_lowercase())
}
