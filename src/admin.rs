//! Endpoints served by the gateway itself rather than proxied

use crate::error::{full_body, ProxyBody};
use crate::registry::{ServiceRegistry, SourceKind};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HEALTH_PATH: &str = "/moat/health";
pub const SERVICES_PATH: &str = "/moat/services";

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<hyper::body::Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub discovery_configured: &'static str,
    pub discovery_active: &'static str,
    pub effective_discovery_status: &'static str,
}

impl HealthStatus {
    pub fn new(configured: bool, active: bool) -> Self {
        Self {
            status: "ok",
            version: VERSION,
            discovery_configured: if configured { "enabled" } else { "disabled" },
            discovery_active: if active { "running" } else { "not_running" },
            effective_discovery_status: match (configured, active) {
                (true, true) => "enabled_and_running",
                (true, false) => "enabled_not_running",
                (false, _) => "disabled",
            },
        }
    }
}

/// `GET /moat/health`
pub fn health_response(discovery_configured: bool, discovery_active: bool) -> Response<ProxyBody> {
    let status = HealthStatus::new(discovery_configured, discovery_active);
    match serde_json::to_string(&status) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(_) => json_response(StatusCode::OK, r#"{"status":"ok"}"#),
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceView {
    pub hostname: String,
    pub target_url: String,
    pub source: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

/// Registry contents, sorted by hostname
pub fn list_services(registry: &ServiceRegistry) -> Vec<ServiceView> {
    let mut services: Vec<ServiceView> = registry
        .snapshot()
        .into_iter()
        .map(|(hostname, entry)| ServiceView {
            hostname,
            target_url: entry.target_url,
            source: entry.source,
            origin_id: entry.origin_id,
        })
        .collect();
    services.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    services
}

/// `GET /moat/services`
pub fn services_response(registry: &ServiceRegistry) -> Response<ProxyBody> {
    let body = serde_json::json!({ "services": list_services(registry) });
    json_response(StatusCode::OK, body.to_string())
}

/// `/` on the gateway's own hostname goes to the admin console
pub fn root_redirect(admin_path: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(""));
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(location) = HeaderValue::from_str(admin_path) {
        response.headers_mut().insert(LOCATION, location);
    }
    response
}
