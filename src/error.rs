//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Carries the machine-readable error code on gateway-generated errors
pub const X_MOAT_ERROR: HeaderName = HeaderName::from_static("x-moat-error");

/// Response body type used throughout the gateway
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route registered for the hostname
    UnknownHost,
    /// Backend refused the connection or is unreachable
    BackendUnavailable,
    /// Backend did not answer within the read timeout
    BackendTimeout,
    /// Backend answered with something that is not valid HTTP
    BadGateway,
    /// Login path requested but no login backend is configured
    LoginUnavailable,
    /// Unexpected proxy failure
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::LoginUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Moat-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::BackendTimeout => "BACKEND_TIMEOUT",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::LoginUnavailable => "LOGIN_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Generic, caller-safe description of the failure class
    pub fn message(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "Missing or invalid Host header",
            ProxyErrorCode::UnknownHost => "No service is registered for this host",
            ProxyErrorCode::BackendUnavailable => "Service is unavailable",
            ProxyErrorCode::BackendTimeout => "Service did not respond in time",
            ProxyErrorCode::BadGateway => "Service returned an invalid response",
            ProxyErrorCode::LoginUnavailable => "Login is not available",
            ProxyErrorCode::InternalError => "Internal gateway error",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
    /// Hostname the request was addressed to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, hostname: Option<&str>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: code.message().to_string(),
            hostname: hostname.map(str::to_string),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message,
                self.status
            )
        })
    }
}

/// Wrap a fixed payload as a response body
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Moat-Error header
pub fn json_error_response(code: ProxyErrorCode, hostname: Option<&str>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, hostname);
    let body = error.to_json();

    let mut response = Response::new(full_body(body));
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_MOAT_ERROR, HeaderValue::from_static(code.as_header_value()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::BackendTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ProxyErrorCode::BadGateway.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyErrorCode::LoginUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownHost, Some("example.com"));
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"hostname\":\"example.com\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::BackendTimeout, None);

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Moat-Error").unwrap(),
            "BACKEND_TIMEOUT"
        );
    }
}
