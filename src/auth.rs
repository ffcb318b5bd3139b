//! Authentication gate in front of the proxy
//!
//! The gateway only checks sessions; issuing them (the login UI and user
//! store) happens elsewhere. A request either carries a valid session cookie
//! or is redirected to the login flow with its original URL attached.

use crate::config::Settings;
use crate::error::{full_body, ProxyBody};
use chrono::{Duration, Utc};
use hyper::header::{HeaderMap, HeaderValue, CACHE_CONTROL, COOKIE, LOCATION, SET_COOKIE};
use hyper::{Response, StatusCode};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// The authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

/// Result of checking a request
pub enum AuthOutcome {
    Allowed(Identity),
    /// Send this response instead of proxying
    Redirect(Response<ProxyBody>),
}

/// Per-request session check
pub trait Authenticator: Send + Sync {
    /// `original_url` is where the login flow should send the user back to
    fn authenticate(&self, headers: &HeaderMap, original_url: &str) -> AuthOutcome;
}

/// Shared handle, swapped on configuration reload
pub type SharedAuthenticator = Arc<dyn Authenticator>;

/// Build the authenticator described by the settings
pub fn from_settings(settings: &Settings) -> SharedAuthenticator {
    let auth = &settings.auth;
    match auth.secret_key.as_deref() {
        Some(secret) if auth.enabled => Arc::new(JwtCookieAuth::new(JwtCookieConfig {
            secret: secret.to_string(),
            cookie_name: auth.cookie_name.clone(),
            cookie_domain: auth.cookie_domain.clone(),
            cookie_secure: settings.base_url_is_https(),
            login_url: settings.login_url(),
            token_expiry_hours: 24,
        })),
        _ => Arc::new(NoAuth),
    }
}

/// Lets every request through as an anonymous user
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate(&self, _headers: &HeaderMap, _original_url: &str) -> AuthOutcome {
        AuthOutcome::Allowed(Identity {
            username: "anonymous".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct JwtCookieConfig {
    pub secret: String,
    pub cookie_name: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    /// Absolute URL of the login flow on the gateway hostname
    pub login_url: String,
    /// Lifetime of tokens issued by `create_token`
    pub token_expiry_hours: i64,
}

/// HS256 session tokens carried in a cookie
pub struct JwtCookieAuth {
    config: JwtCookieConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCookieAuth {
    pub fn new(config: JwtCookieConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn config(&self) -> &JwtCookieConfig {
        &self.config
    }

    pub fn create_token(&self, username: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.config.token_expiry_hours);

        let claims = Claims {
            sub: username.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
    }

    pub fn extract_token_from_cookie(&self, cookie_header: &str) -> Option<String> {
        let prefix = format!("{}=", self.config.cookie_name);
        cookie_header
            .split(';')
            .map(str::trim)
            .filter_map(|cookie| cookie.strip_prefix(prefix.as_str()))
            .find(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Set-Cookie value that deletes the session cookie
    pub fn create_logout_cookie(&self) -> String {
        let mut cookie = format!("{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax", self.config.cookie_name);
        if let Some(domain) = &self.config.cookie_domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Redirect to the login flow, carrying the URL to come back to.
    /// `clear_cookie` expires whatever session cookie the browser holds.
    pub fn login_redirect(&self, original_url: &str, clear_cookie: bool) -> Response<ProxyBody> {
        let location = format!(
            "{}?next={}",
            self.config.login_url,
            urlencoding::encode(original_url)
        );

        let mut response = Response::new(full_body(""));
        *response.status_mut() = StatusCode::TEMPORARY_REDIRECT;
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&location) {
            headers.insert(LOCATION, value);
        }
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if clear_cookie {
            if let Ok(value) = HeaderValue::from_str(&self.create_logout_cookie()) {
                headers.insert(SET_COOKIE, value);
            }
        }
        response
    }

    fn session_token(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| self.extract_token_from_cookie(v))
    }
}

impl Authenticator for JwtCookieAuth {
    fn authenticate(&self, headers: &HeaderMap, original_url: &str) -> AuthOutcome {
        let Some(token) = self.session_token(headers) else {
            return AuthOutcome::Redirect(self.login_redirect(original_url, true));
        };

        match self.verify_token(&token) {
            Ok(data) if !data.claims.sub.is_empty() => AuthOutcome::Allowed(Identity {
                username: data.claims.sub,
            }),
            Ok(_) => {
                debug!("Session token has no subject");
                AuthOutcome::Redirect(self.login_redirect(original_url, true))
            }
            Err(e) => {
                debug!(error = %e, "Session token rejected");
                AuthOutcome::Redirect(self.login_redirect(original_url, true))
            }
        }
    }
}
