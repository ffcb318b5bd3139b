use hyper::Uri;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Gateway settings, loaded from a TOML file and hot-reloaded on change
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Listener and gateway identity
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound proxy behaviour
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Session authentication
    #[serde(default)]
    pub auth: AuthSettings,

    /// Container discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Routes defined directly in configuration
    #[serde(default)]
    pub static_services: Vec<StaticService>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Public URL of the gateway itself. Its hostname is never proxied at `/`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Where requests for `/` on the gateway hostname are redirected
    #[serde(default = "default_admin_path")]
    pub admin_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            base_url: default_base_url(),
            admin_path: default_admin_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Time allowed to establish a backend connection (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed for the response head, and for the body of buffered responses (default: 120)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Responses with a Content-Length at or below this size are buffered (default: 1 MiB)
    #[serde(default = "default_buffer_threshold")]
    pub buffer_threshold_bytes: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            buffer_threshold_bytes: default_buffer_threshold(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AuthSettings {
    /// Require a valid session for proxied traffic (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HS256 signing key for session tokens
    pub secret_key: Option<String>,

    /// Session cookie name
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Domain attribute for the session cookie, so one login covers all subdomains
    pub cookie_domain: Option<String>,

    /// Path of the external login flow, served on the gateway hostname
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Backend serving the login flow. Without it the login path answers 503.
    pub login_service_url: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            secret_key: None,
            cookie_name: default_cookie_name(),
            cookie_domain: None,
            login_path: default_login_path(),
            login_service_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Watch the container runtime for labeled containers (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Label namespace, e.g. `moat.enable` (default: "moat")
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Docker endpoint (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            label_prefix: default_label_prefix(),
            docker_host: None,
        }
    }
}

/// A route defined in configuration
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct StaticService {
    pub hostname: String,
    pub target_url: String,
}

impl StaticService {
    pub fn new(hostname: &str, target_url: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            target_url: target_url.to_string(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_admin_path() -> String {
    "/moat/admin/config".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    120
}

fn default_buffer_threshold() -> u64 {
    1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

fn default_cookie_name() -> String {
    "moat_access_token".to_string()
}

fn default_login_path() -> String {
    "/moat/auth/login".to_string()
}

fn default_label_prefix() -> String {
    "moat".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            auth: AuthSettings::default(),
            discovery: DiscoveryConfig::default(),
            static_services: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = toml::from_str(content)?;
        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    fn normalize(&mut self) {
        for service in &mut self.static_services {
            service.hostname = service.hostname.trim().to_lowercase();
            service.target_url = service.target_url.trim().to_string();
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for service in &self.static_services {
            if service.hostname.is_empty() {
                errors.push(format!(
                    "static service with target '{}' has an empty hostname",
                    service.target_url
                ));
                continue;
            }
            if !seen.insert(service.hostname.as_str()) {
                errors.push(format!("duplicate static service hostname '{}'", service.hostname));
            }
            if let Err(e) = validate_target_url(&service.target_url) {
                errors.push(format!("static service '{}': {}", service.hostname, e));
            }
        }

        if self.discovery.label_prefix.trim().is_empty() {
            errors.push("discovery.label_prefix must not be empty".to_string());
        }

        if self.auth.enabled
            && self.auth.secret_key.as_deref().map_or(true, |k| k.is_empty())
        {
            errors.push("auth.secret_key is required when auth is enabled".to_string());
        }

        if !self.auth.login_path.starts_with('/') {
            errors.push(format!(
                "auth.login_path '{}' must start with '/'",
                self.auth.login_path
            ));
        }
        if let Some(url) = &self.auth.login_service_url {
            if let Err(e) = validate_target_url(url) {
                errors.push(format!("auth.login_service_url: {}", e));
            }
        }

        if self.proxy.connect_timeout_secs == 0 || self.proxy.read_timeout_secs == 0 {
            errors.push("proxy timeouts must be greater than 0".to_string());
        }

        if self.gateway_hostname().is_none() {
            errors.push(format!(
                "server.base_url '{}' is not an absolute URL",
                self.server.base_url
            ));
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    /// Hostname of the gateway itself, taken from `server.base_url`
    pub fn gateway_hostname(&self) -> Option<String> {
        let uri: Uri = self.server.base_url.parse().ok()?;
        uri.host().map(|h| h.to_lowercase())
    }

    pub fn base_url_is_https(&self) -> bool {
        self.server.base_url.starts_with("https://")
    }

    /// Absolute URL of the login flow on the gateway hostname
    pub fn login_url(&self) -> String {
        format!(
            "{}{}",
            self.server.base_url.trim_end_matches('/'),
            self.auth.login_path
        )
    }

    /// Whether `path` falls under the login flow
    pub fn is_login_path(&self, path: &str) -> bool {
        let login = self.auth.login_path.trim_end_matches('/');
        match path.strip_prefix(login) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || login.is_empty(),
            None => false,
        }
    }
}

/// Check that a backend target is `http://host[:port][/prefix]`
pub fn validate_target_url(target: &str) -> Result<(), String> {
    let uri: Uri = target
        .parse()
        .map_err(|e| format!("invalid target URL '{}': {}", target, e))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(format!(
                "unsupported scheme '{}' in '{}', only http backends are supported",
                other, target
            ))
        }
        None => return Err(format!("target URL '{}' is missing a scheme", target)),
    }

    if uri.host().map_or(true, str::is_empty) {
        return Err(format!("target URL '{}' is missing a host", target));
    }

    if uri.query().is_some() {
        return Err(format!("target URL '{}' must not contain a query string", target));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "[auth]\nsecret_key = \"test-secret\"\n";

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
base_url = "https://moat.example.com"

[proxy]
read_timeout_secs = 300
buffer_threshold_bytes = 4096

[auth]
secret_key = "s3cret"
cookie_domain = ".example.com"

[discovery]
enabled = true
label_prefix = "edge"

[[static_services]]
hostname = "A.Test"
target_url = "http://127.0.0.1:9001"

[[static_services]]
hostname = "docs.test"
target_url = "http://10.0.0.5:8080/docs"
"#;

        let settings = Settings::from_toml_str(toml).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.proxy.read_timeout(), Duration::from_secs(300));
        assert_eq!(settings.proxy.buffer_threshold_bytes, 4096);
        assert!(settings.discovery.enabled);
        assert_eq!(settings.discovery.label_prefix, "edge");
        assert_eq!(settings.static_services.len(), 2);
        assert_eq!(settings.static_services[0].hostname, "a.test");
        assert_eq!(settings.gateway_hostname().as_deref(), Some("moat.example.com"));
        assert!(settings.base_url_is_https());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let settings = Settings::from_toml_str(SECRET).unwrap();

        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.server.bind, "0.0.0.0");
        assert_eq!(settings.server.admin_path, "/moat/admin/config");
        assert_eq!(settings.proxy.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.proxy.read_timeout(), Duration::from_secs(120));
        assert_eq!(settings.proxy.buffer_threshold_bytes, 1024 * 1024);
        assert!(settings.auth.enabled);
        assert_eq!(settings.auth.cookie_name, "moat_access_token");
        assert!(!settings.discovery.enabled);
        assert_eq!(settings.discovery.label_prefix, "moat");
        assert!(settings.static_services.is_empty());
        assert_eq!(settings.gateway_hostname().as_deref(), Some("localhost"));
    }

    #[test]
    fn test_auth_requires_secret() {
        let err = Settings::from_toml_str("").unwrap_err();
        assert!(err.to_string().contains("auth.secret_key"));

        let settings = Settings::from_toml_str("[auth]\nenabled = false\n").unwrap();
        assert!(!settings.auth.enabled);
    }

    #[test]
    fn test_duplicate_hostnames_rejected() {
        let toml = format!(
            r#"{}
[[static_services]]
hostname = "a.test"
target_url = "http://127.0.0.1:1"

[[static_services]]
hostname = "A.TEST"
target_url = "http://127.0.0.1:2"
"#,
            SECRET
        );
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("duplicate static service hostname 'a.test'"));
    }

    #[test]
    fn test_all_errors_reported() {
        let toml = r#"
[discovery]
label_prefix = ""

[[static_services]]
hostname = ""
target_url = "http://127.0.0.1:1"

[[static_services]]
hostname = "b.test"
target_url = "https://127.0.0.1:2"
"#;
        match Settings::from_toml_str(toml).unwrap_err() {
            ConfigError::Invalid(errors) => {
                assert_eq!(errors.len(), 4);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validate_target_url() {
        assert!(validate_target_url("http://127.0.0.1:9001").is_ok());
        assert!(validate_target_url("http://backend").is_ok());
        assert!(validate_target_url("http://backend:80/prefix").is_ok());
        assert!(validate_target_url("https://backend").is_err());
        assert!(validate_target_url("backend:80").is_err());
        assert!(validate_target_url("/only/a/path").is_err());
        assert!(validate_target_url("http://backend/?q=1").is_err());
    }

    #[test]
    fn test_login_url_and_path_matching() {
        let toml = r#"
[server]
base_url = "https://moat.example.com/"

[auth]
secret_key = "s3cret"
login_service_url = "http://127.0.0.1:7000"
"#;
        let settings = Settings::from_toml_str(toml).unwrap();
        assert_eq!(settings.login_url(), "https://moat.example.com/moat/auth/login");
        assert!(settings.is_login_path("/moat/auth/login"));
        assert!(settings.is_login_path("/moat/auth/login/callback"));
        assert!(!settings.is_login_path("/moat/auth/login-admin/secrets"));
        assert!(!settings.is_login_path("/moat/auth"));

        let bad = format!("{}login_service_url = \"https://login\"\nlogin_path = \"login\"\n", SECRET);
        match Settings::from_toml_str(&bad).unwrap_err() {
            ConfigError::Invalid(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moat.toml");
        std::fs::write(
            &path,
            format!(
                "{}\n[[static_services]]\nhostname = \"a.test\"\ntarget_url = \"http://127.0.0.1:9001\"\n",
                SECRET
            ),
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.static_services, vec![StaticService::new("a.test", "http://127.0.0.1:9001")]);

        assert!(matches!(
            Settings::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
