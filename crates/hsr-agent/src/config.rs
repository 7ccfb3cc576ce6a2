use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hsr_core::agent::AgentSettings;
use hsr_core::status_cache::DEFAULT_CAPACITY;
use hsr_core::trust::RefreshPolicy;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    // Collaborators
    pub gateway_url: String,
    pub backend_url: String,
    pub backend_token: Option<String>,

    // Pairing
    pub identity_path: PathBuf,
    pub pairing_token: Option<String>,
    pub device_id: Option<String>,

    // Scheduling
    pub ingest_interval_secs: u64,
    pub status_poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub status_cache_capacity: usize,
    /// Certificate cache lifetime; `None` keeps the set until invalidated.
    pub cert_ttl_secs: Option<u64>,

    // Logging
    pub log_level: String,
    pub log_json: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8080".to_string(),
            backend_url: "http://127.0.0.1:8090".to_string(),
            backend_token: None,
            identity_path: PathBuf::from("hsr-identity.json"),
            pairing_token: None,
            device_id: None,
            ingest_interval_secs: 5,
            status_poll_interval_secs: 30,
            request_timeout_secs: 30,
            status_cache_capacity: DEFAULT_CAPACITY,
            cert_ttl_secs: None,
            log_level: "info".to_string(),
            log_json: false,
            log_dir: None,
        }
    }
}

// Tokens never reach the logs.
impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("AgentConfig")
            .field("gateway_url", &self.gateway_url)
            .field("backend_url", &self.backend_url)
            .field("backend_token", &redact(&self.backend_token))
            .field("identity_path", &self.identity_path)
            .field("pairing_token", &redact(&self.pairing_token))
            .field("device_id", &self.device_id)
            .field("ingest_interval_secs", &self.ingest_interval_secs)
            .field("status_poll_interval_secs", &self.status_poll_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("status_cache_capacity", &self.status_cache_capacity)
            .field("cert_ttl_secs", &self.cert_ttl_secs)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

impl AgentConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", path.display())))?;

        let config: AgentConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        Self::load_from_env_with(|key| std::env::var(key).ok())
    }

    /// Build a configuration from `lookup`, which maps variable names to values.
    pub fn load_from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("HSR_GATEWAY_URL") {
            config.gateway_url = url;
        }
        if let Some(url) = lookup("HSR_BACKEND_URL") {
            config.backend_url = url;
        }
        if let Some(token) = lookup("HSR_BACKEND_TOKEN") {
            config.backend_token = Some(token);
        }
        if let Some(path) = lookup("HSR_IDENTITY_PATH") {
            config.identity_path = PathBuf::from(path);
        }
        if let Some(token) = lookup("HSR_PAIRING_TOKEN") {
            config.pairing_token = Some(token);
        }
        if let Some(id) = lookup("HSR_DEVICE_ID") {
            config.device_id = Some(id);
        }
        if let Some(v) = lookup("HSR_INGEST_INTERVAL_SECS") {
            config.ingest_interval_secs = parse_number("HSR_INGEST_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("HSR_STATUS_POLL_INTERVAL_SECS") {
            config.status_poll_interval_secs = parse_number("HSR_STATUS_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("HSR_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number("HSR_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("HSR_STATUS_CACHE_CAPACITY") {
            config.status_cache_capacity = parse_number("HSR_STATUS_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("HSR_CERT_TTL_SECS") {
            config.cert_ttl_secs = Some(parse_number("HSR_CERT_TTL_SECS", &v)?);
        }
        if let Some(dir) = lookup("HSR_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("RUST_LOG") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("gateway_url", &self.gateway_url)?;
        validate_url("backend_url", &self.backend_url)?;
        if self.ingest_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "ingest_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.status_poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "status_poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.status_cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "status_cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.cert_ttl_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "cert_ttl_secs must be at least 1 when set".to_string(),
            ));
        }
        if self.identity_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "identity_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_settings(&self) -> AgentSettings {
        AgentSettings {
            ingest_interval: Duration::from_secs(self.ingest_interval_secs),
            status_poll_interval: Duration::from_secs(self.status_poll_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            status_cache_capacity: self.status_cache_capacity,
            certificate_refresh: match self.cert_ttl_secs {
                Some(secs) => RefreshPolicy::Ttl(Duration::from_secs(secs)),
                None => RefreshPolicy::Forever,
            },
            device_id: self.device_id.clone(),
        }
    }
}

fn validate_url(field: &str, url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| {
        ConfigError::ValidationError(format!("{field} must be an http(s) URL, got {url:?}: {reason}"))
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid("missing host".to_string())),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("{name} is not a number: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();

        let settings = config.to_settings();
        assert_eq!(settings.ingest_interval, Duration::from_secs(5));
        assert_eq!(settings.status_poll_interval, Duration::from_secs(30));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.status_cache_capacity, 10_000);
        assert_eq!(settings.certificate_refresh, RefreshPolicy::Forever);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = AgentConfig::load_from_env_with(env(&[
            ("HSR_GATEWAY_URL", "https://gw.example.com"),
            ("HSR_BACKEND_TOKEN", "secret"),
            ("HSR_INGEST_INTERVAL_SECS", "2"),
            ("HSR_CERT_TTL_SECS", "600"),
            ("RUST_LOG", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.gateway_url, "https://gw.example.com");
        assert_eq!(config.backend_token.as_deref(), Some("secret"));
        assert_eq!(config.ingest_interval_secs, 2);
        assert_eq!(config.log_level, "debug");
        assert_eq!(
            config.to_settings().certificate_refresh,
            RefreshPolicy::Ttl(Duration::from_secs(600))
        );
    }

    #[test]
    fn env_rejects_non_numeric_interval() {
        let err = AgentConfig::load_from_env_with(env(&[("HSR_STATUS_POLL_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn urls_with_port_path_or_ip_host_are_accepted() {
        for url in ["http://hsm.local:9000", "https://10.0.0.5/api/v1/", "HTTPS://Gateway.Example.com"] {
            assert!(validate_url("gateway_url", url).is_ok(), "{url}");
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut AgentConfig)>> = vec![
            Box::new(|c| c.gateway_url = String::new()),
            Box::new(|c| c.backend_url = "ftp://backend".to_string()),
            Box::new(|c| c.gateway_url = "https://".to_string()),
            Box::new(|c| c.gateway_url = "http://:8080/api".to_string()),
            Box::new(|c| c.backend_url = "not a url".to_string()),
            Box::new(|c| c.backend_url = "mailto:ops@example.com".to_string()),
            Box::new(|c| c.ingest_interval_secs = 0),
            Box::new(|c| c.status_poll_interval_secs = 0),
            Box::new(|c| c.status_cache_capacity = 0),
            Box::new(|c| c.cert_ttl_secs = Some(0)),
        ];
        for mutate in cases {
            let mut config = AgentConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
        }
    }

    #[test]
    fn load_from_file_applies_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
gateway_url = "https://gw.example.com"
backend_url = "http://hsm.local:9000"
status_poll_interval_secs = 10
"#,
        )
        .unwrap();

        let config = AgentConfig::load_from_file(&path).unwrap();
        assert_eq!(config.gateway_url, "https://gw.example.com");
        assert_eq!(config.status_poll_interval_secs, 10);
        assert_eq!(config.ingest_interval_secs, 5);
    }

    #[test]
    fn load_from_file_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            AgentConfig::load_from_file(&missing),
            Err(ConfigError::FileNotFound(_))
        ));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "gateway_url = ").unwrap();
        assert!(matches!(
            AgentConfig::load_from_file(&broken),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let config = AgentConfig {
            backend_token: Some("backend-secret".to_string()),
            pairing_token: Some("pairing-secret".to_string()),
            ..AgentConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("backend-secret"));
        assert!(!rendered.contains("pairing-secret"));
    }
}
