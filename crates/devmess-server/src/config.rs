//! Server configuration loaded from environment variables.
//!
//! Everything except the signing secret has a default suitable for local
//! development. Secrets are redacted from the `Debug` output so the loaded
//! configuration can be logged at startup.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET must be set")]
    MissingSigningSecret,
}

/// Outbound mail settings.
#[derive(Clone, Default)]
pub struct SmtpConfig {
    /// Env: `SMTP_HOST`
    pub host: String,
    /// Env: `SMTP_PORT`, default `587`
    pub port: u16,
    /// Env: `SMTP_USERNAME`
    pub username: String,
    /// Env: `SMTP_PASSWORD`
    pub password: String,
    /// Env: `SMTP_FROM`, defaults to the username
    pub from: String,
}

impl SmtpConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.username.is_empty()
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("from", &self.from)
            .finish()
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/devmess.db`
    pub database_path: PathBuf,

    /// Redis host and port.
    /// Env: `REDIS_HOST`, `REDIS_PORT`
    /// Default: `127.0.0.1:6379`
    pub redis_host: String,
    pub redis_port: u16,

    /// HMAC secret for every signed token. Required.
    /// Env: `JWT_SECRET`
    pub jwt_secret: String,

    /// Google OAuth client. Federated sign-in is disabled while the client
    /// id is empty.
    /// Env: `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET`, `GOOGLE_REDIRECT_URL`
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_redirect_url: String,

    /// Public URL of the web client, used for reset links and redirects.
    /// Env: `FRONTEND_URL`
    /// Default: `http://localhost:3000`
    pub frontend_url: String,

    /// Public URL of this server.
    /// Env: `BACKEND_URL`
    /// Default: `http://localhost:8080`
    pub backend_url: String,

    pub smtp: SmtpConfig,

    /// Root directory for uploaded files and avatars.
    /// Env: `STORAGE_PATH`
    /// Default: `./uploads`
    pub storage_path: PathBuf,

    /// Maximum upload size in bytes (10 MiB).
    /// Env: `MAX_UPLOAD_SIZE`
    pub max_upload_size: usize,

    /// Per-IP request rate and burst.
    /// Env: `RATE_LIMIT_PER_SEC`, `RATE_LIMIT_BURST`
    /// Default: 5 req/s, burst 5
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,

    /// Domain attribute of the session cookie set after federated sign-in.
    /// Env: `COOKIE_DOMAIN`
    pub cookie_domain: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], devmess_shared::constants::DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./data/devmess.db"),
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            jwt_secret: String::new(),
            google_client_id: String::new(),
            google_client_secret: String::new(),
            google_redirect_url: "http://localhost:8080/api/auth/google/callback".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            backend_url: "http://localhost:8080".to_string(),
            smtp: SmtpConfig {
                port: 587,
                ..SmtpConfig::default()
            },
            storage_path: PathBuf::from("./uploads"),
            max_upload_size: 10 * 1024 * 1024, // 10 MiB
            rate_limit_per_sec: 5.0,
            rate_limit_burst: 5.0,
            cookie_domain: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("redis_host", &self.redis_host)
            .field("redis_port", &self.redis_port)
            .field("jwt_secret", &redacted(&self.jwt_secret))
            .field("google_client_id", &self.google_client_id)
            .field("google_client_secret", &redacted(&self.google_client_secret))
            .field("google_redirect_url", &self.google_redirect_url)
            .field("frontend_url", &self.frontend_url)
            .field("backend_url", &self.backend_url)
            .field("smtp", &self.smtp)
            .field("storage_path", &self.storage_path)
            .field("max_upload_size", &self.max_upload_size)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("cookie_domain", &self.cookie_domain)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(host) = lookup("REDIS_HOST") {
            config.redis_host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            parse_into(&port, "REDIS_PORT", &mut config.redis_port);
        }

        config.jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSigningSecret)?;

        // -- Federated identity --

        if let Some(id) = lookup("GOOGLE_CLIENT_ID") {
            config.google_client_id = id;
        }
        if let Some(secret) = lookup("GOOGLE_CLIENT_SECRET") {
            config.google_client_secret = secret;
        }
        if let Some(url) = lookup("GOOGLE_REDIRECT_URL") {
            config.google_redirect_url = url;
        }

        if let Some(url) = lookup("FRONTEND_URL") {
            config.frontend_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("BACKEND_URL") {
            config.backend_url = url.trim_end_matches('/').to_string();
        }

        // -- Mail --

        if let Some(host) = lookup("SMTP_HOST") {
            config.smtp.host = host;
        }
        if let Some(port) = lookup("SMTP_PORT") {
            parse_into(&port, "SMTP_PORT", &mut config.smtp.port);
        }
        if let Some(user) = lookup("SMTP_USERNAME") {
            config.smtp.username = user;
        }
        if let Some(password) = lookup("SMTP_PASSWORD") {
            config.smtp.password = password;
        }
        config.smtp.from = lookup("SMTP_FROM").unwrap_or_else(|| config.smtp.username.clone());

        // -- Storage & limits --

        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(size) = lookup("MAX_UPLOAD_SIZE") {
            parse_into(&size, "MAX_UPLOAD_SIZE", &mut config.max_upload_size);
        }
        if let Some(rate) = lookup("RATE_LIMIT_PER_SEC") {
            parse_into(&rate, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        }
        if let Some(burst) = lookup("RATE_LIMIT_BURST") {
            parse_into(&burst, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);
        }

        if let Some(domain) = lookup("COOKIE_DOMAIN") {
            if !domain.is_empty() {
                config.cookie_domain = Some(domain);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        Ok(config)
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    pub fn google_enabled(&self) -> bool {
        !self.google_client_id.is_empty()
    }
}

fn parse_into<T: std::str::FromStr>(raw: &str, key: &str, slot: &mut T) {
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_signing_secret_required() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingSigningSecret)));
        assert!(matches!(
            load(&[("JWT_SECRET", "  ")]),
            Err(ConfigError::MissingSigningSecret)
        ));
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/");
        assert_eq!(config.smtp.port, 587);
        assert!(!config.google_enabled());
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = load(&[
            ("JWT_SECRET", "s3cret"),
            ("HTTP_ADDR", "not-an-addr"),
            ("REDIS_PORT", "6380"),
            ("FRONTEND_URL", "https://devmess.cloud/"),
            ("RATE_LIMIT_BURST", "lots"),
            ("SMTP_USERNAME", "mailer@devmess.cloud"),
        ])
        .unwrap();

        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.redis_port, 6380);
        assert_eq!(config.frontend_url, "https://devmess.cloud");
        assert_eq!(config.rate_limit_burst, 5.0);
        assert_eq!(config.smtp.from, "mailer@devmess.cloud");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load(&[
            ("JWT_SECRET", "super-secret-value"),
            ("GOOGLE_CLIENT_SECRET", "google-secret"),
        ])
        .unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("super-secret-value"));
        assert!(!printed.contains("google-secret"));
        assert!(printed.contains("<redacted>"));
    }
}
