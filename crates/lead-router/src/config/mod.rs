use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub routing: RoutingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            routing: RoutingConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Tuning for the assignment engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingConfig {
    /// How long loaded rules and territories are served from cache.
    pub catalog_ttl: Duration,
    /// Upper bound on waiting for another trigger working on the same lead.
    pub lock_timeout: Duration,
    /// Selections attempted before a contended commit gives up.
    pub commit_attempts: u32,
    pub default_target_model: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            catalog_ttl: Duration::from_secs(30),
            lock_timeout: Duration::from_millis(2_000),
            commit_attempts: 3,
            default_target_model: "leads".to_string(),
        }
    }
}

impl RoutingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let catalog_ttl = match numeric_var("ROUTER_CATALOG_TTL_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => defaults.catalog_ttl,
        };
        let lock_timeout = match numeric_var("ROUTER_LOCK_TIMEOUT_MS")? {
            Some(millis) => Duration::from_millis(millis),
            None => defaults.lock_timeout,
        };
        let commit_attempts = match numeric_var("ROUTER_COMMIT_ATTEMPTS")? {
            Some(0) => {
                return Err(ConfigError::InvalidNumber {
                    name: "ROUTER_COMMIT_ATTEMPTS",
                    value: "0".to_string(),
                })
            }
            Some(attempts) => {
                u32::try_from(attempts).map_err(|_| ConfigError::InvalidNumber {
                    name: "ROUTER_COMMIT_ATTEMPTS",
                    value: attempts.to_string(),
                })?
            }
            None => defaults.commit_attempts,
        };
        let default_target_model = env::var("ROUTER_TARGET_MODEL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.default_target_model);

        Ok(Self {
            catalog_ttl,
            lock_timeout,
            commit_attempts,
            default_target_model,
        })
    }
}

fn numeric_var(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidNumber { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for name in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "ROUTER_CATALOG_TTL_SECS",
            "ROUTER_LOCK_TIMEOUT_MS",
            "ROUTER_COMMIT_ATTEMPTS",
            "ROUTER_TARGET_MODEL",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.routing, RoutingConfig::default());
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
    }

    #[test]
    fn reads_routing_overrides() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ROUTER_CATALOG_TTL_SECS", "0");
        env::set_var("ROUTER_LOCK_TIMEOUT_MS", "250");
        env::set_var("ROUTER_COMMIT_ATTEMPTS", "5");
        env::set_var("ROUTER_TARGET_MODEL", "opportunities");

        let routing = AppConfig::load().expect("config loads").routing;
        reset_env();

        assert_eq!(routing.catalog_ttl, Duration::ZERO);
        assert_eq!(routing.lock_timeout, Duration::from_millis(250));
        assert_eq!(routing.commit_attempts, 5);
        assert_eq!(routing.default_target_model, "opportunities");
    }

    #[test]
    fn rejects_malformed_routing_numbers() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ROUTER_LOCK_TIMEOUT_MS", "soon");
        let err = AppConfig::load().expect_err("malformed timeout is rejected");
        reset_env();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "ROUTER_LOCK_TIMEOUT_MS",
                ..
            }
        ));

        env::set_var("ROUTER_COMMIT_ATTEMPTS", "0");
        let err = AppConfig::load().expect_err("zero attempts is rejected");
        reset_env();
        assert!(err.to_string().contains("ROUTER_COMMIT_ATTEMPTS"));
    }
}
