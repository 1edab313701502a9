//! Configuration loaded from environment variables

use std::env;

/// Main daemon configuration
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Comma-separated list of allowed image registries
    pub allowed_registries: String,

    /// Path to the SQLite state database
    pub state_db: String,

    /// Grace period in seconds for draining operations during shutdown
    pub drain_grace_s: u64,

    /// Days to keep stopped transient containers before garbage collection
    pub transient_gc_days: i64,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log format ("json" or "text")
    pub log_format: String,

    /// Host to bind the tool-dispatch surface to
    pub host: String,

    /// Port to bind the tool-dispatch surface to
    pub port: u16,

    /// Default image for the warm container pool
    pub default_image_alias: String,

    /// Enable the warm container pool
    pub warm_pool_enabled: bool,

    /// Interval in seconds between warm-container health checks
    pub warm_health_check_interval: u64,

    /// Optional Docker config JSON blob for registry credentials
    pub docker_config_json: Option<String>,

    /// Optional Docker daemon socket override
    pub docker_host: Option<String>,

    /// Default exec timeout in seconds
    pub exec_timeout_default_s: u64,

    /// Maximum concurrent execs per container
    pub max_concurrent_execs: usize,
}

impl Configuration {
    /// Load configuration from the process environment, applying defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        Self {
            allowed_registries: var_or("ALLOWED_REGISTRIES", "docker.io,ghcr.io"),
            state_db: var_or("STATE_DB", "./state.db"),
            drain_grace_s: parse_or("DRAIN_GRACE_S", 60),
            transient_gc_days: parse_or("TRANSIENT_GC_DAYS", 7),
            log_level: var_or("LOG_LEVEL", "info"),
            log_format: var_or("LOG_FORMAT", "text"),
            host: var_or("HOST", "0.0.0.0"),
            port: parse_or("PORT", 8000),
            default_image_alias: var_or("DEFAULT_IMAGE_ALIAS", "python:3.11-slim"),
            warm_pool_enabled: parse_or("WARM_POOL_ENABLED", true),
            warm_health_check_interval: parse_or("WARM_HEALTH_CHECK_INTERVAL", 60),
            docker_config_json: env::var("DOCKER_CONFIG_JSON").ok().filter(|v| !v.is_empty()),
            docker_host: env::var("DOCKER_HOST").ok().filter(|v| !v.is_empty()),
            exec_timeout_default_s: parse_or("EXEC_TIMEOUT_DEFAULT_S", 600),
            max_concurrent_execs: parse_or("MAX_CONCURRENT_EXECS", 4),
        }
    }

    /// Parse the registry allow-list into individual hosts.
    pub fn allowed_registries_list(&self) -> Vec<String> {
        self.allowed_registries
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::from_env()
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // Only assert on variables the test environment does not set.
        let config = Configuration {
            allowed_registries: "docker.io,ghcr.io".into(),
            state_db: "./state.db".into(),
            drain_grace_s: 60,
            transient_gc_days: 7,
            log_level: "info".into(),
            log_format: "text".into(),
            host: "0.0.0.0".into(),
            port: 8000,
            default_image_alias: "python:3.11-slim".into(),
            warm_pool_enabled: true,
            warm_health_check_interval: 60,
            docker_config_json: None,
            docker_host: None,
            exec_timeout_default_s: 600,
            max_concurrent_execs: 4,
        };

        assert_eq!(
            config.allowed_registries_list(),
            vec!["docker.io".to_string(), "ghcr.io".to_string()]
        );
    }

    #[test]
    fn test_registry_list_trims_and_skips_empty() {
        let config = Configuration {
            allowed_registries: " docker.io , ,ghcr.io,".into(),
            ..Configuration::from_env()
        };

        assert_eq!(
            config.allowed_registries_list(),
            vec!["docker.io".to_string(), "ghcr.io".to_string()]
        );
    }
}
