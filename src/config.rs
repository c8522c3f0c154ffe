use std::time::Duration;

/// Runtime configuration, read from the environment at startup.
///
/// The sandbox service credential is intentionally `Option` here: its
/// absence only becomes an error the first time the service is used,
/// never at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub e2b_api_key: Option<String>,
    pub e2b_api_url: String,
    pub e2b_domain: String,
    pub telemetry_endpoint: Option<String>,
    /// Default sandbox template when a caller does not name one.
    pub sandbox_template: String,
    /// Lifetime requested for remote sandboxes on create/reconnect.
    pub sandbox_timeout: Duration,
    /// Staleness window for the registry's local session cache.
    pub cache_ttl: Duration,
}

pub const DEFAULT_SANDBOX_TEMPLATE: &str = "code-interpreter-v1";
pub const DEFAULT_API_URL: &str = "https://api.e2b.app";
pub const DEFAULT_DOMAIN: &str = "e2b.app";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            e2b_api_key: None,
            e2b_api_url: DEFAULT_API_URL.to_string(),
            e2b_domain: DEFAULT_DOMAIN.to_string(),
            telemetry_endpoint: None,
            sandbox_template: DEFAULT_SANDBOX_TEMPLATE.to_string(),
            sandbox_timeout: Duration::from_secs(10 * 60),
            cache_ttl: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            e2b_api_key: std::env::var("E2B_API_KEY").ok().filter(|k| !k.is_empty()),
            e2b_api_url: std::env::var("E2B_API_URL").unwrap_or(defaults.e2b_api_url),
            e2b_domain: std::env::var("E2B_DOMAIN").unwrap_or(defaults.e2b_domain),
            telemetry_endpoint: std::env::var("TELEMETRY_ENDPOINT").ok(),
            sandbox_template: std::env::var("SANDBOX_TEMPLATE")
                .unwrap_or(defaults.sandbox_template),
            sandbox_timeout: defaults.sandbox_timeout,
            cache_ttl: defaults.cache_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hosted_service() {
        let config = AppConfig::default();
        assert!(config.e2b_api_key.is_none());
        assert_eq!(config.e2b_api_url, "https://api.e2b.app");
        assert_eq!(config.sandbox_template, "code-interpreter-v1");
        assert_eq!(config.sandbox_timeout, Duration::from_secs(600));
    }

    #[test]
    fn cache_ttl_is_bounded() {
        let config = AppConfig::default();
        assert!(config.cache_ttl < config.sandbox_timeout);
    }
}
