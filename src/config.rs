use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

const WEAK_SECRET_PATTERNS: &[&str] = &[
    "your-super-secret",
    "change-in-production",
    "secret",
    "password",
    "changeme",
    "default",
    "example",
    "test",
];

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error(
        "{0} is too weak for production; use a cryptographically random string of at least 32 characters"
    )]
    WeakSecret(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn parse(raw: Option<String>) -> Self {
        match raw.as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("production") => Self::Production,
            Some(v) if v.eq_ignore_ascii_case("test") => Self::Test,
            _ => Self::Development,
        }
    }
}

/// OAuth client credentials plus the API root for one marketplace.
#[derive(Debug, Clone, Default)]
pub struct MarketplaceCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub api_url: String,
}

impl MarketplaceCredentials {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty()
    }
}

/// Seller business policies an eBay offer is published under.
#[derive(Debug, Clone)]
pub struct EbayPolicies {
    pub fulfillment_policy_id: String,
    pub payment_policy_id: String,
    pub return_policy_id: String,
    pub merchant_location_key: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub auth: RateLimit,
    pub api: RateLimit,
    pub password: RateLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub platform: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub upload_dir: PathBuf,
    pub public_base_url: String,
    pub request_max_bytes: usize,
    pub bcrypt_cost: u32,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub ebay: MarketplaceCredentials,
    pub ebay_policies: EbayPolicies,
    pub etsy: MarketplaceCredentials,
    pub rate_limits: RateLimits,
    pub idempotency_ttl: Duration,
    pub selector_config_path: Option<PathBuf>,
    pub selector_cache_path: PathBuf,
    pub selector_remote_url: Option<String>,
    pub probe_targets: Vec<ProbeTarget>,
    pub probe_interval: Duration,
    pub sync_interval: Option<Duration>,
    pub cleanup_interval: Duration,
    pub queue_capacity: usize,
    pub job_concurrency: usize,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let environment = Environment::parse(get("APP_ENV"));

        let jwt_secret = require_secret(&get, "JWT_SECRET", environment)?;
        let jwt_refresh_secret = require_secret(&get, "JWT_REFRESH_SECRET", environment)?;

        let port = get("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        let cors_origins = get("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let ebay = MarketplaceCredentials {
            client_id: get("EBAY_CLIENT_ID").unwrap_or_default(),
            client_secret: get("EBAY_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: get("EBAY_REDIRECT_URI").unwrap_or_default(),
            api_url: get("EBAY_API_URL")
                .unwrap_or_else(|| "https://api.ebay.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        };
        let ebay_policies = EbayPolicies {
            fulfillment_policy_id: get("EBAY_FULFILLMENT_POLICY_ID")
                .unwrap_or_else(|| "FULFILLMENT_POLICY_ID".to_string()),
            payment_policy_id: get("EBAY_PAYMENT_POLICY_ID")
                .unwrap_or_else(|| "PAYMENT_POLICY_ID".to_string()),
            return_policy_id: get("EBAY_RETURN_POLICY_ID")
                .unwrap_or_else(|| "RETURN_POLICY_ID".to_string()),
            merchant_location_key: get("EBAY_MERCHANT_LOCATION_KEY")
                .unwrap_or_else(|| "default".to_string()),
        };
        let etsy = MarketplaceCredentials {
            client_id: get("ETSY_CLIENT_ID").unwrap_or_default(),
            client_secret: get("ETSY_CLIENT_SECRET").unwrap_or_default(),
            redirect_uri: get("ETSY_REDIRECT_URI").unwrap_or_else(|| {
                "http://localhost:4000/api/connections/etsy/callback".to_string()
            }),
            api_url: get("ETSY_API_URL")
                .unwrap_or_else(|| "https://openapi.etsy.com/v3".to_string())
                .trim_end_matches('/')
                .to_string(),
        };

        let rate_limits = RateLimits {
            auth: RateLimit {
                max_requests: positive(&get, "RATE_LIMIT_AUTH_PER_MIN", 5),
                window: Duration::from_secs(60),
            },
            api: RateLimit {
                max_requests: positive(&get, "RATE_LIMIT_API_PER_MIN", 100),
                window: Duration::from_secs(60),
            },
            password: RateLimit {
                max_requests: positive(&get, "RATE_LIMIT_PASSWORD_PER_15MIN", 10),
                window: Duration::from_secs(15 * 60),
            },
        };

        let sync_secs: u64 = get("SYNC_INTERVAL_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(900);

        let config = Self {
            environment,
            port,
            cors_origins,
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:data/syncsellr.db".to_string()),
            redis_url: get("REDIS_URL"),
            upload_dir: get("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public/uploads")),
            public_base_url: get("PUBLIC_BASE_URL")
                .unwrap_or_else(|| format!("http://localhost:{port}"))
                .trim_end_matches('/')
                .to_string(),
            request_max_bytes: positive(&get, "REQUEST_MAX_BYTES", 1024 * 1024),
            bcrypt_cost: get("BCRYPT_COST")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| (4..=31).contains(v))
                .unwrap_or(12),
            jwt_secret,
            jwt_refresh_secret,
            ebay,
            ebay_policies,
            etsy,
            rate_limits,
            idempotency_ttl: Duration::from_secs(positive(&get, "IDEMPOTENCY_TTL_SECS", crate::idempotency::DEFAULT_TTL.as_secs())),
            selector_config_path: get("SELECTOR_CONFIG_PATH").map(PathBuf::from),
            selector_cache_path: get("SELECTOR_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/selectors.json")),
            selector_remote_url: get("SELECTOR_REMOTE_URL"),
            probe_targets: parse_probe_targets(get("SELECTOR_PROBE_TARGETS").as_deref()),
            probe_interval: Duration::from_secs(positive(
                &get,
                "SELECTOR_PROBE_INTERVAL_SECS",
                900,
            )),
            sync_interval: (sync_secs > 0).then(|| Duration::from_secs(sync_secs)),
            cleanup_interval: Duration::from_secs(positive(&get, "CLEANUP_INTERVAL_SECS", 600)),
            queue_capacity: positive(&get, "QUEUE_CAPACITY", 256),
            job_concurrency: positive(&get, "JOB_CONCURRENCY", 3),
            http_timeout: Duration::from_secs(positive(&get, "HTTP_TIMEOUT_SECS", 30)),
            http_connect_timeout: Duration::from_secs(positive(&get, "HTTP_CONNECT_TIMEOUT_SECS", 5)),
            metrics_key: get("METRICS_KEY"),
            openapi_key: get("OPENAPI_KEY"),
        };

        info!(
            target = "syncsellr.config",
            environment = ?config.environment,
            port = config.port,
            cors_origins = config.cors_origins.len(),
            probe_targets = config.probe_targets.len(),
            ebay_configured = config.ebay.is_configured(),
            etsy_configured = config.etsy.is_configured(),
            "configuration loaded"
        );
        Ok(config)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let lookup = |key: &str| -> Option<String> {
            let value = match key {
                "APP_ENV" => "test",
                "JWT_SECRET" => "9f8e7d6c5b4a39281706f5e4d3c2b1a0ffeeddccbbaa",
                "JWT_REFRESH_SECRET" => "a0b1c2d3e4f5061728394a5b6c7d8e9fa1b2c3d4e5f6",
                "BCRYPT_COST" => "4",
                "RATE_LIMIT_AUTH_PER_MIN" => "1000",
                "RATE_LIMIT_API_PER_MIN" => "1000",
                "RATE_LIMIT_PASSWORD_PER_15MIN" => "1000",
                "SYNC_INTERVAL_SECS" => "0",
                "PUBLIC_BASE_URL" => "http://api.local",
                _ => return None,
            };
            Some(value.to_string())
        };
        match Self::from_lookup(lookup) {
            Ok(config) => config,
            Err(err) => panic!("test config: {err}"),
        }
    }
}

pub fn is_weak_secret(value: &str) -> bool {
    let lowered = value.to_lowercase();
    value.len() < MIN_SECRET_LEN
        || WEAK_SECRET_PATTERNS
            .iter()
            .any(|pattern| lowered.contains(pattern))
}

fn require_secret<G>(get: &G, name: &'static str, env: Environment) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = get(name).ok_or(ConfigError::Missing(name))?;
    if is_weak_secret(&value) {
        if env == Environment::Production {
            return Err(ConfigError::WeakSecret(name));
        }
        warn!(
            target = "syncsellr.config",
            secret = name,
            "secret looks weak; acceptable for local development only"
        );
    }
    Ok(value)
}

fn positive<G, T>(get: &G, key: &str, default: T) -> T
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
{
    get(key)
        .and_then(|v| v.parse::<T>().ok())
        .filter(|v| *v > T::default())
        .unwrap_or(default)
}

/// Parses `platform=url` pairs separated by commas.
pub fn parse_probe_targets(raw: Option<&str>) -> Vec<ProbeTarget> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let mut targets = Vec::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, '=');
        let platform = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let url = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (platform, url) {
            (Some(platform), Some(url)) => targets.push(ProbeTarget {
                platform: platform.to_lowercase(),
                url: url.to_string(),
            }),
            _ => warn!(
                target = "syncsellr.config",
                "ignored malformed SELECTOR_PROBE_TARGETS entry: {trimmed}"
            ),
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const STRONG_A: &str = "q8Zr2LxW7mN4vB1cK9pT3hJ6gF0dS5aYuEiOo";
    const STRONG_B: &str = "Xk3Lp9Qw2Er7Ty1Ui8Op4As6Df0Gh5Jk2Lz";

    #[test]
    fn defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", STRONG_A),
            ("JWT_REFRESH_SECRET", STRONG_B),
        ]))
        .expect("config");
        assert_eq!(config.port, 4000);
        assert_eq!(config.cors_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.ebay.api_url, "https://api.ebay.com");
        assert_eq!(config.bcrypt_cost, 12);
        assert_eq!(config.rate_limits.auth.max_requests, 5);
        assert_eq!(config.rate_limits.password.window, Duration::from_secs(900));
        assert_eq!(config.sync_interval, Some(Duration::from_secs(900)));
        assert_eq!(config.environment, Environment::Development);
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = AppConfig::from_lookup(lookup_from(&[("JWT_SECRET", STRONG_A)]))
            .expect_err("refresh secret missing");
        assert!(matches!(err, ConfigError::Missing("JWT_REFRESH_SECRET")));
    }

    #[test]
    fn weak_secrets_rejected_only_in_production() {
        let weak = [("JWT_SECRET", "changeme"), ("JWT_REFRESH_SECRET", STRONG_B)];
        assert!(AppConfig::from_lookup(lookup_from(&weak)).is_ok());

        let prod = [
            ("APP_ENV", "production"),
            ("JWT_SECRET", "changeme"),
            ("JWT_REFRESH_SECRET", STRONG_B),
        ];
        let err = AppConfig::from_lookup(lookup_from(&prod)).expect_err("weak in prod");
        assert!(matches!(err, ConfigError::WeakSecret("JWT_SECRET")));
    }

    #[test]
    fn weak_secret_detection() {
        assert!(is_weak_secret("short"));
        assert!(is_weak_secret("this-is-my-very-long-test-value-for-jwt-signing"));
        assert!(is_weak_secret("ThisContainsSECRETinUppercaseLettersToo1234"));
        assert!(!is_weak_secret(STRONG_A));
    }

    #[test]
    fn health_targets_skip_malformed_entries() {
        let targets = parse_probe_targets(Some(
            "vinted=https://www.vinted.co.uk/items/new, bogus ,Depop=https://www.depop.com/products/create/",
        ));
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].platform, "vinted");
        assert_eq!(targets[1].platform, "depop");
        assert!(parse_probe_targets(None).is_empty());
    }

    #[test]
    fn zero_sync_interval_disables_scheduler() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", STRONG_A),
            ("JWT_REFRESH_SECRET", STRONG_B),
            ("SYNC_INTERVAL_SECS", "0"),
            ("CORS_ORIGINS", "https://app.syncsellr.com/, http://localhost:3000"),
        ]))
        .expect("config");
        assert_eq!(config.sync_interval, None);
        assert_eq!(
            config.cors_origins,
            vec!["https://app.syncsellr.com", "http://localhost:3000"]
        );
    }
}
