use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Error produced while reading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A key is present but cannot be parsed.
    #[error("invalid value {value:?} for environment variable {key}")]
    Invalid {
        /// Offending key.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Static description of one provider: whether it participates and at what
/// declared per-minute limit.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Provider name, matching [`crate::Provider::name`].
    pub name: String,
    /// Whether the provider participates in routing.
    pub enabled: bool,
    /// Declared requests-per-minute limit.
    pub limit_per_minute: u32,
}

/// Runtime configuration, usually read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Known providers with their enablement and limits.
    pub providers: Vec<ProviderSettings>,
    /// Worker pool size.
    pub max_concurrent: usize,
    /// Retry budget for transient failures.
    pub max_retries: u32,
    /// Load pending jobs and heal stuck ones on boot.
    pub auto_restart_queue: bool,
    /// Base cooldown after a provider signals overload.
    pub cooldown_base: Duration,
    /// Cap for the exponential cooldown.
    pub cooldown_max: Duration,
    /// Initial safety factor for low-limit providers.
    pub safety_factor_low: f64,
    /// Initial safety factor for everything else.
    pub safety_factor_high: f64,
    /// Per-minute limit at or below which the low factor applies.
    pub safety_threshold: u32,
    /// How long one routing call may wait for provider capacity.
    pub per_request_wait: Duration,
    /// How often the refill task pulls persisted jobs into memory.
    pub refill_interval: Duration,
    /// How often the reaper looks for stuck jobs.
    pub reaper_interval: Duration,
    /// Age at which a `processing` row counts as abandoned.
    pub stuck_threshold: Duration,
    /// Hard deadline for one provider HTTP request.
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            providers: vec![
                ProviderSettings {
                    name: "receitaws".to_string(),
                    enabled: true,
                    limit_per_minute: 3,
                },
                ProviderSettings {
                    name: "cnpjws".to_string(),
                    enabled: true,
                    limit_per_minute: 3,
                },
                ProviderSettings {
                    name: "cnpja_open".to_string(),
                    enabled: true,
                    limit_per_minute: 5,
                },
            ],
            max_concurrent: 4,
            max_retries: 3,
            auto_restart_queue: true,
            cooldown_base: Duration::from_secs(60),
            cooldown_max: Duration::from_secs(300),
            safety_factor_low: 0.7,
            safety_factor_high: 0.8,
            safety_threshold: 3,
            per_request_wait: Duration::from_secs(30),
            refill_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(180),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Read configuration from the environment. A `.env` file is honored.
    ///
    /// `DATABASE_URL` is required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self {
            database_url: env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            ..Self::default()
        };

        for provider in &mut config.providers {
            let key = provider.name.to_uppercase();
            provider.enabled = env_flag(&format!("PROVIDER_{key}_ENABLED"), provider.enabled)?;
            provider.limit_per_minute = env_parse(
                &format!("PROVIDER_{key}_LIMIT"),
                provider.limit_per_minute,
            )?;
        }

        config.max_concurrent = env_parse("MAX_CONCURRENT_PROCESSING", config.max_concurrent)?;
        config.max_retries = env_parse("MAX_RETRY_ATTEMPTS", config.max_retries)?;
        config.auto_restart_queue = env_flag("AUTO_RESTART_QUEUE", config.auto_restart_queue)?;
        config.cooldown_base = Duration::from_secs(env_parse(
            "API_COOLDOWN_AFTER_RATE_LIMIT",
            config.cooldown_base.as_secs(),
        )?);
        config.cooldown_max =
            Duration::from_secs(env_parse("API_COOLDOWN_MAX", config.cooldown_max.as_secs())?);
        config.safety_factor_low = env_parse("SAFETY_FACTOR_LOW", config.safety_factor_low)?;
        config.safety_factor_high = env_parse("SAFETY_FACTOR_HIGH", config.safety_factor_high)?;
        config.safety_threshold = env_parse("SAFETY_THRESHOLD", config.safety_threshold)?;

        Ok(config)
    }

    /// Providers that participate in routing.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

fn env_flag(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        },
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
    }
}
