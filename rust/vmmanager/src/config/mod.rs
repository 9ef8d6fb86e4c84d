//! Configuration management.
//!
//! Configuration is loaded once at startup and passed as an immutable value
//! to each component: defaults, then an optional `config/vmmanager` file,
//! then `VMMANAGER__`-prefixed environment variables, then the handful of
//! plain environment variables that form the deployment contract
//! (`REDIS_CONNECTION_STRING`, `SSH_USERNAME`, `DEFAULT_TTL_MINUTES`,
//! `PROVISION_RATE_LIMIT_SECONDS`, `DECOMMISSION_RATE_LIMIT_SECONDS`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Control-plane tunables.
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl AppConfig {
    /// Load configuration from defaults, config file, and environment.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/vmmanager").required(false))
            .add_source(
                config::Environment::with_prefix("VMMANAGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize().unwrap_or_default();

        // Contract environment variables take precedence
        if let Ok(url) = std::env::var("REDIS_URL") {
            app_config.redis.url = Some(url);
        }
        if let Ok(url) = std::env::var("REDIS_CONNECTION_STRING") {
            app_config.redis.url = Some(url);
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            app_config.redis.password = Some(password);
        }
        if let Ok(user) = std::env::var("SSH_USERNAME") {
            if !user.is_empty() {
                app_config.controller.ssh_username = user;
            }
        }
        if let Ok(minutes) = std::env::var("DEFAULT_TTL_MINUTES") {
            if let Ok(minutes) = minutes.parse::<u64>() {
                app_config.controller.default_ttl_minutes = minutes;
            }
        }
        if let Ok(secs) = std::env::var("PROVISION_RATE_LIMIT_SECONDS") {
            if let Ok(secs) = secs.parse::<u64>() {
                app_config.controller.provision_rate_limit_secs = secs;
            }
        }
        if let Ok(secs) = std::env::var("DECOMMISSION_RATE_LIMIT_SECONDS") {
            if let Ok(secs) = secs.parse::<u64>() {
                app_config.controller.decommission_rate_limit_secs = secs;
            }
        }

        Ok(app_config)
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL or plain `host:port`.
    pub url: Option<String>,
    /// Password, spliced into the URL when it does not carry one.
    pub password: Option<String>,
}

impl RedisConfig {
    /// Final connection URL for the Redis client.
    pub fn connection_url(&self) -> Option<String> {
        let url = self.url.as_ref()?;
        let mut url = if url.contains("://") {
            url.clone()
        } else {
            format!("redis://{url}")
        };
        if let Some(password) = self.password.as_deref() {
            if !password.is_empty() && !url.contains('@') {
                if let Some(rest) = url.strip_prefix("redis://") {
                    url = format!("redis://:{password}@{rest}");
                }
            }
        }
        Some(url)
    }
}

/// Control-plane tunables, all with deployment-contract defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// SSH login name written into new records.
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,
    /// Lifetime of a provisioned lab before the reconciler reclaims it.
    #[serde(default = "default_ttl_minutes")]
    pub default_ttl_minutes: u64,
    /// Provision rate-gate window.
    #[serde(default = "default_rate_limit_secs")]
    pub provision_rate_limit_secs: u64,
    /// Decommission rate-gate window.
    #[serde(default = "default_rate_limit_secs")]
    pub decommission_rate_limit_secs: u64,
    /// Interval between provider state polls during provisioning.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Hard ceiling on the provisioning poll loop.
    #[serde(default = "default_state_timeout_secs")]
    pub state_timeout_secs: u64,
    /// Blocking-pop timeout on the intent queues.
    #[serde(default = "default_queue_pop_timeout_secs")]
    pub queue_pop_timeout_secs: u64,
    /// Interval between expiry sweeps.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Attempts for critical store reads (record lookup, rate gate).
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    /// Delay between those attempts.
    #[serde(default = "default_store_retry_delay_secs")]
    pub store_retry_delay_secs: u64,
}

fn default_ssh_username() -> String {
    "student".to_string()
}

fn default_ttl_minutes() -> u64 {
    30
}

fn default_rate_limit_secs() -> u64 {
    15
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_state_timeout_secs() -> u64 {
    300
}

fn default_queue_pop_timeout_secs() -> u64 {
    30
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_delay_secs() -> u64 {
    2
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ssh_username: default_ssh_username(),
            default_ttl_minutes: default_ttl_minutes(),
            provision_rate_limit_secs: default_rate_limit_secs(),
            decommission_rate_limit_secs: default_rate_limit_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            state_timeout_secs: default_state_timeout_secs(),
            queue_pop_timeout_secs: default_queue_pop_timeout_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_delay_secs: default_store_retry_delay_secs(),
        }
    }
}

impl ControllerConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_minutes * 60)
    }

    pub fn provision_rate_ttl(&self) -> Duration {
        Duration::from_secs(self.provision_rate_limit_secs)
    }

    pub fn decommission_rate_ttl(&self) -> Duration {
        Duration::from_secs(self.decommission_rate_limit_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_secs(self.state_timeout_secs)
    }

    pub fn queue_pop_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_pop_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn store_retry_delay(&self) -> Duration {
        Duration::from_secs(self.store_retry_delay_secs)
    }
}
