//! Application configuration management.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Tenant provisioning configuration.
    #[serde(default)]
    pub tenancy: TenancyConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// How long a pool checkout may wait before giving up.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    5
}

/// Tenant lifecycle and scoping configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TenancyConfig {
    /// Bounded wait for a per-tenant lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    /// Extra lock attempts after a timeout. Zero means timeouts surface immediately.
    #[serde(default)]
    pub lock_retries: u32,
    /// Base backoff between lock attempts, doubled on every retry.
    #[serde(default = "default_lock_backoff")]
    pub lock_backoff_ms: u64,
    /// Poll interval for advisory lock attempts.
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,
    /// Size of the connection pool reserved for advisory locks.
    #[serde(default = "default_lock_connections")]
    pub lock_connections: u32,
    /// Deadline for checking out and binding a scoped connection.
    #[serde(default = "default_checkout_timeout")]
    pub checkout_timeout_ms: u64,
    /// Directory holding the per-tenant migration scripts.
    #[serde(default = "default_tenant_migrations_dir")]
    pub tenant_migrations_dir: PathBuf,
    /// Directory holding the shared-namespace migration scripts.
    #[serde(default = "default_global_migrations_dir")]
    pub global_migrations_dir: PathBuf,
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_lock_backoff() -> u64 {
    250
}

fn default_lock_poll_interval() -> u64 {
    50
}

fn default_lock_connections() -> u32 {
    4
}

fn default_checkout_timeout() -> u64 {
    5_000
}

fn default_tenant_migrations_dir() -> PathBuf {
    PathBuf::from("migrations/tenant")
}

fn default_global_migrations_dir() -> PathBuf {
    PathBuf::from("migrations/global")
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout(),
            lock_retries: 0,
            lock_backoff_ms: default_lock_backoff(),
            lock_poll_interval_ms: default_lock_poll_interval(),
            lock_connections: default_lock_connections(),
            checkout_timeout_ms: default_checkout_timeout(),
            tenant_migrations_dir: default_tenant_migrations_dir(),
            global_migrations_dir: default_global_migrations_dir(),
        }
    }
}

impl TenancyConfig {
    /// Lock wait as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Lock retry backoff as a [`Duration`].
    #[must_use]
    pub const fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }

    /// Advisory lock poll interval as a [`Duration`].
    #[must_use]
    pub const fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Connection checkout deadline as a [`Duration`].
    #[must_use]
    pub const fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

impl AppConfig {
    /// Loads configuration from environment and config files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(
                config::Environment::with_prefix("TESSERA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenancy_defaults() {
        let cfg = TenancyConfig::default();
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.lock_retries, 0);
        assert_eq!(cfg.checkout_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.tenant_migrations_dir, PathBuf::from("migrations/tenant"));
    }

    #[test]
    fn test_shipped_defaults_do_not_retry_locks() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../../../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.tenancy.lock_retries, 0);
        assert_eq!(cfg.tenancy.lock_connections, 4);
    }

    #[test]
    fn test_load_from_environment() {
        temp_env::with_vars(
            [
                ("TESSERA__DATABASE__URL", Some("postgres://localhost/tessera_test")),
                ("TESSERA__TENANCY__LOCK_RETRIES", Some("3")),
                ("RUN_MODE", Some("test-does-not-exist")),
            ],
            || {
                let cfg = AppConfig::load().unwrap();
                assert_eq!(cfg.database.url, "postgres://localhost/tessera_test");
                assert_eq!(cfg.database.max_connections, 10);
                assert_eq!(cfg.tenancy.lock_retries, 3);
                assert_eq!(cfg.tenancy.lock_timeout_ms, 5_000);
            },
        );
    }

    #[test]
    fn test_load_requires_database_url() {
        temp_env::with_vars(
            [
                ("TESSERA__DATABASE__URL", None::<&str>),
                ("RUN_MODE", Some("test-does-not-exist")),
            ],
            || {
                assert!(AppConfig::load().is_err());
            },
        );
    }
}
