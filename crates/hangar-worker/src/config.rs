// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hangar-worker.

use std::str::FromStr;
use std::time::Duration;

use crate::compression::Compression;
use crate::placement::{PlacementOptions, StrategyKind};
use crate::version::WorkerVersion;

/// Worker allocation configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for worker, container and volume records.
    pub database_url: Option<String>,
    /// Placement strategy chain and admission limits.
    pub placement: PlacementOptions,
    /// Interval between worker availability polls while a step waits.
    pub worker_poll_interval: Duration,
    /// Interval between resource lock acquisition attempts.
    pub lock_retry_interval: Duration,
    /// Minimum compatible worker version.
    pub worker_version: Option<WorkerVersion>,
    /// Artifact streaming settings.
    pub streaming: StreamingConfig,
    /// Proxy variables injected into every container.
    pub proxy: ProxyConfig,
    /// Interval between fleet status reports.
    pub status_interval: Duration,
}

/// Artifact streaming settings.
#[derive(Debug, Clone, Default)]
pub struct StreamingConfig {
    /// Codec wrapping tar streams.
    pub compression: Compression,
    /// Whether volumes may push directly to each other.
    pub p2p_enabled: bool,
    /// Upper bound on a P2P push. Zero means unbounded.
    pub p2p_timeout: Duration,
}

/// Proxy environment injected into containers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// `http_proxy` value.
    pub http_proxy: Option<String>,
    /// `https_proxy` value.
    pub https_proxy: Option<String>,
    /// `no_proxy` value.
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Renders the proxy settings as `KEY=value` pairs.
    pub fn env(&self) -> Vec<String> {
        let mut env = Vec::new();
        if let Some(v) = &self.http_proxy {
            env.push(format!("http_proxy={v}"));
        }
        if let Some(v) = &self.https_proxy {
            env.push(format!("https_proxy={v}"));
        }
        if let Some(v) = &self.no_proxy {
            env.push(format!("no_proxy={v}"));
        }
        env
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            placement: PlacementOptions::default(),
            worker_poll_interval: Duration::from_secs(5),
            lock_retry_interval: Duration::from_secs(5),
            worker_version: None,
            streaming: StreamingConfig::default(),
            proxy: ProxyConfig::default(),
            status_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("HANGAR_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok();

        let strategies = match std::env::var("HANGAR_PLACEMENT_STRATEGY") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    StrategyKind::from_str(s).map_err(|_| ConfigError::InvalidStrategy(s.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => PlacementOptions::default().strategies,
        };

        let placement = PlacementOptions {
            strategies,
            max_active_tasks_per_worker: limit("HANGAR_MAX_ACTIVE_TASKS_PER_WORKER")?,
            max_active_containers_per_worker: limit("HANGAR_MAX_ACTIVE_CONTAINERS_PER_WORKER")?,
            max_active_volumes_per_worker: limit("HANGAR_MAX_ACTIVE_VOLUMES_PER_WORKER")?,
        };

        let worker_version = match std::env::var("HANGAR_WORKER_VERSION") {
            Ok(raw) if raw.trim().is_empty() => None,
            Ok(raw) => Some(
                WorkerVersion::from_str(raw.trim())
                    .map_err(|_| ConfigError::InvalidVersion(raw.clone()))?,
            ),
            Err(_) => None,
        };

        let compression = match std::env::var("HANGAR_STREAMING_COMPRESSION") {
            Ok(raw) => Compression::from_str(raw.trim())
                .map_err(|_| ConfigError::InvalidCompression(raw.clone()))?,
            Err(_) => Compression::default(),
        };

        let streaming = StreamingConfig {
            compression,
            p2p_enabled: flag("HANGAR_P2P_STREAMING_ENABLED"),
            p2p_timeout: seconds("HANGAR_P2P_STREAMING_TIMEOUT_SECS", 0)?,
        };

        let proxy = ProxyConfig {
            http_proxy: non_empty("HANGAR_HTTP_PROXY"),
            https_proxy: non_empty("HANGAR_HTTPS_PROXY"),
            no_proxy: non_empty("HANGAR_NO_PROXY"),
        };

        Ok(Self {
            database_url,
            placement,
            worker_poll_interval: seconds("HANGAR_WORKER_POLL_INTERVAL_SECS", 5)?,
            lock_retry_interval: seconds("HANGAR_LOCK_RETRY_INTERVAL_SECS", 5)?,
            worker_version,
            streaming,
            proxy,
            status_interval: seconds("HANGAR_STATUS_INTERVAL_SECS", 30)?,
        })
    }
}

fn flag(var: &'static str) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn non_empty(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn seconds(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn limit(var: &'static str) -> Result<i32, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(0);
    };
    let value: i32 = raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.clone(),
    })?;
    if value < 0 {
        return Err(ConfigError::NegativeLimit { var, value });
    }
    Ok(value)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A numeric variable failed to parse.
    #[error("Invalid number in {var}: {value}")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// A limit was negative.
    #[error("{var} must not be negative, got {value}")]
    NegativeLimit {
        /// Variable or option name.
        var: &'static str,
        /// Offending value.
        value: i32,
    },
    /// Unknown placement strategy name.
    #[error("Invalid container placement strategy: {0}")]
    InvalidStrategy(String),
    /// Unknown compression codec.
    #[error("Invalid streaming compression: {0}")]
    InvalidCompression(String),
    /// Unparseable worker version.
    #[error("Invalid worker version: {0}")]
    InvalidVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "HANGAR_DATABASE_URL",
        "DATABASE_URL",
        "HANGAR_PLACEMENT_STRATEGY",
        "HANGAR_MAX_ACTIVE_TASKS_PER_WORKER",
        "HANGAR_MAX_ACTIVE_CONTAINERS_PER_WORKER",
        "HANGAR_MAX_ACTIVE_VOLUMES_PER_WORKER",
        "HANGAR_WORKER_POLL_INTERVAL_SECS",
        "HANGAR_LOCK_RETRY_INTERVAL_SECS",
        "HANGAR_WORKER_VERSION",
        "HANGAR_STREAMING_COMPRESSION",
        "HANGAR_P2P_STREAMING_ENABLED",
        "HANGAR_P2P_STREAMING_TIMEOUT_SECS",
        "HANGAR_HTTP_PROXY",
        "HANGAR_HTTPS_PROXY",
        "HANGAR_NO_PROXY",
        "HANGAR_STATUS_INTERVAL_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.placement.strategies, vec![StrategyKind::VolumeLocality]);
        assert_eq!(config.placement.max_active_tasks_per_worker, 0);
        assert_eq!(config.worker_poll_interval, Duration::from_secs(5));
        assert_eq!(config.lock_retry_interval, Duration::from_secs(5));
        assert_eq!(config.streaming.compression, Compression::Gzip);
        assert!(!config.streaming.p2p_enabled);
        assert!(config.proxy.env().is_empty());
    }

    #[test]
    fn test_config_strategy_chain() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set(
            "HANGAR_PLACEMENT_STRATEGY",
            "volume-locality, limit-active-tasks,fewest-build-containers",
        );
        guard.set("HANGAR_MAX_ACTIVE_TASKS_PER_WORKER", "3");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.placement.strategies,
            vec![
                StrategyKind::VolumeLocality,
                StrategyKind::LimitActiveTasks,
                StrategyKind::FewestBuildContainers,
            ]
        );
        assert_eq!(config.placement.max_active_tasks_per_worker, 3);
    }

    #[test]
    fn test_config_invalid_strategy() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_PLACEMENT_STRATEGY", "volume-locality,busiest");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStrategy(ref name) if name == "busiest"));
    }

    #[test]
    fn test_config_negative_limit() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_MAX_ACTIVE_CONTAINERS_PER_WORKER", "-1");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::NegativeLimit { value: -1, .. }));
    }

    #[test]
    fn test_config_streaming_and_proxy() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_STREAMING_COMPRESSION", "zstd");
        guard.set("HANGAR_P2P_STREAMING_ENABLED", "true");
        guard.set("HANGAR_P2P_STREAMING_TIMEOUT_SECS", "120");
        guard.set("HANGAR_HTTP_PROXY", "http://proxy:3128");
        guard.set("HANGAR_NO_PROXY", "localhost");

        let config = Config::from_env().unwrap();
        assert_eq!(config.streaming.compression, Compression::Zstd);
        assert!(config.streaming.p2p_enabled);
        assert_eq!(config.streaming.p2p_timeout, Duration::from_secs(120));
        assert_eq!(
            config.proxy.env(),
            vec!["http_proxy=http://proxy:3128", "no_proxy=localhost"]
        );
    }

    #[test]
    fn test_config_invalid_compression() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_STREAMING_COMPRESSION", "lz4");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidCompression(_))
        ));
    }

    #[test]
    fn test_config_worker_version() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DATABASE_URL", "postgres://localhost/hangar");
        guard.set("HANGAR_WORKER_VERSION", "2.5");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/hangar")
        );
        assert_eq!(config.worker_version, Some(WorkerVersion::new(2, 5, 0)));

        guard.set("HANGAR_WORKER_VERSION", "two");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_config_invalid_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_WORKER_POLL_INTERVAL_SECS", "soon");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
