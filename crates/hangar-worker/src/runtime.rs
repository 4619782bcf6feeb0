// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hangar-worker.
//!
//! [`HangarRuntime`] wires the pool, placement strategy, streamer and
//! fetcher together from a [`Config`] and runs the fleet status reporter
//! in the background.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hangar_worker::runtime::HangarRuntime;
//!
//! let runtime = HangarRuntime::builder()
//!     .persistence(persistence)
//!     .clients(clients)
//!     .locks(locks)
//!     .config(Config::from_env()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let worker = runtime
//!     .pool()
//!     .find_or_select_worker(&cancel, &owner, &spec, &worker_spec, runtime.strategy().as_ref(), &NoopDelegate)
//!     .await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::client::WorkerClients;
use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::lock::LockFactory;
use crate::metrics::Metrics;
use crate::persistence::Persistence;
use crate::placement::{ContainerPlacementStrategy, PlacementStrategy};
use crate::pool::Pool;
use crate::status::{StatusReporter, StatusReporterConfig};
use crate::streamer::Streamer;
use crate::worker::WorkerProvider;

/// Builder for creating a [`HangarRuntime`].
#[derive(Default)]
pub struct HangarRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    clients: Option<Arc<dyn WorkerClients>>,
    locks: Option<Arc<dyn LockFactory>>,
    config: Config,
}

impl HangarRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the per-worker service clients (required).
    pub fn clients(mut self, clients: Arc<dyn WorkerClients>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Set the advisory lock factory (required).
    pub fn locks(mut self, locks: Arc<dyn LockFactory>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the placement
    /// options are invalid.
    pub fn build(self) -> Result<HangarRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let clients = self
            .clients
            .ok_or_else(|| anyhow::anyhow!("clients is required"))?;
        let locks = self
            .locks
            .ok_or_else(|| anyhow::anyhow!("locks is required"))?;
        let strategy = ContainerPlacementStrategy::new(&self.config.placement)?;

        Ok(HangarRuntimeConfig {
            persistence,
            clients,
            locks,
            strategy,
            config: self.config,
        })
    }
}

/// Validated configuration for a [`HangarRuntime`].
pub struct HangarRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    clients: Arc<dyn WorkerClients>,
    locks: Arc<dyn LockFactory>,
    strategy: ContainerPlacementStrategy,
    config: Config,
}

impl HangarRuntimeConfig {
    /// Start the runtime.
    pub async fn start(self) -> Result<HangarRuntime> {
        let metrics = Arc::new(Metrics::new());

        let provider = WorkerProvider::new(
            self.persistence,
            self.clients,
            self.locks.clone(),
            metrics.clone(),
        )
        .with_worker_version(self.config.worker_version.clone())
        .with_proxy_env(self.config.proxy.env());

        let pool = Arc::new(Pool::new(provider, self.config.worker_poll_interval));
        let streamer = Streamer::new(&self.config.streaming, metrics.clone());
        let fetcher = Fetcher::new(self.locks, self.config.lock_retry_interval);

        let reporter = StatusReporter::new(
            pool.clone(),
            StatusReporterConfig {
                interval: self.config.status_interval,
            },
        );
        let status_shutdown = reporter.shutdown_handle();
        let status_handle = tokio::spawn(async move {
            reporter.run().await;
        });

        info!(
            strategy = %self.strategy.name(),
            compression = %streamer.compression(),
            p2p_enabled = self.config.streaming.p2p_enabled,
            poll_interval_secs = self.config.worker_poll_interval.as_secs(),
            "HangarRuntime started"
        );

        Ok(HangarRuntime {
            pool,
            strategy: Arc::new(self.strategy),
            streamer,
            fetcher,
            metrics,
            status_handle,
            status_shutdown,
        })
    }
}

/// A running hangar-worker instance that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct HangarRuntime {
    pool: Arc<Pool>,
    strategy: Arc<ContainerPlacementStrategy>,
    streamer: Streamer,
    fetcher: Fetcher,
    metrics: Arc<Metrics>,
    status_handle: JoinHandle<()>,
    status_shutdown: Arc<Notify>,
}

impl HangarRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HangarRuntimeBuilder {
        HangarRuntimeBuilder::new()
    }

    /// Worker pool.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Configured placement strategy chain.
    pub fn strategy(&self) -> &Arc<ContainerPlacementStrategy> {
        &self.strategy
    }

    /// Artifact streamer.
    pub fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    /// Resource fetcher.
    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.status_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("HangarRuntime shutting down...");

        self.status_shutdown.notify_one();

        if let Err(e) = self.status_handle.await {
            error!("Status reporter task panicked: {}", e);
            return Err(anyhow::anyhow!("status reporter task panicked: {}", e));
        }

        info!("HangarRuntime shutdown complete");
        Ok(())
    }
}
