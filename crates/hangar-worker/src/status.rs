// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet status reporter.
//!
//! Periodically logs how many workers can take work, how loaded they are
//! and how many steps are waiting for capacity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use crate::pool::Pool;

/// Reporter configuration.
#[derive(Debug, Clone)]
pub struct StatusReporterConfig {
    /// How often to report.
    pub interval: Duration,
}

impl Default for StatusReporterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Load of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Worker name.
    pub name: String,
    /// Owning team, zero for shared.
    pub team_id: i32,
    /// Containers reported by the last heartbeat.
    pub active_containers: i32,
    /// Volumes reported by the last heartbeat.
    pub active_volumes: i32,
    /// Task containers admitted by placement.
    pub active_tasks: i32,
}

/// Snapshot of the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetStatus {
    /// Running, version-compatible workers.
    pub workers: Vec<WorkerStatus>,
    /// Process counters.
    pub metrics: MetricsSnapshot,
}

impl FleetStatus {
    /// Sum of active containers.
    pub fn active_containers(&self) -> i64 {
        self.workers.iter().map(|w| w.active_containers as i64).sum()
    }

    /// Sum of active tasks.
    pub fn active_tasks(&self) -> i64 {
        self.workers.iter().map(|w| w.active_tasks as i64).sum()
    }
}

/// Status reporter that runs as a background task.
pub struct StatusReporter {
    pool: Arc<Pool>,
    config: StatusReporterConfig,
    shutdown: Arc<Notify>,
}

impl StatusReporter {
    /// Create a reporter over `pool`.
    pub fn new(pool: Arc<Pool>, config: StatusReporterConfig) -> Self {
        Self {
            pool,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reporter loop.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Status reporter started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Status reporter shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.report().await {
                        error!(error = %e, "Failed to report fleet status");
                    }
                }
            }
        }
    }

    /// Collect the current fleet status.
    pub async fn collect(&self) -> Result<FleetStatus> {
        let workers = self
            .pool
            .running_workers()
            .await?
            .into_iter()
            .map(|w| WorkerStatus {
                name: w.name().to_string(),
                team_id: w.team_id(),
                active_containers: w.active_containers(),
                active_volumes: w.active_volumes(),
                active_tasks: w.active_tasks(),
            })
            .collect();
        Ok(FleetStatus {
            workers,
            metrics: self.pool.metrics().snapshot(),
        })
    }

    async fn report(&self) -> Result<()> {
        let status = self.collect().await?;
        for worker in &status.workers {
            debug!(
                worker = %worker.name,
                team_id = worker.team_id,
                active_containers = worker.active_containers,
                active_volumes = worker.active_volumes,
                active_tasks = worker.active_tasks,
                "Worker status"
            );
        }
        info!(
            workers = status.workers.len(),
            active_containers = status.active_containers(),
            active_tasks = status.active_tasks(),
            steps_waiting = status.metrics.steps_waiting,
            containers_created = status.metrics.containers_created,
            failed_containers = status.metrics.failed_containers,
            volumes_streamed = status.metrics.volumes_streamed,
            "Fleet status"
        );
        Ok(())
    }
}
