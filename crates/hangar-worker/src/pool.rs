// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool: chooses the worker a step's container runs on.
//!
//! Selection narrows the running fleet in stages:
//!
//! 1. Workers that cannot satisfy the [`WorkerSpec`] are dropped. If any
//!    team-owned worker remains, shared workers are dropped as well.
//! 2. A worker already holding a container for the owner is reused
//!    without consulting the placement strategy.
//! 3. Otherwise the strategy orders the candidates and the first one it
//!    admits wins.
//!
//! An empty candidate set is an error. When candidates exist but none is
//! admitted, the caller waits until a worker is released or the poll
//! interval elapses and then selection starts over.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics::{Metrics, WaitingGuard};
use crate::placement::PlacementStrategy;
use crate::spec::{ContainerOwner, ContainerSpec, WorkerSpec};
use crate::worker::{Worker, WorkerProvider};

/// Default interval between selection attempts while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Callbacks reporting selection progress to the step that asked.
pub trait WorkerSelectionDelegate: Send + Sync {
    /// No worker could take the step yet. Called once per wait.
    fn waiting_for_worker(&self, _spec: &WorkerSpec) {}

    /// The step was placed on `worker`.
    fn selected_worker(&self, _worker: &str) {}
}

/// Delegate that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl WorkerSelectionDelegate for NoopDelegate {}

/// Selects workers for containers.
pub struct Pool {
    provider: WorkerProvider,
    poll_interval: Duration,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<mpsc::Receiver<()>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Pool {
    /// Creates a pool over the workers `provider` hands out.
    pub fn new(provider: WorkerProvider, poll_interval: Duration) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            provider,
            poll_interval,
            wake_tx,
            wake_rx: Mutex::new(wake_rx),
        }
    }

    /// Worker source.
    pub fn provider(&self) -> &WorkerProvider {
        &self.provider
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Metrics {
        self.provider.metrics()
    }

    /// Running, version-compatible workers.
    pub async fn running_workers(&self) -> Result<Vec<Worker>> {
        self.provider.running_workers().await
    }

    /// Returns the worker holding the owner's container, or selects one
    /// through `strategy`, waiting while every candidate is at capacity.
    ///
    /// Cancelling while waiting returns [`Error::Cancelled`].
    pub async fn find_or_select_worker(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: &dyn PlacementStrategy,
        delegate: &dyn WorkerSelectionDelegate,
    ) -> Result<Worker> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut waiting: Option<WaitingGuard<'_>> = None;
        loop {
            if let Some(worker) = self
                .try_select(owner, container_spec, worker_spec, strategy)
                .await?
            {
                if waiting.is_some() {
                    info!(worker = %worker.name(), owner = %owner, "Found worker after waiting");
                }
                delegate.selected_worker(worker.name());
                return Ok(worker);
            }

            if waiting.is_none() {
                info!(owner = %owner, spec = %worker_spec, "All workers at capacity, waiting");
                waiting = Some(WaitingGuard::new(self.metrics()));
                delegate.waiting_for_worker(worker_spec);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = ticker.tick() => {}
                _ = self.wait_for_release() => {}
            }
        }
    }

    async fn wait_for_release(&self) {
        let mut rx = self.wake_rx.lock().await;
        rx.recv().await;
    }

    async fn try_select(
        &self,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: &dyn PlacementStrategy,
    ) -> Result<Option<Worker>> {
        let workers = self.provider.running_workers().await?;
        if workers.is_empty() {
            return Err(Error::NoWorkers);
        }

        let compatible = compatible_workers(workers, worker_spec);
        if compatible.is_empty() {
            return Err(Error::NoCompatibleWorkers {
                spec: worker_spec.to_string(),
            });
        }

        let hosting: HashSet<String> = self
            .provider
            .persistence()
            .find_workers_with_container(owner)
            .await?
            .into_iter()
            .collect();
        if let Some(worker) = compatible.iter().find(|w| hosting.contains(w.name())) {
            debug!(worker = %worker.name(), owner = %owner, "Reusing worker holding owner's container");
            return Ok(Some(worker.clone()));
        }

        let ordered = strategy.order(compatible, container_spec).await?;
        for candidate in ordered {
            match strategy.pick(&candidate, container_spec).await {
                Ok(()) => return Ok(Some(candidate)),
                Err(e) => {
                    debug!(worker = %candidate.name(), error = %e, "Worker rejected by placement strategy");
                }
            }
        }
        Ok(None)
    }

    /// Returns capacity reserved on `worker` and wakes one waiting step.
    pub async fn release_worker(
        &self,
        container_spec: &ContainerSpec,
        worker: &Worker,
        strategy: &dyn PlacementStrategy,
    ) {
        strategy.release(worker, container_spec).await;
        let _ = self.wake_tx.try_send(());
    }
}

/// Workers able to run `spec`, restricted to team-owned ones when any fit.
pub fn compatible_workers(workers: Vec<Worker>, spec: &WorkerSpec) -> Vec<Worker> {
    let mut team = Vec::new();
    let mut shared = Vec::new();
    for worker in workers {
        match worker.check(spec) {
            Ok(()) if worker.is_team_owned() => team.push(worker),
            Ok(()) => shared.push(worker),
            Err(reason) => {
                debug!(worker = %worker.name(), reason = %reason, "Worker incompatible");
            }
        }
    }
    if team.is_empty() { shared } else { team }
}
