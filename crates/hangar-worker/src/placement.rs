// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container placement strategies.
//!
//! A placement strategy orders candidate workers and admits or rejects a
//! container on one of them. Strategies are configured as a chain: the
//! candidates are shuffled once, then every node sorts them stably,
//! starting from the last node so that the first configured node ends up
//! as the primary sort key.
//!
//! | Strategy | Order | Admission |
//! |----------|-------|-----------|
//! | `volume-locality` | most inputs already on the worker first | - |
//! | `fewest-build-containers` | fewest build containers first | - |
//! | `limit-active-tasks` | fewest active tasks first | task containers only |
//! | `limit-active-containers` | fewest active containers first | active containers below the cap |
//! | `limit-active-volumes` | fewest active volumes first | active volumes below the cap |
//! | `random` | - | - |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::error::{Error, Result};
use crate::spec::{ContainerSpec, ContainerType};
use crate::worker::Worker;

/// Orders candidates and admits containers onto workers.
#[async_trait]
pub trait PlacementStrategy: Send + Sync {
    /// Name for logs and errors.
    fn name(&self) -> String;

    /// Candidates in preference order.
    async fn order(&self, workers: Vec<Worker>, spec: &ContainerSpec) -> Result<Vec<Worker>>;

    /// Admits the container onto `worker`, reserving capacity.
    async fn pick(&self, worker: &Worker, spec: &ContainerSpec) -> Result<()>;

    /// Returns capacity reserved by a successful `pick`.
    async fn release(&self, worker: &Worker, spec: &ContainerSpec);
}

/// Names of the available chain nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Prefer workers already holding the inputs.
    VolumeLocality,
    /// Prefer workers running the fewest build containers.
    FewestBuildContainers,
    /// Cap and balance active task containers.
    LimitActiveTasks,
    /// Cap active containers.
    LimitActiveContainers,
    /// Cap active volumes.
    LimitActiveVolumes,
    /// Shuffle only.
    Random,
}

impl StrategyKind {
    /// Configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::VolumeLocality => "volume-locality",
            StrategyKind::FewestBuildContainers => "fewest-build-containers",
            StrategyKind::LimitActiveTasks => "limit-active-tasks",
            StrategyKind::LimitActiveContainers => "limit-active-containers",
            StrategyKind::LimitActiveVolumes => "limit-active-volumes",
            StrategyKind::Random => "random",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "volume-locality" => Ok(StrategyKind::VolumeLocality),
            "fewest-build-containers" => Ok(StrategyKind::FewestBuildContainers),
            "limit-active-tasks" => Ok(StrategyKind::LimitActiveTasks),
            "limit-active-containers" => Ok(StrategyKind::LimitActiveContainers),
            "limit-active-volumes" => Ok(StrategyKind::LimitActiveVolumes),
            "random" => Ok(StrategyKind::Random),
            other => Err(Error::InvalidStrategy(other.to_string())),
        }
    }
}

/// Strategy chain and admission caps. A cap of zero disables it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementOptions {
    /// Chain nodes in priority order.
    pub strategies: Vec<StrategyKind>,
    /// Cap for `limit-active-tasks`.
    pub max_active_tasks_per_worker: i32,
    /// Cap for `limit-active-containers`.
    pub max_active_containers_per_worker: i32,
    /// Cap for `limit-active-volumes`.
    pub max_active_volumes_per_worker: i32,
}

impl Default for PlacementOptions {
    fn default() -> Self {
        Self {
            strategies: vec![StrategyKind::VolumeLocality],
            max_active_tasks_per_worker: 0,
            max_active_containers_per_worker: 0,
            max_active_volumes_per_worker: 0,
        }
    }
}

/// The configured chain of placement nodes.
pub struct ContainerPlacementStrategy {
    kinds: Vec<StrategyKind>,
    nodes: Vec<Box<dyn PlacementStrategy>>,
}

impl fmt::Debug for ContainerPlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerPlacementStrategy")
            .field("strategies", &self.kinds)
            .finish()
    }
}

impl ContainerPlacementStrategy {
    /// Builds the chain, rejecting negative caps.
    pub fn new(options: &PlacementOptions) -> Result<Self> {
        for (var, value) in [
            ("max_active_tasks_per_worker", options.max_active_tasks_per_worker),
            ("max_active_containers_per_worker", options.max_active_containers_per_worker),
            ("max_active_volumes_per_worker", options.max_active_volumes_per_worker),
        ] {
            if value < 0 {
                return Err(ConfigError::NegativeLimit { var, value }.into());
            }
        }

        let mut nodes: Vec<Box<dyn PlacementStrategy>> = Vec::new();
        for kind in &options.strategies {
            match kind {
                StrategyKind::VolumeLocality => nodes.push(Box::new(VolumeLocality)),
                StrategyKind::FewestBuildContainers => nodes.push(Box::new(FewestBuildContainers)),
                StrategyKind::LimitActiveTasks => nodes.push(Box::new(LimitActiveTasks {
                    max: options.max_active_tasks_per_worker,
                })),
                StrategyKind::LimitActiveContainers => nodes.push(Box::new(LimitActive::containers(
                    options.max_active_containers_per_worker,
                ))),
                StrategyKind::LimitActiveVolumes => nodes.push(Box::new(LimitActive::volumes(
                    options.max_active_volumes_per_worker,
                ))),
                StrategyKind::Random => {}
            }
        }
        Ok(Self {
            kinds: options.strategies.clone(),
            nodes,
        })
    }

    /// Chain from a comma-separated list of names.
    pub fn from_names(names: &str, options: &PlacementOptions) -> Result<Self> {
        let strategies = names
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(StrategyKind::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::new(&PlacementOptions {
            strategies,
            ..options.clone()
        })
    }
}

#[async_trait]
impl PlacementStrategy for ContainerPlacementStrategy {
    fn name(&self) -> String {
        self.kinds
            .iter()
            .map(StrategyKind::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn order(&self, mut workers: Vec<Worker>, spec: &ContainerSpec) -> Result<Vec<Worker>> {
        workers.shuffle(&mut rand::thread_rng());
        for node in self.nodes.iter().rev() {
            workers = node.order(workers, spec).await?;
        }
        if workers.is_empty() {
            return Err(Error::NoWorkerFitStrategy {
                strategy: self.name(),
            });
        }
        Ok(workers)
    }

    async fn pick(&self, worker: &Worker, spec: &ContainerSpec) -> Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            if let Err(e) = node.pick(worker, spec).await {
                for picked in self.nodes[..i].iter().rev() {
                    picked.release(worker, spec).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn release(&self, worker: &Worker, spec: &ContainerSpec) {
        for node in self.nodes.iter().rev() {
            node.release(worker, spec).await;
        }
    }
}

struct VolumeLocality;

impl VolumeLocality {
    async fn local_volumes(worker: &Worker, spec: &ContainerSpec) -> usize {
        let mut count = 0;
        for input in &spec.inputs {
            match input.artifact.exists_on(worker).await {
                Ok(Some(_)) => count += 1,
                Ok(None) => {}
                Err(e) => warn!(worker = %worker.name(), error = %e, "Failed to look up input volume"),
            }
        }
        for cache in &spec.caches {
            let Some(key) = spec.task_cache_key(cache) else {
                continue;
            };
            match worker.find_volume_for_task_cache(&key).await {
                Ok(Some(_)) => count += 1,
                Ok(None) => {}
                Err(e) => warn!(worker = %worker.name(), error = %e, "Failed to look up task cache"),
            }
        }
        count
    }
}

#[async_trait]
impl PlacementStrategy for VolumeLocality {
    fn name(&self) -> String {
        StrategyKind::VolumeLocality.to_string()
    }

    async fn order(&self, workers: Vec<Worker>, spec: &ContainerSpec) -> Result<Vec<Worker>> {
        let mut counted = Vec::with_capacity(workers.len());
        for worker in workers {
            let count = Self::local_volumes(&worker, spec).await;
            counted.push((count, worker));
        }
        counted.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(counted.into_iter().map(|(_, w)| w).collect())
    }

    async fn pick(&self, _worker: &Worker, _spec: &ContainerSpec) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _worker: &Worker, _spec: &ContainerSpec) {}
}

struct FewestBuildContainers;

#[async_trait]
impl PlacementStrategy for FewestBuildContainers {
    fn name(&self) -> String {
        StrategyKind::FewestBuildContainers.to_string()
    }

    async fn order(&self, workers: Vec<Worker>, _spec: &ContainerSpec) -> Result<Vec<Worker>> {
        let mut counted = Vec::with_capacity(workers.len());
        for worker in workers {
            let count = worker.build_containers().await?;
            counted.push((count, worker));
        }
        counted.sort_by_key(|(count, _)| *count);
        Ok(counted.into_iter().map(|(_, w)| w).collect())
    }

    async fn pick(&self, _worker: &Worker, _spec: &ContainerSpec) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _worker: &Worker, _spec: &ContainerSpec) {}
}

struct LimitActiveTasks {
    max: i32,
}

#[async_trait]
impl PlacementStrategy for LimitActiveTasks {
    fn name(&self) -> String {
        StrategyKind::LimitActiveTasks.to_string()
    }

    async fn order(&self, mut workers: Vec<Worker>, spec: &ContainerSpec) -> Result<Vec<Worker>> {
        if spec.container_type == ContainerType::Task {
            workers.sort_by_key(|w| w.active_tasks());
        }
        Ok(workers)
    }

    async fn pick(&self, worker: &Worker, spec: &ContainerSpec) -> Result<()> {
        if spec.container_type != ContainerType::Task {
            return Ok(());
        }
        let active = worker.increase_active_tasks().await?;
        if self.max > 0 && active > self.max {
            debug!(worker = %worker.name(), active, max = self.max, "Too many active tasks");
            if let Err(e) = worker.decrease_active_tasks().await {
                warn!(worker = %worker.name(), error = %e, "Failed to decrease active tasks");
            }
            return Err(Error::TooManyActiveTasks);
        }
        Ok(())
    }

    async fn release(&self, worker: &Worker, spec: &ContainerSpec) {
        if spec.container_type != ContainerType::Task {
            return;
        }
        if let Err(e) = worker.decrease_active_tasks().await {
            warn!(worker = %worker.name(), error = %e, "Failed to decrease active tasks");
        }
    }
}

#[derive(Clone, Copy)]
enum Counted {
    Containers,
    Volumes,
}

/// Admissions on one worker not yet covered by its heartbeat.
#[derive(Debug, Default)]
struct Reservation {
    /// Heartbeat count the pending admissions were made against.
    reported: i32,
    pending: i32,
}

impl Reservation {
    /// Folds in a heartbeat count. Growth since the last one is taken to be
    /// pending admissions showing up.
    fn observe(&mut self, reported: i32) {
        if reported > self.reported {
            self.pending = (self.pending - (reported - self.reported)).max(0);
        }
        self.reported = reported;
    }
}

/// Caps a heartbeat-reported count. Admissions since the last heartbeat
/// are tracked in-process so that concurrent picks cannot overshoot.
struct LimitActive {
    counted: Counted,
    max: i32,
    reserved: Mutex<HashMap<String, Reservation>>,
}

impl LimitActive {
    fn containers(max: i32) -> Self {
        Self {
            counted: Counted::Containers,
            max,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    fn volumes(max: i32) -> Self {
        Self {
            counted: Counted::Volumes,
            max,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    fn reported(&self, worker: &Worker) -> i32 {
        match self.counted {
            Counted::Containers => worker.active_containers(),
            Counted::Volumes => worker.active_volumes(),
        }
    }
}

#[async_trait]
impl PlacementStrategy for LimitActive {
    fn name(&self) -> String {
        match self.counted {
            Counted::Containers => StrategyKind::LimitActiveContainers.to_string(),
            Counted::Volumes => StrategyKind::LimitActiveVolumes.to_string(),
        }
    }

    async fn order(&self, mut workers: Vec<Worker>, _spec: &ContainerSpec) -> Result<Vec<Worker>> {
        workers.sort_by_key(|w| self.reported(w));
        Ok(workers)
    }

    async fn pick(&self, worker: &Worker, _spec: &ContainerSpec) -> Result<()> {
        if self.max == 0 {
            return Ok(());
        }
        let reported = self.reported(worker);
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        let reservation = reserved.entry(worker.name().to_string()).or_default();
        reservation.observe(reported);
        let active = reported + reservation.pending;
        if active >= self.max {
            debug!(worker = %worker.name(), active, max = self.max, strategy = %self.name(), "Admission rejected");
            return Err(match self.counted {
                Counted::Containers => Error::TooManyActiveContainers,
                Counted::Volumes => Error::TooManyActiveVolumes,
            });
        }
        reservation.pending += 1;
        Ok(())
    }

    async fn release(&self, worker: &Worker, _spec: &ContainerSpec) {
        if self.max == 0 {
            return;
        }
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reservation) = reserved.get_mut(worker.name()) {
            reservation.pending = (reservation.pending - 1).max(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names_round_trip() {
        for name in [
            "volume-locality",
            "fewest-build-containers",
            "limit-active-tasks",
            "limit-active-containers",
            "limit-active-volumes",
            "random",
        ] {
            assert_eq!(StrategyKind::from_str(name).unwrap().as_str(), name);
        }
        assert!(matches!(
            StrategyKind::from_str("closest"),
            Err(Error::InvalidStrategy(_))
        ));
    }

    #[test]
    fn test_negative_limits_are_rejected() {
        let options = PlacementOptions {
            max_active_tasks_per_worker: -1,
            ..Default::default()
        };
        let err = ContainerPlacementStrategy::new(&options).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::NegativeLimit { value: -1, .. })
        ));
    }

    #[test]
    fn test_reservation_absorbs_reported_growth() {
        let mut reservation = Reservation::default();
        reservation.observe(0);
        reservation.pending = 2;

        reservation.observe(1);
        assert_eq!(reservation.pending, 1);

        // Containers finishing do not cancel admissions still in flight.
        reservation.observe(0);
        assert_eq!(reservation.pending, 1);

        reservation.observe(4);
        assert_eq!(reservation.pending, 0);
        assert_eq!(reservation.reported, 4);
    }

    #[test]
    fn test_chain_name_lists_nodes() {
        let chain = ContainerPlacementStrategy::from_names(
            "fewest-build-containers, limit-active-tasks",
            &PlacementOptions::default(),
        )
        .unwrap();
        assert_eq!(chain.name(), "fewest-build-containers,limit-active-tasks");
    }
}
