// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide counters for worker allocation and provisioning.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Allocation and provisioning counters.
///
/// Shared as `Arc<Metrics>` between the pool, workers and the streamer.
#[derive(Debug, Default)]
pub struct Metrics {
    steps_waiting: AtomicI64,
    containers_created: AtomicU64,
    failed_containers: AtomicU64,
    volumes_created: AtomicU64,
    failed_volumes: AtomicU64,
    volumes_streamed: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Steps currently waiting for a worker.
    pub steps_waiting: i64,
    /// Containers created.
    pub containers_created: u64,
    /// Container creations that failed.
    pub failed_containers: u64,
    /// Volumes created.
    pub volumes_created: u64,
    /// Volume creations that failed.
    pub failed_volumes: u64,
    /// Volumes streamed between workers.
    pub volumes_streamed: u64,
}

impl Metrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn step_waiting(&self) {
        self.steps_waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn step_done_waiting(&self) {
        self.steps_waiting.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn container_created(&self) {
        self.containers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn container_failed(&self) {
        self.failed_containers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn volume_created(&self) {
        self.volumes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn volume_failed(&self) {
        self.failed_volumes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn volume_streamed(&self) {
        self.volumes_streamed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            steps_waiting: self.steps_waiting.load(Ordering::Relaxed),
            containers_created: self.containers_created.load(Ordering::Relaxed),
            failed_containers: self.failed_containers.load(Ordering::Relaxed),
            volumes_created: self.volumes_created.load(Ordering::Relaxed),
            failed_volumes: self.failed_volumes.load(Ordering::Relaxed),
            volumes_streamed: self.volumes_streamed.load(Ordering::Relaxed),
        }
    }
}

/// Counts a step as waiting until dropped.
pub(crate) struct WaitingGuard<'a>(&'a Metrics);

impl<'a> WaitingGuard<'a> {
    pub(crate) fn new(metrics: &'a Metrics) -> Self {
        metrics.step_waiting();
        Self(metrics)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.step_done_waiting();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_guard_balances_gauge() {
        let metrics = Metrics::new();
        {
            let _a = WaitingGuard::new(&metrics);
            let _b = WaitingGuard::new(&metrics);
            assert_eq!(metrics.snapshot().steps_waiting, 2);
        }
        assert_eq!(metrics.snapshot().steps_waiting, 0);
    }
}
