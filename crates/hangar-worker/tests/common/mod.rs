// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hangar-worker integration tests.
//!
//! Provides TestFleet, an in-memory fleet of workers backed by mock
//! runtimes and volume stores, plus helpers for seeding volumes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hangar_worker::client::MockWorkerClients;
use hangar_worker::compression::Compression;
use hangar_worker::config::StreamingConfig;
use hangar_worker::lock::MemoryLockFactory;
use hangar_worker::metrics::Metrics;
use hangar_worker::persistence::{MemoryPersistence, NewVolume, Persistence, WorkerRecord};
use hangar_worker::pool::{Pool, WorkerSelectionDelegate};
use hangar_worker::spec::{ContainerMetadata, ContainerOwner, ContainerSpec, ImageSpec, WorkerSpec};
use hangar_worker::streamer::Streamer;
use hangar_worker::volume::Volume;
use hangar_worker::worker::{Worker, WorkerProvider};

/// Poll interval short enough that waiting tests finish quickly.
pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Working directory used by test containers.
pub const WORKDIR: &str = "/tmp/build/workdir";

/// Skip test if database URL is not set
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// In-memory fleet: persistence, mock worker services, locks and a pool.
pub struct TestFleet {
    pub persistence: MemoryPersistence,
    pub clients: Arc<MockWorkerClients>,
    pub locks: MemoryLockFactory,
    pub metrics: Arc<Metrics>,
    pub provider: WorkerProvider,
    pub pool: Arc<Pool>,
}

impl TestFleet {
    /// Fleet whose volume stores cannot stream to each other.
    pub fn new() -> Self {
        Self::with_parts(MemoryPersistence::new(), MockWorkerClients::new())
    }

    /// Fleet whose volume stores support P2P streaming.
    pub fn with_p2p() -> Self {
        Self::with_parts(MemoryPersistence::new(), MockWorkerClients::with_p2p())
    }

    /// Fleet whose persistence yields on every call, interleaving
    /// concurrent callers.
    pub fn interleaved() -> Self {
        Self::with_parts(MemoryPersistence::interleaved(), MockWorkerClients::new())
    }

    fn with_parts(persistence: MemoryPersistence, clients: MockWorkerClients) -> Self {
        let clients = Arc::new(clients);
        let locks = MemoryLockFactory::new();
        let metrics = Arc::new(Metrics::new());
        let provider = WorkerProvider::new(
            Arc::new(persistence.clone()),
            clients.clone(),
            Arc::new(locks.clone()),
            metrics.clone(),
        );
        let pool = Arc::new(Pool::new(provider.clone(), TEST_POLL_INTERVAL));
        Self {
            persistence,
            clients,
            locks,
            metrics,
            provider,
            pool,
        }
    }

    /// Registers a worker and returns a handle to it.
    pub async fn add_worker(&self, record: WorkerRecord) -> Worker {
        let name = record.name.clone();
        self.persistence
            .save_worker(&record)
            .await
            .expect("Failed to save worker");
        self.worker(&name).await
    }

    /// Handle to a registered worker, reloaded from persistence.
    pub async fn worker(&self, name: &str) -> Worker {
        self.provider
            .find_worker(name)
            .await
            .expect("Failed to load worker")
            .expect("Worker not registered")
    }

    /// Current active task count of a worker.
    pub async fn active_tasks(&self, name: &str) -> i32 {
        self.persistence
            .find_worker(name)
            .await
            .unwrap()
            .expect("Worker not registered")
            .active_tasks
    }

    /// Streamer using gzip and the given P2P setting.
    pub fn streamer(&self, p2p_enabled: bool) -> Streamer {
        Streamer::new(
            &StreamingConfig {
                compression: Compression::Gzip,
                p2p_enabled,
                p2p_timeout: Duration::from_secs(10),
            },
            self.metrics.clone(),
        )
    }

    /// Creates a standalone volume on `worker` holding `files`.
    pub async fn seed_volume(&self, worker: &Worker, files: &[(&str, &str)]) -> Volume {
        let record = self
            .persistence
            .create_volume(&NewVolume {
                worker_name: worker.name().to_string(),
                team_id: worker.team_id(),
                ..Default::default()
            })
            .await
            .expect("Failed to create volume record");
        self.persistence
            .mark_volume_created(&record.handle)
            .await
            .expect("Failed to mark volume created");

        let remote = self.clients.volumes_for(worker.name()).insert(&record.handle);
        for (path, contents) in files {
            remote.write_file(path, *contents);
        }

        worker
            .lookup_volume(&record.handle)
            .await
            .expect("Failed to look up volume")
            .expect("Seeded volume not found")
    }

    /// Files currently held by a volume.
    pub fn files(&self, worker: &str, handle: &str) -> Vec<(String, String)> {
        self.clients
            .volumes_for(worker)
            .volume(handle)
            .expect("Volume not in store")
            .files()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
            .collect()
    }
}

/// Shared linux worker with no tags or resource types.
pub fn linux_worker(name: &str) -> WorkerRecord {
    WorkerRecord::new(name, "linux")
}

/// Owner for a build step of build 1.
pub fn step_owner(plan_id: &str) -> ContainerOwner {
    ContainerOwner::BuildStep {
        build_id: 1,
        plan_id: plan_id.to_string(),
        team_id: 1,
    }
}

/// Task container running busybox in [`WORKDIR`].
pub fn task_spec() -> ContainerSpec {
    ContainerSpec::new(1, ImageSpec::registry("docker:///busybox"), WORKDIR)
}

/// Metadata for a task step of build 1.
pub fn task_metadata() -> ContainerMetadata {
    ContainerMetadata {
        step_name: "unit".to_string(),
        working_directory: WORKDIR.to_string(),
        build_id: Some(1),
        ..Default::default()
    }
}

/// Worker spec for team 1 on linux.
pub fn linux_spec() -> WorkerSpec {
    WorkerSpec {
        platform: Some("linux".to_string()),
        team_id: 1,
        ..Default::default()
    }
}

/// Records selection callbacks.
#[derive(Default)]
pub struct RecordingDelegate {
    pub waiting: AtomicUsize,
    pub selected: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn selected(&self) -> Vec<String> {
        self.selected.lock().unwrap().clone()
    }
}

impl WorkerSelectionDelegate for RecordingDelegate {
    fn waiting_for_worker(&self, _spec: &WorkerSpec) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
    }

    fn selected_worker(&self, worker: &str) {
        self.selected.lock().unwrap().push(worker.to_string());
    }
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Owned `(path, contents)` pairs, comparable with [`TestFleet::files`].
pub fn file_list(entries: &[(&str, &str)]) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(path, contents)| (path.to_string(), contents.to_string()))
        .collect()
}
