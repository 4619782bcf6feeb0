// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hangar_worker::client::MockWorkerClients;
use hangar_worker::config::Config;
use hangar_worker::lock::MemoryLockFactory;
use hangar_worker::persistence::{MemoryPersistence, Persistence};
use hangar_worker::placement::{PlacementStrategy, StrategyKind};
use hangar_worker::pool::NoopDelegate;
use hangar_worker::runtime::{HangarRuntime, HangarRuntimeBuilder};
use tokio_util::sync::CancellationToken;

fn builder(persistence: &MemoryPersistence, clients: &Arc<MockWorkerClients>) -> HangarRuntimeBuilder {
    HangarRuntime::builder()
        .persistence(Arc::new(persistence.clone()))
        .clients(clients.clone())
        .locks(Arc::new(MemoryLockFactory::new()))
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.worker_poll_interval = Duration::from_millis(50);
    config.status_interval = Duration::from_millis(20);
    config
}

#[tokio::test]
async fn test_runtime_selects_and_provisions() {
    let persistence = MemoryPersistence::new();
    let clients = Arc::new(MockWorkerClients::new());
    persistence.save_worker(&linux_worker("w1")).await.unwrap();

    let mut config = test_config();
    config.placement.strategies = vec![StrategyKind::LimitActiveTasks];
    config.placement.max_active_tasks_per_worker = 2;
    config.proxy.http_proxy = Some("http://proxy:3128".into());

    let runtime = builder(&persistence, &clients)
        .config(config)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());
    assert_eq!(runtime.strategy().name(), "limit-active-tasks");
    assert_eq!(runtime.pool().running_workers().await.unwrap().len(), 1);

    let cancel = CancellationToken::new();
    let worker = runtime
        .pool()
        .find_or_select_worker(
            &cancel,
            &step_owner("p1"),
            &task_spec(),
            &linux_spec(),
            runtime.strategy().as_ref(),
            &NoopDelegate,
        )
        .await
        .unwrap();
    assert_eq!(worker.name(), "w1");
    assert_eq!(persistence.find_worker("w1").await.unwrap().unwrap().active_tasks, 1);

    let container = worker
        .find_or_create_container(&cancel, &step_owner("p1"), &task_metadata(), &task_spec())
        .await
        .unwrap();
    let created = clients.runtime_for("w1").container(container.handle()).unwrap();
    assert_eq!(created.spec().env, vec!["http_proxy=http://proxy:3128"]);
    assert_eq!(runtime.metrics().snapshot().containers_created, 1);

    runtime
        .pool()
        .release_worker(&task_spec(), &worker, runtime.strategy().as_ref())
        .await;
    assert_eq!(persistence.find_worker("w1").await.unwrap().unwrap().active_tasks, 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_build_requires_collaborators() {
    let result = HangarRuntime::builder()
        .clients(Arc::new(MockWorkerClients::new()))
        .locks(Arc::new(MemoryLockFactory::new()))
        .build();
    let err = result.err().unwrap();
    assert!(err.to_string().contains("persistence"));

    let result = HangarRuntime::builder()
        .persistence(Arc::new(MemoryPersistence::new()))
        .locks(Arc::new(MemoryLockFactory::new()))
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_build_rejects_negative_caps() {
    let mut config = test_config();
    config.placement.max_active_tasks_per_worker = -1;

    let result = builder(&MemoryPersistence::new(), &Arc::new(MockWorkerClients::new()))
        .config(config)
        .build();

    assert!(result.is_err());
}

#[tokio::test]
async fn test_shutdown_stops_background_tasks() {
    let runtime = builder(&MemoryPersistence::new(), &Arc::new(MockWorkerClients::new()))
        .config(test_config())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(runtime.is_running());

    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown timed out")
        .unwrap();
}
