// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet status reporter tests.

mod common;

use std::time::Duration;

use common::*;
use hangar_worker::persistence::worker_state;
use hangar_worker::status::{StatusReporter, StatusReporterConfig};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_collect_reports_running_workers_and_counters() {
    let fleet = TestFleet::new();
    let mut busy = linux_worker("busy");
    busy.active_containers = 4;
    busy.active_volumes = 9;
    busy.active_tasks = 2;
    fleet.add_worker(busy).await;
    let mut idle = linux_worker("idle");
    idle.team_id = 3;
    idle.active_containers = 1;
    fleet.add_worker(idle).await;
    fleet.add_worker(linux_worker("gone")).await;
    fleet
        .persistence
        .set_worker_state("gone", worker_state::STALLED)
        .await;

    let worker = fleet.worker("busy").await;
    worker
        .find_or_create_container(
            &CancellationToken::new(),
            &step_owner("p1"),
            &task_metadata(),
            &task_spec(),
        )
        .await
        .unwrap();

    let reporter = StatusReporter::new(fleet.pool.clone(), StatusReporterConfig::default());
    let status = reporter.collect().await.unwrap();

    let names: Vec<&str> = status.workers.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(names, vec!["busy", "idle"]);
    assert_eq!(status.workers[1].team_id, 3);
    assert_eq!(status.workers[0].active_volumes, 9);
    assert_eq!(status.active_containers(), 5);
    assert_eq!(status.active_tasks(), 2);
    assert_eq!(status.metrics.containers_created, 1);
    assert_eq!(status.metrics.steps_waiting, 0);
}

#[tokio::test]
async fn test_reporter_stops_on_shutdown() {
    let fleet = TestFleet::new();
    fleet.add_worker(linux_worker("w1")).await;
    let reporter = StatusReporter::new(
        fleet.pool.clone(),
        StatusReporterConfig {
            interval: Duration::from_millis(10),
        },
    );
    let shutdown = reporter.shutdown_handle();
    let handle = tokio::spawn(reporter.run());

    // Let a few reports run first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("reporter did not stop")
        .unwrap();
}
