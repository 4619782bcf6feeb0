// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streamer and artifact repository tests.

mod common;

use std::sync::Arc;

use common::*;
use hangar_worker::artifact::{ArtifactRepository, ArtifactSource, VolumeArtifactSource};
use hangar_worker::error::Error;
use tokio::io::AsyncReadExt;

async fn read_file(stream: &mut hangar_worker::streamer::FileStream) -> String {
    let mut contents = String::new();
    stream.read_to_string(&mut contents).await.unwrap();
    contents
}

// ============================================================================
// Volume streaming
// ============================================================================

#[tokio::test]
async fn test_relay_copies_whole_volume() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let w2 = fleet.add_worker(linux_worker("w2")).await;
    let src = fleet
        .seed_volume(&w1, &[("a.txt", "alpha"), ("nested/b.txt", "beta")])
        .await;
    let dst = fleet.seed_volume(&w2, &[]).await;

    fleet.streamer(false).stream(&src, &dst).await.unwrap();

    assert_eq!(
        fleet.files("w2", dst.handle()),
        file_list(&[("a.txt", "alpha"), ("nested/b.txt", "beta")])
    );
    let src_mock = fleet.clients.volumes_for("w1").volume(src.handle()).unwrap();
    assert_eq!(src_mock.calls(), vec!["stream_out:."]);
    assert!(src_mock.stream_closed());
    assert_eq!(
        fleet.clients.volumes_for("w2").volume(dst.handle()).unwrap().calls(),
        vec!["stream_in:."]
    );
    assert_eq!(fleet.metrics.snapshot().volumes_streamed, 1);
}

#[tokio::test]
async fn test_p2p_pushes_directly_between_stores() {
    let fleet = TestFleet::with_p2p();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let w2 = fleet.add_worker(linux_worker("w2")).await;
    let src = fleet.seed_volume(&w1, &[("bin/tool", "elf")]).await;
    let dst = fleet.seed_volume(&w2, &[]).await;

    fleet.streamer(true).stream(&src, &dst).await.unwrap();

    assert_eq!(
        fleet.files("w2", dst.handle()),
        file_list(&[("bin/tool", "elf")])
    );
    assert_eq!(
        fleet.clients.volumes_for("w1").volume(src.handle()).unwrap().calls(),
        vec!["p2p_out:."]
    );
    assert_eq!(
        fleet.clients.volumes_for("w2").volume(dst.handle()).unwrap().calls(),
        vec!["p2p_url:.", "p2p_in:."]
    );
    assert_eq!(fleet.metrics.snapshot().volumes_streamed, 1);
}

#[tokio::test]
async fn test_p2p_capable_stores_relay_when_disabled() {
    let fleet = TestFleet::with_p2p();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let w2 = fleet.add_worker(linux_worker("w2")).await;
    let src = fleet.seed_volume(&w1, &[("x", "1")]).await;
    let dst = fleet.seed_volume(&w2, &[]).await;

    fleet.streamer(false).stream(&src, &dst).await.unwrap();

    assert_eq!(
        fleet.clients.volumes_for("w1").volume(src.handle()).unwrap().calls(),
        vec!["stream_out:."]
    );
    assert_eq!(fleet.files("w2", dst.handle()), file_list(&[("x", "1")]));
}

// ============================================================================
// Single files
// ============================================================================

#[tokio::test]
async fn test_p2p_falls_back_to_relay_when_one_store_lacks_it() {
    let fleet = TestFleet::with_p2p();
    fleet.clients.set_volume_p2p("w2", false);
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let w2 = fleet.add_worker(linux_worker("w2")).await;
    let capable = fleet.seed_volume(&w1, &[("x", "1")]).await;
    let plain = fleet.seed_volume(&w2, &[("y", "2")]).await;
    let streamer = fleet.streamer(true);

    streamer.stream(&capable, &plain).await.unwrap();
    assert_eq!(
        fleet.clients.volumes_for("w1").volume(capable.handle()).unwrap().calls(),
        vec!["stream_out:."]
    );
    assert_eq!(
        fleet.clients.volumes_for("w2").volume(plain.handle()).unwrap().calls(),
        vec!["stream_in:."]
    );
    assert_eq!(
        fleet.files("w2", plain.handle()),
        file_list(&[("x", "1"), ("y", "2")])
    );

    let back = fleet.seed_volume(&w1, &[]).await;
    let origin = fleet.seed_volume(&w2, &[("z", "3")]).await;
    streamer.stream(&origin, &back).await.unwrap();
    assert_eq!(
        fleet.clients.volumes_for("w2").volume(origin.handle()).unwrap().calls(),
        vec!["stream_out:."]
    );
    assert_eq!(
        fleet.clients.volumes_for("w1").volume(back.handle()).unwrap().calls(),
        vec!["stream_in:."]
    );
    assert_eq!(fleet.files("w1", back.handle()), file_list(&[("z", "3")]));
    assert_eq!(fleet.metrics.snapshot().volumes_streamed, 2);
}

#[tokio::test]
async fn test_stream_file_reads_one_file() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let volume = fleet
        .seed_volume(&w1, &[("dir/a.txt", "first"), ("dir/b.txt", "second")])
        .await;

    let mut file = fleet
        .streamer(false)
        .stream_file(&volume, "dir/a.txt")
        .await
        .unwrap();

    assert_eq!(read_file(&mut file).await, "first");
    file.close().await.unwrap();
    assert!(
        fleet
            .clients
            .volumes_for("w1")
            .volume(volume.handle())
            .unwrap()
            .stream_closed()
    );
}

#[tokio::test]
async fn test_stream_file_missing_path_closes_stream() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let volume = fleet.seed_volume(&w1, &[("a.txt", "a")]).await;

    let err = fleet
        .streamer(false)
        .stream_file(&volume, "missing.txt")
        .await
        .err()
        .unwrap();

    assert!(matches!(&err, Error::FileNotFound(path) if path == "missing.txt"));
    assert!(
        fleet
            .clients
            .volumes_for("w1")
            .volume(volume.handle())
            .unwrap()
            .stream_closed()
    );
}

#[tokio::test]
async fn test_stream_file_missing_path_survives_close_failure() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let volume = fleet.seed_volume(&w1, &[("a.txt", "a")]).await;
    fleet.clients.volumes_for("w1").fail_stream_close();

    let err = fleet
        .streamer(false)
        .stream_file(&volume, "missing.txt")
        .await
        .err()
        .unwrap();

    assert!(matches!(&err, Error::FileNotFound(path) if path == "missing.txt"));
}

#[tokio::test]
async fn test_stream_file_reports_close_failure() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let volume = fleet.seed_volume(&w1, &[("a.txt", "payload")]).await;
    fleet.clients.volumes_for("w1").fail_stream_close();

    let mut file = fleet
        .streamer(false)
        .stream_file(&volume, "a.txt")
        .await
        .unwrap();
    assert_eq!(read_file(&mut file).await, "payload");

    match file.close().await.unwrap_err() {
        Error::Close(failures) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("transport"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Artifact repository
// ============================================================================

#[tokio::test]
async fn test_repository_registers_and_replaces_sources() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let first = fleet.seed_volume(&w1, &[("v", "1")]).await;
    let second = fleet.seed_volume(&w1, &[("v", "2")]).await;
    let repo = ArtifactRepository::new();

    assert!(repo.source_for("repo").is_none());
    repo.register_source(
        "repo",
        Arc::new(VolumeArtifactSource::new(first, fleet.streamer(false))),
    );
    repo.register_source(
        "other",
        Arc::new(VolumeArtifactSource::new(second.clone(), fleet.streamer(false))),
    );
    repo.register_source(
        "repo",
        Arc::new(VolumeArtifactSource::new(second, fleet.streamer(false))),
    );

    let map = repo.as_map();
    assert_eq!(map.len(), 2);
    let mut file = repo.stream_file("repo/v").await.unwrap();
    assert_eq!(read_file(&mut file).await, "2");
    file.close().await.unwrap();
}

#[tokio::test]
async fn test_repository_streams_artifacts_into_named_subdirectories() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let w2 = fleet.add_worker(linux_worker("w2")).await;
    let repo_volume = fleet.seed_volume(&w1, &[("README", "hello")]).await;
    let build_volume = fleet.seed_volume(&w1, &[("out/app", "bin")]).await;
    let dst = fleet.seed_volume(&w2, &[]).await;

    let repo = ArtifactRepository::new();
    repo.register_source(
        "repo",
        Arc::new(VolumeArtifactSource::new(repo_volume, fleet.streamer(false))),
    );
    repo.register_source(
        "build",
        Arc::new(VolumeArtifactSource::new(build_volume, fleet.streamer(false))),
    );

    repo.stream_to(&dst).await.unwrap();

    assert_eq!(
        fleet.files("w2", dst.handle()),
        file_list(&[("build/out/app", "bin"), ("repo/README", "hello")])
    );
    assert_eq!(
        fleet.clients.volumes_for("w2").volume(dst.handle()).unwrap().calls(),
        vec!["stream_in:build", "stream_in:repo"]
    );
}

#[tokio::test]
async fn test_repository_stream_file_needs_artifact_and_path() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let volume = fleet.seed_volume(&w1, &[("y", "why")]).await;
    let repo = ArtifactRepository::new();
    repo.register_source(
        "repo",
        Arc::new(VolumeArtifactSource::new(volume, fleet.streamer(false))),
    );

    let mut file = repo.stream_file("repo/y").await.unwrap();
    assert_eq!(read_file(&mut file).await, "why");
    file.close().await.unwrap();

    for path in ["repo", "missing/y"] {
        let err = repo.stream_file(path).await.err().unwrap();
        assert!(matches!(&err, Error::FileNotFound(p) if p == path));
    }
}

#[tokio::test]
async fn test_volume_source_exists_on_owner_or_resource_cache_holder() {
    let fleet = TestFleet::new();
    let w1 = fleet.add_worker(linux_worker("w1")).await;
    let w2 = fleet.add_worker(linux_worker("w2")).await;
    let w3 = fleet.add_worker(linux_worker("w3")).await;
    let mut volume = fleet.seed_volume(&w1, &[("v", "1")]).await;
    volume.initialize_resource_cache(4).await.unwrap();
    let mut copy = fleet.seed_volume(&w2, &[("v", "1")]).await;
    copy.initialize_resource_cache(4).await.unwrap();

    let source = VolumeArtifactSource::new(volume.clone(), fleet.streamer(false));

    let local = source.exists_on(&w1).await.unwrap().unwrap();
    assert_eq!(local.handle(), volume.handle());
    let cached = source.exists_on(&w2).await.unwrap().unwrap();
    assert_eq!(cached.handle(), copy.handle());
    assert!(source.exists_on(&w3).await.unwrap().is_none());
    assert_eq!(source.resource_cache_id(), Some(4));
}
