// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Worker - Worker Allocation and Container Lifecycle
//!
//! This crate decides which worker a build step runs on, provisions the
//! step's container and volumes there, and moves artifacts between
//! workers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Build step execution                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │ select worker              │ fetch resource        │ stream
//!          ▼                            ▼                       ▼
//! ┌─────────────────┐         ┌──────────────────┐     ┌──────────────────┐
//! │      Pool       │         │     Fetcher      │     │ ArtifactRepository│
//! │  + Placement    │         │ (advisory lock)  │     │   + Streamer     │
//! └─────────────────┘         └──────────────────┘     └──────────────────┘
//!          │                            │                       │
//!          ▼                            ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Worker                                     │
//! │        find-or-create Container  ──mounts──►  find-or-create Volume     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │                            │                       │
//!          ▼                            ▼                       ▼
//! ┌──────────────────┐       ┌────────────────────┐    ┌──────────────────┐
//! │  RuntimeClient   │       │   VolumeClient     │    │   Persistence    │
//! │ (per worker)     │       │   (per worker)     │    │  (PostgreSQL)    │
//! └──────────────────┘       └────────────────────┘    └──────────────────┘
//! ```
//!
//! # Placement Strategies
//!
//! | Name | Effect |
//! |------|--------|
//! | `volume-locality` | Prefer workers already holding the step's inputs and caches |
//! | `fewest-build-containers` | Prefer workers running the fewest build containers |
//! | `limit-active-tasks` | Reject workers at the active task cap |
//! | `limit-active-containers` | Reject workers at the container cap |
//! | `limit-active-volumes` | Reject workers at the volume cap |
//! | `random` | Shuffle only |
//!
//! # Container Record States
//!
//! ```text
//!   ┌──────────┐   runtime created   ┌─────────┐
//!   │ CREATING │────────────────────►│ CREATED │
//!   └────┬─────┘                     └─────────┘
//!        │ creation failed
//!        ▼
//!   ┌────────┐
//!   │ FAILED │
//!   └────────┘
//! ```
//!
//! Volumes follow the same lifecycle.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HANGAR_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `HANGAR_PLACEMENT_STRATEGY` | No | `volume-locality` | Comma-separated strategy chain |
//! | `HANGAR_MAX_ACTIVE_TASKS_PER_WORKER` | No | `0` | Task cap, zero is unlimited |
//! | `HANGAR_MAX_ACTIVE_CONTAINERS_PER_WORKER` | No | `0` | Container cap |
//! | `HANGAR_MAX_ACTIVE_VOLUMES_PER_WORKER` | No | `0` | Volume cap |
//! | `HANGAR_WORKER_POLL_INTERVAL_SECS` | No | `5` | Poll interval while waiting |
//! | `HANGAR_LOCK_RETRY_INTERVAL_SECS` | No | `5` | Fetch lock retry interval |
//! | `HANGAR_WORKER_VERSION` | No | - | Minimum worker version |
//! | `HANGAR_STREAMING_COMPRESSION` | No | `gzip` | `gzip`, `zstd` or `raw` |
//! | `HANGAR_P2P_STREAMING_ENABLED` | No | `false` | Stream volumes worker to worker |
//! | `HANGAR_P2P_STREAMING_TIMEOUT_SECS` | No | `0` | P2P push timeout, zero is unbounded |
//! | `HANGAR_STATUS_INTERVAL_SECS` | No | `30` | Fleet status report interval |
//!
//! *Required by the `hangar-worker` binary only.

#![deny(missing_docs)]

/// Named artifacts and the repository steps stream them through.
pub mod artifact;

/// Worker collaborators: container runtime and volume store clients.
pub mod client;

/// Compression codecs for tar streams.
pub mod compression;

/// Configuration loaded from environment variables.
pub mod config;

/// Runtime containers paired with their records.
pub mod container;

/// Error types.
pub mod error;

/// Lock-coordinated resource fetching.
pub mod fetcher;

/// Advisory locks.
pub mod lock;

/// Allocation and provisioning counters.
pub mod metrics;

/// Database migrations.
pub mod migrations;

/// Worker, container and volume records.
pub mod persistence;

/// Container placement strategies.
pub mod placement;

/// Worker selection.
pub mod pool;

/// Reattaching process handles.
pub mod process;

/// Resource scripts.
pub mod resource;

/// Embeddable runtime.
pub mod runtime;

/// Request values for workers and containers.
pub mod spec;

/// Fleet status reporting.
pub mod status;

/// Closable byte streams.
pub mod stream;

/// Volume-to-volume streaming.
pub mod streamer;

/// Worker version compatibility.
pub mod version;

/// Store volumes paired with their records.
pub mod volume;

/// Workers and container provisioning.
pub mod worker;

pub use artifact::{ArtifactRepository, ArtifactSource, VolumeArtifactSource};
pub use config::Config;
pub use container::Container;
pub use error::{Error, Incompatibility, Result};
pub use fetcher::{Fetcher, ResourceFetchSource};
pub use placement::{ContainerPlacementStrategy, PlacementStrategy};
pub use pool::{Pool, WorkerSelectionDelegate};
pub use runtime::HangarRuntime;
pub use spec::{ContainerOwner, ContainerSpec, WorkerSpec};
pub use streamer::Streamer;
pub use volume::Volume;
pub use worker::{Worker, WorkerProvider};
