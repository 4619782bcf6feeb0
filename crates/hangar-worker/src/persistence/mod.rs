// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for worker, container and volume records.
//!
//! The scheduler never talks SQL directly. Everything it needs from the
//! database goes through [`Persistence`], which has an in-process backend
//! for tests and embedding and a PostgreSQL backend for production.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::error::Result;
use crate::resource::MetadataField;
use crate::spec::{ContainerMetadata, ContainerOwner};

/// Worker lifecycle states. Only `running` workers receive new work.
pub mod worker_state {
    /// Heartbeating and accepting work.
    pub const RUNNING: &str = "running";
    /// Missed heartbeats.
    pub const STALLED: &str = "stalled";
    /// Draining before a restart.
    pub const LANDING: &str = "landing";
    /// Drained.
    pub const LANDED: &str = "landed";
    /// Draining before removal.
    pub const RETIRING: &str = "retiring";
}

/// Container and volume record states.
pub mod record_state {
    /// Record exists, runtime object may not.
    pub const CREATING: &str = "creating";
    /// Runtime object exists.
    pub const CREATED: &str = "created";
    /// Creation failed; never retried.
    pub const FAILED: &str = "failed";
}

/// Image shipped with a worker for a base resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    /// Base type name, e.g. `git`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Path of the image on the worker.
    pub image: String,
    /// Resource type version.
    #[serde(default)]
    pub version: String,
    /// Whether containers for this type run privileged.
    #[serde(default)]
    pub privileged: bool,
}

/// Worker record as reported by the worker's heartbeat.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerRecord {
    /// Unique worker name.
    pub name: String,
    /// Lifecycle state, see [`worker_state`].
    pub state: String,
    /// Platform, e.g. `linux`.
    pub platform: String,
    /// Tags the worker accepts.
    pub tags: Vec<String>,
    /// Owning team, zero for shared workers.
    pub team_id: i32,
    /// Base resource types the worker provides.
    pub resource_types: Json<Vec<WorkerResourceType>>,
    /// Containers reported by the last heartbeat.
    pub active_containers: i32,
    /// Volumes reported by the last heartbeat.
    pub active_volumes: i32,
    /// Task containers admitted by placement.
    pub active_tasks: i32,
    /// Ephemeral workers disappear instead of stalling.
    pub ephemeral: bool,
    /// Advertised worker version.
    pub version: Option<String>,
    /// Host path holding CA certificates.
    pub certs_path: Option<String>,
    /// When the worker started.
    pub start_time: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    /// Running shared worker with no tags and no resource types.
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: worker_state::RUNNING.to_string(),
            platform: platform.into(),
            tags: Vec::new(),
            team_id: 0,
            resource_types: Json(Vec::new()),
            active_containers: 0,
            active_volumes: 0,
            active_tasks: 0,
            ephemeral: false,
            version: None,
            certs_path: None,
            start_time: Some(Utc::now()),
        }
    }
}

/// Container record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContainerRecord {
    /// Runtime handle.
    pub handle: String,
    /// Worker hosting the container.
    pub worker_name: String,
    /// [`ContainerOwner::key`] of the owner.
    pub owner_key: String,
    /// Owning team.
    pub team_id: i32,
    /// See [`record_state`].
    pub state: String,
    /// Step metadata.
    pub metadata: Json<ContainerMetadata>,
    /// When the record was inserted.
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// True once the runtime container exists.
    pub fn is_created(&self) -> bool {
        self.state == record_state::CREATED
    }
}

/// Volume record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VolumeRecord {
    /// Volume store handle.
    pub handle: String,
    /// Worker hosting the volume.
    pub worker_name: String,
    /// Owning team.
    pub team_id: i32,
    /// See [`record_state`].
    pub state: String,
    /// Container the volume is mounted into.
    pub container_handle: Option<String>,
    /// Mount path inside that container.
    pub mount_path: Option<String>,
    /// Copy-on-write parent.
    pub parent_handle: Option<String>,
    /// Resource cache this volume holds.
    pub resource_cache_id: Option<i64>,
    /// Task cache key this volume holds.
    pub task_cache: Option<String>,
    /// Artifact name this volume was registered under.
    pub artifact_name: Option<String>,
    /// When the record was inserted.
    pub created_at: DateTime<Utc>,
}

impl VolumeRecord {
    /// True once the store volume exists.
    pub fn is_created(&self) -> bool {
        self.state == record_state::CREATED
    }
}

/// Parameters for a new volume record.
#[derive(Debug, Clone, Default)]
pub struct NewVolume {
    /// Worker hosting the volume.
    pub worker_name: String,
    /// Owning team.
    pub team_id: i32,
    /// Container the volume is mounted into.
    pub container_handle: Option<String>,
    /// Mount path inside that container.
    pub mount_path: Option<String>,
    /// Copy-on-write parent.
    pub parent_handle: Option<String>,
}

/// Identity of a task cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskCacheKey {
    /// Job the task belongs to.
    pub job_id: i32,
    /// Step name.
    pub step_name: String,
    /// Cache path as declared.
    pub path: String,
}

impl TaskCacheKey {
    /// Flat key stored with the volume.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.job_id, self.step_name, self.path)
    }
}

/// Persistence interface used by workers, the pool and the fetcher.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // Workers

    async fn save_worker(&self, worker: &WorkerRecord) -> Result<()>;

    async fn find_worker(&self, name: &str) -> Result<Option<WorkerRecord>>;

    /// Workers in the `running` state.
    async fn running_workers(&self) -> Result<Vec<WorkerRecord>>;

    /// Atomically increments and returns the worker's active task count.
    async fn increase_active_tasks(&self, worker: &str) -> Result<i32>;

    /// Atomically decrements (never below zero) and returns the count.
    async fn decrease_active_tasks(&self, worker: &str) -> Result<i32>;

    /// Live containers on the worker that belong to a build.
    async fn count_build_containers(&self, worker: &str) -> Result<i64>;

    // Containers

    /// Creating or created container for `owner` on `worker`.
    async fn find_container(
        &self,
        worker: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>>;

    /// Workers holding a creating or created container for `owner`.
    async fn find_workers_with_container(&self, owner: &ContainerOwner) -> Result<Vec<String>>;

    /// Inserts a record in the `creating` state, or returns the live record
    /// `owner` already holds on `worker`. At most one creating or created
    /// record exists per (worker, owner).
    async fn create_container(
        &self,
        worker: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> Result<ContainerRecord>;

    async fn mark_container_created(&self, handle: &str) -> Result<ContainerRecord>;

    async fn mark_container_failed(&self, handle: &str) -> Result<()>;

    async fn find_created_container(&self, handle: &str) -> Result<Option<ContainerRecord>>;

    // Volumes

    /// Inserts a record in the `creating` state. For a container mount,
    /// returns the live record already at that mount path instead.
    async fn create_volume(&self, volume: &NewVolume) -> Result<VolumeRecord>;

    /// Created volume by handle.
    async fn find_volume(&self, handle: &str) -> Result<Option<VolumeRecord>>;

    /// Creating or created volume mounted at `mount_path` in `container`.
    async fn find_container_volume(
        &self,
        worker: &str,
        container: &str,
        mount_path: &str,
    ) -> Result<Option<VolumeRecord>>;

    async fn mark_volume_created(&self, handle: &str) -> Result<VolumeRecord>;

    async fn mark_volume_failed(&self, handle: &str) -> Result<()>;

    async fn find_volumes_for_container(&self, container: &str) -> Result<Vec<VolumeRecord>>;

    // Caches

    /// Initialized resource cache volume on `worker`.
    async fn find_resource_cache_volume(
        &self,
        worker: &str,
        resource_cache_id: i64,
    ) -> Result<Option<VolumeRecord>>;

    /// Marks the volume as holding the cache. Returns false when another
    /// volume on the same worker already does.
    async fn initialize_resource_cache(&self, handle: &str, resource_cache_id: i64)
    -> Result<bool>;

    async fn resource_cache_metadata(
        &self,
        resource_cache_id: i64,
    ) -> Result<Option<Vec<MetadataField>>>;

    async fn update_resource_cache_metadata(
        &self,
        resource_cache_id: i64,
        metadata: &[MetadataField],
    ) -> Result<()>;

    /// Initialized task cache volume on `worker`.
    async fn find_task_cache_volume(
        &self,
        worker: &str,
        key: &TaskCacheKey,
    ) -> Result<Option<VolumeRecord>>;

    async fn initialize_task_cache(&self, handle: &str, key: &TaskCacheKey) -> Result<()>;

    async fn initialize_artifact(&self, handle: &str, name: &str) -> Result<()>;
}
