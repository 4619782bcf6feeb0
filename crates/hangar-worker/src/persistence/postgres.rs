// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence backend.
//!
//! Every operation is a free function over a [`PgPool`] so callers holding
//! only a pool can use them; [`PostgresPersistence`] delegates to them.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::{
    ContainerRecord, NewVolume, Persistence, TaskCacheKey, VolumeRecord, WorkerRecord,
    record_state, worker_state,
};
use crate::error::{Error, Result};
use crate::resource::MetadataField;
use crate::spec::{ContainerMetadata, ContainerOwner};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const WORKER_COLUMNS: &str = "name, state, platform, tags, team_id, resource_types, \
     active_containers, active_volumes, active_tasks, ephemeral, version, certs_path, start_time";

const CONTAINER_COLUMNS: &str =
    "handle, worker_name, owner_key, team_id, state, metadata, created_at";

const VOLUME_COLUMNS: &str = "handle, worker_name, team_id, state, container_handle, mount_path, \
     parent_handle, resource_cache_id, task_cache, artifact_name, created_at";

// ============================================================================
// Worker Operations
// ============================================================================

/// Insert or replace a worker record.
pub async fn save_worker(pool: &PgPool, worker: &WorkerRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workers (name, state, platform, tags, team_id, resource_types,
                             active_containers, active_volumes, active_tasks, ephemeral,
                             version, certs_path, start_time)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (name) DO UPDATE SET
            state = EXCLUDED.state,
            platform = EXCLUDED.platform,
            tags = EXCLUDED.tags,
            team_id = EXCLUDED.team_id,
            resource_types = EXCLUDED.resource_types,
            active_containers = EXCLUDED.active_containers,
            active_volumes = EXCLUDED.active_volumes,
            ephemeral = EXCLUDED.ephemeral,
            version = EXCLUDED.version,
            certs_path = EXCLUDED.certs_path,
            start_time = EXCLUDED.start_time
        "#,
    )
    .bind(&worker.name)
    .bind(&worker.state)
    .bind(&worker.platform)
    .bind(&worker.tags)
    .bind(worker.team_id)
    .bind(&worker.resource_types)
    .bind(worker.active_containers)
    .bind(worker.active_volumes)
    .bind(worker.active_tasks)
    .bind(worker.ephemeral)
    .bind(&worker.version)
    .bind(&worker.certs_path)
    .bind(worker.start_time)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a worker by name.
pub async fn find_worker(pool: &PgPool, name: &str) -> Result<Option<WorkerRecord>> {
    let record = sqlx::query_as::<_, WorkerRecord>(&format!(
        "SELECT {WORKER_COLUMNS} FROM workers WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Workers in the running state, ordered by name.
pub async fn running_workers(pool: &PgPool) -> Result<Vec<WorkerRecord>> {
    let records = sqlx::query_as::<_, WorkerRecord>(&format!(
        "SELECT {WORKER_COLUMNS} FROM workers WHERE state = $1 ORDER BY name"
    ))
    .bind(worker_state::RUNNING)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Increment the worker's active task count, returning the new value.
pub async fn increase_active_tasks(pool: &PgPool, worker: &str) -> Result<i32> {
    let count: Option<i32> = sqlx::query_scalar(
        r#"
        UPDATE workers SET active_tasks = active_tasks + 1
        WHERE name = $1
        RETURNING active_tasks
        "#,
    )
    .bind(worker)
    .fetch_optional(pool)
    .await?;

    count.ok_or_else(|| Error::WorkerNotFound(worker.to_string()))
}

/// Decrement the worker's active task count, never below zero.
pub async fn decrease_active_tasks(pool: &PgPool, worker: &str) -> Result<i32> {
    let count: Option<i32> = sqlx::query_scalar(
        r#"
        UPDATE workers SET active_tasks = GREATEST(active_tasks - 1, 0)
        WHERE name = $1
        RETURNING active_tasks
        "#,
    )
    .bind(worker)
    .fetch_optional(pool)
    .await?;

    count.ok_or_else(|| Error::WorkerNotFound(worker.to_string()))
}

/// Live containers on the worker that belong to a build.
pub async fn count_build_containers(pool: &PgPool, worker: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM containers
        WHERE worker_name = $1
          AND state IN ($2, $3)
          AND metadata->>'build_id' IS NOT NULL
        "#,
    )
    .bind(worker)
    .bind(record_state::CREATING)
    .bind(record_state::CREATED)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

// ============================================================================
// Container Operations
// ============================================================================

/// Live container for `owner` on `worker`.
pub async fn find_container(
    pool: &PgPool,
    worker: &str,
    owner: &ContainerOwner,
) -> Result<Option<ContainerRecord>> {
    let record = sqlx::query_as::<_, ContainerRecord>(&format!(
        r#"
        SELECT {CONTAINER_COLUMNS} FROM containers
        WHERE worker_name = $1 AND owner_key = $2 AND team_id = $3 AND state IN ($4, $5)
        ORDER BY created_at
        LIMIT 1
        "#
    ))
    .bind(worker)
    .bind(owner.key())
    .bind(owner.team_id())
    .bind(record_state::CREATING)
    .bind(record_state::CREATED)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Names of workers holding a live container for `owner`.
pub async fn find_workers_with_container(
    pool: &PgPool,
    owner: &ContainerOwner,
) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT worker_name FROM containers
        WHERE owner_key = $1 AND team_id = $2 AND state IN ($3, $4)
        ORDER BY worker_name
        "#,
    )
    .bind(owner.key())
    .bind(owner.team_id())
    .bind(record_state::CREATING)
    .bind(record_state::CREATED)
    .fetch_all(pool)
    .await?;

    Ok(names)
}

/// Insert a container record in the creating state, or return the live
/// record `owner` already holds on `worker`.
///
/// `idx_containers_live_owner` makes the insert a no-op when a live record
/// exists; the loop covers that record failing before it is re-read.
pub async fn create_container(
    pool: &PgPool,
    worker: &str,
    owner: &ContainerOwner,
    metadata: &ContainerMetadata,
) -> Result<ContainerRecord> {
    loop {
        let inserted = sqlx::query_as::<_, ContainerRecord>(&format!(
            r#"
            INSERT INTO containers (handle, worker_name, owner_key, team_id, state, metadata, created_at)
            SELECT $1, name, $3, $4, $5, $6, NOW() FROM workers WHERE name = $2
            ON CONFLICT (worker_name, owner_key, team_id)
                WHERE state IN ('creating', 'created')
                DO NOTHING
            RETURNING {CONTAINER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(worker)
        .bind(owner.key())
        .bind(owner.team_id())
        .bind(record_state::CREATING)
        .bind(Json(metadata))
        .fetch_optional(pool)
        .await?;

        if let Some(record) = inserted {
            return Ok(record);
        }
        if let Some(existing) = find_container(pool, worker, owner).await? {
            return Ok(existing);
        }
        if find_worker(pool, worker).await?.is_none() {
            return Err(Error::WorkerNotFound(worker.to_string()));
        }
    }
}

/// Move a live container record to created.
pub async fn mark_container_created(pool: &PgPool, handle: &str) -> Result<ContainerRecord> {
    let record = sqlx::query_as::<_, ContainerRecord>(&format!(
        r#"
        UPDATE containers SET state = $2
        WHERE handle = $1 AND state IN ($2, $3)
        RETURNING {CONTAINER_COLUMNS}
        "#
    ))
    .bind(handle)
    .bind(record_state::CREATED)
    .bind(record_state::CREATING)
    .fetch_optional(pool)
    .await?;

    record.ok_or_else(|| Error::Transport(format!("container {handle} is not creating")))
}

/// Mark a container record failed.
pub async fn mark_container_failed(pool: &PgPool, handle: &str) -> Result<()> {
    sqlx::query("UPDATE containers SET state = $2 WHERE handle = $1")
        .bind(handle)
        .bind(record_state::FAILED)
        .execute(pool)
        .await?;

    Ok(())
}

/// Created container by handle.
pub async fn find_created_container(
    pool: &PgPool,
    handle: &str,
) -> Result<Option<ContainerRecord>> {
    let record = sqlx::query_as::<_, ContainerRecord>(&format!(
        "SELECT {CONTAINER_COLUMNS} FROM containers WHERE handle = $1 AND state = $2"
    ))
    .bind(handle)
    .bind(record_state::CREATED)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

// ============================================================================
// Volume Operations
// ============================================================================

/// Insert a volume record in the creating state. A container mount that
/// already has a live record returns that record instead.
pub async fn create_volume(pool: &PgPool, volume: &NewVolume) -> Result<VolumeRecord> {
    loop {
        let inserted = sqlx::query_as::<_, VolumeRecord>(&format!(
            r#"
            INSERT INTO volumes (handle, worker_name, team_id, state, container_handle,
                                 mount_path, parent_handle, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (container_handle, mount_path)
                WHERE container_handle IS NOT NULL
                  AND mount_path IS NOT NULL
                  AND state IN ('creating', 'created')
                DO NOTHING
            RETURNING {VOLUME_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&volume.worker_name)
        .bind(volume.team_id)
        .bind(record_state::CREATING)
        .bind(&volume.container_handle)
        .bind(&volume.mount_path)
        .bind(&volume.parent_handle)
        .fetch_optional(pool)
        .await?;

        if let Some(record) = inserted {
            return Ok(record);
        }
        if let (Some(container), Some(mount_path)) = (&volume.container_handle, &volume.mount_path)
        {
            let existing =
                find_container_volume(pool, &volume.worker_name, container, mount_path).await?;
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }
    }
}

/// Created volume by handle.
pub async fn find_volume(pool: &PgPool, handle: &str) -> Result<Option<VolumeRecord>> {
    let record = sqlx::query_as::<_, VolumeRecord>(&format!(
        "SELECT {VOLUME_COLUMNS} FROM volumes WHERE handle = $1 AND state = $2"
    ))
    .bind(handle)
    .bind(record_state::CREATED)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Live volume mounted at `mount_path` in `container`.
pub async fn find_container_volume(
    pool: &PgPool,
    worker: &str,
    container: &str,
    mount_path: &str,
) -> Result<Option<VolumeRecord>> {
    let record = sqlx::query_as::<_, VolumeRecord>(&format!(
        r#"
        SELECT {VOLUME_COLUMNS} FROM volumes
        WHERE worker_name = $1 AND container_handle = $2 AND mount_path = $3
          AND state IN ($4, $5)
        ORDER BY created_at
        LIMIT 1
        "#
    ))
    .bind(worker)
    .bind(container)
    .bind(mount_path)
    .bind(record_state::CREATING)
    .bind(record_state::CREATED)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Move a live volume record to created.
pub async fn mark_volume_created(pool: &PgPool, handle: &str) -> Result<VolumeRecord> {
    let record = sqlx::query_as::<_, VolumeRecord>(&format!(
        r#"
        UPDATE volumes SET state = $2
        WHERE handle = $1 AND state IN ($2, $3)
        RETURNING {VOLUME_COLUMNS}
        "#
    ))
    .bind(handle)
    .bind(record_state::CREATED)
    .bind(record_state::CREATING)
    .fetch_optional(pool)
    .await?;

    record.ok_or_else(|| Error::VolumeNotFound(handle.to_string()))
}

/// Mark a volume record failed.
pub async fn mark_volume_failed(pool: &PgPool, handle: &str) -> Result<()> {
    sqlx::query("UPDATE volumes SET state = $2 WHERE handle = $1")
        .bind(handle)
        .bind(record_state::FAILED)
        .execute(pool)
        .await?;

    Ok(())
}

/// Created volumes of a container, ordered by mount path.
pub async fn find_volumes_for_container(
    pool: &PgPool,
    container: &str,
) -> Result<Vec<VolumeRecord>> {
    let records = sqlx::query_as::<_, VolumeRecord>(&format!(
        r#"
        SELECT {VOLUME_COLUMNS} FROM volumes
        WHERE container_handle = $1 AND state = $2
        ORDER BY mount_path
        "#
    ))
    .bind(container)
    .bind(record_state::CREATED)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Cache Operations
// ============================================================================

/// Created volume holding the resource cache on `worker`.
pub async fn find_resource_cache_volume(
    pool: &PgPool,
    worker: &str,
    resource_cache_id: i64,
) -> Result<Option<VolumeRecord>> {
    let record = sqlx::query_as::<_, VolumeRecord>(&format!(
        r#"
        SELECT {VOLUME_COLUMNS} FROM volumes
        WHERE worker_name = $1 AND resource_cache_id = $2 AND state = $3
        "#
    ))
    .bind(worker)
    .bind(resource_cache_id)
    .bind(record_state::CREATED)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Claim the resource cache for a volume. False when another volume on the
/// same worker holds it.
pub async fn initialize_resource_cache(
    pool: &PgPool,
    handle: &str,
    resource_cache_id: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE volumes v SET resource_cache_id = $2
        WHERE v.handle = $1
          AND NOT EXISTS (
              SELECT 1 FROM volumes o
              WHERE o.worker_name = v.worker_name
                AND o.resource_cache_id = $2
                AND o.handle <> v.handle
          )
        "#,
    )
    .bind(handle)
    .bind(resource_cache_id)
    .execute(pool)
    .await;

    match result {
        Ok(done) if done.rows_affected() == 1 => Ok(true),
        Ok(_) => {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM volumes WHERE handle = $1)")
                    .bind(handle)
                    .fetch_one(pool)
                    .await?;
            if exists {
                Ok(false)
            } else {
                Err(Error::VolumeNotFound(handle.to_string()))
            }
        }
        // Lost a race against a concurrent claim on the unique index.
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Metadata stored with a resource cache.
pub async fn resource_cache_metadata(
    pool: &PgPool,
    resource_cache_id: i64,
) -> Result<Option<Vec<MetadataField>>> {
    let metadata: Option<Option<Json<Vec<MetadataField>>>> =
        sqlx::query_scalar("SELECT metadata FROM resource_caches WHERE id = $1")
            .bind(resource_cache_id)
            .fetch_optional(pool)
            .await?;

    Ok(metadata.flatten().map(|m| m.0))
}

/// Replace the metadata stored with a resource cache.
pub async fn update_resource_cache_metadata(
    pool: &PgPool,
    resource_cache_id: i64,
    metadata: &[MetadataField],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO resource_caches (id, metadata, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (id) DO UPDATE SET metadata = EXCLUDED.metadata, updated_at = NOW()
        "#,
    )
    .bind(resource_cache_id)
    .bind(Json(metadata))
    .execute(pool)
    .await?;

    Ok(())
}

/// Created volume holding the task cache on `worker`.
pub async fn find_task_cache_volume(
    pool: &PgPool,
    worker: &str,
    key: &TaskCacheKey,
) -> Result<Option<VolumeRecord>> {
    let record = sqlx::query_as::<_, VolumeRecord>(&format!(
        r#"
        SELECT {VOLUME_COLUMNS} FROM volumes
        WHERE worker_name = $1 AND task_cache = $2 AND state = $3
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(worker)
    .bind(key.key())
    .bind(record_state::CREATED)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Make the volume the worker's current holder of the task cache.
pub async fn initialize_task_cache(pool: &PgPool, handle: &str, key: &TaskCacheKey) -> Result<()> {
    let mut tx = pool.begin().await?;

    let worker: Option<String> =
        sqlx::query_scalar("SELECT worker_name FROM volumes WHERE handle = $1 FOR UPDATE")
            .bind(handle)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(worker) = worker else {
        return Err(Error::VolumeNotFound(handle.to_string()));
    };

    sqlx::query("UPDATE volumes SET task_cache = NULL WHERE worker_name = $1 AND task_cache = $2")
        .bind(&worker)
        .bind(key.key())
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE volumes SET task_cache = $2 WHERE handle = $1")
        .bind(handle)
        .bind(key.key())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Record the artifact name a volume was registered under.
pub async fn initialize_artifact(pool: &PgPool, handle: &str, name: &str) -> Result<()> {
    let result = sqlx::query("UPDATE volumes SET artifact_name = $2 WHERE handle = $1")
        .bind(handle)
        .bind(name)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::VolumeNotFound(handle.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn save_worker(&self, worker: &WorkerRecord) -> Result<()> {
        save_worker(&self.pool, worker).await
    }

    async fn find_worker(&self, name: &str) -> Result<Option<WorkerRecord>> {
        find_worker(&self.pool, name).await
    }

    async fn running_workers(&self) -> Result<Vec<WorkerRecord>> {
        running_workers(&self.pool).await
    }

    async fn increase_active_tasks(&self, worker: &str) -> Result<i32> {
        increase_active_tasks(&self.pool, worker).await
    }

    async fn decrease_active_tasks(&self, worker: &str) -> Result<i32> {
        decrease_active_tasks(&self.pool, worker).await
    }

    async fn count_build_containers(&self, worker: &str) -> Result<i64> {
        count_build_containers(&self.pool, worker).await
    }

    async fn find_container(
        &self,
        worker: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>> {
        find_container(&self.pool, worker, owner).await
    }

    async fn find_workers_with_container(&self, owner: &ContainerOwner) -> Result<Vec<String>> {
        find_workers_with_container(&self.pool, owner).await
    }

    async fn create_container(
        &self,
        worker: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> Result<ContainerRecord> {
        create_container(&self.pool, worker, owner, metadata).await
    }

    async fn mark_container_created(&self, handle: &str) -> Result<ContainerRecord> {
        mark_container_created(&self.pool, handle).await
    }

    async fn mark_container_failed(&self, handle: &str) -> Result<()> {
        mark_container_failed(&self.pool, handle).await
    }

    async fn find_created_container(&self, handle: &str) -> Result<Option<ContainerRecord>> {
        find_created_container(&self.pool, handle).await
    }

    async fn create_volume(&self, volume: &NewVolume) -> Result<VolumeRecord> {
        create_volume(&self.pool, volume).await
    }

    async fn find_volume(&self, handle: &str) -> Result<Option<VolumeRecord>> {
        find_volume(&self.pool, handle).await
    }

    async fn find_container_volume(
        &self,
        worker: &str,
        container: &str,
        mount_path: &str,
    ) -> Result<Option<VolumeRecord>> {
        find_container_volume(&self.pool, worker, container, mount_path).await
    }

    async fn mark_volume_created(&self, handle: &str) -> Result<VolumeRecord> {
        mark_volume_created(&self.pool, handle).await
    }

    async fn mark_volume_failed(&self, handle: &str) -> Result<()> {
        mark_volume_failed(&self.pool, handle).await
    }

    async fn find_volumes_for_container(&self, container: &str) -> Result<Vec<VolumeRecord>> {
        find_volumes_for_container(&self.pool, container).await
    }

    async fn find_resource_cache_volume(
        &self,
        worker: &str,
        resource_cache_id: i64,
    ) -> Result<Option<VolumeRecord>> {
        find_resource_cache_volume(&self.pool, worker, resource_cache_id).await
    }

    async fn initialize_resource_cache(
        &self,
        handle: &str,
        resource_cache_id: i64,
    ) -> Result<bool> {
        initialize_resource_cache(&self.pool, handle, resource_cache_id).await
    }

    async fn resource_cache_metadata(
        &self,
        resource_cache_id: i64,
    ) -> Result<Option<Vec<MetadataField>>> {
        resource_cache_metadata(&self.pool, resource_cache_id).await
    }

    async fn update_resource_cache_metadata(
        &self,
        resource_cache_id: i64,
        metadata: &[MetadataField],
    ) -> Result<()> {
        update_resource_cache_metadata(&self.pool, resource_cache_id, metadata).await
    }

    async fn find_task_cache_volume(
        &self,
        worker: &str,
        key: &TaskCacheKey,
    ) -> Result<Option<VolumeRecord>> {
        find_task_cache_volume(&self.pool, worker, key).await
    }

    async fn initialize_task_cache(&self, handle: &str, key: &TaskCacheKey) -> Result<()> {
        initialize_task_cache(&self.pool, handle, key).await
    }

    async fn initialize_artifact(&self, handle: &str, name: &str) -> Result<()> {
        initialize_artifact(&self.pool, handle, name).await
    }
}
