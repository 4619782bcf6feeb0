// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process persistence backend.
//!
//! Keeps every record in a mutex-guarded map. Suitable for tests and for
//! embedding the scheduler without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    ContainerRecord, NewVolume, Persistence, TaskCacheKey, VolumeRecord, WorkerRecord,
    record_state, worker_state,
};
use crate::error::{Error, Result};
use crate::resource::MetadataField;
use crate::spec::{ContainerMetadata, ContainerOwner};

#[derive(Default)]
struct State {
    workers: HashMap<String, WorkerRecord>,
    containers: HashMap<String, ContainerRecord>,
    volumes: HashMap<String, VolumeRecord>,
    cache_metadata: HashMap<i64, Vec<MetadataField>>,
}

/// Memory-backed [`Persistence`].
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<State>>,
    interleave: bool,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that yields to the scheduler before every
    /// call, so concurrent callers interleave the way they do against a
    /// database server.
    pub fn interleaved() -> Self {
        Self {
            interleave: true,
            ..Self::default()
        }
    }

    async fn state(&self) -> MutexGuard<'_, State> {
        if self.interleave {
            tokio::task::yield_now().await;
        }
        self.state.lock().await
    }

    /// Every container record, in any state.
    pub async fn containers(&self) -> Vec<ContainerRecord> {
        self.state().await.containers.values().cloned().collect()
    }

    /// Every volume record, in any state.
    pub async fn volumes(&self) -> Vec<VolumeRecord> {
        self.state().await.volumes.values().cloned().collect()
    }

    /// Any container record by handle.
    pub async fn container(&self, handle: &str) -> Option<ContainerRecord> {
        self.state().await.containers.get(handle).cloned()
    }

    /// Any volume record by handle.
    pub async fn volume(&self, handle: &str) -> Option<VolumeRecord> {
        self.state().await.volumes.get(handle).cloned()
    }

    /// Overwrites a worker's heartbeat counters.
    pub async fn set_worker_counts(&self, worker: &str, containers: i32, volumes: i32) {
        if let Some(w) = self.state().await.workers.get_mut(worker) {
            w.active_containers = containers;
            w.active_volumes = volumes;
        }
    }

    /// Moves a worker to another lifecycle state.
    pub async fn set_worker_state(&self, worker: &str, state: &str) {
        if let Some(w) = self.state().await.workers.get_mut(worker) {
            w.state = state.to_string();
        }
    }
}

fn is_live(state: &str) -> bool {
    state == record_state::CREATING || state == record_state::CREATED
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_worker(&self, worker: &WorkerRecord) -> Result<()> {
        self.state()
            .await
            .workers
            .insert(worker.name.clone(), worker.clone());
        Ok(())
    }

    async fn find_worker(&self, name: &str) -> Result<Option<WorkerRecord>> {
        Ok(self.state().await.workers.get(name).cloned())
    }

    async fn running_workers(&self) -> Result<Vec<WorkerRecord>> {
        let state = self.state().await;
        let mut workers: Vec<_> = state
            .workers
            .values()
            .filter(|w| w.state == worker_state::RUNNING)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn increase_active_tasks(&self, worker: &str) -> Result<i32> {
        let mut state = self.state().await;
        let w = state
            .workers
            .get_mut(worker)
            .ok_or_else(|| Error::WorkerNotFound(worker.to_string()))?;
        w.active_tasks += 1;
        Ok(w.active_tasks)
    }

    async fn decrease_active_tasks(&self, worker: &str) -> Result<i32> {
        let mut state = self.state().await;
        let w = state
            .workers
            .get_mut(worker)
            .ok_or_else(|| Error::WorkerNotFound(worker.to_string()))?;
        if w.active_tasks > 0 {
            w.active_tasks -= 1;
        }
        Ok(w.active_tasks)
    }

    async fn count_build_containers(&self, worker: &str) -> Result<i64> {
        let state = self.state().await;
        let count = state
            .containers
            .values()
            .filter(|c| {
                c.worker_name == worker && is_live(&c.state) && c.metadata.0.build_id.is_some()
            })
            .count();
        Ok(count as i64)
    }

    async fn find_container(
        &self,
        worker: &str,
        owner: &ContainerOwner,
    ) -> Result<Option<ContainerRecord>> {
        let key = owner.key();
        let state = self.state().await;
        Ok(state
            .containers
            .values()
            .find(|c| {
                c.worker_name == worker
                    && c.owner_key == key
                    && c.team_id == owner.team_id()
                    && is_live(&c.state)
            })
            .cloned())
    }

    async fn find_workers_with_container(&self, owner: &ContainerOwner) -> Result<Vec<String>> {
        let key = owner.key();
        let state = self.state().await;
        let mut workers: Vec<String> = state
            .containers
            .values()
            .filter(|c| c.owner_key == key && c.team_id == owner.team_id() && is_live(&c.state))
            .map(|c| c.worker_name.clone())
            .collect();
        workers.sort();
        workers.dedup();
        Ok(workers)
    }

    async fn create_container(
        &self,
        worker: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> Result<ContainerRecord> {
        let key = owner.key();
        let mut state = self.state().await;
        if !state.workers.contains_key(worker) {
            return Err(Error::WorkerNotFound(worker.to_string()));
        }
        let live = state.containers.values().find(|c| {
            c.worker_name == worker
                && c.owner_key == key
                && c.team_id == owner.team_id()
                && is_live(&c.state)
        });
        if let Some(existing) = live {
            return Ok(existing.clone());
        }
        let record = ContainerRecord {
            handle: Uuid::new_v4().to_string(),
            worker_name: worker.to_string(),
            owner_key: key,
            team_id: owner.team_id(),
            state: record_state::CREATING.to_string(),
            metadata: Json(metadata.clone()),
            created_at: Utc::now(),
        };
        state
            .containers
            .insert(record.handle.clone(), record.clone());
        Ok(record)
    }

    async fn mark_container_created(&self, handle: &str) -> Result<ContainerRecord> {
        let mut state = self.state().await;
        let record = state
            .containers
            .get_mut(handle)
            .filter(|c| is_live(&c.state))
            .ok_or_else(|| Error::Transport(format!("container {handle} is not creating")))?;
        record.state = record_state::CREATED.to_string();
        Ok(record.clone())
    }

    async fn mark_container_failed(&self, handle: &str) -> Result<()> {
        let mut state = self.state().await;
        if let Some(record) = state.containers.get_mut(handle) {
            record.state = record_state::FAILED.to_string();
        }
        Ok(())
    }

    async fn find_created_container(&self, handle: &str) -> Result<Option<ContainerRecord>> {
        let state = self.state().await;
        Ok(state
            .containers
            .get(handle)
            .filter(|c| c.is_created())
            .cloned())
    }

    async fn create_volume(&self, volume: &NewVolume) -> Result<VolumeRecord> {
        let mut state = self.state().await;
        if let (Some(container), Some(mount_path)) = (&volume.container_handle, &volume.mount_path) {
            let live = state.volumes.values().find(|v| {
                v.container_handle.as_ref() == Some(container)
                    && v.mount_path.as_ref() == Some(mount_path)
                    && is_live(&v.state)
            });
            if let Some(existing) = live {
                return Ok(existing.clone());
            }
        }
        let record = VolumeRecord {
            handle: Uuid::new_v4().to_string(),
            worker_name: volume.worker_name.clone(),
            team_id: volume.team_id,
            state: record_state::CREATING.to_string(),
            container_handle: volume.container_handle.clone(),
            mount_path: volume.mount_path.clone(),
            parent_handle: volume.parent_handle.clone(),
            resource_cache_id: None,
            task_cache: None,
            artifact_name: None,
            created_at: Utc::now(),
        };
        state.volumes.insert(record.handle.clone(), record.clone());
        Ok(record)
    }

    async fn find_volume(&self, handle: &str) -> Result<Option<VolumeRecord>> {
        let state = self.state().await;
        Ok(state.volumes.get(handle).filter(|v| v.is_created()).cloned())
    }

    async fn find_container_volume(
        &self,
        worker: &str,
        container: &str,
        mount_path: &str,
    ) -> Result<Option<VolumeRecord>> {
        let state = self.state().await;
        Ok(state
            .volumes
            .values()
            .find(|v| {
                v.worker_name == worker
                    && v.container_handle.as_deref() == Some(container)
                    && v.mount_path.as_deref() == Some(mount_path)
                    && is_live(&v.state)
            })
            .cloned())
    }

    async fn mark_volume_created(&self, handle: &str) -> Result<VolumeRecord> {
        let mut state = self.state().await;
        let record = state
            .volumes
            .get_mut(handle)
            .filter(|v| is_live(&v.state))
            .ok_or_else(|| Error::VolumeNotFound(handle.to_string()))?;
        record.state = record_state::CREATED.to_string();
        Ok(record.clone())
    }

    async fn mark_volume_failed(&self, handle: &str) -> Result<()> {
        let mut state = self.state().await;
        if let Some(record) = state.volumes.get_mut(handle) {
            record.state = record_state::FAILED.to_string();
        }
        Ok(())
    }

    async fn find_volumes_for_container(&self, container: &str) -> Result<Vec<VolumeRecord>> {
        let state = self.state().await;
        let mut volumes: Vec<_> = state
            .volumes
            .values()
            .filter(|v| v.container_handle.as_deref() == Some(container) && v.is_created())
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
        Ok(volumes)
    }

    async fn find_resource_cache_volume(
        &self,
        worker: &str,
        resource_cache_id: i64,
    ) -> Result<Option<VolumeRecord>> {
        let state = self.state().await;
        Ok(state
            .volumes
            .values()
            .find(|v| {
                v.worker_name == worker
                    && v.resource_cache_id == Some(resource_cache_id)
                    && v.is_created()
            })
            .cloned())
    }

    async fn initialize_resource_cache(
        &self,
        handle: &str,
        resource_cache_id: i64,
    ) -> Result<bool> {
        let mut state = self.state().await;
        let worker = state
            .volumes
            .get(handle)
            .map(|v| v.worker_name.clone())
            .ok_or_else(|| Error::VolumeNotFound(handle.to_string()))?;
        let taken = state.volumes.values().any(|v| {
            v.handle != handle
                && v.worker_name == worker
                && v.resource_cache_id == Some(resource_cache_id)
                && v.is_created()
        });
        if taken {
            return Ok(false);
        }
        if let Some(v) = state.volumes.get_mut(handle) {
            v.resource_cache_id = Some(resource_cache_id);
        }
        Ok(true)
    }

    async fn resource_cache_metadata(
        &self,
        resource_cache_id: i64,
    ) -> Result<Option<Vec<MetadataField>>> {
        Ok(self
            .state()
            .await
            .cache_metadata
            .get(&resource_cache_id)
            .cloned())
    }

    async fn update_resource_cache_metadata(
        &self,
        resource_cache_id: i64,
        metadata: &[MetadataField],
    ) -> Result<()> {
        self.state()
            .await
            .cache_metadata
            .insert(resource_cache_id, metadata.to_vec());
        Ok(())
    }

    async fn find_task_cache_volume(
        &self,
        worker: &str,
        key: &TaskCacheKey,
    ) -> Result<Option<VolumeRecord>> {
        let key = key.key();
        let state = self.state().await;
        Ok(state
            .volumes
            .values()
            .find(|v| {
                v.worker_name == worker && v.task_cache.as_deref() == Some(key.as_str()) && v.is_created()
            })
            .cloned())
    }

    async fn initialize_task_cache(&self, handle: &str, key: &TaskCacheKey) -> Result<()> {
        let key = key.key();
        let mut state = self.state().await;
        let worker = state
            .volumes
            .get(handle)
            .map(|v| v.worker_name.clone())
            .ok_or_else(|| Error::VolumeNotFound(handle.to_string()))?;
        for v in state.volumes.values_mut() {
            if v.worker_name == worker && v.task_cache.as_deref() == Some(key.as_str()) {
                v.task_cache = None;
            }
        }
        if let Some(v) = state.volumes.get_mut(handle) {
            v.task_cache = Some(key);
        }
        Ok(())
    }

    async fn initialize_artifact(&self, handle: &str, name: &str) -> Result<()> {
        let mut state = self.state().await;
        let v = state
            .volumes
            .get_mut(handle)
            .ok_or_else(|| Error::VolumeNotFound(handle.to_string()))?;
        v.artifact_name = Some(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ContainerType;

    fn owner() -> ContainerOwner {
        ContainerOwner::BuildStep {
            build_id: 1,
            plan_id: "p".into(),
            team_id: 1,
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let db = MemoryPersistence::new();
        db.save_worker(&WorkerRecord::new("w1", "linux"))
            .await
            .unwrap();

        let metadata = ContainerMetadata {
            container_type: ContainerType::Task,
            build_id: Some(1),
            ..Default::default()
        };
        let created = db.create_container("w1", &owner(), &metadata).await.unwrap();
        assert_eq!(created.state, record_state::CREATING);

        let found = db.find_container("w1", &owner()).await.unwrap().unwrap();
        assert_eq!(found.handle, created.handle);
        assert_eq!(db.count_build_containers("w1").await.unwrap(), 1);
        assert!(db.find_created_container(&created.handle).await.unwrap().is_none());

        db.mark_container_created(&created.handle).await.unwrap();
        assert!(db.find_created_container(&created.handle).await.unwrap().is_some());

        db.mark_container_failed(&created.handle).await.unwrap();
        assert!(db.find_container("w1", &owner()).await.unwrap().is_none());
        assert!(db.find_workers_with_container(&owner()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_container_returns_live_record() {
        let db = MemoryPersistence::new();
        db.save_worker(&WorkerRecord::new("w1", "linux"))
            .await
            .unwrap();
        db.save_worker(&WorkerRecord::new("w2", "linux"))
            .await
            .unwrap();
        let metadata = ContainerMetadata::default();

        let first = db.create_container("w1", &owner(), &metadata).await.unwrap();
        let again = db.create_container("w1", &owner(), &metadata).await.unwrap();
        assert_eq!(again.handle, first.handle);

        let elsewhere = db.create_container("w2", &owner(), &metadata).await.unwrap();
        assert_ne!(elsewhere.handle, first.handle);

        db.mark_container_failed(&first.handle).await.unwrap();
        let replacement = db.create_container("w1", &owner(), &metadata).await.unwrap();
        assert_ne!(replacement.handle, first.handle);
        assert_eq!(replacement.state, record_state::CREATING);
    }

    #[tokio::test]
    async fn test_create_volume_returns_live_mount() {
        let db = MemoryPersistence::new();
        let mount = NewVolume {
            worker_name: "w1".into(),
            container_handle: Some("c1".into()),
            mount_path: Some("/scratch".into()),
            ..Default::default()
        };

        let first = db.create_volume(&mount).await.unwrap();
        assert_eq!(db.create_volume(&mount).await.unwrap().handle, first.handle);

        db.mark_volume_failed(&first.handle).await.unwrap();
        assert_ne!(db.create_volume(&mount).await.unwrap().handle, first.handle);

        let standalone = NewVolume {
            worker_name: "w1".into(),
            ..Default::default()
        };
        let a = db.create_volume(&standalone).await.unwrap();
        let b = db.create_volume(&standalone).await.unwrap();
        assert_ne!(a.handle, b.handle);
    }

    #[tokio::test]
    async fn test_active_tasks_never_negative() {
        let db = MemoryPersistence::new();
        db.save_worker(&WorkerRecord::new("w1", "linux"))
            .await
            .unwrap();
        assert_eq!(db.increase_active_tasks("w1").await.unwrap(), 1);
        assert_eq!(db.decrease_active_tasks("w1").await.unwrap(), 0);
        assert_eq!(db.decrease_active_tasks("w1").await.unwrap(), 0);
        assert!(db.increase_active_tasks("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_resource_cache_initialized_once_per_worker() {
        let db = MemoryPersistence::new();
        let new = NewVolume {
            worker_name: "w1".into(),
            ..Default::default()
        };
        let a = db.create_volume(&new).await.unwrap();
        let b = db.create_volume(&new).await.unwrap();
        db.mark_volume_created(&a.handle).await.unwrap();
        db.mark_volume_created(&b.handle).await.unwrap();

        assert!(db.initialize_resource_cache(&a.handle, 9).await.unwrap());
        assert!(db.initialize_resource_cache(&a.handle, 9).await.unwrap());
        assert!(!db.initialize_resource_cache(&b.handle, 9).await.unwrap());

        let found = db.find_resource_cache_volume("w1", 9).await.unwrap().unwrap();
        assert_eq!(found.handle, a.handle);
        assert!(db.find_resource_cache_volume("w2", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_cache_moves_to_latest_volume() {
        let db = MemoryPersistence::new();
        let key = TaskCacheKey {
            job_id: 3,
            step_name: "unit".into(),
            path: "cache".into(),
        };
        let new = NewVolume {
            worker_name: "w1".into(),
            ..Default::default()
        };
        let a = db.create_volume(&new).await.unwrap();
        let b = db.create_volume(&new).await.unwrap();
        db.mark_volume_created(&a.handle).await.unwrap();
        db.mark_volume_created(&b.handle).await.unwrap();

        db.initialize_task_cache(&a.handle, &key).await.unwrap();
        db.initialize_task_cache(&b.handle, &key).await.unwrap();
        let found = db.find_task_cache_volume("w1", &key).await.unwrap().unwrap();
        assert_eq!(found.handle, b.handle);
    }
}
