// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volumes: a store volume paired with its database record.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{RemoteVolume, VolumeClient, VolumeSpec, VolumeStrategy};
use crate::compression::Compression;
use crate::error::Result;
use crate::persistence::{NewVolume, Persistence, TaskCacheKey, VolumeRecord};
use crate::stream::ByteStream;

/// A created volume on a worker.
#[derive(Clone)]
pub struct Volume {
    record: VolumeRecord,
    remote: Arc<dyn RemoteVolume>,
    client: Arc<dyn VolumeClient>,
    persistence: Arc<dyn Persistence>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("handle", &self.record.handle)
            .field("worker", &self.record.worker_name)
            .finish()
    }
}

impl Volume {
    /// Pairs a record with its store volume.
    pub fn new(
        record: VolumeRecord,
        remote: Arc<dyn RemoteVolume>,
        client: Arc<dyn VolumeClient>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            record,
            remote,
            client,
            persistence,
        }
    }

    /// Volume handle.
    pub fn handle(&self) -> &str {
        &self.record.handle
    }

    /// Path on the worker.
    pub fn path(&self) -> String {
        self.remote.path()
    }

    /// Worker hosting the volume.
    pub fn worker_name(&self) -> &str {
        &self.record.worker_name
    }

    /// Database record.
    pub fn record(&self) -> &VolumeRecord {
        &self.record
    }

    /// Resource cache the volume holds, if initialized as one.
    pub fn resource_cache_id(&self) -> Option<i64> {
        self.record.resource_cache_id
    }

    /// Strategy creating a copy-on-write child of this volume.
    pub fn cow_strategy(&self) -> VolumeStrategy {
        VolumeStrategy::CopyOnWrite {
            parent: self.record.handle.clone(),
        }
    }

    /// Extracts a compressed tar stream under `path`.
    pub async fn stream_in(
        &self,
        path: &str,
        compression: Compression,
        stream: ByteStream,
    ) -> Result<()> {
        self.remote.stream_in(path, compression, stream).await
    }

    /// Produces a compressed tar stream of `path`.
    pub async fn stream_out(&self, path: &str, compression: Compression) -> Result<ByteStream> {
        self.remote.stream_out(path, compression).await
    }

    /// Whether the store can stream directly to other workers.
    pub fn supports_p2p(&self) -> bool {
        self.remote.supports_p2p()
    }

    /// URL another volume can push `path` to.
    pub async fn get_stream_in_p2p_url(&self, path: &str) -> Result<String> {
        self.remote.get_stream_in_p2p_url(path).await
    }

    /// Pushes `path` to a P2P URL.
    pub async fn stream_p2p_out(&self, path: &str, url: &str, compression: Compression) -> Result<()> {
        self.remote.stream_p2p_out(path, url, compression).await
    }

    /// Store properties.
    pub async fn properties(&self) -> Result<HashMap<String, String>> {
        self.remote.properties().await
    }

    /// Sets a store property.
    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.remote.set_property(name, value).await
    }

    /// Marks the volume as holding a resource cache.
    ///
    /// Caches are shared between privileged and unprivileged containers, so
    /// the volume is switched to unprivileged first. Returns false when the
    /// worker already has a volume for this cache.
    pub async fn initialize_resource_cache(&mut self, resource_cache_id: i64) -> Result<bool> {
        self.remote.set_privileged(false).await?;
        let initialized = self
            .persistence
            .initialize_resource_cache(&self.record.handle, resource_cache_id)
            .await?;
        if initialized {
            self.record.resource_cache_id = Some(resource_cache_id);
            info!(
                volume = %self.record.handle,
                worker = %self.record.worker_name,
                resource_cache_id,
                "Initialized resource cache"
            );
        } else {
            debug!(
                volume = %self.record.handle,
                resource_cache_id,
                "Resource cache already initialized on worker"
            );
        }
        Ok(initialized)
    }

    /// Marks the volume as the latest contents of a task cache.
    ///
    /// A copy-on-write child cannot outlive its parent, so its contents are
    /// imported into a standalone volume that becomes the cache instead.
    pub async fn initialize_task_cache(&self, key: &TaskCacheKey) -> Result<()> {
        if self.record.parent_handle.is_none() {
            return self
                .persistence
                .initialize_task_cache(&self.record.handle, key)
                .await;
        }

        let record = self
            .persistence
            .create_volume(&NewVolume {
                worker_name: self.record.worker_name.clone(),
                team_id: self.record.team_id,
                ..Default::default()
            })
            .await?;
        let spec = VolumeSpec {
            strategy: VolumeStrategy::Import {
                path: self.path(),
                follow_symlinks: false,
            },
            privileged: true,
            properties: HashMap::new(),
        };
        if let Err(e) = self.client.create_volume(&record.handle, spec).await {
            self.persistence.mark_volume_failed(&record.handle).await?;
            return Err(e);
        }
        let record = self.persistence.mark_volume_created(&record.handle).await?;
        self.persistence
            .initialize_task_cache(&record.handle, key)
            .await?;
        info!(
            volume = %record.handle,
            source = %self.record.handle,
            cache = %key.key(),
            "Imported task cache"
        );
        Ok(())
    }

    /// Records the volume as a named artifact.
    pub async fn initialize_artifact(&mut self, name: &str) -> Result<()> {
        self.persistence
            .initialize_artifact(&self.record.handle, name)
            .await?;
        self.record.artifact_name = Some(name.to_string());
        Ok(())
    }

    /// Destroys the store volume.
    pub async fn destroy(&self) -> Result<()> {
        self.remote.destroy().await
    }
}

/// A volume mounted into a container.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    /// Mounted volume.
    pub volume: Volume,
    /// Path inside the container.
    pub mount_path: String,
}
