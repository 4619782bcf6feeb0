// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetches resource versions onto workers, at most once per worker.
//!
//! Many builds often want the same version on the same worker at once.
//! The first caller takes an advisory lock named after the version and
//! worker and runs the `get` script; everyone else polls until the lock
//! is free and then finds the initialized cache volume.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::Container;
use crate::error::{Error, Result};
use crate::lock::{LockFactory, LockId};
use crate::resource::{GetResult, ResourceCache, VersionResult};
use crate::spec::{ContainerMetadata, ContainerOwner, ContainerSpec};
use crate::volume::Volume;
use crate::worker::Worker;

/// Default interval between lock attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Something fetchable under a lock.
#[async_trait]
pub trait FetchSource: Send + Sync {
    /// Name of the lock serializing fetches of this source.
    fn lock_name(&self) -> String;

    /// Previously fetched result, without locking.
    async fn find(&self) -> Result<Option<(GetResult, Volume)>>;

    /// Fetches the source. Called with the lock held.
    async fn create(&self, cancel: &CancellationToken) -> Result<(GetResult, Option<Volume>)>;
}

/// Runs fetches under advisory locks.
#[derive(Clone)]
pub struct Fetcher {
    locks: Arc<dyn LockFactory>,
    retry_interval: Duration,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl Fetcher {
    /// Creates a fetcher retrying held locks every `retry_interval`.
    pub fn new(locks: Arc<dyn LockFactory>, retry_interval: Duration) -> Self {
        Self {
            locks,
            retry_interval,
        }
    }

    /// Returns the existing result or fetches `source`.
    ///
    /// The volume is `None` when the fetch script failed; the exit status
    /// in the result says so.
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        source: &dyn FetchSource,
    ) -> Result<(GetResult, Option<Volume>)> {
        if let Some((result, volume)) = source.find().await? {
            debug!(volume = %volume.handle(), "Found fetched resource");
            return Ok((result, Some(volume)));
        }

        let lock_id = LockId::ResourceFetch(source.lock_name());
        let mut ticker = tokio::time::interval(self.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = ticker.tick() => {}
            }

            let Some(lock) = self.locks.acquire(&lock_id).await? else {
                debug!(lock = %lock_id, "Fetch in progress elsewhere, waiting");
                continue;
            };

            let result = source.create(cancel).await;
            if let Err(e) = lock.release().await {
                warn!(lock = %lock_id, error = %e, "Failed to release lock");
            }
            return result;
        }
    }
}

/// Fetches one resource cache onto one worker by running the `get` script.
pub struct ResourceFetchSource {
    worker: Worker,
    cache: ResourceCache,
    owner: ContainerOwner,
    metadata: ContainerMetadata,
    spec: ContainerSpec,
}

impl ResourceFetchSource {
    /// Prepares a fetch of `cache` onto `worker` in a container described
    /// by `spec`. The fetched bits land in the volume mounted at
    /// `spec.dir`.
    pub fn new(
        worker: Worker,
        cache: ResourceCache,
        owner: ContainerOwner,
        metadata: ContainerMetadata,
        spec: ContainerSpec,
    ) -> Self {
        Self {
            worker,
            cache,
            owner,
            metadata,
            spec,
        }
    }

    async fn fetch_in(&self, cancel: &CancellationToken, container: &Container) -> Result<(GetResult, Option<Volume>)> {
        let version_result = match self
            .cache
            .resource
            .get(cancel, container, &self.spec.dir)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                if let Error::ResourceScriptFailed {
                    exit_status,
                    stderr,
                } = e.root()
                {
                    warn!(
                        resource_cache_id = self.cache.id,
                        exit_status,
                        stderr = %stderr,
                        "Resource get script failed"
                    );
                    return Ok((
                        GetResult {
                            exit_status: *exit_status,
                            ..Default::default()
                        },
                        None,
                    ));
                }
                return Err(e);
            }
        };

        let mount = container
            .volume_at(&self.spec.dir)
            .ok_or_else(|| Error::VolumeNotFound(format!("{}:{}", container.handle(), self.spec.dir)))?;
        let mut volume = mount.volume.clone();
        volume.initialize_resource_cache(self.cache.id).await?;
        self.worker
            .persistence()
            .update_resource_cache_metadata(self.cache.id, &version_result.metadata)
            .await?;

        info!(
            resource_cache_id = self.cache.id,
            worker = %self.worker.name(),
            volume = %volume.handle(),
            "Fetched resource"
        );
        Ok((
            GetResult {
                exit_status: 0,
                artifact_handle: Some(volume.handle().to_string()),
                version_result,
            },
            Some(volume),
        ))
    }
}

#[async_trait]
impl FetchSource for ResourceFetchSource {
    fn lock_name(&self) -> String {
        self.cache.lock_name(self.worker.name())
    }

    async fn find(&self) -> Result<Option<(GetResult, Volume)>> {
        let Some(volume) = self
            .worker
            .find_volume_for_resource_cache(self.cache.id)
            .await?
        else {
            return Ok(None);
        };
        let metadata = self
            .worker
            .persistence()
            .resource_cache_metadata(self.cache.id)
            .await?
            .unwrap_or_default();
        let result = GetResult {
            exit_status: 0,
            version_result: VersionResult {
                version: self.cache.resource.version.clone(),
                metadata,
            },
            artifact_handle: Some(volume.handle().to_string()),
        };
        Ok(Some((result, volume)))
    }

    async fn create(&self, cancel: &CancellationToken) -> Result<(GetResult, Option<Volume>)> {
        if let Some((result, volume)) = self.find().await? {
            debug!(volume = %volume.handle(), "Resource fetched while waiting for lock");
            return Ok((result, Some(volume)));
        }
        let container = self
            .worker
            .find_or_create_container(cancel, &self.owner, &self.metadata, &self.spec)
            .await?;
        self.fetch_in(cancel, &container).await
    }
}
