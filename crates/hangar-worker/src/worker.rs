// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workers: compatibility checks and container provisioning.
//!
//! A [`Worker`] pairs a worker record with clients for its container
//! runtime and volume store. Provisioning is find-or-create throughout:
//! records are written in the `creating` state before the runtime object
//! exists, so a scheduler that dies half way leaves records the next
//! attempt picks up. Concurrent attempts on the same record are
//! serialized with advisory locks.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactSource;
use crate::client::{
    BindMount, RuntimeClient, RuntimeContainer, RuntimeContainerSpec, VolumeClient, VolumeSpec,
    VolumeStrategy, WorkerClients,
};
use crate::container::{Container, USER_PROPERTY};
use crate::error::{Error, Incompatibility, Result, ResultExt};
use crate::lock::{LockFactory, LockId};
use crate::metrics::Metrics;
use crate::persistence::{
    ContainerRecord, NewVolume, Persistence, TaskCacheKey, VolumeRecord, WorkerRecord,
};
use crate::spec::{
    ContainerMetadata, ContainerOwner, ContainerSpec, ImageSource, ResourceTypeDefinition,
    WorkerSpec, clean_path, resolve_path,
};
use crate::version::WorkerVersion;
use crate::volume::{Volume, VolumeMount};

/// Interval between attempts to take a held creation lock.
pub const CREATING_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Volume mount path of a container's scratch space.
pub const SCRATCH_MOUNT_PATH: &str = "/scratch";

/// Image volumes are tracked per container but never mounted.
const IMAGE_VOLUME_PATH: &str = "image-no-mount:/";

/// Prefix of the unmounted volumes remote inputs are streamed into.
const STREAMED_PREFIX: &str = "streamed-no-mount:";

const IMAGE_METADATA_FILE: &str = "metadata.json";

/// Environment and user shipped alongside an image's root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageMetadata {
    /// `KEY=value` pairs.
    #[serde(default)]
    pub env: Vec<String>,
    /// Default process user.
    #[serde(default)]
    pub user: String,
}

struct FetchedImage {
    url: String,
    privileged: bool,
    metadata: ImageMetadata,
}

/// State shared by every [`Worker`] handle.
pub(crate) struct WorkerContext {
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) clients: Arc<dyn WorkerClients>,
    pub(crate) locks: Arc<dyn LockFactory>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) proxy_env: Vec<String>,
}

/// A registered worker and clients for its services.
#[derive(Clone)]
pub struct Worker {
    record: WorkerRecord,
    runtime: Arc<dyn RuntimeClient>,
    volumes: Arc<dyn VolumeClient>,
    ctx: Arc<WorkerContext>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.record.name)
            .field("platform", &self.record.platform)
            .field("team_id", &self.record.team_id)
            .finish()
    }
}

impl Worker {
    pub(crate) fn new(record: WorkerRecord, ctx: Arc<WorkerContext>) -> Self {
        let runtime = ctx.clients.runtime(&record);
        let volumes = ctx.clients.volumes(&record);
        Self {
            record,
            runtime,
            volumes,
            ctx,
        }
    }

    /// Unique worker name.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Platform, e.g. `linux`.
    pub fn platform(&self) -> &str {
        &self.record.platform
    }

    /// Tags the worker accepts.
    pub fn tags(&self) -> &[String] {
        &self.record.tags
    }

    /// Owning team, zero for shared workers.
    pub fn team_id(&self) -> i32 {
        self.record.team_id
    }

    /// Whether a team owns the worker.
    pub fn is_team_owned(&self) -> bool {
        self.record.team_id != 0
    }

    /// Ephemeral workers disappear instead of stalling.
    pub fn ephemeral(&self) -> bool {
        self.record.ephemeral
    }

    /// Host path holding CA certificates.
    pub fn certs_path(&self) -> Option<&str> {
        self.record.certs_path.as_deref()
    }

    /// Record as of the last load.
    pub fn record(&self) -> &WorkerRecord {
        &self.record
    }

    /// Containers reported by the last heartbeat.
    pub fn active_containers(&self) -> i32 {
        self.record.active_containers
    }

    /// Volumes reported by the last heartbeat.
    pub fn active_volumes(&self) -> i32 {
        self.record.active_volumes
    }

    /// Active task count as of the last load.
    pub fn active_tasks(&self) -> i32 {
        self.record.active_tasks
    }

    /// Atomically increments the active task count, returning the new value.
    pub async fn increase_active_tasks(&self) -> Result<i32> {
        self.ctx.persistence.increase_active_tasks(self.name()).await
    }

    /// Atomically decrements the active task count, returning the new value.
    pub async fn decrease_active_tasks(&self) -> Result<i32> {
        self.ctx.persistence.decrease_active_tasks(self.name()).await
    }

    /// Live build containers on the worker.
    pub async fn build_containers(&self) -> Result<i64> {
        self.ctx.persistence.count_build_containers(self.name()).await
    }

    /// Whether the advertised version satisfies `required`.
    pub fn is_version_compatible(&self, required: Option<&WorkerVersion>) -> bool {
        let Some(required) = required else {
            return true;
        };
        match self.record.version.as_deref().map(str::parse::<WorkerVersion>) {
            Some(Ok(version)) => version.is_compatible_with(required),
            _ => false,
        }
    }

    /// Container runtime client.
    pub fn runtime_client(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    /// Volume store client.
    pub fn volume_client(&self) -> &Arc<dyn VolumeClient> {
        &self.volumes
    }

    pub(crate) fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.ctx.persistence
    }

    // ========================================================================
    // Compatibility
    // ========================================================================

    /// Checks whether the worker can run `spec`.
    pub fn check(&self, spec: &WorkerSpec) -> std::result::Result<(), Incompatibility> {
        if spec.team_id != self.record.team_id && self.record.team_id != 0 {
            return Err(Incompatibility::TeamMismatch {
                worker_team: self.record.team_id,
                requested_team: spec.team_id,
            });
        }

        if let Some(resource_type) = &spec.resource_type {
            let base = resolve_resource_type(resource_type, &spec.resource_types)?;
            if !self
                .record
                .resource_types
                .iter()
                .any(|t| t.type_name == base)
            {
                return Err(Incompatibility::UnsupportedResourceType(
                    resource_type.clone(),
                ));
            }
        }

        if let Some(platform) = &spec.platform {
            if *platform != self.record.platform {
                return Err(Incompatibility::PlatformMismatch {
                    worker: self.record.platform.clone(),
                    requested: platform.clone(),
                });
            }
        }

        if !self.tags_match(&spec.tags) {
            return Err(Incompatibility::TagMismatch {
                worker: self.record.tags.clone(),
                requested: spec.tags.clone(),
            });
        }

        Ok(())
    }

    /// Whether the worker can run `spec`.
    pub fn satisfies(&self, spec: &WorkerSpec) -> bool {
        self.check(spec).is_ok()
    }

    // Tagged workers only take steps that ask for their tags.
    fn tags_match(&self, requested: &[String]) -> bool {
        if !self.record.tags.is_empty() && requested.is_empty() {
            return false;
        }
        requested.iter().all(|t| self.record.tags.contains(t))
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Created container by handle.
    pub async fn find_container(&self, handle: &str) -> Result<Option<Container>> {
        let Some(record) = self.ctx.persistence.find_created_container(handle).await? else {
            return Ok(None);
        };
        if record.worker_name != self.record.name {
            return Ok(None);
        }
        let Some(runtime) = self.runtime.lookup(handle).await? else {
            return Ok(None);
        };
        let mounts = self.container_mounts(&record).await?;
        Ok(Some(Container::new(record, runtime, self.runtime.clone(), mounts)))
    }

    /// Created volume by handle.
    pub async fn lookup_volume(&self, handle: &str) -> Result<Option<Volume>> {
        let Some(record) = self.ctx.persistence.find_volume(handle).await? else {
            return Ok(None);
        };
        if record.worker_name != self.record.name {
            return Ok(None);
        }
        self.attach_volume(record).await
    }

    /// Volume holding `resource_cache_id` on this worker.
    pub async fn find_volume_for_resource_cache(&self, resource_cache_id: i64) -> Result<Option<Volume>> {
        let record = self
            .ctx
            .persistence
            .find_resource_cache_volume(self.name(), resource_cache_id)
            .await?;
        match record {
            Some(record) => self.attach_volume(record).await,
            None => Ok(None),
        }
    }

    /// Latest volume for a task cache on this worker.
    pub async fn find_volume_for_task_cache(&self, key: &TaskCacheKey) -> Result<Option<Volume>> {
        let record = self
            .ctx
            .persistence
            .find_task_cache_volume(self.name(), key)
            .await?;
        match record {
            Some(record) => self.attach_volume(record).await,
            None => Ok(None),
        }
    }

    async fn attach_volume(&self, record: VolumeRecord) -> Result<Option<Volume>> {
        match self.volumes.lookup_volume(&record.handle).await? {
            Some(remote) => Ok(Some(self.volume(record, remote))),
            None => {
                debug!(volume = %record.handle, worker = %self.name(), "Volume record without store volume");
                Ok(None)
            }
        }
    }

    fn volume(&self, record: VolumeRecord, remote: Arc<dyn crate::client::RemoteVolume>) -> Volume {
        Volume::new(
            record,
            remote,
            self.volumes.clone(),
            self.ctx.persistence.clone(),
        )
    }

    async fn container_mounts(&self, container: &ContainerRecord) -> Result<Vec<VolumeMount>> {
        let records = self
            .ctx
            .persistence
            .find_volumes_for_container(&container.handle)
            .await?;
        let mut mounts = Vec::new();
        for record in records {
            let Some(mount_path) = record.mount_path.clone() else {
                continue;
            };
            if !mount_path.starts_with('/') || !record.is_created() {
                continue;
            }
            let remote = self
                .volumes
                .lookup_volume(&record.handle)
                .await?
                .ok_or_else(|| Error::VolumeMissing {
                    handle: record.handle.clone(),
                    worker: self.record.name.clone(),
                })?;
            mounts.push(VolumeMount {
                volume: self.volume(record, remote),
                mount_path,
            });
        }
        mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
        Ok(mounts)
    }

    // ========================================================================
    // Containers
    // ========================================================================

    /// Finds the owner's container on this worker or provisions it.
    pub async fn find_or_create_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Container> {
        self.find_or_create_container_inner(cancel, owner, metadata, spec)
            .await
            .with_context(|| format!("find or create container on worker {}", self.name()))
    }

    async fn find_or_create_container_inner(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Container> {
        loop {
            let record = match self.ctx.persistence.find_container(self.name(), owner).await? {
                Some(record) => record,
                None => {
                    self.ctx
                        .persistence
                        .create_container(self.name(), owner, metadata)
                        .await?
                }
            };

            let existing = self.runtime.lookup(&record.handle).await?;
            if record.is_created() {
                let Some(runtime) = existing else {
                    return Err(Error::ContainerMissing {
                        handle: record.handle,
                        worker: self.record.name.clone(),
                    });
                };
                debug!(container = %record.handle, owner = %owner, "Found created container");
                let mounts = self.container_mounts(&record).await?;
                return Ok(Container::new(record, runtime, self.runtime.clone(), mounts));
            }

            if let Some(runtime) = existing {
                return self.mark_found_container_created(&record, runtime).await;
            }

            let lock_id = LockId::ContainerCreating(record.handle.clone());
            let Some(lock) = self.ctx.locks.acquire(&lock_id).await? else {
                debug!(container = %record.handle, "Container creation in progress elsewhere");
                wait_or_cancel(cancel, CREATING_RETRY_INTERVAL).await?;
                continue;
            };

            let result = match self.runtime.lookup(&record.handle).await {
                Ok(Some(runtime)) => self.mark_found_container_created(&record, runtime).await,
                Ok(None) => self.create_container(cancel, record, spec).await,
                Err(e) => Err(e),
            };
            if let Err(e) = lock.release().await {
                warn!(lock = %lock_id, error = %e, "Failed to release lock");
            }
            return result;
        }
    }

    async fn mark_found_container_created(
        &self,
        record: &ContainerRecord,
        runtime: Arc<dyn RuntimeContainer>,
    ) -> Result<Container> {
        debug!(container = %record.handle, "Runtime container exists, marking created");
        let record = self
            .ctx
            .persistence
            .mark_container_created(&record.handle)
            .await?;
        let mounts = self.container_mounts(&record).await?;
        Ok(Container::new(record, runtime, self.runtime.clone(), mounts))
    }

    async fn create_container(
        &self,
        cancel: &CancellationToken,
        record: ContainerRecord,
        spec: &ContainerSpec,
    ) -> Result<Container> {
        let provisioned = self.provision(cancel, &record, spec).await;
        let (runtime, mounts) = match provisioned {
            Ok(created) => created,
            Err(e) => {
                error!(container = %record.handle, worker = %self.name(), error = %e, "Failed to create container");
                if let Err(mark) = self
                    .ctx
                    .persistence
                    .mark_container_failed(&record.handle)
                    .await
                {
                    error!(container = %record.handle, error = %mark, "Failed to mark container failed");
                }
                self.fail_container_volumes(&record.handle).await;
                self.ctx.metrics.container_failed();
                return Err(e);
            }
        };

        let record = match self
            .ctx
            .persistence
            .mark_container_created(&record.handle)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                if let Err(destroy) = self.runtime.destroy(&record.handle).await {
                    error!(container = %record.handle, error = %destroy, "Failed to destroy container");
                }
                return Err(e);
            }
        };

        self.ctx.metrics.container_created();
        info!(
            container = %record.handle,
            worker = %self.name(),
            mounts = mounts.len(),
            "Created container"
        );
        Ok(Container::new(record, runtime, self.runtime.clone(), mounts))
    }

    /// Destroys the volumes created for a container that failed and marks
    /// their records failed. Copy-on-write children go before parents.
    async fn fail_container_volumes(&self, container: &str) {
        let mut volumes = match self.ctx.persistence.find_volumes_for_container(container).await {
            Ok(volumes) => volumes,
            Err(e) => {
                error!(container = %container, error = %e, "Failed to list container volumes");
                return;
            }
        };
        volumes.sort_by_key(|v| v.parent_handle.is_none());
        for volume in volumes {
            if let Err(e) = self.volumes.destroy_volume(&volume.handle).await {
                warn!(volume = %volume.handle, error = %e, "Failed to destroy volume");
            }
            if let Err(e) = self.ctx.persistence.mark_volume_failed(&volume.handle).await {
                error!(volume = %volume.handle, error = %e, "Failed to mark volume failed");
            }
        }
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        record: &ContainerRecord,
        spec: &ContainerSpec,
    ) -> Result<(Arc<dyn RuntimeContainer>, Vec<VolumeMount>)> {
        let image = self.fetch_image(cancel, record, spec).await?;
        let mounts = self.create_volumes(cancel, record, spec, image.privileged).await?;

        let mut bind_mounts: Vec<BindMount> = mounts
            .iter()
            .map(|m| BindMount {
                src_path: m.volume.path(),
                dst_path: m.mount_path.clone(),
                read_only: false,
            })
            .collect();
        for source in &spec.bind_mounts {
            if let Some(mount) = source.volume_on(self).await? {
                bind_mounts.push(mount);
            }
        }
        bind_mounts.sort_by(|a, b| a.dst_path.cmp(&b.dst_path));

        let mut env = image.metadata.env.clone();
        env.extend(spec.env.iter().cloned());
        env.extend(self.ctx.proxy_env.iter().cloned());

        let mut properties = HashMap::new();
        let user = spec
            .user
            .clone()
            .unwrap_or_else(|| image.metadata.user.clone());
        if !user.is_empty() {
            properties.insert(USER_PROPERTY.to_string(), user);
        }

        let runtime = self
            .runtime
            .create(RuntimeContainerSpec {
                handle: record.handle.clone(),
                rootfs_url: image.url,
                privileged: image.privileged,
                bind_mounts,
                env,
                limits: spec.limits,
                properties,
            })
            .await?;
        Ok((runtime, mounts))
    }

    async fn fetch_image(
        &self,
        cancel: &CancellationToken,
        record: &ContainerRecord,
        spec: &ContainerSpec,
    ) -> Result<FetchedImage> {
        let privileged = spec.image.privileged;
        match &spec.image.source {
            ImageSource::Registry { url } | ImageSource::RawUrl { url } => Ok(FetchedImage {
                url: url.clone(),
                privileged,
                metadata: ImageMetadata::default(),
            }),
            ImageSource::BaseResourceType { name } => {
                let resource_type = self
                    .record
                    .resource_types
                    .iter()
                    .find(|t| t.type_name == *name)
                    .ok_or_else(|| Incompatibility::UnsupportedResourceType(name.clone()))?;
                let volume = self
                    .find_or_create_volume(
                        cancel,
                        record,
                        IMAGE_VOLUME_PATH,
                        VolumeSpec {
                            strategy: VolumeStrategy::Import {
                                path: resource_type.image.clone(),
                                follow_symlinks: false,
                            },
                            privileged: resource_type.privileged,
                            properties: HashMap::new(),
                        },
                    )
                    .await?;
                Ok(FetchedImage {
                    url: format!("raw://{}", volume.path()),
                    privileged: resource_type.privileged,
                    metadata: ImageMetadata::default(),
                })
            }
            ImageSource::Artifact { source } => {
                let volume = self
                    .materialize(cancel, record, IMAGE_VOLUME_PATH, source.as_ref(), privileged)
                    .await?;
                let metadata = read_image_metadata(source.as_ref()).await?;
                Ok(FetchedImage {
                    url: format!("raw://{}/rootfs", volume.path()),
                    privileged,
                    metadata,
                })
            }
        }
    }

    async fn create_volumes(
        &self,
        cancel: &CancellationToken,
        record: &ContainerRecord,
        spec: &ContainerSpec,
        privileged: bool,
    ) -> Result<Vec<VolumeMount>> {
        let volume_spec = |strategy| VolumeSpec {
            strategy,
            privileged,
            properties: HashMap::new(),
        };

        let mut mounts = Vec::new();
        let scratch = self
            .find_or_create_volume(cancel, record, SCRATCH_MOUNT_PATH, volume_spec(VolumeStrategy::Empty))
            .await?;
        mounts.push(VolumeMount {
            volume: scratch,
            mount_path: SCRATCH_MOUNT_PATH.to_string(),
        });

        let dir = clean_path(&spec.dir);
        let mut claimed: HashSet<String> = HashSet::new();
        let mut io_mounts = Vec::new();

        for input in &spec.inputs {
            let path = clean_path(&input.destination_path);
            let volume = self
                .materialize(cancel, record, &path, input.artifact.as_ref(), privileged)
                .await?;
            claimed.insert(path.clone());
            io_mounts.push(VolumeMount {
                volume,
                mount_path: path,
            });
        }

        for output in spec.outputs.values() {
            let path = resolve_path(&dir, output);
            if claimed.contains(&path) {
                continue;
            }
            let volume = self
                .find_or_create_volume(cancel, record, &path, volume_spec(VolumeStrategy::Empty))
                .await?;
            claimed.insert(path.clone());
            io_mounts.push(VolumeMount {
                volume,
                mount_path: path,
            });
        }

        for cache in &spec.caches {
            let path = resolve_path(&dir, cache);
            if claimed.contains(&path) {
                continue;
            }
            let existing = match spec.task_cache_key(cache) {
                Some(key) => self.find_volume_for_task_cache(&key).await?,
                None => None,
            };
            let strategy = match existing {
                Some(cache_volume) => cache_volume.cow_strategy(),
                None => VolumeStrategy::Empty,
            };
            let volume = self
                .find_or_create_volume(cancel, record, &path, volume_spec(strategy))
                .await?;
            claimed.insert(path.clone());
            io_mounts.push(VolumeMount {
                volume,
                mount_path: path,
            });
        }

        if !claimed.contains(&dir) {
            let workdir = self
                .find_or_create_volume(cancel, record, &dir, volume_spec(VolumeStrategy::Empty))
                .await?;
            io_mounts.push(VolumeMount {
                volume: workdir,
                mount_path: dir,
            });
        }

        io_mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
        mounts.extend(io_mounts);
        Ok(mounts)
    }

    /// Volume at `mount_path` holding `artifact`: a copy-on-write child of
    /// a local volume when the worker already has one, otherwise a child of
    /// a volume the artifact was streamed into.
    async fn materialize(
        &self,
        cancel: &CancellationToken,
        record: &ContainerRecord,
        mount_path: &str,
        artifact: &dyn ArtifactSource,
        privileged: bool,
    ) -> Result<Volume> {
        let parent = match artifact.exists_on(self).await? {
            Some(local) => local,
            None => {
                let streamed_path = format!("{STREAMED_PREFIX}{mount_path}");
                let mut streamed = self
                    .find_or_create_volume(
                        cancel,
                        record,
                        &streamed_path,
                        VolumeSpec {
                            strategy: VolumeStrategy::Empty,
                            privileged,
                            properties: HashMap::new(),
                        },
                    )
                    .await?;
                debug!(volume = %streamed.handle(), worker = %self.name(), "Streaming artifact");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    streamed_in = artifact.stream_to(&streamed) => streamed_in?,
                }
                if let Some(id) = artifact.resource_cache_id() {
                    streamed.initialize_resource_cache(id).await?;
                }
                streamed
            }
        };
        self.find_or_create_volume(
            cancel,
            record,
            mount_path,
            VolumeSpec {
                strategy: parent.cow_strategy(),
                privileged,
                properties: HashMap::new(),
            },
        )
        .await
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    /// Finds the container's volume at `mount_path` or creates it.
    pub(crate) async fn find_or_create_volume(
        &self,
        cancel: &CancellationToken,
        container: &ContainerRecord,
        mount_path: &str,
        spec: VolumeSpec,
    ) -> Result<Volume> {
        loop {
            let record = match self
                .ctx
                .persistence
                .find_container_volume(self.name(), &container.handle, mount_path)
                .await?
            {
                Some(record) => record,
                None => {
                    let parent_handle = match &spec.strategy {
                        VolumeStrategy::CopyOnWrite { parent } => Some(parent.clone()),
                        _ => None,
                    };
                    self.ctx
                        .persistence
                        .create_volume(&NewVolume {
                            worker_name: self.record.name.clone(),
                            team_id: container.team_id,
                            container_handle: Some(container.handle.clone()),
                            mount_path: Some(mount_path.to_string()),
                            parent_handle,
                        })
                        .await?
                }
            };

            let existing = self.volumes.lookup_volume(&record.handle).await?;
            if record.is_created() {
                return match existing {
                    Some(remote) => Ok(self.volume(record, remote)),
                    None => Err(Error::VolumeMissing {
                        handle: record.handle,
                        worker: self.record.name.clone(),
                    }),
                };
            }

            let lock_id = LockId::VolumeCreating(record.handle.clone());
            let Some(lock) = self.ctx.locks.acquire(&lock_id).await? else {
                debug!(volume = %record.handle, "Volume creation in progress elsewhere");
                wait_or_cancel(cancel, CREATING_RETRY_INTERVAL).await?;
                continue;
            };

            let result = self.create_volume(record, existing, &spec).await;
            if let Err(e) = lock.release().await {
                warn!(lock = %lock_id, error = %e, "Failed to release lock");
            }
            return result;
        }
    }

    async fn create_volume(
        &self,
        record: VolumeRecord,
        existing: Option<Arc<dyn crate::client::RemoteVolume>>,
        spec: &VolumeSpec,
    ) -> Result<Volume> {
        let remote = match existing {
            Some(remote) => remote,
            None => match self.volumes.create_volume(&record.handle, spec.clone()).await {
                Ok(remote) => remote,
                Err(e) => {
                    error!(volume = %record.handle, worker = %self.name(), error = %e, "Failed to create volume");
                    if let Err(mark) = self.ctx.persistence.mark_volume_failed(&record.handle).await {
                        error!(volume = %record.handle, error = %mark, "Failed to mark volume failed");
                    }
                    self.ctx.metrics.volume_failed();
                    return Err(e);
                }
            },
        };
        let record = self
            .ctx
            .persistence
            .mark_volume_created(&record.handle)
            .await?;
        self.ctx.metrics.volume_created();
        debug!(volume = %record.handle, mount_path = ?record.mount_path, "Created volume");
        Ok(self.volume(record, remote))
    }
}

/// Follows custom type definitions down to a base type name.
///
/// Any chain that revisits a type, including a type defined on itself, is
/// unsupported.
pub fn resolve_resource_type(
    name: &str,
    definitions: &[ResourceTypeDefinition],
) -> std::result::Result<String, Incompatibility> {
    let mut visited = HashSet::new();
    let mut current = name.to_string();
    while let Some(definition) = definitions.iter().find(|d| d.name == current) {
        if !visited.insert(current.clone()) {
            return Err(Incompatibility::UnsupportedResourceType(name.to_string()));
        }
        current = definition.parent.clone();
    }
    Ok(current)
}

async fn read_image_metadata(source: &dyn ArtifactSource) -> Result<ImageMetadata> {
    let mut file = source
        .stream_file(IMAGE_METADATA_FILE)
        .await
        .context("read image metadata")?;
    let read = crate::stream::read_all(&mut file).await;
    let closed = file.close().await;
    let bytes = read?;
    closed?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn wait_or_cancel(cancel: &CancellationToken, interval: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// Loads workers from persistence and connects them to their services.
#[derive(Clone)]
pub struct WorkerProvider {
    ctx: Arc<WorkerContext>,
    worker_version: Option<WorkerVersion>,
}

impl fmt::Debug for WorkerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProvider")
            .field("worker_version", &self.worker_version)
            .finish()
    }
}

impl WorkerProvider {
    /// Creates a provider.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        clients: Arc<dyn WorkerClients>,
        locks: Arc<dyn LockFactory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                persistence,
                clients,
                locks,
                metrics,
                proxy_env: Vec::new(),
            }),
            worker_version: None,
        }
    }

    /// Only hand out workers compatible with `version`.
    pub fn with_worker_version(mut self, version: Option<WorkerVersion>) -> Self {
        self.worker_version = version;
        self
    }

    /// Inject `KEY=value` proxy settings into every container.
    pub fn with_proxy_env(mut self, env: Vec<String>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.proxy_env = env;
        } else {
            self.ctx = Arc::new(WorkerContext {
                persistence: self.ctx.persistence.clone(),
                clients: self.ctx.clients.clone(),
                locks: self.ctx.locks.clone(),
                metrics: self.ctx.metrics.clone(),
                proxy_env: env,
            });
        }
        self
    }

    /// Persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.ctx.persistence
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    /// Running workers whose version is compatible.
    pub async fn running_workers(&self) -> Result<Vec<Worker>> {
        let records = self.ctx.persistence.running_workers().await?;
        let mut workers = Vec::with_capacity(records.len());
        for record in records {
            let worker = Worker::new(record, self.ctx.clone());
            if !worker.is_version_compatible(self.worker_version.as_ref()) {
                debug!(
                    worker = %worker.name(),
                    version = ?worker.record.version,
                    "Skipping worker with incompatible version"
                );
                continue;
            }
            workers.push(worker);
        }
        Ok(workers)
    }

    /// Worker by name, regardless of state.
    pub async fn find_worker(&self, name: &str) -> Result<Option<Worker>> {
        Ok(self
            .ctx
            .persistence
            .find_worker(name)
            .await?
            .map(|record| Worker::new(record, self.ctx.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_custom_type_chain() {
        let defs = vec![
            ResourceTypeDefinition::new("my-git", "git-ext"),
            ResourceTypeDefinition::new("git-ext", "git"),
        ];
        assert_eq!(resolve_resource_type("my-git", &defs).unwrap(), "git");
        assert_eq!(resolve_resource_type("time", &defs).unwrap(), "time");
    }

    #[test]
    fn test_cyclic_type_chain_is_unsupported() {
        let defs = vec![
            ResourceTypeDefinition::new("circle-a", "circle-b"),
            ResourceTypeDefinition::new("circle-b", "circle-c"),
            ResourceTypeDefinition::new("circle-c", "circle-a"),
        ];
        assert_eq!(
            resolve_resource_type("circle-a", &defs),
            Err(Incompatibility::UnsupportedResourceType("circle-a".into()))
        );
        let self_ref = vec![ResourceTypeDefinition::new("loop", "loop")];
        assert!(resolve_resource_type("loop", &self_ref).is_err());
    }
}
