// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker collaborator trait definitions.
//!
//! A worker exposes two remote services: a container runtime and a volume
//! store. Both are reached through the narrow capability sets below.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::compression::Compression;
use crate::error::Result;
use crate::persistence::WorkerRecord;
use crate::spec::ContainerLimits;
use crate::stream::ByteStream;

/// A host path mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Path on the worker.
    pub src_path: String,
    /// Path inside the container.
    pub dst_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Parameters for creating a runtime container.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContainerSpec {
    /// Handle, matching the container record.
    pub handle: String,
    /// Root filesystem URL.
    pub rootfs_url: String,
    /// Run privileged.
    pub privileged: bool,
    /// Mounts, applied in order.
    pub bind_mounts: Vec<BindMount>,
    /// `KEY=value` environment.
    pub env: Vec<String>,
    /// Resource limits.
    pub limits: ContainerLimits,
    /// Initial properties.
    pub properties: HashMap<String, String>,
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtySpec {
    /// Columns.
    pub columns: u16,
    /// Rows.
    pub rows: u16,
}

/// A process to run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Stable process ID, allowing re-attachment.
    pub id: Option<String>,
    /// Executable path.
    pub path: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra `KEY=value` environment.
    pub env: Vec<String>,
    /// Working directory.
    pub dir: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Allocate a terminal.
    pub tty: Option<TtySpec>,
}

/// Signals deliverable to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM.
    Terminate,
    /// SIGKILL.
    Kill,
}

/// Shared byte sink for process output.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes.
    pub fn write(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(bytes);
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Contents as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

/// Process standard streams.
#[derive(Debug, Clone, Default)]
pub struct ProcessIo {
    /// Bytes written to stdin before it is closed.
    pub stdin: Vec<u8>,
    /// Receives stdout.
    pub stdout: OutputBuffer,
    /// Receives stderr.
    pub stderr: OutputBuffer,
}

/// A running process.
#[async_trait]
pub trait Process: Send + Sync {
    /// Runtime process ID.
    fn id(&self) -> String;

    /// Waits for the exit status. [`Error::ConnectionLost`](crate::Error::ConnectionLost)
    /// means the stream dropped while the process kept running.
    async fn wait(&self) -> Result<i32>;

    /// Delivers a signal.
    async fn signal(&self, signal: Signal) -> Result<()>;

    /// Resizes the terminal.
    async fn set_tty(&self, tty: TtySpec) -> Result<()>;
}

/// A container known to the runtime.
#[async_trait]
pub trait RuntimeContainer: Send + Sync {
    /// Handle.
    fn handle(&self) -> String;

    /// Starts a process.
    async fn run(&self, spec: &ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>>;

    /// Re-attaches to a process by ID. Unknown IDs yield
    /// [`Error::ProcessNotFound`](crate::Error::ProcessNotFound).
    async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Box<dyn Process>>;

    /// Stops every process. `kill` skips the graceful period.
    async fn stop(&self, kill: bool) -> Result<()>;

    /// All properties.
    async fn properties(&self) -> Result<HashMap<String, String>>;

    /// One property, `None` if unset.
    async fn property(&self, name: &str) -> Result<Option<String>>;

    /// Sets a property.
    async fn set_property(&self, name: &str, value: &str) -> Result<()>;
}

/// Container runtime on one worker.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Creates a container.
    async fn create(&self, spec: RuntimeContainerSpec) -> Result<Arc<dyn RuntimeContainer>>;

    /// Finds a container. `None` when the runtime has no such handle.
    async fn lookup(&self, handle: &str) -> Result<Option<Arc<dyn RuntimeContainer>>>;

    /// Destroys a container and its processes.
    async fn destroy(&self, handle: &str) -> Result<()>;

    /// Containers whose properties include every given pair.
    async fn containers(
        &self,
        properties: &HashMap<String, String>,
    ) -> Result<Vec<Arc<dyn RuntimeContainer>>>;
}

/// How a volume's initial contents are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeStrategy {
    /// Empty directory.
    Empty,
    /// Contents of a host path.
    Import {
        /// Host path.
        path: String,
        /// Follow symlinks while importing.
        follow_symlinks: bool,
    },
    /// Copy-on-write child of another volume.
    CopyOnWrite {
        /// Parent volume handle.
        parent: String,
    },
}

/// Parameters for creating a store volume.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Initial contents.
    pub strategy: VolumeStrategy,
    /// Keep root ownership for privileged containers.
    pub privileged: bool,
    /// Initial properties.
    pub properties: HashMap<String, String>,
}

impl VolumeSpec {
    /// Unprivileged volume with the given strategy and no properties.
    pub fn new(strategy: VolumeStrategy) -> Self {
        Self {
            strategy,
            privileged: false,
            properties: HashMap::new(),
        }
    }
}

/// A volume in the store.
#[async_trait]
pub trait RemoteVolume: Send + Sync {
    /// Handle.
    fn handle(&self) -> String;

    /// Path on the worker.
    fn path(&self) -> String;

    /// All properties.
    async fn properties(&self) -> Result<HashMap<String, String>>;

    /// Sets a property.
    async fn set_property(&self, name: &str, value: &str) -> Result<()>;

    /// Changes ownership mapping.
    async fn set_privileged(&self, privileged: bool) -> Result<()>;

    /// Extracts a compressed tar stream under `path`.
    async fn stream_in(&self, path: &str, compression: Compression, stream: ByteStream)
    -> Result<()>;

    /// Produces a compressed tar stream of `path`.
    async fn stream_out(&self, path: &str, compression: Compression) -> Result<ByteStream>;

    /// Whether the store can move bytes directly between workers.
    fn supports_p2p(&self) -> bool {
        false
    }

    /// Short-lived URL accepting a stream into `path`.
    async fn get_stream_in_p2p_url(&self, path: &str) -> Result<String>;

    /// Pushes `path` to a URL obtained from another volume.
    async fn stream_p2p_out(&self, path: &str, url: &str, compression: Compression) -> Result<()>;

    /// Destroys the volume.
    async fn destroy(&self) -> Result<()>;
}

/// Volume store on one worker.
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Creates a volume with the given handle.
    async fn create_volume(&self, handle: &str, spec: VolumeSpec) -> Result<Arc<dyn RemoteVolume>>;

    /// Finds a volume. `None` when the store has no such handle.
    async fn lookup_volume(&self, handle: &str) -> Result<Option<Arc<dyn RemoteVolume>>>;

    /// Volumes whose properties include every given pair.
    async fn list_volumes(
        &self,
        properties: &HashMap<String, String>,
    ) -> Result<Vec<Arc<dyn RemoteVolume>>>;

    /// Destroys a volume.
    async fn destroy_volume(&self, handle: &str) -> Result<()>;
}

/// Connects to the services of a registered worker.
pub trait WorkerClients: Send + Sync {
    /// Container runtime client.
    fn runtime(&self, worker: &WorkerRecord) -> Arc<dyn RuntimeClient>;

    /// Volume store client.
    fn volumes(&self, worker: &WorkerRecord) -> Arc<dyn VolumeClient>;
}
