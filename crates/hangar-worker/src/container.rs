// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Containers: a runtime container paired with its record and mounts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{
    BindMount, OutputBuffer, ProcessIo, ProcessSpec, RuntimeClient, RuntimeContainer, VolumeSpec,
    VolumeStrategy,
};
use crate::error::{Error, Result};
use crate::persistence::ContainerRecord;
use crate::process::ReattachingProcess;
use crate::spec::ContainerMetadata;
use crate::volume::VolumeMount;
use crate::worker::Worker;

/// Container property caching a recoverable script's stdout.
pub const RESULT_PROPERTY: &str = "resource-result";

/// Process ID used for recoverable scripts.
pub const RESOURCE_PROCESS_ID: &str = "resource";

/// Container property carrying the process user.
pub const USER_PROPERTY: &str = "user";

/// Mount path of the worker's CA certificates.
pub const CERTS_MOUNT_PATH: &str = "/etc/ssl/certs";

/// A host-side mount resolved separately on each worker.
#[async_trait]
pub trait BindMountSource: fmt::Debug + Send + Sync {
    /// The mount on `worker`, or `None` if the worker has nothing to offer.
    async fn volume_on(&self, worker: &Worker) -> Result<Option<BindMount>>;
}

/// Mounts the worker's CA certificates read-only at `/etc/ssl/certs`.
///
/// The certificates are imported once per worker into a volume with a
/// fixed handle and shared by every container afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertsBindMount;

impl CertsBindMount {
    fn handle(worker: &Worker) -> String {
        format!("certs-{}", worker.name())
    }
}

#[async_trait]
impl BindMountSource for CertsBindMount {
    async fn volume_on(&self, worker: &Worker) -> Result<Option<BindMount>> {
        let Some(certs_path) = worker.certs_path() else {
            return Ok(None);
        };
        let handle = Self::handle(worker);
        let volumes = worker.volume_client();
        let volume = match volumes.lookup_volume(&handle).await? {
            Some(volume) => volume,
            None => {
                debug!(worker = %worker.name(), path = %certs_path, "Importing certificates");
                let spec = VolumeSpec::new(VolumeStrategy::Import {
                    path: certs_path.to_string(),
                    follow_symlinks: true,
                });
                volumes.create_volume(&handle, spec).await?
            }
        };
        Ok(Some(BindMount {
            src_path: volume.path(),
            dst_path: CERTS_MOUNT_PATH.to_string(),
            read_only: true,
        }))
    }
}

/// A script to run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ScriptRequest {
    /// Executable path.
    pub path: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Bytes written to stdin.
    pub stdin: Vec<u8>,
}

/// A created container on a worker.
pub struct Container {
    record: ContainerRecord,
    runtime: Arc<dyn RuntimeContainer>,
    client: Arc<dyn RuntimeClient>,
    mounts: Vec<VolumeMount>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("handle", &self.record.handle)
            .field("worker", &self.record.worker_name)
            .field("mounts", &self.mounts.len())
            .finish()
    }
}

impl Container {
    pub(crate) fn new(
        record: ContainerRecord,
        runtime: Arc<dyn RuntimeContainer>,
        client: Arc<dyn RuntimeClient>,
        mounts: Vec<VolumeMount>,
    ) -> Self {
        Self {
            record,
            runtime,
            client,
            mounts,
        }
    }

    /// Runtime handle.
    pub fn handle(&self) -> &str {
        &self.record.handle
    }

    /// Worker hosting the container.
    pub fn worker_name(&self) -> &str {
        &self.record.worker_name
    }

    /// Step metadata stored with the record.
    pub fn metadata(&self) -> &ContainerMetadata {
        &self.record.metadata.0
    }

    /// Database record.
    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    /// Volumes mounted into the container, sorted by mount path.
    pub fn volume_mounts(&self) -> &[VolumeMount] {
        &self.mounts
    }

    /// The volume mounted exactly at `path`.
    pub fn volume_at(&self, path: &str) -> Option<&VolumeMount> {
        let path = crate::spec::clean_path(path);
        self.mounts.iter().find(|m| m.mount_path == path)
    }

    /// Starts a process and waits for it.
    ///
    /// Cancelling stops the container gracefully and returns
    /// [`Error::Cancelled`].
    pub async fn run(&self, cancel: &CancellationToken, spec: ProcessSpec, io: ProcessIo) -> Result<i32> {
        let process = self.runtime.run(&spec, io.clone()).await?;
        self.wait(cancel, ReattachingProcess::new(self.runtime.clone(), process, io))
            .await
    }

    /// Attaches to a running process by ID and waits for it.
    pub async fn attach(&self, cancel: &CancellationToken, process_id: &str, io: ProcessIo) -> Result<i32> {
        let process = self.runtime.attach(process_id, io.clone()).await?;
        self.wait(cancel, ReattachingProcess::new(self.runtime.clone(), process, io))
            .await
    }

    async fn wait(&self, cancel: &CancellationToken, mut process: ReattachingProcess) -> Result<i32> {
        tokio::select! {
            status = process.wait() => status,
            _ = cancel.cancelled() => {
                info!(container = %self.record.handle, process = %process.id(), "Cancelled, stopping container");
                if let Err(e) = self.runtime.stop(false).await {
                    warn!(container = %self.record.handle, error = %e, "Failed to stop container");
                }
                Err(Error::Cancelled)
            }
        }
    }

    /// Runs a script and returns its stdout.
    ///
    /// A recoverable script runs under a fixed process ID so a restarted
    /// scheduler re-attaches instead of running it twice, and its stdout is
    /// stored on the container so a completed run is never repeated.
    pub async fn run_script(
        &self,
        cancel: &CancellationToken,
        request: &ScriptRequest,
        recoverable: bool,
    ) -> Result<Vec<u8>> {
        if recoverable {
            if let Some(result) = self.runtime.property(RESULT_PROPERTY).await? {
                debug!(container = %self.record.handle, "Using stored script result");
                return Ok(result.into_bytes());
            }
        }

        let io = ProcessIo {
            stdin: request.stdin.clone(),
            stdout: OutputBuffer::new(),
            stderr: OutputBuffer::new(),
        };
        let spec = ProcessSpec {
            id: recoverable.then(|| RESOURCE_PROCESS_ID.to_string()),
            path: request.path.clone(),
            args: request.args.clone(),
            user: self.runtime.property(USER_PROPERTY).await?,
            ..Default::default()
        };

        let process = if recoverable {
            match self.runtime.attach(RESOURCE_PROCESS_ID, io.clone()).await {
                Ok(process) => {
                    info!(container = %self.record.handle, "Re-attached to running script");
                    process
                }
                Err(e) if matches!(e.root(), Error::ProcessNotFound(_)) => {
                    self.runtime.run(&spec, io.clone()).await?
                }
                Err(e) => return Err(e),
            }
        } else {
            self.runtime.run(&spec, io.clone()).await?
        };

        let status = self
            .wait(cancel, ReattachingProcess::new(self.runtime.clone(), process, io.clone()))
            .await?;
        if status != 0 {
            return Err(Error::ResourceScriptFailed {
                exit_status: status,
                stderr: io.stderr.text(),
            });
        }

        let stdout = io.stdout.contents();
        if recoverable {
            self.runtime
                .set_property(RESULT_PROPERTY, &String::from_utf8_lossy(&stdout))
                .await?;
        }
        Ok(stdout)
    }

    /// Stops every process in the container.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.runtime.stop(kill).await
    }

    /// All runtime properties.
    pub async fn properties(&self) -> Result<HashMap<String, String>> {
        self.runtime.properties().await
    }

    /// Sets a runtime property.
    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.runtime.set_property(name, value).await
    }

    /// Deletes the runtime container.
    pub async fn destroy(&self) -> Result<()> {
        self.client.destroy(&self.record.handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    use crate::client::mock::MockProcessOutcome;
    use crate::client::{MockRuntimeClient, RuntimeContainerSpec};
    use crate::persistence::record_state;

    fn container(runtime: &Arc<MockRuntimeClient>) -> Container {
        let mock = runtime.insert(RuntimeContainerSpec {
            handle: "c1".into(),
            ..Default::default()
        });
        let record = ContainerRecord {
            handle: "c1".into(),
            worker_name: "w1".into(),
            owner_key: "fixed:c1".into(),
            team_id: 1,
            state: record_state::CREATED.into(),
            metadata: Json(ContainerMetadata::default()),
            created_at: Utc::now(),
        };
        Container::new(record, mock, runtime.clone(), Vec::new())
    }

    fn script() -> ScriptRequest {
        ScriptRequest {
            path: "/opt/resource/in".into(),
            args: vec!["/tmp/build/get".into()],
            stdin: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_recoverable_result_is_replayed() {
        let runtime = Arc::new(MockRuntimeClient::new());
        runtime.set_process_handler(|_| MockProcessOutcome::success(r#"{"version":{"ref":"a"}}"#));
        let container = container(&runtime);
        let cancel = CancellationToken::new();

        let first = container.run_script(&cancel, &script(), true).await.unwrap();
        let second = container.run_script(&cancel, &script(), true).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(runtime.container("c1").unwrap().run_count(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let runtime = Arc::new(MockRuntimeClient::new());
        runtime.set_process_handler(|_| MockProcessOutcome::failure(2, "no such ref"));
        let container = container(&runtime);

        let err = container
            .run_script(&CancellationToken::new(), &script(), false)
            .await
            .unwrap_err();
        match err {
            Error::ResourceScriptFailed { exit_status, stderr } => {
                assert_eq!(exit_status, 2);
                assert_eq!(stderr, "no such ref");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_container() {
        let runtime = Arc::new(MockRuntimeClient::new());
        runtime.set_process_handler(|_| MockProcessOutcome {
            hang: true,
            ..Default::default()
        });
        let container = container(&runtime);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = container.run_script(&cancel, &script(), false).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(runtime.container("c1").unwrap().is_stopped());
    }
}
