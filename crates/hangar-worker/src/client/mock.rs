// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock worker clients for testing.
//!
//! In-memory container runtime and volume store. Containers run scripted
//! processes, volumes hold files in a map and speak real tar streams so
//! the streaming code paths are exercised end to end.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;
use uuid::Uuid;

use super::traits::*;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::persistence::WorkerRecord;
use crate::stream::{ByteStream, ReadStream, read_all};

/// Files keyed by path relative to the volume root.
pub type Files = BTreeMap<String, Vec<u8>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builds an uncompressed tar archive from `(path, contents)` entries.
pub fn tar_archive<P: AsRef<str>, C: AsRef<[u8]>>(entries: &[(P, C)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in entries {
        let contents = contents.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path.as_ref(), contents)?;
    }
    Ok(builder.into_inner()?)
}

fn untar(archive: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        out.push((normalize(&path), data));
    }
    Ok(out)
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn join(root: &str, name: &str) -> String {
    if root.is_empty() {
        name.to_string()
    } else {
        format!("{root}/{name}")
    }
}

fn select(files: &Files, path: &str) -> Vec<(String, Vec<u8>)> {
    let root = normalize(path);
    if root.is_empty() {
        return files.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    if let Some(contents) = files.get(&root) {
        let name = root.rsplit('/').next().unwrap_or(&root).to_string();
        return vec![(name, contents.clone())];
    }
    let prefix = format!("{root}/");
    files
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
        .collect()
}

// ============================================================================
// Runtime
// ============================================================================

/// Scripted result of a mock process.
#[derive(Debug, Clone, Default)]
pub struct MockProcessOutcome {
    /// Exit status returned by `wait`.
    pub exit_status: i32,
    /// Written to stdout when `wait` returns an exit status.
    pub stdout: Vec<u8>,
    /// Written to stderr when `wait` returns an exit status.
    pub stderr: Vec<u8>,
    /// Never exit until the container is stopped.
    pub hang: bool,
    /// Number of `wait` calls that fail with a lost connection first.
    pub connection_drops: usize,
}

impl MockProcessOutcome {
    /// Successful exit with the given stdout.
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failing exit with the given stderr.
    pub fn failure(exit_status: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_status,
            stderr: stderr.into(),
            ..Default::default()
        }
    }
}

type ProcessHandler = Arc<dyn Fn(&ProcessSpec) -> MockProcessOutcome + Send + Sync>;

struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

struct MockProcessState {
    id: String,
    outcome: MockProcessOutcome,
    drops_remaining: AtomicUsize,
    signals: Mutex<Vec<Signal>>,
}

struct MockProcess {
    state: Arc<MockProcessState>,
    stop: Arc<StopSignal>,
    io: ProcessIo,
}

#[async_trait]
impl Process for MockProcess {
    fn id(&self) -> String {
        self.state.id.clone()
    }

    async fn wait(&self) -> Result<i32> {
        let dropped = self
            .state
            .drops_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(Error::ConnectionLost("EOF".into()));
        }
        if self.state.outcome.hang {
            loop {
                let notified = self.stop.notify.notified();
                if self.stop.stopped.load(Ordering::SeqCst) {
                    return Ok(143);
                }
                notified.await;
            }
        }
        self.io.stdout.write(&self.state.outcome.stdout);
        self.io.stderr.write(&self.state.outcome.stderr);
        Ok(self.state.outcome.exit_status)
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        lock(&self.state.signals).push(signal);
        Ok(())
    }

    async fn set_tty(&self, _tty: TtySpec) -> Result<()> {
        Ok(())
    }
}

/// Container held by [`MockRuntimeClient`].
pub struct MockContainer {
    handle: String,
    spec: RuntimeContainerSpec,
    properties: Mutex<HashMap<String, String>>,
    processes: Mutex<HashMap<String, Arc<MockProcessState>>>,
    handler: ProcessHandler,
    stop: Arc<StopSignal>,
    runs: AtomicUsize,
    attaches: AtomicUsize,
}

impl MockContainer {
    /// The spec the container was created with.
    pub fn spec(&self) -> &RuntimeContainerSpec {
        &self.spec
    }

    /// Number of `run` calls.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of successful `attach` calls.
    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    /// Whether `stop` was called.
    pub fn is_stopped(&self) -> bool {
        self.stop.stopped.load(Ordering::SeqCst)
    }

    fn start(&self, state: &Arc<MockProcessState>, io: ProcessIo) -> Box<dyn Process> {
        Box::new(MockProcess {
            state: state.clone(),
            stop: self.stop.clone(),
            io,
        })
    }
}

#[async_trait]
impl RuntimeContainer for MockContainer {
    fn handle(&self) -> String {
        self.handle.clone()
    }

    async fn run(&self, spec: &ProcessSpec, io: ProcessIo) -> Result<Box<dyn Process>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.handler)(spec);
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let state = Arc::new(MockProcessState {
            id: id.clone(),
            drops_remaining: AtomicUsize::new(outcome.connection_drops),
            outcome,
            signals: Mutex::new(Vec::new()),
        });
        lock(&self.processes).insert(id, state.clone());
        Ok(self.start(&state, io))
    }

    async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Box<dyn Process>> {
        let state = lock(&self.processes)
            .get(process_id)
            .cloned()
            .ok_or_else(|| Error::ProcessNotFound(process_id.to_string()))?;
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(self.start(&state, io))
    }

    async fn stop(&self, _kill: bool) -> Result<()> {
        self.stop.stopped.store(true, Ordering::SeqCst);
        self.stop.notify.notify_waiters();
        Ok(())
    }

    async fn properties(&self) -> Result<HashMap<String, String>> {
        Ok(lock(&self.properties).clone())
    }

    async fn property(&self, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.properties).get(name).cloned())
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        lock(&self.properties).insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Mock container runtime.
pub struct MockRuntimeClient {
    containers: Mutex<HashMap<String, Arc<MockContainer>>>,
    handler: Mutex<ProcessHandler>,
    destroyed: Mutex<Vec<String>>,
    /// If true, `create` fails.
    pub fail_create: AtomicBool,
}

impl Default for MockRuntimeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntimeClient {
    /// Runtime whose processes exit 0 with no output.
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            handler: Mutex::new(Arc::new(|_| MockProcessOutcome::default())),
            destroyed: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
        }
    }

    /// Runtime whose `create` always fails.
    pub fn failing() -> Self {
        let client = Self::new();
        client.fail_create.store(true, Ordering::SeqCst);
        client
    }

    /// Scripts processes started in containers created from now on.
    pub fn set_process_handler<F>(&self, handler: F)
    where
        F: Fn(&ProcessSpec) -> MockProcessOutcome + Send + Sync + 'static,
    {
        *lock(&self.handler) = Arc::new(handler);
    }

    /// Container by handle.
    pub fn container(&self, handle: &str) -> Option<Arc<MockContainer>> {
        lock(&self.containers).get(handle).cloned()
    }

    /// Handles of every live container.
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<_> = lock(&self.containers).keys().cloned().collect();
        handles.sort();
        handles
    }

    /// Handles passed to `destroy`.
    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.destroyed).clone()
    }

    /// Removes a container behind the scheduler's back.
    pub fn forget(&self, handle: &str) {
        lock(&self.containers).remove(handle);
    }

    /// Inserts a container without going through `create`.
    pub fn insert(&self, spec: RuntimeContainerSpec) -> Arc<MockContainer> {
        let container = Arc::new(MockContainer {
            handle: spec.handle.clone(),
            properties: Mutex::new(spec.properties.clone()),
            spec,
            processes: Mutex::new(HashMap::new()),
            handler: lock(&self.handler).clone(),
            stop: Arc::new(StopSignal {
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            runs: AtomicUsize::new(0),
            attaches: AtomicUsize::new(0),
        });
        lock(&self.containers).insert(container.handle.clone(), container.clone());
        container
    }
}

#[async_trait]
impl RuntimeClient for MockRuntimeClient {
    async fn create(&self, spec: RuntimeContainerSpec) -> Result<Arc<dyn RuntimeContainer>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Transport("runtime refused to create container".into()));
        }
        Ok(self.insert(spec))
    }

    async fn lookup(&self, handle: &str) -> Result<Option<Arc<dyn RuntimeContainer>>> {
        Ok(self
            .container(handle)
            .map(|c| c as Arc<dyn RuntimeContainer>))
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        lock(&self.containers).remove(handle);
        lock(&self.destroyed).push(handle.to_string());
        Ok(())
    }

    async fn containers(
        &self,
        properties: &HashMap<String, String>,
    ) -> Result<Vec<Arc<dyn RuntimeContainer>>> {
        let containers: Vec<Arc<MockContainer>> = lock(&self.containers).values().cloned().collect();
        Ok(containers
            .into_iter()
            .filter(|c| {
                let props = lock(&c.properties);
                properties.iter().all(|(k, v)| props.get(k) == Some(v))
            })
            .map(|c| c as Arc<dyn RuntimeContainer>)
            .collect())
    }
}

// ============================================================================
// Volumes
// ============================================================================

#[derive(Clone)]
struct P2pTarget {
    files: Arc<Mutex<Files>>,
    path: String,
    calls: Arc<Mutex<Vec<String>>>,
}

/// Shared registry resolving P2P URLs between mock volume stores.
#[derive(Clone, Default)]
pub struct P2pNetwork(Arc<Mutex<HashMap<String, P2pTarget>>>);

struct MockStream {
    inner: Cursor<Vec<u8>>,
    fail_close: bool,
    closed: Arc<AtomicBool>,
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

#[async_trait]
impl ReadStream for MockStream {
    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(Error::Transport("stream close failed".into()));
        }
        Ok(())
    }
}

/// Volume held by [`MockVolumeClient`].
pub struct MockVolume {
    handle: String,
    path: String,
    files: Arc<Mutex<Files>>,
    properties: Mutex<HashMap<String, String>>,
    privileged: AtomicBool,
    calls: Arc<Mutex<Vec<String>>>,
    p2p: bool,
    network: P2pNetwork,
    fail_stream_close: Arc<AtomicBool>,
    closed_streams: Arc<AtomicBool>,
}

impl MockVolume {
    /// Snapshot of the volume's files.
    pub fn files(&self) -> Files {
        lock(&self.files).clone()
    }

    /// Writes a file relative to the volume root.
    pub fn write_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        lock(&self.files).insert(normalize(path), contents.into());
    }

    /// Streaming calls received, e.g. `stream_out:.`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Current privilege flag.
    pub fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::SeqCst)
    }

    /// Whether a stream produced by this volume has been closed.
    pub fn stream_closed(&self) -> bool {
        self.closed_streams.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl RemoteVolume for MockVolume {
    fn handle(&self) -> String {
        self.handle.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    async fn properties(&self) -> Result<HashMap<String, String>> {
        Ok(lock(&self.properties).clone())
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        lock(&self.properties).insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn set_privileged(&self, privileged: bool) -> Result<()> {
        self.privileged.store(privileged, Ordering::SeqCst);
        Ok(())
    }

    async fn stream_in(
        &self,
        path: &str,
        compression: Compression,
        mut stream: ByteStream,
    ) -> Result<()> {
        self.record(format!("stream_in:{path}"));
        let read = read_all(&mut stream).await;
        let closed = stream.close().await;
        let compressed = read?;
        closed?;
        let raw = compression.decompress(compressed).await?;
        let entries = untar(&raw)?;
        let root = normalize(path);
        let mut files = lock(&self.files);
        for (name, data) in entries {
            files.insert(join(&root, &name), data);
        }
        Ok(())
    }

    async fn stream_out(&self, path: &str, compression: Compression) -> Result<ByteStream> {
        self.record(format!("stream_out:{path}"));
        let entries = select(&lock(&self.files), path);
        let archive = tar_archive(&entries)?;
        let compressed = compression.compress(&archive).await?;
        Ok(Box::new(MockStream {
            inner: Cursor::new(compressed),
            fail_close: self.fail_stream_close.load(Ordering::SeqCst),
            closed: self.closed_streams.clone(),
        }))
    }

    fn supports_p2p(&self) -> bool {
        self.p2p
    }

    async fn get_stream_in_p2p_url(&self, path: &str) -> Result<String> {
        self.record(format!("p2p_url:{path}"));
        if !self.p2p {
            return Err(Error::Transport("p2p streaming not supported".into()));
        }
        let url = format!("p2p://{}/{}", self.handle, Uuid::new_v4());
        lock(&self.network.0).insert(
            url.clone(),
            P2pTarget {
                files: self.files.clone(),
                path: normalize(path),
                calls: self.calls.clone(),
            },
        );
        Ok(url)
    }

    async fn stream_p2p_out(&self, path: &str, url: &str, compression: Compression) -> Result<()> {
        self.record(format!("p2p_out:{path}"));
        let target = lock(&self.network.0)
            .remove(url)
            .ok_or_else(|| Error::Transport(format!("unknown p2p url {url}")))?;
        let entries = select(&lock(&self.files), path);
        let archive = tar_archive(&entries)?;
        let wire = compression.compress(&archive).await?;
        let received = untar(&compression.decompress(wire).await?)?;
        lock(&target.calls).push(format!("p2p_in:{}", target.path));
        let mut files = lock(&target.files);
        for (name, data) in received {
            files.insert(join(&target.path, &name), data);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        lock(&self.files).clear();
        Ok(())
    }
}

/// Mock volume store.
pub struct MockVolumeClient {
    volumes: Mutex<HashMap<String, Arc<MockVolume>>>,
    imports: Mutex<HashMap<String, Files>>,
    specs: Mutex<HashMap<String, VolumeSpec>>,
    network: P2pNetwork,
    p2p: bool,
    /// If true, `create_volume` fails.
    pub fail_create: AtomicBool,
    fail_stream_close: Arc<AtomicBool>,
}

impl Default for MockVolumeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVolumeClient {
    /// Store without P2P support.
    pub fn new() -> Self {
        Self::with_network(P2pNetwork::default(), false)
    }

    /// Store attached to a P2P network.
    pub fn with_network(network: P2pNetwork, p2p: bool) -> Self {
        Self {
            volumes: Mutex::new(HashMap::new()),
            imports: Mutex::new(HashMap::new()),
            specs: Mutex::new(HashMap::new()),
            network,
            p2p,
            fail_create: AtomicBool::new(false),
            fail_stream_close: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes streams produced from now on fail to close.
    pub fn fail_stream_close(&self) {
        self.fail_stream_close.store(true, Ordering::SeqCst);
    }

    /// Registers host files returned by the import strategy.
    pub fn add_import(&self, path: &str, files: Files) {
        lock(&self.imports).insert(path.to_string(), files);
    }

    /// Volume by handle.
    pub fn volume(&self, handle: &str) -> Option<Arc<MockVolume>> {
        lock(&self.volumes).get(handle).cloned()
    }

    /// Spec a volume was created with.
    pub fn spec(&self, handle: &str) -> Option<VolumeSpec> {
        lock(&self.specs).get(handle).cloned()
    }

    /// Number of live volumes.
    pub fn len(&self) -> usize {
        lock(&self.volumes).len()
    }

    /// True when the store holds no volumes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a volume behind the scheduler's back.
    pub fn forget(&self, handle: &str) {
        lock(&self.volumes).remove(handle);
    }

    /// Inserts an empty volume without going through `create_volume`.
    pub fn insert(&self, handle: &str) -> Arc<MockVolume> {
        self.build(handle, Files::new(), false)
    }

    fn build(&self, handle: &str, files: Files, privileged: bool) -> Arc<MockVolume> {
        let volume = Arc::new(MockVolume {
            handle: handle.to_string(),
            path: format!("/volumes/live/{handle}/volume"),
            files: Arc::new(Mutex::new(files)),
            properties: Mutex::new(HashMap::new()),
            privileged: AtomicBool::new(privileged),
            calls: Arc::new(Mutex::new(Vec::new())),
            p2p: self.p2p,
            network: self.network.clone(),
            fail_stream_close: self.fail_stream_close.clone(),
            closed_streams: Arc::new(AtomicBool::new(false)),
        });
        lock(&self.volumes).insert(handle.to_string(), volume.clone());
        volume
    }
}

#[async_trait]
impl VolumeClient for MockVolumeClient {
    async fn create_volume(&self, handle: &str, spec: VolumeSpec) -> Result<Arc<dyn RemoteVolume>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Transport("volume store refused to create volume".into()));
        }
        let files = match &spec.strategy {
            VolumeStrategy::Empty => Files::new(),
            VolumeStrategy::Import { path, .. } => {
                lock(&self.imports).get(path).cloned().unwrap_or_default()
            }
            VolumeStrategy::CopyOnWrite { parent } => self
                .volume(parent)
                .ok_or_else(|| Error::VolumeNotFound(parent.clone()))?
                .files(),
        };
        let volume = self.build(handle, files, spec.privileged);
        *lock(&volume.properties) = spec.properties.clone();
        lock(&self.specs).insert(handle.to_string(), spec);
        Ok(volume)
    }

    async fn lookup_volume(&self, handle: &str) -> Result<Option<Arc<dyn RemoteVolume>>> {
        Ok(self.volume(handle).map(|v| v as Arc<dyn RemoteVolume>))
    }

    async fn list_volumes(
        &self,
        properties: &HashMap<String, String>,
    ) -> Result<Vec<Arc<dyn RemoteVolume>>> {
        let volumes: Vec<Arc<MockVolume>> = lock(&self.volumes).values().cloned().collect();
        Ok(volumes
            .into_iter()
            .filter(|v| {
                let props = lock(&v.properties);
                properties.iter().all(|(k, val)| props.get(k) == Some(val))
            })
            .map(|v| v as Arc<dyn RemoteVolume>)
            .collect())
    }

    async fn destroy_volume(&self, handle: &str) -> Result<()> {
        lock(&self.volumes).remove(handle);
        Ok(())
    }
}

// ============================================================================
// Fleet
// ============================================================================

/// Hands out one mock runtime and volume store per worker name.
#[derive(Default)]
pub struct MockWorkerClients {
    runtimes: Mutex<HashMap<String, Arc<MockRuntimeClient>>>,
    volumes: Mutex<HashMap<String, Arc<MockVolumeClient>>>,
    network: P2pNetwork,
    p2p: bool,
}

impl MockWorkerClients {
    /// Fleet without P2P support.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fleet whose volume stores can reach each other directly.
    pub fn with_p2p() -> Self {
        Self {
            p2p: true,
            ..Self::default()
        }
    }

    /// Runtime of the named worker, created on first use.
    pub fn runtime_for(&self, worker: &str) -> Arc<MockRuntimeClient> {
        lock(&self.runtimes)
            .entry(worker.to_string())
            .or_insert_with(|| Arc::new(MockRuntimeClient::new()))
            .clone()
    }

    /// Volume store of the named worker, created on first use.
    pub fn volumes_for(&self, worker: &str) -> Arc<MockVolumeClient> {
        lock(&self.volumes)
            .entry(worker.to_string())
            .or_insert_with(|| {
                Arc::new(MockVolumeClient::with_network(self.network.clone(), self.p2p))
            })
            .clone()
    }

    /// Replaces the named worker's volume store with an empty one on the
    /// shared network, with or without P2P support.
    pub fn set_volume_p2p(&self, worker: &str, p2p: bool) -> Arc<MockVolumeClient> {
        let volumes = Arc::new(MockVolumeClient::with_network(self.network.clone(), p2p));
        lock(&self.volumes).insert(worker.to_string(), volumes.clone());
        volumes
    }

    /// Replaces the named worker's runtime.
    pub fn set_runtime(&self, worker: &str, runtime: MockRuntimeClient) -> Arc<MockRuntimeClient> {
        let runtime = Arc::new(runtime);
        lock(&self.runtimes).insert(worker.to_string(), runtime.clone());
        runtime
    }
}

impl WorkerClients for MockWorkerClients {
    fn runtime(&self, worker: &WorkerRecord) -> Arc<dyn RuntimeClient> {
        self.runtime_for(&worker.name)
    }

    fn volumes(&self, worker: &WorkerRecord) -> Arc<dyn VolumeClient> {
        self.volumes_for(&worker.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_out_single_file_and_directory() {
        let client = MockVolumeClient::new();
        let volume = client.insert("v1");
        volume.write_file("out/a.txt", "a");
        volume.write_file("out/b/c.txt", "c");

        let stream = volume.stream_out("out/a.txt", Compression::Raw).await.unwrap();
        let dst = client.insert("v2");
        dst.stream_in("copy", Compression::Raw, stream).await.unwrap();
        assert_eq!(dst.files().get("copy/a.txt").unwrap(), b"a");

        let stream = volume.stream_out("out", Compression::Gzip).await.unwrap();
        dst.stream_in(".", Compression::Gzip, stream).await.unwrap();
        assert_eq!(dst.files().get("b/c.txt").unwrap(), b"c");
    }

    #[tokio::test]
    async fn test_copy_on_write_copies_parent_files() {
        let client = MockVolumeClient::new();
        client.insert("parent").write_file("x", "1");
        let child = client
            .create_volume(
                "child",
                VolumeSpec::new(VolumeStrategy::CopyOnWrite {
                    parent: "parent".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(child.handle(), "child");
        assert_eq!(client.volume("child").unwrap().files().get("x").unwrap(), b"1");

        let missing = client
            .create_volume(
                "orphan",
                VolumeSpec::new(VolumeStrategy::CopyOnWrite {
                    parent: "nope".into(),
                }),
            )
            .await;
        assert!(matches!(missing, Err(Error::VolumeNotFound(_))));
    }

    #[tokio::test]
    async fn test_process_drops_connection_then_exits() {
        let runtime = MockRuntimeClient::new();
        runtime.set_process_handler(|_| MockProcessOutcome {
            exit_status: 3,
            connection_drops: 1,
            ..Default::default()
        });
        let container = runtime.insert(RuntimeContainerSpec {
            handle: "c1".into(),
            ..Default::default()
        });
        let spec = ProcessSpec {
            id: Some("p".into()),
            path: "/bin/true".into(),
            ..Default::default()
        };
        let process = container.run(&spec, ProcessIo::default()).await.unwrap();
        assert!(matches!(process.wait().await, Err(Error::ConnectionLost(_))));
        assert_eq!(process.wait().await.unwrap(), 3);

        let err = container.attach("other", ProcessIo::default()).await;
        assert!(matches!(err, Err(Error::ProcessNotFound(_))));
    }
}
