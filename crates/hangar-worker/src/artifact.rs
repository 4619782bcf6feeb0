// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named artifacts produced by build steps.
//!
//! An [`ArtifactRepository`] maps artifact names to sources. A source knows
//! how to stream itself into a destination, open a single file, and tell
//! whether it already lives on a given worker so that placement can favour
//! that worker and provisioning can skip the copy.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::stream::ByteStream;
use crate::streamer::{FileStream, Streamer};
use crate::volume::Volume;
use crate::worker::Worker;

/// Name an artifact is registered under.
pub type ArtifactName = String;

/// Something that can receive a tar stream.
#[async_trait]
pub trait ArtifactDestination: Send + Sync {
    /// Extracts a compressed tar stream under `path`. Takes ownership of
    /// the stream and closes it.
    async fn stream_in(&self, path: &str, compression: Compression, stream: ByteStream) -> Result<()>;

    /// Whether a source can push to this destination directly.
    fn supports_p2p(&self) -> bool {
        false
    }

    /// URL a source can push `path` to.
    async fn get_stream_in_p2p_url(&self, path: &str) -> Result<String>;
}

/// Bits produced by a step.
#[async_trait]
pub trait ArtifactSource: fmt::Debug + Send + Sync {
    /// Streams the whole artifact into `dest`.
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()>;

    /// Opens one file of the artifact.
    async fn stream_file(&self, path: &str) -> Result<FileStream>;

    /// The volume holding this artifact on `worker`, if any.
    async fn exists_on(&self, worker: &Worker) -> Result<Option<Volume>>;

    /// Resource cache the artifact holds, if any.
    fn resource_cache_id(&self) -> Option<i64> {
        None
    }
}

#[async_trait]
impl ArtifactDestination for Volume {
    async fn stream_in(&self, path: &str, compression: Compression, stream: ByteStream) -> Result<()> {
        Volume::stream_in(self, path, compression, stream).await
    }

    fn supports_p2p(&self) -> bool {
        Volume::supports_p2p(self)
    }

    async fn get_stream_in_p2p_url(&self, path: &str) -> Result<String> {
        Volume::get_stream_in_p2p_url(self, path).await
    }
}

/// A destination rooted at a subdirectory of another destination.
pub struct Subdirectory<'a> {
    dest: &'a dyn ArtifactDestination,
    dir: String,
}

impl<'a> Subdirectory<'a> {
    /// Wraps `dest` so every path lands under `dir`.
    pub fn new(dest: &'a dyn ArtifactDestination, dir: impl Into<String>) -> Self {
        Self {
            dest,
            dir: dir.into(),
        }
    }

    fn join(&self, path: &str) -> String {
        match path {
            "" | "." => self.dir.clone(),
            p => format!("{}/{}", self.dir, p),
        }
    }
}

#[async_trait]
impl ArtifactDestination for Subdirectory<'_> {
    async fn stream_in(&self, path: &str, compression: Compression, stream: ByteStream) -> Result<()> {
        self.dest.stream_in(&self.join(path), compression, stream).await
    }

    fn supports_p2p(&self) -> bool {
        self.dest.supports_p2p()
    }

    async fn get_stream_in_p2p_url(&self, path: &str) -> Result<String> {
        self.dest.get_stream_in_p2p_url(&self.join(path)).await
    }
}

/// An artifact backed by a volume on some worker.
#[derive(Debug, Clone)]
pub struct VolumeArtifactSource {
    volume: Volume,
    streamer: Streamer,
}

impl VolumeArtifactSource {
    /// Wraps `volume`.
    pub fn new(volume: Volume, streamer: Streamer) -> Self {
        Self { volume, streamer }
    }

    /// The backing volume.
    pub fn volume(&self) -> &Volume {
        &self.volume
    }
}

#[async_trait]
impl ArtifactSource for VolumeArtifactSource {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()> {
        self.streamer.stream(&self.volume, dest).await
    }

    async fn stream_file(&self, path: &str) -> Result<FileStream> {
        self.streamer.stream_file(&self.volume, path).await
    }

    async fn exists_on(&self, worker: &Worker) -> Result<Option<Volume>> {
        if self.volume.worker_name() == worker.name() {
            return Ok(Some(self.volume.clone()));
        }
        match self.volume.resource_cache_id() {
            Some(id) => worker.find_volume_for_resource_cache(id).await,
            None => Ok(None),
        }
    }

    fn resource_cache_id(&self) -> Option<i64> {
        self.volume.resource_cache_id()
    }
}

/// Artifacts registered during a build, keyed by name.
#[derive(Default)]
pub struct ArtifactRepository {
    sources: RwLock<HashMap<ArtifactName, Arc<dyn ArtifactSource>>>,
}

impl fmt::Debug for ArtifactRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<ArtifactName> = self.as_map().into_keys().collect();
        f.debug_struct("ArtifactRepository")
            .field("artifacts", &names)
            .finish()
    }
}

impl ArtifactRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` under `name`, replacing any earlier source.
    pub fn register_source(&self, name: impl Into<ArtifactName>, source: Arc<dyn ArtifactSource>) {
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), source);
    }

    /// Source registered under `name`.
    pub fn source_for(&self, name: &str) -> Option<Arc<dyn ArtifactSource>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Copy of every registration.
    pub fn as_map(&self) -> HashMap<ArtifactName, Arc<dyn ArtifactSource>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Streams every artifact into a subdirectory of `dest` named after it.
    pub async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()> {
        let mut sources: Vec<_> = self.as_map().into_iter().collect();
        sources.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, source) in sources {
            debug!(artifact = %name, "Streaming artifact");
            source.stream_to(&Subdirectory::new(dest, name)).await?;
        }
        Ok(())
    }

    /// Opens `<artifact>/<path>`.
    pub async fn stream_file(&self, path: &str) -> Result<FileStream> {
        let (name, rest) = path.split_once('/').unwrap_or((path, ""));
        if rest.is_empty() {
            return Err(Error::FileNotFound(path.to_string()));
        }
        let source = self
            .source_for(name)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;
        source.stream_file(rest).await
    }
}
