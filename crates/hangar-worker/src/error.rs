// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hangar-worker.

use thiserror::Error;

/// Reasons a worker cannot satisfy a [`WorkerSpec`](crate::spec::WorkerSpec).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Incompatibility {
    /// Worker belongs to a different team.
    #[error("worker belongs to team {worker_team}, requested team {requested_team}")]
    TeamMismatch {
        /// Team owning the worker.
        worker_team: i32,
        /// Team in the request.
        requested_team: i32,
    },

    /// Resource type does not resolve to a base type the worker provides.
    #[error("unsupported resource type: {0}")]
    UnsupportedResourceType(String),

    /// Worker platform differs from the requested one.
    #[error("platform mismatch: worker has {worker}, requested {requested}")]
    PlatformMismatch {
        /// Worker platform.
        worker: String,
        /// Requested platform.
        requested: String,
    },

    /// Requested tags are not a subset of the worker's tags.
    #[error("tag mismatch: worker tags {worker:?}, requested {requested:?}")]
    TagMismatch {
        /// Worker tags.
        worker: Vec<String>,
        /// Requested tags.
        requested: Vec<String>,
    },
}

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// No running, version-compatible workers are registered.
    #[error("no workers")]
    NoWorkers,

    /// Workers exist but none satisfy the requested spec.
    #[error("no workers satisfying: {spec}")]
    NoCompatibleWorkers {
        /// Human-readable description of the request.
        spec: String,
    },

    /// A worker cannot run the requested spec.
    #[error(transparent)]
    Incompatible(#[from] Incompatibility),

    /// The placement chain filtered out every candidate.
    #[error("no worker fit container placement strategy: {strategy}")]
    NoWorkerFitStrategy {
        /// Strategy chain that produced the empty ordering.
        strategy: String,
    },

    /// Admission rejected: active task cap reached.
    #[error("worker has too many active tasks")]
    TooManyActiveTasks,

    /// Admission rejected: active container cap reached.
    #[error("worker has too many containers")]
    TooManyActiveContainers,

    /// Admission rejected: active volume cap reached.
    #[error("worker has too many volumes")]
    TooManyActiveVolumes,

    /// Unknown placement strategy name.
    #[error("invalid container placement strategy: {0}")]
    InvalidStrategy(String),

    /// Worker is not registered.
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// A created container record has no runtime container behind it.
    #[error("container {handle} is missing from worker {worker}")]
    ContainerMissing {
        /// Container handle.
        handle: String,
        /// Worker name.
        worker: String,
    },

    /// A created volume record has no store volume behind it.
    #[error("volume {handle} is missing from worker {worker}")]
    VolumeMissing {
        /// Volume handle.
        handle: String,
        /// Worker name.
        worker: String,
    },

    /// Volume handle is unknown to the store.
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// Runtime process is unknown to the container.
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    /// File is absent from an artifact or archive.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Resource script exited non-zero.
    #[error("resource script failed with exit status {exit_status}: {stderr}")]
    ResourceScriptFailed {
        /// Exit status reported by the runtime.
        exit_status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// Connection to a worker collaborator dropped mid-call.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Worker collaborator returned an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed tar framing.
    #[error("invalid archive: {0}")]
    Archive(String),

    /// One or more close calls failed.
    #[error("close failed: {}", .0.join("; "))]
    Close(Vec<String>),

    /// Context-wrapped error.
    #[error("{context}: {source}")]
    Context {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps the error with a description of the failed operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for absent container, volume, process or file conditions.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::ContainerMissing { .. }
                | Error::VolumeMissing { .. }
                | Error::VolumeNotFound(_)
                | Error::ProcessNotFound(_)
                | Error::FileNotFound(_)
                | Error::WorkerNotFound(_)
        )
    }

    /// True for placement admission rejections.
    pub fn is_admission(&self) -> bool {
        matches!(
            self.root(),
            Error::TooManyActiveTasks | Error::TooManyActiveContainers | Error::TooManyActiveVolumes
        )
    }

    /// True when a worker cannot satisfy a spec.
    pub fn is_incompatible(&self) -> bool {
        matches!(self.root(), Error::Incompatible(_))
    }

    /// True when the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }
}

/// Result type using the worker [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Adds [`Error::context`] to results.
pub trait ResultExt<T> {
    /// Wraps the error, if any, with `context`.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wraps the error, if any, with a lazily built context.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_classification() {
        let err = Error::FileNotFound("a/b".into()).context("stream file");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "stream file: file not found: a/b");
    }

    #[test]
    fn test_admission_errors() {
        assert!(Error::TooManyActiveTasks.is_admission());
        assert!(!Error::Transport("boom".into()).is_admission());
    }

    #[test]
    fn test_close_errors_are_joined() {
        let err = Error::Close(vec!["decoder".into(), "transport".into()]);
        assert_eq!(err.to_string(), "close failed: decoder; transport");
    }
}
