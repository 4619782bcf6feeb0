// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request values describing where and how a step's container runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactSource;
use crate::container::BindMountSource;

/// Requirements a worker must meet to run a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Required platform, `None` for any.
    pub platform: Option<String>,
    /// Resource type the container runs, possibly a custom type.
    pub resource_type: Option<String>,
    /// Tags the worker must carry.
    pub tags: Vec<String>,
    /// Requesting team. Zero means no team.
    pub team_id: i32,
    /// Custom resource types visible to the step.
    pub resource_types: Vec<ResourceTypeDefinition>,
}

impl fmt::Display for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(platform) = &self.platform {
            parts.push(format!("platform '{platform}'"));
        }
        if let Some(rt) = &self.resource_type {
            parts.push(format!("resource type '{rt}'"));
        }
        if !self.tags.is_empty() {
            parts.push(format!("tags '{}'", self.tags.join(", ")));
        }
        if self.team_id != 0 {
            parts.push(format!("team {}", self.team_id));
        }
        if parts.is_empty() {
            f.write_str("any worker")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// A custom resource type defined in terms of another type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeDefinition {
    /// Name steps refer to.
    pub name: String,
    /// Type this one is built on.
    #[serde(rename = "type")]
    pub parent: String,
}

impl ResourceTypeDefinition {
    /// Defines `name` on top of `parent`.
    pub fn new(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: parent.into(),
        }
    }
}

/// Kind of step a container serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    /// Resource check.
    Check,
    /// Resource get.
    Get,
    /// Resource put.
    Put,
    /// Build task.
    #[default]
    Task,
    /// One-off run step.
    Run,
}

impl ContainerType {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Check => "check",
            ContainerType::Get => "get",
            ContainerType::Put => "put",
            ContainerType::Task => "task",
            ContainerType::Run => "run",
        }
    }
}

/// Descriptive data stored with a container record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Kind of step.
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    /// Step name within the plan.
    #[serde(default)]
    pub step_name: String,
    /// Working directory inside the container.
    #[serde(default)]
    pub working_directory: String,
    /// Owning job, when run as part of one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i32>,
    /// Owning build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<i64>,
}

/// Identity of whoever a container is created for.
///
/// A `(team, owner)` pair maps to at most one live container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ContainerOwner {
    /// A step of a build plan.
    BuildStep {
        /// Build.
        build_id: i64,
        /// Plan node.
        plan_id: String,
        /// Team running the build.
        team_id: i32,
    },
    /// A periodic resource check.
    ResourceCheck {
        /// Resource config being checked.
        resource_config_id: i64,
        /// Team, zero for shared checks.
        team_id: i32,
    },
    /// A container with a caller-chosen handle.
    FixedHandle {
        /// Handle.
        handle: String,
        /// Team.
        team_id: i32,
    },
}

impl ContainerOwner {
    /// Stable key used to find containers for this owner.
    pub fn key(&self) -> String {
        match self {
            ContainerOwner::BuildStep {
                build_id, plan_id, ..
            } => format!("build-step:{build_id}:{plan_id}"),
            ContainerOwner::ResourceCheck {
                resource_config_id,
                ..
            } => format!("resource-check:{resource_config_id}"),
            ContainerOwner::FixedHandle { handle, .. } => format!("fixed:{handle}"),
        }
    }

    /// Team the owner belongs to.
    pub fn team_id(&self) -> i32 {
        match self {
            ContainerOwner::BuildStep { team_id, .. }
            | ContainerOwner::ResourceCheck { team_id, .. }
            | ContainerOwner::FixedHandle { team_id, .. } => *team_id,
        }
    }
}

impl fmt::Display for ContainerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Where a container's root filesystem comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Registry image URL handed to the runtime as is.
    Registry {
        /// Image URL, e.g. `docker:///busybox`.
        url: String,
    },
    /// Image produced by an earlier step; holds `rootfs/` and `metadata.json`.
    Artifact {
        /// Artifact containing the image.
        source: Arc<dyn ArtifactSource>,
    },
    /// Root filesystem URL handed to the runtime as is.
    RawUrl {
        /// Root filesystem URL.
        url: String,
    },
    /// Image shipped with the worker for a base resource type.
    BaseResourceType {
        /// Base resource type name.
        name: String,
    },
}

/// Image selection plus privilege request.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Root filesystem source.
    pub source: ImageSource,
    /// Run the container privileged.
    pub privileged: bool,
}

impl ImageSpec {
    /// Unprivileged image from a registry URL.
    pub fn registry(url: impl Into<String>) -> Self {
        Self {
            source: ImageSource::Registry { url: url.into() },
            privileged: false,
        }
    }

    /// Unprivileged image for a worker-provided base resource type.
    pub fn base_resource_type(name: impl Into<String>) -> Self {
        Self {
            source: ImageSource::BaseResourceType { name: name.into() },
            privileged: false,
        }
    }
}

/// An artifact to place at a path inside the container.
#[derive(Debug, Clone)]
pub struct InputSource {
    /// Where the bytes come from.
    pub artifact: Arc<dyn ArtifactSource>,
    /// Absolute mount path inside the container.
    pub destination_path: String,
}

/// Optional resource limits. `None` leaves the runtime default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimits {
    /// CPU shares.
    pub cpu: Option<u64>,
    /// Memory in bytes.
    pub memory: Option<u64>,
}

/// Everything needed to provision a step's container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Requesting team.
    pub team_id: i32,
    /// Kind of step; placement limits only count tasks.
    pub container_type: ContainerType,
    /// Job whose task caches the container uses.
    pub job_id: Option<i32>,
    /// Step name, part of the task cache key.
    pub step_name: String,
    /// Root filesystem.
    pub image: ImageSpec,
    /// `KEY=value` pairs layered over the image's environment.
    pub env: Vec<String>,
    /// Working directory.
    pub dir: String,
    /// Inputs in declaration order.
    pub inputs: Vec<InputSource>,
    /// Output name to mount path.
    pub outputs: BTreeMap<String, String>,
    /// Task cache paths, relative to `dir` unless absolute.
    pub caches: Vec<String>,
    /// Resource limits.
    pub limits: ContainerLimits,
    /// Extra mounts resolved per worker.
    pub bind_mounts: Vec<Arc<dyn BindMountSource>>,
    /// Process user override.
    pub user: Option<String>,
}

impl ContainerSpec {
    /// Spec with only an image and working directory set.
    pub fn new(team_id: i32, image: ImageSpec, dir: impl Into<String>) -> Self {
        Self {
            team_id,
            container_type: ContainerType::Task,
            job_id: None,
            step_name: String::new(),
            image,
            env: Vec::new(),
            dir: dir.into(),
            inputs: Vec::new(),
            outputs: BTreeMap::new(),
            caches: Vec::new(),
            limits: ContainerLimits::default(),
            bind_mounts: Vec::new(),
            user: None,
        }
    }

    /// Task cache key for a declared cache path, if the container runs
    /// as part of a job.
    pub fn task_cache_key(&self, path: &str) -> Option<crate::persistence::TaskCacheKey> {
        self.job_id.map(|job_id| crate::persistence::TaskCacheKey {
            job_id,
            step_name: self.step_name.clone(),
            path: path.to_string(),
        })
    }
}

/// Lexically normalizes an absolute container path.
///
/// Collapses repeated separators, `.` and `..` so that `/a/./b/` and
/// `/a/b` compare equal.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Joins `path` onto `dir` unless it is already absolute.
pub fn resolve_path(dir: &str, path: &str) -> String {
    if path.starts_with('/') {
        clean_path(path)
    } else {
        clean_path(&format!("{dir}/{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/tmp/build/"), "/tmp/build");
        assert_eq!(clean_path("/tmp//build/./x/../y"), "/tmp/build/y");
        assert_eq!(clean_path("/"), "/");
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/tmp/build", "cache"), "/tmp/build/cache");
        assert_eq!(resolve_path("/tmp/build", "/abs/cache"), "/abs/cache");
    }

    #[test]
    fn test_owner_keys_are_distinct() {
        let step = ContainerOwner::BuildStep {
            build_id: 7,
            plan_id: "plan-1".into(),
            team_id: 2,
        };
        let check = ContainerOwner::ResourceCheck {
            resource_config_id: 7,
            team_id: 0,
        };
        assert_eq!(step.key(), "build-step:7:plan-1");
        assert_ne!(step.key(), check.key());
        assert_eq!(step.team_id(), 2);
    }

    #[test]
    fn test_worker_spec_description() {
        let spec = WorkerSpec {
            platform: Some("linux".into()),
            tags: vec!["gpu".into()],
            ..Default::default()
        };
        assert_eq!(spec.to_string(), "platform 'linux', tags 'gpu'");
        assert_eq!(WorkerSpec::default().to_string(), "any worker");
    }
}
