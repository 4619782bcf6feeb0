// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker version compatibility.

use std::fmt;
use std::str::FromStr;

/// Semantic version advertised by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerVersion {
    /// Breaking-change component.
    pub major: u64,
    /// Feature component.
    pub minor: u64,
    /// Fix component.
    pub patch: u64,
}

impl WorkerVersion {
    /// Creates a version from its components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// A worker at `self` can serve callers requiring `required` when the
    /// major versions match and its minor version is at least the required one.
    pub fn is_compatible_with(&self, required: &WorkerVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

impl fmt::Display for WorkerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version string was not `major[.minor[.patch]]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version: {0}")]
pub struct ParseVersionError(String);

impl FromStr for WorkerVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |required: bool| -> Result<u64, ParseVersionError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| ParseVersionError(s.to_string())),
                None if required => Err(ParseVersionError(s.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        Ok(Self::new(major, minor, patch))
    }
}
