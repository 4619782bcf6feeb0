// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory locks shared by every scheduler process.
//!
//! Locks are try-locks: `acquire` never blocks, callers decide how to retry.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::Result;

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockId {
    /// Fetching one resource version onto one worker.
    ResourceFetch(String),
    /// Provisioning one container record.
    ContainerCreating(String),
    /// Provisioning one volume record.
    VolumeCreating(String),
}

impl LockId {
    /// 64-bit advisory lock key.
    pub fn key(&self) -> i64 {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::ResourceFetch(name) => write!(f, "resource-fetch:{name}"),
            LockId::ContainerCreating(handle) => write!(f, "container-creating:{handle}"),
            LockId::VolumeCreating(handle) => write!(f, "volume-creating:{handle}"),
        }
    }
}

/// A held lock.
#[async_trait]
pub trait Lock: Send {
    /// Releases the lock. Dropping a lock also releases it.
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Hands out advisory locks.
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Attempts to take the lock. `None` means another holder has it.
    async fn acquire(&self, id: &LockId) -> Result<Option<Box<dyn Lock>>>;
}

/// In-process locks.
#[derive(Clone, Default)]
pub struct MemoryLockFactory {
    held: Arc<Mutex<HashSet<i64>>>,
}

impl MemoryLockFactory {
    /// Creates a factory with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the lock is currently held.
    pub fn is_held(&self, id: &LockId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id.key())
    }
}

struct MemoryLock {
    held: Arc<Mutex<HashSet<i64>>>,
    key: i64,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn release(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl LockFactory for MemoryLockFactory {
    async fn acquire(&self, id: &LockId) -> Result<Option<Box<dyn Lock>>> {
        let key = id.key();
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        if !inserted {
            debug!(lock = %id, "Lock already held");
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLock {
            held: self.held.clone(),
            key,
        })))
    }
}

/// PostgreSQL transaction-scoped advisory locks.
///
/// Each held lock pins one pooled connection inside an open transaction.
/// Committing or dropping the transaction releases the lock.
#[derive(Clone)]
pub struct PostgresLockFactory {
    pool: PgPool,
}

impl PostgresLockFactory {
    /// Create a lock factory over a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PostgresLock {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Lock for PostgresLock {
    async fn release(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LockFactory for PostgresLockFactory {
    async fn acquire(&self, id: &LockId) -> Result<Option<Box<dyn Lock>>> {
        let mut tx = self.pool.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(id.key())
            .fetch_one(&mut *tx)
            .await?;
        if !acquired {
            tx.rollback().await?;
            debug!(lock = %id, "Advisory lock already held");
            return Ok(None);
        }
        Ok(Some(Box::new(PostgresLock { tx })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lock_is_exclusive_until_released() {
        let locks = MemoryLockFactory::new();
        let id = LockId::ResourceFetch("git-abc".into());

        let held = locks.acquire(&id).await.unwrap().unwrap();
        assert!(locks.acquire(&id).await.unwrap().is_none());
        assert!(locks.is_held(&id));

        let other = LockId::VolumeCreating("git-abc".into());
        assert!(locks.acquire(&other).await.unwrap().is_some());

        held.release().await.unwrap();
        assert!(!locks.is_held(&id));
        assert!(locks.acquire(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_lock_released_on_drop() {
        let locks = MemoryLockFactory::new();
        let id = LockId::ContainerCreating("handle".into());
        {
            let _held = locks.acquire(&id).await.unwrap();
            assert!(locks.is_held(&id));
        }
        assert!(!locks.is_held(&id));
    }

    #[test]
    fn test_keys_differ_by_kind() {
        let a = LockId::ContainerCreating("x".into()).key();
        let b = LockId::VolumeCreating("x".into()).key();
        assert_ne!(a, b);
        assert_eq!(a, LockId::ContainerCreating("x".into()).key());
    }
}
