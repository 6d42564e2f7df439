//! Namespace-scoped mutual exclusion for balancer commands.
//!
//! Migrations hold the collection lock from dispatch until the remote reply
//! arrives. The guard returned by [`ScopedDistLock::acquire`] releases on drop,
//! so every exit path of a request (success, failure, drain, abort) gives the
//! lock back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::SchedulerError;

/// Acquisition timeout meaning "try once, do not wait".
pub const SINGLE_LOCK_ATTEMPT_TIMEOUT: Duration = Duration::ZERO;

/// Ownership grant over one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub resource: String,
    pub lock_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock {resource} is held by another owner")]
    Busy { resource: String },
    #[error("lock service unavailable for {resource}: {message}")]
    Unavailable { resource: String, message: String },
}

impl LockError {
    pub fn resource(&self) -> &str {
        match self {
            LockError::Busy { resource } | LockError::Unavailable { resource, .. } => resource,
        }
    }
}

impl From<LockError> for SchedulerError {
    fn from(err: LockError) -> Self {
        SchedulerError::LockBusy {
            resource: err.resource().to_string(),
        }
    }
}

/// Lock coordinator seam.
#[async_trait]
pub trait DistLockManager: Send + Sync + 'static {
    /// Try to take `resource`, waiting at most `wait_for`.
    async fn lock(&self, resource: &str, why: &str, wait_for: Duration)
        -> Result<LockToken, LockError>;

    /// Idempotent: releasing a token that no longer owns the resource is a no-op.
    fn unlock(&self, token: &LockToken);
}

/// Held lock; released when dropped.
pub struct ScopedDistLock {
    manager: Arc<dyn DistLockManager>,
    token: Option<LockToken>,
}

impl ScopedDistLock {
    pub async fn acquire(
        manager: Arc<dyn DistLockManager>,
        resource: &str,
        why: &str,
        wait_for: Duration,
    ) -> Result<Self, LockError> {
        let token = manager.lock(resource, why, wait_for).await?;
        Ok(Self {
            manager,
            token: Some(token),
        })
    }

    pub fn resource(&self) -> &str {
        self.token
            .as_ref()
            .map(|token| token.resource.as_str())
            .unwrap_or_default()
    }

    pub fn release(mut self) {
        self.unlock_now();
    }

    fn unlock_now(&mut self) {
        if let Some(token) = self.token.take() {
            self.manager.unlock(&token);
            tracing::trace!(
                resource = %token.resource,
                lock_id = token.lock_id,
                "released dist lock"
            );
        }
    }
}

impl Drop for ScopedDistLock {
    fn drop(&mut self) {
        self.unlock_now();
    }
}

impl std::fmt::Debug for ScopedDistLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedDistLock")
            .field("token", &self.token)
            .finish()
    }
}

#[derive(Debug)]
struct Holder {
    lock_id: u64,
    why: String,
}

/// In-process lock table. Suitable when a single balancer owns the cluster.
#[derive(Default)]
pub struct LocalDistLockManager {
    holders: Mutex<HashMap<String, Holder>>,
    released: Notify,
    next_id: AtomicU64,
}

impl LocalDistLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.holders.lock().unwrap().contains_key(resource)
    }

    /// Reason recorded by the current holder, if any.
    pub fn holder_reason(&self, resource: &str) -> Option<String> {
        self.holders
            .lock()
            .unwrap()
            .get(resource)
            .map(|holder| holder.why.clone())
    }

    fn try_lock(&self, resource: &str, why: &str) -> Option<LockToken> {
        let mut holders = self.holders.lock().unwrap();
        if holders.contains_key(resource) {
            return None;
        }
        let lock_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        holders.insert(
            resource.to_string(),
            Holder {
                lock_id,
                why: why.to_string(),
            },
        );
        Some(LockToken {
            resource: resource.to_string(),
            lock_id,
        })
    }
}

#[async_trait]
impl DistLockManager for LocalDistLockManager {
    async fn lock(
        &self,
        resource: &str,
        why: &str,
        wait_for: Duration,
    ) -> Result<LockToken, LockError> {
        let deadline = Instant::now() + wait_for;
        loop {
            // Register for wakeups before checking, so a release in between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(token) = self.try_lock(resource, why) {
                return Ok(token);
            }
            if wait_for.is_zero() || tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(LockError::Busy {
                    resource: resource.to_string(),
                });
            }
        }
    }

    fn unlock(&self, token: &LockToken) {
        let mut holders = self.holders.lock().unwrap();
        let owned = holders
            .get(&token.resource)
            .is_some_and(|holder| holder.lock_id == token.lock_id);
        if owned {
            holders.remove(&token.resource);
            drop(holders);
            self.released.notify_waiters();
        }
    }
}
