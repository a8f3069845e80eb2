//! Named locks guarding singleton operations like bulk resume.
//!
//! The trait is pluggable so multi-replica deployments can swap in a
//! shared implementation; the in-memory one suffices for a single
//! engine replica.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

/// Handle proving lock ownership; releases the lock when dropped.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A named lock with a time-to-live.
pub trait DistLock: Send + Sync {
    /// Try to take the named lock. Returns `None` when it is already
    /// held and its TTL has not yet expired.
    fn try_acquire(&self, name: &str, ttl: Duration) -> Option<LockGuard>;
}

/// Single-replica lock table.
#[derive(Default)]
pub struct MemoryDistLock {
    held: Arc<DashMap<String, (Uuid, Instant)>>,
}

impl MemoryDistLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistLock for MemoryDistLock {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Option<LockGuard> {
        let token = Uuid::new_v4();
        let now = Instant::now();

        {
            let mut entry = self.held.entry(name.to_string()).or_insert((token, now + ttl));
            let (owner, expires_at) = *entry;
            if owner != token {
                if expires_at > now {
                    return None;
                }
                // Expired lock: take it over.
                *entry = (token, now + ttl);
            }
        }

        let held = self.held.clone();
        let name = name.to_string();
        Some(LockGuard {
            release: Some(Box::new(move || {
                held.remove_if(&name, |_, (owner, _)| *owner == token);
            })),
        })
    }
}
