//! Snapshot cache for deployments.
//!
//! The cache stores serialized snapshots so that repeated reads within the
//! TTL hand back exactly the bytes that were written. Writes are
//! best-effort: callers log failures and carry on.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::models::Deployment;

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Fresh snapshot within the TTL.
    Hit(Deployment),
    /// Present but older than the TTL. Callers treat it as a miss.
    Stale(Deployment),
    Miss,
}

#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn get(&self, deployment_id: &str) -> Result<CacheLookup>;

    async fn put(&self, deployment: &Deployment) -> Result<()>;

    async fn invalidate(&self, deployment_id: &str) -> Result<()>;
}

struct CacheEntry {
    payload: Vec<u8>,
    inserted_at: Instant,
}

/// In-process cache keyed by `deployment:<id>`.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn key(deployment_id: &str) -> String {
        format!("deployment:{}", deployment_id)
    }

    /// Drops expired entries.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotCache for MemoryCache {
    async fn get(&self, deployment_id: &str) -> Result<CacheLookup> {
        let (payload, expired) = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(&Self::key(deployment_id)) {
                Some(entry) => (entry.payload.clone(), entry.inserted_at.elapsed() > self.ttl),
                None => return Ok(CacheLookup::Miss),
            }
        };

        let deployment: Deployment = serde_json::from_slice(&payload)?;
        Ok(if expired {
            CacheLookup::Stale(deployment)
        } else {
            CacheLookup::Hit(deployment)
        })
    }

    async fn put(&self, deployment: &Deployment) -> Result<()> {
        let payload = serde_json::to_vec(deployment)?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            Self::key(&deployment.id),
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn invalidate(&self, deployment_id: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&Self::key(deployment_id));
        Ok(())
    }
}
